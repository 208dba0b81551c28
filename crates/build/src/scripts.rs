//! ConfigMap carrying the scripts build jobs execute.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use wproc_apply::{to_dynamic, update_typed, BuilderError, ResourceBuilder};
use wproc_core::WorkerProcess;

use crate::job::sanitize_dns_label;

pub const BUILD_SCRIPT_KEY: &str = "build.sh";
const BUILD_SCRIPT: &str = include_str!("../scripts/build.sh");

pub fn scripts_config_map_name(worker: &WorkerProcess) -> String {
    sanitize_dns_label(&worker.child_name("builder-scripts"))
}

fn scripts() -> BTreeMap<String, String> {
    BTreeMap::from([(BUILD_SCRIPT_KEY.to_string(), BUILD_SCRIPT.to_string())])
}

pub struct ScriptsConfigMapBuilder {
    name: String,
    namespace: String,
}

impl ScriptsConfigMapBuilder {
    pub fn new(worker: &WorkerProcess) -> Self {
        Self { name: scripts_config_map_name(worker), namespace: worker.ns() }
    }
}

impl ResourceBuilder for ScriptsConfigMapBuilder {
    fn build(&self) -> Result<DynamicObject, BuilderError> {
        to_dynamic(&ConfigMap {
            metadata: ObjectMeta { name: Some(self.name.clone()), namespace: Some(self.namespace.clone()), ..Default::default() },
            ..Default::default()
        })
    }

    fn update(&self, obj: &mut DynamicObject) -> Result<(), BuilderError> {
        update_typed::<ConfigMap, _>(obj, |cm| {
            cm.data = Some(scripts());
            Ok(())
        })
    }
}
