//! wproc apply: converge one owned object toward the shape a builder describes.
//!
//! Create when absent, otherwise mutate a copy of the live object and write it
//! back only when it differs (per-kind comparer first, structural equality
//! otherwise).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;
use wproc_core::{gvk_key, object_gvk, ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Renders one owned object.
pub trait ResourceBuilder: Send + Sync {
    /// Desired object, including apiVersion/kind, name and namespace.
    fn build(&self) -> Result<DynamicObject, BuilderError>;

    /// Merge desired fields into `obj` in place.
    fn update(&self, obj: &mut DynamicObject) -> Result<(), BuilderError>;

    fn comparer(&self) -> Option<Arc<dyn Comparer>> { None }

    fn readiness(&self) -> Option<&dyn ReadinessReporter> { None }
}

/// Semantic equality for one object kind (e.g. ignoring server-injected defaults).
pub trait Comparer: Send + Sync {
    fn equal(&self, live: &DynamicObject, candidate: &DynamicObject) -> bool;
}

#[async_trait]
pub trait ReadinessReporter: Send + Sync {
    async fn report_ready(&self, store: &dyn ObjectStore) -> Result<bool, StoreError>;
}

/// Comparers registered during one reconciliation, keyed by `gvk_key`.
#[derive(Default, Clone)]
pub struct ComparisonContext {
    by_kind: HashMap<String, Arc<dyn Comparer>>,
}

impl ComparisonContext {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, kind: &str, comparer: Arc<dyn Comparer>) {
        self.by_kind.insert(kind.to_string(), comparer);
    }

    pub fn has(&self, kind: &str) -> bool { self.by_kind.contains_key(kind) }

    pub fn equal(&self, kind: &str, live: &DynamicObject, candidate: &DynamicObject) -> bool {
        match self.by_kind.get(kind) {
            Some(c) => c.equal(live, candidate),
            None => structurally_equal(live, candidate),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

impl OperationOutcome {
    /// Imperative verb of the write, if any.
    pub fn verb(&self) -> Option<&'static str> {
        match self {
            OperationOutcome::Created => Some("create"),
            OperationOutcome::Updated => Some("update"),
            OperationOutcome::Deleted => Some("delete"),
            OperationOutcome::Unchanged => None,
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb().unwrap_or("unchanged"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("building desired object: {0}")]
    Build(#[source] BuilderError),
    #[error("desired object is invalid: {0}")]
    Invalid(#[source] StoreError),
    #[error("mutating {kind} {name}: {source}")]
    Mutate { kind: String, name: String, #[source] source: BuilderError },
    #[error("fetching {kind} {name}: {source}")]
    Fetch { kind: String, name: String, #[source] source: StoreError },
    #[error("failed to {op} {kind} {name}: {source}")]
    Persist { op: OperationOutcome, kind: String, name: String, #[source] source: StoreError },
}

impl ApplyError {
    /// Attempted write with its target, when the failure happened at persist time.
    pub fn attempted(&self) -> Option<(OperationOutcome, &str, &str)> {
        match self {
            ApplyError::Persist { op, kind, name, .. } => Some((*op, kind.as_str(), name.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Applied {
    pub outcome: OperationOutcome,
    pub kind: String,
    pub name: String,
    pub object: DynamicObject,
}

/// Converge the object described by `builder`.
///
/// The builder's comparer, if any, is registered in `cmp` before comparing so
/// later objects of the same kind in this invocation use it as well.
pub async fn apply(
    store: &dyn ObjectStore,
    owner: &OwnerReference,
    builder: &dyn ResourceBuilder,
    cmp: &mut ComparisonContext,
) -> Result<Applied, ApplyError> {
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);
    let mut desired = builder.build().map_err(ApplyError::Build)?;
    let gvk = object_gvk(&desired).map_err(ApplyError::Invalid)?;
    let kind_key = gvk_key(&gvk);
    let kind = gvk.kind.clone();
    let ar = ApiResource::from_gvk(&gvk);
    let name = desired.name_any();
    let ns = desired.namespace().unwrap_or_default();

    if let Some(c) = builder.comparer() {
        cmp.register(&kind_key, c);
    }

    let live = store
        .get(&ar, &ns, &name)
        .await
        .map_err(|source| ApplyError::Fetch { kind: kind.clone(), name: name.clone(), source })?;

    let applied = match live {
        None => {
            builder
                .update(&mut desired)
                .map_err(|source| ApplyError::Mutate { kind: kind.clone(), name: name.clone(), source })?;
            ensure_owner(&mut desired, owner);
            let created = store.create(&ar, &desired).await.map_err(|source| {
                counter!("apply_err", 1u64);
                ApplyError::Persist { op: OperationOutcome::Created, kind: kind.clone(), name: name.clone(), source }
            })?;
            counter!("apply_created", 1u64);
            Applied { outcome: OperationOutcome::Created, kind, name, object: created }
        }
        Some(live) => {
            let mut candidate = live.clone();
            builder
                .update(&mut candidate)
                .map_err(|source| ApplyError::Mutate { kind: kind.clone(), name: name.clone(), source })?;
            ensure_owner(&mut candidate, owner);
            if cmp.equal(&kind_key, &live, &candidate) {
                counter!("apply_unchanged", 1u64);
                Applied { outcome: OperationOutcome::Unchanged, kind, name, object: live }
            } else {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let s = diff_summary(&normalize(&candidate), &normalize(&live));
                    debug!(kind = %kind, name = %name, adds = s.adds, updates = s.updates, removes = s.removes, "object drifted");
                }
                let updated = store.update(&ar, &candidate).await.map_err(|source| {
                    counter!("apply_err", 1u64);
                    ApplyError::Persist { op: OperationOutcome::Updated, kind: kind.clone(), name: name.clone(), source }
                })?;
                counter!("apply_updated", 1u64);
                Applied { outcome: OperationOutcome::Updated, kind, name, object: updated }
            }
        }
    };
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(applied)
}

/// Add `owner` as controller reference unless an entry with its uid exists.
pub fn ensure_owner(obj: &mut DynamicObject, owner: &OwnerReference) -> bool {
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r.uid == owner.uid) {
        return false;
    }
    refs.push(owner.clone());
    true
}

/// JSON equality ignoring server-managed metadata, status, and null fields.
pub fn structurally_equal(a: &DynamicObject, b: &DynamicObject) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(obj: &DynamicObject) -> Json {
    let v = serde_json::to_value(obj).unwrap_or(Json::Null);
    prune_nulls(strip_noisy(v))
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn prune_nulls(v: Json) -> Json {
    match v {
        Json::Object(map) => Json::Object(map.into_iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k, prune_nulls(v))).collect()),
        Json::Array(arr) => Json::Array(arr.into_iter().map(prune_nulls).collect()),
        other => other,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                for (x, y) in aa.iter().zip(bb.iter()) { if x != y { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// Serialize a typed k8s object into its dynamic form.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, BuilderError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, BuilderError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Run a typed mutation against a dynamic object.
pub fn update_typed<K, F>(obj: &mut DynamicObject, f: F) -> Result<(), BuilderError>
where
    K: Serialize + DeserializeOwned,
    F: FnOnce(&mut K) -> Result<(), BuilderError>,
{
    let mut typed: K = from_dynamic(obj)?;
    f(&mut typed)?;
    *obj = to_dynamic(&typed)?;
    Ok(())
}
