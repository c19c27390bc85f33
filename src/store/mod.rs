//! Object store adapters.
//!
//! [`ObjectStore`] is the only shared mutable resource of the lifecycle
//! engine. Implementations normalize their failures into [`StoreError`] so
//! that callers can treat `NotFound` as success on idempotent paths and
//! `Conflict` as "re-fetch and retry".

pub mod kubernetes;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::merge;
use crate::object::{CrossVersionObjectReference, Kind, ManagedObject, ObjectKey};

/// Label selecting secrets that must survive a control plane migration.
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_MANAGED_BY_VALUE: &str = "secrets-manager";
pub const LABEL_PERSIST: &str = "persist";
pub const LABEL_PERSIST_VALUE: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    /// Plain merge patch; concurrent writes to untouched fields survive.
    Merge,
    /// Merge patch with a resource version precondition. Fails with
    /// [`StoreError::Conflict`] when the object changed since it was read.
    OptimisticLock,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Apply(ManagedObject),
    Delete(ManagedObject),
}

/// A secret labelled for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSecret {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, StoreError>;

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<ManagedObject>, StoreError>;

    /// Creates the object. The status of `obj` is ignored.
    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError>;

    /// Patches metadata and spec of the object from `old` to `new`.
    async fn patch(
        &self,
        old: &ManagedObject,
        new: &ManagedObject,
        mode: PatchMode,
    ) -> Result<ManagedObject, StoreError>;

    /// Patches the status subresource from `old` to `new`.
    async fn patch_status(
        &self,
        old: &ManagedObject,
        new: &ManagedObject,
    ) -> Result<ManagedObject, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Streams changes to objects of `kind` in `namespace`, starting with an
    /// `Apply` for every object that exists when the watch starts.
    fn watch(&self, kind: Kind, namespace: &str)
    -> BoxStream<'static, Result<WatchEvent, StoreError>>;

    /// Reads the auxiliary object a status resource reference points to.
    async fn get_by_ref(
        &self,
        namespace: &str,
        reference: &CrossVersionObjectReference,
    ) -> Result<Value, StoreError>;

    /// Creates or updates the auxiliary object a reference points to.
    async fn apply_by_ref(
        &self,
        namespace: &str,
        reference: &CrossVersionObjectReference,
        data: &Value,
    ) -> Result<(), StoreError>;

    async fn list_persisted_secrets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PersistedSecret>, StoreError>;
}

fn metadata_and_spec(obj: &ManagedObject) -> Result<Value, StoreError> {
    Ok(json!({
        "metadata": {
            "annotations": obj.metadata.annotations,
            "labels": obj.metadata.labels,
            "finalizers": obj.metadata.finalizers,
        },
        "spec": serde_json::to_value(&obj.spec)?,
    }))
}

/// Builds the merge patch for a metadata/spec change, adding the resource
/// version precondition for optimistic locking.
pub(crate) fn object_patch(
    old: &ManagedObject,
    new: &ManagedObject,
    mode: PatchMode,
) -> Result<Value, StoreError> {
    let mut patch = merge::diff(&metadata_and_spec(old)?, &metadata_and_spec(new)?);
    if mode == PatchMode::OptimisticLock {
        let resource_version = old.metadata.resource_version.clone().ok_or_else(|| {
            StoreError::Invalid(
                old.key().to_string(),
                "optimistic lock requires a resource version".to_string(),
            )
        })?;
        json_patch::merge(
            &mut patch,
            &json!({"metadata": {"resourceVersion": resource_version}}),
        );
    }
    Ok(patch)
}

pub(crate) fn status_patch(old: &ManagedObject, new: &ManagedObject) -> Result<Value, StoreError> {
    Ok(merge::diff(
        &json!({"status": serde_json::to_value(&old.status)?}),
        &json!({"status": serde_json::to_value(&new.status)?}),
    ))
}
