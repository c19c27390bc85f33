//! An in-process [`ObjectStore`] with the semantics of the API server that
//! matter to the lifecycle engine: resource versions, generations bumped on
//! spec changes, a separate status channel, finalizer-aware deletion and
//! change notifications.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{ObjectStore, PatchMode, PersistedSecret, WatchEvent, object_patch, status_patch};
use crate::error::StoreError;
use crate::object::{CrossVersionObjectReference, Kind, ManagedObject, ObjectKey};

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    referenced: BTreeMap<(String, CrossVersionObjectReference), Value>,
    secrets: BTreeMap<(String, String), PersistedSecret>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
    injected_conflicts: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            injected_conflicts: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an object as-is, status included, the way an owning agent
    /// would. Creates the object when absent.
    pub fn upsert(&self, obj: ManagedObject) -> ManagedObject {
        let stored = {
            let mut inner = self.write();
            let mut obj = obj;
            let key = obj.key();
            obj.metadata.generation = match inner.objects.get(&key) {
                Some(existing) if existing.spec != obj.spec => existing.metadata.generation + 1,
                Some(existing) => existing.metadata.generation,
                None => obj.metadata.generation.max(1),
            };
            obj.metadata.resource_version = Some(inner.next_revision());
            inner.objects.insert(key, obj.clone());
            obj
        };
        self.notify(WatchEvent::Apply(stored.clone()));
        stored
    }

    pub fn put_secret(&self, namespace: &str, secret: PersistedSecret) {
        self.write()
            .secrets
            .insert((namespace.to_string(), secret.name.clone()), secret);
    }

    /// Makes the next `count` optimistic-lock patches fail with a conflict,
    /// as if another writer had modified the object in between.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.read().objects.contains_key(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: WatchEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Applies a merge patch to the stored object and returns the new
    /// revision, or `None` when the patch released the last finalizer of a
    /// deleting object.
    fn apply_patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        bump_generation: bool,
    ) -> Result<Option<ManagedObject>, StoreError> {
        let event;
        let result = {
            let mut inner = self.write();
            let current = inner
                .objects
                .get(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            if let Some(expected) = patch
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                && current.metadata.resource_version.as_deref() != Some(expected)
            {
                return Err(StoreError::Conflict(
                    key.to_string(),
                    format!(
                        "the object has been modified (resource version {} != {expected})",
                        current.metadata.resource_version.as_deref().unwrap_or("")
                    ),
                ));
            }

            let mut value = serde_json::to_value(current)?;
            json_patch::merge(&mut value, patch);
            let mut updated: ManagedObject = serde_json::from_value(value)?;
            // Identity and server-owned fields cannot be patched.
            updated.kind = current.kind;
            updated.metadata.name = current.metadata.name.clone();
            updated.metadata.namespace = current.metadata.namespace.clone();
            updated.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
            updated.metadata.generation = current.metadata.generation;
            if bump_generation && updated.spec != current.spec {
                updated.metadata.generation += 1;
            }

            if updated.is_deleting() && updated.metadata.finalizers.is_empty() {
                inner.objects.remove(key);
                event = WatchEvent::Delete(updated);
                None
            } else {
                updated.metadata.resource_version = Some(inner.next_revision());
                inner.objects.insert(key.clone(), updated.clone());
                event = WatchEvent::Apply(updated.clone());
                Some(updated)
            }
        };
        self.notify(event);
        Ok(result)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, StoreError> {
        self.read()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<ManagedObject>, StoreError> {
        Ok(self
            .read()
            .objects
            .values()
            .filter(|o| o.kind == kind && o.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = obj.key();
        let created = {
            let mut inner = self.write();
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            let mut created = obj.clone();
            created.status = Default::default();
            created.metadata.generation = 1;
            created.metadata.deletion_timestamp = None;
            created.metadata.resource_version = Some(inner.next_revision());
            inner.objects.insert(key, created.clone());
            created
        };
        debug!(object = %created.key(), "created object");
        self.notify(WatchEvent::Apply(created.clone()));
        Ok(created)
    }

    async fn patch(
        &self,
        old: &ManagedObject,
        new: &ManagedObject,
        mode: PatchMode,
    ) -> Result<ManagedObject, StoreError> {
        let key = old.key();
        if mode == PatchMode::OptimisticLock && self.take_injected_conflict() {
            warn!(object = %key, "injected conflict");
            return Err(StoreError::Conflict(
                key.to_string(),
                "the object has been modified".to_string(),
            ));
        }
        let patch = object_patch(old, new, mode)?;
        match self.apply_patch(&key, &patch, true)? {
            Some(updated) => Ok(updated),
            // The object is gone once the patch took effect.
            None => Ok(new.clone()),
        }
    }

    async fn patch_status(
        &self,
        old: &ManagedObject,
        new: &ManagedObject,
    ) -> Result<ManagedObject, StoreError> {
        let patch = status_patch(old, new)?;
        let key = old.key();
        self.apply_patch(&key, &patch, false)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let event = {
            let mut inner = self.write();
            let Some(current) = inner.objects.get(key).cloned() else {
                return Err(StoreError::NotFound(key.to_string()));
            };
            if current.metadata.finalizers.is_empty() {
                inner.objects.remove(key);
                WatchEvent::Delete(current)
            } else if current.is_deleting() {
                return Ok(());
            } else {
                let mut deleting = current;
                deleting.metadata.deletion_timestamp = Some(Utc::now());
                deleting.metadata.resource_version = Some(inner.next_revision());
                inner.objects.insert(key.clone(), deleting.clone());
                WatchEvent::Apply(deleting)
            }
        };
        debug!(object = %key, "deleted object");
        self.notify(event);
        Ok(())
    }

    fn watch(
        &self,
        kind: Kind,
        namespace: &str,
    ) -> BoxStream<'static, Result<WatchEvent, StoreError>> {
        let namespace = namespace.to_string();
        // Subscribe before listing so nothing between the two is missed.
        let mut rx = self.events.subscribe();
        let initial: Vec<ManagedObject> = self
            .read()
            .objects
            .values()
            .filter(|o| o.kind == kind && o.metadata.namespace == namespace)
            .cloned()
            .collect();

        Box::pin(async_stream::stream! {
            for obj in initial {
                yield Ok(WatchEvent::Apply(obj));
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let obj = match &event {
                            WatchEvent::Apply(o) | WatchEvent::Delete(o) => o,
                        };
                        if obj.kind == kind && obj.metadata.namespace == namespace {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%kind, %namespace, skipped = n, "watch lagged behind store events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn get_by_ref(
        &self,
        namespace: &str,
        reference: &CrossVersionObjectReference,
    ) -> Result<Value, StoreError> {
        self.read()
            .referenced
            .get(&(namespace.to_string(), reference.clone()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("{} {namespace}/{}", reference.kind, reference.name))
            })
    }

    async fn apply_by_ref(
        &self,
        namespace: &str,
        reference: &CrossVersionObjectReference,
        data: &Value,
    ) -> Result<(), StoreError> {
        self.write()
            .referenced
            .insert((namespace.to_string(), reference.clone()), data.clone());
        Ok(())
    }

    async fn list_persisted_secrets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PersistedSecret>, StoreError> {
        Ok(self
            .read()
            .secrets
            .iter()
            .filter(|((ns, _), secret)| {
                ns == namespace
                    && secret.labels.get(super::LABEL_MANAGED_BY).map(String::as_str)
                        == Some(super::LABEL_MANAGED_BY_VALUE)
                    && secret.labels.get(super::LABEL_PERSIST).map(String::as_str)
                        == Some(super::LABEL_PERSIST_VALUE)
            })
            .map(|(_, secret)| secret.clone())
            .collect())
    }
}
