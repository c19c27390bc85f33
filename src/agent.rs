//! A relay agent that fulfils `BackupUpload` and `BackupDownload` requests
//! against a directory on the local filesystem.

use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backup::{SPEC_ENTRY_NAME, SPEC_FILE_PATH};
use crate::clock::Clock;
use crate::error::Error;
use crate::object::{
    ANNOTATION_OPERATION, Kind, LastError, LastOperation, LastOperationState, ManagedObject,
};
use crate::store::{ObjectStore, PatchMode, WatchEvent};

/// Relay object type this agent fulfils.
pub const PROVIDER: &str = "local";

pub struct LocalRelayAgent {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    bucket_dir: PathBuf,
}

impl LocalRelayAgent {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
        bucket_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            clock,
            namespace: namespace.into(),
            bucket_dir: bucket_dir.into(),
        }
    }

    /// Handles relay requests until the watch ends.
    pub async fn run(self) {
        info!(namespace = %self.namespace, bucket = %self.bucket_dir.display(), "relay agent started");
        let mut events = futures::stream::select(
            self.store.watch(Kind::BackupUpload, &self.namespace),
            self.store.watch(Kind::BackupDownload, &self.namespace),
        );

        while let Some(event) = events.next().await {
            match event {
                Ok(WatchEvent::Apply(obj)) => {
                    if let Err(err) = self.handle(&obj).await {
                        error!(object = %obj.key(), %err, "failed to handle relay request");
                    }
                }
                Ok(WatchEvent::Delete(obj)) => debug!(object = %obj.key(), "relay object deleted"),
                Err(err) => warn!(%err, "error from relay watch"),
            }
        }
        info!("relay agent finished");
    }

    /// Processes one relay object if it carries a pending operation.
    /// Events are replayed copies, so the decision is made on a fresh read.
    pub async fn handle(&self, observed: &ManagedObject) -> Result<(), Error> {
        let key = observed.key();
        let current = match self.store.get(&key).await {
            Ok(obj) => obj,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(Error::store("get", &key, err)),
        };
        if current.spec.type_ != PROVIDER {
            debug!(
                object = %key,
                type_ = %current.spec.type_,
                "relay object of another provider, skipping"
            );
            return Ok(());
        }
        if current.operation().is_none() || current.is_deleting() {
            return Ok(());
        }

        let type_ = current.compute_operation_type();
        let mut processing = current.clone();
        processing.status.last_operation = Some(LastOperation::new(
            type_,
            LastOperationState::Processing,
            format!("{} is being processed", current.kind),
            self.clock.now(),
        ));
        let current = self
            .store
            .patch_status(&current, &processing)
            .await
            .map_err(|e| Error::store("patch status of", &key, e))?;

        let outcome = self.transfer(&current).await;

        let mut released = current.clone();
        released.metadata.annotations.remove(ANNOTATION_OPERATION);
        let released = self
            .store
            .patch(&current, &released, PatchMode::Merge)
            .await
            .map_err(|e| Error::store("patch", &key, e))?;

        let now = self.clock.now();
        let mut done = released.clone();
        done.status.observed_generation = released.metadata.generation;
        match outcome {
            Ok(data) => {
                info!(object = %key, "relay request succeeded");
                done.status.last_error = None;
                done.status.data = data;
                done.status.last_operation = Some(LastOperation::new(
                    type_,
                    LastOperationState::Succeeded,
                    format!("{} succeeded", current.kind),
                    now,
                ));
            }
            Err(err) => {
                warn!(object = %key, %err, "relay request failed");
                let description = err.to_string();
                done.status.last_operation = Some(LastOperation::new(
                    type_,
                    LastOperationState::Error,
                    description.clone(),
                    now,
                ));
                done.status.last_error = Some(LastError {
                    description,
                    codes: Vec::new(),
                    last_update_time: Some(now),
                });
            }
        }
        self.store
            .patch_status(&released, &done)
            .await
            .map_err(|e| Error::store("patch status of", &key, e))?;
        Ok(())
    }

    /// Moves the payload; returns the bytes to publish in the status.
    async fn transfer(&self, obj: &ManagedObject) -> Result<Option<Vec<u8>>, Error> {
        let path = self.bucket_path(obj)?;
        match obj.kind {
            Kind::BackupUpload => {
                let data = obj.spec.data.as_deref().ok_or_else(|| {
                    Error::Snapshot(format!("{} carries no data to upload", obj.key()))
                })?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, data).await?;
                debug!(path = %path.display(), bytes = data.len(), "wrote bucket file");
                Ok(None)
            }
            Kind::BackupDownload => {
                let data = tokio::fs::read(&path).await?;
                debug!(path = %path.display(), bytes = data.len(), "read bucket file");
                Ok(Some(data))
            }
            other => Err(Error::Snapshot(format!("{other} is not a relay kind"))),
        }
    }

    fn bucket_path(&self, obj: &ManagedObject) -> Result<PathBuf, Error> {
        let field = |name: &str| {
            obj.spec
                .extra
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Snapshot(format!("{} has no {name}", obj.key())))
        };
        let entry = relative_path(field(SPEC_ENTRY_NAME)?)?;
        let file = relative_path(field(SPEC_FILE_PATH)?)?;
        Ok(self.bucket_dir.join(entry).join(file))
    }
}

/// Accepts only paths that stay below the directory they are joined to.
fn relative_path(raw: &str) -> Result<&Path, Error> {
    let path = Path::new(raw);
    if path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Ok(path)
    } else {
        Err(Error::Snapshot(format!("path {raw:?} escapes the bucket")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::object::{ANNOTATION_TIMESTAMP, LastOperationType, ObjectKey};
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    const NS: &str = "shoot--dev--a";

    fn request(kind: Kind, entry: &str, data: Option<&[u8]>) -> ManagedObject {
        let mut obj = ManagedObject::new(&ObjectKey::new(kind, NS, "shootstate"));
        obj.set_annotation(ANNOTATION_OPERATION, "reconcile");
        obj.set_annotation(ANNOTATION_TIMESTAMP, "2024-03-01T12:00:00.000000000Z");
        obj.spec.type_ = PROVIDER.into();
        obj.spec.data = data.map(<[u8]>::to_vec);
        obj.spec.extra.insert(SPEC_ENTRY_NAME.into(), json!(entry));
        obj.spec.extra.insert(SPEC_FILE_PATH.into(), json!("shootstate"));
        obj
    }

    fn agent(store: Arc<MemoryStore>, dir: &Path) -> LocalRelayAgent {
        LocalRelayAgent::new(store, Arc::new(RealClock), NS, dir)
    }

    #[tokio::test]
    async fn test_upload_writes_bucket_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let obj = store.upsert(request(Kind::BackupUpload, "entry", Some(b"cipher")));

        agent(store.clone(), dir.path()).handle(&obj).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("entry/shootstate")).unwrap(),
            b"cipher"
        );
        let done = store.get(&obj.key()).await.unwrap();
        assert_eq!(done.operation(), None);
        assert_eq!(done.status.observed_generation, done.metadata.generation);
        let op = done.status.last_operation.unwrap();
        assert_eq!(op.type_, LastOperationType::Create);
        assert_eq!(op.state, LastOperationState::Succeeded);
    }

    #[tokio::test]
    async fn test_download_publishes_bucket_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("entry")).unwrap();
        std::fs::write(dir.path().join("entry/shootstate"), b"cipher").unwrap();
        let store = Arc::new(MemoryStore::new());
        let obj = store.upsert(request(Kind::BackupDownload, "entry", None));

        agent(store.clone(), dir.path()).handle(&obj).await.unwrap();

        let done = store.get(&obj.key()).await.unwrap();
        assert_eq!(done.status.data.as_deref(), Some(&b"cipher"[..]));
        assert!(done.status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_reported_as_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let obj = store.upsert(request(Kind::BackupDownload, "entry", None));

        agent(store.clone(), dir.path()).handle(&obj).await.unwrap();

        let done = store.get(&obj.key()).await.unwrap();
        assert_eq!(done.operation(), None);
        assert_eq!(
            done.status.last_operation.map(|op| op.state),
            Some(LastOperationState::Error)
        );
        assert!(done.status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_escaping_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let obj = store.upsert(request(Kind::BackupUpload, "../outside", Some(b"x")));

        agent(store.clone(), dir.path()).handle(&obj).await.unwrap();

        let done = store.get(&obj.key()).await.unwrap();
        let last_error = done.status.last_error.unwrap();
        assert!(last_error.description.contains("escapes the bucket"));
    }

    #[tokio::test]
    async fn test_requests_without_operation_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut obj = request(Kind::BackupUpload, "entry", Some(b"cipher"));
        obj.metadata.annotations.remove(ANNOTATION_OPERATION);
        let obj = store.upsert(obj);

        agent(store.clone(), dir.path()).handle(&obj).await.unwrap();

        assert!(store.get(&obj.key()).await.unwrap().status.last_operation.is_none());
        assert!(!dir.path().join("entry").exists());
    }

    #[tokio::test]
    async fn test_requests_of_other_providers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut obj = request(Kind::BackupUpload, "entry", Some(b"cipher"));
        obj.spec.type_ = "aws".into();
        let obj = store.upsert(obj);

        agent(store.clone(), dir.path()).handle(&obj).await.unwrap();

        let untouched = store.get(&obj.key()).await.unwrap();
        assert_eq!(untouched.operation(), Some(crate::object::Operation::Reconcile));
        assert!(untouched.status.last_operation.is_none());
        assert!(!dir.path().join("entry").exists());
    }
}
