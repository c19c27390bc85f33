//! Transfers the shoot state in and out of the backup bucket through
//! one-shot relay objects.
//!
//! A relay object is consumed by an agent that reads its spec, does the
//! transfer and reports completion in its status. Every transfer therefore
//! starts from a fresh object: destroy whatever is left over, deploy and
//! wait, then destroy again.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::component::{Extension, Values, deploy_and_wait, destroy_and_wait};
use crate::crypto::{self, StateKey};
use crate::error::Error;
use crate::extensions::WaitOptions;
use crate::object::Kind;
use crate::shootstate::{self, ShootStateSnapshot};
use crate::store::ObjectStore;

/// Name of the relay object and of the file it transfers.
pub const SHOOT_STATE_NAME: &str = "shootstate";

pub const SPEC_ENTRY_NAME: &str = "entryName";
pub const SPEC_FILE_PATH: &str = "filePath";

#[derive(Debug, Clone, PartialEq)]
pub struct RelayValues {
    pub name: String,
    /// Backup provider fulfilling the transfer.
    pub type_: String,
    /// Backup entry, i.e. the directory in the bucket.
    pub entry_name: String,
    pub file_path: String,
}

impl RelayValues {
    fn into_values(self, data: Option<Vec<u8>>) -> Values {
        Values {
            name: self.name,
            type_: self.type_,
            data,
            fields: Map::from_iter([
                (SPEC_ENTRY_NAME.to_string(), json!(self.entry_name)),
                (SPEC_FILE_PATH.to_string(), Value::String(self.file_path)),
            ]),
            ..Default::default()
        }
    }
}

/// Addresses the relay objects of one namespace and carries what is needed
/// to drive them.
#[derive(Clone)]
pub struct RelayChannel {
    pub namespace: String,
    pub values: RelayValues,
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub options: WaitOptions,
}

impl RelayChannel {
    /// A relay that writes `data` to the bucket.
    pub fn upload(&self, data: Vec<u8>) -> Extension {
        self.component(Kind::BackupUpload, Some(data))
    }

    /// A relay that reads a file from the bucket into its status.
    pub fn download(&self) -> Extension {
        self.component(Kind::BackupDownload, None)
    }

    fn component(&self, kind: Kind, data: Option<Vec<u8>>) -> Extension {
        Extension::new(
            kind,
            &self.namespace,
            self.values.clone().into_values(data),
            self.store.clone(),
            self.clock.clone(),
            self.options,
        )
    }
}

/// Serializes and encrypts `snapshot`, then pushes it through a fresh
/// upload relay. Any failing step aborts the upload; a retry starts over
/// from a clean slate.
pub async fn upload_snapshot(
    channel: &RelayChannel,
    key: &StateKey,
    snapshot: &ShootStateSnapshot,
) -> Result<(), Error> {
    let data = crypto::encrypt(key, &snapshot.to_json()?)?;
    let relay = channel.upload(data);
    destroy_and_wait(&relay).await?;
    deploy_and_wait(&relay).await?;
    destroy_and_wait(&relay).await?;
    info!(object = %relay.key(), "uploaded shoot state");
    Ok(())
}

/// Pulls the stored payload through a fresh download relay. The bytes are
/// returned as stored, i.e. still encrypted.
pub async fn download_snapshot(channel: &RelayChannel) -> Result<Vec<u8>, Error> {
    let relay = channel.download();
    destroy_and_wait(&relay).await?;
    deploy_and_wait(&relay).await?;
    let data = relay
        .ready_object()
        .and_then(|obj| obj.status.data)
        .ok_or_else(|| Error::Snapshot(format!("{} reported no data", relay.key())))?;
    destroy_and_wait(&relay).await?;
    info!(object = %relay.key(), bytes = data.len(), "downloaded shoot state");
    Ok(data)
}

/// Backs up and recovers the shoot state of one namespace.
pub struct ShootStateBackup {
    channel: RelayChannel,
    key: StateKey,
}

impl ShootStateBackup {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
        provider: impl Into<String>,
        entry_name: impl Into<String>,
        key: StateKey,
        options: WaitOptions,
    ) -> Self {
        let channel = RelayChannel {
            namespace: namespace.into(),
            values: RelayValues {
                name: SHOOT_STATE_NAME.to_string(),
                type_: provider.into(),
                entry_name: entry_name.into(),
                file_path: SHOOT_STATE_NAME.to_string(),
            },
            store,
            clock,
            options,
        };
        Self { channel, key }
    }

    pub fn channel(&self) -> &RelayChannel {
        &self.channel
    }

    /// Captures the current shoot state and uploads it.
    pub async fn backup(&self) -> Result<ShootStateSnapshot, Error> {
        let snapshot =
            shootstate::compute_snapshot(self.channel.store.as_ref(), &self.channel.namespace)
                .await?;
        upload_snapshot(&self.channel, &self.key, &snapshot).await?;
        Ok(snapshot)
    }

    /// Downloads, decrypts and decodes the last uploaded shoot state.
    pub async fn fetch(&self) -> Result<ShootStateSnapshot, Error> {
        let data = download_snapshot(&self.channel).await?;
        ShootStateSnapshot::from_json(&crypto::decrypt(&self.key, &data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::object::{
        ANNOTATION_OPERATION, LastOperation, LastOperationState, LastOperationType, ObjectKey,
    };
    use crate::store::memory::MemoryStore;
    use crate::store::{PatchMode, WatchEvent};
    use chrono::Utc;
    use futures::StreamExt;
    use std::time::Duration;

    const NS: &str = "shoot--dev--a";

    fn options() -> WaitOptions {
        WaitOptions {
            interval: Duration::from_millis(10),
            severe_threshold: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
        }
    }

    fn values() -> RelayValues {
        RelayValues {
            name: SHOOT_STATE_NAME.into(),
            type_: "local".into(),
            entry_name: "entry".into(),
            file_path: SHOOT_STATE_NAME.into(),
        }
    }

    /// Completes every relay request immediately, echoing uploaded data
    /// back on download.
    fn spawn_echo_agent(store: Arc<MemoryStore>) -> tokio::task::JoinHandle<()> {
        // Subscribe before returning so no request is missed.
        let mut events = futures::stream::select(
            store.watch(Kind::BackupUpload, NS),
            store.watch(Kind::BackupDownload, NS),
        );
        tokio::spawn(async move {
            let mut bucket: Option<Vec<u8>> = None;
            while let Some(event) = events.next().await {
                let Ok(WatchEvent::Apply(obj)) = event else {
                    continue;
                };
                if obj.operation().is_none() || obj.is_deleting() {
                    continue;
                }
                let mut done = obj.clone();
                done.metadata.annotations.remove(ANNOTATION_OPERATION);
                if store.patch(&obj, &done, PatchMode::Merge).await.is_err() {
                    continue;
                }
                let Ok(current) = store.get(&obj.key()).await else {
                    continue;
                };
                let mut status = current.clone();
                if obj.kind == Kind::BackupUpload {
                    bucket = obj.spec.data.clone();
                } else {
                    status.status.data = bucket.clone();
                }
                status.status.observed_generation = current.metadata.generation;
                status.status.last_operation = Some(LastOperation::new(
                    LastOperationType::Reconcile,
                    LastOperationState::Succeeded,
                    "",
                    Utc::now(),
                ));
                let _ = store.patch_status(&current, &status).await;
            }
        })
    }

    fn channel(store: Arc<MemoryStore>) -> RelayChannel {
        RelayChannel {
            namespace: NS.into(),
            values: values(),
            store,
            clock: Arc::new(RealClock),
            options: options(),
        }
    }

    #[test]
    fn test_relay_spec_fields() {
        let relay = channel(Arc::new(MemoryStore::new())).upload(b"cipher".to_vec());
        assert_eq!(relay.key(), ObjectKey::new(Kind::BackupUpload, NS, "shootstate"));
    }

    #[tokio::test]
    async fn test_upload_then_fetch_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let agent = spawn_echo_agent(store.clone());
        let key = StateKey::new(&[3u8; 32]).unwrap();
        let backup = ShootStateBackup::new(
            store.clone(),
            Arc::new(RealClock),
            NS,
            "local",
            "entry",
            key.clone(),
            options(),
        );

        let mut snapshot = ShootStateSnapshot::default();
        snapshot.extensions.upsert(crate::shootstate::ExtensionResourceState {
            kind: Kind::Infrastructure,
            name: "infra".into(),
            purpose: None,
            state: Some(json!({"vpc": "vpc-1234"})),
            resources: vec![],
        });

        upload_snapshot(backup.channel(), &key, &snapshot).await.unwrap();
        assert!(!store.contains(&ObjectKey::new(Kind::BackupUpload, NS, "shootstate")));

        // Downloads hand back the ciphertext.
        let raw = download_snapshot(backup.channel()).await.unwrap();
        assert_ne!(raw, snapshot.to_json().unwrap());

        assert_eq!(backup.fetch().await.unwrap(), snapshot);
        assert!(!store.contains(&ObjectKey::new(Kind::BackupDownload, NS, "shootstate")));

        agent.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_fails_without_agent() {
        let store = Arc::new(MemoryStore::new());
        let key = StateKey::new(&[3u8; 32]).unwrap();
        let err = upload_snapshot(&channel(store.clone()), &key, &ShootStateSnapshot::default())
            .await
            .unwrap_err();
        assert!(
            err.to_string().starts_with("Error while waiting for BackupUpload"),
            "{err}"
        );
        // The relay object is left behind; the next attempt destroys it first.
        assert!(store.contains(&ObjectKey::new(Kind::BackupUpload, NS, "shootstate")));
    }
}
