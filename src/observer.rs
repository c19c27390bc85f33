use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::health;
use crate::object::{Kind, LastError, LastOperation, ManagedObject, Operation};
use crate::store::{ObjectStore, WatchEvent};

/// Operator-facing view of one extension object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub kind: Kind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub ready: bool,
    pub deleting: bool,
}

impl ObjectSummary {
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl From<&ManagedObject> for ObjectSummary {
    fn from(obj: &ManagedObject) -> Self {
        Self {
            kind: obj.kind,
            name: obj.metadata.name.clone(),
            operation: obj.operation(),
            last_operation: obj.status.last_operation.clone(),
            last_error: obj.status.last_error.clone(),
            ready: health::check_extension_object(obj).is_ok(),
            deleting: obj.is_deleting(),
        }
    }
}

#[derive(Clone)]
pub struct State {
    pub objects: Arc<RwLock<BTreeMap<String, ObjectSummary>>>,
    pub updates: broadcast::Sender<Vec<ObjectSummary>>,
    ready: Arc<AtomicBool>,
}

impl Default for State {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(100);
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            updates,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl State {
    /// Whether the initial listing of every kind has been observed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Summaries sorted by key.
    pub async fn snapshot(&self) -> Vec<ObjectSummary> {
        self.objects.read().await.values().cloned().collect()
    }

    pub async fn apply_event(&self, event: WatchEvent) {
        let current = {
            let mut objects = self.objects.write().await;
            match event {
                WatchEvent::Apply(obj) => {
                    let summary = ObjectSummary::from(&obj);
                    objects.insert(summary.key(), summary);
                }
                WatchEvent::Delete(obj) => {
                    objects.remove(&ObjectSummary::from(&obj).key());
                }
            }
            objects.values().cloned().collect::<Vec<_>>()
        };
        // No subscribers is fine.
        let _ = self.updates.send(current);
    }
}

/// Delay before a failed initial listing is attempted again.
pub const LIST_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Watches every kind in `namespace` until all watches end. The state is
/// marked ready only once every kind has been listed.
pub async fn run(state: State, store: Arc<dyn ObjectStore>, namespace: String) {
    let mut handles = Vec::new();
    for kind in Kind::ALL {
        let stream = store.watch(kind, &namespace);
        for obj in initial_listing(store.as_ref(), kind, &namespace).await {
            state.apply_event(WatchEvent::Apply(obj)).await;
        }
        handles.push(tokio::spawn(kind_watcher(state.clone(), kind, stream)));
    }
    state.mark_ready();
    let object_count = state.objects.read().await.len();
    info!(%namespace, objects = object_count, "observer synced");

    futures::future::join_all(handles).await;
}

async fn initial_listing(
    store: &dyn ObjectStore,
    kind: Kind,
    namespace: &str,
) -> Vec<ManagedObject> {
    loop {
        match store.list(kind, namespace).await {
            Ok(objects) => return objects,
            Err(err) => {
                error!(%kind, %namespace, %err, "initial listing failed, retrying");
                tokio::time::sleep(LIST_RETRY_INTERVAL).await;
            }
        }
    }
}

pub async fn kind_watcher<S>(state: State, kind: Kind, mut stream: S)
where
    S: Stream<Item = Result<WatchEvent, StoreError>> + Unpin,
{
    debug!(%kind, "watcher started, waiting for events...");

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                let (WatchEvent::Apply(obj) | WatchEvent::Delete(obj)) = &event;
                debug!(object = %obj.key(), "observed change");
                state.apply_event(event).await;
            }
            Err(err) => error!(%kind, %err, "error from watch stream"),
        }
    }
}
