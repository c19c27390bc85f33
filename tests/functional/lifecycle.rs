use crate::{TestCluster, TestResources};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

use trellis::agent::LocalRelayAgent;
use trellis::backup::ShootStateBackup;
use trellis::clock::RealClock;
use trellis::component::{
    DeployMigrateWaiter, DeployWaiter, Extension, Values, deploy_and_wait, destroy_and_wait,
};
use trellis::config::Config;
use trellis::crypto::StateKey;
use trellis::extensions::WaitOptions;
use trellis::object::{
    ANNOTATION_OPERATION, Kind, LastOperation, LastOperationState, Operation,
};
use trellis::server::TrellisServer;
use trellis::store::kubernetes::KubeStore;
use trellis::store::{ObjectStore, PatchMode, WatchEvent};

const NS: &str = "shoot--dev--functional";

fn options() -> WaitOptions {
    WaitOptions {
        interval: Duration::from_millis(250),
        severe_threshold: Duration::from_secs(10),
        timeout: Duration::from_secs(60),
    }
}

fn network(store: Arc<KubeStore>) -> Extension {
    Extension::new(
        Kind::Network,
        NS,
        Values {
            name: "net".into(),
            type_: "calico".into(),
            fields: Map::from_iter([("podCIDR".to_string(), json!("100.96.0.0/11"))]),
            ..Default::default()
        },
        store,
        Arc::new(RealClock),
        options(),
    )
}

/// Plays the owning agent of `kind`: acknowledges every requested operation
/// except `wait-for-state`, recording `state` on the way.
fn spawn_reconciler(store: Arc<KubeStore>, kind: Kind, state: Value) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = store.watch(kind, NS);
        while let Some(event) = events.next().await {
            let Ok(WatchEvent::Apply(obj)) = event else {
                continue;
            };
            let Ok(current) = store.get(&obj.key()).await else {
                continue;
            };
            match current.operation() {
                None | Some(Operation::WaitForState) => continue,
                Some(_) if current.is_deleting() => continue,
                Some(_) => {}
            }
            let type_ = current.compute_operation_type();
            let mut released = current.clone();
            released.metadata.annotations.remove(ANNOTATION_OPERATION);
            let Ok(released) = store.patch(&current, &released, PatchMode::Merge).await else {
                continue;
            };
            let mut done = released.clone();
            done.status.observed_generation = released.metadata.generation;
            done.status.last_error = None;
            if done.status.state.is_none() {
                done.status.state = Some(state.clone());
            }
            done.status.last_operation = Some(LastOperation::new(
                type_,
                LastOperationState::Succeeded,
                "reconciled",
                Utc::now(),
            ));
            let _ = store.patch_status(&released, &done).await;
        }
    })
}

async fn setup() -> Result<(TestCluster, TestResources, Arc<KubeStore>), Box<dyn std::error::Error>>
{
    let cluster = TestCluster::new().await?;
    cluster.wait_for_ready().await?;
    let resources = TestResources::new(cluster.client.clone(), NS);
    resources.create_namespace().await?;
    resources
        .install_crds(&[Kind::Network, Kind::BackupUpload, Kind::BackupDownload])
        .await?;
    let store = Arc::new(KubeStore::new(cluster.client.clone()));
    Ok((cluster, resources, store))
}

#[tokio::test]
async fn test_deploy_migrate_and_destroy() -> Result<(), Box<dyn std::error::Error>> {
    let (cluster, resources, store) = setup().await?;
    let reconciler = spawn_reconciler(store.clone(), Kind::Network, json!({"ipam": "v1"}));
    let component = network(store.clone());

    deploy_and_wait(&component).await?;
    let ready = component.ready_object().expect("ready object");
    assert_eq!(ready.spec.extra["podCIDR"], "100.96.0.0/11");
    assert_eq!(ready.status.state, Some(json!({"ipam": "v1"})));

    component.migrate().await?;
    component.wait_migrate().await?;

    destroy_and_wait(&component).await?;
    assert!(store.get(&component.key()).await.is_err());

    reconciler.abort();
    resources.cleanup().await?;
    cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn test_backup_fetch_and_restore() -> Result<(), Box<dyn std::error::Error>> {
    let (cluster, resources, store) = setup().await?;
    let bucket = tempfile::tempdir()?;
    let agent = tokio::spawn(
        LocalRelayAgent::new(store.clone(), Arc::new(RealClock), NS, bucket.path()).run(),
    );
    let reconciler = spawn_reconciler(store.clone(), Kind::Network, json!({"ipam": "v1"}));
    resources
        .create_persisted_secret("ca", &[("ca.crt", b"certificate")])
        .await?;

    let component = network(store.clone());
    deploy_and_wait(&component).await?;

    let backup = ShootStateBackup::new(
        store.clone(),
        Arc::new(RealClock),
        NS,
        "local",
        "shoot--dev--functional--uid",
        StateKey::new(&[9u8; 32])?,
        options(),
    );
    let snapshot = backup.backup().await?;
    assert_eq!(snapshot.gardener.0.len(), 1);
    assert!(bucket.path().join("shoot--dev--functional--uid/shootstate").exists());

    destroy_and_wait(&component).await?;
    reconciler.abort();

    let fetched = backup.fetch().await?;
    assert_eq!(fetched, snapshot);

    // Restoring onto a fresh object primes its state before the agent
    // sees the restore request.
    let reconciler = spawn_reconciler(store.clone(), Kind::Network, json!({"ipam": "fresh"}));
    let restored = network(store.clone());
    restored.restore(&fetched).await?;
    restored.wait().await?;
    let ready = restored.ready_object().expect("ready object");
    assert_eq!(ready.status.state, Some(json!({"ipam": "v1"})));

    reconciler.abort();
    agent.abort();
    resources.cleanup().await?;
    cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn test_status_api_reports_objects() -> Result<(), Box<dyn std::error::Error>> {
    let (cluster, resources, store) = setup().await?;
    let reconciler = spawn_reconciler(store.clone(), Kind::Network, json!({}));

    let config = Config {
        bind_addr: "127.0.0.1:0".to_string(),
        namespace: NS.to_string(),
        ..Default::default()
    };
    let server = TrellisServer::new_with_store(config, store.clone()).await?;
    let server_url = format!("http://{}", server.addr);
    let _server_handle = tokio::spawn(async move { server.serve().await });

    let mut healthy = false;
    for _ in 0..30 {
        if let Ok(response) = reqwest::get(format!("{server_url}/healthz")).await
            && response.status().is_success()
        {
            healthy = true;
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }
    assert!(healthy, "status API did not become healthy");

    deploy_and_wait(&network(store.clone())).await?;
    sleep(Duration::from_secs(2)).await;

    let objects: Value = reqwest::get(format!("{server_url}/objects")).await?.json().await?;
    let net = objects
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["name"] == "net")
        .expect("network summary");
    assert_eq!(net["kind"], "Network");
    assert_eq!(net["ready"], true);

    reconciler.abort();
    resources.cleanup().await?;
    cluster.cleanup().await?;
    Ok(())
}
