//! [`ObjectStore`] backed by the Kubernetes API server. Extension objects are
//! addressed as `DynamicObject`s of the `extensions.gardener.cloud` group so
//! that every [`Kind`] shares one code path.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Client,
    api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    runtime::{WatchStreamExt, watcher},
};
use serde_json::{Value, json};
use std::fmt::Display;
use tracing::debug;

use super::{
    LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE, LABEL_PERSIST, LABEL_PERSIST_VALUE, ObjectStore,
    PatchMode, PersistedSecret, WatchEvent, object_patch, status_patch,
};
use crate::error::StoreError;
use crate::object::{
    CrossVersionObjectReference, EXTENSIONS_API_VERSION, EXTENSIONS_GROUP, EXTENSIONS_VERSION,
    Kind, ManagedObject, ObjectKey,
};

pub const FIELD_MANAGER: &str = "trellis";

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self, StoreError> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, kind: Kind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }

    fn ref_api(&self, namespace: &str, reference: &CrossVersionObjectReference) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &ref_api_resource(reference))
    }
}

pub fn api_resource(kind: Kind) -> ApiResource {
    ApiResource {
        group: EXTENSIONS_GROUP.to_string(),
        version: EXTENSIONS_VERSION.to_string(),
        api_version: EXTENSIONS_API_VERSION.to_string(),
        kind: kind.as_str().to_string(),
        plural: kind.plural(),
    }
}

fn ref_api_resource(reference: &CrossVersionObjectReference) -> ApiResource {
    let (group, version) = match reference.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), reference.api_version.clone()),
    };
    ApiResource {
        group,
        version,
        api_version: reference.api_version.clone(),
        kind: reference.kind.clone(),
        plural: pluralize(&reference.kind),
    }
}

fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with('x') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

/// Normalizes API errors into the store taxonomy.
fn map_err(what: impl Display, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what.to_string(), ae.message),
        other => StoreError::Kube(other),
    }
}

fn to_managed(kind: Kind, obj: DynamicObject) -> Result<ManagedObject, StoreError> {
    let mut value = serde_json::to_value(obj)?;
    // List items do not always carry their type meta.
    value["kind"] = json!(kind.as_str());
    Ok(serde_json::from_value(value)?)
}

/// Drops server-populated metadata so a captured object can be re-applied
/// in another cluster.
fn strip_server_metadata(data: &Value, namespace: &str) -> Value {
    let mut data = data.clone();
    if let Some(metadata) = data.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "resourceVersion",
            "uid",
            "creationTimestamp",
            "managedFields",
            "generation",
            "ownerReferences",
        ] {
            metadata.remove(field);
        }
        metadata.insert("namespace".to_string(), json!(namespace));
    }
    data.as_object_mut().map(|o| o.remove("status"));
    data
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, StoreError> {
        let obj = self
            .api(key.kind, &key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_err(key, e))?;
        to_managed(key.kind, obj)
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<ManagedObject>, StoreError> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_err(format!("{kind} {namespace}/*"), e))?;
        list.items
            .into_iter()
            .map(|obj| to_managed(kind, obj))
            .collect()
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = obj.key();
        let body: DynamicObject = serde_json::from_value(json!({
            "apiVersion": EXTENSIONS_API_VERSION,
            "kind": obj.kind.as_str(),
            "metadata": {
                "name": obj.metadata.name,
                "namespace": obj.metadata.namespace,
                "annotations": obj.metadata.annotations,
                "labels": obj.metadata.labels,
                "finalizers": obj.metadata.finalizers,
            },
            "spec": serde_json::to_value(&obj.spec)?,
        }))?;
        let created = self
            .api(key.kind, &key.namespace)
            .create(&PostParams::default(), &body)
            .await
            .map_err(|e| map_err(&key, e))?;
        debug!(object = %key, "created object");
        to_managed(key.kind, created)
    }

    async fn patch(
        &self,
        old: &ManagedObject,
        new: &ManagedObject,
        mode: PatchMode,
    ) -> Result<ManagedObject, StoreError> {
        let key = old.key();
        let patch = object_patch(old, new, mode)?;
        let patched = self
            .api(key.kind, &key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(&key, e))?;
        to_managed(key.kind, patched)
    }

    async fn patch_status(
        &self,
        old: &ManagedObject,
        new: &ManagedObject,
    ) -> Result<ManagedObject, StoreError> {
        let key = old.key();
        let patch = status_patch(old, new)?;
        let patched = self
            .api(key.kind, &key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(&key, e))?;
        to_managed(key.kind, patched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(key.kind, &key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_err(key, e))?;
        Ok(())
    }

    fn watch(
        &self,
        kind: Kind,
        namespace: &str,
    ) -> BoxStream<'static, Result<WatchEvent, StoreError>> {
        watcher::watcher(self.api(kind, namespace), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| async move {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(to_managed(kind, obj).map(WatchEvent::Apply))
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        Some(to_managed(kind, obj).map(WatchEvent::Delete))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(StoreError::Watch(err.to_string()))),
                }
            })
            .boxed()
    }

    async fn get_by_ref(
        &self,
        namespace: &str,
        reference: &CrossVersionObjectReference,
    ) -> Result<Value, StoreError> {
        let what = format!("{} {namespace}/{}", reference.kind, reference.name);
        let obj = self
            .ref_api(namespace, reference)
            .get(&reference.name)
            .await
            .map_err(|e| map_err(&what, e))?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn apply_by_ref(
        &self,
        namespace: &str,
        reference: &CrossVersionObjectReference,
        data: &Value,
    ) -> Result<(), StoreError> {
        let what = format!("{} {namespace}/{}", reference.kind, reference.name);
        let mut body = strip_server_metadata(data, namespace);
        body["apiVersion"] = json!(reference.api_version);
        body["kind"] = json!(reference.kind);
        body["metadata"]["name"] = json!(reference.name);
        self.ref_api(namespace, reference)
            .patch(
                &reference.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&body),
            )
            .await
            .map_err(|e| map_err(&what, e))?;
        Ok(())
    }

    async fn list_persisted_secrets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PersistedSecret>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!(
            "{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_VALUE},{LABEL_PERSIST}={LABEL_PERSIST_VALUE}"
        );
        let secrets = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| map_err(format!("Secret {namespace}/*"), e))?;

        Ok(secrets
            .items
            .into_iter()
            .map(|secret| PersistedSecret {
                name: secret.metadata.name.unwrap_or_default(),
                labels: secret.metadata.labels.unwrap_or_default(),
                data: secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect(),
            })
            .collect())
    }
}
