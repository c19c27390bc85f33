//! The composite state of one managed cluster, captured before a control
//! plane migration and replayed into freshly deployed objects afterwards.
//!
//! All three lists are keyed by identity: `upsert` replaces an existing
//! entry in place and appends otherwise, so refreshing a snapshot never
//! duplicates entries.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::Error;
use crate::object::{CrossVersionObjectReference, Kind, NamedResourceReference};
use crate::store::ObjectStore;

pub const SECRET_TYPE: &str = "secret";

/// Data owned by the control plane itself, e.g. a persisted secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GardenerResourceData {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: Value,
}

/// The opaque state and resource references an agent reported for one
/// extension object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionResourceState {
    pub kind: Kind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<NamedResourceReference>,
}

/// The captured payload of an object referenced from an extension status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    #[serde(flatten)]
    pub reference: CrossVersionObjectReference,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GardenerResourceDataList(pub Vec<GardenerResourceData>);

impl GardenerResourceDataList {
    pub fn get(&self, name: &str) -> Option<&GardenerResourceData> {
        self.0.iter().find(|d| d.name == name)
    }

    pub fn upsert(&mut self, data: GardenerResourceData) {
        match self.0.iter_mut().find(|d| d.name == data.name) {
            Some(existing) => *existing = data,
            None => self.0.push(data),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionResourceStateList(pub Vec<ExtensionResourceState>);

impl ExtensionResourceStateList {
    pub fn get(
        &self,
        kind: Kind,
        name: &str,
        purpose: Option<&str>,
    ) -> Option<&ExtensionResourceState> {
        self.0
            .iter()
            .find(|s| s.kind == kind && s.name == name && s.purpose.as_deref() == purpose)
    }

    pub fn upsert(&mut self, state: ExtensionResourceState) {
        match self.0.iter_mut().find(|s| {
            s.kind == state.kind && s.name == state.name && s.purpose == state.purpose
        }) {
            Some(existing) => *existing = state,
            None => self.0.push(state),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceDataList(pub Vec<ResourceData>);

impl ResourceDataList {
    pub fn get(&self, reference: &CrossVersionObjectReference) -> Option<&ResourceData> {
        self.0.iter().find(|d| &d.reference == reference)
    }

    pub fn upsert(&mut self, data: ResourceData) {
        match self.0.iter_mut().find(|d| d.reference == data.reference) {
            Some(existing) => *existing = data,
            None => self.0.push(data),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShootStateSnapshot {
    #[serde(default)]
    pub gardener: GardenerResourceDataList,
    #[serde(default)]
    pub extensions: ExtensionResourceStateList,
    #[serde(default)]
    pub resources: ResourceDataList,
}

impl ShootStateSnapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Captures persisted secrets and the state of every live extension object
/// in `namespace`. Objects marked for deletion are skipped. When two live
/// objects share an identity, the one listed last wins.
pub async fn compute_snapshot(
    store: &dyn ObjectStore,
    namespace: &str,
) -> Result<ShootStateSnapshot, Error> {
    let mut snapshot = ShootStateSnapshot::default();

    let secrets = store
        .list_persisted_secrets(namespace)
        .await
        .map_err(|e| Error::Snapshot(format!("failed listing secrets that must be persisted: {e}")))?;
    for secret in secrets {
        let data: BTreeMap<&String, String> = secret
            .data
            .iter()
            .map(|(k, v)| (k, STANDARD.encode(v)))
            .collect();
        snapshot.gardener.upsert(GardenerResourceData {
            name: secret.name.clone(),
            labels: secret.labels.clone(),
            type_: SECRET_TYPE.to_string(),
            data: serde_json::to_value(data)?,
        });
    }

    for kind in Kind::STATEFUL {
        let objects = store
            .list(kind, namespace)
            .await
            .map_err(|e| Error::list(kind, namespace, e))?;

        for obj in objects.into_iter().filter(|o| !o.is_deleting()) {
            for resource in &obj.status.resources {
                let data = store
                    .get_by_ref(namespace, &resource.resource_ref)
                    .await
                    .map_err(|e| {
                        Error::Snapshot(format!(
                            "failed reading referenced object {} {namespace}/{} of {}: {e}",
                            resource.resource_ref.kind,
                            resource.resource_ref.name,
                            obj.key()
                        ))
                    })?;
                snapshot.resources.upsert(ResourceData {
                    reference: resource.resource_ref.clone(),
                    data,
                });
            }

            snapshot.extensions.upsert(ExtensionResourceState {
                kind,
                name: obj.metadata.name.clone(),
                purpose: obj.spec.purpose.clone(),
                state: obj.status.state.clone(),
                resources: obj.status.resources.clone(),
            });
        }
    }

    debug!(
        namespace,
        secrets = snapshot.gardener.0.len(),
        extensions = snapshot.extensions.0.len(),
        resources = snapshot.resources.0.len(),
        "computed shoot state snapshot"
    );
    Ok(snapshot)
}

/// Decodes the secret data captured by [`compute_snapshot`].
pub fn secret_data(data: &GardenerResourceData) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let encoded: BTreeMap<String, String> = serde_json::from_value(data.data.clone())?;
    encoded
        .into_iter()
        .map(|(k, v)| {
            STANDARD
                .decode(v)
                .map(|bytes| (k, bytes))
                .map_err(|e| Error::Snapshot(format!("invalid secret data in {}: {e}", data.name)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ManagedObject, ObjectKey};
    use crate::store::PersistedSecret;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn state(kind: Kind, name: &str, purpose: Option<&str>, value: i64) -> ExtensionResourceState {
        ExtensionResourceState {
            kind,
            name: name.into(),
            purpose: purpose.map(Into::into),
            state: Some(json!({"v": value})),
            resources: vec![],
        }
    }

    #[test]
    fn test_upsert_replaces_by_identity() {
        let mut list = ExtensionResourceStateList::default();
        list.upsert(state(Kind::Worker, "w1", None, 1));
        list.upsert(state(Kind::Worker, "w1", Some("exposure"), 2));
        list.upsert(state(Kind::Worker, "w1", None, 3));

        assert_eq!(list.0.len(), 2);
        assert_eq!(list.get(Kind::Worker, "w1", None).unwrap().state, Some(json!({"v": 3})));
        assert_eq!(
            list.get(Kind::Worker, "w1", Some("exposure")).unwrap().state,
            Some(json!({"v": 2}))
        );
        assert!(list.get(Kind::Network, "w1", None).is_none());
    }

    #[test]
    fn test_resource_data_serializes_flat() {
        let data = ResourceData {
            reference: CrossVersionObjectReference {
                api_version: "v1".into(),
                kind: "Secret".into(),
                name: "s".into(),
            },
            data: json!({"kind": "Secret"}),
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"apiVersion": "v1", "kind": "Secret", "name": "s", "data": {"kind": "Secret"}})
        );

        let mut list = ResourceDataList::default();
        list.upsert(data.clone());
        list.upsert(data.clone());
        assert_eq!(list.0.len(), 1);
        assert!(list.get(&data.reference).is_some());
    }

    #[tokio::test]
    async fn test_compute_snapshot_skips_deleting_objects() {
        let store = MemoryStore::new();
        let ns = "shoot--dev--a";

        let reference = CrossVersionObjectReference {
            api_version: "v1".into(),
            kind: "Secret".into(),
            name: "worker-state".into(),
        };
        store.apply_by_ref(ns, &reference, &json!({"data": {"k": "dg=="}})).await.unwrap();

        let mut worker = ManagedObject::new(&ObjectKey::new(Kind::Worker, ns, "a"));
        worker.status.state = Some(json!({"machines": 3}));
        worker.status.resources = vec![NamedResourceReference {
            name: "state".into(),
            resource_ref: reference.clone(),
        }];
        store.upsert(worker);

        let mut gone = ManagedObject::new(&ObjectKey::new(Kind::Network, ns, "a"));
        gone.metadata.deletion_timestamp = Some(chrono::Utc::now());
        store.upsert(gone);

        store.put_secret(
            ns,
            PersistedSecret {
                name: "ca".into(),
                labels: BTreeMap::from([
                    ("managed-by".to_string(), "secrets-manager".to_string()),
                    ("persist".to_string(), "true".to_string()),
                ]),
                data: BTreeMap::from([("ca.crt".to_string(), b"pem".to_vec())]),
            },
        );

        let snapshot = compute_snapshot(&store, ns).await.unwrap();

        assert_eq!(snapshot.extensions.0.len(), 1);
        let entry = snapshot.extensions.get(Kind::Worker, "a", None).unwrap();
        assert_eq!(entry.state, Some(json!({"machines": 3})));
        assert_eq!(
            snapshot.resources.get(&reference).unwrap().data,
            json!({"data": {"k": "dg=="}})
        );

        let ca = snapshot.gardener.get("ca").unwrap();
        assert_eq!(ca.type_, "secret");
        assert_eq!(secret_data(ca).unwrap()["ca.crt"], b"pem".to_vec());
    }

    #[tokio::test]
    async fn test_compute_snapshot_fails_on_dangling_reference() {
        let store = MemoryStore::new();
        let mut infra = ManagedObject::new(&ObjectKey::new(Kind::Infrastructure, "ns", "i"));
        infra.status.resources = vec![NamedResourceReference {
            name: "missing".into(),
            resource_ref: CrossVersionObjectReference {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                name: "missing".into(),
            },
        }];
        store.upsert(infra);

        let err = compute_snapshot(&store, "ns").await.unwrap_err();
        assert!(err.to_string().contains("ConfigMap ns/missing"));
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let mut snapshot = ShootStateSnapshot::default();
        snapshot.extensions.upsert(state(Kind::DnsRecord, "external", None, 1));
        let raw = snapshot.to_json().unwrap();
        assert!(String::from_utf8_lossy(&raw).contains("\"kind\":\"DNSRecord\""));
        assert_eq!(ShootStateSnapshot::from_json(&raw).unwrap(), snapshot);
    }
}
