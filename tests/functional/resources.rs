use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{
    Api, Client,
    api::{DeleteParams, DynamicObject, ListParams},
};
use serde_json::json;
use std::collections::BTreeMap;
use trellis::object::{EXTENSIONS_GROUP, EXTENSIONS_VERSION, Kind};
use trellis::store::kubernetes::api_resource;

pub struct TestResources {
    pub client: Client,
    pub namespace: String,
}

impl TestResources {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    pub async fn create_namespace(&self) -> Result<(), Box<dyn std::error::Error>> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.create(&Default::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Installs a schemaless definition with a status subresource for each
    /// kind, then waits until the API server serves it.
    pub async fn install_crds(&self, kinds: &[Kind]) -> Result<(), Box<dyn std::error::Error>> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        for kind in kinds {
            let plural = kind.plural();
            let crd: CustomResourceDefinition = serde_json::from_value(json!({
                "apiVersion": "apiextensions.k8s.io/v1",
                "kind": "CustomResourceDefinition",
                "metadata": {"name": format!("{plural}.{EXTENSIONS_GROUP}")},
                "spec": {
                    "group": EXTENSIONS_GROUP,
                    "scope": "Namespaced",
                    "names": {
                        "kind": kind.as_str(),
                        "plural": plural,
                        "singular": kind.as_str().to_lowercase(),
                        "listKind": format!("{}List", kind.as_str()),
                    },
                    "versions": [{
                        "name": EXTENSIONS_VERSION,
                        "served": true,
                        "storage": true,
                        "subresources": {"status": {}},
                        "schema": {"openAPIV3Schema": {
                            "type": "object",
                            "x-kubernetes-preserve-unknown-fields": true,
                        }},
                    }],
                },
            }))?;
            match crds.create(&Default::default(), &crd).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }

        for kind in kinds {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource(*kind));
            let mut served = false;
            for _ in 0..60 {
                if api.list(&ListParams::default()).await.is_ok() {
                    served = true;
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
            if !served {
                return Err(format!("{kind} was not served in time").into());
            }
        }
        Ok(())
    }

    pub async fn create_persisted_secret(
        &self,
        name: &str,
        data: &[(&str, &[u8])],
    ) -> Result<Secret, Box<dyn std::error::Error>> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("managed-by".to_string(), "secrets-manager".to_string()),
                    ("persist".to_string(), "true".to_string()),
                ])),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(secrets.create(&Default::default(), &secret).await?)
    }

    pub async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces
            .delete(&self.namespace, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
