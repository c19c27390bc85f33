//! The lifecycle interface shared by every extension kind, and the generic
//! component that implements it for a single object.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::clock::{Clock, format_timestamp};
use crate::error::{Error, StoreError};
use crate::extensions::{self, WaitOptions};
use crate::object::{
    ANNOTATION_OPERATION, ANNOTATION_TIMESTAMP, Kind, ManagedObject, ObjectKey, Operation,
};
use crate::shootstate::ShootStateSnapshot;
use crate::store::{ObjectStore, PatchMode};

#[async_trait]
pub trait DeployWaiter: Send + Sync {
    async fn deploy(&self) -> Result<(), Error>;
    async fn destroy(&self) -> Result<(), Error>;
    async fn wait(&self) -> Result<(), Error>;
    async fn wait_cleanup(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait DeployMigrateWaiter: DeployWaiter {
    async fn restore(&self, snapshot: &ShootStateSnapshot) -> Result<(), Error>;
    async fn migrate(&self) -> Result<(), Error>;
    async fn wait_migrate(&self) -> Result<(), Error>;
}

/// Deploys and waits until the component is ready.
pub async fn deploy_and_wait(component: &dyn DeployWaiter) -> Result<(), Error> {
    component.deploy().await?;
    component.wait().await
}

/// Destroys and waits until the component is gone.
pub async fn destroy_and_wait(component: &dyn DeployWaiter) -> Result<(), Error> {
    component.destroy().await?;
    component.wait_cleanup().await
}

/// Desired spec of an extension object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    pub name: String,
    pub type_: String,
    pub purpose: Option<String>,
    pub provider_config: Option<Value>,
    pub data: Option<Vec<u8>>,
    /// Kind specific spec fields.
    pub fields: Map<String, Value>,
}

/// Drives one extension object of any kind.
pub struct Extension {
    kind: Kind,
    namespace: String,
    values: Values,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    options: WaitOptions,
    // Revision written by the last deploy or restore; its timestamp marks
    // which observations are fresh enough.
    deployed: Mutex<Option<ManagedObject>>,
    ready: Mutex<Option<ManagedObject>>,
}

impl Extension {
    pub fn new(
        kind: Kind,
        namespace: impl Into<String>,
        values: Values,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        options: WaitOptions,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            values,
            store,
            clock,
            options,
            deployed: Mutex::new(None),
            ready: Mutex::new(None),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind, &self.namespace, &self.values.name)
    }

    /// The object as last observed ready by [`DeployWaiter::wait`].
    pub fn ready_object(&self) -> Option<ManagedObject> {
        self.ready.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn apply_values(&self, obj: &mut ManagedObject, operation: Operation) {
        obj.set_annotation(ANNOTATION_OPERATION, operation.as_str());
        obj.set_annotation(ANNOTATION_TIMESTAMP, format_timestamp(self.clock.now()));
        obj.spec.type_ = self.values.type_.clone();
        obj.spec.purpose = self.values.purpose.clone();
        obj.spec.provider_config = self.values.provider_config.clone();
        obj.spec.data = self.values.data.clone();
        obj.spec.extra = self.values.fields.clone();
    }

    /// Creates the object or brings the existing one to the desired spec,
    /// requesting `operation` from its agent.
    pub async fn deploy_with_operation(&self, operation: Operation) -> Result<ManagedObject, Error> {
        let key = self.key();
        let key = &key;

        let deployed = extensions::retry_on_conflict(key, || async move {
            match self.store.get(key).await {
                Ok(current) => {
                    let mut desired = current.clone();
                    self.apply_values(&mut desired, operation);
                    self.store
                        .patch(&current, &desired, PatchMode::OptimisticLock)
                        .await
                        .map_err(|e| Error::store("patch", key, e))
                }
                Err(err) if err.is_not_found() => {
                    let mut desired = ManagedObject::new(key);
                    self.apply_values(&mut desired, operation);
                    self.store.create(&desired).await.map_err(|e| {
                        // Somebody else created it in between; re-fetch and patch.
                        let e = if e.is_already_exists() {
                            StoreError::Conflict(key.to_string(), "created concurrently".to_string())
                        } else {
                            e
                        };
                        Error::store("create", key, e)
                    })
                }
                Err(err) => Err(Error::store("get", key, err)),
            }
        })
        .await?;

        info!(object = %key, %operation, "deployed object");
        *self.deployed.lock().unwrap_or_else(|e| e.into_inner()) = Some(deployed.clone());
        Ok(deployed)
    }
}

#[async_trait]
impl DeployWaiter for Extension {
    async fn deploy(&self) -> Result<(), Error> {
        self.deploy_with_operation(Operation::Reconcile).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        extensions::delete_extension_object(self.store.as_ref(), self.clock.as_ref(), &self.key())
            .await
    }

    async fn wait(&self) -> Result<(), Error> {
        let expected = self
            .deployed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| ManagedObject::new(&self.key()));

        let ready = extensions::wait_until_extension_object_ready(
            self.store.as_ref(),
            &expected,
            self.options,
            None,
        )
        .await?;
        *self.ready.lock().unwrap_or_else(|e| e.into_inner()) = Some(ready);
        Ok(())
    }

    async fn wait_cleanup(&self) -> Result<(), Error> {
        extensions::wait_until_extension_object_deleted(
            self.store.as_ref(),
            &self.key(),
            self.options.interval,
            self.options.timeout,
        )
        .await
    }
}

#[async_trait]
impl DeployMigrateWaiter for Extension {
    async fn restore(&self, snapshot: &ShootStateSnapshot) -> Result<(), Error> {
        let restored = extensions::restore_with_deploy(
            self.store.as_ref(),
            self.clock.as_ref(),
            snapshot,
            |operation| self.deploy_with_operation(operation),
        )
        .await?;
        *self.deployed.lock().unwrap_or_else(|e| e.into_inner()) = Some(restored);
        Ok(())
    }

    async fn migrate(&self) -> Result<(), Error> {
        extensions::migrate_extension_object(self.store.as_ref(), self.clock.as_ref(), &self.key())
            .await
    }

    async fn wait_migrate(&self) -> Result<(), Error> {
        extensions::wait_until_extension_object_migrated(
            self.store.as_ref(),
            &self.key(),
            self.options.interval,
            self.options.timeout,
        )
        .await
    }
}
