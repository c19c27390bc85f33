//! Drives extension objects through their lifecycle.
//!
//! None of these functions reconcile anything themselves. They tag objects
//! with the operation the owning agent should perform, then observe the
//! status the agent reports until it confirms the transition or a deadline
//! expires.

use futures::future::join_all;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, format_timestamp};
use crate::error::{Error, ErrorWithCodes, HealthError, ignore_not_found};
use crate::health::{self, HealthResult};
use crate::object::{
    ANNOTATION_CONFIRM_DELETION, ANNOTATION_OPERATION, ANNOTATION_TIMESTAMP, Kind,
    LastOperationState, LastOperationType, ManagedObject, ObjectKey, Operation,
};
use crate::retry::{self, RetryError, RetryFailure};
use crate::shootstate::ShootStateSnapshot;
use crate::store::{ObjectStore, PatchMode};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SEVERE_THRESHOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Optimistic-lock writes give up after this many consecutive conflicts.
const MAX_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    pub severe_threshold: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            severe_threshold: DEFAULT_SEVERE_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Runs once an object became ready. A failure aborts the wait.
pub type PostReadyHook = dyn Fn(&ManagedObject) -> Result<(), Error> + Send + Sync;

/// Re-runs a read-modify-write sequence while it fails with a conflict.
pub(crate) async fn retry_on_conflict<F, Fut, T>(key: &ObjectKey, mut write: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match write().await {
            Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                warn!(object = %key, attempt, error = %err, "conflicting write, re-fetching");
            }
            result => return result,
        }
    }
}

/// Sets the operation and timestamp annotations on the latest revision of
/// the object. Returns the annotated object, whose timestamp a subsequent
/// wait uses as its freshness marker.
pub async fn annotate_object_with_operation(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    key: &ObjectKey,
    operation: Operation,
) -> Result<ManagedObject, Error> {
    let annotated = retry_on_conflict(key, || async move {
        let current = store
            .get(key)
            .await
            .map_err(|e| Error::store("get", key, e))?;
        let mut annotated = current.clone();
        annotated.set_annotation(ANNOTATION_OPERATION, operation.as_str());
        annotated.set_annotation(ANNOTATION_TIMESTAMP, format_timestamp(clock.now()));
        store
            .patch(&current, &annotated, PatchMode::OptimisticLock)
            .await
            .map_err(|e| Error::store("annotate", key, e))
    })
    .await?;

    debug!(object = %key, %operation, "annotated object with operation");
    Ok(annotated)
}

fn wait_error(context: String, failure: RetryFailure<HealthError>) -> Error {
    let (description, codes) = match failure {
        RetryFailure::Severe(err) | RetryFailure::Timeout(Some(err)) => {
            (err.to_string(), err.codes().to_vec())
        }
        RetryFailure::Timeout(None) => ("retry failed with deadline exceeded".to_string(), Vec::new()),
    };
    ErrorWithCodes::new(format!("{context}: {description}"), codes).into()
}

fn get_failed(key: &ObjectKey, err: impl std::fmt::Display) -> RetryError<HealthError> {
    RetryError::Severe(HealthError::uncoded(format!("failed to get {key}: {err}")))
}

/// Waits until the owning agent reports success for the revision `obj`
/// describes. When `obj` carries a timestamp annotation, observations that
/// do not carry the same timestamp are considered stale.
pub async fn wait_until_extension_object_ready(
    store: &dyn ObjectStore,
    obj: &ManagedObject,
    options: WaitOptions,
    post_ready: Option<&PostReadyHook>,
) -> Result<ManagedObject, Error> {
    let check: Box<dyn Fn(&ManagedObject) -> HealthResult + Send + Sync> =
        match obj.annotation(ANNOTATION_TIMESTAMP) {
            Some(expected) => Box::new(health::and(
                health::has_annotation_with_value(ANNOTATION_TIMESTAMP, expected.to_string()),
                health::check_extension_object,
            )),
            None => Box::new(health::check_extension_object),
        };

    wait_until_object_ready_with_health(store, &obj.key(), check, options, post_ready).await
}

/// Polls the object until `health` passes. A missing object is retried.
/// Coded health errors become fatal once they persisted for longer than the
/// severe threshold; uncoded ones are retried until the timeout.
pub async fn wait_until_object_ready_with_health<H>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    health: H,
    options: WaitOptions,
    post_ready: Option<&PostReadyHook>,
) -> Result<ManagedObject, Error>
where
    H: Fn(&ManagedObject) -> HealthResult + Send + Sync,
{
    let threshold = retry::severe_attempts(options.interval, options.severe_threshold);
    let health = &health;

    retry::until_timeout(options.interval, options.timeout, |attempt| async move {
        // Every attempt decodes a fresh copy; nothing carries over.
        let obj = match store.get(key).await {
            Ok(obj) => obj,
            Err(err) if err.is_not_found() => {
                return Err(RetryError::Minor(HealthError::uncoded(err.to_string())));
            }
            Err(err) => return Err(get_failed(key, err)),
        };

        if let Err(err) = health(&obj) {
            info!(object = %key, attempt, error = %err, "object did not get ready yet");
            return Err(if err.is_coded() {
                retry::minor_or_severe(attempt, threshold, err)
            } else {
                RetryError::Minor(err)
            });
        }

        if let Some(hook) = post_ready {
            hook(&obj).map_err(|err| {
                RetryError::Severe(HealthError::uncoded(format!("post-ready hook failed: {err}")))
            })?;
        }

        Ok(obj)
    })
    .await
    .map_err(|failure| wait_error(format!("Error while waiting for {key} to become ready"), failure))
}

/// Marks the object as confirmed for deletion with a fresh timestamp.
pub async fn confirm_deletion(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    key: &ObjectKey,
) -> Result<(), Error> {
    retry_on_conflict(key, || async move {
        let current = store
            .get(key)
            .await
            .map_err(|e| Error::store("get", key, e))?;
        let mut confirmed = current.clone();
        confirmed.set_annotation(ANNOTATION_CONFIRM_DELETION, "true");
        confirmed.set_annotation(ANNOTATION_TIMESTAMP, format_timestamp(clock.now()));
        store
            .patch(&current, &confirmed, PatchMode::OptimisticLock)
            .await
            .map_err(|e| Error::store("confirm deletion of", key, e))
    })
    .await?;
    Ok(())
}

/// Confirms the deletion and deletes the object. A missing object is not an
/// error.
pub async fn delete_extension_object(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    key: &ObjectKey,
) -> Result<(), Error> {
    let result = async {
        confirm_deletion(store, clock, key).await?;
        store
            .delete(key)
            .await
            .map_err(|e| Error::store("delete", key, e))
    }
    .await;
    ignore_not_found(result)
}

/// Waits until the object is gone. While it is present, the last error its
/// agent reported is retained for the final error.
pub async fn wait_until_extension_object_deleted(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let last_observed: Mutex<Option<ErrorWithCodes>> = Mutex::new(None);
    let observed = &last_observed;

    let result = retry::until_timeout(interval, timeout, |attempt| async move {
        let obj = match store.get(key).await {
            Ok(obj) => obj,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(get_failed(key, err)),
        };

        if let Some(last_error) = &obj.status.last_error {
            warn!(
                object = %key,
                attempt,
                last_error = %last_error.description,
                "object did not get deleted yet"
            );
            *observed.lock().unwrap_or_else(|e| e.into_inner()) = Some(ErrorWithCodes::new(
                last_error.description.clone(),
                last_error.codes.clone(),
            ));
        }

        let last = observed.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let message = match last {
            Some(err) => format!("{key} is still present, last observed error: {err}"),
            None => format!("{key} is still present"),
        };
        Err(RetryError::Minor(HealthError::uncoded(message)))
    })
    .await;

    let Err(failure) = result else {
        return Ok(());
    };
    let context = format!("Failed to delete {key}");
    match last_observed.into_inner().unwrap_or_else(|e| e.into_inner()) {
        Some(err) => Err(ErrorWithCodes::new(format!("{context}: {}", err.message), err.codes).into()),
        None => Err(wait_error(context, failure)),
    }
}

/// Requests migration. A missing object counts as migrated.
pub async fn migrate_extension_object(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    key: &ObjectKey,
) -> Result<(), Error> {
    match annotate_object_with_operation(store, clock, key, Operation::Migrate).await {
        Err(err) if err.is_not_found() => Ok(()),
        result => result.map(|_| ()),
    }
}

/// Waits until the agent reports a successful migration. A missing object
/// counts as migrated.
pub async fn wait_until_extension_object_migrated(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    retry::until_timeout(interval, timeout, |_| async move {
        let obj = match store.get(key).await {
            Ok(obj) => obj,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(get_failed(key, err)),
        };

        let observed = match &obj.status.last_operation {
            Some(op)
                if op.type_ == LastOperationType::Migrate
                    && op.state == LastOperationState::Succeeded =>
            {
                return Ok(());
            }
            Some(op) => format!("{:?}={:?}", op.type_, op.state),
            None => "none".to_string(),
        };
        Err(RetryError::Minor(HealthError::uncoded(format!(
            "lastOperation for {} with name {} and type {} is not Migrate=Succeeded (observed {observed})",
            key.kind, key.name, obj.spec.type_
        ))))
    })
    .await
    .map_err(|failure| wait_error(format!("Error while waiting for {key} to be migrated"), failure))
}

async fn list_matching<P>(
    store: &dyn ObjectStore,
    kind: Kind,
    namespace: &str,
    predicate: P,
) -> Result<Vec<ObjectKey>, Error>
where
    P: Fn(&ManagedObject) -> bool,
{
    Ok(store
        .list(kind, namespace)
        .await
        .map_err(|e| Error::list(kind, namespace, e))?
        .iter()
        .filter(|obj| predicate(obj))
        .map(ManagedObject::key)
        .collect())
}

fn collect_errors(results: Vec<Result<(), Error>>) -> Result<(), Error> {
    Error::aggregate(results.into_iter().filter_map(Result::err).collect())
}

/// Deletes every object of `kind` in `namespace` matching `predicate`,
/// concurrently. All failures are reported.
pub async fn delete_all<P>(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    kind: Kind,
    namespace: &str,
    predicate: P,
) -> Result<(), Error>
where
    P: Fn(&ManagedObject) -> bool,
{
    let keys = list_matching(store, kind, namespace, predicate).await?;
    collect_errors(
        join_all(keys.iter().map(|key| delete_extension_object(store, clock, key))).await,
    )
}

/// Waits for every object of `kind` in `namespace` that is already marked
/// for deletion and matches `predicate` to disappear.
pub async fn wait_all_deleted<P>(
    store: &dyn ObjectStore,
    kind: Kind,
    namespace: &str,
    interval: Duration,
    timeout: Duration,
    predicate: P,
) -> Result<(), Error>
where
    P: Fn(&ManagedObject) -> bool,
{
    let keys = list_matching(store, kind, namespace, |obj| {
        obj.is_deleting() && predicate(obj)
    })
    .await?;
    collect_errors(
        join_all(
            keys.iter()
                .map(|key| wait_until_extension_object_deleted(store, key, interval, timeout)),
        )
        .await,
    )
}

pub async fn migrate_all(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    kind: Kind,
    namespace: &str,
) -> Result<(), Error> {
    let keys = list_matching(store, kind, namespace, |_| true).await?;
    collect_errors(
        join_all(keys.iter().map(|key| migrate_extension_object(store, clock, key))).await,
    )
}

pub async fn wait_all_migrated(
    store: &dyn ObjectStore,
    kind: Kind,
    namespace: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let keys = list_matching(store, kind, namespace, |_| true).await?;
    collect_errors(
        join_all(
            keys.iter()
                .map(|key| wait_until_extension_object_migrated(store, key, interval, timeout)),
        )
        .await,
    )
}

/// Deploys the object with the wait-for-state operation, primes its status
/// from `snapshot` and hands it back to its agent with the restore
/// operation. Returns the object as annotated for restore.
pub async fn restore_with_deploy<F, Fut>(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    snapshot: &ShootStateSnapshot,
    deploy: F,
) -> Result<ManagedObject, Error>
where
    F: FnOnce(Operation) -> Fut,
    Fut: Future<Output = Result<ManagedObject, Error>>,
{
    let deployed = deploy(Operation::WaitForState).await?;
    restore_state(store, snapshot, &deployed).await?;
    annotate_object_with_operation(store, clock, &deployed.key(), Operation::Restore).await
}

/// Writes the captured state and resource references of the matching
/// snapshot entry into the object's status and re-creates every referenced
/// object. An object without a matching entry is left untouched.
pub async fn restore_state(
    store: &dyn ObjectStore,
    snapshot: &ShootStateSnapshot,
    obj: &ManagedObject,
) -> Result<(), Error> {
    let key = obj.key();
    let current = store
        .get(&key)
        .await
        .map_err(|e| Error::store("get", &key, e))?;

    let Some(entry) =
        snapshot
            .extensions
            .get(key.kind, &key.name, current.spec.purpose.as_deref())
    else {
        debug!(object = %key, "no state to restore");
        return Ok(());
    };

    let mut referenced = Vec::with_capacity(entry.resources.len());
    for resource in &entry.resources {
        let data = snapshot.resources.get(&resource.resource_ref).ok_or_else(|| {
            Error::Restore {
                key: key.to_string(),
                message: format!(
                    "referenced object {} {} is missing from the snapshot",
                    resource.resource_ref.kind, resource.resource_ref.name
                ),
            }
        })?;
        referenced.push(data);
    }

    let mut restored = current.clone();
    restored.status.state = entry.state.clone();
    restored.status.resources = entry.resources.clone();
    store
        .patch_status(&current, &restored)
        .await
        .map_err(|e| Error::store("restore state of", &key, e))?;

    for data in referenced {
        store
            .apply_by_ref(&key.namespace, &data.reference, &data.data)
            .await
            .map_err(|e| Error::Restore {
                key: key.to_string(),
                message: format!(
                    "failed to apply referenced object {} {}: {e}",
                    data.reference.kind, data.reference.name
                ),
            })?;
    }

    info!(object = %key, resources = entry.resources.len(), "restored state");
    Ok(())
}
