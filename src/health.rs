//! Health predicates evaluated by the readiness poller.

use crate::error::{ErrorWithCodes, HealthError};
use crate::object::{ANNOTATION_OPERATION, LastOperationState, ManagedObject};

pub type HealthResult = Result<(), HealthError>;

/// Fails unless the object carries `key` with exactly `value`.
pub fn has_annotation_with_value(
    key: &'static str,
    value: String,
) -> impl Fn(&ManagedObject) -> HealthResult + Send + Sync {
    move |obj| match obj.annotation(key) {
        Some(actual) if actual == value => Ok(()),
        Some(actual) => Err(HealthError::uncoded(format!(
            "annotation {key} has value {actual:?}, expected {value:?}"
        ))),
        None => Err(HealthError::uncoded(format!(
            "annotation {key} is missing, expected {value:?}"
        ))),
    }
}

/// Checks that the owning agent has picked up the latest generation and
/// reported success for it.
pub fn check_extension_object(obj: &ManagedObject) -> HealthResult {
    let status = &obj.status;

    if let Some(last_error) = &status.last_error {
        return Err(HealthError::Coded(ErrorWithCodes::new(
            format!("error during reconciliation: {}", last_error.description),
            last_error.codes.clone(),
        )));
    }

    if status.observed_generation != obj.metadata.generation {
        return Err(HealthError::uncoded(format!(
            "observed generation outdated ({}/{})",
            status.observed_generation, obj.metadata.generation
        )));
    }

    if let Some(op) = obj.annotation(ANNOTATION_OPERATION) {
        return Err(HealthError::uncoded(format!(
            "gardener operation {op:?} is not yet picked up by controller"
        )));
    }

    let Some(last_operation) = &status.last_operation else {
        return Err(HealthError::uncoded("extension did not record a last operation yet"));
    };

    if last_operation.state != LastOperationState::Succeeded {
        return Err(HealthError::uncoded(format!(
            "extension state is not succeeded but {:?}",
            last_operation.state
        )));
    }

    Ok(())
}

/// Combines checks; the first failure wins.
pub fn and<A, B>(first: A, second: B) -> impl Fn(&ManagedObject) -> HealthResult + Send + Sync
where
    A: Fn(&ManagedObject) -> HealthResult + Send + Sync,
    B: Fn(&ManagedObject) -> HealthResult + Send + Sync,
{
    move |obj| {
        first(obj)?;
        second(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{
        ANNOTATION_TIMESTAMP, ErrorCode, Kind, LastError, LastOperation, LastOperationType,
        ObjectKey,
    };
    use chrono::Utc;

    fn healthy() -> ManagedObject {
        let mut obj = ManagedObject::new(&ObjectKey::new(Kind::Infrastructure, "ns", "infra"));
        obj.metadata.generation = 2;
        obj.status.observed_generation = 2;
        obj.status.last_operation = Some(LastOperation::new(
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            "done",
            Utc::now(),
        ));
        obj
    }

    #[test]
    fn test_healthy_object_passes() {
        assert_eq!(check_extension_object(&healthy()), Ok(()));
    }

    #[test]
    fn test_last_error_is_coded() {
        let mut obj = healthy();
        obj.status.last_error = Some(LastError {
            description: "quota".into(),
            codes: vec![ErrorCode::InfraQuotaExceeded],
            last_update_time: None,
        });

        let err = check_extension_object(&obj).unwrap_err();
        assert!(err.is_coded());
        assert_eq!(err.codes(), &[ErrorCode::InfraQuotaExceeded]);
        assert_eq!(err.to_string(), "error during reconciliation: quota");
    }

    #[test]
    fn test_check_order() {
        let mut obj = healthy();
        obj.metadata.generation = 3;
        obj.set_annotation(ANNOTATION_OPERATION, "reconcile");
        let err = check_extension_object(&obj).unwrap_err();
        assert!(err.to_string().contains("observed generation outdated (2/3)"));

        obj.status.observed_generation = 3;
        let err = check_extension_object(&obj).unwrap_err();
        assert!(err.to_string().contains("not yet picked up"));

        obj.metadata.annotations.clear();
        obj.status.last_operation = None;
        let err = check_extension_object(&obj).unwrap_err();
        assert!(!err.is_coded());
        assert!(err.to_string().contains("did not record a last operation"));
    }

    #[test]
    fn test_non_succeeded_state_fails() {
        let mut obj = healthy();
        if let Some(op) = obj.status.last_operation.as_mut() {
            op.state = LastOperationState::Processing;
        }
        let err = check_extension_object(&obj).unwrap_err();
        assert_eq!(err.to_string(), "extension state is not succeeded but Processing");
    }

    #[test]
    fn test_annotation_check_combined() {
        let check = and(
            has_annotation_with_value(ANNOTATION_TIMESTAMP, "t1".to_string()),
            check_extension_object,
        );

        let mut obj = healthy();
        assert!(check(&obj).unwrap_err().to_string().contains("missing"));

        obj.set_annotation(ANNOTATION_TIMESTAMP, "t0");
        assert!(check(&obj).unwrap_err().to_string().contains("\"t0\""));

        obj.set_annotation(ANNOTATION_TIMESTAMP, "t1");
        assert_eq!(check(&obj), Ok(()));
    }
}
