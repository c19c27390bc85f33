use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Annotation carrying the operation a driver asks the owning agent to perform.
pub const ANNOTATION_OPERATION: &str = "gardener.cloud/operation";
/// Annotation carrying the time at which the driver triggered the operation.
pub const ANNOTATION_TIMESTAMP: &str = "gardener.cloud/timestamp";
/// Marker that must be present before an object may be deleted.
pub const ANNOTATION_CONFIRM_DELETION: &str = "confirmation.gardener.cloud/deletion";

pub const EXTENSIONS_API_VERSION: &str = "extensions.gardener.cloud/v1alpha1";
pub const EXTENSIONS_GROUP: &str = "extensions.gardener.cloud";
pub const EXTENSIONS_VERSION: &str = "v1alpha1";

/// The closed set of object kinds driven through the extension lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    BackupEntry,
    BackupUpload,
    BackupDownload,
    ContainerRuntime,
    ControlPlane,
    #[serde(rename = "DNSRecord")]
    DnsRecord,
    Extension,
    Infrastructure,
    Network,
    OperatingSystemConfig,
    Worker,
}

impl Kind {
    pub const ALL: [Kind; 11] = [
        Kind::BackupEntry,
        Kind::BackupUpload,
        Kind::BackupDownload,
        Kind::ContainerRuntime,
        Kind::ControlPlane,
        Kind::DnsRecord,
        Kind::Extension,
        Kind::Infrastructure,
        Kind::Network,
        Kind::OperatingSystemConfig,
        Kind::Worker,
    ];

    /// Kinds whose state is captured in a shoot state snapshot. The relay
    /// kinds are one-shot transfer channels and carry no state.
    pub const STATEFUL: [Kind; 9] = [
        Kind::BackupEntry,
        Kind::ContainerRuntime,
        Kind::ControlPlane,
        Kind::DnsRecord,
        Kind::Extension,
        Kind::Infrastructure,
        Kind::Network,
        Kind::OperatingSystemConfig,
        Kind::Worker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::BackupEntry => "BackupEntry",
            Kind::BackupUpload => "BackupUpload",
            Kind::BackupDownload => "BackupDownload",
            Kind::ContainerRuntime => "ContainerRuntime",
            Kind::ControlPlane => "ControlPlane",
            Kind::DnsRecord => "DNSRecord",
            Kind::Extension => "Extension",
            Kind::Infrastructure => "Infrastructure",
            Kind::Network => "Network",
            Kind::OperatingSystemConfig => "OperatingSystemConfig",
            Kind::Worker => "Worker",
        }
    }

    /// Lower-case plural resource name as served by the API server.
    pub fn plural(&self) -> String {
        format!("{}s", self.as_str().to_lowercase())
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown kind {s:?}"))
    }
}

/// Globally unique address of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Values of the operation annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Reconcile,
    Delete,
    Migrate,
    Restore,
    WaitForState,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Reconcile => "reconcile",
            Operation::Delete => "delete",
            Operation::Migrate => "migrate",
            Operation::Restore => "restore",
            Operation::WaitForState => "wait-for-state",
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile" => Ok(Operation::Reconcile),
            "delete" => Ok(Operation::Delete),
            "migrate" => Ok(Operation::Migrate),
            "restore" => Ok(Operation::Restore),
            "wait-for-state" => Ok(Operation::WaitForState),
            other => Err(format!("unknown operation {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    Error,
    Failed,
    Aborted,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    pub state: LastOperationState,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: i32,
}

impl LastOperation {
    pub fn new(
        type_: LastOperationType,
        state: LastOperationState,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_,
            state,
            description: description.into(),
            last_update_time: Some(now),
            progress: if state == LastOperationState::Succeeded { 100 } else { 0 },
        }
    }
}

/// Machine readable classification of an error reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_INFRA_UNAUTHENTICATED")]
    InfraUnauthenticated,
    #[serde(rename = "ERR_INFRA_UNAUTHORIZED")]
    InfraUnauthorized,
    #[serde(rename = "ERR_INFRA_INSUFFICIENT_PRIVILEGES")]
    InfraInsufficientPrivileges,
    #[serde(rename = "ERR_INFRA_QUOTA_EXCEEDED")]
    InfraQuotaExceeded,
    #[serde(rename = "ERR_INFRA_RATE_LIMITS_EXCEEDED")]
    InfraRateLimitsExceeded,
    #[serde(rename = "ERR_INFRA_DEPENDENCIES")]
    InfraDependencies,
    #[serde(rename = "ERR_RETRYABLE_INFRA_DEPENDENCIES")]
    RetryableInfraDependencies,
    #[serde(rename = "ERR_INFRA_RESOURCES_DEPLETED")]
    InfraResourcesDepleted,
    #[serde(rename = "ERR_CLEANUP_CLUSTER_RESOURCES")]
    CleanupClusterResources,
    #[serde(rename = "ERR_CONFIGURATION_PROBLEM")]
    ConfigurationProblem,
    #[serde(rename = "ERR_RETRYABLE_CONFIGURATION_PROBLEM")]
    RetryableConfigurationProblem,
    #[serde(rename = "ERR_PROBLEMATIC_WEBHOOK")]
    ProblematicWebhook,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Reference to an auxiliary object holding large or shared state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedResourceReference {
    pub name: String,
    pub resource_ref: CrossVersionObjectReference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Common spec fields plus the provider specific payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub data: Option<Vec<u8>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<NamedResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub data: Option<Vec<u8>>,
}

/// The generic unit under reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub kind: Kind,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ExtensionSpec,
    #[serde(default)]
    pub status: ExtensionStatus,
}

impl ManagedObject {
    /// A zero-valued object carrying only its address.
    pub fn new(key: &ObjectKey) -> Self {
        Self {
            kind: key.kind,
            metadata: Metadata {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                ..Default::default()
            },
            spec: ExtensionSpec::default(),
            status: ExtensionStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind, &self.metadata.namespace, &self.metadata.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.annotations.insert(key.to_string(), value.into());
    }

    /// The operation currently requested on the object, if any.
    pub fn operation(&self) -> Option<Operation> {
        self.annotation(ANNOTATION_OPERATION)
            .and_then(|op| op.parse().ok())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Derives the operation type an agent should report for its next run.
    pub fn compute_operation_type(&self) -> LastOperationType {
        match self.operation() {
            Some(Operation::Migrate) => return LastOperationType::Migrate,
            Some(Operation::Restore) => return LastOperationType::Restore,
            _ => {}
        }
        if self.is_deleting() {
            return LastOperationType::Delete;
        }
        match &self.status.last_operation {
            None => LastOperationType::Create,
            Some(op)
                if op.type_ == LastOperationType::Create
                    && op.state != LastOperationState::Succeeded =>
            {
                LastOperationType::Create
            }
            Some(_) => LastOperationType::Reconcile,
        }
    }
}

/// Serializes byte payloads as base64 strings, the encoding the API server
/// uses for binary fields.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
