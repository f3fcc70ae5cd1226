//! Supporting types shared by the Keyway CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supported database engine families
///
/// The declared family selects the payload adapter used when talking to the
/// secrets backend (plugin name, connection tuning, role definition shape).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    /// PostgreSQL
    #[default]
    Postgres,
    /// MySQL / MariaDB
    Mysql,
    /// MongoDB
    Mongodb,
}

impl DatabaseEngine {
    /// All supported families, in a stable order
    pub const ALL: [DatabaseEngine; 3] = [
        DatabaseEngine::Postgres,
        DatabaseEngine::Mysql,
        DatabaseEngine::Mongodb,
    ];
}

impl std::str::FromStr for DatabaseEngine {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            _ => Err(crate::Error::validation(format!(
                "invalid database engine: {s}, expected one of: postgres, mysql, mongodb"
            ))),
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Mysql => write!(f, "mysql"),
            Self::Mongodb => write!(f, "mongodb"),
        }
    }
}

/// Reference to a Secret, optionally in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,

    /// Secret namespace (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    /// Resolve the namespace, falling back to the referencing object's
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(fallback)
    }
}

/// Reference to a secrets-backend endpoint and its bearer-credential source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    /// Backend address (e.g. "https://vault.example.com:8200")
    pub address: String,

    /// Secret holding the bearer token under the `token` key
    pub token_secret_ref: SecretRef,
}

/// Principal reference attached to an access grant
///
/// Opaque to the reconciliation core; forwarded verbatim into the
/// access-grant binding.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Subject kind (e.g. ServiceAccount, User, Group)
    pub kind: String,

    /// Subject name
    pub name: String,

    /// API group of the subject kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    /// Subject namespace (ServiceAccount subjects)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Lease metadata recorded on a DatabaseRoleBinding
///
/// Value type only; always embedded in the binding status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseData {
    /// Opaque lease identifier issued by the secrets backend
    #[serde(default)]
    pub id: String,

    /// Lease duration in seconds
    #[serde(default)]
    pub duration: i64,

    /// Unix timestamp of the last issue/renewal
    #[serde(default)]
    pub renew_deadline: i64,
}

impl LeaseData {
    /// True if no lease has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// Reconciliation phase shared by both CRDs
///
/// Serializes as the empty string until the first successful sync, matching
/// the wire format consumers key on.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// Not yet synchronized (wire value "")
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Fully synchronized at least once
    Success,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, ""),
            Self::Success => write!(f, "Success"),
        }
    }
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. Available)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Condition recording a failed reconcile step (`Available: False`)
    pub fn unavailable(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new("Available", ConditionStatus::False, reason, message)
    }
}
