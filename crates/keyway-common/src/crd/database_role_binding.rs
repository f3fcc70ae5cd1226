//! DatabaseRoleBinding CRD
//!
//! A DatabaseRoleBinding grants a set of subjects read access to a live
//! credential issued from a DatabaseRole. The controller materializes the
//! credential as a Secret and keeps the backing lease alive.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LeaseData, Phase, Subject};

/// DatabaseRoleBinding binds subjects to a credential derived from a
/// DatabaseRole in the same namespace.
///
/// Example:
/// ```yaml
/// apiVersion: keyway.dev/v1alpha1
/// kind: DatabaseRoleBinding
/// metadata:
///   name: app-readers
/// spec:
///   roleRef: app-readonly
///   subjects:
///     - kind: ServiceAccount
///       name: app
///   store:
///     secret: app-db-credentials
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keyway.dev",
    version = "v1alpha1",
    kind = "DatabaseRoleBinding",
    namespaced,
    status = "DatabaseRoleBindingStatus",
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.roleRef"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.store.secret"}"#,
    printcolumn = r#"{"name":"Lease","type":"string","jsonPath":".status.lease.id"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoleBindingSpec {
    /// Name of the DatabaseRole in the same namespace
    pub role_ref: String,

    /// Principals granted read access to the credential Secret
    #[serde(default)]
    pub subjects: Vec<Subject>,

    /// Where the issued credential is materialized
    pub store: CredentialStoreSpec,
}

/// Location of the materialized credential
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStoreSpec {
    /// Name of the Secret holding `username`/`password`/`lease_id`
    pub secret: String,
}

/// DatabaseRoleBinding status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoleBindingStatus {
    /// Metadata of the lease backing the materialized credential
    #[serde(default)]
    pub lease: LeaseData,

    /// Last spec generation successfully reconciled
    #[serde(default)]
    pub observed_generation: i64,

    /// Current phase ("" until the first full reconcile)
    #[serde(default)]
    pub phase: Phase,

    /// Failure conditions from the most recent reconcile
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DatabaseRoleBinding {
    /// Name used for both access-grant objects (role + binding)
    pub fn access_grant_name(&self) -> String {
        format!("{}-reader", self.metadata.name.as_deref().unwrap_or("unnamed"))
    }

    /// Lease currently recorded in status, if any
    pub fn lease(&self) -> Option<&LeaseData> {
        self.status
            .as_ref()
            .map(|s| &s.lease)
            .filter(|l| !l.is_empty())
    }
}
