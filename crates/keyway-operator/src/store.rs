//! Kubernetes access for the reconcilers
//!
//! Two trait seams, mocked in tests and backed by kube-rs in production:
//! [`KubeClient`] for reading/patching the Keyway CRDs and Secrets, and
//! [`CredentialStore`] for materializing issued credentials (Secret plus
//! the access-grant role/binding pair).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{
    PolicyRule, Role as AccessRole, RoleBinding as AccessRoleBinding, RoleRef as AccessRoleRef,
    Subject as AccessSubject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keyway_common::crd::{
    DatabaseRole, DatabaseRoleBinding, DatabaseRoleBindingStatus, DatabaseRoleStatus, Subject,
};
use keyway_common::{
    Error, Result, FIELD_MANAGER, SECRET_KEY_LEASE_ID, SECRET_KEY_PASSWORD, SECRET_KEY_USERNAME,
};
use keyway_vault::IssuedCredential;

/// Kubernetes operations used by the reconcilers, finalizer targets, and
/// the renewal sweep
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a DatabaseRole, None if it does not exist
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<DatabaseRole>>;

    /// Get a DatabaseRoleBinding, None if it does not exist
    async fn get_binding(&self, namespace: &str, name: &str)
        -> Result<Option<DatabaseRoleBinding>>;

    /// List all DatabaseRoleBindings cluster-wide
    async fn list_bindings(&self) -> Result<Vec<DatabaseRoleBinding>>;

    /// Get a Secret, None if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Replace a DatabaseRole's status via merge patch
    async fn patch_role_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseRoleStatus,
    ) -> Result<()>;

    /// Replace a DatabaseRoleBinding's status via merge patch
    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseRoleBindingStatus,
    ) -> Result<()>;

    /// Add a finalizer token to a DatabaseRole (no-op if present)
    async fn add_role_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer token from a DatabaseRole (no-op if absent)
    async fn remove_role_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Add a finalizer token to a DatabaseRoleBinding (no-op if present)
    async fn add_binding_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Remove a finalizer token from a DatabaseRoleBinding (no-op if absent)
    async fn remove_binding_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;
}

/// Persistence of issued credentials and their access grants
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create or overwrite the credential Secret
    /// (`username`/`password`/`lease_id` keys), owner-referenced for
    /// cascade deletion
    async fn create_credential_secret(
        &self,
        namespace: &str,
        name: &str,
        credential: &IssuedCredential,
        owner: &OwnerReference,
    ) -> Result<()>;

    /// Create the access role granting read-only access to the named
    /// Secret; pre-existing role is treated as success
    async fn create_access_role(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        owner: &OwnerReference,
    ) -> Result<()>;

    /// Create the access grant binding subjects to the access role;
    /// pre-existing grant is treated as success (no implicit update)
    async fn create_access_grant(
        &self,
        namespace: &str,
        name: &str,
        role_name: &str,
        subjects: &[Subject],
        owner: &OwnerReference,
    ) -> Result<()>;

    /// Replace the subjects of an existing access grant (explicit subject
    /// changes only; never invoked from the base reconcile flow)
    async fn update_access_grant(
        &self,
        namespace: &str,
        name: &str,
        subjects: &[Subject],
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<DatabaseRole>> {
        let api: Api<DatabaseRole> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(role) => Ok(Some(role)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DatabaseRoleBinding>> {
        let api: Api<DatabaseRoleBinding> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(binding) => Ok(Some(binding)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_bindings(&self) -> Result<Vec<DatabaseRoleBinding>> {
        let api: Api<DatabaseRoleBinding> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_role_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseRoleStatus,
    ) -> Result<()> {
        let api: Api<DatabaseRole> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseRoleBindingStatus,
    ) -> Result<()> {
        let api: Api<DatabaseRoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_role_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let api: Api<DatabaseRole> = Api::namespaced(self.client.clone(), namespace);
        let role = api.get(name).await?;
        add_finalizer_via(&api, name, role.metadata.finalizers, finalizer).await
    }

    async fn remove_role_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api: Api<DatabaseRole> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(role) => remove_finalizer_via(&api, name, role.metadata.finalizers, finalizer).await,
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_binding_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api: Api<DatabaseRoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let binding = api.get(name).await?;
        add_finalizer_via(&api, name, binding.metadata.finalizers, finalizer).await
    }

    async fn remove_binding_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api: Api<DatabaseRoleBinding> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(binding) => {
                remove_finalizer_via(&api, name, binding.metadata.finalizers, finalizer).await
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn add_finalizer_via<K>(
    api: &Api<K>,
    name: &str,
    current: Option<Vec<String>>,
    finalizer: &str,
) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let mut finalizers = current.unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({
        "metadata": { "finalizers": finalizers }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(object = %name, finalizer = %finalizer, "finalizer added");
    Ok(())
}

async fn remove_finalizer_via<K>(
    api: &Api<K>,
    name: &str,
    current: Option<Vec<String>>,
    finalizer: &str,
) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let Some(existing) = current else {
        return Ok(());
    };
    if !existing.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = existing.into_iter().filter(|f| f != finalizer).collect();

    let patch = serde_json::json!({
        "metadata": { "finalizers": finalizers }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(object = %name, finalizer = %finalizer, "finalizer removed");
    Ok(())
}

/// Real credential store backed by the cluster
pub struct CredentialStoreImpl {
    client: Client,
}

impl CredentialStoreImpl {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialStore for CredentialStoreImpl {
    async fn create_credential_secret(
        &self,
        namespace: &str,
        name: &str,
        credential: &IssuedCredential,
        owner: &OwnerReference,
    ) -> Result<()> {
        // Server-side apply so a reissued credential overwrites the
        // previous material in place.
        let secret = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "ownerReferences": [owner],
            },
            "type": "Opaque",
            "stringData": {
                (SECRET_KEY_USERNAME): credential.username,
                (SECRET_KEY_PASSWORD): credential.password,
                (SECRET_KEY_LEASE_ID): credential.lease_id,
            }
        });

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&secret)).await?;
        debug!(secret = %name, namespace = %namespace, "credential secret applied");
        Ok(())
    }

    async fn create_access_role(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        owner: &OwnerReference,
    ) -> Result<()> {
        let role = AccessRole {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["secrets".to_string()]),
                resource_names: Some(vec![secret_name.to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            }]),
        };

        let api: Api<AccessRole> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &role).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_access_grant(
        &self,
        namespace: &str,
        name: &str,
        role_name: &str,
        subjects: &[Subject],
        owner: &OwnerReference,
    ) -> Result<()> {
        let grant = AccessRoleBinding {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            role_ref: AccessRoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role_name.to_string(),
            },
            subjects: Some(subjects.iter().map(to_access_subject).collect()),
        };

        let api: Api<AccessRoleBinding> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &grant).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_access_grant(
        &self,
        namespace: &str,
        name: &str,
        subjects: &[Subject],
    ) -> Result<()> {
        let api: Api<AccessRoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let mut grant = api.get(name).await?;
        grant.subjects = Some(subjects.iter().map(to_access_subject).collect());
        api.replace(name, &PostParams::default(), &grant).await?;
        Ok(())
    }
}

fn to_access_subject(subject: &Subject) -> AccessSubject {
    AccessSubject {
        kind: subject.kind.clone(),
        name: subject.name.clone(),
        api_group: subject.api_group.clone(),
        namespace: subject.namespace.clone(),
    }
}

/// Owner reference pointing at a DatabaseRoleBinding.
///
/// Errors if the object has no UID yet (never persisted), since a grant
/// without a valid owner would survive its binding.
pub fn binding_owner_ref(binding: &DatabaseRoleBinding) -> Result<OwnerReference> {
    let uid = binding.metadata.uid.clone().ok_or_else(|| {
        Error::internal_with_context("store", "DatabaseRoleBinding has no uid; cannot own objects")
    })?;
    Ok(OwnerReference {
        api_version: "keyway.dev/v1alpha1".to_string(),
        kind: "DatabaseRoleBinding".to_string(),
        name: binding.metadata.name.clone().unwrap_or_default(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Extract the lease id recorded in a credential Secret, if any
pub fn lease_id_from_secret(secret: &Secret) -> Option<String> {
    if let Some(data) = &secret.data {
        if let Some(bytes) = data.get(SECRET_KEY_LEASE_ID) {
            return String::from_utf8(bytes.0.clone()).ok();
        }
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(SECRET_KEY_LEASE_ID))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn lease_id_read_from_binary_data() {
        let mut data = BTreeMap::new();
        data.insert(
            SECRET_KEY_LEASE_ID.to_string(),
            ByteString(b"database/creds/app/x1".to_vec()),
        );
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        assert_eq!(
            lease_id_from_secret(&secret).as_deref(),
            Some("database/creds/app/x1")
        );
    }

    #[test]
    fn lease_id_falls_back_to_string_data() {
        let mut string_data = BTreeMap::new();
        string_data.insert(SECRET_KEY_LEASE_ID.to_string(), "lease-9".to_string());
        let secret = Secret {
            string_data: Some(string_data),
            ..Default::default()
        };
        assert_eq!(lease_id_from_secret(&secret).as_deref(), Some("lease-9"));
    }

    #[test]
    fn lease_id_absent_when_secret_has_no_entry() {
        assert_eq!(lease_id_from_secret(&Secret::default()), None);
    }

    #[test]
    fn owner_ref_requires_uid() {
        let mut binding = DatabaseRoleBinding::new(
            "app-readers",
            keyway_common::crd::DatabaseRoleBindingSpec {
                role_ref: "app-readonly".to_string(),
                subjects: vec![],
                store: keyway_common::crd::CredentialStoreSpec {
                    secret: "app-db-credentials".to_string(),
                },
            },
        );
        assert!(binding_owner_ref(&binding).is_err());

        binding.metadata.uid = Some("d6c8f9".to_string());
        let owner = binding_owner_ref(&binding).expect("owner ref");
        assert_eq!(owner.kind, "DatabaseRoleBinding");
        assert_eq!(owner.name, "app-readers");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn access_subject_mapping_preserves_fields() {
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: "app".to_string(),
            api_group: None,
            namespace: Some("default".to_string()),
        };
        let mapped = to_access_subject(&subject);
        assert_eq!(mapped.kind, "ServiceAccount");
        assert_eq!(mapped.namespace.as_deref(), Some("default"));
    }
}
