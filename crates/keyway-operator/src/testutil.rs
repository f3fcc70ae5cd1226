//! Shared fixtures for reconciler tests

use keyway_common::crd::{
    CredentialStoreSpec, DatabaseConnection, DatabaseEngine, DatabaseRole, DatabaseRoleBinding,
    DatabaseRoleBindingSpec, DatabaseRoleSpec, ProviderRef, SecretRef, Subject,
};

/// A postgres DatabaseRole in `default`, generation 1, no status
pub fn sample_role() -> DatabaseRole {
    let mut role = DatabaseRole::new(
        "app-readonly",
        DatabaseRoleSpec {
            engine: DatabaseEngine::Postgres,
            provider: ProviderRef {
                address: "http://vault.example.com:8200".to_string(),
                token_secret_ref: SecretRef {
                    name: "vault-token".to_string(),
                    namespace: None,
                },
            },
            database: DatabaseConnection {
                connection_url: "postgresql://{{username}}:{{password}}@db:5432/app".to_string(),
                credentials_secret_ref: SecretRef {
                    name: "pg-root".to_string(),
                    namespace: None,
                },
                allowed_roles: vec![],
                options: Default::default(),
            },
            db_name: "app".to_string(),
            default_ttl: Some("1h".to_string()),
            max_ttl: Some("24h".to_string()),
            creation_statements: vec![
                r#"CREATE ROLE "{{name}}" WITH LOGIN PASSWORD '{{password}}';"#.to_string(),
            ],
            revocation_statements: vec![r#"DROP ROLE IF EXISTS "{{name}}";"#.to_string()],
        },
    );
    role.metadata.namespace = Some("default".to_string());
    role.metadata.generation = Some(1);
    role.metadata.uid = Some("role-uid-1".to_string());
    role.metadata.finalizers = Some(vec![keyway_common::ROLE_FINALIZER.to_string()]);
    role
}

/// A DatabaseRoleBinding in `default` referencing [`sample_role`],
/// generation 1, no status
pub fn sample_binding() -> DatabaseRoleBinding {
    let mut binding = DatabaseRoleBinding::new(
        "app-readers",
        DatabaseRoleBindingSpec {
            role_ref: "app-readonly".to_string(),
            subjects: vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: "app".to_string(),
                api_group: None,
                namespace: Some("default".to_string()),
            }],
            store: CredentialStoreSpec {
                secret: "app-db-credentials".to_string(),
            },
        },
    );
    binding.metadata.namespace = Some("default".to_string());
    binding.metadata.generation = Some(1);
    binding.metadata.uid = Some("binding-uid-1".to_string());
    binding.metadata.finalizers = Some(vec![keyway_common::BINDING_FINALIZER.to_string()]);
    binding
}
