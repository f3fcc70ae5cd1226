//! Per-family payload adapters
//!
//! The Role reconciler's state machine is family-agnostic; everything a
//! database family actually changes — plugin name, connection tuning, role
//! definition shape — is data built here, keyed off the declared
//! `DatabaseEngine` tag at construction time.

use serde_json::{json, Value};

use keyway_common::crd::{DatabaseEngine, DatabaseRoleSpec};

/// Backend plugin name for a database family
pub fn plugin_name(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::Postgres => "postgresql-database-plugin",
        DatabaseEngine::Mysql => "mysql-database-plugin",
        DatabaseEngine::Mongodb => "mongodb-database-plugin",
    }
}

/// Build the connection configuration payload for a DatabaseRole.
///
/// Engine-specific tuning from `spec.database.options` forms the base;
/// required fields (plugin, URL, resolved credentials, allowed roles) are
/// written last so spec options can never mask them.
pub fn connection_payload(
    spec: &DatabaseRoleSpec,
    backend_role_name: &str,
    username: &str,
    password: &str,
) -> Value {
    let mut payload = serde_json::Map::new();
    for (key, value) in &spec.database.options {
        payload.insert(key.clone(), value.clone());
    }

    let allowed_roles = if spec.database.allowed_roles.is_empty() {
        vec![backend_role_name.to_string()]
    } else {
        spec.database.allowed_roles.clone()
    };

    payload.insert("plugin_name".into(), json!(plugin_name(spec.engine)));
    payload.insert(
        "connection_url".into(),
        json!(spec.database.connection_url),
    );
    payload.insert("username".into(), json!(username));
    payload.insert("password".into(), json!(password));
    payload.insert("allowed_roles".into(), json!(allowed_roles));

    Value::Object(payload)
}

/// Build the role definition payload for a DatabaseRole.
///
/// The backend's create-role call fully replaces the prior definition, so
/// this payload is always the complete desired state.
pub fn role_payload(spec: &DatabaseRoleSpec) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("db_name".into(), json!(spec.db_name));
    payload.insert(
        "creation_statements".into(),
        json!(spec.creation_statements),
    );
    if !spec.revocation_statements.is_empty() {
        payload.insert(
            "revocation_statements".into(),
            json!(spec.revocation_statements),
        );
    }
    if let Some(ttl) = &spec.default_ttl {
        payload.insert("default_ttl".into(), json!(ttl));
    }
    if let Some(ttl) = &spec.max_ttl {
        payload.insert("max_ttl".into(), json!(ttl));
    }
    Value::Object(payload)
}
