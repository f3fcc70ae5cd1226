//! Vault HTTP implementation of the [`SecretsEngine`] capability set
//!
//! Thin adapter over the backend's REST API: every method is a single
//! request (plus the mount check), with no retry logic of its own —
//! callers own retry policy.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use url::Url;

use crate::{EngineError, IssuedCredential, SecretsEngine};

/// Default mount path for the database secrets engine
pub const DEFAULT_MOUNT: &str = "database";

/// HTTP client for a Vault-style dynamic-secrets backend.
///
/// Bound to one address, bearer token, and mount path.
pub struct VaultEngine {
    http: reqwest::Client,
    address: Url,
    token: String,
    mount: String,
}

impl VaultEngine {
    /// Create a client for the default `database` mount
    pub fn new(address: &str, token: impl Into<String>) -> Result<Self, EngineError> {
        Self::with_mount(address, token, DEFAULT_MOUNT)
    }

    /// Create a client bound to a specific mount path
    pub fn with_mount(
        address: &str,
        token: impl Into<String>,
        mount: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let address =
            Url::parse(address).map_err(|e| EngineError::Address(format!("{address}: {e}")))?;
        if address.cannot_be_a_base() {
            return Err(EngineError::Address(format!("{address}: not a base URL")));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            address,
            token: token.into(),
            mount: mount.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, EngineError> {
        self.address
            .join(&format!("v1/{path}"))
            .map_err(|e| EngineError::Address(format!("{path}: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, EngineError> {
        let url = self.url(path)?;
        let mut req = self
            .http
            .request(method, url)
            .header("X-Vault-Token", &self.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Map a non-success response into `EngineError::Api`
    async fn fail(path: &str, resp: Response) -> EngineError {
        let status = resp.status().as_u16();
        let message = match resp.json::<Value>().await {
            Ok(body) => error_message(&body),
            Err(_) => String::new(),
        };
        EngineError::Api {
            status,
            path: path.to_string(),
            message,
        }
    }

    async fn expect_success(path: &str, resp: Response) -> Result<(), EngineError> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::fail(path, resp).await)
        }
    }
}

#[async_trait]
impl SecretsEngine for VaultEngine {
    #[instrument(skip(self))]
    async fn enable_database_engine(&self) -> Result<(), EngineError> {
        // Check first so an already-enabled mount is a no-op; a failed
        // check aborts rather than blindly remounting.
        let resp = self.request(Method::GET, "sys/mounts", None).await?;
        if !resp.status().is_success() {
            return Err(Self::fail("sys/mounts", resp).await);
        }
        let mounts: Value = resp.json().await?;
        if mount_present(&mounts, &self.mount) {
            debug!(mount = %self.mount, "secrets engine already mounted");
            return Ok(());
        }

        let path = format!("sys/mounts/{}", self.mount);
        let resp = self
            .request(Method::POST, &path, Some(&json!({"type": "database"})))
            .await?;
        Self::expect_success(&path, resp).await
    }

    async fn write_connection_config(
        &self,
        name: &str,
        payload: &Value,
    ) -> Result<(), EngineError> {
        let path = format!("{}/config/{}", self.mount, name);
        let resp = self.request(Method::POST, &path, Some(payload)).await?;
        Self::expect_success(&path, resp).await
    }

    async fn create_role(&self, name: &str, payload: &Value) -> Result<(), EngineError> {
        let path = format!("{}/roles/{}", self.mount, name);
        let resp = self.request(Method::POST, &path, Some(payload)).await?;
        Self::expect_success(&path, resp).await
    }

    async fn delete_role(&self, name: &str) -> Result<(), EngineError> {
        let path = format!("{}/roles/{}", self.mount, name);
        let resp = self.request(Method::DELETE, &path, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(&path, resp).await
    }

    async fn issue_credential(&self, role: &str) -> Result<IssuedCredential, EngineError> {
        let path = format!("{}/creds/{}", self.mount, role);
        let resp = self.request(Method::GET, &path, None).await?;
        if !resp.status().is_success() {
            return Err(Self::fail(&path, resp).await);
        }
        let body: Value = resp.json().await?;
        parse_credential(&path, &body)
    }

    async fn renew_lease(&self, lease_id: &str) -> Result<(), EngineError> {
        let resp = self
            .request(
                Method::PUT,
                "sys/leases/renew",
                Some(&json!({"lease_id": lease_id})),
            )
            .await?;
        Self::expect_success("sys/leases/renew", resp).await
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<(), EngineError> {
        let resp = self
            .request(
                Method::PUT,
                "sys/leases/revoke",
                Some(&json!({"lease_id": lease_id})),
            )
            .await?;
        Self::expect_success("sys/leases/revoke", resp).await
    }

    async fn is_lease_expired(&self, lease_id: &str) -> Result<bool, EngineError> {
        let resp = self
            .request(
                Method::PUT,
                "sys/leases/lookup",
                Some(&json!({"lease_id": lease_id})),
            )
            .await?;
        // The backend answers 400 (invalid lease) for expired or revoked
        // leases; anything else non-success is a real failure.
        let status = resp.status();
        if status.is_success() {
            Ok(false)
        } else if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            Ok(true)
        } else {
            Err(Self::fail("sys/leases/lookup", resp).await)
        }
    }
}

/// True if `sys/mounts` output lists the given mount
fn mount_present(mounts: &Value, mount: &str) -> bool {
    let key = format!("{mount}/");
    // Newer backends nest mounts under "data"; older ones are flat.
    mounts
        .get("data")
        .and_then(|d| d.get(&key))
        .or_else(|| mounts.get(&key))
        .is_some()
}

/// Extract a human-readable message from a backend error body
fn error_message(body: &Value) -> String {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default()
}

/// Parse a credential response body
fn parse_credential(path: &str, body: &Value) -> Result<IssuedCredential, EngineError> {
    let missing = |field: &str| EngineError::Response {
        path: path.to_string(),
        message: format!("missing field `{field}`"),
    };

    let lease_id = body
        .get("lease_id")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("lease_id"))?;
    let lease_duration = body
        .get("lease_duration")
        .and_then(Value::as_i64)
        .ok_or_else(|| missing("lease_duration"))?;
    let renewable = body
        .get("renewable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let data = body.get("data").ok_or_else(|| missing("data"))?;
    let username = data
        .get("username")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("data.username"))?;
    let password = data
        .get("password")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("data.password"))?;

    Ok(IssuedCredential {
        lease_id: lease_id.to_string(),
        lease_duration,
        renewable,
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credential_response() {
        let body = json!({
            "lease_id": "database/creds/app/h9yX",
            "lease_duration": 300,
            "renewable": true,
            "data": {
                "username": "v-app-h9yX",
                "password": "s3cr3t"
            }
        });
        let cred = parse_credential("database/creds/app", &body).expect("parse");
        assert_eq!(cred.lease_id, "database/creds/app/h9yX");
        assert_eq!(cred.lease_duration, 300);
        assert!(cred.renewable);
        assert_eq!(cred.username, "v-app-h9yX");
        assert_eq!(cred.password, "s3cr3t");
    }

    #[test]
    fn credential_parse_reports_missing_fields() {
        let body = json!({"lease_id": "x", "lease_duration": 300, "data": {}});
        let err = parse_credential("database/creds/app", &body).unwrap_err();
        assert!(err.to_string().contains("data.username"));
    }

    #[test]
    fn detects_mount_in_flat_and_nested_listings() {
        let flat = json!({"database/": {"type": "database"}, "secret/": {"type": "kv"}});
        assert!(mount_present(&flat, "database"));
        assert!(!mount_present(&flat, "mysql"));

        let nested = json!({"data": {"database/": {"type": "database"}}});
        assert!(mount_present(&nested, "database"));
    }

    #[test]
    fn joins_error_messages() {
        let body = json!({"errors": ["permission denied", "role not found"]});
        assert_eq!(error_message(&body), "permission denied; role not found");
        assert_eq!(error_message(&json!({})), "");
    }

    #[test]
    fn rejects_unparseable_address() {
        assert!(VaultEngine::new("not a url", "tok").is_err());
        assert!(VaultEngine::new("https://vault.example.com:8200", "tok").is_ok());
    }
}
