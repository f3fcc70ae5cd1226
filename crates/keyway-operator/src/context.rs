//! Controller context and configuration
//!
//! A single dependency-injected context is constructed at startup and
//! passed by reference to every reconciler, finalization task, and renewal
//! sweep — no package-level globals. Tests override the trait objects with
//! mocks through the builder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use keyway_common::crd::ProviderRef;
use keyway_common::{Error, Result};
use keyway_vault::{SecretsEngine, VaultEngine};

use crate::finalizer::FinalizerCoordinator;
use crate::store::{CredentialStore, CredentialStoreImpl, KubeClient, KubeClientImpl};

/// Secret key holding the backend bearer token
const TOKEN_KEY: &str = "token";

/// Tunables for the controller; worker counts and retry ceilings are
/// configuration, not architecture
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Workers per resource-kind queue
    pub workers: usize,
    /// Reconcile retries before a key is dropped
    pub max_retries: u32,
    /// Absolute bound on one finalization attempt
    pub finalizer_timeout: Duration,
    /// Delay between finalization cleanup attempts
    pub finalizer_poll_interval: Duration,
    /// Delay between lease-renewal sweeps
    pub renewal_interval: Duration,
    /// Extra renewal margin on top of the sweep interval
    pub renewal_safety_margin: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 5,
            finalizer_timeout: Duration::from_secs(120),
            finalizer_poll_interval: Duration::from_secs(5),
            renewal_interval: Duration::from_secs(60),
            renewal_safety_margin: Duration::from_secs(10),
        }
    }
}

/// Builds a [`SecretsEngine`] for a provider reference.
///
/// Resolving the bearer token and constructing the client can fail; such
/// failures are local to the reconcile attempt that needed the engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Connect to the backend named by `provider`, resolving its token
    /// Secret relative to `namespace`
    async fn connect(
        &self,
        namespace: &str,
        provider: &ProviderRef,
    ) -> Result<Arc<dyn SecretsEngine>>;
}

/// Factory producing [`VaultEngine`] clients
pub struct VaultEngineFactory {
    kube: Arc<dyn KubeClient>,
}

impl VaultEngineFactory {
    /// Create a factory resolving token Secrets through the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl EngineFactory for VaultEngineFactory {
    async fn connect(
        &self,
        namespace: &str,
        provider: &ProviderRef,
    ) -> Result<Arc<dyn SecretsEngine>> {
        let token_ref = &provider.token_secret_ref;
        let token_ns = token_ref.namespace_or(namespace);
        let secret = self
            .kube
            .get_secret(token_ns, &token_ref.name)
            .await?
            .ok_or_else(|| {
                Error::validation_for_field(
                    format!("{token_ns}/{}", token_ref.name),
                    "spec.provider.tokenSecretRef",
                    "token secret not found",
                )
            })?;

        let token = secret
            .data
            .as_ref()
            .and_then(|d| d.get(TOKEN_KEY))
            .and_then(|b| String::from_utf8(b.0.clone()).ok())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|d| d.get(TOKEN_KEY))
                    .cloned()
            })
            .ok_or_else(|| {
                Error::validation_for(
                    format!("{token_ns}/{}", token_ref.name),
                    format!("token secret has no `{TOKEN_KEY}` key"),
                )
            })?;

        let engine = VaultEngine::new(&provider.address, token)
            .map_err(|e| Error::validation_for(&provider.address, e.to_string()))?;
        Ok(Arc::new(engine))
    }
}

/// Shared dependencies threaded through all reconcile paths
pub struct Context {
    /// Kubernetes reads and status/finalizer writes
    pub kube: Arc<dyn KubeClient>,
    /// Credential Secret and access-grant persistence
    pub store: Arc<dyn CredentialStore>,
    /// Backend client construction per provider reference
    pub engines: Arc<dyn EngineFactory>,
    /// Deduplicating coordinator for asynchronous cleanup tasks
    pub finalizers: Arc<FinalizerCoordinator>,
    /// Controller tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Start building a Context from a kube Client
    pub fn builder(client: Client, config: ControllerConfig) -> ContextBuilder {
        ContextBuilder {
            client,
            config,
            kube: None,
            store: None,
            engines: None,
        }
    }
}

/// Builder for [`Context`]; overrides exist primarily for testing
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    kube: Option<Arc<dyn KubeClient>>,
    store: Option<Arc<dyn CredentialStore>>,
    engines: Option<Arc<dyn EngineFactory>>,
}

impl ContextBuilder {
    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the credential store (primarily for testing)
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the engine factory (primarily for testing)
    pub fn engine_factory(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let finalizers = FinalizerCoordinator::new(
            self.config.finalizer_poll_interval,
            self.config.finalizer_timeout,
        );
        Context {
            engines: self
                .engines
                .unwrap_or_else(|| Arc::new(VaultEngineFactory::new(kube.clone()))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(CredentialStoreImpl::new(self.client.clone()))),
            kube,
            finalizers,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    use keyway_common::crd::SecretRef;

    use crate::store::MockKubeClient;

    fn provider() -> ProviderRef {
        ProviderRef {
            address: "http://vault.example.com:8200".to_string(),
            token_secret_ref: SecretRef {
                name: "vault-token".to_string(),
                namespace: None,
            },
        }
    }

    #[tokio::test]
    async fn factory_resolves_token_from_secret_data() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .withf(|ns, name| ns == "default" && name == "vault-token")
            .returning(|_, _| {
                let mut data = BTreeMap::new();
                data.insert("token".to_string(), ByteString(b"s.abcdef".to_vec()));
                Ok(Some(Secret {
                    data: Some(data),
                    ..Default::default()
                }))
            });

        let factory = VaultEngineFactory::new(Arc::new(kube));
        factory
            .connect("default", &provider())
            .await
            .expect("engine built");
    }

    #[tokio::test]
    async fn factory_fails_when_token_secret_missing() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));

        let factory = VaultEngineFactory::new(Arc::new(kube));
        let err = factory.connect("default", &provider()).await.err().unwrap();
        assert!(err.to_string().contains("token secret not found"));
        assert!(!err.is_retryable(), "spec error until the secret appears");
    }

    #[tokio::test]
    async fn factory_fails_when_token_key_absent() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(Secret::default())));

        let factory = VaultEngineFactory::new(Arc::new(kube));
        let err = factory.connect("default", &provider()).await.err().unwrap();
        assert!(err.to_string().contains("no `token` key"));
    }
}
