//! Kubernetes API access used by the reconciler.
//!
//! The reconciler never talks to `kube` directly. It asks a [`ClientFactory`]
//! for a handle at the start of every cycle and issues get/create/update calls
//! through [`EndpointsClient`]. The production factory hands out
//! [`kube::Client`] handles; tests use [`FakeClient`](crate::fake::FakeClient).

use std::future::Future;

use k8s_openapi::api::core::v1::Endpoints;
use kube::api::PostParams;
use kube::{Api, Client, Config};

use crate::{Error, Result};

/// The subset of the Kubernetes API the reconciler needs.
pub trait EndpointsClient: Send + Sync {
    /// Fetches an `Endpoints` object. Absence is `Ok(None)`.
    fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Endpoints>>> + Send;

    /// Creates an `Endpoints` object.
    fn create(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> impl Future<Output = Result<Endpoints>> + Send;

    /// Replaces an existing `Endpoints` object.
    ///
    /// The `resourceVersion` carried in the object's metadata guards against
    /// overwriting changes made since it was read.
    fn update(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> impl Future<Output = Result<Endpoints>> + Send;
}

/// Produces API client handles.
pub trait ClientFactory: Send + Sync + 'static {
    /// The handle type.
    type Client: EndpointsClient;

    /// Builds a handle.
    ///
    /// Failures are reported as [`Error::ClientConstruction`].
    fn create(&self) -> impl Future<Output = Result<Self::Client>> + Send;
}

impl EndpointsClient for Client {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, endpoints: &Endpoints) -> Result<Endpoints> {
        let api: Api<Endpoints> = Api::namespaced(self.clone(), namespace);
        Ok(api.create(&PostParams::default(), endpoints).await?)
    }

    async fn update(&self, namespace: &str, endpoints: &Endpoints) -> Result<Endpoints> {
        let name = endpoints
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("endpoints without a name".into()))?;

        let api: Api<Endpoints> = Api::namespaced(self.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), endpoints).await?)
    }
}

/// Factory building [`kube::Client`] handles.
///
/// Without an explicit configuration the client is inferred from the
/// environment (in-cluster service account, then kubeconfig).
#[derive(Clone, Default)]
pub struct KubeClientFactory {
    config: Option<Config>,
}

impl KubeClientFactory {
    /// Creates a factory inferring its configuration from the environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory using an explicit client configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config: Some(config),
        }
    }
}

impl ClientFactory for KubeClientFactory {
    type Client = Client;

    async fn create(&self) -> Result<Client> {
        let client = match &self.config {
            Some(config) => Client::try_from(config.clone()),
            None => Client::try_default().await,
        };

        client.map_err(|e| Error::ClientConstruction(Box::new(e)))
    }
}
