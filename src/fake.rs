//! In-memory `Endpoints` store for network-free testing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use k8s_openapi::api::core::v1::Endpoints;
use tokio::sync::Mutex;

use crate::client::{ClientFactory, EndpointsClient};
use crate::{Error, Result};

const KIND: &str = "Endpoints";

/// A fake API client backed by a shared map.
///
/// Clones share the same store, so a test can hand one clone to the
/// reconciler as its [`ClientFactory`] and inspect the store through another.
/// Writes assign increasing `resourceVersion`s and an update carrying a stale
/// version fails with [`Error::Conflict`], like the API server.
#[derive(Clone, Default)]
pub struct FakeClient {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: Mutex<BTreeMap<(String, String), Endpoints>>,
    version: AtomicUsize,
    reads: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    unavailable: AtomicBool,
}

impl FakeClient {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object directly, bypassing the call counters.
    pub async fn seed(&self, namespace: &str, mut endpoints: Endpoints) {
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        endpoints.metadata.namespace = Some(namespace.to_string());
        endpoints.metadata.resource_version = Some(self.next_version());

        self.inner
            .objects
            .lock()
            .await
            .insert((namespace.to_string(), name), endpoints);
    }

    /// Returns a stored object without counting a read.
    pub async fn stored(&self, namespace: &str, name: &str) -> Option<Endpoints> {
        self.inner
            .objects
            .lock()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Makes every subsequent call fail with [`Error::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get` calls served.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Number of `create` calls served.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.inner.creates.load(Ordering::SeqCst)
    }

    /// Number of `update` calls served.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.inner.updates.load(Ordering::SeqCst)
    }

    /// Number of write calls served.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.creates() + self.updates()
    }

    fn next_version(&self) -> String {
        (self.inner.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("connection refused".into()));
        }

        Ok(())
    }
}

fn key(namespace: &str, endpoints: &Endpoints) -> (String, String) {
    (
        namespace.to_string(),
        endpoints.metadata.name.clone().unwrap_or_default(),
    )
}

impl EndpointsClient for FakeClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        Ok(self.stored(namespace, name).await)
    }

    async fn create(&self, namespace: &str, endpoints: &Endpoints) -> Result<Endpoints> {
        self.inner.creates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let key = key(namespace, endpoints);
        let mut objects = self.inner.objects.lock().await;
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: KIND,
                namespace: key.0,
                name: key.1,
            });
        }

        let mut created = endpoints.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(self.next_version());
        objects.insert(key, created.clone());

        Ok(created)
    }

    async fn update(&self, namespace: &str, endpoints: &Endpoints) -> Result<Endpoints> {
        self.inner.updates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let key = key(namespace, endpoints);
        let mut objects = self.inner.objects.lock().await;
        let Some(current) = objects.get(&key) else {
            return Err(Error::NotFound {
                kind: KIND,
                namespace: key.0,
                name: key.1,
            });
        };

        if let Some(version) = &endpoints.metadata.resource_version
            && current.metadata.resource_version.as_ref() != Some(version)
        {
            return Err(Error::Conflict {
                kind: KIND,
                namespace: key.0,
                name: key.1,
                message: format!("resourceVersion {version} is stale"),
            });
        }

        let mut updated = endpoints.clone();
        updated.metadata.namespace = Some(namespace.to_string());
        updated.metadata.resource_version = Some(self.next_version());
        objects.insert(key, updated.clone());

        Ok(updated)
    }
}

impl ClientFactory for FakeClient {
    type Client = FakeClient;

    async fn create(&self) -> Result<FakeClient> {
        Ok(self.clone())
    }
}
