//! Reconciliation of the `kubernetes` service endpoints.
//!
//! # How It Works
//!
//! 1. Every interval the background task asks the leadership gate whether
//!    this instance is the leader. Non-leaders do nothing at all.
//! 2. The leader resolves the desired addresses and fetches the current
//!    `Endpoints` object.
//! 3. A missing object is created. An object whose first subset already
//!    lists the desired addresses on the target port is left alone. Anything else is updated in
//!    place, keeping the metadata (annotations, labels, `resourceVersion`) that
//!    other actors own and replacing only the subsets.
//! 4. A failed cycle is logged and retried on the next tick.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{EndpointPort, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::address::{AddressResolver, Addresses, Resolver};
use crate::client::{ClientFactory, EndpointsClient};
use crate::config::{API_PORT_PROTOCOL, ApiConfig, ApiPort, Target};
use crate::leader::LeaderElector;
use crate::{Error, Result};

/// What a single reconciliation cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// This instance is not the leader; nothing was read or written.
    NotLeader,
    /// The object did not exist and was created.
    Created,
    /// The object listed different addresses and was updated.
    Updated,
    /// The object already listed the desired addresses.
    Unchanged,
}

/// Keeps the `kubernetes` service `Endpoints` pointed at the external API
/// address while this instance holds leadership.
pub struct EndpointReconciler<E, F, R = Resolver> {
    inner: Arc<Inner<E, F, R>>,
    state: State,
}

struct Inner<E, F, R> {
    config: ApiConfig,
    elector: E,
    factory: F,
    resolver: R,
}

enum State {
    Uninitialized,
    Initialized(CancellationToken),
    Running {
        cancel: CancellationToken,
        task: JoinHandle<()>,
        last_tick: watch::Receiver<Instant>,
    },
    Stopped,
}

impl<E, F> EndpointReconciler<E, F, Resolver>
where
    E: LeaderElector,
    F: ClientFactory,
{
    /// Creates a reconciler resolving the addresses from `config`.
    #[must_use]
    pub fn new(config: ApiConfig, elector: E, factory: F) -> Self {
        let resolver = Resolver::from_config(&config);
        Self::with_resolver(config, elector, factory, resolver)
    }
}

impl<E, F, R> EndpointReconciler<E, F, R>
where
    E: LeaderElector,
    F: ClientFactory,
    R: AddressResolver,
{
    /// Creates a reconciler with a custom address resolver.
    #[must_use]
    pub fn with_resolver(config: ApiConfig, elector: E, factory: F, resolver: R) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                elector,
                factory,
                resolver,
            }),
            state: State::Uninitialized,
        }
    }

    /// Validates the configuration and prepares the background task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for configuration that can never
    /// work, or a lifecycle error if called twice or after [`stop`](Self::stop).
    pub fn init(&mut self) -> Result<()> {
        match self.state {
            State::Uninitialized => {}
            State::Stopped => return Err(Error::Stopped),
            _ => return Err(Error::AlreadyRunning),
        }

        self.inner.config.validate()?;
        self.state = State::Initialized(CancellationToken::new());
        Ok(())
    }

    /// Starts reconciling every configured interval in a background task.
    ///
    /// # Errors
    ///
    /// Fails if not initialized, already running or stopped, or when called
    /// outside a tokio runtime.
    pub fn run(&mut self) -> Result<()> {
        let cancel = match &self.state {
            State::Initialized(cancel) => cancel.clone(),
            State::Uninitialized => return Err(Error::NotInitialized),
            State::Running { .. } => return Err(Error::AlreadyRunning),
            State::Stopped => return Err(Error::Stopped),
        };

        let handle = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        // the run start counts as the first tick
        let (tick_tx, last_tick) = watch::channel(Instant::now());
        let task = handle.spawn(reconcile_loop(self.inner.clone(), cancel.clone(), tick_tx));

        info!(
            interval = ?self.inner.config.interval,
            "started API endpoint reconciler for {}/{}",
            self.inner.config.target.namespace,
            self.inner.config.target.name
        );

        self.state = State::Running {
            cancel,
            task,
            last_tick,
        };
        Ok(())
    }

    /// Stops the background task.
    ///
    /// A cycle already in flight completes on its own; no further cycle
    /// starts. Stopping twice is harmless.
    ///
    /// # Errors
    ///
    /// Never fails today.
    pub async fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running { cancel, task, .. } => {
                cancel.cancel();
                if let Err(e) = task.await {
                    error!("API endpoint reconciler task failed: {e}");
                }

                info!("stopped API endpoint reconciler");
            }
            State::Initialized(cancel) => cancel.cancel(),
            State::Uninitialized | State::Stopped => {}
        }

        Ok(())
    }

    /// Reports whether the background task is alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] outside the running state and
    /// [`Error::Unhealthy`] when no cycle completed within the staleness window.
    pub fn healthy(&self) -> Result<()> {
        let State::Running {
            task, last_tick, ..
        } = &self.state
        else {
            return Err(Error::NotRunning);
        };

        if task.is_finished() {
            return Err(Error::NotRunning);
        }

        let elapsed = last_tick.borrow().elapsed();
        if elapsed > self.inner.config.staleness() {
            return Err(Error::Unhealthy(elapsed));
        }

        Ok(())
    }

    /// Returns true while the background task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(&self.state, State::Running { task, .. } if !task.is_finished())
    }

    /// The configuration this reconciler was built with.
    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    /// Runs a single reconciliation cycle.
    ///
    /// # Errors
    ///
    /// Surfaces resolution, client construction and API failures. Nothing is
    /// retried here; the background task tries again on its next tick.
    pub async fn reconcile_endpoints(&self) -> Result<Outcome> {
        self.inner.reconcile_endpoints().await
    }
}

impl<E, F, R> Inner<E, F, R>
where
    E: LeaderElector,
    F: ClientFactory,
    R: AddressResolver,
{
    async fn reconcile_endpoints(&self) -> Result<Outcome> {
        if !self.elector.is_leader() {
            debug!("not the leader, not reconciling API endpoints");
            return Ok(Outcome::NotLeader);
        }

        let desired = self.resolver.resolve().await?;
        if desired.is_empty() {
            return Err(Error::NoAddresses("resolver".into()));
        }

        let target = &self.config.target;
        let client = self.factory.create().await?;

        let Some(mut current) = client.get(&target.namespace, &target.name).await? else {
            client
                .create(&target.namespace, &desired_endpoints(target, &desired))
                .await?;

            info!(
                "created endpoints {}/{} with addresses {:?}",
                target.namespace,
                target.name,
                desired.to_strings()
            );
            return Ok(Outcome::Created);
        };

        if !needs_update(&current, target, &desired) {
            debug!("endpoints {}/{} up to date", target.namespace, target.name);
            return Ok(Outcome::Unchanged);
        }

        current.subsets = Some(vec![desired_subset(target, &desired)]);
        client.update(&target.namespace, &current).await?;

        info!(
            "updated endpoints {}/{} with addresses {:?}",
            target.namespace,
            target.name,
            desired.to_strings()
        );
        Ok(Outcome::Updated)
    }
}

/// Background task driving one reconciliation cycle per tick.
async fn reconcile_loop<E, F, R>(
    inner: Arc<Inner<E, F, R>>,
    cancel: CancellationToken,
    last_tick: watch::Sender<Instant>,
) where
    E: LeaderElector,
    F: ClientFactory,
    R: AddressResolver,
{
    let mut ticker = tokio::time::interval(inner.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match inner.reconcile_endpoints().await {
            Ok(outcome) => debug!(?outcome, "API endpoint reconciliation done"),
            Err(e) if e.is_transient() => {
                warn!("external API address reconciliation failed: {e}");
            }
            Err(e) => error!("external API address reconciliation failed: {e}"),
        }

        last_tick.send_replace(Instant::now());
    }

    debug!("API endpoint reconciler loop exited");
}

/// The subset advertising `addresses` on the target's API port.
fn desired_subset(target: &Target, addresses: &Addresses) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(addresses.to_endpoint_addresses()),
        ports: Some(vec![EndpointPort {
            name: Some(target.port.name.clone()),
            port: i32::from(target.port.port),
            protocol: Some(target.port.protocol.clone()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn desired_endpoints(target: &Target, addresses: &Addresses) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(target.name.clone()),
            namespace: Some(target.namespace.clone()),
            ..Default::default()
        },
        subsets: Some(vec![desired_subset(target, addresses)]),
    }
}

/// Compares the first subset with the desired addresses and port.
///
/// A subset that carries no ports is judged on its addresses alone.
fn needs_update(current: &Endpoints, target: &Target, desired: &Addresses) -> bool {
    let Some(subset) = current.subsets.as_deref().and_then(<[_]>::first) else {
        return true;
    };

    if !desired.matches(subset.addresses.as_deref().unwrap_or_default()) {
        return true;
    }

    match subset.ports.as_deref() {
        None | Some([]) => false,
        Some([port]) => !port_matches(port, &target.port),
        Some(_) => true,
    }
}

fn port_matches(current: &EndpointPort, want: &ApiPort) -> bool {
    current.port == i32::from(want.port)
        && current.name.as_deref().unwrap_or_default() == want.name
        && current.protocol.as_deref().unwrap_or(API_PORT_PROTOCOL) == want.protocol
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use k8s_openapi::api::core::v1::EndpointAddress;

    use super::*;
    use crate::config::ENDPOINTS_NAMESPACE;
    use crate::fake::FakeClient;
    use crate::leader::{AlwaysLeader, NeverLeader};

    const EXPECTED_ADDRESSES: [&str; 4] = [
        "185.199.108.153",
        "185.199.109.153",
        "185.199.110.153",
        "185.199.111.153",
    ];

    fn config() -> ApiConfig {
        ApiConfig::new("1.2.3.4").external_address("api.example.com")
    }

    fn expected() -> Addresses {
        Addresses::parse(EXPECTED_ADDRESSES).unwrap()
    }

    fn reconciler<E: LeaderElector>(
        elector: E,
        fake: &FakeClient,
    ) -> EndpointReconciler<E, FakeClient> {
        EndpointReconciler::with_resolver(
            config(),
            elector,
            fake.clone(),
            Resolver::Static(expected()),
        )
    }

    fn endpoint_addresses(ips: &[&str]) -> Vec<EndpointAddress> {
        ips.iter()
            .map(|ip| EndpointAddress {
                ip: (*ip).to_string(),
                ..Default::default()
            })
            .collect()
    }

    fn existing(subsets: Vec<EndpointSubset>, annotations: Option<BTreeMap<String, String>>) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("kubernetes".into()),
                annotations,
                ..Default::default()
            },
            subsets: Some(subsets),
        }
    }

    async fn stored_addresses(fake: &FakeClient) -> Vec<String> {
        let ep = fake
            .stored(ENDPOINTS_NAMESPACE, "kubernetes")
            .await
            .expect("endpoints exist");

        ep.subsets.unwrap()[0]
            .addresses
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.ip)
            .collect()
    }

    #[tokio::test]
    async fn no_leader_makes_no_api_calls() {
        let fake = FakeClient::new();
        let mut r = reconciler(NeverLeader, &fake);
        r.init().unwrap();

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::NotLeader);

        // The endpoints must not get created as we're not the leader
        assert!(fake.stored(ENDPOINTS_NAMESPACE, "kubernetes").await.is_none());
        assert_eq!(fake.reads(), 0);
        assert_eq!(fake.writes(), 0);
    }

    #[tokio::test]
    async fn creates_missing_endpoints() {
        let fake = FakeClient::new();
        let mut r = reconciler(AlwaysLeader, &fake);
        r.init().unwrap();

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Created);
        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);

        let ep = fake.stored(ENDPOINTS_NAMESPACE, "kubernetes").await.unwrap();
        assert!(ep.metadata.annotations.is_none());

        let subsets = ep.subsets.unwrap();
        assert_eq!(subsets.len(), 1);
        let ports = subsets[0].ports.clone().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("https"));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[0].port, 6443);
    }

    #[tokio::test]
    async fn fills_empty_subsets() {
        let fake = FakeClient::new();
        fake.seed(ENDPOINTS_NAMESPACE, existing(Vec::new(), None)).await;

        let mut r = reconciler(AlwaysLeader, &fake);
        r.init().unwrap();

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Updated);
        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);
        assert_eq!(fake.creates(), 0);
        assert_eq!(fake.updates(), 1);
    }

    #[tokio::test]
    async fn matching_addresses_need_no_write() {
        let fake = FakeClient::new();
        let annotations = BTreeMap::from([("foo".to_string(), "bar".to_string())]);
        let subset = EndpointSubset {
            addresses: Some(endpoint_addresses(&EXPECTED_ADDRESSES)),
            ..Default::default()
        };
        fake.seed(ENDPOINTS_NAMESPACE, existing(vec![subset], Some(annotations)))
            .await;

        let mut r = reconciler(AlwaysLeader, &fake);
        r.init().unwrap();

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Unchanged);
        assert_eq!(fake.writes(), 0);

        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);
        let ep = fake.stored(ENDPOINTS_NAMESPACE, "kubernetes").await.unwrap();
        assert_eq!(ep.metadata.annotations.unwrap()["foo"], "bar");
    }

    #[tokio::test]
    async fn update_keeps_foreign_metadata() {
        let fake = FakeClient::new();
        let annotations = BTreeMap::from([("foo".to_string(), "bar".to_string())]);
        let subset = EndpointSubset {
            addresses: Some(endpoint_addresses(&["10.0.0.1"])),
            ..Default::default()
        };
        let mut ep = existing(vec![subset], Some(annotations));
        ep.metadata.labels = Some(BTreeMap::from([("team".to_string(), "infra".to_string())]));
        fake.seed(ENDPOINTS_NAMESPACE, ep).await;

        let mut r = reconciler(AlwaysLeader, &fake);
        r.init().unwrap();

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Updated);
        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);

        let ep = fake.stored(ENDPOINTS_NAMESPACE, "kubernetes").await.unwrap();
        assert_eq!(ep.metadata.annotations.unwrap()["foo"], "bar");
        assert_eq!(ep.metadata.labels.unwrap()["team"], "infra");
        assert_eq!(fake.updates(), 1);
    }

    #[tokio::test]
    async fn stale_port_is_rewritten() {
        let fake = FakeClient::new();
        let annotations = BTreeMap::from([("foo".to_string(), "bar".to_string())]);
        let subset = EndpointSubset {
            addresses: Some(endpoint_addresses(&EXPECTED_ADDRESSES)),
            ports: Some(vec![EndpointPort {
                name: Some("https".into()),
                port: 443,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        fake.seed(ENDPOINTS_NAMESPACE, existing(vec![subset], Some(annotations)))
            .await;

        let r = reconciler(AlwaysLeader, &fake);

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Updated);
        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Unchanged);
        assert_eq!(fake.updates(), 1);

        let ep = fake.stored(ENDPOINTS_NAMESPACE, "kubernetes").await.unwrap();
        assert_eq!(ep.metadata.annotations.unwrap()["foo"], "bar");
        assert_eq!(ep.subsets.unwrap()[0].ports.clone().unwrap()[0].port, 6443);
    }

    #[tokio::test]
    async fn reordered_addresses_are_drift() {
        let fake = FakeClient::new();
        let mut reversed = EXPECTED_ADDRESSES;
        reversed.reverse();
        let subset = EndpointSubset {
            addresses: Some(endpoint_addresses(&reversed)),
            ..Default::default()
        };
        fake.seed(ENDPOINTS_NAMESPACE, existing(vec![subset], None)).await;

        let r = reconciler(AlwaysLeader, &fake);

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Updated);
        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Unchanged);
        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);
        assert_eq!(fake.updates(), 1);
    }

    #[tokio::test]
    async fn repeated_cycles_write_once() {
        let fake = FakeClient::new();
        let r = reconciler(AlwaysLeader, &fake);

        assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Created);
        for _ in 0..5 {
            assert_eq!(r.reconcile_endpoints().await.unwrap(), Outcome::Unchanged);
        }

        assert_eq!(fake.writes(), 1);
        assert_eq!(fake.reads(), 6);
    }

    #[tokio::test]
    async fn api_failure_is_surfaced() {
        let fake = FakeClient::new();
        fake.set_unavailable(true);
        let r = reconciler(AlwaysLeader, &fake);

        let err = r.reconcile_endpoints().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(err.is_transient());
        assert_eq!(fake.writes(), 0);
    }

    struct BrokenFactory;

    impl ClientFactory for BrokenFactory {
        type Client = FakeClient;

        async fn create(&self) -> Result<FakeClient> {
            Err(Error::ClientConstruction("no kubeconfig".into()))
        }
    }

    #[tokio::test]
    async fn client_construction_failure_is_surfaced() {
        let r = EndpointReconciler::with_resolver(
            config(),
            AlwaysLeader,
            BrokenFactory,
            Resolver::Static(expected()),
        );

        let err = r.reconcile_endpoints().await.unwrap_err();
        assert!(matches!(err, Error::ClientConstruction(_)));
    }

    #[tokio::test]
    async fn empty_resolution_writes_nothing() {
        let fake = FakeClient::new();
        let r = EndpointReconciler::with_resolver(
            config(),
            AlwaysLeader,
            fake.clone(),
            Resolver::Static(Addresses::default()),
        );

        assert!(matches!(
            r.reconcile_endpoints().await,
            Err(Error::NoAddresses(_))
        ));
        assert_eq!(fake.reads(), 0);
        assert_eq!(fake.writes(), 0);
    }

    #[test]
    fn new_resolves_from_config() {
        let r = EndpointReconciler::new(
            ApiConfig::new("1.2.3.4"),
            AlwaysLeader,
            FakeClient::new(),
        );

        assert_eq!(r.config().address, "1.2.3.4");
        assert_eq!(
            r.inner.resolver,
            Resolver::Static(Addresses::parse(["1.2.3.4"]).unwrap())
        );
    }

    #[test]
    fn init_rejects_invalid_config() {
        let mut r = EndpointReconciler::new(
            ApiConfig::new("1.2.3.4").port(0),
            AlwaysLeader,
            FakeClient::new(),
        );

        assert!(matches!(r.init(), Err(Error::InvalidConfig(_))));
        assert!(matches!(r.run(), Err(Error::NotInitialized)));
    }

    #[test]
    fn run_needs_a_runtime() {
        let mut r = reconciler(AlwaysLeader, &FakeClient::new());
        r.init().unwrap();

        assert!(matches!(r.run(), Err(Error::NoRuntime)));
        assert!(matches!(r.init(), Err(Error::AlreadyRunning)));
    }

    #[test]
    fn needs_update_cases() {
        let target = Target::default();
        let desired = Addresses::parse(["10.0.0.1", "10.0.0.2"]).unwrap();

        let mut ep = existing(Vec::new(), None);
        assert!(needs_update(&ep, &target, &desired));

        ep.subsets = None;
        assert!(needs_update(&ep, &target, &desired));

        ep.subsets = Some(vec![EndpointSubset::default()]);
        assert!(needs_update(&ep, &target, &desired));

        ep.subsets = Some(vec![EndpointSubset {
            addresses: Some(endpoint_addresses(&["10.0.0.1", "10.0.0.2"])),
            ..Default::default()
        }]);
        assert!(!needs_update(&ep, &target, &desired));

        ep.subsets = Some(vec![desired_subset(&target, &desired)]);
        assert!(!needs_update(&ep, &target, &desired));
    }

    #[test]
    fn needs_update_on_port_drift() {
        let target = Target::default();
        let desired = Addresses::parse(["10.0.0.1"]).unwrap();
        let port = |name: &str, port: i32, protocol: Option<&str>| EndpointPort {
            name: Some(name.to_string()),
            port,
            protocol: protocol.map(String::from),
            ..Default::default()
        };
        let ep = |ports: Vec<EndpointPort>| {
            existing(
                vec![EndpointSubset {
                    addresses: Some(endpoint_addresses(&["10.0.0.1"])),
                    ports: Some(ports),
                    ..Default::default()
                }],
                None,
            )
        };

        assert!(!needs_update(&ep(vec![port("https", 6443, Some("TCP"))]), &target, &desired));
        // the API server defaults a missing protocol to TCP
        assert!(!needs_update(&ep(vec![port("https", 6443, None)]), &target, &desired));

        assert!(needs_update(&ep(vec![port("https", 443, Some("TCP"))]), &target, &desired));
        assert!(needs_update(&ep(vec![port("api", 6443, Some("TCP"))]), &target, &desired));
        assert!(needs_update(&ep(vec![port("https", 6443, Some("UDP"))]), &target, &desired));
        assert!(needs_update(
            &ep(vec![port("https", 6443, Some("TCP")), port("http", 8080, Some("TCP"))]),
            &target,
            &desired
        ));
    }

    /// Gate whose answer a test can flip.
    #[derive(Default)]
    struct Switch(AtomicBool);

    impl LeaderElector for Switch {
        fn is_leader(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reconciles_every_interval() {
        let fake = FakeClient::new();
        let mut r = reconciler(AlwaysLeader, &fake);
        r.init().unwrap();
        r.run().unwrap();
        assert!(r.is_running());
        assert!(matches!(r.run(), Err(Error::AlreadyRunning)));

        // ticks at 0s, 10s and 20s
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);
        assert_eq!(fake.reads(), 3);
        assert_eq!(fake.writes(), 1);
        assert!(r.healthy().is_ok());

        r.stop().await.unwrap();
        assert!(!r.is_running());
        assert!(matches!(r.healthy(), Err(Error::NotRunning)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.reads(), 3);

        r.stop().await.unwrap();
        assert!(matches!(r.run(), Err(Error::Stopped)));
        assert!(matches!(r.init(), Err(Error::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_follows_leadership() {
        let fake = FakeClient::new();
        let gate = Arc::new(Switch::default());
        let mut r = reconciler(gate.clone(), &fake);
        r.init().unwrap();
        r.run().unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(fake.reads(), 0);
        assert!(fake.stored(ENDPOINTS_NAMESPACE, "kubernetes").await.is_none());

        gate.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.creates(), 1);

        gate.0.store(false, Ordering::SeqCst);
        let reads = fake.reads();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fake.reads(), reads);

        r.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_failed_cycles() {
        let fake = FakeClient::new();
        fake.set_unavailable(true);

        let mut r = reconciler(AlwaysLeader, &fake);
        r.init().unwrap();
        r.run().unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(fake.reads(), 3);
        assert!(r.is_running());
        assert!(r.healthy().is_ok());

        fake.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stored_addresses(&fake).await, EXPECTED_ADDRESSES);

        r.stop().await.unwrap();
    }

    #[tokio::test]
    async fn healthy_requires_running() {
        let mut r = reconciler(AlwaysLeader, &FakeClient::new());
        assert!(matches!(r.healthy(), Err(Error::NotRunning)));

        r.init().unwrap();
        assert!(matches!(r.healthy(), Err(Error::NotRunning)));

        r.stop().await.unwrap();
        assert!(matches!(r.healthy(), Err(Error::NotRunning)));
    }
}
