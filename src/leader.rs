//! Leadership gate.
//!
//! The reconciler only writes while [`LeaderElector::is_leader`] holds. Two
//! trivial gates ([`AlwaysLeader`], [`NeverLeader`]) cover single instance
//! setups and tests; [`LeaseElector`] coordinates redundant instances through
//! a `coordination.k8s.io/v1` Lease.
//! <https://kubernetes.io/docs/concepts/architecture/leases/>

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// A leadership gate with a start/stop lifecycle.
pub trait LeaderElector: Send + Sync + 'static {
    /// Prepares the elector.
    ///
    /// # Errors
    ///
    /// Fails on unusable configuration.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Starts taking part in the election.
    ///
    /// # Errors
    ///
    /// Fails if the elector is not initialized or already running.
    fn run(&self) -> Result<()> {
        Ok(())
    }

    /// Leaves the election. Calling it more than once is harmless.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Reports whether the election is making progress.
    ///
    /// # Errors
    ///
    /// Fails when the elector is not running or has stalled.
    fn healthy(&self) -> Result<()> {
        Ok(())
    }

    /// Returns true if this instance currently holds leadership.
    fn is_leader(&self) -> bool;
}

impl<E: LeaderElector> LeaderElector for Arc<E> {
    fn init(&self) -> Result<()> {
        (**self).init()
    }

    fn run(&self) -> Result<()> {
        (**self).run()
    }

    fn stop(&self) -> Result<()> {
        (**self).stop()
    }

    fn healthy(&self) -> Result<()> {
        (**self).healthy()
    }

    fn is_leader(&self) -> bool {
        (**self).is_leader()
    }
}

/// Gate that is always open.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysLeader;

impl LeaderElector for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Gate that is always closed.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverLeader;

impl LeaderElector for NeverLeader {
    fn is_leader(&self) -> bool {
        false
    }
}

/// Parameters of a [`LeaseElector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseParams {
    /// Name of the Lease object.
    pub lease_name: String,

    /// Namespace of the Lease object.
    pub namespace: String,

    /// Identity written as the lease holder. Must be unique per instance.
    pub identity: String,

    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,

    /// Time between two acquire/renew attempts.
    pub retry_period: Duration,
}

impl LeaseParams {
    /// Creates parameters for the named lease with default timings.
    ///
    /// The identity defaults to `HOSTNAME`, which is the pod name in a cluster.
    #[must_use]
    pub fn new(lease_name: impl Into<String>) -> Self {
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("{}-{}", env!("CARGO_PKG_NAME"), std::process::id()));

        Self {
            lease_name: lease_name.into(),
            namespace: "kube-system".to_string(),
            identity,
            lease_duration: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
        }
    }

    /// Sets the lease namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the holder identity.
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Sets the lease duration.
    #[must_use]
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Sets the retry period.
    #[must_use]
    pub fn retry_period(mut self, retry_period: Duration) -> Self {
        self.retry_period = retry_period;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.lease_name.is_empty() || self.namespace.is_empty() {
            return Err(Error::InvalidConfig("lease name and namespace are required".into()));
        }

        if self.identity.is_empty() {
            return Err(Error::InvalidConfig("lease identity must not be empty".into()));
        }

        if self.lease_duration.as_secs() == 0 {
            return Err(Error::InvalidConfig("lease duration must be at least 1s".into()));
        }

        if self.retry_period.is_zero() || self.retry_period >= self.lease_duration {
            return Err(Error::InvalidConfig(
                "retry period must be shorter than the lease duration".into(),
            ));
        }

        Ok(())
    }

    fn lock_params(&self) -> LeaseLockParams {
        LeaseLockParams {
            holder_id: self.identity.clone(),
            lease_name: self.lease_name.clone(),
            lease_ttl: self.lease_duration,
        }
    }
}

impl Default for LeaseParams {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

const NEW: u8 = 0;
const INITIALIZED: u8 = 1;
const RUNNING: u8 = 2;
const STOPPED: u8 = 3;

/// Leader elector backed by a Kubernetes Lease.
///
/// A background task acquires or renews the lease every retry period through
/// [`LeaseLock`]. Each successful attempt publishes a deadline one lease
/// duration after the attempt started; [`is_leader`](LeaderElector::is_leader)
/// holds only until that deadline, so a renewal that hangs or fails never
/// outlives the lease other candidates see.
pub struct LeaseElector {
    shared: Arc<Shared>,
    state: AtomicU8,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    lock: LeaseLock,
    params: LeaseParams,
    leading_until: watch::Sender<Option<Instant>>,
    last_attempt: watch::Sender<Option<Instant>>,
}

impl Shared {
    fn is_leader(&self) -> bool {
        self.leading_until
            .borrow()
            .is_some_and(|deadline| deadline > Instant::now())
    }
}

impl LeaseElector {
    /// Creates an elector using `client` to manage the lease.
    #[must_use]
    pub fn new(client: Client, params: LeaseParams) -> Self {
        let lock = LeaseLock::new(client, &params.namespace, params.lock_params());

        Self {
            shared: Arc::new(Shared {
                lock,
                params,
                leading_until: watch::Sender::new(None),
                last_attempt: watch::Sender::new(None),
            }),
            state: AtomicU8::new(NEW),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Subscribes to the leadership deadline.
    ///
    /// Leadership holds while the published instant lies in the future.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.shared.leading_until.subscribe()
    }

    /// Leaves the election and waits until a held lease has been released.
    ///
    /// # Errors
    ///
    /// Never fails today; the release outcome is logged.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop()?;

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("leader election task failed: {e}");
        }

        Ok(())
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl LeaderElector for LeaseElector {
    fn init(&self) -> Result<()> {
        self.shared.params.validate()?;

        if self.transition(NEW, INITIALIZED) {
            return Ok(());
        }

        match self.state.load(Ordering::SeqCst) {
            STOPPED => Err(Error::Stopped),
            _ => Err(Error::AlreadyRunning),
        }
    }

    fn run(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        if !self.transition(INITIALIZED, RUNNING) {
            return Err(match self.state.load(Ordering::SeqCst) {
                NEW => Error::NotInitialized,
                STOPPED => Error::Stopped,
                _ => Error::AlreadyRunning,
            });
        }

        self.shared.last_attempt.send_replace(Some(Instant::now()));
        let task = handle.spawn(elect(self.shared.clone(), self.cancel.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(
            lease = %self.shared.params.lease_name,
            identity = %self.shared.params.identity,
            "started leader election"
        );

        Ok(())
    }

    /// Cancels the election task; a held lease is released in the
    /// background. Use [`LeaseElector::shutdown`] to wait for the release.
    fn stop(&self) -> Result<()> {
        if self.state.swap(STOPPED, Ordering::SeqCst) != STOPPED {
            self.cancel.cancel();
        }

        Ok(())
    }

    fn healthy(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(Error::NotRunning);
        }

        let window = self.shared.params.retry_period * 3;
        match *self.shared.last_attempt.borrow() {
            Some(at) if at.elapsed() > window => Err(Error::Unhealthy(at.elapsed())),
            _ => Ok(()),
        }
    }

    fn is_leader(&self) -> bool {
        self.shared.is_leader()
    }
}

async fn elect(shared: Arc<Shared>, cancel: CancellationToken) {
    let params = &shared.params;
    let mut leading = false;

    let mut ticker = tokio::time::interval(params.retry_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();

        // an attempt never runs into the next one
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            attempt = tokio::time::timeout(params.retry_period, shared.lock.try_acquire_or_renew()) => attempt,
        };

        match attempt {
            Ok(Ok(LeaseLockResult::Acquired(_))) => {
                shared
                    .leading_until
                    .send_replace(Some(started + params.lease_duration));
            }
            Ok(Ok(_)) => {
                shared.leading_until.send_replace(None);
            }
            Ok(Err(e)) => {
                warn!(error = %e, lease = %params.lease_name, "failed to acquire or renew lease");
            }
            Err(_) => {
                warn!(lease = %params.lease_name, "lease attempt timed out after {:?}", params.retry_period);
            }
        }

        shared.last_attempt.send_replace(Some(Instant::now()));

        let now_leading = shared.is_leader();
        match (leading, now_leading) {
            (false, true) => info!(identity = %params.identity, "acquired lease {}", params.lease_name),
            (true, false) => warn!(identity = %params.identity, "lost lease {}", params.lease_name),
            _ => {}
        }
        leading = now_leading;
    }

    let held = shared.is_leader();
    shared.leading_until.send_replace(None);

    if held {
        match tokio::time::timeout(params.retry_period, shared.lock.step_down()).await {
            Ok(Ok(())) => info!("released lease {}", params.lease_name),
            Ok(Err(e)) => warn!(error = %e, "failed to release lease {}", params.lease_name),
            Err(_) => warn!("releasing lease {} timed out", params.lease_name),
        }
    }

    debug!("leader election for {} stopped", params.lease_name);
}
