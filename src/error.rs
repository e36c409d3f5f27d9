//! Error taxonomy for reconciliation, leader election and lifecycle control.

use std::time::Duration;

/// Boxed error used where the underlying cause is not a kube error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the reconciler and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Object namespace.
        namespace: String,
        /// Object name.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Object namespace.
        namespace: String,
        /// Object name.
        name: String,
    },

    /// The object was modified since it was read.
    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// Object namespace.
        namespace: String,
        /// Object name.
        name: String,
        /// Detail reported by the server.
        message: String,
    },

    /// A Kubernetes API request failed.
    #[error("kube error: {0}")]
    Api(#[from] kube::Error),

    /// The API server could not be reached.
    #[error("API server unavailable: {0}")]
    Unavailable(String),

    /// A client handle could not be built.
    #[error("failed to create Kubernetes client: {0}")]
    ClientConstruction(#[source] BoxError),

    /// Resolving the external address failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// The host being resolved.
        host: String,
        /// Resolver failure.
        #[source]
        source: std::io::Error,
    },

    /// Resolution succeeded but yielded no usable address.
    #[error("no usable addresses for {0}")]
    NoAddresses(String),

    /// The configuration cannot be used. Never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `run` was called before `init`.
    #[error("not initialized")]
    NotInitialized,

    /// `init` or `run` was called on a component that is already set up.
    #[error("already running")]
    AlreadyRunning,

    /// The component was stopped and cannot be restarted.
    #[error("stopped")]
    Stopped,

    /// No tokio runtime is available to spawn the background task.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The component is not running.
    #[error("not running")]
    NotRunning,

    /// The background task has not made progress within the staleness window.
    #[error("no progress for {0:?}")]
    Unhealthy(Duration),
}

impl Error {
    /// Returns true if the failure is expected to clear up on a later cycle.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyExists { .. }
                | Self::Conflict { .. }
                | Self::Api(_)
                | Self::Unavailable(_)
                | Self::ClientConstruction(_)
                | Self::Resolve { .. }
                | Self::NoAddresses(_)
        )
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
