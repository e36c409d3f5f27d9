//! Reconciler configuration and the fixed identity of the reconciled object.

use std::net::IpAddr;
use std::time::Duration;

use crate::{Error, Result};

/// Name of the reconciled `Endpoints` object.
pub const ENDPOINTS_NAME: &str = "kubernetes";

/// Namespace of the reconciled `Endpoints` object.
pub const ENDPOINTS_NAMESPACE: &str = "default";

/// Name of the API server port in the endpoint subset.
pub const API_PORT_NAME: &str = "https";

/// Protocol of the API server port in the endpoint subset.
pub const API_PORT_PROTOCOL: &str = "TCP";

/// Port the API server listens on unless configured otherwise.
pub const DEFAULT_API_PORT: u16 = 6443;

/// Time between two reconciliation cycles.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Address family kept when resolving a host name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IpFamily {
    /// Keep IPv4 addresses only.
    #[default]
    Ipv4,
    /// Keep IPv6 addresses only.
    Ipv6,
}

impl IpFamily {
    /// Returns true if `ip` belongs to this family.
    #[must_use]
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Self::Ipv4 => ip.is_ipv4(),
            Self::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Port descriptor written next to the addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiPort {
    /// Port name.
    pub name: String,
    /// Port number.
    pub port: u16,
    /// Transport protocol.
    pub protocol: String,
}

impl ApiPort {
    /// The `https`/`TCP` descriptor for the given port number.
    #[must_use]
    pub fn https(port: u16) -> Self {
        Self {
            name: API_PORT_NAME.to_string(),
            port,
            protocol: API_PORT_PROTOCOL.to_string(),
        }
    }
}

/// Identity of the reconciled `Endpoints` object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Object name.
    pub name: String,
    /// Object namespace.
    pub namespace: String,
    /// Port descriptor of the single subset.
    pub port: ApiPort,
}

impl Target {
    /// The `default/kubernetes` endpoints serving the API on `port`.
    #[must_use]
    pub fn kubernetes(port: u16) -> Self {
        Self {
            name: ENDPOINTS_NAME.to_string(),
            namespace: ENDPOINTS_NAMESPACE.to_string(),
            port: ApiPort::https(port),
        }
    }

    fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.name) {
            return Err(invalid(format!("endpoints name {:?}", self.name)));
        }

        if !is_dns_label(&self.namespace) {
            return Err(invalid(format!("endpoints namespace {:?}", self.namespace)));
        }

        if self.port.port == 0 {
            return Err(invalid("API port must not be 0"));
        }

        // IANA service name: at most 15 characters, at least one letter
        let name = &self.port.name;
        if name.is_empty()
            || name.len() > 15
            || !name.bytes().any(|b| b.is_ascii_lowercase())
            || !name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(invalid(format!("port name {name:?}")));
        }

        if !matches!(self.port.protocol.as_str(), "TCP" | "UDP" | "SCTP") {
            return Err(invalid(format!("port protocol {:?}", self.port.protocol)));
        }

        Ok(())
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::kubernetes(DEFAULT_API_PORT)
    }
}

/// Configuration of the API endpoint reconciler.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// The address the local API server is reachable on.
    /// Used when no external address is configured.
    pub address: String,

    /// Externally reachable API address: an IP literal or a host name
    /// resolving to the load balancer addresses.
    pub external_address: Option<String>,

    /// Family kept when resolving `external_address`.
    pub ip_family: IpFamily,

    /// Identity of the reconciled object.
    pub target: Target,

    /// Time between two reconciliation cycles.
    pub interval: Duration,

    /// How long the loop may go without completing a cycle before it is
    /// reported unhealthy. Defaults to three intervals.
    pub health_staleness: Option<Duration>,
}

impl ApiConfig {
    /// Creates a configuration for an API server reachable on `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            external_address: None,
            ip_family: IpFamily::default(),
            target: Target::default(),
            interval: DEFAULT_INTERVAL,
            health_staleness: None,
        }
    }

    /// Sets the externally reachable address.
    #[must_use]
    pub fn external_address(mut self, external_address: impl Into<String>) -> Self {
        self.external_address = Some(external_address.into());
        self
    }

    /// Sets the API server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.target.port.port = port;
        self
    }

    /// Sets the family kept when resolving the external address.
    #[must_use]
    pub fn ip_family(mut self, ip_family: IpFamily) -> Self {
        self.ip_family = ip_family;
        self
    }

    /// Sets the reconciled object identity.
    #[must_use]
    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Sets the time between two reconciliation cycles.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the health staleness window.
    #[must_use]
    pub fn health_staleness(mut self, staleness: Duration) -> Self {
        self.health_staleness = Some(staleness);
        self
    }

    /// The effective health staleness window.
    #[must_use]
    pub fn staleness(&self) -> Duration {
        self.health_staleness.unwrap_or(self.interval * 3)
    }

    /// Checks the configuration for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first offending value.
    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;

        if self.address.parse::<IpAddr>().is_err() {
            return Err(invalid(format!("API address {:?} is not an IP", self.address)));
        }

        if let Some(external) = &self.external_address
            && external.parse::<IpAddr>().is_err()
            && !is_dns_subdomain(external)
        {
            return Err(invalid(format!("external address {external:?}")));
        }

        if self.interval.is_zero() {
            return Err(invalid("reconcile interval must not be zero"));
        }

        if self.staleness() < self.interval {
            return Err(invalid("health staleness must cover at least one interval"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

/// RFC 1123 label.
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// RFC 1123 subdomain, case-insensitive since it names a host.
fn is_dns_subdomain(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    s.len() <= 253 && s.split('.').all(|l| is_dns_label(&l.to_ascii_lowercase()))
}
