//! Desired address set and the resolvers producing it.

use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::EndpointAddress;

use crate::config::{ApiConfig, IpFamily};
use crate::{Error, Result};

/// An ordered, duplicate free list of addresses.
///
/// Addresses are kept in ascending [`IpAddr`] order so that two resolutions
/// of the same set always serialize identically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Addresses(Vec<IpAddr>);

impl Addresses {
    /// Parses IP literals into an address set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any entry is not an IP literal.
    pub fn parse<I, S>(addresses: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        addresses
            .into_iter()
            .map(|s| {
                let s = s.as_ref();
                s.parse::<IpAddr>()
                    .map_err(|_| Error::InvalidConfig(format!("{s:?} is not an IP address")))
            })
            .collect()
    }

    /// Returns true if there are no addresses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates the addresses in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.0.iter()
    }

    /// String forms in canonical order.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    /// Builds the endpoint addresses stored in an `Endpoints` subset.
    #[must_use]
    pub fn to_endpoint_addresses(&self) -> Vec<EndpointAddress> {
        self.0
            .iter()
            .map(|ip| EndpointAddress {
                ip: ip.to_string(),
                ..Default::default()
            })
            .collect()
    }

    /// Compares against stored endpoint addresses as an ordered sequence.
    ///
    /// Stored IPs are compared parsed, so textual variants of the same IPv6
    /// address do not count as drift. Unparseable entries never match.
    #[must_use]
    pub fn matches(&self, current: &[EndpointAddress]) -> bool {
        self.0.len() == current.len()
            && self
                .0
                .iter()
                .zip(current)
                .all(|(want, have)| have.ip.parse::<IpAddr>().is_ok_and(|ip| ip == *want))
    }
}

impl FromIterator<IpAddr> for Addresses {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Addresses {
    type Item = &'a IpAddr;
    type IntoIter = std::slice::Iter<'a, IpAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Source of the desired address set.
pub trait AddressResolver: Send + Sync + 'static {
    /// Produces the current address set.
    ///
    /// Implementations must return a non-empty set or an error.
    fn resolve(&self) -> impl Future<Output = Result<Addresses>> + Send;
}

/// The resolvers derivable from an [`ApiConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolver {
    /// A fixed address set.
    Static(Addresses),
    /// Addresses looked up from a host name on every call.
    Dns {
        /// Host to resolve.
        host: String,
        /// Family of the addresses kept.
        family: IpFamily,
    },
}

impl Resolver {
    /// Picks the resolver for a configuration.
    ///
    /// The external address wins over the local one. An unparseable local
    /// address produces an empty static set, which [`ApiConfig::validate`]
    /// rejects before any cycle runs.
    #[must_use]
    pub fn from_config(config: &ApiConfig) -> Self {
        match &config.external_address {
            Some(external) => match external.parse::<IpAddr>() {
                Ok(ip) => Self::Static(std::iter::once(ip).collect()),
                Err(_) => Self::Dns {
                    host: external.clone(),
                    family: config.ip_family,
                },
            },
            None => Self::Static(config.address.parse::<IpAddr>().into_iter().collect()),
        }
    }
}

impl AddressResolver for Resolver {
    async fn resolve(&self) -> Result<Addresses> {
        match self {
            Self::Static(addresses) if addresses.is_empty() => {
                Err(Error::NoAddresses("static configuration".into()))
            }
            Self::Static(addresses) => Ok(addresses.clone()),
            Self::Dns { host, family } => lookup(host, *family).await,
        }
    }
}

async fn lookup(host: &str, family: IpFamily) -> Result<Addresses> {
    let resolved = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?;

    let addresses: Addresses = resolved
        .map(|addr| addr.ip())
        .filter(|ip| family.matches(ip))
        .collect();

    if addresses.is_empty() {
        return Err(Error::NoAddresses(host.to_string()));
    }

    tracing::trace!("resolved {host} to {:?}", addresses.to_strings());
    Ok(addresses)
}
