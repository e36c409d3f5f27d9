#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Leader-gated reconciler for the `kubernetes` service [Endpoints].
//!
//! When a cluster's API is published behind an external address (a load
//! balancer, or a DNS name resolving to several of them), the API servers do
//! not advertise that address themselves. This crate keeps the
//! `default/kubernetes` `Endpoints` object pointed at the external addresses so
//! that in-cluster clients of the `kubernetes` service reach the API through
//! the same front door as everyone else.
//!
//! # Features
//!
//! - **Single writer**: reconciliation only happens while a [`LeaderElector`]
//!   reports leadership; a Lease based elector is included
//! - **Write avoidance**: an object that already lists the desired addresses is
//!   never written, so redundant instances do not churn `resourceVersion`
//! - **Metadata preservation**: annotations and labels owned by others survive
//!   updates; only the subsets are replaced
//! - **Testable**: the API client sits behind [`ClientFactory`], with an
//!   in-memory [`FakeClient`](fake::FakeClient)
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use kube::Client;
//! use kube_endpoint_reconciler::{
//!     ApiConfig, EndpointReconciler, KubeClientFactory, LeaderElector, LeaseElector, LeaseParams,
//! };
//!
//! let elector = Arc::new(LeaseElector::new(Client::try_default().await?, LeaseParams::default()));
//! elector.init()?;
//! elector.run()?;
//!
//! let config = ApiConfig::new("10.0.0.10").external_address("api.example.com");
//! let mut reconciler = EndpointReconciler::new(config, elector.clone(), KubeClientFactory::new());
//! reconciler.init()?;
//! reconciler.run()?;
//!
//! // later
//! reconciler.stop().await?;
//! elector.shutdown().await?;
//! ```
//!
//! [Endpoints]: https://kubernetes.io/docs/reference/kubernetes-api/service-resources/endpoints-v1/

mod address;
mod client;
mod config;
mod error;
pub mod fake;
mod leader;
mod reconciler;

pub use address::{AddressResolver, Addresses, Resolver};
pub use client::{ClientFactory, EndpointsClient, KubeClientFactory};
pub use config::{
    API_PORT_NAME, API_PORT_PROTOCOL, ApiConfig, ApiPort, DEFAULT_API_PORT, DEFAULT_INTERVAL,
    ENDPOINTS_NAME, ENDPOINTS_NAMESPACE, IpFamily, Target,
};
pub use error::{BoxError, Error, Result};
pub use leader::{AlwaysLeader, LeaderElector, LeaseElector, LeaseParams, NeverLeader};
pub use reconciler::{EndpointReconciler, Outcome};
