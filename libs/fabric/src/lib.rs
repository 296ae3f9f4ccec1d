//! Shared core for the weft proxy fabric.
//!
//! Both data planes (the SNI-peeking L4 proxy and the TLS-terminating L7
//! proxy) are built on the pieces in this crate:
//!
//! - [`Registry`]: hostname selector → backend pool with round-robin
//!   selection, mutated at runtime through the control plane
//! - [`ResponseCache`] / [`MemoryCache`]: selector-keyed response cache
//! - [`ProxyMetrics`]: process-wide counters, gauges, and the request
//!   latency histogram, rendered in Prometheus text format
//! - [`tls`]: PEM certificate loading and TLS acceptor construction

pub mod cache;
pub mod metrics;
pub mod registry;
pub mod tls;

pub use cache::{MemoryCache, ResponseCache};
pub use metrics::{ConnectionGuard, ProxyMetrics};
pub use registry::{Registry, RegistryError};
