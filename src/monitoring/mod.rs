#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Process metrics and the optional scrape endpoint.

/// Optional `/metrics` HTTP server.
pub mod http;
/// Prometheus metric definitions.
pub mod metrics;
