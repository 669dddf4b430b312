//! Cluster-side tracing of requests.

pub mod tracing;
