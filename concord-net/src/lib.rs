//! # Concord Net
//!
//! TCP transport for the Concord consensus protocol: length-prefixed
//! binary frames, per-peer outbound links with reconnect/backoff, and
//! in-transport ping/pong handling feeding the liveness detector.

pub mod tcp;

pub use tcp::{RetryConfig, TcpClusterNetwork, TcpNetworkConfig};
