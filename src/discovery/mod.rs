//! Cluster membership discovery.
//!
//! The server side exposes the membership HTTP API on the configured api
//! port; the client side runs the join/rejoin handshakes a starting node
//! uses to get itself (back) into a cluster.

mod backoff;
mod client;
mod server;

pub(crate) use backoff::ExponentialBackoff;
pub(crate) use client::DiscoveryClient;
pub(crate) use server::start_server;
