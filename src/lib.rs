//! Connection and peering core of a mesh VPN node.
//!
//! Each node keeps long-lived, mutually authenticated TLS sessions to its
//! configured peers, listens for inbound peers, and exchanges two kinds of
//! traffic over every session: opaque layer-2 frames carrying tunnelled user
//! data, and a small control protocol carrying route announcements and
//! round-trip probes.
//!
//! The [`endpoint::Endpoint`] owns the connection registry and the listening
//! sockets; every [`connection::Connection`] runs the full lifecycle of one
//! peer link, from configured address through non-blocking connect, TLS
//! handshake, framed steady-state exchange, liveness probing and
//! retry-with-backoff. Everything is driven from a single-threaded readiness
//! loop through the [`poll::PollSet`] contract; reachability information is
//! handed to the surrounding daemon through the [`routes::Routes`] contract.

#[macro_use]
extern crate slog;

use std::time::{SystemTime, UNIX_EPOCH};

pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod packet;
pub mod poll;
pub mod routes;
pub mod sock;
pub mod squeue;

#[cfg(test)]
pub(crate) mod testutil;

/// Microseconds since the unix epoch, the time base for every interval in
/// the crate (`retry`, `keepalive`, `timeout`, ping estimates).
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
