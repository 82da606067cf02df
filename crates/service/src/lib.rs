//! Allocation state, timers, authentication, request dispatch and relay
//! for a TURN server core (RFC 5766).
//!
//! Everything in this crate is owned by a single [`Dispatcher`] driven
//! from one event loop — no locks, no background threads. The binary
//! crate supplies sockets, configuration and the account store; this
//! crate only turns inbound bytes plus addresses into outbound bytes
//! plus addresses.

pub mod account;
pub mod dispatcher;
pub mod ports;
pub mod store;
pub mod timer;

pub use dispatcher::Dispatcher;

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

/// `(transport, client_addr, server_addr)` — the index identifying an
/// allocation on the server side. This crate only relays UDP (a
/// Non-goal excludes TURN-TCP allocations), but the client may have
/// connected over UDP, TCP or TLS, so the transport is still tracked to
/// keep two otherwise-identical 5-tuples on different listeners apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub transport: Transport,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No allocation exists for a 5-tuple a Refresh/CreatePermission/
    /// ChannelBind request targets.
    NoAllocation,
    /// I1: the 5-tuple already has a live allocation under a different
    /// transaction id.
    AllocationMismatch,
    /// I2: no relayed address is available (port space exhausted).
    InsufficientCapacity,
    /// §4.5 max_client / max_relay_per_client.
    QuotaReached,
}
