//! Allocation store (C2): per-client allocation records plus their
//! permission and channel-binding sub-tables.
//!
//! The primary map owns every [`Allocation`]; everything else (the
//! username/relayed-address indices, and each allocation's
//! `channel_by_peer` index) holds only a non-owning key, per §9.
//! Deletes are two-phase (I6): [`AllocationStore::expire`] tombstones an
//! entry immediately so it stops being reachable to new requests, and
//! [`AllocationStore::sweep`] later frees tombstoned entries and
//! restores their ports.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use ahash::AHashMap;

use crate::{AddressFamily, Error, FiveTuple};
use crate::timer::TimerId;

pub const PERMISSION_LIFETIME_SECS: u64 = 300;
pub const CHANNEL_LIFETIME_SECS: u64 = 600;
pub const MAX_ALLOCATION_LIFETIME_SECS: u64 = 3600;
pub const RESERVATION_LIFETIME_SECS: u64 = 30;

/// A peer network address, compared without a port (I-AllocationPermission
/// uniqueness is per address only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub family: AddressFamily,
    pub address: IpAddr,
}

impl PeerKey {
    pub fn of(addr: &SocketAddr) -> Self {
        Self {
            family: AddressFamily::of(addr),
            address: addr.ip(),
        }
    }
}

pub struct Permission {
    pub timer: TimerId,
}

pub struct Channel {
    pub number: u16,
    pub peer_addr: SocketAddr,
    pub timer: TimerId,
}

pub struct Allocation {
    pub transaction_id: [u8; 12],
    pub username: String,
    pub tuple: FiveTuple,
    pub relayed_addr: SocketAddr,
    pub permissions: AHashMap<PeerKey, Permission>,
    pub channels: AHashMap<u16, Channel>,
    /// Non-owning index: `channels` is the owner.
    pub channel_by_peer: AHashMap<SocketAddr, u16>,
    pub expire_timer: TimerId,
    pub expired: bool,
}

impl Allocation {
    pub fn find_permission(&self, peer: &SocketAddr) -> Option<&Permission> {
        self.permissions.get(&PeerKey::of(peer))
    }

    pub fn find_channel_by_peer(&self, peer: &SocketAddr) -> Option<u16> {
        self.channel_by_peer.get(peer).copied()
    }

    pub fn find_channel_by_number(&self, number: u16) -> Option<&Channel> {
        self.channels.get(&number)
    }
}

#[derive(Default)]
pub struct AllocationStore {
    by_tuple: HashMap<FiveTuple, Allocation>,
    tuple_by_relayed: HashMap<SocketAddr, FiveTuple>,
    tuples_by_username: HashMap<String, Vec<FiveTuple>>,
}

impl AllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tuple: &FiveTuple) -> Option<&Allocation> {
        self.by_tuple.get(tuple).filter(|a| !a.expired)
    }

    pub fn get_mut(&mut self, tuple: &FiveTuple) -> Option<&mut Allocation> {
        match self.by_tuple.get_mut(tuple) {
            Some(a) if !a.expired => Some(a),
            _ => None,
        }
    }

    pub fn by_relayed_addr(&self, relayed_addr: &SocketAddr) -> Option<&Allocation> {
        let tuple = self.tuple_by_relayed.get(relayed_addr)?;
        self.get(tuple)
    }

    pub fn count_for_username(&self, username: &str) -> usize {
        self.tuples_by_username
            .get(username)
            .map(|v| v.iter().filter(|t| self.get(t).is_some()).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_tuple.values().filter(|a| !a.expired).count()
    }

    /// I1: reject a duplicate 5-tuple.
    pub fn insert(&mut self, allocation: Allocation) -> Result<(), Error> {
        if self.get(&allocation.tuple).is_some() {
            return Err(Error::AllocationMismatch);
        }

        let tuple = allocation.tuple;
        let relayed_addr = allocation.relayed_addr;
        let username = allocation.username.clone();

        self.by_tuple.insert(tuple, allocation);
        self.tuple_by_relayed.insert(relayed_addr, tuple);
        self.tuples_by_username.entry(username).or_default().push(tuple);

        Ok(())
    }

    /// Tombstone an allocation (I6): unreachable to new requests
    /// immediately, but its slot (and port) is only freed at the next
    /// [`AllocationStore::sweep`].
    pub fn expire(&mut self, tuple: &FiveTuple) {
        if let Some(a) = self.by_tuple.get_mut(tuple) {
            a.expired = true;
        }
    }

    /// Remove every tombstoned allocation, returning the freed relayed
    /// ports and the timers that must be canceled.
    pub fn sweep(&mut self) -> Vec<Allocation> {
        let expired_tuples: Vec<FiveTuple> = self
            .by_tuple
            .iter()
            .filter(|(_, a)| a.expired)
            .map(|(t, _)| *t)
            .collect();

        let mut freed = Vec::with_capacity(expired_tuples.len());
        for tuple in expired_tuples {
            if let Some(a) = self.by_tuple.remove(&tuple) {
                self.tuple_by_relayed.remove(&a.relayed_addr);
                if let Some(list) = self.tuples_by_username.get_mut(&a.username) {
                    list.retain(|t| *t != tuple);
                }
                freed.push(a);
            }
        }

        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;
    use crate::timer::TimerWheel;

    fn tuple(port: u16) -> FiveTuple {
        FiveTuple {
            transport: Transport::Udp,
            client_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            server_addr: "127.0.0.1:3478".parse().unwrap(),
        }
    }

    fn allocation(tuple: FiveTuple, username: &str, relayed_port: u16) -> Allocation {
        let mut timers = TimerWheel::<()>::new();
        Allocation {
            transaction_id: [0; 12],
            username: username.to_string(),
            tuple,
            relayed_addr: format!("10.0.0.1:{relayed_port}").parse().unwrap(),
            permissions: Default::default(),
            channels: Default::default(),
            channel_by_peer: Default::default(),
            expire_timer: timers.arm(0, ()),
            expired: false,
        }
    }

    #[test]
    fn insert_rejects_duplicate_tuple() {
        let mut store = AllocationStore::new();
        let t = tuple(1);
        store.insert(allocation(t, "alice", 50000)).unwrap();

        let err = store.insert(allocation(t, "alice", 50001)).unwrap_err();
        assert_eq!(err, Error::AllocationMismatch);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn by_relayed_addr_resolves_back_to_the_allocation() {
        let mut store = AllocationStore::new();
        let t = tuple(1);
        store.insert(allocation(t, "alice", 50000)).unwrap();

        let relayed: SocketAddr = "10.0.0.1:50000".parse().unwrap();
        assert_eq!(store.by_relayed_addr(&relayed).unwrap().tuple, t);
    }

    #[test]
    fn count_for_username_ignores_expired_allocations() {
        let mut store = AllocationStore::new();
        store.insert(allocation(tuple(1), "alice", 50000)).unwrap();
        store.insert(allocation(tuple(2), "alice", 50001)).unwrap();
        assert_eq!(store.count_for_username("alice"), 2);

        store.expire(&tuple(1));
        assert_eq!(store.count_for_username("alice"), 1);
    }

    #[test]
    fn expire_hides_without_freeing_until_sweep() {
        let mut store = AllocationStore::new();
        let t = tuple(1);
        store.insert(allocation(t, "alice", 50000)).unwrap();

        store.expire(&t);
        assert!(store.get(&t).is_none());
        assert_eq!(store.len(), 0);

        let freed = store.sweep();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].relayed_addr, "10.0.0.1:50000".parse::<SocketAddr>().unwrap());

        // A second sweep with nothing tombstoned frees nothing.
        assert!(store.sweep().is_empty());
    }

    #[test]
    fn sweep_drops_the_username_and_relayed_addr_indices() {
        let mut store = AllocationStore::new();
        let t = tuple(1);
        store.insert(allocation(t, "alice", 50000)).unwrap();
        store.expire(&t);
        store.sweep();

        assert_eq!(store.count_for_username("alice"), 0);
        assert!(store.by_relayed_addr(&"10.0.0.1:50000".parse().unwrap()).is_none());

        // The slot is free again: re-inserting the same tuple succeeds.
        store.insert(allocation(t, "bob", 50002)).unwrap();
        assert_eq!(store.len(), 1);
    }
}
