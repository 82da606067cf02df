//! Authentication (C4), request dispatch (C5) and the peer/client relay
//! path (C6), wired together over one [`AllocationStore`] and one
//! [`TimerWheel`].
//!
//! A single [`Dispatcher`] is meant to be owned by one event loop (§5):
//! every method takes `&mut self` and the caller's current time, and
//! returns an [`Outcome`] borrowing either the dispatcher's own scratch
//! buffer (for a STUN reply) or the caller's input buffer (for a relayed
//! payload) — no allocation on the hot path beyond what the codec needs
//! to build a response.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ahash::AHashMap;
use bytes::BytesMut;
use rand::Rng;

use codec::crypto::{Key, long_term_key};
use codec::message::attributes::{
    Attribute, ChannelNumber, Data, DontFragment, ErrorCode, EvenPort, Lifetime, MessageIntegrity,
    Nonce, Realm, RequestedAddressFamily, RequestedTransport, ReservationToken, UnknownAttributes,
    UserName, XorMappedAddress, XorPeerAddress, XorRelayedAddress, REQUESTED_TRANSPORT_UDP,
};
use codec::channel_data::ChannelData;
use codec::message::methods::{Method, MethodType};
use codec::message::{Message, MessageEncoder};
use codec::Attributes;

use crate::account::{AccountStore, generate_nonce, is_stale};
use crate::ports::{PortAllocator, PortRange};
use crate::store::{
    Allocation, AllocationStore, Channel, PeerKey, Permission, CHANNEL_LIFETIME_SECS,
    MAX_ALLOCATION_LIFETIME_SECS, PERMISSION_LIFETIME_SECS,
    RESERVATION_LIFETIME_SECS,
};
use crate::timer::{TimerId, TimerWheel};
use crate::{AddressFamily, FiveTuple, Transport};

/// How long a cached Allocate success response is kept so a retransmit
/// of the same transaction id gets the same answer instead of a second
/// allocation attempt (§4.5).
const RETRANSMIT_CACHE_LIFETIME_SECS: u64 = 16;

/// Read-only context handed to the dispatcher at startup; shared,
/// never mutated (§9).
pub struct Context {
    pub realm: String,
    pub nonce_key: String,
    pub max_client: usize,
    pub max_relay_per_client: usize,
    pub relay_address_v4: Ipv4Addr,
    pub relay_address_v6: Option<Ipv6Addr>,
    /// Allocation lifetime granted when a request omits LIFETIME, and the
    /// value echoed back on a retransmitted Allocate success (§6).
    pub default_allocation_lifetime: u32,
}

enum TimerPayload {
    Allocation(FiveTuple),
    Permission(FiveTuple, PeerKey),
    Channel(FiveTuple, u16),
    Reservation([u8; 8]),
    Retransmit(FiveTuple, [u8; 12]),
}

struct Reservation {
    port: u16,
    timer: TimerId,
}

/// What the caller should do after a `Dispatcher` call.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// Send these bytes back on the client's own socket.
    Reply(&'a [u8]),
    /// Forward `payload` to `peer` from the relayed socket bound at
    /// `relayed_addr`.
    Relay {
        relayed_addr: SocketAddr,
        peer: SocketAddr,
        payload: &'a [u8],
    },
    /// Nothing to send — a dropped packet or a processed indication.
    None,
}

pub struct Dispatcher<A: AccountStore> {
    context: Context,
    accounts: A,
    allocations: AllocationStore,
    timers: TimerWheel<TimerPayload>,
    ports: PortAllocator,
    reservations: AHashMap<[u8; 8], Reservation>,
    retransmits: AHashMap<(FiveTuple, [u8; 12]), BytesMut>,
    scratch: BytesMut,
}

impl<A: AccountStore> Dispatcher<A> {
    pub fn new(context: Context, accounts: A, port_range: PortRange) -> Self {
        Self {
            context,
            accounts,
            allocations: AllocationStore::new(),
            timers: TimerWheel::new(),
            ports: PortAllocator::new(port_range),
            reservations: AHashMap::new(),
            retransmits: AHashMap::new(),
            scratch: BytesMut::with_capacity(1500),
        }
    }

    pub fn allocations(&self) -> &AllocationStore {
        &self.allocations
    }

    /// Handle one datagram arriving from a client on `tuple`. Dispatches
    /// STUN messages by method and ChannelData frames straight to the
    /// relay path (§2).
    ///
    /// `attributes` is scratch space owned by the caller (the event
    /// loop), reused across calls via [`Attributes::clear`] — keeping it
    /// outside `Dispatcher` means a parsed [`Message`]'s lifetime never
    /// overlaps a later `&mut self` call in the same dispatch.
    pub fn handle_client_datagram<'a>(
        &'a mut self,
        tuple: FiveTuple,
        bytes: &'a [u8],
        attributes: &'a mut Attributes,
        now: u64,
    ) -> Outcome<'a> {
        if bytes.is_empty() {
            return Outcome::None;
        }

        attributes.clear();

        match bytes[0] >> 6 {
            0 => match Message::decode(bytes, attributes) {
                Ok(message) => self.dispatch_message(tuple, &message, now),
                Err(_) => Outcome::None,
            },
            1 => match ChannelData::decode(bytes) {
                Ok(frame) => self.relay_channel_data(tuple, frame.number(), frame.as_bytes()),
                Err(_) => Outcome::None,
            },
            _ => Outcome::None,
        }
    }

    /// Handle one datagram arriving on an allocation's relayed socket
    /// from `peer` (C6, peer → client).
    pub fn handle_peer_datagram<'a>(
        &'a mut self,
        relayed_addr: SocketAddr,
        peer: SocketAddr,
        payload: &'a [u8],
    ) -> Outcome<'a> {
        let Some(allocation) = self.allocations.by_relayed_addr(&relayed_addr) else {
            return Outcome::None;
        };

        if allocation.find_permission(&peer).is_none() {
            return Outcome::None;
        }

        if let Some(number) = allocation.find_channel_by_peer(&peer) {
            codec::channel_data::ChannelData {
                number,
                bytes: payload,
            }
            .encode(&mut self.scratch, allocation.tuple.transport != Transport::Udp);

            return Outcome::Reply(&self.scratch[..]);
        }

        let token: [u8; 12] = rand::rng().random();
        let mut encoder =
            MessageEncoder::new(Method::DataIndication, &token, &mut self.scratch);
        encoder.append::<XorPeerAddress>(peer);
        encoder.append::<Data>(payload);
        let _ = encoder.flush(None);

        Outcome::Reply(&self.scratch[..])
    }

    /// Drain expired timers and act on them: tear down allocations,
    /// evict permissions/channels, release reservations.
    pub fn poll_timers(&mut self, now: u64) {
        for (_, payload) in self.timers.poll(now) {
            match payload {
                TimerPayload::Allocation(tuple) => self.allocations.expire(&tuple),
                TimerPayload::Permission(tuple, peer) => {
                    if let Some(a) = self.allocations.get_mut(&tuple) {
                        a.permissions.remove(&peer);
                    }
                }
                TimerPayload::Channel(tuple, number) => {
                    if let Some(a) = self.allocations.get_mut(&tuple) {
                        if let Some(channel) = a.channels.remove(&number) {
                            a.channel_by_peer.remove(&channel.peer_addr);
                        }
                    }
                }
                TimerPayload::Reservation(token) => {
                    if let Some(reservation) = self.reservations.remove(&token) {
                        self.ports.restore(reservation.port);
                    }
                }
                TimerPayload::Retransmit(tuple, token) => {
                    self.retransmits.remove(&(tuple, token));
                }
            }
        }
    }

    /// Free the slots of any allocation tombstoned since the last
    /// sweep, restoring their relayed ports and returning the relayed
    /// addresses that are now gone, so the caller can tear down the
    /// corresponding relayed sockets. Call periodically, outside of any
    /// single packet's processing (§5).
    pub fn sweep(&mut self) -> Vec<SocketAddr> {
        let mut freed = Vec::new();
        for allocation in self.allocations.sweep() {
            self.ports.restore(allocation.relayed_addr.port());
            freed.push(allocation.relayed_addr);
        }
        freed
    }

    fn dispatch_message<'a>(
        &'a mut self,
        tuple: FiveTuple,
        message: &Message<'a>,
        now: u64,
    ) -> Outcome<'a> {
        let method = message.method();

        if method.is_error() {
            return Outcome::None;
        }

        match method {
            Method::Binding(MethodType::Request) => self.handle_binding(tuple, message),
            Method::Allocate(MethodType::Request) => self.handle_allocate(tuple, message, now),
            Method::Refresh(MethodType::Request) => self.handle_refresh(tuple, message, now),
            Method::CreatePermission(MethodType::Request) => {
                self.handle_create_permission(tuple, message, now)
            }
            Method::ChannelBind(MethodType::Request) => {
                self.handle_channel_bind(tuple, message, now)
            }
            Method::SendIndication => self.handle_send_indication(tuple, message),
            _ => Outcome::None,
        }
    }

    // -----------------------------------------------------------------
    // auth (C4)
    // -----------------------------------------------------------------

    /// Validation order of §4.4. Returns the derived key and the
    /// authenticated username on success; on failure, writes the
    /// appropriate error response into `self.scratch` and returns
    /// `Err(None)` when nothing should be sent at all (FINGERPRINT
    /// mismatch never reaches this far — it is checked by the caller
    /// via [`Message::checksum`]'s own FINGERPRINT-independent HMAC).
    fn authenticate<'a>(
        &'a mut self,
        message: &Message<'a>,
        now: u64,
    ) -> Result<(Key, &'a str), Option<&'a [u8]>> {
        let method = message.method();

        let Some(integrity) = message.get::<MessageIntegrity>() else {
            let nonce = generate_nonce(now, &self.context.nonce_key);
            return Err(Some(self.unauthenticated_error(
                method,
                message.token(),
                401,
                "Unauthorized",
                &nonce,
            )));
        };
        let _ = integrity;

        let (Some(username), Some(realm), Some(nonce)) =
            (message.get::<UserName>(), message.get::<Realm>(), message.get::<Nonce>())
        else {
            return Err(Some(self.error_response(method, message.token(), 400, "Bad Request", None)));
        };

        if is_stale(nonce, now, &self.context.nonce_key) {
            let fresh = generate_nonce(now, &self.context.nonce_key);
            return Err(Some(self.unauthenticated_error(
                method,
                message.token(),
                438,
                "Stale Nonce",
                &fresh,
            )));
        }

        let account = self
            .accounts
            .lookup(username, realm)
            .filter(|a| a.state == crate::account::AccountState::Authorized);

        let Some(account) = account else {
            let fresh = generate_nonce(now, &self.context.nonce_key);
            return Err(Some(self.unauthenticated_error(
                method,
                message.token(),
                401,
                "Unauthorized",
                &fresh,
            )));
        };

        let key = long_term_key(&account.username, &account.realm, &account.password);

        if message.checksum(&key).is_err() {
            let fresh = generate_nonce(now, &self.context.nonce_key);
            return Err(Some(self.unauthenticated_error(
                method,
                message.token(),
                401,
                "Unauthorized",
                &fresh,
            )));
        }

        Ok((key, username))
    }

    fn unauthenticated_error<'a>(
        &'a mut self,
        method: Method,
        token: &[u8],
        code: u16,
        reason: &str,
        nonce: &str,
    ) -> &'a [u8] {
        let token: [u8; 12] = token.try_into().unwrap_or([0; 12]);
        let mut encoder = MessageEncoder::new(method.error(), &token, &mut self.scratch);
        encoder.append::<ErrorCode>((code, reason));
        encoder.append::<Realm>(&self.context.realm);
        encoder.append::<Nonce>(nonce);
        let _ = encoder.flush(None);

        &self.scratch[..]
    }

    fn error_response<'a>(
        &'a mut self,
        method: Method,
        token: &[u8],
        code: u16,
        reason: &str,
        key: Option<&Key>,
    ) -> &'a [u8] {
        let token: [u8; 12] = token.try_into().unwrap_or([0; 12]);
        let mut encoder = MessageEncoder::new(method.error(), &token, &mut self.scratch);
        encoder.append::<ErrorCode>((code, reason));
        let _ = encoder.flush(key);

        &self.scratch[..]
    }

    fn unknown_attribute_error<'a>(
        &'a mut self,
        method: Method,
        token: &[u8],
        unknown: Vec<u16>,
        key: Option<&Key>,
    ) -> &'a [u8] {
        let token: [u8; 12] = token.try_into().unwrap_or([0; 12]);
        let mut encoder = MessageEncoder::new(method.error(), &token, &mut self.scratch);
        encoder.append::<ErrorCode>((420, "Unknown Attribute"));
        encoder.append::<UnknownAttributes>(unknown);
        let _ = encoder.flush(key);

        &self.scratch[..]
    }

    // -----------------------------------------------------------------
    // Binding (unauthenticated)
    // -----------------------------------------------------------------

    fn handle_binding<'a>(&'a mut self, tuple: FiveTuple, message: &Message<'a>) -> Outcome<'a> {
        let token: [u8; 12] = message.token().try_into().unwrap_or([0; 12]);
        let mut encoder =
            MessageEncoder::new(Method::Binding(MethodType::Response), &token, &mut self.scratch);
        encoder.append::<XorMappedAddress>(tuple.client_addr);
        let _ = encoder.flush(None);

        Outcome::Reply(&self.scratch[..])
    }

    // -----------------------------------------------------------------
    // Allocate
    // -----------------------------------------------------------------

    fn handle_allocate<'a>(
        &'a mut self,
        tuple: FiveTuple,
        message: &Message<'a>,
        now: u64,
    ) -> Outcome<'a> {
        let token_bytes: [u8; 12] = message.token().try_into().unwrap_or([0; 12]);

        if let Some(cached) = self.retransmits.get(&(tuple, token_bytes)) {
            self.scratch.clear();
            self.scratch.extend_from_slice(&cached[..]);
            return Outcome::Reply(&self.scratch[..]);
        }

        let (key, username) = match self.authenticate(message, now) {
            Ok(pair) => pair,
            Err(Some(bytes)) => return Outcome::Reply(bytes),
            Err(None) => return Outcome::None,
        };

        if let Some(existing) = self.allocations.get(&tuple) {
            if existing.transaction_id == token_bytes {
                // The retransmit cache entry already expired but the
                // allocation it produced is still live: resend an
                // equivalent success instead of failing I1's uniqueness
                // check on a fresh insert.
                let relayed_addr = existing.relayed_addr;
                let mut encoder =
                    MessageEncoder::extend(message.method().success(), message, &mut self.scratch);
                encoder.append::<XorRelayedAddress>(relayed_addr);
                encoder.append::<XorMappedAddress>(tuple.client_addr);
                encoder.append::<Lifetime>(self.context.default_allocation_lifetime);
                let _ = encoder.flush(Some(&key));
                return Outcome::Reply(&self.scratch[..]);
            }

            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                437,
                "Allocation Mismatch",
                Some(&key),
            ));
        }

        if !message.unknown_attributes().is_empty() {
            return Outcome::Reply(self.unknown_attribute_error(
                message.method(),
                message.token(),
                message.unknown_attributes().to_vec(),
                Some(&key),
            ));
        }

        match message.get::<RequestedTransport>() {
            Some(REQUESTED_TRANSPORT_UDP) => {}
            _ => {
                return Outcome::Reply(self.error_response(
                    message.method(),
                    message.token(),
                    442,
                    "Unsupported Transport Protocol",
                    Some(&key),
                ));
            }
        }

        if message.get::<DontFragment>().is_some() {
            return Outcome::Reply(self.unknown_attribute_error(
                message.method(),
                message.token(),
                vec![codec::message::attributes::AttributeType::DontFragment as u16],
                Some(&key),
            ));
        }

        let reservation_token = message.get::<ReservationToken>();
        let even_port = message.get::<EvenPort>();

        if reservation_token.is_some() && even_port.is_some() {
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                400,
                "Bad Request",
                Some(&key),
            ));
        }

        // §4.5 checks RESERVATION-TOKEN before REQUESTED-ADDRESS-FAMILY
        // before the allocation quota — a bogus token must fail with 508
        // even for a client already at its quota.
        let mut granted_token = None;
        let port = if let Some(requested) = reservation_token {
            match self.reservations.remove(&requested) {
                Some(reservation) => {
                    self.timers.cancel(reservation.timer);
                    reservation.port
                }
                None => {
                    return Outcome::Reply(self.error_response(
                        message.method(),
                        message.token(),
                        508,
                        "Insufficient Capacity",
                        Some(&key),
                    ));
                }
            }
        } else if let Some(reserve_sibling) = even_port {
            match self.allocate_even_port(reserve_sibling, now, &mut granted_token) {
                Some(port) => port,
                None => {
                    return Outcome::Reply(self.error_response(
                        message.method(),
                        message.token(),
                        508,
                        "Insufficient Capacity",
                        Some(&key),
                    ));
                }
            }
        } else {
            match self.ports.alloc(None) {
                Some(port) => port,
                None => {
                    return Outcome::Reply(self.error_response(
                        message.method(),
                        message.token(),
                        508,
                        "Insufficient Capacity",
                        Some(&key),
                    ));
                }
            }
        };

        let family = match message.get::<RequestedAddressFamily>() {
            Some(1) | None => AddressFamily::V4,
            Some(2) => {
                if self.context.relay_address_v6.is_none() {
                    self.ports.restore(port);
                    return Outcome::Reply(self.error_response(
                        message.method(),
                        message.token(),
                        440,
                        "Address Family not Supported",
                        Some(&key),
                    ));
                }
                AddressFamily::V6
            }
            Some(_) => {
                self.ports.restore(port);
                return Outcome::Reply(self.error_response(
                    message.method(),
                    message.token(),
                    440,
                    "Address Family not Supported",
                    Some(&key),
                ));
            }
        };

        if self.allocations.len() >= self.context.max_client
            || self.allocations.count_for_username(username) >= self.context.max_relay_per_client
        {
            self.ports.restore(port);
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                486,
                "Allocation Quota Reached",
                Some(&key),
            ));
        }

        let relay_ip = match family {
            AddressFamily::V4 => IpAddr::V4(self.context.relay_address_v4),
            AddressFamily::V6 => IpAddr::V6(self.context.relay_address_v6.unwrap()),
        };
        let relayed_addr = SocketAddr::new(relay_ip, port);

        let lifetime = clamp_lifetime(message.get::<Lifetime>(), self.context.default_allocation_lifetime);
        let expire_timer = self
            .timers
            .arm(now + lifetime as u64, TimerPayload::Allocation(tuple));

        let allocation = Allocation {
            transaction_id: token_bytes,
            username: username.to_string(),
            tuple,
            relayed_addr,
            permissions: Default::default(),
            channels: Default::default(),
            channel_by_peer: Default::default(),
            expire_timer,
            expired: false,
        };

        if self.allocations.insert(allocation).is_err() {
            self.ports.restore(port);
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                500,
                "Server Error",
                Some(&key),
            ));
        }

        let mut encoder = MessageEncoder::extend(message.method().success(), message, &mut self.scratch);
        encoder.append::<XorRelayedAddress>(relayed_addr);
        encoder.append::<XorMappedAddress>(tuple.client_addr);
        encoder.append::<Lifetime>(lifetime);
        if let Some(token) = granted_token {
            encoder.append::<ReservationToken>(token);
        }
        let _ = encoder.flush(Some(&key));

        let retransmit_timer = self.timers.arm(
            now + RETRANSMIT_CACHE_LIFETIME_SECS,
            TimerPayload::Retransmit(tuple, token_bytes),
        );
        let _ = retransmit_timer;
        self.retransmits.insert((tuple, token_bytes), self.scratch.clone());

        Outcome::Reply(&self.scratch[..])
    }

    /// Allocate an even port; when `reserve` is set, also reserve its
    /// odd sibling as a 30-second reservation token.
    fn allocate_even_port(
        &mut self,
        reserve: bool,
        now: u64,
        granted_token: &mut Option<[u8; 8]>,
    ) -> Option<u16> {
        let range = self.ports.port_range();
        let mut candidate = None;

        for offset in 0..range.len() {
            let port = range.start + offset as u16;
            if port % 2 != 0 || !range.contains(port + 1) {
                continue;
            }
            if self.ports.claim(port) {
                candidate = Some(port);
                break;
            }
        }

        let port = candidate?;

        if reserve {
            if self.ports.claim(port + 1) {
                let token: [u8; 8] = rand::rng().random();
                let timer = self
                    .timers
                    .arm(now + RESERVATION_LIFETIME_SECS, TimerPayload::Reservation(token));
                self.reservations.insert(
                    token,
                    Reservation {
                        port: port + 1,
                        timer,
                    },
                );
                *granted_token = Some(token);
            }
        }

        Some(port)
    }

    // -----------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------

    fn handle_refresh<'a>(
        &'a mut self,
        tuple: FiveTuple,
        message: &Message<'a>,
        now: u64,
    ) -> Outcome<'a> {
        let (key, username) = match self.authenticate(message, now) {
            Ok(pair) => pair,
            Err(Some(bytes)) => return Outcome::Reply(bytes),
            Err(None) => return Outcome::None,
        };

        match self.allocations.get(&tuple) {
            None => {
                return Outcome::Reply(self.error_response(
                    message.method(),
                    message.token(),
                    437,
                    "Allocation Mismatch",
                    Some(&key),
                ));
            }
            Some(allocation) if allocation.username != username => {
                // The 5-tuple exists but belongs to a different user: treat
                // it the same as no allocation at all rather than leaking
                // its presence to an unrelated, differently-keyed request.
                return Outcome::Reply(self.error_response(
                    message.method(),
                    message.token(),
                    437,
                    "Allocation Mismatch",
                    Some(&key),
                ));
            }
            Some(_) => {}
        }

        let requested = message.get::<Lifetime>();

        if requested == Some(0) {
            self.allocations.expire(&tuple);

            let mut encoder =
                MessageEncoder::extend(message.method().success(), message, &mut self.scratch);
            encoder.append::<Lifetime>(0);
            let _ = encoder.flush(Some(&key));

            return Outcome::Reply(&self.scratch[..]);
        }

        let lifetime = clamp_lifetime(requested, self.context.default_allocation_lifetime);
        let allocation = self.allocations.get_mut(&tuple).expect("checked above");
        self.timers.reset(allocation.expire_timer, now + lifetime as u64);

        let mut encoder =
            MessageEncoder::extend(message.method().success(), message, &mut self.scratch);
        encoder.append::<Lifetime>(lifetime);
        let _ = encoder.flush(Some(&key));

        Outcome::Reply(&self.scratch[..])
    }

    // -----------------------------------------------------------------
    // CreatePermission
    // -----------------------------------------------------------------

    fn handle_create_permission<'a>(
        &'a mut self,
        tuple: FiveTuple,
        message: &Message<'a>,
        now: u64,
    ) -> Outcome<'a> {
        let (key, _username) = match self.authenticate(message, now) {
            Ok(pair) => pair,
            Err(Some(bytes)) => return Outcome::Reply(bytes),
            Err(None) => return Outcome::None,
        };

        if self.allocations.get(&tuple).is_none() {
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                437,
                "Allocation Mismatch",
                Some(&key),
            ));
        }

        let peers: Vec<SocketAddr> = message.get_all::<XorPeerAddress>().collect();
        if peers.is_empty() {
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                400,
                "Bad Request",
                Some(&key),
            ));
        }

        let allocation = self.allocations.get_mut(&tuple).expect("checked above");
        for peer in &peers {
            install_permission(allocation, &mut self.timers, *peer, now);
        }

        let mut encoder =
            MessageEncoder::extend(message.method().success(), message, &mut self.scratch);
        let _ = encoder.flush(Some(&key));

        Outcome::Reply(&self.scratch[..])
    }

    // -----------------------------------------------------------------
    // ChannelBind
    // -----------------------------------------------------------------

    fn handle_channel_bind<'a>(
        &'a mut self,
        tuple: FiveTuple,
        message: &Message<'a>,
        now: u64,
    ) -> Outcome<'a> {
        let (key, _username) = match self.authenticate(message, now) {
            Ok(pair) => pair,
            Err(Some(bytes)) => return Outcome::Reply(bytes),
            Err(None) => return Outcome::None,
        };

        if self.allocations.get(&tuple).is_none() {
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                437,
                "Allocation Mismatch",
                Some(&key),
            ));
        }

        let (Some(number), Some(peer)) =
            (message.get::<ChannelNumber>(), message.get::<XorPeerAddress>())
        else {
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                400,
                "Bad Request",
                Some(&key),
            ));
        };

        if !codec::channel_data::CHANNEL_NUMBER_RANGE.contains(&number) {
            return Outcome::Reply(self.error_response(
                message.method(),
                message.token(),
                400,
                "Bad Request",
                Some(&key),
            ));
        }

        let allocation = self.allocations.get_mut(&tuple).expect("checked above");

        if let Some(existing) = allocation.channels.get(&number) {
            if existing.peer_addr != peer {
                return Outcome::Reply(self.error_response(
                    message.method(),
                    message.token(),
                    400,
                    "Bad Request",
                    Some(&key),
                ));
            }
        }
        if let Some(existing_number) = allocation.channel_by_peer.get(&peer) {
            if *existing_number != number {
                return Outcome::Reply(self.error_response(
                    message.method(),
                    message.token(),
                    400,
                    "Bad Request",
                    Some(&key),
                ));
            }
        }

        if let Some(channel) = allocation.channels.get(&number) {
            self.timers.reset(channel.timer, now + CHANNEL_LIFETIME_SECS);
        } else {
            let timer = self
                .timers
                .arm(now + CHANNEL_LIFETIME_SECS, TimerPayload::Channel(tuple, number));
            allocation.channels.insert(number, Channel {
                number,
                peer_addr: peer,
                timer,
            });
            allocation.channel_by_peer.insert(peer, number);
        }

        install_permission(allocation, &mut self.timers, peer, now);

        let mut encoder =
            MessageEncoder::extend(message.method().success(), message, &mut self.scratch);
        let _ = encoder.flush(Some(&key));

        Outcome::Reply(&self.scratch[..])
    }

    // -----------------------------------------------------------------
    // Send indication / ChannelData (client → peer)
    // -----------------------------------------------------------------

    fn handle_send_indication<'a>(
        &'a mut self,
        tuple: FiveTuple,
        message: &Message<'a>,
    ) -> Outcome<'a> {
        if message.get::<DontFragment>().is_some() {
            return Outcome::None;
        }

        let (Some(peer), Some(data)) =
            (message.get::<XorPeerAddress>(), message.get::<Data>())
        else {
            return Outcome::None;
        };

        let Some(allocation) = self.allocations.get(&tuple) else {
            return Outcome::None;
        };

        if allocation.find_permission(&peer).is_none() {
            return Outcome::None;
        }

        Outcome::Relay {
            relayed_addr: allocation.relayed_addr,
            peer,
            payload: data,
        }
    }

    fn relay_channel_data<'a>(
        &'a mut self,
        tuple: FiveTuple,
        number: u16,
        payload: &'a [u8],
    ) -> Outcome<'a> {
        let Some(allocation) = self.allocations.get(&tuple) else {
            return Outcome::None;
        };

        let Some(channel) = allocation.find_channel_by_number(number) else {
            return Outcome::None;
        };

        if allocation.find_permission(&channel.peer_addr).is_none() {
            return Outcome::None;
        }

        Outcome::Relay {
            relayed_addr: allocation.relayed_addr,
            peer: channel.peer_addr,
            payload,
        }
    }
}

fn install_permission(
    allocation: &mut Allocation,
    timers: &mut TimerWheel<TimerPayload>,
    peer: SocketAddr,
    now: u64,
) {
    let key = PeerKey::of(&peer);

    if let Some(permission) = allocation.permissions.get(&key) {
        timers.reset(permission.timer, now + PERMISSION_LIFETIME_SECS);
    } else {
        let timer = timers.arm(
            now + PERMISSION_LIFETIME_SECS,
            TimerPayload::Permission(allocation.tuple, key),
        );
        allocation.permissions.insert(key, Permission { timer });
    }
}

/// Clamp a requested lifetime to `[0, 3600]`, defaulting to 600 s when
/// absent (§4.3).
fn clamp_lifetime(requested: Option<u32>, default: u32) -> u32 {
    match requested {
        None => default,
        Some(0) => 0,
        Some(value) => value.min(MAX_ALLOCATION_LIFETIME_SECS as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountState, StaticAccountStore};

    const REALM: &str = "localhost";
    const USERNAME: &str = "alice";
    const PASSWORD: &str = "secret";

    fn context() -> Context {
        Context {
            realm: REALM.to_string(),
            nonce_key: "nonce-key".to_string(),
            max_client: 16,
            max_relay_per_client: 4,
            relay_address_v4: Ipv4Addr::new(203, 0, 113, 1),
            relay_address_v6: None,
            default_allocation_lifetime: 600,
        }
    }

    fn accounts() -> StaticAccountStore {
        let mut store = StaticAccountStore::new();
        store.insert(Account {
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
            realm: REALM.to_string(),
            state: AccountState::Authorized,
        });
        store
    }

    fn client_tuple() -> FiveTuple {
        FiveTuple {
            transport: Transport::Udp,
            client_addr: "127.0.0.1:4000".parse().unwrap(),
            server_addr: "127.0.0.1:3478".parse().unwrap(),
        }
    }

    fn encode_allocate(token: &[u8; 12], nonce: Option<&str>) -> BytesMut {
        let mut bytes = BytesMut::new();
        let mut encoder = MessageEncoder::new(Method::Allocate(MethodType::Request), token, &mut bytes);
        encoder.append::<RequestedTransport>(REQUESTED_TRANSPORT_UDP);

        let key = if let Some(nonce) = nonce {
            encoder.append::<UserName>(USERNAME);
            encoder.append::<Realm>(REALM);
            encoder.append::<Nonce>(nonce);
            Some(long_term_key(USERNAME, REALM, PASSWORD))
        } else {
            None
        };

        encoder.flush(key.as_ref()).unwrap();
        bytes
    }

    /// Decode a reply and pull its NONCE out as an owned string, so the
    /// borrow on the dispatcher's scratch buffer ends before the next
    /// `&mut self` call.
    fn extract_nonce(bytes: &[u8]) -> String {
        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).unwrap();
        message.get::<Nonce>().unwrap().to_string()
    }

    #[test]
    fn allocate_without_message_integrity_is_challenged() {
        let mut dispatcher = Dispatcher::new(context(), accounts(), PortRange::default());
        let token = [1u8; 12];
        let request = encode_allocate(&token, None);
        let mut attributes = Attributes::default();

        match dispatcher.handle_client_datagram(client_tuple(), &request, &mut attributes, 0) {
            Outcome::Reply(bytes) => {
                let mut scratch = Attributes::default();
                let message = Message::decode(bytes, &mut scratch).unwrap();
                assert_eq!(message.method(), Method::Allocate(MethodType::Error));
                assert_eq!(message.get::<ErrorCode>().unwrap().0, 401);
                assert!(message.get::<Nonce>().is_some());
            }
            other => panic!("expected a challenge reply, got {other:?}"),
        }

        assert_eq!(dispatcher.allocations().len(), 0);
    }

    #[test]
    fn authenticated_allocate_creates_a_reachable_allocation() {
        let mut dispatcher = Dispatcher::new(context(), accounts(), PortRange::default());
        let mut attributes = Attributes::default();
        let tuple = client_tuple();

        let challenge_token = [2u8; 12];
        let challenge = encode_allocate(&challenge_token, None);
        let nonce = match dispatcher.handle_client_datagram(tuple, &challenge, &mut attributes, 0) {
            Outcome::Reply(bytes) => extract_nonce(bytes),
            other => panic!("expected a challenge reply, got {other:?}"),
        };

        let token = [3u8; 12];
        let request = encode_allocate(&token, Some(&nonce));

        match dispatcher.handle_client_datagram(tuple, &request, &mut attributes, 0) {
            Outcome::Reply(bytes) => {
                let mut scratch = Attributes::default();
                let message = Message::decode(bytes, &mut scratch).unwrap();
                assert_eq!(message.method(), Method::Allocate(MethodType::Response));
                assert!(message.get::<XorRelayedAddress>().is_some());
            }
            other => panic!("expected an allocate success, got {other:?}"),
        }

        let allocation = dispatcher.allocations().get(&tuple).expect("allocation should exist");
        assert_eq!(allocation.username, USERNAME);
        assert_eq!(allocation.relayed_addr.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)));
    }

    #[test]
    fn refresh_with_zero_lifetime_tears_down_the_allocation() {
        let mut dispatcher = Dispatcher::new(context(), accounts(), PortRange::default());
        let mut attributes = Attributes::default();
        let tuple = client_tuple();

        let nonce = match dispatcher.handle_client_datagram(tuple, &encode_allocate(&[4u8; 12], None), &mut attributes, 0) {
            Outcome::Reply(bytes) => extract_nonce(bytes),
            other => panic!("expected a challenge reply, got {other:?}"),
        };

        dispatcher.handle_client_datagram(tuple, &encode_allocate(&[5u8; 12], Some(&nonce)), &mut attributes, 0);
        assert_eq!(dispatcher.allocations().len(), 1);

        let mut bytes = BytesMut::new();
        let mut encoder = MessageEncoder::new(Method::Refresh(MethodType::Request), &[6u8; 12], &mut bytes);
        encoder.append::<UserName>(USERNAME);
        encoder.append::<Realm>(REALM);
        encoder.append::<Nonce>(&nonce);
        encoder.append::<Lifetime>(0);
        encoder.flush(Some(&long_term_key(USERNAME, REALM, PASSWORD))).unwrap();

        dispatcher.handle_client_datagram(tuple, &bytes, &mut attributes, 0);
        assert!(dispatcher.allocations().get(&tuple).is_none());

        let freed = dispatcher.sweep();
        assert_eq!(freed.len(), 1);
    }
}
