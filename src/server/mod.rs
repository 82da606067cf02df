//! The single-threaded event loop (§5): one task owns the [`Dispatcher`]
//! and every client-facing socket; relayed UDP sockets and TCP/TLS
//! connections each get their own lightweight task that only moves bytes,
//! funnelling everything back through channels so the dispatcher itself
//! is never touched off this one task.

mod relay;
mod stream;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::Bytes;
use codec::Attributes;
use service::account::StaticAccountStore;
use service::dispatcher::{Context as DispatcherContext, Dispatcher, Outcome};
use service::ports::PortRange;
use service::{FiveTuple, Transport};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

#[cfg(feature = "tcp")]
use tokio::net::TcpListener;

#[cfg(feature = "ssl")]
use std::sync::Arc;
#[cfg(feature = "ssl")]
use tokio_rustls::TlsAcceptor;
#[cfg(feature = "ssl")]
use tokio_rustls::rustls::ServerConfig;
#[cfg(feature = "ssl")]
use tokio_rustls::rustls::pki_types::pem::PemObject;
#[cfg(feature = "ssl")]
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::Config;
use relay::{RelayDatagram, RelaySocket};
use stream::{StreamConnection, StreamFrame};

/// Large enough for any STUN/TURN message or ChannelData frame this
/// server will ever build or accept.
const MAX_DATAGRAM_SIZE: usize = 1500;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Bring up every configured listener and drive the dispatcher until the
/// process is asked to stop.
pub async fn run(config: Config, accounts: StaticAccountStore) -> Result<()> {
    let udp_listen = SocketAddr::new(IpAddr::V4(config.listen_address), config.udp_port);
    let client_socket = UdpSocket::bind(udp_listen).await?;
    log::info!("udp listening on {udp_listen}");

    #[cfg(feature = "tcp")]
    let tcp_listen = SocketAddr::new(IpAddr::V4(config.listen_address), config.tcp_port);
    #[cfg(feature = "tcp")]
    let tcp_listener = TcpListener::bind(tcp_listen).await?;
    #[cfg(feature = "tcp")]
    log::info!("tcp listening on {tcp_listen}");

    #[cfg(feature = "ssl")]
    let tls_acceptor = if config.tls {
        Some(build_tls_acceptor(&config)?)
    } else {
        None
    };

    let context = DispatcherContext {
        realm: config.realm.clone(),
        nonce_key: config.nonce_key.clone(),
        max_client: config.max_client,
        max_relay_per_client: config.max_relay_per_client,
        relay_address_v4: config.listen_address,
        relay_address_v6: config.listen_addressv6,
        default_allocation_lifetime: config.allocation_lifetime,
    };

    let mut dispatcher = Dispatcher::new(context, accounts, PortRange::default());
    let mut attributes = Attributes::default();
    let mut udp_buf = vec![0u8; MAX_DATAGRAM_SIZE];

    let mut relay_sockets: HashMap<SocketAddr, RelaySocket> = HashMap::new();
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<RelayDatagram>();

    #[cfg_attr(not(feature = "tcp"), allow(unused_mut))]
    let mut stream_connections: HashMap<SocketAddr, StreamConnection> = HashMap::new();
    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<StreamFrame>();

    let mut sweep_timer = interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            result = client_socket.recv_from(&mut udp_buf) => {
                let (len, client_addr) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("udp recv error: {err}");
                        continue;
                    }
                };

                let tuple = FiveTuple { transport: Transport::Udp, client_addr, server_addr: udp_listen };
                let now = unix_now();

                match dispatcher.handle_client_datagram(tuple, &udp_buf[..len], &mut attributes, now) {
                    Outcome::Reply(bytes) => {
                        if let Err(err) = client_socket.send_to(bytes, client_addr).await {
                            log::warn!("udp send error: {err}");
                        }
                    }
                    Outcome::Relay { relayed_addr, peer, payload } => {
                        if let Some(socket) = relay_sockets.get(&relayed_addr) {
                            socket.send(peer, Bytes::copy_from_slice(payload));
                        }
                    }
                    Outcome::None => {}
                }

                spawn_relay_socket_if_new(&mut dispatcher, &mut relay_sockets, tuple, &relay_tx).await;
            }

            #[cfg(feature = "tcp")]
            result = tcp_listener.accept() => {
                let (socket, client_addr) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("tcp accept error: {err}");
                        continue;
                    }
                };

                let _ = socket.set_nodelay(true);

                #[cfg(feature = "ssl")]
                if let Some(acceptor) = tls_acceptor.clone() {
                    let inbound = stream_tx.clone();
                    let server_addr = tcp_listen;
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(accepted) => {
                                StreamConnection::spawn_tls(Box::new(accepted), client_addr, server_addr, inbound);
                            }
                            Err(err) => log::warn!("tls handshake failed for {client_addr}: {err}"),
                        }
                    });
                    continue;
                }

                let connection = StreamConnection::spawn_plain(socket, client_addr, tcp_listen, stream_tx.clone());
                stream_connections.insert(client_addr, connection);
            }

            Some(datagram) = relay_rx.recv() => {
                let target = dispatcher
                    .allocations()
                    .by_relayed_addr(&datagram.relayed_addr)
                    .map(|allocation| (allocation.tuple.client_addr, allocation.tuple.transport));

                if let Some((client_addr, transport)) = target {
                    if let Outcome::Reply(bytes) =
                        dispatcher.handle_peer_datagram(datagram.relayed_addr, datagram.peer_addr, &datagram.payload)
                    {
                        match transport {
                            Transport::Udp => {
                                if let Err(err) = client_socket.send_to(bytes, client_addr).await {
                                    log::warn!("udp send error: {err}");
                                }
                            }
                            Transport::Tcp | Transport::Tls => {
                                if let Some(connection) = stream_connections.get(&client_addr) {
                                    connection.send(Bytes::copy_from_slice(bytes));
                                }
                            }
                        }
                    }
                }
            }

            #[cfg(feature = "tcp")]
            Some(frame) = stream_rx.recv() => {
                let tuple = FiveTuple {
                    transport: Transport::Tcp,
                    client_addr: frame.client_addr,
                    server_addr: frame.server_addr,
                };
                let now = unix_now();

                match dispatcher.handle_client_datagram(tuple, &frame.payload, &mut attributes, now) {
                    Outcome::Reply(bytes) => {
                        if let Some(connection) = stream_connections.get(&frame.client_addr) {
                            connection.send(Bytes::copy_from_slice(bytes));
                        }
                    }
                    Outcome::Relay { relayed_addr, peer, payload } => {
                        if let Some(socket) = relay_sockets.get(&relayed_addr) {
                            socket.send(peer, Bytes::copy_from_slice(payload));
                        }
                    }
                    Outcome::None => {}
                }

                spawn_relay_socket_if_new(&mut dispatcher, &mut relay_sockets, tuple, &relay_tx).await;
            }

            _ = sweep_timer.tick() => {
                dispatcher.poll_timers(unix_now());

                for relayed_addr in dispatcher.sweep() {
                    if let Some(socket) = relay_sockets.remove(&relayed_addr) {
                        socket.shutdown();
                    }
                }
            }
        }
    }
}

/// If the last dispatched request created a fresh allocation, bind its
/// relayed UDP socket. A no-op for every other request, and for a
/// retransmitted Allocate that reuses an existing allocation.
async fn spawn_relay_socket_if_new(
    dispatcher: &mut Dispatcher<StaticAccountStore>,
    relay_sockets: &mut HashMap<SocketAddr, RelaySocket>,
    tuple: FiveTuple,
    relay_tx: &mpsc::UnboundedSender<RelayDatagram>,
) {
    let Some(relayed_addr) = dispatcher.allocations().get(&tuple).map(|a| a.relayed_addr) else {
        return;
    };

    if relay_sockets.contains_key(&relayed_addr) {
        return;
    }

    match RelaySocket::spawn(relayed_addr, relay_tx.clone()).await {
        Ok(socket) => {
            relay_sockets.insert(relayed_addr, socket);
        }
        Err(err) => log::error!("failed to bind relayed socket {relayed_addr}: {err}"),
    }
}

#[cfg(feature = "ssl")]
fn build_tls_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let cert_file = config
        .cert_file
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("tls enabled but cert-file is not set"))?;
    let key_file = config
        .private_key_file
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("tls enabled but private-key-file is not set"))?;

    let certs = CertificateDer::pem_file_iter(cert_file)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key_file)?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
