//! Per-allocation relayed UDP sockets.
//!
//! Each allocation needs its own bound UDP socket so a peer can reach it
//! at a distinct relayed address. Every such socket is driven by its own
//! lightweight task on the same current-thread runtime; the task never
//! touches [`Dispatcher`](service::Dispatcher) state, it only moves bytes
//! between the wire and the `inbound` channel the main loop owns.

use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::MAX_DATAGRAM_SIZE;

/// A datagram received on a relayed socket, bound for the dispatcher.
pub struct RelayDatagram {
    pub relayed_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub payload: Bytes,
}

pub struct RelaySocket {
    outbound: UnboundedSender<(SocketAddr, Bytes)>,
    task: JoinHandle<()>,
}

impl RelaySocket {
    pub async fn spawn(
        relayed_addr: SocketAddr,
        inbound: UnboundedSender<RelayDatagram>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(relayed_addr).await?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
        let task = tokio::spawn(run(socket, relayed_addr, inbound, outbound_rx));

        Ok(Self {
            outbound: outbound_tx,
            task,
        })
    }

    /// Queue a datagram to be sent to `peer_addr` from this relayed port.
    pub fn send(&self, peer_addr: SocketAddr, payload: Bytes) {
        let _ = self.outbound.send((peer_addr, payload));
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn run(
    socket: UdpSocket,
    relayed_addr: SocketAddr,
    inbound: UnboundedSender<RelayDatagram>,
    mut outbound_rx: UnboundedReceiver<(SocketAddr, Bytes)>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, peer_addr) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("relayed socket {relayed_addr} recv error: {err}");
                        continue;
                    }
                };

                let datagram = RelayDatagram {
                    relayed_addr,
                    peer_addr,
                    payload: Bytes::copy_from_slice(&buf[..len]),
                };

                if inbound.send(datagram).is_err() {
                    break;
                }
            }
            Some((peer_addr, payload)) = outbound_rx.recv() => {
                if let Err(err) = socket.send_to(&payload, peer_addr).await {
                    log::warn!("relayed socket {relayed_addr} send error: {err}");
                }
            }
            else => break,
        }
    }
}
