//! TCP and TLS control-channel connections.
//!
//! A client may reach the server over a stream transport instead of UDP
//! (§6). Frames are length-prefixed: a STUN message carries its length in
//! the header, a ChannelData frame in its own 2-byte length field, padded
//! up to a multiple of 4 bytes on stream transports. Each connection is
//! driven by its own task that only frames bytes; decoding and dispatch
//! still happen on the single dispatcher task, reached over `inbound`.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use codec::channel_data::ChannelData;
use codec::message::Message;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[cfg(feature = "ssl")]
use tokio_rustls::server::TlsStream;

use super::MAX_DATAGRAM_SIZE;

/// Frames larger than this are rejected outright; a conforming client
/// never needs anywhere close to it for a STUN/TURN control message.
const MAX_FRAME_SIZE: usize = 4096;

/// A complete frame read off a stream connection, bound for the
/// dispatcher.
pub struct StreamFrame {
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub payload: Bytes,
}

enum MaybeTlsStream {
    Plain(TcpStream),
    #[cfg(feature = "ssl")]
    Tls(Box<TlsStream<TcpStream>>),
}

enum Reader {
    Plain(ReadHalf<TcpStream>),
    #[cfg(feature = "ssl")]
    Tls(ReadHalf<Box<TlsStream<TcpStream>>>),
}

enum Writer {
    Plain(WriteHalf<TcpStream>),
    #[cfg(feature = "ssl")]
    Tls(WriteHalf<Box<TlsStream<TcpStream>>>),
}

impl MaybeTlsStream {
    fn split(self) -> (Reader, Writer) {
        match self {
            Self::Plain(stream) => {
                let (rx, tx) = split(stream);
                (Reader::Plain(rx), Writer::Plain(tx))
            }
            #[cfg(feature = "ssl")]
            Self::Tls(stream) => {
                let (rx, tx) = split(*stream);
                (Reader::Tls(rx), Writer::Tls(tx))
            }
        }
    }
}

impl Reader {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use tokio::io::AsyncReadExt;
        match self {
            Self::Plain(rx) => rx.read(buf).await,
            #[cfg(feature = "ssl")]
            Self::Tls(rx) => rx.read(buf).await,
        }
    }
}

impl Writer {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(tx) => tx.write_all(buf).await,
            #[cfg(feature = "ssl")]
            Self::Tls(tx) => tx.write_all(buf).await,
        }
    }
}

pub struct StreamConnection {
    outbound: UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl StreamConnection {
    pub fn spawn_plain(
        stream: TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        inbound: UnboundedSender<StreamFrame>,
    ) -> Self {
        Self::spawn(MaybeTlsStream::Plain(stream), client_addr, server_addr, inbound)
    }

    #[cfg(feature = "ssl")]
    pub fn spawn_tls(
        stream: Box<TlsStream<TcpStream>>,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        inbound: UnboundedSender<StreamFrame>,
    ) -> Self {
        Self::spawn(MaybeTlsStream::Tls(stream), client_addr, server_addr, inbound)
    }

    fn spawn(
        stream: MaybeTlsStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        inbound: UnboundedSender<StreamFrame>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let task = tokio::spawn(run(stream, client_addr, server_addr, inbound, outbound_rx));

        Self {
            outbound: outbound_tx,
            task,
        }
    }

    pub fn send(&self, payload: Bytes) {
        let _ = self.outbound.send(payload);
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn run(
    stream: MaybeTlsStream,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    inbound: UnboundedSender<StreamFrame>,
    mut outbound_rx: UnboundedReceiver<Bytes>,
) {
    let (mut reader, mut writer) = stream.split();
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
    let mut chunk = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = reader.read(&mut chunk) => {
                let n = match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };

                buf.extend_from_slice(&chunk[..n]);

                loop {
                    match frame_size(&buf) {
                        Some(size) if size > MAX_FRAME_SIZE => {
                            log::warn!("tcp frame too large from {client_addr}: {size} bytes");
                            return;
                        }
                        Some(size) if buf.len() >= size => {
                            let payload = buf.split_to(size).freeze();
                            let frame = StreamFrame { client_addr, server_addr, payload };
                            if inbound.send(frame).is_err() {
                                return;
                            }
                        }
                        _ => break,
                    }
                }

                if buf.len() > MAX_FRAME_SIZE {
                    log::warn!("tcp buffer overrun from {client_addr}, closing");
                    return;
                }
            }
            Some(payload) = outbound_rx.recv() => {
                if writer.write_all(&payload).await.is_err() {
                    break;
                }
            }
            else => break,
        }
    }
}

/// Size of the next complete frame buffered so far, or `None` if not
/// enough bytes have arrived yet to tell.
fn frame_size(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }

    match buf[0] >> 6 {
        0 => Message::message_size(buf).ok(),
        1 => ChannelData::message_size(buf, true).ok(),
        _ => None,
    }
}
