use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::debug;

use crate::codec::{RECV_BUF_CAPACITY, RECV_BUF_LEN};
use crate::error::ConfigError;

/// One read off the local socket.
#[derive(Debug)]
pub enum Inbound {
    Datagram { bytes: Bytes, peer: SocketAddr },
    /// The socket was closed; the receive loop should wind down.
    Closed,
}

/// Owns the bound local UDP socket. The engine's receive loop is the only
/// reader; any task may send through a shared reference.
pub struct UdpTransport {
    socket: UdpSocket,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddrV4) -> Result<Self, ConfigError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| ConfigError::Bind { addr, source })?;
        let _ = socket.set_recv_buffer_size(1024 * 1024);
        let _ = socket.set_send_buffer_size(1024 * 1024);
        socket
            .set_nonblocking(true)
            .map_err(|source| ConfigError::Bind { addr, source })?;
        socket
            .bind(&SocketAddr::V4(addr).into())
            .map_err(|source| ConfigError::Bind { addr, source })?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|source| ConfigError::Bind { addr, source })?;

        let (closed_tx, closed_rx) = watch::channel(false);
        Ok(Self {
            socket,
            closed_tx,
            closed_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Reads one datagram, or reports `Closed` once `close` has been called.
    /// Transient read errors surface as `Err`; the caller decides whether to
    /// keep looping.
    pub async fn recv(&self) -> io::Result<Inbound> {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Ok(Inbound::Closed);
        }

        let mut buf = BytesMut::with_capacity(RECV_BUF_CAPACITY);
        buf.resize(RECV_BUF_LEN, 0);

        tokio::select! {
            _ = closed.wait_for(|c| *c) => Ok(Inbound::Closed),
            res = self.socket.recv_from(&mut buf) => {
                let (len, peer) = res?;
                buf.truncate(len);
                Ok(Inbound::Datagram { bytes: buf.freeze(), peer })
            }
        }
    }

    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, dest).await?;
        Ok(())
    }

    /// Idempotent. A pending `recv` observes `Closed` instead of an error.
    pub fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        debug!("udp transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    #[tokio::test]
    async fn datagrams_round_trip_between_two_transports() {
        let a = UdpTransport::bind(loopback()).expect("bind a");
        let b = UdpTransport::bind(loopback()).expect("bind b");
        let b_addr = b.local_addr().expect("addr");

        a.send_to(b"ping", b_addr).await.expect("send");
        match b.recv().await.expect("recv") {
            Inbound::Datagram { bytes, peer } => {
                assert_eq!(&bytes[..], b"ping");
                assert_eq!(peer, a.local_addr().expect("addr"));
            }
            Inbound::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_recv() {
        let transport = std::sync::Arc::new(UdpTransport::bind(loopback()).expect("bind"));

        let receiver = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv().await })
        };

        // Give the receiver a moment to park on the socket.
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close();

        let got = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("recv did not observe close")
            .expect("join");
        assert!(matches!(got, Ok(Inbound::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sticky() {
        let transport = UdpTransport::bind(loopback()).expect("bind");
        transport.close();
        transport.close();
        assert!(matches!(
            transport.recv().await.expect("recv"),
            Inbound::Closed
        ));
    }
}
