use log::debug;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

use crate::utils::{DhtError, Result};

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// RPCs: one datagram per message
    Udp,
    /// Bulk transfer: length-prefixed frames
    Tcp,
}

/// An outbound channel to one peer.
pub enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl Connection {
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Connection::Udp(socket) => {
                if data.len() > MAX_DATAGRAM_SIZE {
                    return Err(DhtError::MessageTooLarge(data.len()));
                }
                socket.send(data).await?;
                Ok(())
            }
            Connection::Tcp(stream) => Transport::send_data(stream, data).await,
        }
    }

    /// Read one message: a single datagram, or one length-prefixed frame of
    /// at most `max_size` bytes.
    pub async fn receive(&mut self, max_size: usize) -> Result<Vec<u8>> {
        match self {
            Connection::Udp(socket) => {
                let mut buffer = vec![0u8; max_size.min(MAX_DATAGRAM_SIZE)];
                let len = socket.recv(&mut buffer).await?;
                buffer.truncate(len);
                Ok(buffer)
            }
            Connection::Tcp(stream) => Transport::receive_data(stream, max_size).await,
        }
    }
}

pub struct Transport;

impl Transport {
    /// Open a connection to `addr`. UDP "connects" an ephemeral socket so
    /// only datagrams from that peer are received on it.
    pub async fn connect(protocol: Protocol, addr: SocketAddr, limit: Duration) -> Result<Connection> {
        let connection = match protocol {
            Protocol::Udp => {
                let local: SocketAddr = if addr.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await.map_err(|e| {
                    DhtError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
                })?;
                Connection::Udp(socket)
            }
            Protocol::Tcp => {
                let stream = timeout(limit, TcpStream::connect(addr))
                    .await
                    .map_err(|_| DhtError::ConnectionFailed(format!("Connection to {} timed out", addr)))?
                    .map_err(|e| {
                        DhtError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
                    })?;
                Connection::Tcp(stream)
            }
        };

        debug!("Connected to {} over {:?}", addr, protocol);
        Ok(connection)
    }

    pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| DhtError::Network(format!("Failed to bind TCP {}: {}", addr, e)))
    }

    pub async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
        UdpSocket::bind(addr)
            .await
            .map_err(|e| DhtError::Network(format!("Failed to bind UDP {}: {}", addr, e)))
    }

    pub async fn send_data(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| DhtError::MessageTooLarge(data.len()))?;
        stream.write_u32(len).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn receive_data(stream: &mut TcpStream, max_size: usize) -> Result<Vec<u8>> {
        let len = stream.read_u32().await? as usize;

        if len > max_size {
            return Err(DhtError::MessageTooLarge(len));
        }

        let mut buffer = vec![0u8; len];
        stream.read_exact(&mut buffer).await?;

        Ok(buffer)
    }
}
