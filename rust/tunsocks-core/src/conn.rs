//! Connection contracts shared by the virtual TCP/IP stack, the SOCKS5 dialer
//! and the relay handlers.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport of a relayed flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Network> for tunsocks_sock2proc::SocketProtocol {
    fn from(network: Network) -> Self {
        match network {
            Network::Tcp => tunsocks_sock2proc::SocketProtocol::Tcp,
            Network::Udp => tunsocks_sock2proc::SocketProtocol::Udp,
        }
    }
}

/// Identity of one virtual connection.
///
/// UDP flows are keyed by the local socket address the stack reconstructed.
/// TCP connections also carry the original destination, since one local port
/// may have live connections to several destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub network: Network,
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
}

impl FlowKey {
    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            local,
            remote: Some(remote),
        }
    }

    pub fn udp(local: SocketAddr) -> Self {
        Self {
            network: Network::Udp,
            local,
            remote: None,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.local)?;
        if let Some(remote) = self.remote {
            write!(f, "->{}", remote)?;
        }
        Ok(())
    }
}

/// Destination handed to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Domain(String, u16),
    Ip(SocketAddr),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Domain(domain, port) => write!(f, "{}", join_host_port(domain, *port)),
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Domain(_, port) => *port,
            TargetAddr::Ip(addr) => addr.port(),
        }
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Domain(domain, _) => domain.clone(),
            TargetAddr::Ip(addr) => addr.ip().to_string(),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// One intercepted TCP stream presented by the virtual stack.
///
/// Closing is shutting down the write side and dropping the value.
pub trait TcpConn: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_addr(&self) -> SocketAddr;
}

/// One intercepted UDP flow presented by the virtual stack
#[async_trait]
pub trait UdpConn: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Deliver a datagram to the local application as if sent by `from`
    async fn write_from(&self, data: &[u8], from: SocketAddr) -> io::Result<usize>;

    /// Must be idempotent; the relay may call it from several tasks.
    fn close(&self);
}

/// Stream connection to the proxy
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl ProxyStream for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

impl<S: ProxyStream + ?Sized> ProxyStream for Box<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// Packet connection to the proxy's UDP relay
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Release the underlying sockets. Pending and later calls fail.
    fn close(&self);
}
