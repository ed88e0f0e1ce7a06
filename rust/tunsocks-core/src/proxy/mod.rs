//! Relay handlers driven by the virtual TCP/IP stack

mod tcp;
mod udp;

pub use tcp::TcpHandler;
pub use udp::UdpHandler;

use crate::config::RelayConfig;
use crate::conn::{Network, TcpConn, UdpConn};
use crate::error::Result;
use crate::fakedns::FakeDns;
use crate::pool::{global_pool, BufferPool};
use crate::process::{ProcessResolver, SystemProcessResolver};
use crate::socks5::{ProxyDialer, Socks5Dialer};
use crate::stats::{Session, SessionStater};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Outbound name reported in access logs
pub(crate) const OUTBOUND_TAG: &str = "proxy";

/// Handles new TCP connections from the stack
#[async_trait]
pub trait TcpConnHandler: Send + Sync {
    /// Dial the proxy for `conn` and start relaying. The connection is dropped
    /// on error.
    async fn connect(&self, conn: Box<dyn TcpConn>, target: SocketAddr) -> Result<()>;
}

/// Handles UDP flows from the stack
#[async_trait]
pub trait UdpConnHandler: Send + Sync {
    /// Establish the flow. `target` is `None` when the stack could not parse
    /// the destination.
    async fn connect(&self, conn: Arc<dyn UdpConn>, target: Option<SocketAddr>) -> Result<()>;

    /// Forward an outbound datagram of an established flow
    async fn receive_to(&self, conn: &dyn UdpConn, data: &[u8], addr: SocketAddr) -> Result<()>;

    /// Tear the flow down. Idempotent.
    fn close(&self, conn: &dyn UdpConn);
}

/// Collaborators and settings shared by the handlers, fixed at construction
#[derive(Clone)]
pub struct RelayContext {
    pub proxy_addr: String,
    pub udp_timeout: Duration,
    pub dialer: Arc<dyn ProxyDialer>,
    pub fake_dns: Option<Arc<dyn FakeDns>>,
    pub stater: Option<Arc<dyn SessionStater>>,
    pub process: Arc<dyn ProcessResolver>,
    pub pool: Arc<BufferPool>,
}

impl RelayContext {
    pub fn new<S: Into<String>>(proxy_addr: S, dialer: Arc<dyn ProxyDialer>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            udp_timeout: Duration::from_secs(30),
            dialer,
            fake_dns: None,
            stater: None,
            process: Arc::new(SystemProcessResolver),
            pool: global_pool(),
        }
    }

    /// Context talking SOCKS5 to the proxy described by `config`
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        let dialer = Arc::new(Socks5Dialer::from_config(config));
        Ok(Self::new(config.proxy_addr(), dialer).with_udp_timeout(config.udp_timeout()))
    }

    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    pub fn with_fake_dns(mut self, fake_dns: Arc<dyn FakeDns>) -> Self {
        self.fake_dns = Some(fake_dns);
        self
    }

    pub fn with_session_stater(mut self, stater: Arc<dyn SessionStater>) -> Self {
        self.stater = Some(stater);
        self
    }

    pub fn with_process_resolver(mut self, process: Arc<dyn ProcessResolver>) -> Self {
        self.process = process;
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub(crate) fn fake_dns(&self) -> Option<&dyn FakeDns> {
        self.fake_dns.as_deref()
    }
}

pub(crate) fn new_session(
    process: &str,
    network: Network,
    dialer_addr: io::Result<SocketAddr>,
    client: SocketAddr,
    target: String,
) -> Arc<Session> {
    Arc::new(Session::new(
        process.to_string(),
        network,
        dialer_addr.map(|a| a.to_string()).unwrap_or_default(),
        client.to_string(),
        target,
    ))
}
