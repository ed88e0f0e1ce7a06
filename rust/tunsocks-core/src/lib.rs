pub mod config;
pub mod conn;
pub mod error;
pub mod fakedns;
pub mod logging;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod socks5;
pub mod stats;

#[cfg(test)]
mod tests;

pub use config::{FakeIpConfig, LogLevel, RelayConfig, StatsConfig};
pub use conn::{
    join_host_port, FlowKey, Network, PacketConn, ProxyStream, TargetAddr, TcpConn, UdpConn,
};
pub use error::{Error, Result};
pub use fakedns::{resolve_target, FakeDns};
pub use logging::{init_logging, log_access};
pub use pool::{global_pool, BufferPool, PooledBuf, POOL_BUFFER_SIZE};
pub use process::{NoopProcessResolver, ProcessResolver, SystemProcessResolver, UNKNOWN_PROCESS};
pub use proxy::{RelayContext, TcpConnHandler, TcpHandler, UdpConnHandler, UdpHandler};
pub use socks5::{ProxyDialer, Socks5Dialer, Socks5UdpConn};
pub use stats::{
    CompletedSession, Session, SessionConn, SessionPacketConn, SessionStater, SessionSummary,
    SimpleSessionStater, MAX_COMPLETED_SESSIONS,
};

pub use tunsocks_dns::FakeIpPool;
