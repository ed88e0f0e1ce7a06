//! In-memory stand-ins for the stack, the proxy and the registry


use crate::conn::{FlowKey, PacketConn, ProxyStream, TargetAddr, TcpConn, UdpConn};
use crate::error::{Error, Result};
use crate::fakedns::FakeDns;
use crate::pool::BufferPool;
use crate::process::NoopProcessResolver;
use crate::proxy::RelayContext;
use crate::socks5::ProxyDialer;
use crate::stats::{Session, SessionStater, SimpleSessionStater};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Datagram = (Vec<u8>, SocketAddr);

pub fn test_context(dialer: Arc<MockDialer>) -> RelayContext {
    RelayContext::new("127.0.0.1:1080", dialer)
        .with_process_resolver(Arc::new(NoopProcessResolver))
        .with_buffer_pool(Arc::new(BufferPool::new(2048, 8)))
}

/// Poll `cond` until it holds, failing the test after a few seconds
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

/// Virtual TCP connection backed by an in-memory pipe
pub struct MockTcpConn {
    io: DuplexStream,
    local: SocketAddr,
}

impl MockTcpConn {
    /// Returns the conn and the application's end of it
    pub fn pair(local: SocketAddr) -> (Self, DuplexStream) {
        let (io, app) = tokio::io::duplex(4096);
        (Self { io, local }, app)
    }
}

impl AsyncRead for MockTcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockTcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl TcpConn for MockTcpConn {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Failure injected into a [`MockProxyStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    None,
    /// Every read fails
    Read,
    /// Every write fails
    Write,
    /// Shutdown never completes
    StuckShutdown,
}

/// Proxy stream backed by an in-memory pipe
pub struct MockProxyStream {
    io: DuplexStream,
    fault: StreamFault,
}

fn reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by proxy")
}

impl AsyncRead for MockProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fault == StreamFault::Read {
            return Poll::Ready(Err(reset()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fault == StreamFault::Write {
            return Poll::Ready(Err(reset()));
        }
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fault == StreamFault::StuckShutdown {
            return Poll::Pending;
        }
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl ProxyStream for MockProxyStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }
}

/// Virtual UDP flow that records what the relay delivers to it
pub struct MockUdpConn {
    local: SocketAddr,
    delivered: mpsc::UnboundedSender<Datagram>,
    closes: AtomicUsize,
}

impl MockUdpConn {
    pub fn new(local: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<Datagram>) {
        let (delivered, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            local,
            delivered,
            closes: AtomicUsize::new(0),
        });
        (conn, rx)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UdpConn for MockUdpConn {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn write_from(&self, data: &[u8], from: SocketAddr) -> io::Result<usize> {
        if self.close_count() > 0 {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        self.delivered
            .send((data.to_vec(), from))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))?;
        Ok(data.len())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Packet connection whose far side is a pair of channels
pub struct ChannelPacketConn {
    local: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    sent: mpsc::UnboundedSender<Datagram>,
    closed: CancellationToken,
}

/// Test-side handle of a [`ChannelPacketConn`]
pub struct PacketPeer {
    /// Datagrams written by the relay
    pub sent: mpsc::UnboundedReceiver<Datagram>,
    /// Datagrams to hand to the relay's `recv_from`
    pub inbound: mpsc::UnboundedSender<Datagram>,
    closed: CancellationToken,
}

impl PacketPeer {
    pub fn closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl ChannelPacketConn {
    pub fn pair(local: SocketAddr) -> (Self, PacketPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let conn = Self {
            local,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            sent: sent_tx,
            closed: closed.clone(),
        };
        let peer = PacketPeer {
            sent: sent_rx,
            inbound: inbound_tx,
            closed,
        };
        (conn, peer)
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "packet conn closed")
    }
}

#[async_trait]
impl PacketConn for ChannelPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbound = tokio::select! {
            _ = self.closed.cancelled() => return Err(Self::closed_error()),
            guard = self.inbound.lock() => guard,
        };
        let received = tokio::select! {
            _ = self.closed.cancelled() => return Err(Self::closed_error()),
            received = inbound.recv() => received,
        };
        match received {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionReset, "relay gone")),
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Self::closed_error());
        }
        self.sent
            .send((buf.to_vec(), target))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "relay gone"))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Receiving ends for everything a [`MockDialer`] hands out
pub struct DialerPeers {
    pub tcp: mpsc::UnboundedReceiver<DuplexStream>,
    pub udp: mpsc::UnboundedReceiver<PacketPeer>,
}

/// Dialer that records targets and connects to in-memory peers
pub struct MockDialer {
    tcp_targets: Mutex<Vec<TargetAddr>>,
    udp_targets: Mutex<Vec<TargetAddr>>,
    tcp_peers: Option<mpsc::UnboundedSender<DuplexStream>>,
    udp_peers: Option<mpsc::UnboundedSender<PacketPeer>>,
    relay: SocketAddr,
    fault: StreamFault,
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, DialerPeers) {
        Self::with_fault(StreamFault::None)
    }

    /// A dialer whose TCP streams fail as described by `fault`
    pub fn with_fault(fault: StreamFault) -> (Arc<Self>, DialerPeers) {
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            tcp_targets: Mutex::new(Vec::new()),
            udp_targets: Mutex::new(Vec::new()),
            tcp_peers: Some(tcp_tx),
            udp_peers: Some(udp_tx),
            relay: SocketAddr::from(([127, 0, 0, 1], 40000)),
            fault,
        });
        (
            dialer,
            DialerPeers {
                tcp: tcp_rx,
                udp: udp_rx,
            },
        )
    }

    /// A dialer for which every dial fails
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            tcp_targets: Mutex::new(Vec::new()),
            udp_targets: Mutex::new(Vec::new()),
            tcp_peers: None,
            udp_peers: None,
            relay: SocketAddr::from(([127, 0, 0, 1], 40000)),
            fault: StreamFault::None,
        })
    }

    pub fn tcp_targets(&self) -> Vec<TargetAddr> {
        self.tcp_targets.lock().clone()
    }

    pub fn udp_targets(&self) -> Vec<TargetAddr> {
        self.udp_targets.lock().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.tcp_targets.lock().len() + self.udp_targets.lock().len()
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }
}

#[async_trait]
impl ProxyDialer for MockDialer {
    async fn dial_tcp(&self, proxy: &str, target: &TargetAddr) -> Result<Box<dyn ProxyStream>> {
        self.tcp_targets.lock().push(target.clone());
        let peers = self
            .tcp_peers
            .as_ref()
            .ok_or_else(|| Error::dial("connection refused", proxy))?;
        let (ours, theirs) = tokio::io::duplex(4096);
        peers
            .send(theirs)
            .map_err(|_| Error::dial("test peer gone", proxy))?;
        Ok(Box::new(MockProxyStream {
            io: ours,
            fault: self.fault,
        }))
    }

    async fn dial_udp(
        &self,
        proxy: &str,
        target: &TargetAddr,
    ) -> Result<(Box<dyn PacketConn>, SocketAddr)> {
        self.udp_targets.lock().push(target.clone());
        let peers = self
            .udp_peers
            .as_ref()
            .ok_or_else(|| Error::dial("connection refused", proxy))?;
        let (conn, peer) = ChannelPacketConn::pair(SocketAddr::from(([127, 0, 0, 1], 50001)));
        peers
            .send(peer)
            .map_err(|_| Error::dial("test peer gone", proxy))?;
        Ok((Box::new(conn), self.relay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaterEvent {
    Add(FlowKey),
    Remove(FlowKey),
}

/// Registry that records every call on top of the default one
#[derive(Default)]
pub struct RecordingStater {
    events: Mutex<Vec<StaterEvent>>,
    inner: SimpleSessionStater,
}

impl RecordingStater {
    pub fn events(&self) -> Vec<StaterEvent> {
        self.events.lock().clone()
    }

    pub fn removes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, StaterEvent::Remove(_)))
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }
}

impl SessionStater for RecordingStater {
    fn add_session(&self, key: FlowKey, session: Arc<Session>) {
        self.events.lock().push(StaterEvent::Add(key));
        self.inner.add_session(key, session);
    }

    fn remove_session(&self, key: &FlowKey) {
        self.events.lock().push(StaterEvent::Remove(*key));
        self.inner.remove_session(key);
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions()
    }
}

/// Fixed fake-IP table
#[derive(Default)]
pub struct StaticFakeDns(HashMap<IpAddr, String>);

impl StaticFakeDns {
    pub fn with(ip: &str, host: &str) -> Self {
        let mut table = HashMap::new();
        if let Ok(ip) = ip.parse() {
            table.insert(ip, host.to_string());
        }
        Self(table)
    }
}

impl FakeDns for StaticFakeDns {
    fn ip_to_host(&self, ip: IpAddr) -> Option<String> {
        self.0.get(&ip).cloned()
    }
}
