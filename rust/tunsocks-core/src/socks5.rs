//! SOCKS5 client used to reach the upstream proxy
//!
//! Only what the relay needs is implemented: method negotiation (no auth or
//! username/password), CONNECT, UDP ASSOCIATE and the UDP request header for
//! unfragmented datagrams.

use crate::config::RelayConfig;
use crate::conn::{PacketConn, ProxyStream, TargetAddr};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Opens proxied connections on behalf of the relay handlers
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    /// CONNECT to `target` through the proxy at `proxy` (`host:port`)
    async fn dial_tcp(&self, proxy: &str, target: &TargetAddr) -> Result<Box<dyn ProxyStream>>;

    /// UDP ASSOCIATE for datagrams to `target`.
    ///
    /// Returns the packet connection and the relay address datagrams must be
    /// sent to.
    async fn dial_udp(
        &self,
        proxy: &str,
        target: &TargetAddr,
    ) -> Result<(Box<dyn PacketConn>, SocketAddr)>;
}

#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    credentials: Option<(String, String)>,
    dial_timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            credentials: None,
            dial_timeout,
        }
    }

    pub fn with_auth<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let dialer = Self::new(config.dial_timeout());
        match (&config.username, &config.password) {
            (Some(user), Some(pass)) => dialer.with_auth(user.clone(), pass.clone()),
            _ => dialer,
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    async fn with_deadline<T, F>(&self, proxy: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.dial_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ Error::Dial { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::dial_with_source(
                format!("SOCKS5 handshake with {} failed", proxy),
                proxy,
                e,
            )),
            Err(_) => Err(Error::dial(
                format!("SOCKS5 dial to {} timed out after {:?}", proxy, self.dial_timeout),
                proxy,
            )),
        }
    }

    async fn open_control(&self, proxy: &str) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(proxy).await.map_err(|e| {
            Error::dial_with_source(format!("Failed to connect to SOCKS5 server {}", proxy), proxy, e)
        })?;
        let _ = stream.set_nodelay(true);
        let auth = self
            .credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()));
        negotiate(&mut stream, auth).await?;
        Ok(stream)
    }
}

#[async_trait]
impl ProxyDialer for Socks5Dialer {
    async fn dial_tcp(&self, proxy: &str, target: &TargetAddr) -> Result<Box<dyn ProxyStream>> {
        let stream = self
            .with_deadline(proxy, async {
                let mut stream = self.open_control(proxy).await?;
                send_request(&mut stream, CMD_CONNECT, target).await?;
                read_reply(&mut stream).await?;
                Ok(stream)
            })
            .await?;

        tracing::debug!("SOCKS5: tunnel established to {} via {}", target, proxy);
        Ok(Box::new(stream))
    }

    async fn dial_udp(
        &self,
        proxy: &str,
        target: &TargetAddr,
    ) -> Result<(Box<dyn PacketConn>, SocketAddr)> {
        let (control, relay) = self
            .with_deadline(proxy, async {
                let mut control = self.open_control(proxy).await?;
                let unspecified = TargetAddr::Ip(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                send_request(&mut control, CMD_UDP_ASSOCIATE, &unspecified).await?;
                let bound = read_reply(&mut control).await?;
                let relay = relay_addr(bound, control.peer_addr()?).await?;
                Ok((control, relay))
            })
            .await?;

        let conn = Socks5UdpConn::bind(control, relay, target)
            .await
            .map_err(|e| Error::dial_with_source("Failed to set up UDP relay socket", proxy, e))?;

        tracing::debug!("SOCKS5: UDP relay {} associated for {}", relay, target);
        Ok((Box::new(conn), relay))
    }
}

/// Method negotiation, followed by RFC 1929 authentication when selected
pub async fn negotiate<S>(stream: &mut S, auth: Option<(&str, &str)>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if auth.is_some() {
        &[SOCKS_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[SOCKS_VERSION, 0x01, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS_VERSION {
        return Err(Error::protocol_with_info(
            "Invalid SOCKS5 version in response",
            "socks5",
        ));
    }

    match (response[1], auth) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USER_PASS, Some((user, pass))) => authenticate(stream, user, pass).await,
        (METHOD_USER_PASS, None) => Err(Error::protocol(
            "SOCKS5 server requires auth but no credentials provided",
        )),
        (METHOD_NONE_ACCEPTABLE, _) => Err(Error::protocol("SOCKS5 no acceptable auth method")),
        (method, _) => Err(Error::protocol(format!(
            "Unsupported SOCKS5 auth method: {}",
            method
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.is_empty() || username.len() > 255 || password.is_empty() || password.len() > 255 {
        return Err(Error::config("SOCKS5 credentials must be 1 to 255 bytes"));
    }

    let mut request = BytesMut::with_capacity(3 + username.len() + password.len());
    request.put_u8(AUTH_VERSION);
    request.put_u8(username.len() as u8);
    request.put_slice(username.as_bytes());
    request.put_u8(password.len() as u8);
    request.put_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
        return Err(Error::protocol("SOCKS5 authentication failed"));
    }
    Ok(())
}

async fn send_request<S>(stream: &mut S, command: u8, target: &TargetAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut request = BytesMut::with_capacity(22);
    request.put_slice(&[SOCKS_VERSION, command, 0x00]);
    encode_addr(&mut request, target)?;
    stream.write_all(&request).await?;
    Ok(())
}

/// Read a command reply and return the bound address it carries
async fn read_reply<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::protocol_with_info(
            "Invalid SOCKS5 version in response",
            "socks5",
        ));
    }
    if header[1] != 0x00 {
        let reason = match header[1] {
            0x01 => "General SOCKS server failure",
            0x02 => "Connection not allowed by ruleset",
            0x03 => "Network unreachable",
            0x04 => "Host unreachable",
            0x05 => "Connection refused",
            0x06 => "TTL expired",
            0x07 => "Command not supported",
            0x08 => "Address type not supported",
            _ => "Unknown error",
        };
        return Err(Error::protocol(format!("SOCKS5 request failed: {}", reason)));
    }
    read_addr(stream).await
}

async fn read_addr<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let atyp = stream.read_u8().await?;
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::from((octets, port))))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::from((octets, port))))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::protocol("SOCKS5 domain is not valid UTF-8"))?;
            Ok(TargetAddr::Domain(domain, port))
        }
        other => Err(Error::protocol(format!(
            "Unsupported address type in SOCKS5 response: {}",
            other
        ))),
    }
}

fn encode_addr(buf: &mut BytesMut, target: &TargetAddr) -> Result<()> {
    match target {
        TargetAddr::Domain(domain, port) => {
            if domain.is_empty() || domain.len() > 255 {
                return Err(Error::invalid_target(format!(
                    "domain length {} out of range",
                    domain.len()
                )));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
            buf.put_u16(*port);
        }
        TargetAddr::Ip(addr) => {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    buf.put_u8(ATYP_IPV4);
                    buf.put_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.put_u8(ATYP_IPV6);
                    buf.put_slice(&ip.octets());
                }
            }
            buf.put_u16(addr.port());
        }
    }
    Ok(())
}

/// `RSV RSV FRAG` followed by the destination address
fn encode_udp_header(target: &TargetAddr) -> Result<Bytes> {
    let mut header = BytesMut::with_capacity(262);
    header.put_slice(&[0x00, 0x00, 0x00]);
    encode_addr(&mut header, target)?;
    Ok(header.freeze())
}

/// Parse a UDP request header, returning its length and the address it names.
/// Fragmented datagrams are rejected.
fn parse_udp_header(packet: &[u8]) -> Result<(usize, TargetAddr)> {
    if packet.len() < 4 {
        return Err(Error::protocol("SOCKS5 UDP datagram too short"));
    }
    if packet[2] != 0x00 {
        return Err(Error::protocol("fragmented SOCKS5 UDP datagram"));
    }

    let (addr, len) = match packet[3] {
        ATYP_IPV4 => {
            let end = 4 + 4 + 2;
            let raw = packet
                .get(4..end)
                .ok_or_else(|| Error::protocol("truncated IPv4 header"))?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            (TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), end)
        }
        ATYP_IPV6 => {
            let end = 4 + 16 + 2;
            let raw = packet
                .get(4..end)
                .ok_or_else(|| Error::protocol("truncated IPv6 header"))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            (
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                end,
            )
        }
        ATYP_DOMAIN => {
            let len = *packet
                .get(4)
                .ok_or_else(|| Error::protocol("truncated domain header"))? as usize;
            let end = 5 + len + 2;
            let raw = packet
                .get(5..end)
                .ok_or_else(|| Error::protocol("truncated domain header"))?;
            let domain = String::from_utf8(raw[..len].to_vec())
                .map_err(|_| Error::protocol("SOCKS5 domain is not valid UTF-8"))?;
            let port = u16::from_be_bytes([raw[len], raw[len + 1]]);
            (TargetAddr::Domain(domain, port), end)
        }
        other => {
            return Err(Error::protocol(format!(
                "Unsupported address type in SOCKS5 datagram: {}",
                other
            )))
        }
    };
    Ok((len, addr))
}

/// Work out where datagrams go from the UDP ASSOCIATE reply.
///
/// An unspecified bound address means "same host as the control connection".
async fn relay_addr(bound: TargetAddr, control_peer: SocketAddr) -> Result<SocketAddr> {
    match bound {
        TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
            Ok(SocketAddr::new(control_peer.ip(), addr.port()))
        }
        TargetAddr::Ip(addr) => Ok(addr),
        TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| Error::protocol(format!("SOCKS5 relay host {} did not resolve", host))),
    }
}

/// Datagram connection through a SOCKS5 UDP association.
///
/// The association lives as long as its TCP control connection, which is
/// held by a background task until the conn is closed or the proxy hangs up.
pub struct Socks5UdpConn {
    socket: UdpSocket,
    relay: SocketAddr,
    header: Bytes,
    token: CancellationToken,
}

impl Socks5UdpConn {
    async fn bind(control: TcpStream, relay: SocketAddr, target: &TargetAddr) -> Result<Self> {
        let header = encode_udp_header(target)?;
        let bind_addr: SocketAddr = match relay {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let token = CancellationToken::new();
        tokio::spawn(hold_control(control, token.clone()));

        Ok(Self {
            socket,
            relay,
            header,
            token,
        })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "SOCKS5 UDP association closed")
    }
}

async fn hold_control(mut control: TcpStream, token: CancellationToken) {
    let mut buf = [0u8; 64];
    tokio::select! {
        _ = token.cancelled() => {}
        _ = async {
            loop {
                match control.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        } => {
            tracing::debug!("SOCKS5: control connection closed by proxy");
        }
    }
    token.cancel();
}

#[async_trait]
impl PacketConn for Socks5UdpConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let (n, from) = tokio::select! {
                _ = self.token.cancelled() => return Err(Self::closed()),
                received = self.socket.recv_from(buf) => received?,
            };
            if from != self.relay {
                tracing::debug!("SOCKS5: dropping datagram from {}, not the relay", from);
                continue;
            }
            match parse_udp_header(&buf[..n]) {
                Ok((header_len, addr)) => {
                    buf.copy_within(header_len..n, 0);
                    let source = match addr {
                        TargetAddr::Ip(addr) => addr,
                        TargetAddr::Domain(..) => from,
                    };
                    return Ok((n - header_len, source));
                }
                Err(e) => tracing::debug!("SOCKS5: dropping datagram from {}: {}", from, e),
            }
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(Self::closed());
        }
        let mut packet = BytesMut::with_capacity(self.header.len() + buf.len());
        packet.put_slice(&self.header);
        packet.put_slice(buf);
        self.socket.send_to(&packet, target).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for Socks5UdpConn {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
