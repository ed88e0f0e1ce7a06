use super::{new_session, RelayContext, TcpConnHandler, OUTBOUND_TAG};
use crate::conn::{FlowKey, Network, ProxyStream, TcpConn};
use crate::error::Result;
use crate::fakedns::resolve_target;
use crate::logging::log_access;
use crate::pool::BufferPool;
use crate::stats::{SessionConn, SessionStater};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Upper bound on flushing and closing one side after the relay has ended
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relays TCP connections through SOCKS5 CONNECT
#[derive(Clone)]
pub struct TcpHandler {
    ctx: RelayContext,
}

impl TcpHandler {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx }
    }

    fn relay(&self, key: FlowKey, conn: Box<dyn TcpConn>, remote: Box<dyn ProxyStream>) {
        let flow = Arc::new(TcpFlow {
            key,
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            stater: self.ctx.stater.clone(),
        });

        let (local_read, local_write) = tokio::io::split(conn);
        let (remote_read, remote_write) = tokio::io::split(remote);

        tokio::spawn(copy_until_closed(
            local_read,
            remote_write,
            Arc::clone(&flow),
            Arc::clone(&self.ctx.pool),
            "upload",
        ));
        tokio::spawn(copy_until_closed(
            remote_read,
            local_write,
            flow,
            Arc::clone(&self.ctx.pool),
            "download",
        ));
    }
}

/// State shared by the two copy tasks of one connection
struct TcpFlow {
    key: FlowKey,
    token: CancellationToken,
    closed: AtomicBool,
    stater: Option<Arc<dyn SessionStater>>,
}

impl TcpFlow {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        if let Some(stater) = &self.stater {
            stater.remove_session(&self.key);
        }
        tracing::debug!("TCP flow {} closed", self.key);
    }
}

async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    flow: Arc<TcpFlow>,
    pool: Arc<BufferPool>,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();

    loop {
        let read = tokio::select! {
            _ = flow.token.cancelled() => break,
            r = reader.read(&mut buf[..]) => r,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("TCP {} read error on {}: {}", direction, flow.key, e);
                break;
            }
        };

        let written = tokio::select! {
            _ = flow.token.cancelled() => break,
            w = writer.write_all(&buf[..n]) => w,
        };
        if let Err(e) = written {
            tracing::warn!("TCP {} write error on {}: {}", direction, flow.key, e);
            break;
        }
    }

    drop(buf);
    flow.close();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown())
        .await
        .is_err()
    {
        tracing::debug!("TCP {} shutdown on {} timed out", direction, flow.key);
    }
}

#[async_trait]
impl TcpConnHandler for TcpHandler {
    async fn connect(&self, conn: Box<dyn TcpConn>, target: SocketAddr) -> Result<()> {
        let local = conn.local_addr();
        let target_addr = resolve_target(self.ctx.fake_dns(), target)?;

        let remote = match self
            .ctx
            .dialer
            .dial_tcp(&self.ctx.proxy_addr, &target_addr)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Dial {} for {} error: {}", self.ctx.proxy_addr, target_addr, e);
                return Err(e);
            }
        };

        let key = FlowKey::tcp(local, target);
        let process = self.ctx.process.process_name(Network::Tcp, local).await;

        let remote: Box<dyn ProxyStream> = match &self.ctx.stater {
            Some(stater) => {
                let session = new_session(
                    &process,
                    Network::Tcp,
                    remote.local_addr(),
                    local,
                    target_addr.to_string(),
                );
                stater.add_session(key, Arc::clone(&session));
                Box::new(SessionConn::new(remote, session))
            }
            None => remote,
        };

        self.relay(key, conn, remote);

        log_access(
            &process,
            OUTBOUND_TAG,
            Network::Tcp.as_str(),
            &local.to_string(),
            &target_addr.to_string(),
        );
        Ok(())
    }
}
