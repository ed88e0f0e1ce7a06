use super::{new_session, RelayContext, UdpConnHandler, OUTBOUND_TAG};
use crate::conn::{FlowKey, Network, PacketConn, UdpConn};
use crate::error::{Error, Result};
use crate::fakedns::resolve_target;
use crate::logging::log_access;
use crate::stats::{Session, SessionPacketConn};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct UdpFlow {
    /// Distinguishes successive flows that reuse the same local address
    id: u64,
    conn: Arc<dyn UdpConn>,
    remote_addr: SocketAddr,
    remote_conn: Arc<dyn PacketConn>,
    token: CancellationToken,
}

/// Relays UDP flows through a SOCKS5 UDP association per flow
#[derive(Clone)]
pub struct UdpHandler {
    ctx: RelayContext,
    flows: Arc<DashMap<FlowKey, UdpFlow>>,
    next_id: Arc<AtomicU64>,
}

impl UdpHandler {
    pub fn new(ctx: RelayContext) -> Self {
        Self {
            ctx,
            flows: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of established flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn has_flow(&self, local: SocketAddr) -> bool {
        self.flows.contains_key(&FlowKey::udp(local))
    }

    /// Copy datagrams from the relay back into the virtual flow until the flow
    /// idles out, fails or is closed elsewhere.
    async fn fetch_udp_input(
        self,
        conn: Arc<dyn UdpConn>,
        input: Arc<dyn PacketConn>,
        addr: SocketAddr,
        id: u64,
        token: CancellationToken,
    ) {
        let _close = CloseGuard {
            handler: &self,
            conn: conn.as_ref(),
            id,
        };
        let mut buf = self.ctx.pool.get();

        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                r = tokio::time::timeout(self.ctx.udp_timeout, input.recv_from(&mut buf[..])) => r,
            };
            let n = match received {
                Ok(Ok((n, _))) => n,
                Ok(Err(e)) => {
                    tracing::warn!("failed to read UDP data from remote: {}", e);
                    break;
                }
                Err(_) => {
                    tracing::debug!(
                        "UDP flow {} idle for {:?}, closing",
                        conn.local_addr(),
                        self.ctx.udp_timeout
                    );
                    break;
                }
            };

            if let Err(e) = conn.write_from(&buf[..n], addr).await {
                tracing::warn!("failed to write UDP data: {}", e);
                break;
            }
        }
    }

    fn register(&self, key: FlowKey, session: Option<Arc<Session>>) {
        if let (Some(stater), Some(session)) = (&self.ctx.stater, session) {
            stater.add_session(key, session);
        }
    }

    /// Remove the flow entry, restricted to flow `id` when given, and release
    /// everything it owned. Returns whether an entry was removed.
    fn teardown(&self, conn: &dyn UdpConn, id: Option<u64>) -> bool {
        let key = FlowKey::udp(conn.local_addr());
        let removed = match self.flows.entry(key) {
            Entry::Occupied(entry) if owns(entry.get(), conn, id) => {
                // Deregister under the entry lock
                if let Some(stater) = &self.ctx.stater {
                    stater.remove_session(&key);
                }
                Some(entry.remove())
            }
            _ => None,
        };

        match removed {
            Some(flow) => {
                release(flow);
                tracing::debug!("UDP flow {} closed", key);
                true
            }
            None => {
                if id.is_none() {
                    conn.close();
                }
                false
            }
        }
    }
}

/// A reader owns flow `id`; an explicit close owns the flow of that exact conn
fn owns(flow: &UdpFlow, conn: &dyn UdpConn, id: Option<u64>) -> bool {
    match id {
        Some(id) => flow.id == id,
        None => same_conn(&flow.conn, conn),
    }
}

fn same_conn(a: &Arc<dyn UdpConn>, b: &dyn UdpConn) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), b)
}

/// Close the virtual flow, stop its reader and close the relay connection
fn release(flow: UdpFlow) {
    flow.conn.close();
    flow.token.cancel();
    flow.remote_conn.close();
}

/// Closes the flow owned by a reader task on every exit path
struct CloseGuard<'a> {
    handler: &'a UdpHandler,
    conn: &'a dyn UdpConn,
    id: u64,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.handler.teardown(self.conn, Some(self.id));
    }
}

#[async_trait]
impl UdpConnHandler for UdpHandler {
    async fn connect(&self, conn: Arc<dyn UdpConn>, target: Option<SocketAddr>) -> Result<()> {
        let local = conn.local_addr();
        let Some(target) = target else {
            tracing::warn!("UDP target is invalid: {}", local);
            return Err(Error::invalid_target(format!("UDP target is invalid: {}", local)));
        };

        // Replace with a domain name if the target IP is a fake IP.
        let target_addr = resolve_target(self.ctx.fake_dns(), target)?;

        let (remote_conn, remote_addr) = match self
            .ctx
            .dialer
            .dial_udp(&self.ctx.proxy_addr, &target_addr)
            .await
        {
            Ok(dialed) => dialed,
            Err(e) => {
                tracing::warn!("DialUDP {} error: {}", self.ctx.proxy_addr, e);
                return Err(e);
            }
        };

        let key = FlowKey::udp(local);
        let process = self.ctx.process.process_name(Network::Udp, local).await;

        let session = self.ctx.stater.as_ref().map(|_| {
            new_session(
                &process,
                Network::Udp,
                remote_conn.local_addr(),
                local,
                target_addr.to_string(),
            )
        });
        let remote_conn: Arc<dyn PacketConn> = match &session {
            Some(session) => Arc::new(SessionPacketConn::new(remote_conn, Arc::clone(session))),
            None => Arc::from(remote_conn),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let flow = UdpFlow {
            id,
            conn: Arc::clone(&conn),
            remote_addr,
            remote_conn: Arc::clone(&remote_conn),
            token: token.clone(),
        };

        // Registry updates happen under the entry lock, the old flow's removal
        // strictly before the new flow's addition.
        let stale = match self.flows.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(stater) = &self.ctx.stater {
                    stater.remove_session(&key);
                }
                let stale = entry.insert(flow);
                self.register(key, session);
                Some(stale)
            }
            Entry::Vacant(entry) => {
                entry.insert(flow);
                self.register(key, session);
                None
            }
        };
        if let Some(stale) = stale {
            // The stack reused the address before the old flow was closed
            tracing::debug!("UDP flow {} replaced", key);
            if same_conn(&stale.conn, conn.as_ref()) {
                stale.token.cancel();
                stale.remote_conn.close();
            } else {
                release(stale);
            }
        }

        tokio::spawn(self.clone().fetch_udp_input(
            Arc::clone(&conn),
            remote_conn,
            target,
            id,
            token,
        ));

        log_access(
            &process,
            OUTBOUND_TAG,
            Network::Udp.as_str(),
            &local.to_string(),
            &target_addr.to_string(),
        );
        Ok(())
    }

    async fn receive_to(&self, conn: &dyn UdpConn, data: &[u8], addr: SocketAddr) -> Result<()> {
        let key = FlowKey::udp(conn.local_addr());
        let flow = self
            .flows
            .get(&key)
            .map(|flow| (flow.remote_addr, Arc::clone(&flow.remote_conn)));

        let Some((remote_addr, remote_conn)) = flow else {
            self.close(conn);
            return Err(Error::FlowNotFound {
                local: key.local,
                remote: addr,
            });
        };

        if let Err(e) = remote_conn.send_to(data, remote_addr).await {
            self.close(conn);
            return Err(Error::transport_with_source(
                format!("write remote failed: {}", e),
                e,
            ));
        }
        Ok(())
    }

    fn close(&self, conn: &dyn UdpConn) {
        self.teardown(conn, None);
    }
}
