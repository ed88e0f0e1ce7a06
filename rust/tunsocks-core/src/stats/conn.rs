use super::Session;
use crate::conn::{PacketConn, ProxyStream};
use async_trait::async_trait;
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    /// Proxy stream that counts reads as download and writes as upload
    pub struct SessionConn<S> {
        #[pin]
        inner: S,
        session: Arc<Session>,
    }
}

impl<S> SessionConn<S> {
    pub fn new(inner: S, session: Arc<Session>) -> Self {
        Self { inner, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for SessionConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.session
                .add_download((buf.filled().len() - before) as u64);
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for SessionConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.session.add_upload(*n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<S: ProxyStream> ProxyStream for SessionConn<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Packet connection that counts `recv_from` as download and `send_to` as upload
pub struct SessionPacketConn {
    inner: Box<dyn PacketConn>,
    session: Arc<Session>,
}

impl SessionPacketConn {
    pub fn new(inner: Box<dyn PacketConn>, session: Arc<Session>) -> Self {
        Self { inner, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[async_trait]
impl PacketConn for SessionPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        self.session.add_download(n as u64);
        Ok((n, addr))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        self.session.add_upload(n as u64);
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.inner.close()
    }
}
