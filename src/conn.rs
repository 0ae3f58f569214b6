//! Annotated TCP connection
//!
//! `Conn` wraps an accepted `TcpStream` and is the only owner of the
//! socket for its whole life. It counts bytes in both directions at the
//! transport layer, carries the per-connection progress record that the
//! dispatch pipeline fills in as the handshake reveals information, and
//! runs a close callback exactly once when the transport goes away.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pin_project_lite::pin_project;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::Mode;

/// TCP keepalive period applied to both sides of every bridged session.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Progress record for one connection.
///
/// Fields are populated step by step by the dispatch task that owns the
/// connection; nothing else writes them. The close callback and the
/// console read them through the shared handle.
#[derive(Debug, Default)]
pub struct ConnTags {
    pub handshake_done: Option<Instant>,
    pub dial_done: Option<Instant>,
    pub server_name: Option<String>,
    pub mode: Option<Mode>,
    pub alpn: Option<String>,
    pub subject: Option<String>,
    /// Metrics key of the backend this connection was dispatched to.
    pub backend_key: Option<String>,
    /// When set, the close callback emits the end-of-connection report.
    pub report_end: bool,
}

/// Shared per-connection state: counters, addresses, tags, close hook.
pub struct ConnInfo {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    start: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    tags: Mutex<ConnTags>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnInfo {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Bytes read from the external socket.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes written to the external socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn with_tags<R>(&self, f: impl FnOnce(&mut ConnTags) -> R) -> R {
        f(&mut self.tags.lock())
    }

    /// Register the close callback. Only one callback is supported; the
    /// dispatch engine registers it right after accept.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(f));
    }

    /// Run the close callback if it has not run yet.
    pub(crate) fn fire_close(&self) {
        let cb = self.on_close.lock().take();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// One-line connection description for log records.
    pub fn describe(&self) -> String {
        let tags = self.tags.lock();
        let mut out = String::new();
        match tags.subject.as_deref() {
            Some(s) if !s.is_empty() => {
                out.push('[');
                out.push_str(s);
                out.push_str("] ");
            }
            _ => out.push_str("[-] "),
        }
        out.push_str(&self.peer_addr.to_string());
        if let Some(sn) = tags.server_name.as_deref() {
            out.push_str(" -> ");
            out.push_str(sn);
            if let Some(mode) = tags.mode {
                out.push('|');
                out.push_str(mode.as_str());
            }
            if let Some(alpn) = tags.alpn.as_deref() {
                out.push(':');
                out.push_str(alpn);
            }
        }
        out
    }
}

impl std::fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnInfo")
            .field("peer_addr", &self.peer_addr)
            .field("bytes_received", &self.bytes_received())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

pin_project! {
    /// Accepted TCP connection with byte accounting and a close-once hook.
    pub struct Conn {
        #[pin]
        inner: TcpStream,
        info: Arc<ConnInfo>,
    }

    impl PinnedDrop for Conn {
        fn drop(this: Pin<&mut Self>) {
            this.info.fire_close();
        }
    }
}

impl Conn {
    pub fn new(inner: TcpStream, peer_addr: SocketAddr) -> std::io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            inner,
            info: Arc::new(ConnInfo {
                peer_addr,
                local_addr,
                start: Instant::now(),
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                tags: Mutex::new(ConnTags::default()),
                on_close: Mutex::new(None),
            }),
        })
    }

    /// Shared handle to the counters and tags; survives moves of the
    /// connection into a TLS session or an internal HTTP server.
    pub fn info(&self) -> Arc<ConnInfo> {
        Arc::clone(&self.info)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.info.peer_addr
    }

    /// Observe pending bytes without consuming them. The ClientHello peek
    /// relies on the bytes still being delivered to the TLS terminator or
    /// the passthrough upstream afterwards.
    pub async fn peek(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.peek(buf).await
    }

    /// Enable TCP keepalive on the underlying socket.
    pub fn set_keepalive(&self) -> std::io::Result<()> {
        set_tcp_keepalive(&self.inner)
    }
}

/// Enable the standard 30 s keepalive on any tokio TCP stream.
pub fn set_tcp_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let ka = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&ka)
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.info
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.info.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    // A write-side shutdown is only a half-close: the bridge propagates
    // EOF this way while the other direction keeps flowing. The close
    // callback fires from PinnedDrop, at true transport teardown.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
