//! In-process HTTP servers
//!
//! HTTP-family backends do not dial a socket per request from the
//! dispatch engine; instead each backend owns one in-process HTTP server
//! fed through a bounded handoff channel of authorized TLS streams. The
//! server owns the rest of each session's lifetime, including close.
//!
//! Reconfiguration shuts these servers down with a 5 second graceful
//! deadline. A dispatcher racing the shutdown sees its send fail and
//! closes the connection instead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::uri::PathAndQuery;
use axum::http::{header, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Mode;
use crate::conn::Conn;

/// An authorized, TLS-terminated external connection.
pub type TlsConn = tokio_rustls::server::TlsStream<Conn>;

/// Handoff channel depth. A full channel blocks the dispatcher for that
/// connection, which is the intended backpressure.
const HANDOFF_DEPTH: usize = 64;

/// Graceful shutdown deadline for in-flight sessions.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Peer address of the handed-off connection, exposed to handlers.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

/// One backend's in-process HTTP server.
pub struct InternalServer {
    tx: mpsc::Sender<TlsConn>,
    active: Arc<AtomicUsize>,
    token: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl InternalServer {
    /// Start the acceptor task serving `router` over handed-off streams.
    pub fn start(router: Router) -> Self {
        let (tx, mut rx) = mpsc::channel::<TlsConn>(HANDOFF_DEPTH);
        let active = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let active2 = Arc::clone(&active);
        let token2 = token.clone();
        let task = tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(conn) => conn,
                        None => break,
                    },
                    _ = token2.cancelled() => break,
                };
                let peer = conn.get_ref().0.peer_addr();
                let svc = router.clone().layer(Extension(PeerAddr(peer)));
                let active = Arc::clone(&active2);
                active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let builder =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    if let Err(e) = builder
                        .serve_connection_with_upgrades(
                            TokioIo::new(conn),
                            TowerToHyperService::new(svc),
                        )
                        .await
                    {
                        debug!(%peer, error = %e, "http session ended with error");
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
            // Dropping rx makes every pending and future handoff fail.
            drop(rx);
        });

        Self {
            tx,
            active,
            token,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Hand an authorized connection to the server. Blocks while the
    /// channel is full; fails when the server has shut down.
    pub async fn send(&self, conn: TlsConn) -> Result<(), ()> {
        self.tx.send(conn).await.map_err(|_| ())
    }

    /// Stop accepting handoffs and wait up to the deadline for in-flight
    /// sessions to drain.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("internal http server shutdown deadline reached with sessions in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for InternalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalServer")
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reverse proxy router for HTTP and HTTPS modes
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum UpstreamClient {
    Http(Client<HttpConnector, Body>),
    Https(Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>),
}

#[derive(Clone)]
struct ProxyTarget {
    scheme: &'static str,
    addresses: Arc<Vec<String>>,
    next: Arc<AtomicUsize>,
    client: UpstreamClient,
}

/// Build the router that forwards every request to the backend's
/// upstream addresses, round-robin.
pub fn reverse_proxy_router(mode: Mode, addresses: Vec<String>) -> Router {
    let client = if mode == Mode::Https {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("native root certificates")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        UpstreamClient::Https(
            Client::builder(TokioExecutor::new())
                .pool_idle_timeout(Duration::from_secs(90))
                .build(connector),
        )
    } else {
        UpstreamClient::Http(
            Client::builder(TokioExecutor::new())
                .pool_idle_timeout(Duration::from_secs(90))
                .build_http(),
        )
    };

    let target = ProxyTarget {
        scheme: if mode == Mode::Https { "https" } else { "http" },
        addresses: Arc::new(addresses),
        next: Arc::new(AtomicUsize::new(0)),
        client,
    };
    Router::new().fallback(any(forward)).with_state(target)
}

async fn forward(
    State(target): State<ProxyTarget>,
    Extension(peer): Extension<PeerAddr>,
    req: Request<Body>,
) -> Response {
    if target.addresses.is_empty() {
        return (StatusCode::BAD_GATEWAY, "no upstream").into_response();
    }
    let idx = target.next.fetch_add(1, Ordering::Relaxed) % target.addresses.len();
    let addr = &target.addresses[idx];

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");
    let uri: Uri = match format!("{}://{}{}", target.scheme, addr, path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(error = %e, "unbuildable upstream uri");
            return (StatusCode::BAD_GATEWAY, "bad upstream uri").into_response();
        }
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    parts.headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static("https"),
    );
    if let Ok(v) = HeaderValue::from_str(&peer.0.ip().to_string()) {
        parts.headers.append("x-forwarded-for", v);
    }
    // Hop-by-hop headers do not travel.
    parts.headers.remove(header::CONNECTION);
    parts.headers.remove("keep-alive");
    parts.headers.remove(header::TRANSFER_ENCODING);

    let upstream_req = Request::from_parts(parts, body);
    let result = match &target.client {
        UpstreamClient::Http(client) => client.request(upstream_req).await,
        UpstreamClient::Https(client) => client.request(upstream_req).await,
    };

    match result {
        Ok(resp) => {
            let (parts, incoming) = resp.into_parts();
            Response::from_parts(parts, Body::new(incoming))
        }
        Err(e) => {
            debug!(error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response()
        }
    }
}
