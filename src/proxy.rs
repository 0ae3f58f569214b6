//! Connection dispatch engine
//!
//! The proxy accepts TCP connections on one port, peeks the TLS
//! ClientHello without consuming it, selects the backend for the SNI
//! host, and drives the mode-dependent pipeline: admission checks, TLS
//! termination with the backend's client-certificate policy, rate-limit
//! wait, then either an upstream bridge or a handoff to the backend's
//! in-process HTTP server. Every connection is handled by its own task;
//! a panic in one task is recorded and never reaches the accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{peer_subject, Backend};
use crate::bridge::{bridge, is_benign_disconnect};
use crate::cert_manager::{self, CertManager, CertResolver, ACME_TLS_ALPN_PROTO};
use crate::client_hello::peek_client_hello;
use crate::config::{parse_listen_addr, Config, Mode};
use crate::conn::{Conn, ConnInfo};
use crate::console;
use crate::errors::Error;
use crate::internal_http::{reverse_proxy_router, InternalServer, TlsConn};
use crate::metrics::{ConnSnapshot, Events, Metrics};
use crate::oidc;

/// Upper bound on a TLS handshake, peek included. `stop` cancels any
/// handshake still in flight.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

// Raw TLS alert records (each carrying a two-byte alert payload),
// written onto the unencrypted socket when a connection is refused
// before any handshake.
const ALERT_CLOSE_NOTIFY: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x01, 0x00];
const ALERT_UNRECOGNIZED_NAME: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x70];
const ALERT_INTERNAL_ERROR: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x50];

type ConnKey = (SocketAddr, SocketAddr);

/// The published routing table: swapped whole on reconfiguration so a
/// reader sees either the old mapping and default name or the new pair,
/// never a mix.
pub struct Registry {
    backends: HashMap<String, Arc<Backend>>,
    backend_list: Vec<Arc<Backend>>,
    default_server_name: String,
    max_open: usize,
}

impl Registry {
    fn empty() -> Self {
        Self {
            backends: HashMap::new(),
            backend_list: Vec::new(),
            default_server_name: String::new(),
            max_open: 0,
        }
    }

    pub fn lookup(&self, server_name: &str) -> Result<Arc<Backend>, Error> {
        self.backends
            .get(server_name)
            .cloned()
            .ok_or(Error::UnexpectedSni)
    }
}

/// Proxy-scoped shared tables: the registry snapshot, live connections,
/// events, and per-backend metrics. One short-lived mutex guards the
/// connection table; nothing here is held across I/O.
pub struct SharedState {
    pub events: Arc<Events>,
    pub metrics: Arc<Metrics>,
    registry: ArcSwap<Registry>,
    connections: Mutex<HashMap<ConnKey, Arc<ConnInfo>>>,
    default_name: Arc<ArcSwap<String>>,
    cfg: tokio::sync::Mutex<Option<Config>>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl SharedState {
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.load_full()
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    /// Insert a connection; returns how many were open before it.
    fn add_conn(&self, key: ConnKey, info: Arc<ConnInfo>) -> usize {
        let mut conns = self.connections.lock();
        let open = conns.len();
        conns.insert(key, info);
        open
    }

    fn remove_conn(&self, key: &ConnKey) {
        self.connections.lock().remove(key);
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connections_snapshot(&self) -> Vec<ConnSnapshot> {
        let conns = self.connections.lock();
        let mut out: Vec<ConnSnapshot> = conns
            .values()
            .map(|info| {
                info.with_tags(|tags| ConnSnapshot {
                    peer: info.peer_addr().to_string(),
                    server_name: tags.server_name.clone().unwrap_or_default(),
                    mode: tags.mode.map(|m| m.as_str().to_string()).unwrap_or_default(),
                    age: info.start().elapsed(),
                    bytes_received: info.bytes_received(),
                    bytes_sent: info.bytes_sent(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.peer.cmp(&b.peer));
        out
    }

    pub async fn config_yaml(&self) -> String {
        self.cfg
            .lock()
            .await
            .as_ref()
            .map(Config::canonical)
            .unwrap_or_default()
    }
}

/// The proxy singleton.
pub struct Proxy {
    shared: Arc<SharedState>,
    cert_manager: Arc<dyn CertManager>,
    resolver: Arc<CertResolver>,
    shutdown: CancellationToken,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl Proxy {
    /// Build a proxy over a certificate manager and apply the initial
    /// configuration.
    pub async fn new(cfg: Config, cert_manager: Arc<dyn CertManager>) -> Result<Arc<Self>, Error> {
        let default_name = Arc::new(ArcSwap::from_pointee(String::new()));
        let resolver = CertResolver::new(Arc::clone(&cert_manager), Arc::clone(&default_name));
        let shared = Arc::new(SharedState {
            events: Arc::new(Events::default()),
            metrics: Arc::new(Metrics::default()),
            registry: ArcSwap::from_pointee(Registry::empty()),
            connections: Mutex::new(HashMap::new()),
            default_name,
            cfg: tokio::sync::Mutex::new(None),
            started_at: chrono::Utc::now(),
        });
        let proxy = Arc::new(Self {
            shared,
            cert_manager,
            resolver,
            shutdown: CancellationToken::new(),
            listen_addr: Mutex::new(None),
        });
        proxy.reconfigure(cfg).await?;
        Ok(proxy)
    }

    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Address of the TLS listener once `start` has bound it.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Apply a new configuration.
    ///
    /// A byte-identical configuration is a no-op. Otherwise the new
    /// backend records are built, the registry snapshot is swapped, and
    /// the previous generation's HTTP servers are shut down gracefully.
    /// On validation failure the previous configuration stays in effect.
    pub async fn reconfigure(&self, cfg: Config) -> Result<(), Error> {
        let mut current = self.shared.cfg.lock().await;
        if let Some(cur) = current.as_ref() {
            if cur.canonical() == cfg.canonical() {
                return Ok(());
            }
        }
        cfg.check()?;
        if current.is_some() {
            info!("configuration changed");
        }

        let mut backends = HashMap::new();
        let mut backend_list = Vec::new();
        for be_cfg in &cfg.backends {
            let http_server = if be_cfg.mode.is_http() {
                let router = match be_cfg.mode {
                    Mode::Console => console::console_router(self.shared()),
                    _ => reverse_proxy_router(be_cfg.mode, be_cfg.addresses.clone()),
                };
                let router = match &be_cfg.oidc {
                    Some(oidc_cfg) => {
                        let provider = oidc::Provider::new(
                            oidc_cfg,
                            Arc::clone(&self.shared.events),
                            Arc::new(oidc::SessionStore::default()),
                        )
                        .await?;
                        oidc::protect(router, provider)
                    }
                    None => router,
                };
                Some(InternalServer::start(router))
            } else {
                None
            };
            let backend = Arc::new(Backend::new(
                be_cfg,
                Arc::clone(&self.resolver),
                Arc::clone(&self.shared.events),
                http_server,
            )?);
            for sn in backend.server_names() {
                backends.insert(sn.to_ascii_lowercase(), Arc::clone(&backend));
            }
            backend_list.push(backend);
        }

        let default_server_name = cfg.default_server_name.clone().unwrap_or_default();
        let registry = Arc::new(Registry {
            backends,
            backend_list,
            default_server_name: default_server_name.clone(),
            max_open: cfg.max_open,
        });
        let previous = self.shared.registry.swap(registry);
        self.shared
            .default_name
            .store(Arc::new(default_server_name));

        // Old HTTP servers drain with their 5 s deadline off-path; a
        // dispatcher already racing toward one observes a failed send.
        for backend in previous.backend_list.iter().cloned() {
            tokio::spawn(async move {
                if let Some(server) = &backend.http_server {
                    server.shutdown().await;
                }
            });
        }

        *current = Some(cfg);
        Ok(())
    }

    /// Bind the listeners and start accepting. Runs in the background
    /// until `stop`; only listener-creation errors are returned.
    pub async fn start(&self) -> Result<(), Error> {
        let cfg_guard = self.shared.cfg.lock().await;
        let cfg = cfg_guard.as_ref().expect("configured at construction");
        let tls_addr = parse_listen_addr(&cfg.tls_addr)
            .ok_or_else(|| Error::Config(format!("invalid tls-addr {:?}", cfg.tls_addr)))?;
        let http_addr = match &cfg.http_addr {
            Some(addr) => Some(
                parse_listen_addr(addr)
                    .ok_or_else(|| Error::Config(format!("invalid http-addr {addr:?}")))?,
            ),
            None => None,
        };
        drop(cfg_guard);

        if let Some(addr) = http_addr {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let router = cert_manager::http_handler(Arc::clone(&self.cert_manager), None);
            let token = self.shutdown.clone();
            info!(%addr, "accepting ACME HTTP-01 probes");
            tokio::spawn(async move {
                let _ = axum::serve(listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await;
            });
        }

        let listener = TcpListener::bind(tls_addr).await?;
        let local = listener.local_addr()?;
        *self.listen_addr.lock() = Some(local);
        info!(addr = %local, "accepting TLS connections");

        let state = self.shared();
        let resolver = Arc::clone(&self.resolver);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    },
                };
                let state = Arc::clone(&state);
                let resolver = Arc::clone(&resolver);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let events = Arc::clone(&state.events);
                    let task = std::panic::AssertUnwindSafe(handle_connection(
                        state, resolver, shutdown, stream, peer,
                    ))
                    .catch_unwind();
                    if task.await.is_err() {
                        events.record("panic");
                        error!(%peer, "connection task panicked");
                    }
                });
            }
            info!("accept loop terminated");
        });
        Ok(())
    }

    /// Cancel the accept loop, outstanding handshakes, and rate-limit
    /// waits, and shut down the internal HTTP servers.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let registry = self.shared.registry();
        for backend in registry.backend_list.iter().cloned() {
            tokio::spawn(async move {
                if let Some(server) = &backend.http_server {
                    server.shutdown().await;
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection pipeline
// ---------------------------------------------------------------------------

async fn handle_connection(
    state: Arc<SharedState>,
    resolver: Arc<CertResolver>,
    shutdown: CancellationToken,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut conn = match Conn::new(stream, peer) {
        Ok(conn) => conn,
        Err(e) => {
            debug!(%peer, error = %e, "dropping connection at accept");
            return;
        }
    };
    let info = conn.info();
    let key: ConnKey = (info.local_addr(), peer);

    let num_open = state.add_conn(key, Arc::clone(&info));
    {
        let state = Arc::clone(&state);
        let info2 = Arc::clone(&info);
        info.on_close(move || {
            state.remove_conn(&key);
            let (report_end, backend_key) =
                info2.with_tags(|t| (t.report_end, t.backend_key.clone()));
            let recv = info2.bytes_received();
            let sent = info2.bytes_sent();
            if let Some(bk) = backend_key {
                state.metrics.record_bytes(&bk, recv, sent);
            }
            if report_end {
                info!(
                    conn = %info2.describe(),
                    duration = ?info2.start().elapsed(),
                    recv,
                    sent,
                    "END",
                );
            }
        });
    }

    let registry = state.registry();
    if num_open >= registry.max_open {
        state.events.record("too many open connections");
        warn!(%peer, open = num_open, max = registry.max_open, "too many open connections");
        send_alert(&mut conn, &ALERT_CLOSE_NOTIFY).await;
        return;
    }
    if let Err(e) = conn.set_keepalive() {
        debug!(%peer, error = %e, "keepalive not set");
    }

    let hello = tokio::select! {
        _ = shutdown.cancelled() => return,
        peeked = tokio::time::timeout(HANDSHAKE_TIMEOUT, peek_client_hello(&conn)) => {
            match peeked {
                Ok(Ok(Ok(hello))) => hello,
                Ok(Ok(Err(parse_err))) => {
                    state.events.record("invalid ClientHello");
                    warn!(%peer, error = ?parse_err, "invalid ClientHello");
                    return;
                }
                Ok(Err(io_err)) => {
                    state.events.record("invalid ClientHello");
                    debug!(%peer, error = %io_err, "ClientHello read failed");
                    return;
                }
                Err(_) => {
                    state.events.record("invalid ClientHello");
                    debug!(%peer, "timed out waiting for ClientHello");
                    return;
                }
            }
        }
    };

    let server_name = match &hello.server_name {
        Some(sn) => sn.clone(),
        None => {
            state.events.record("no SNI");
            registry.default_server_name.clone()
        }
    };
    info.with_tags(|t| t.server_name = Some(server_name.clone()));

    let backend = match registry.lookup(&server_name) {
        Ok(be) => be,
        Err(e) => {
            state.events.record(&e.to_string());
            warn!(%peer, %server_name, "no backend for server name");
            send_alert(&mut conn, &ALERT_UNRECOGNIZED_NAME).await;
            return;
        }
    };
    info.with_tags(|t| {
        t.mode = Some(backend.mode);
        t.backend_key = Some(backend.key().to_string());
    });
    state.metrics.record_connection(backend.key());

    match backend.mode {
        Mode::TlsPassthrough => {
            if !check_ip(&state, &backend, &mut conn, &server_name).await {
                return;
            }
            handle_passthrough(state, backend, conn, server_name).await;
        }
        _ if hello.is_acme_alpn() => {
            handle_acme_challenge(state, resolver, shutdown, conn, server_name).await;
        }
        Mode::Http | Mode::Https | Mode::Console => {
            if !check_ip(&state, &backend, &mut conn, &server_name).await {
                return;
            }
            handle_http_session(state, registry, backend, shutdown, conn, server_name).await;
        }
        Mode::Tcp | Mode::Tls => {
            if !check_ip(&state, &backend, &mut conn, &server_name).await {
                return;
            }
            handle_bridged_session(state, registry, backend, shutdown, conn, server_name).await;
        }
    }
}

/// Source-IP admission. Must run before any TLS handshake.
async fn check_ip(
    state: &SharedState,
    backend: &Backend,
    conn: &mut Conn,
    server_name: &str,
) -> bool {
    match backend.check_ip(conn.peer_addr().ip()) {
        Ok(()) => true,
        Err(reason) => {
            state
                .events
                .record(&format!("{server_name} CheckIP {reason}"));
            warn!(peer = %conn.peer_addr(), server_name, reason, "IP rejected");
            send_alert(conn, &ALERT_UNRECOGNIZED_NAME).await;
            false
        }
    }
}

/// Answer an ACME TLS-ALPN-01 probe: handshake with the challenge
/// certificate and close.
async fn handle_acme_challenge(
    state: Arc<SharedState>,
    resolver: Arc<CertResolver>,
    shutdown: CancellationToken,
    conn: Conn,
    server_name: String,
) {
    info!(peer = %conn.peer_addr(), server_name, "ACME validation connection");
    let mut tc = cert_manager::base_server_config(resolver);
    tc.alpn_protocols = vec![ACME_TLS_ALPN_PROTO.as_bytes().to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tc));
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(conn)) => {
            match res {
                Ok(Ok(_tls)) => {} // close right after the handshake
                Ok(Err(e)) => {
                    state.events.record("tls handshake failed");
                    warn!(%server_name, error = %e, "ACME validation handshake failed");
                }
                Err(_) => {
                    state.events.record("tls handshake failed");
                    warn!(%server_name, "ACME validation handshake timed out");
                }
            }
        }
    }
}

/// Terminate TLS and authorize, or record why not.
async fn terminate_tls(
    state: &SharedState,
    registry: &Registry,
    backend: &Backend,
    shutdown: &CancellationToken,
    conn: Conn,
    server_name: &str,
) -> Option<TlsConn> {
    let info = conn.info();
    let acceptor = TlsAcceptor::from(backend.server_config(server_name));
    let accepted = tokio::select! {
        _ = shutdown.cancelled() => return None,
        res = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(conn)) => res,
    };
    let tls = match accepted {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            state.events.record(&handshake_error_event(&e, server_name));
            warn!(%server_name, error = %e, "handshake failed");
            return None;
        }
        Err(_) => {
            state.events.record("tls handshake failed");
            warn!(%server_name, "handshake timed out");
            return None;
        }
    };

    if authorize_tls_connection(state, registry, backend, &tls, &info, server_name) {
        Some(tls)
    } else {
        None
    }
}

/// Post-handshake re-verification.
///
/// The client-certificate verifier already ran inside the handshake;
/// this re-checks the subject ACL as defense in depth, records the
/// handshake annotations, and enforces that the handshake's server name
/// matches the one the connection was dispatched on.
fn authorize_tls_connection(
    state: &SharedState,
    registry: &Registry,
    backend: &Backend,
    tls: &TlsConn,
    info: &Arc<ConnInfo>,
    server_name: &str,
) -> bool {
    let (_, session) = tls.get_ref();
    let negotiated = session.server_name().unwrap_or("");
    let alpn = session
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).to_string());
    let subject = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(peer_subject)
        .unwrap_or_default();
    info.with_tags(|t| {
        t.handshake_done = Some(Instant::now());
        t.alpn = alpn.clone();
        t.subject = Some(subject.clone());
    });

    // The empty-SNI convention: a handshake without SNI is only
    // acceptable when this connection was dispatched on the default name.
    let mismatched = if negotiated.is_empty() {
        server_name != registry.default_server_name
    } else {
        negotiated != server_name
    };
    if mismatched {
        state.events.record("mismatched server name");
        warn!(%server_name, %negotiated, "mismatched server name");
        return false;
    }

    if backend.requires_client_auth() && session.peer_certificates().is_none() {
        state
            .events
            .record(&format!("deny no cert to {server_name}"));
        return false;
    }
    if backend.has_client_acl() {
        if let Err(e) = backend.authorize(&subject) {
            state.events.record(&e.to_string());
            warn!(%server_name, %subject, "subject rejected post-handshake");
            return false;
        }
    }
    true
}

/// TCP and TLS modes: terminate, authorize, dial, bridge.
async fn handle_bridged_session(
    state: Arc<SharedState>,
    registry: Arc<Registry>,
    backend: Arc<Backend>,
    shutdown: CancellationToken,
    conn: Conn,
    server_name: String,
) {
    let info = conn.info();
    let mut tls = match terminate_tls(&state, &registry, &backend, &shutdown, conn, &server_name)
        .await
    {
        Some(tls) => tls,
        None => return,
    };

    if let Err(e) = backend.limiter.wait(&shutdown).await {
        state.events.record(&e.to_string());
        debug!(%server_name, error = %e, "rate-limit wait aborted");
        return;
    }

    let alpn = info.with_tags(|t| t.alpn.clone());
    let mut upstream = match backend.dial(alpn.as_deref()).await {
        Ok(up) => up,
        Err(e) => {
            state.events.record("dial error");
            warn!(%server_name, error = %e, "upstream dial failed");
            return;
        }
    };
    info.with_tags(|t| t.dial_done = Some(Instant::now()));
    info!(conn = %info.describe(), "CON");

    let result = bridge(&mut tls, &mut upstream).await;
    if let Err(e) = &result {
        if !is_benign_disconnect(e) {
            debug!(conn = %info.describe(), error = %e, "bridge error");
        }
    }

    let (hs, dialed) = info.with_tags(|t| (t.handshake_done, t.dial_done));
    let start = info.start();
    info!(
        conn = %info.describe(),
        handshake = ?hs.map(|t| t - start),
        dial = ?dialed.zip(hs).map(|(d, h)| d - h),
        duration = ?start.elapsed(),
        recv = info.bytes_received(),
        sent = info.bytes_sent(),
        "END",
    );
}

/// Passthrough: no local handshake, raw bytes to the upstream.
async fn handle_passthrough(
    state: Arc<SharedState>,
    backend: Arc<Backend>,
    mut conn: Conn,
    server_name: String,
) {
    let info = conn.info();
    let mut upstream = match backend.dial(None).await {
        Ok(up) => up,
        Err(e) => {
            state.events.record("dial error");
            warn!(%server_name, error = %e, "upstream dial failed");
            send_alert(&mut conn, &ALERT_INTERNAL_ERROR).await;
            return;
        }
    };
    info.with_tags(|t| t.dial_done = Some(Instant::now()));
    info!(conn = %info.describe(), "CON");

    let result = bridge(&mut conn, &mut upstream).await;
    if let Err(e) = &result {
        if !is_benign_disconnect(e) {
            debug!(conn = %info.describe(), error = %e, "bridge error");
        }
    }

    let dialed = info.with_tags(|t| t.dial_done);
    let start = info.start();
    info!(
        conn = %info.describe(),
        dial = ?dialed.map(|d| d - start),
        duration = ?start.elapsed(),
        recv = info.bytes_received(),
        sent = info.bytes_sent(),
        "END",
    );
}

/// HTTP-family modes: terminate, authorize, hand off to the backend's
/// in-process HTTP server, which owns the rest of the session.
async fn handle_http_session(
    state: Arc<SharedState>,
    registry: Arc<Registry>,
    backend: Arc<Backend>,
    shutdown: CancellationToken,
    conn: Conn,
    server_name: String,
) {
    let info = conn.info();
    let tls = match terminate_tls(&state, &registry, &backend, &shutdown, conn, &server_name).await
    {
        Some(tls) => tls,
        None => return,
    };

    if let Err(e) = backend.limiter.wait(&shutdown).await {
        state.events.record(&e.to_string());
        debug!(%server_name, error = %e, "rate-limit wait aborted");
        return;
    }

    let server = match &backend.http_server {
        Some(server) => server,
        None => {
            state.events.record("conn chan nil");
            error!(server_name, "HTTP-family backend without internal server");
            return;
        }
    };

    info.with_tags(|t| t.report_end = true);
    info!(conn = %info.describe(), "CON");
    if server.send(tls).await.is_err() {
        // The server shut down between authorization and handoff; the
        // stream is dropped, which closes the connection.
        debug!(%server_name, "handoff refused by internal http server");
    }
}

/// Event string for a failed inbound handshake.
fn handshake_error_event(err: &std::io::Error, server_name: &str) -> String {
    let rustls_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match rustls_err {
        Some(rustls::Error::NoCertificatesPresented) => format!("deny no cert to {server_name}"),
        Some(rustls::Error::General(msg)) if msg == "access denied" => "access denied".to_string(),
        _ => "tls handshake failed".to_string(),
    }
}

/// Best-effort raw TLS alert on an unencrypted socket, then close.
async fn send_alert(conn: &mut Conn, alert: &[u8]) {
    let _ = conn.write_all(alert).await;
    let _ = conn.flush().await;
    let _ = conn.shutdown().await;
}
