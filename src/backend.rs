//! Backend runtime records
//!
//! A `Backend` is one tenant of the proxy: the server names it answers
//! for, its forwarding mode, frozen TLS parameters, ACLs, rate limiter,
//! and upstream addresses. Backends are built during reconfiguration and
//! never mutated after they are published in the registry; a later
//! reconfiguration installs new records and drops these.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use ipnet::IpNet;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::cert_manager::{CertResolver, DEFAULT_ALPN};
use crate::config::{load_cert_pool, BackendConfig, Mode};
use crate::conn::set_tcp_keepalive;
use crate::errors::Error;
use crate::internal_http::InternalServer;
use crate::metrics::Events;
use crate::rate_limit::RateLimiter;

/// Upstream dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// RFC 2253 subject string of a DER certificate, empty when unparseable.
pub fn peer_subject(cert: &CertificateDer<'_>) -> String {
    match x509_parser::parse_x509_certificate(cert.as_ref()) {
        Ok((_, parsed)) => parsed.subject().to_string(),
        Err(_) => String::new(),
    }
}

/// Frozen client-auth parameters of a backend.
struct ClientAuthParams {
    /// Chain validation against the configured client CAs.
    verifier: Arc<dyn ClientCertVerifier>,
    /// Permitted subjects; `None` accepts any chain-valid certificate.
    acl: Option<Vec<String>>,
}

/// One tenant, immutable after publication into the registry.
pub struct Backend {
    pub mode: Mode,
    server_names: Vec<String>,
    addresses: Vec<String>,
    next_address: AtomicUsize,
    alpn: Vec<Vec<u8>>,
    client_auth: Option<ClientAuthParams>,
    ip_acl: Option<Vec<IpNet>>,
    forward_roots: Option<Arc<RootCertStore>>,
    pub limiter: RateLimiter,
    resolver: Arc<CertResolver>,
    events: Arc<Events>,
    /// TLS config shared by connections when no client auth is required.
    shared_tls: Arc<ServerConfig>,
    /// Handoff to the in-process HTTP server for HTTP-family modes.
    pub http_server: Option<InternalServer>,
}

impl Backend {
    pub fn new(
        cfg: &BackendConfig,
        resolver: Arc<CertResolver>,
        events: Arc<Events>,
        http_server: Option<InternalServer>,
    ) -> Result<Self, Error> {
        let alpn: Vec<Vec<u8>> = match &cfg.alpn_protos {
            Some(protos) => protos.iter().map(|p| p.as_bytes().to_vec()).collect(),
            None => DEFAULT_ALPN.iter().map(|p| p.as_bytes().to_vec()).collect(),
        };

        let client_auth = if cfg.client_auth {
            let pem = cfg
                .client_cas
                .as_deref()
                .ok_or_else(|| Error::Config("client-auth requires client-cas".into()))?;
            let roots = Arc::new(load_cert_pool(pem)?);
            let verifier = WebPkiClientVerifier::builder(roots)
                .build()
                .map_err(|e| Error::Config(format!("client-cas: {e}")))?;
            Some(ClientAuthParams {
                verifier,
                acl: cfg.client_acl.clone(),
            })
        } else {
            None
        };

        let ip_acl = match &cfg.ip_acl {
            Some(list) => {
                let nets: Result<Vec<IpNet>, _> = list.iter().map(|s| s.parse()).collect();
                Some(nets.map_err(|e| Error::Config(format!("ip-acl: {e}")))?)
            }
            None => None,
        };

        let forward_roots = match &cfg.forward_root_cas {
            Some(pem) => Some(Arc::new(load_cert_pool(pem)?)),
            None if cfg.mode == Mode::Tls => Some(Arc::new(native_roots())),
            None => None,
        };

        let mut shared = crate::cert_manager::base_server_config(Arc::clone(&resolver));
        shared.alpn_protocols = alpn.clone();

        Ok(Self {
            mode: cfg.mode,
            server_names: cfg.server_names.clone(),
            addresses: cfg.addresses.clone(),
            next_address: AtomicUsize::new(0),
            alpn,
            client_auth,
            ip_acl,
            forward_roots,
            limiter: RateLimiter::from_config(cfg.rate_limit.as_ref()),
            resolver,
            events,
            shared_tls: Arc::new(shared),
            http_server,
        })
    }

    /// Metrics and log key: the backend's first server name.
    pub fn key(&self) -> &str {
        self.server_names.first().map(String::as_str).unwrap_or("-")
    }

    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    pub fn requires_client_auth(&self) -> bool {
        self.client_auth.is_some()
    }

    pub fn has_client_acl(&self) -> bool {
        self.client_auth
            .as_ref()
            .map(|ca| ca.acl.is_some())
            .unwrap_or(false)
    }

    /// Source-IP admission check.
    pub fn check_ip(&self, remote: IpAddr) -> Result<(), String> {
        match &self.ip_acl {
            None => Ok(()),
            Some(nets) if nets.iter().any(|n| n.contains(&remote)) => Ok(()),
            Some(_) => Err(format!("rejected IP {remote}")),
        }
    }

    /// Subject ACL membership. Absent ACL accepts every chain-valid
    /// certificate.
    pub fn authorize(&self, subject: &str) -> Result<(), Error> {
        let acl = match self.client_auth.as_ref().and_then(|ca| ca.acl.as_ref()) {
            None => return Ok(()),
            Some(acl) => acl,
        };
        if acl.iter().any(|s| s == subject) {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }

    /// TLS server configuration for one connection.
    ///
    /// Without client auth every connection shares one frozen config.
    /// With client auth the verifier must know which server name admitted
    /// the connection, so a config is assembled around a verifier bound
    /// to that name.
    pub fn server_config(&self, server_name: &str) -> Arc<ServerConfig> {
        let ca = match &self.client_auth {
            None => return Arc::clone(&self.shared_tls),
            Some(ca) => ca,
        };
        let verifier = Arc::new(TenantClientVerifier {
            inner: Arc::clone(&ca.verifier),
            acl: ca.acl.clone(),
            server_name: server_name.to_string(),
            events: Arc::clone(&self.events),
        });
        let mut cfg = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::clone(&self.resolver) as _);
        cfg.alpn_protocols = self.alpn.clone();
        Arc::new(cfg)
    }

    /// Dial the next upstream address.
    ///
    /// TLS and HTTPS modes wrap the socket in a client TLS session
    /// validated against the forward roots, forwarding the externally
    /// negotiated ALPN so the upstream can pick the same protocol.
    pub async fn dial(&self, alpn: Option<&str>) -> Result<Upstream, Error> {
        if self.addresses.is_empty() {
            return Err(Error::Config("no upstream addresses".into()));
        }
        let start = self.next_address.fetch_add(1, Ordering::Relaxed);
        let mut last_err: Option<Error> = None;
        for i in 0..self.addresses.len() {
            let addr = &self.addresses[(start + i) % self.addresses.len()];
            match self.dial_one(addr, alpn).await {
                Ok(up) => return Ok(up),
                Err(e) => {
                    debug!(address = %addr, error = %e, "upstream dial failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }

    async fn dial_one(&self, addr: &str, alpn: Option<&str>) -> Result<Upstream, Error> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "dial timeout",
                ))
            })??;
        set_tcp_keepalive(&stream)?;

        if !matches!(self.mode, Mode::Tls) {
            return Ok(Upstream::Plain(stream));
        }

        let roots = self
            .forward_roots
            .clone()
            .unwrap_or_else(|| Arc::new(native_roots()));
        let mut cc = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if let Some(proto) = alpn {
            cc.alpn_protocols = vec![proto.as_bytes().to_vec()];
        }
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Config(format!("upstream name {host:?}: {e}")))?;
        let tls = TlsConnector::from(Arc::new(cc))
            .connect(server_name, stream)
            .await?;
        Ok(Upstream::Tls(Box::new(tls)))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("mode", &self.mode)
            .field("server_names", &self.server_names)
            .field("addresses", &self.addresses)
            .finish()
    }
}

/// System trust store for upstream validation when no forward roots are
/// configured.
fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    roots
}

/// Connection to an upstream: plaintext or re-encrypted.
pub enum Upstream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Upstream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Upstream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Upstream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            Upstream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Upstream::Plain(s) => Pin::new(s).poll_flush(cx),
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Upstream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Handshake-time client-certificate check.
///
/// Chain validation is delegated to the WebPKI verifier built from the
/// backend's client CAs; on success the leaf subject is tested against
/// the backend ACL. This runs inside the TLS handshake, so a denied
/// client never completes the session. The post-handshake authorization
/// re-runs the same subject check as an idempotent second opinion.
struct TenantClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    acl: Option<Vec<String>>,
    server_name: String,
    events: Arc<Events>,
}

impl std::fmt::Debug for TenantClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantClientVerifier")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl ClientCertVerifier for TenantClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)?;
        let subject = peer_subject(end_entity);
        if let Some(acl) = &self.acl {
            if !acl.iter().any(|s| *s == subject) {
                self.events
                    .record(&format!("deny [{subject}] to {}", self.server_name));
                return Err(rustls::Error::General("access denied".into()));
            }
        }
        if !subject.is_empty() {
            self.events
                .record(&format!("allow [{subject}] to {}", self.server_name));
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_manager::{CertManager, TestCertManager};
    use arc_swap::ArcSwap;

    fn init_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn test_resolver() -> Arc<CertResolver> {
        let manager: Arc<dyn CertManager> = Arc::new(TestCertManager::new("root-ca.test").unwrap());
        CertResolver::new(manager, Arc::new(ArcSwap::from_pointee(String::new())))
    }

    fn make_backend(cfg: &BackendConfig) -> Backend {
        Backend::new(cfg, test_resolver(), Arc::new(Events::default()), None).unwrap()
    }

    #[tokio::test]
    async fn ip_acl_allows_and_denies() {
        init_provider();
        let cfg = BackendConfig {
            server_names: vec!["a.example.com".into()],
            mode: Mode::Tcp,
            addresses: vec!["127.0.0.1:1".into()],
            ip_acl: Some(vec!["10.0.0.0/8".into(), "127.0.0.1/32".into()]),
            ..Default::default()
        };
        let be = make_backend(&cfg);
        assert!(be.check_ip("10.1.2.3".parse().unwrap()).is_ok());
        assert!(be.check_ip("127.0.0.1".parse().unwrap()).is_ok());
        assert!(be.check_ip("192.168.1.1".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn empty_ip_acl_allows_all() {
        init_provider();
        let cfg = BackendConfig {
            server_names: vec!["a.example.com".into()],
            mode: Mode::Tcp,
            addresses: vec!["127.0.0.1:1".into()],
            ..Default::default()
        };
        let be = make_backend(&cfg);
        assert!(be.check_ip("203.0.113.9".parse().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn authorize_without_acl_accepts_all() {
        init_provider();
        let ca = TestCertManager::new("root-ca.test").unwrap();
        let cfg = BackendConfig {
            server_names: vec!["a.example.com".into()],
            mode: Mode::Tcp,
            addresses: vec!["127.0.0.1:1".into()],
            client_auth: true,
            client_cas: Some(ca.root_pem()),
            ..Default::default()
        };
        let be = make_backend(&cfg);
        assert!(be.authorize("CN=anyone").is_ok());
        assert!(be.authorize("").is_ok());
    }

    #[tokio::test]
    async fn authorize_with_acl_is_membership() {
        init_provider();
        let ca = TestCertManager::new("root-ca.test").unwrap();
        let cfg = BackendConfig {
            server_names: vec!["a.example.com".into()],
            mode: Mode::Tcp,
            addresses: vec!["127.0.0.1:1".into()],
            client_auth: true,
            client_cas: Some(ca.root_pem()),
            client_acl: Some(vec!["CN=alice".into()]),
            ..Default::default()
        };
        let be = make_backend(&cfg);
        assert!(be.authorize("CN=alice").is_ok());
        assert!(matches!(
            be.authorize("CN=bob"),
            Err(Error::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn shared_config_reused_without_client_auth() {
        init_provider();
        let cfg = BackendConfig {
            server_names: vec!["a.example.com".into()],
            mode: Mode::Tcp,
            addresses: vec!["127.0.0.1:1".into()],
            alpn_protos: Some(vec!["http/1.1".into()]),
            ..Default::default()
        };
        let be = make_backend(&cfg);
        let a = be.server_config("a.example.com");
        let b = be.server_config("a.example.com");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn per_connection_config_with_client_auth() {
        init_provider();
        let ca = TestCertManager::new("root-ca.test").unwrap();
        let cfg = BackendConfig {
            server_names: vec!["a.example.com".into()],
            mode: Mode::Tcp,
            addresses: vec!["127.0.0.1:1".into()],
            client_auth: true,
            client_cas: Some(ca.root_pem()),
            ..Default::default()
        };
        let be = make_backend(&cfg);
        let a = be.server_config("a.example.com");
        let b = be.server_config("a.example.com");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn subject_of_generated_cert() {
        init_provider();
        let ca = TestCertManager::new("root-ca.test").unwrap();
        let (cert, _) = ca.client_credentials("carol").unwrap();
        assert_eq!(peer_subject(&cert), "CN=carol");
    }
}
