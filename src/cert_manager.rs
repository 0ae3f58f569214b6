//! Certificate management
//!
//! Two implementations behind one facade: `AcmeManager` obtains and
//! renews certificates from an ACME directory (TLS-ALPN-01 preferred,
//! HTTP-01 fallback) with an on-disk PEM cache, and `TestCertManager`
//! issues from an ephemeral in-process CA so the full proxy can run in
//! tests without network access.
//!
//! The facade surfaces three lookups: the serving certificate for a
//! server name, the `acme-tls/1` challenge certificate for a name with a
//! validation in flight, and the HTTP-01 challenge body for a token.
//! `CertResolver` adapts the facade to rustls certificate selection and
//! substitutes the proxy's default server name when a ClientHello has no
//! SNI.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::Mutex;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Error;

/// ALPN protocol name of the ACME TLS-ALPN-01 challenge.
pub const ACME_TLS_ALPN_PROTO: &str = "acme-tls/1";

/// Default ALPN protocols advertised to TLS clients.
pub const DEFAULT_ALPN: &[&str] = &["h2", "http/1.1"];

/// Renew certificates expiring within this window.
const RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

/// Interval between renewal scans.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Source of serving and challenge certificates.
pub trait CertManager: Send + Sync + 'static {
    /// Serving certificate for a server name, if one is available now.
    fn certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>>;

    /// Challenge certificate for a pending TLS-ALPN-01 validation.
    fn challenge_cert(&self, server_name: &str) -> Option<Arc<CertifiedKey>>;

    /// Key authorization body for a pending HTTP-01 token.
    fn http_challenge(&self, token: &str) -> Option<String>;
}

/// rustls certificate selector over a `CertManager`.
///
/// An empty SNI is substituted with the proxy's current default server
/// name before the lookup. A ClientHello offering exactly `acme-tls/1`
/// is answered with the challenge certificate.
pub struct CertResolver {
    manager: Arc<dyn CertManager>,
    default_name: Arc<ArcSwap<String>>,
}

impl CertResolver {
    pub fn new(manager: Arc<dyn CertManager>, default_name: Arc<ArcSwap<String>>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            default_name,
        })
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertResolver")
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = match hello.server_name() {
            Some(sn) => sn.to_string(),
            None => self.default_name.load().as_ref().clone(),
        };
        if name.is_empty() {
            return None;
        }
        let is_acme = hello
            .alpn()
            .map(|mut protos| protos.any(|p| p == ACME_TLS_ALPN_PROTO.as_bytes()))
            .unwrap_or(false);
        if is_acme {
            return self.manager.challenge_cert(&name);
        }
        self.manager.certificate(&name)
    }
}

/// Base TLS server configuration shared by all backends: TLS 1.2+, the
/// SNI-driven certificate selector, default ALPN. Backends override ALPN
/// and client-auth settings for their own needs.
pub fn base_server_config(resolver: Arc<CertResolver>) -> ServerConfig {
    let mut cfg = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_cert_resolver(resolver);
    cfg.alpn_protocols = DEFAULT_ALPN.iter().map(|p| p.as_bytes().to_vec()).collect();
    cfg
}

/// HTTP handler answering ACME HTTP-01 path probes; everything else
/// falls through to `fallback`.
pub fn http_handler(manager: Arc<dyn CertManager>, fallback: Option<Router>) -> Router {
    let router = Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(serve_http_challenge),
        )
        .with_state(manager);
    match fallback {
        Some(fb) => router.merge(fb),
        None => router,
    }
}

async fn serve_http_challenge(
    State(manager): State<Arc<dyn CertManager>>,
    AxumPath(token): AxumPath<String>,
) -> Result<String, StatusCode> {
    manager.http_challenge(&token).ok_or(StatusCode::NOT_FOUND)
}

/// Assemble a `CertifiedKey` from PEM-encoded chain and key.
fn certified_key_from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>, Error> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &*chain_pem)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Acme(format!("certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Acme("empty certificate chain".into()));
    }
    let key = rustls_pemfile::private_key(&mut &*key_pem)
        .map_err(|e| Error::Acme(format!("private key: {e}")))?
        .ok_or_else(|| Error::Acme("no private key found".into()))?;
    let key = any_supported_type(&key).map_err(|e| Error::Acme(format!("private key: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(certs, key)))
}

/// Seconds until the leaf certificate of a PEM chain expires.
fn chain_expires_in(chain_pem: &[u8]) -> Option<i64> {
    let leaf = rustls_pemfile::certs(&mut &*chain_pem).next()?.ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let now = chrono::Utc::now().timestamp();
    Some(cert.validity().not_after.timestamp() - now)
}

// ---------------------------------------------------------------------------
// ACME-backed manager
// ---------------------------------------------------------------------------

/// Production certificate manager backed by an ACME directory.
///
/// Certificates and the account are cached under the configured
/// directory. Resolution is synchronous: a cache miss schedules issuance
/// on the background task and the current handshake fails; subsequent
/// handshakes are served from the cache.
pub struct AcmeManager {
    cache_dir: PathBuf,
    email: Option<String>,
    accept_tos: bool,
    directory_url: String,
    certs: DashMap<String, Arc<CertifiedKey>>,
    challenge_certs: DashMap<String, Arc<CertifiedKey>>,
    http_challenges: DashMap<String, String>,
    pending: Mutex<HashSet<String>>,
    issue_tx: mpsc::UnboundedSender<String>,
}

impl AcmeManager {
    pub fn new(cache_dir: PathBuf, email: Option<String>, accept_tos: bool) -> Arc<Self> {
        Self::with_directory(
            cache_dir,
            email,
            accept_tos,
            LetsEncrypt::Production.url().to_string(),
        )
    }

    pub fn with_directory(
        cache_dir: PathBuf,
        email: Option<String>,
        accept_tos: bool,
        directory_url: String,
    ) -> Arc<Self> {
        let (issue_tx, issue_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            cache_dir,
            email,
            accept_tos,
            directory_url,
            certs: DashMap::new(),
            challenge_certs: DashMap::new(),
            http_challenges: DashMap::new(),
            pending: Mutex::new(HashSet::new()),
            issue_tx,
        });
        tokio::spawn(Self::issuer_task(Arc::clone(&manager), issue_rx));
        tokio::spawn(Self::renewal_task(Arc::clone(&manager)));
        manager
    }

    fn cert_dir(&self, server_name: &str) -> PathBuf {
        self.cache_dir.join("certs").join(server_name)
    }

    /// Load a cached certificate from disk into the in-memory map.
    fn load_cached(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let dir = self.cert_dir(server_name);
        let chain = std::fs::read(dir.join("fullchain.pem")).ok()?;
        let key = std::fs::read(dir.join("key.pem")).ok()?;
        match certified_key_from_pem(&chain, &key) {
            Ok(ck) => {
                self.certs.insert(server_name.to_string(), Arc::clone(&ck));
                Some(ck)
            }
            Err(e) => {
                warn!(%server_name, error = %e, "discarding unreadable cached certificate");
                None
            }
        }
    }

    fn schedule_issuance(&self, server_name: &str) {
        let mut pending = self.pending.lock();
        if pending.insert(server_name.to_string()) {
            let _ = self.issue_tx.send(server_name.to_string());
        }
    }

    async fn issuer_task(manager: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        let mut account: Option<Account> = None;
        while let Some(server_name) = rx.recv().await {
            if account.is_none() {
                match manager.open_account().await {
                    Ok(a) => account = Some(a),
                    Err(e) => {
                        error!(error = %e, "ACME account unavailable");
                        manager.pending.lock().remove(&server_name);
                        continue;
                    }
                }
            }
            let account_ref = account.as_ref().unwrap();
            if let Err(e) = manager.issue(account_ref, &server_name).await {
                warn!(%server_name, error = %e, "certificate issuance failed");
            }
            manager.pending.lock().remove(&server_name);
            manager.challenge_certs.remove(&server_name);
        }
    }

    async fn renewal_task(manager: Arc<Self>) {
        loop {
            tokio::time::sleep(RENEWAL_INTERVAL).await;
            let certs_dir = manager.cache_dir.join("certs");
            let entries = match std::fs::read_dir(&certs_dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let chain = match std::fs::read(entry.path().join("fullchain.pem")) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                match chain_expires_in(&chain) {
                    Some(secs) if secs < RENEWAL_WINDOW.as_secs() as i64 => {
                        info!(server_name = %name, "certificate due for renewal");
                        manager.schedule_issuance(&name);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Load the persisted account or register a new one.
    async fn open_account(&self) -> Result<Account, Error> {
        let acme_dir = self.cache_dir.join("acme");
        std::fs::create_dir_all(&acme_dir).map_err(Error::Io)?;
        let creds_path = acme_dir.join("account.json");

        if creds_path.exists() {
            debug!("loading ACME account from cache");
            let raw = tokio::fs::read_to_string(&creds_path).await.map_err(Error::Io)?;
            let creds: AccountCredentials =
                serde_json::from_str(&raw).map_err(|e| Error::Acme(e.to_string()))?;
            return Account::builder()
                .map_err(|e| Error::Acme(e.to_string()))?
                .from_credentials(creds)
                .await
                .map_err(|e| Error::Acme(e.to_string()));
        }

        if !self.accept_tos {
            return Err(Error::Acme(
                "terms of service not accepted; set accept-tos".into(),
            ));
        }
        let contact: Vec<String> = self
            .email
            .iter()
            .map(|e| format!("mailto:{e}"))
            .collect();
        info!("registering new ACME account");
        let (account, creds) = Account::builder()
            .map_err(|e| Error::Acme(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &contact.iter().map(String::as_str).collect::<Vec<_>>(),
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| Error::Acme(e.to_string()))?;
        let raw = serde_json::to_string_pretty(&creds).map_err(|e| Error::Acme(e.to_string()))?;
        tokio::fs::write(&creds_path, raw).await.map_err(Error::Io)?;
        Ok(account)
    }

    /// Run one order to completion for a server name.
    async fn issue(&self, account: &Account, server_name: &str) -> Result<(), Error> {
        info!(%server_name, "ordering certificate");
        let identifier = Identifier::Dns(server_name.to_string());
        let mut order = account
            .new_order(&NewOrder::new(&[identifier]))
            .await
            .map_err(|e| Error::Acme(e.to_string()))?;

        let mut http_token: Option<String> = None;
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(|e| Error::Acme(e.to_string()))?;
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(Error::Acme(format!(
                            "authorization for {server_name} is {status:?}"
                        )))
                    }
                }
                let has_tls_alpn01 = authz
                    .challenges
                    .iter()
                    .any(|c| c.r#type == ChallengeType::TlsAlpn01);
                let has_http01 = authz
                    .challenges
                    .iter()
                    .any(|c| c.r#type == ChallengeType::Http01);
                if has_tls_alpn01 {
                    let mut challenge = authz.challenge(ChallengeType::TlsAlpn01).unwrap();
                    let digest = challenge.key_authorization().digest();
                    let cert = challenge_certificate(server_name, digest.as_ref())?;
                    self.challenge_certs.insert(server_name.to_string(), cert);
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| Error::Acme(e.to_string()))?;
                } else if has_http01 {
                    let mut challenge = authz.challenge(ChallengeType::Http01).unwrap();
                    let key_auth = challenge.key_authorization().as_str().to_string();
                    let token = challenge.token.clone();
                    self.http_challenges.insert(token.clone(), key_auth);
                    http_token = Some(token);
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| Error::Acme(e.to_string()))?;
                } else {
                    return Err(Error::Acme(format!(
                        "no usable challenge offered for {server_name}"
                    )));
                }
            }
        }

        let result = self.finish_order(&mut order, server_name).await;
        if let Some(token) = http_token {
            self.http_challenges.remove(&token);
        }
        result
    }

    async fn finish_order(
        &self,
        order: &mut instant_acme::Order,
        server_name: &str,
    ) -> Result<(), Error> {
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            order.refresh().await.map_err(|e| Error::Acme(e.to_string()))?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(Error::Acme(format!("order for {server_name} invalid")))
                }
                status => debug!(%server_name, ?status, "waiting for order"),
            }
        }

        let key_pem = order
            .finalize()
            .await
            .map_err(|e| Error::Acme(e.to_string()))?;
        let chain_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|e| Error::Acme(e.to_string()))?
            {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        let dir = self.cert_dir(server_name);
        tokio::fs::create_dir_all(&dir).await.map_err(Error::Io)?;
        tokio::fs::write(dir.join("fullchain.pem"), chain_pem.as_bytes())
            .await
            .map_err(Error::Io)?;
        tokio::fs::write(dir.join("key.pem"), key_pem.as_bytes())
            .await
            .map_err(Error::Io)?;

        let ck = certified_key_from_pem(chain_pem.as_bytes(), key_pem.as_bytes())?;
        self.certs.insert(server_name.to_string(), ck);
        info!(%server_name, "certificate issued");
        Ok(())
    }
}

impl CertManager for AcmeManager {
    fn certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(ck) = self.certs.get(server_name) {
            return Some(Arc::clone(&ck));
        }
        if let Some(ck) = self.load_cached(server_name) {
            return Some(ck);
        }
        self.schedule_issuance(server_name);
        None
    }

    fn challenge_cert(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.challenge_certs
            .get(server_name)
            .map(|ck| Arc::clone(&ck))
    }

    fn http_challenge(&self, token: &str) -> Option<String> {
        self.http_challenges.get(token).map(|v| v.clone())
    }
}

/// Self-signed certificate carrying the ACME identifier extension for a
/// TLS-ALPN-01 validation.
fn challenge_certificate(server_name: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, Error> {
    let mut params = rcgen::CertificateParams::new(vec![server_name.to_string()])
        .map_err(|e| Error::Acme(e.to_string()))?;
    params
        .custom_extensions
        .push(rcgen::CustomExtension::new_acme_identifier(digest));
    let key = rcgen::KeyPair::generate().map_err(|e| Error::Acme(e.to_string()))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Acme(e.to_string()))?;
    let signing_key = any_supported_type(&PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        key.serialize_der(),
    )))
    .map_err(|e| Error::Acme(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(
        vec![cert.der().clone()],
        signing_key,
    )))
}

// ---------------------------------------------------------------------------
// In-process CA for tests
// ---------------------------------------------------------------------------

/// Certificate manager backed by an ephemeral root CA.
///
/// Leaves are issued and memoized on first resolution, so a test proxy
/// answers any server name immediately. The root certificate is exposed
/// for client-side trust, and client credentials can be minted for
/// exercising client-certificate ACLs.
pub struct TestCertManager {
    ca_cert: rcgen::Certificate,
    ca_key: rcgen::KeyPair,
    issued: DashMap<String, Arc<CertifiedKey>>,
}

impl TestCertManager {
    pub fn new(ca_name: &str) -> Result<Self, Error> {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, ca_name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = rcgen::KeyPair::generate().map_err(|e| Error::Acme(e.to_string()))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| Error::Acme(e.to_string()))?;
        Ok(Self {
            ca_cert,
            ca_key,
            issued: DashMap::new(),
        })
    }

    /// Root certificate in DER form, for client root stores.
    pub fn root_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Root certificate in PEM form, for `client-cas` style config fields.
    pub fn root_pem(&self) -> String {
        self.ca_cert.pem()
    }

    fn issue_leaf(&self, server_name: &str) -> Result<Arc<CertifiedKey>, Error> {
        let params = rcgen::CertificateParams::new(vec![server_name.to_string()])
            .map_err(|e| Error::Acme(e.to_string()))?;
        let key = rcgen::KeyPair::generate().map_err(|e| Error::Acme(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::Acme(e.to_string()))?;
        let signing_key = any_supported_type(&PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key.serialize_der(),
        )))
        .map_err(|e| Error::Acme(e.to_string()))?;
        Ok(Arc::new(CertifiedKey::new(
            vec![cert.der().clone(), self.ca_cert.der().clone()],
            signing_key,
        )))
    }

    /// Mint a client certificate with the given common name, signed by
    /// this CA. Returns the certificate and its PKCS#8 key, DER-encoded.
    pub fn client_credentials(
        &self,
        common_name: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), Error> {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let key = rcgen::KeyPair::generate().map_err(|e| Error::Acme(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::Acme(e.to_string()))?;
        Ok((
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        ))
    }
}

impl CertManager for TestCertManager {
    fn certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(ck) = self.issued.get(server_name) {
            return Some(Arc::clone(&ck));
        }
        match self.issue_leaf(server_name) {
            Ok(ck) => {
                self.issued.insert(server_name.to_string(), Arc::clone(&ck));
                Some(ck)
            }
            Err(e) => {
                warn!(%server_name, error = %e, "test CA issuance failed");
                None
            }
        }
    }

    fn challenge_cert(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        // Tests exercise the ACME-ALPN interception path with ordinary
        // leaves; there is no validation to answer.
        self.certificate(server_name)
    }

    fn http_challenge(&self, _token: &str) -> Option<String> {
        None
    }
}
