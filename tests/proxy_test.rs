//! End-to-end proxy tests against the in-process CA.
//!
//! Each test stands up a full proxy on an ephemeral port, with real TLS
//! handshakes from a rustls client and real TCP upstreams.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use snigate::cert_manager::TestCertManager;
use snigate::config::{BackendConfig, Config, Mode, RateLimitConfig};
use snigate::proxy::Proxy;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Plain TCP upstream that echoes everything it reads.
struct EchoUpstream {
    addr: SocketAddr,
    bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EchoUpstream {
    async fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let bytes_received = Arc::new(AtomicU64::new(0));
        let bytes = Arc::clone(&bytes_received);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        let bytes = Arc::clone(&bytes);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        bytes.fetch_add(n as u64, Ordering::Relaxed);
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for EchoUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// TLS upstream with its own self-signed certificate, for passthrough.
struct TlsUpstream {
    addr: SocketAddr,
    cert_der: CertificateDer<'static>,
}

impl TlsUpstream {
    async fn spawn(server_name: &str, marker: &'static [u8]) -> std::io::Result<Self> {
        init_crypto_provider();
        let signed = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(std::io::Error::other)?;
        let cert_der = signed.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signed.key_pair.serialize_der()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key)
            .map_err(std::io::Error::other)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(stream).await {
                        let mut buf = vec![0u8; 1024];
                        if tls.read(&mut buf).await.is_ok() {
                            let _ = tls.write_all(marker).await;
                            let _ = tls.shutdown().await;
                        }
                    }
                });
            }
        });

        Ok(Self { addr, cert_der })
    }
}

fn backend(server_names: &[&str], mode: Mode, addresses: Vec<String>) -> BackendConfig {
    BackendConfig {
        server_names: server_names.iter().map(|s| s.to_string()).collect(),
        mode,
        addresses,
        ..Default::default()
    }
}

fn base_config(backends: Vec<BackendConfig>) -> Config {
    Config {
        tls_addr: "127.0.0.1:0".to_string(),
        cache_dir: std::env::temp_dir().join("snigate-test"),
        max_open: 100,
        backends,
        ..Default::default()
    }
}

async fn start_proxy(cfg: Config, ca: Arc<TestCertManager>) -> Arc<Proxy> {
    init_crypto_provider();
    let proxy = Proxy::new(cfg, ca).await.expect("proxy construction");
    proxy.start().await.expect("proxy start");
    proxy
}

fn client_config(
    root: &CertificateDer<'static>,
    client_cred: Option<(CertificateDer<'static>, PrivateKeyDer<'static>)>,
) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match client_cred {
        Some((cert, key)) => builder
            .with_client_auth_cert(vec![cert], key)
            .expect("client auth config"),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

async fn tls_connect(
    addr: SocketAddr,
    server_name: &str,
    config: Arc<rustls::ClientConfig>,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    TlsConnector::from(config).connect(server_name, stream).await
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn tcp_mode_bridges_and_conserves_bytes() {
    init_crypto_provider();
    let upstream = EchoUpstream::spawn().await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let cfg = base_config(vec![backend(
        &["a.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    )]);
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    let config = client_config(&ca.root_der(), None);
    let mut tls = tls_connect(addr, "a.example.com", config).await.unwrap();

    tls.write_all(b"PING\n").await.unwrap();
    let mut buf = [0u8; 5];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING\n");
    assert_eq!(upstream.bytes_received.load(Ordering::Relaxed), 5);

    tls.shutdown().await.unwrap();
    drop(tls);
    settle().await;

    let state = proxy.shared();
    assert_eq!(state.open_connections(), 0);
    assert_eq!(state.events.count("unexpected SNI"), 0);
    assert_eq!(state.events.count("invalid ClientHello"), 0);
    assert_eq!(state.events.count("access denied"), 0);

    let metrics = state.metrics.snapshot();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].backend, "a.example.com");
    assert_eq!(metrics[0].connections, 1);
    assert!(metrics[0].bytes_received > 0);

    proxy.stop();
}

#[tokio::test]
async fn unknown_sni_is_refused_with_unrecognized_name() {
    init_crypto_provider();
    let upstream = EchoUpstream::spawn().await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let cfg = base_config(vec![backend(
        &["a.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    )]);
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    let config = client_config(&ca.root_der(), None);
    let err = tls_connect(addr, "b.example.com", config).await.unwrap_err();
    let msg = format!("{err:?}");
    assert!(
        msg.contains("UnrecognizedName") || msg.contains("unexpected"),
        "expected unrecognized_name alert, got {msg}"
    );

    settle().await;
    assert_eq!(proxy.shared().events.count("unexpected SNI"), 1);
    proxy.stop();
}

#[tokio::test]
async fn missing_sni_uses_default_server_name() {
    init_crypto_provider();
    let upstream = EchoUpstream::spawn().await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let mut cfg = base_config(vec![backend(
        &["a.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    )]);
    cfg.default_server_name = Some("a.example.com".to_string());
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    // Connecting by IP sends no SNI; certificate checks are disabled for
    // this client because the leaf names the default host, not the IP.
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoVerify));
    let stream = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::IpAddress(addr.ip().into());
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
        .unwrap();

    tls.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    settle().await;
    assert_eq!(proxy.shared().events.count("no SNI"), 1);
    proxy.stop();
}

#[tokio::test]
async fn client_certificate_acl_allows_and_denies() {
    init_crypto_provider();
    let http_upstream = spawn_http_upstream(b"upstream body here").await;
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let mut be = backend(
        &["secure.example.com"],
        Mode::Http,
        vec![http_upstream.to_string()],
    );
    be.alpn_protos = Some(vec!["http/1.1".to_string()]);
    be.client_auth = true;
    be.client_cas = Some(ca.root_pem());
    be.client_acl = Some(vec!["CN=alice".to_string()]);
    let cfg = base_config(vec![be]);
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    // alice is on the ACL: the request reaches the upstream.
    let alice = ca.client_credentials("alice").unwrap();
    let config = client_config(&ca.root_der(), Some(alice));
    let mut tls = tls_connect(addr, "secure.example.com", config).await.unwrap();
    tls.write_all(b"GET / HTTP/1.1\r\nHost: secure.example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.ok();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("200 OK"), "got: {response}");
    assert!(response.contains("upstream body here"));

    // bob is not: the handshake itself fails.
    let bob = ca.client_credentials("bob").unwrap();
    let config = client_config(&ca.root_der(), Some(bob));
    let result = async {
        let mut tls = tls_connect(addr, "secure.example.com", config).await?;
        // The rejection may arrive with the first application read.
        tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
        let mut buf = [0u8; 16];
        tls.read(&mut buf).await
    }
    .await;
    assert!(result.is_err(), "bob must not reach the backend");

    settle().await;
    let state = proxy.shared();
    assert_eq!(state.events.count("allow [CN=alice] to secure.example.com"), 1);
    assert_eq!(state.events.count("deny [CN=bob] to secure.example.com"), 1);
    proxy.stop();
}

#[tokio::test]
async fn passthrough_hands_tls_to_upstream_untouched() {
    init_crypto_provider();
    let upstream = TlsUpstream::spawn("pt.example.com", b"upstream saw you").await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let cfg = base_config(vec![backend(
        &["pt.example.com"],
        Mode::TlsPassthrough,
        vec![upstream.addr.to_string()],
    )]);
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    // The client trusts only the upstream's own certificate: a
    // successful handshake proves the proxy never terminated TLS.
    let config = client_config(&upstream.cert_der, None);
    let mut tls = tls_connect(addr, "pt.example.com", config).await.unwrap();
    tls.write_all(b"ping").await.unwrap();
    let mut body = Vec::new();
    tls.read_to_end(&mut body).await.ok();
    assert_eq!(body, b"upstream saw you");

    proxy.stop();
}

#[tokio::test]
async fn admission_cap_refuses_excess_connections() {
    init_crypto_provider();
    let upstream = EchoUpstream::spawn().await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let mut cfg = base_config(vec![backend(
        &["a.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    )]);
    cfg.max_open = 2;
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    let config = client_config(&ca.root_der(), None);
    let mut first = tls_connect(addr, "a.example.com", Arc::clone(&config)).await.unwrap();
    first.write_all(b"1").await.unwrap();
    let mut second = tls_connect(addr, "a.example.com", Arc::clone(&config)).await.unwrap();
    second.write_all(b"2").await.unwrap();
    settle().await;

    // The third is refused before any handshake.
    let third = tls_connect(addr, "a.example.com", Arc::clone(&config)).await;
    assert!(third.is_err(), "third concurrent connection must be refused");

    settle().await;
    assert_eq!(proxy.shared().events.count("too many open connections"), 1);
    proxy.stop();
}

#[tokio::test]
async fn reconfigure_identical_config_is_noop() {
    init_crypto_provider();
    let upstream = EchoUpstream::spawn().await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let cfg = base_config(vec![backend(
        &["a.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    )]);
    let proxy = start_proxy(cfg.clone(), Arc::clone(&ca)).await;

    let before = proxy.shared().registry();
    proxy.reconfigure(cfg.clone()).await.unwrap();
    let after = proxy.shared().registry();
    assert!(
        Arc::ptr_eq(&before, &after),
        "identical config must not rebuild the registry"
    );

    // A differing config swaps the registry; new lookups see it.
    let mut cfg2 = cfg.clone();
    cfg2.backends.push(backend(
        &["b.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    ));
    proxy.reconfigure(cfg2).await.unwrap();
    let swapped = proxy.shared().registry();
    assert!(!Arc::ptr_eq(&after, &swapped));
    assert!(swapped.lookup("b.example.com").is_ok());
    assert!(swapped.lookup("a.example.com").is_ok());

    // Invalid config is rejected and the registry stays.
    let mut bad = cfg.clone();
    bad.backends[0].server_names = vec![String::new()];
    assert!(proxy.reconfigure(bad).await.is_err());
    assert!(Arc::ptr_eq(&swapped, &proxy.shared().registry()));

    proxy.stop();
}

#[tokio::test]
async fn zero_rate_limit_blocks_until_stop() {
    init_crypto_provider();
    let upstream = EchoUpstream::spawn().await.unwrap();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let mut be = backend(
        &["a.example.com"],
        Mode::Tcp,
        vec![upstream.addr.to_string()],
    );
    be.rate_limit = Some(RateLimitConfig { rps: 0, burst: 1 });
    let cfg = base_config(vec![be]);
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    let config = client_config(&ca.root_der(), None);
    let mut tls = tls_connect(addr, "a.example.com", config).await.unwrap();

    // The handshake completed but the session is parked on the limiter;
    // nothing is bridged. Stopping the proxy releases and closes it.
    tls.write_all(b"stuck").await.unwrap();
    let stopper = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            proxy.stop();
        })
    };

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), tls.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {} // closed without data
        other => panic!("expected closed connection, got {other:?}"),
    }
    assert_eq!(upstream.bytes_received.load(Ordering::Relaxed), 0);
    stopper.await.unwrap();
}

#[tokio::test]
async fn console_mode_serves_metrics_page() {
    init_crypto_provider();
    let ca = Arc::new(TestCertManager::new("root-ca.test").unwrap());

    let mut be = backend(&["console.example.com"], Mode::Console, vec![]);
    be.alpn_protos = Some(vec!["http/1.1".to_string()]);
    let cfg = base_config(vec![be]);
    let proxy = start_proxy(cfg, Arc::clone(&ca)).await;
    let addr = proxy.listen_addr().unwrap();

    let config = client_config(&ca.root_der(), None);
    let mut tls = tls_connect(addr, "console.example.com", config).await.unwrap();
    tls.write_all(b"GET / HTTP/1.1\r\nHost: console.example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.ok();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("200 OK"), "got: {response}");
    assert!(response.contains("snigate"));
    assert!(response.contains("Events"));

    proxy.stop();
}

/// Minimal HTTP/1.1 upstream returning a fixed body.
async fn spawn_http_upstream(body: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body).await;
            });
        }
    });
    addr
}

/// Certificate verification disabled; used only where the test's trust
/// anchor cannot match the connection address.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
