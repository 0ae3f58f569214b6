//! YAML configuration model with validation
//!
//! All routing and admission decisions are externalized: server names,
//! forwarding modes, upstream addresses, client ACLs, and rate limits all
//! come from the configuration file. A subset of the fields (listen
//! addresses, cache directory) is fixed once the proxy has started;
//! everything else can change through `Proxy::reconfigure`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Top-level proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Listen address for TLS connections, e.g. ":10443" or "0.0.0.0:443".
    pub tls_addr: String,
    /// Optional listen address for ACME HTTP-01 challenges (port 80).
    pub http_addr: Option<String>,
    /// Directory for the ACME account, cached certificates, and keys.
    pub cache_dir: PathBuf,
    /// Contact email for the ACME account.
    pub email: Option<String>,
    /// Server name used when a ClientHello carries no SNI.
    pub default_server_name: Option<String>,
    /// Maximum number of open connections; excess is refused before the
    /// TLS handshake.
    pub max_open: usize,
    /// Accept the ACME provider's terms of service.
    pub accept_tos: bool,
    /// Backend definitions, one per tenant.
    pub backends: Vec<BackendConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tls_addr: ":10443".to_string(),
            http_addr: None,
            cache_dir: PathBuf::from("/var/cache/snigate"),
            email: None,
            default_server_name: None,
            max_open: default_max_open(),
            accept_tos: false,
            backends: Vec::new(),
        }
    }
}

fn default_max_open() -> usize {
    2000
}

/// Forwarding mode of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Forward the encrypted byte stream without terminating TLS.
    #[serde(rename = "tlspassthrough")]
    TlsPassthrough,
    /// Terminate TLS, then re-encrypt to the upstream with its own TLS
    /// session, validated against `forward_root_cas`.
    Tls,
    /// Terminate TLS, plaintext TCP to the upstream.
    Tcp,
    /// Terminate TLS, reverse-proxy HTTP requests to a plaintext upstream.
    Http,
    /// Terminate TLS, reverse-proxy HTTP requests to an HTTPS upstream.
    Https,
    /// Terminate TLS and serve the built-in admin console.
    Console,
}

impl Mode {
    /// Modes whose sessions are handed off to an in-process HTTP server.
    pub fn is_http(self) -> bool {
        matches!(self, Mode::Http | Mode::Https | Mode::Console)
    }

    /// Modes that dial an upstream address.
    pub fn dials_upstream(self) -> bool {
        matches!(
            self,
            Mode::TlsPassthrough | Mode::Tls | Mode::Tcp | Mode::Http | Mode::Https
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::TlsPassthrough => "TLSPASSTHROUGH",
            Mode::Tls => "TLS",
            Mode::Tcp => "TCP",
            Mode::Http => "HTTP",
            Mode::Https => "HTTPS",
            Mode::Console => "CONSOLE",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token-bucket rate limit applied just before dialing or handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Sustained requests per second. Zero never refills: connections
    /// block until the proxy shuts down.
    pub rps: u32,
    /// Burst size.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

/// OIDC parameters for HTTP-family backends that require identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OidcConfig {
    /// Discovery URL; when set, the auth and token endpoints are read
    /// from the discovery document.
    pub discovery_url: Option<String>,
    pub auth_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    /// Redirect URL served by the proxy itself.
    pub redirect_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            discovery_url: None,
            auth_endpoint: None,
            token_endpoint: None,
            redirect_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

/// One tenant of the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackendConfig {
    /// Server names this backend answers for. Each name may appear in at
    /// most one backend.
    pub server_names: Vec<String>,
    /// Forwarding mode.
    pub mode: Mode,
    /// Upstream addresses, host:port. Dialed round-robin.
    pub addresses: Vec<String>,
    /// ALPN protocols advertised to clients; defaults to h2 + http/1.1.
    pub alpn_protos: Option<Vec<String>>,
    /// Require and verify a client certificate.
    pub client_auth: bool,
    /// Root CAs for client-certificate validation: inline PEM or an
    /// absolute path to a PEM file.
    pub client_cas: Option<String>,
    /// Permitted client-certificate subjects (RFC 2253 strings). Absent
    /// means any certificate chaining to `client_cas` is accepted.
    pub client_acl: Option<Vec<String>>,
    /// Root CAs used to validate the upstream's certificate in TLS and
    /// HTTPS modes: inline PEM or an absolute path.
    pub forward_root_cas: Option<String>,
    /// Source-IP allow list (CIDR). Absent means all sources allowed.
    pub ip_acl: Option<Vec<String>>,
    /// Rate limit. Absent means unlimited.
    pub rate_limit: Option<RateLimitConfig>,
    /// OIDC identity requirement for HTTP-family modes.
    pub oidc: Option<OidcConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            server_names: Vec::new(),
            mode: Mode::Tcp,
            addresses: Vec::new(),
            alpn_protos: None,
            client_auth: false,
            client_cas: None,
            client_acl: None,
            forward_root_cas: None,
            ip_acl: None,
            rate_limit: None,
            oidc: None,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let cfg: Config =
            serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Structural validation. Called on load and on every reconfigure.
    pub fn check(&self) -> Result<(), Error> {
        parse_listen_addr(&self.tls_addr)
            .ok_or_else(|| Error::Config(format!("invalid tls-addr {:?}", self.tls_addr)))?;
        if let Some(addr) = &self.http_addr {
            parse_listen_addr(addr)
                .ok_or_else(|| Error::Config(format!("invalid http-addr {addr:?}")))?;
        }
        if self.max_open == 0 {
            return Err(Error::Config("max-open must be positive".into()));
        }

        let mut seen = HashSet::new();
        for (i, be) in self.backends.iter().enumerate() {
            if be.server_names.is_empty() {
                return Err(Error::Config(format!("backend[{i}]: no server names")));
            }
            for sn in &be.server_names {
                if sn.is_empty() {
                    return Err(Error::Config(format!("backend[{i}]: empty server name")));
                }
                if !seen.insert(sn.to_ascii_lowercase()) {
                    return Err(Error::Config(format!(
                        "server name {sn:?} appears in more than one backend"
                    )));
                }
            }
            if be.mode.dials_upstream() && be.addresses.is_empty() {
                return Err(Error::Config(format!(
                    "backend[{i}]: mode {} requires at least one address",
                    be.mode
                )));
            }
            for addr in &be.addresses {
                if !valid_host_port(addr) {
                    return Err(Error::Config(format!(
                        "backend[{i}]: invalid address {addr:?}"
                    )));
                }
            }
            if be.client_auth && be.client_cas.is_none() {
                return Err(Error::Config(format!(
                    "backend[{i}]: client-auth requires client-cas"
                )));
            }
            if let Some(acl) = &be.ip_acl {
                for cidr in acl {
                    cidr.parse::<IpNet>().map_err(|e| {
                        Error::Config(format!("backend[{i}]: invalid ip-acl entry {cidr:?}: {e}"))
                    })?;
                }
            }
            if let Some(oidc) = &be.oidc {
                if !be.mode.is_http() {
                    return Err(Error::Config(format!(
                        "backend[{i}]: oidc requires an HTTP-family mode"
                    )));
                }
                if oidc.redirect_url.is_empty() {
                    return Err(Error::Config(format!(
                        "backend[{i}]: oidc redirect-url is required"
                    )));
                }
                if oidc.discovery_url.is_none()
                    && (oidc.auth_endpoint.is_none() || oidc.token_endpoint.is_none())
                {
                    return Err(Error::Config(format!(
                        "backend[{i}]: oidc needs discovery-url or both endpoints"
                    )));
                }
            }
        }
        if let Some(def) = &self.default_server_name {
            if !def.is_empty() && !seen.contains(&def.to_ascii_lowercase()) {
                return Err(Error::Config(format!(
                    "default-server-name {def:?} matches no backend"
                )));
            }
        }
        Ok(())
    }

    /// Canonical serialization used for the reconfigure no-op check.
    pub fn canonical(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

/// Parse a listen address, allowing the ":port" shorthand.
pub fn parse_listen_addr(s: &str) -> Option<SocketAddr> {
    if let Some(port) = s.strip_prefix(':') {
        let port: u16 = port.parse().ok()?;
        return Some(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    s.parse().ok()
}

/// Accept "host:port" with a DNS name or literal IP host part.
fn valid_host_port(s: &str) -> bool {
    if s.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Load an X.509 root store from inline PEM or an absolute path.
pub fn load_cert_pool(s: &str) -> Result<rustls::RootCertStore, Error> {
    let bytes = if s.starts_with('/') {
        std::fs::read(s).map_err(|e| Error::Config(format!("{s}: {e}")))?
    } else {
        s.as_bytes().to_vec()
    };
    let mut pool = rustls::RootCertStore::empty();
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut bytes.as_slice()) {
        let cert = cert.map_err(|e| Error::Config(format!("invalid certs: {e}")))?;
        pool.add(cert)
            .map_err(|e| Error::Config(format!("invalid certs: {e}")))?;
        added += 1;
    }
    if added == 0 {
        return Err(Error::Config("invalid certs".into()));
    }
    Ok(pool)
}
