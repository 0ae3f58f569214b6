//! snigate - multi-tenant TLS-terminating reverse proxy
//!
//! A proxy that:
//! - Listens on one TCP port and demultiplexes TLS connections by SNI
//! - Applies per-backend admission control: IP ACL, client-certificate
//!   subject ACL, token-bucket rate limit
//! - Forwards sessions as opaque TLS passthrough, re-encrypted TLS, plain
//!   TCP, reverse-proxied HTTP/HTTPS, or the built-in admin console
//! - Obtains and renews server certificates from an ACME provider
//!   (TLS-ALPN-01 and HTTP-01), or from an in-process CA in test mode
//! - Authenticates HTTP-mode users with an OIDC code + PKCE flow

pub mod backend;
pub mod bridge;
pub mod cert_manager;
pub mod client_hello;
pub mod config;
pub mod conn;
pub mod console;
pub mod errors;
pub mod internal_http;
pub mod metrics;
pub mod oidc;
pub mod proxy;
pub mod rate_limit;

// Re-export commonly used types
pub use backend::Backend;
pub use cert_manager::{AcmeManager, CertManager, TestCertManager};
pub use config::{BackendConfig, Config, Mode};
pub use errors::Error;
pub use proxy::Proxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
