//! Crate error type
//!
//! Connection-scoped failures never cross the connection boundary; they
//! are converted into TLS alerts, recorded events, or log lines at the
//! dispatch layer. This enum carries the cases that do travel through
//! `Result` returns.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unusable configuration. The previous configuration
    /// stays in effect when reconfiguration fails.
    #[error("config: {0}")]
    Config(String),

    /// A client-certificate subject was rejected by a backend ACL.
    #[error("access denied")]
    AccessDenied,

    /// No backend answers for the requested server name.
    #[error("unexpected SNI")]
    UnexpectedSni,

    /// The proxy is shutting down; pending waits are abandoned.
    #[error("shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("acme: {0}")]
    Acme(String),
}
