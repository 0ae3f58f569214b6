//! Bidirectional byte bridge
//!
//! Couples the external (client-facing) stream to the internal
//! (upstream) stream. EOF in one direction half-closes the write side of
//! the other socket so the peer sees the EOF; an I/O error tears both
//! directions down. The first non-EOF error is returned; a clean drain
//! returns the byte counts.

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

/// Outcome of a drained bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bytes copied external -> internal.
    pub to_internal: u64,
    /// Bytes copied internal -> external.
    pub to_external: u64,
}

/// Copy until both directions are done.
///
/// Built on `copy_bidirectional`, which propagates the half-close: when
/// one side reads EOF, the other side's write half is shut down, and the
/// call returns once both directions have finished. Any error cancels
/// the remaining direction.
pub async fn bridge<E, I>(external: &mut E, internal: &mut I) -> std::io::Result<BridgeStats>
where
    E: AsyncRead + AsyncWrite + Unpin + ?Sized,
    I: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (to_internal, to_external) = copy_bidirectional(external, internal).await?;
    Ok(BridgeStats {
        to_internal,
        to_external,
    })
}

/// True for errors that are a normal end of a proxied session rather
/// than something worth surfacing: resets and aborted writes happen
/// whenever one peer walks away first.
pub fn is_benign_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}
