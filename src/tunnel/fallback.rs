//! Fallback replay for failed handshakes.
//!
//! A connection that fails the handshake may be an active prober. Rather
//! than closing it — a fingerprint in itself — the server can replay
//! every byte it consumed into an innocent endpoint (typically a real
//! web server) and keep copying both ways, so the prober sees exactly
//! the behavior of that endpoint.

use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::tunnel::server::HandshakeError;

/// Replay a failed handshake into `fallback_addr`: the consumed HTTP
/// header first, then the codec-recorded bytes, then a bidirectional
/// copy until either side closes.
pub async fn run_fallback(err: Box<HandshakeError>, fallback_addr: &str) -> io::Result<()> {
    let (mut raw, http_header, read_data, cause) = err.into_parts();
    debug!(%cause, fallback = fallback_addr, "replaying suspicious connection");

    let mut fallback = TcpStream::connect(fallback_addr).await?;
    fallback.set_nodelay(true)?;

    if !http_header.is_empty() {
        fallback.write_all(&http_header).await?;
    }
    if !read_data.is_empty() {
        fallback.write_all(&read_data).await?;
    }
    fallback.flush().await?;

    tokio::io::copy_bidirectional(&mut raw, &mut fallback).await?;
    Ok(())
}
