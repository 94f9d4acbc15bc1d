//! HTTP masquerade.
//!
//! The client opens every connection with a randomized `POST` request
//! header so the first bytes on the wire look like a large file upload.
//! The header is pure dressing: the real stream begins immediately after
//! the blank line, and the advertised `Content-Length` (1–2 GiB) excuses
//! an arbitrarily long-lived upload to a naive classifier.
//!
//! The server consumes the header up to and including the blank line,
//! retaining the consumed bytes so a failed handshake can replay them.

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::tunnel::buffered::BufferedStream;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0",
];

const PATHS: &[&str] = &[
    "/api/v1/upload",
    "/data/sync",
    "/uploads/raw",
    "/api/report",
    "/feed/update",
];

const CONTENT_TYPES: &[&str] = &["application/octet-stream", "application/x-protobuf"];

/// Write a randomized masquerade header to `w`.
pub async fn write_masquerade<W: AsyncWrite + Unpin>(w: &mut W, host: &str) -> Result<()> {
    let (path, ua, ctype, content_length) = {
        let mut rng = rand::thread_rng();
        let path = PATHS[rng.gen_range(0..PATHS.len())];
        let ua = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];
        let ctype = CONTENT_TYPES[rng.gen_range(0..CONTENT_TYPES.len())];
        // Uniform in [1 GiB, 2 GiB).
        let content_length = (1u64 << 30) + rng.gen_range(0..(1u64 << 30));
        (path, ua, ctype, content_length)
    };

    let header = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: {ua}\r\n\
         Content-Type: {ctype}\r\n\
         Content-Length: {content_length}\r\n\
         Connection: keep-alive\r\n\
         Cache-Control: no-cache\r\n\
         \r\n"
    );

    w.write_all(header.as_bytes()).await?;
    Ok(())
}

/// Consume a masquerade header up to and including the blank line,
/// appending every consumed byte to `consumed`. Tolerates a bare `\n`
/// as the blank terminator. On error the caller still holds the bytes
/// read so far.
pub async fn consume_masquerade<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    consumed: &mut Vec<u8>,
) -> Result<()> {
    let start = consumed.len();
    stream.read_line(consumed).await?;
    let request_line = &consumed[start..];
    if request_line.len() < 4 || &request_line[..4] != b"POST" {
        return Err(Error::Transport(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "not a masquerade request: {:?}",
                String::from_utf8_lossy(&request_line[..request_line.len().min(16)])
            ),
        )));
    }

    loop {
        let start = consumed.len();
        let n = stream.read_line(consumed).await?;
        let line = &consumed[start..start + n];
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}
