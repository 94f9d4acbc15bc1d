//! Tunnel assembly: the dial/accept state machines, the control
//! multiplexer, and the pieces they share.

pub mod address;
pub mod boost;
pub mod buffered;
mod client;
pub mod control;
mod fallback;
pub mod monitor;
mod server;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::crypto::AeadStream;
use crate::obfs::PuzzleStream;
use crate::tunnel::buffered::BufferedStream;
use crate::tunnel::control::ControlStream;

pub use address::{read_address, write_address, write_uot_preface, UOT_MAGIC};
pub use boost::BoostController;
pub use client::{dial, dial_uot};
pub use control::{CMD_BOOST_ACK, CMD_BOOST_REQUEST};
pub use fallback::run_fallback;
pub use monitor::BandwidthMonitor;
pub use server::{handshake, HandshakeError, Target};

/// The assembled codec stack over a TCP transport.
pub type Stack = AeadStream<PuzzleStream<BufferedStream<TcpStream>>>;

/// An established tunnel, with or without the control multiplexer on
/// top. Both forms present one application-ready byte stream; closing it
/// cascades down to the socket.
pub enum Tunnel {
    /// The bare encrypted stack (downlink boost disabled).
    Plain(Stack),
    /// The stack wrapped with in-band control framing.
    Control(Box<ControlStream<Stack>>),
}

impl Tunnel {
    /// Whether the downlink has switched to the boost carrier.
    pub fn boost_activated(&self) -> bool {
        match self {
            Tunnel::Plain(_) => false,
            Tunnel::Control(s) => s.controller().activated(),
        }
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Tunnel::Control(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Tunnel::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Tunnel::Control(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Plain(s) => Pin::new(s).poll_flush(cx),
            Tunnel::Control(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Tunnel::Control(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
