//! Non-blocking TLS bridge.
//!
//! The source drives a TLS session through four opaque callbacks (read/write plaintext, push/
//! pull ciphertext). `rustls::Connection` already exposes exactly that shape —
//! `read_tls`/`write_tls` for ciphertext against the raw socket, `reader()`/`writer()` for
//! plaintext — so this module is a thin pump around it rather than a hand-rolled state
//! machine, modernizing the pattern `ext-net-ops_tls.rs` used against an older pinned rustls.
//! The session itself is always caller-supplied (SPEC_FULL §1: TLS session material is out of
//! scope), so there is no code here that builds a `ClientConfig`/`ServerConfig` or touches
//! certificates.

use std::io::{self, Read, Write};

use mio::net::TcpStream;

/// The opaque TLS handle callers hand to [`crate::socket::Socket::set_secure_session`].
/// Re-exported so callers don't need a direct `rustls` dependency of their own beyond what
/// they already need to build the `ClientConnection`/`ServerConnection`.
pub type TlsSession = rustls::Connection;

/// What happened when pumping ciphertext from the socket into the session.
pub(crate) enum PumpRead {
    /// No ciphertext was available; try again on the next readiness event.
    WouldBlock,
    /// The peer closed the connection at the TCP level mid-handshake/session.
    Eof,
    /// Ciphertext was read and processed; plaintext (if any) is available via
    /// [`TlsDriver::read_plaintext`], and/or the handshake advanced.
    Progressed,
}

/// Owns the caller-supplied [`TlsSession`] and pumps it against a [`TcpStream`].
///
/// All I/O here is necessarily non-blocking: `rustls` never performs its own syscalls, it only
/// ever asks to be handed bytes or to hand bytes out, so "never block" falls out of always
/// driving it against a socket already known to be readable/writable from the loop's readiness
/// event rather than calling it speculatively.
pub(crate) struct TlsDriver {
    session: TlsSession,
}

impl TlsDriver {
    pub fn new(session: TlsSession) -> TlsDriver {
        TlsDriver { session }
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    /// Pull ciphertext off `stream` and feed it to the session. Returns promptly with
    /// [`PumpRead::WouldBlock`] the moment the socket has nothing more to offer.
    pub fn pump_read(&mut self, stream: &mut TcpStream) -> io::Result<PumpRead> {
        match self.session.read_tls(stream) {
            Ok(0) => return Ok(PumpRead::Eof),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(PumpRead::WouldBlock),
            Err(e) => return Err(e),
        }

        match self.session.process_new_packets() {
            Ok(_) => Ok(PumpRead::Progressed),
            Err(err) => {
                // Best-effort: rustls may have queued an alert describing why; try to flush
                // it before surfacing the error to the caller, who will tear the socket down.
                let _ = self.session.write_tls(stream);
                Err(io::Error::new(io::ErrorKind::Other, err))
            }
        }
    }

    /// Push any pending ciphertext (handshake flight or encrypted application data) out to
    /// `stream` until the session has nothing left to send or the socket would block.
    pub fn pump_write(&mut self, stream: &mut TcpStream) -> io::Result<bool> {
        let mut wrote_any = false;
        while self.session.wants_write() {
            match self.session.write_tls(stream) {
                Ok(0) => break,
                Ok(_) => wrote_any = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(wrote_any)
    }

    /// Drain decrypted application data already buffered by the session.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.session.reader().read(buf) {
            Ok(n) => Ok(n),
            // rustls signals "no plaintext buffered right now" this way; treat it like any
            // other would-block so the caller's drain loop stops cleanly.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Encrypt `data` into the session's outgoing buffer. Does not itself touch the socket;
    /// the next `pump_write` call flushes it.
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.session.writer().write(data)
    }

    /// Begin the TLS bye (`close_notify`). Does not block on the peer's own bye.
    pub fn send_close_notify(&mut self) {
        self.session.send_close_notify();
    }
}
