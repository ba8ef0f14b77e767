//! The `Socket` component: a non-blocking TCP connection, optionally TLS-wrapped, driven by the
//! loop's readiness events.
//!
//! Grounded on the teacher's `EventLoop`/`Handler` split (every callback takes `&mut EventLoop`
//! so it can re-register interest or arm more timers from inside itself) and on the
//! `yuv`/`nakamoto` reactors' pattern of a lightweight dispatch adapter (here `SocketWatcher`)
//! kept separate from the public handle type, so the handle stays cheap to clone and the
//! `Rc<dyn IoHandler>` the loop holds doesn't have to be the same type callers pass around.
//! State transitions follow SPEC_FULL §4.4's table; the write path reuses [`crate::buffer`]'s
//! `WriteQueue` for both plaintext and (pre-encryption) TLS application data.

use std::cell::{Ref, RefCell, RefMut};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::buffer::{Buffer, WriteQueue};
use crate::error::{Error, Result};
use crate::reactor::{IoHandler, Loop};
use crate::timer::Timeout;
#[cfg(feature = "tls")]
use crate::tls::{PumpRead, TlsDriver, TlsSession};

/// Where a [`Socket`] sits in its connection lifecycle. Mirrors SPEC_FULL §4.4's state table;
/// `Handshaking` is only ever entered when a TLS session has been installed via
/// [`Socket::set_secure_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Connecting,
    Handshaking,
    Open,
    HalfClosedWrite,
    Closing,
    Closed,
}

/// Tuning knobs for a single [`Socket`].
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    /// Inactivity timeout. Zero disables the timer entirely (SPEC_FULL §4.4 invariant 3).
    pub timeout: Duration,
    /// Size of the scratch buffer used to pull bytes off the wire per `on_read` delivery.
    pub chunksize: usize,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig { timeout: Duration::ZERO, chunksize: 64 * 1024 }
    }
}

/// Callbacks a caller wires up before handing a [`Socket`] to [`Socket::connect`] or a
/// [`crate::server::Server`]. Every callback is handed the driving `Loop` so it can call back
/// into the socket (write more data, close it, rearm its timeout) without the socket needing a
/// back-reference to the loop that owns it.
pub struct SocketCallbacks<D> {
    pub on_connect: Option<Box<dyn FnMut(&Socket<D>, &mut Loop)>>,
    pub on_read: Option<Box<dyn FnMut(&Socket<D>, &mut Loop, &[u8])>>,
    pub on_drain: Option<Box<dyn FnMut(&Socket<D>, &mut Loop)>>,
    pub on_error: Option<Box<dyn FnMut(&Socket<D>, &mut Loop, Error)>>,
    pub on_timeout: Option<Box<dyn FnMut(&Socket<D>, &mut Loop)>>,
    pub on_close: Option<Box<dyn FnOnce(Socket<D>, &mut Loop)>>,
}

impl<D> Default for SocketCallbacks<D> {
    fn default() -> SocketCallbacks<D> {
        SocketCallbacks {
            on_connect: None,
            on_read: None,
            on_drain: None,
            on_error: None,
            on_timeout: None,
            on_close: None,
        }
    }
}

struct SocketInner<D> {
    stream: Option<TcpStream>,
    token: Option<Token>,
    peer: Option<SocketAddr>,
    state: State,
    read_started: bool,
    closing: bool,
    secure: bool,
    wait_for_secure_hangup: bool,
    #[cfg(feature = "tls")]
    tls: Option<TlsDriver>,
    write_queue: WriteQueue,
    scratch: Vec<u8>,
    chunksize: usize,
    timeout: Duration,
    timer: Option<Timeout>,
    callbacks: SocketCallbacks<D>,
    data: D,
}

/// A cheap-to-clone handle to a TCP connection. All state lives behind the shared
/// `Rc<RefCell<SocketInner<D>>>`; cloning a `Socket` never duplicates the connection.
pub struct Socket<D: 'static> {
    inner: Rc<RefCell<SocketInner<D>>>,
}

impl<D> Clone for Socket<D> {
    fn clone(&self) -> Socket<D> {
        Socket { inner: Rc::clone(&self.inner) }
    }
}

struct SocketWatcher<D> {
    inner: Rc<RefCell<SocketInner<D>>>,
}

impl<D: 'static> IoHandler for SocketWatcher<D> {
    fn readable(self: Rc<Self>, lp: &mut Loop) {
        handle_readable(&self.inner, lp);
    }

    fn writable(self: Rc<Self>, lp: &mut Loop) {
        handle_writable(&self.inner, lp);
    }
}

impl<D: 'static> Socket<D> {
    /// Build an unattached socket. Nothing happens until [`connect`](Socket::connect) or a
    /// `Server` hands it an accepted stream.
    pub fn new(data: D, callbacks: SocketCallbacks<D>) -> Socket<D> {
        Socket::with_config(data, callbacks, SocketConfig::default())
    }

    pub fn with_config(data: D, callbacks: SocketCallbacks<D>, config: SocketConfig) -> Socket<D> {
        Socket {
            inner: Rc::new(RefCell::new(SocketInner {
                stream: None,
                token: None,
                peer: None,
                state: State::Init,
                read_started: false,
                closing: false,
                secure: false,
                wait_for_secure_hangup: false,
                #[cfg(feature = "tls")]
                tls: None,
                write_queue: WriteQueue::new(),
                scratch: vec![0u8; config.chunksize.max(1)],
                chunksize: config.chunksize.max(1),
                timeout: config.timeout,
                timer: None,
                callbacks,
                data,
            })),
        }
    }

    /// Install a caller-driven TLS session. Must be called before `connect`/`Server` attachment;
    /// once attached the socket goes straight to `Handshaking` instead of `Open`. `wait_for_peer`
    /// selects whether `close()` finalizes as soon as our own `close_notify` is flushed, or waits
    /// for the peer's `close_notify` (bounded by the socket's own inactivity timeout, or five
    /// seconds if none is configured).
    #[cfg(feature = "tls")]
    pub fn set_secure_session(&self, session: TlsSession, wait_for_peer: bool) {
        let mut s = self.inner.borrow_mut();
        s.secure = true;
        s.wait_for_secure_hangup = wait_for_peer;
        s.tls = Some(TlsDriver::new(session));
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer
    }

    /// The raw descriptor backing this socket, for `File::send`'s `sendfile(2)` fast path.
    /// Only meaningful while `state()` is `Open`; bytes written through it bypass the write
    /// queue entirely, so callers must pair it with [`Socket::note_external_write`] to keep
    /// the inactivity timer honest and must not interleave it with a non-empty write queue.
    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.inner.borrow().stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Whether the write queue is currently empty, i.e. it is safe to bypass it for a direct
    /// `sendfile(2)` write without reordering already-queued application data.
    pub(crate) fn write_queue_is_empty(&self) -> bool {
        self.inner.borrow().write_queue.is_empty()
    }

    /// Record that `n` bytes crossed the wire through a path that didn't go through
    /// [`Socket::write`] (namely `File::send`'s `sendfile` fast path), resetting the
    /// inactivity timer exactly as an ordinary write would.
    pub(crate) fn note_external_write(&self, lp: &mut Loop) {
        rearm_timer(&self.inner, lp);
    }

    pub fn data(&self) -> Ref<'_, D> {
        Ref::map(self.inner.borrow(), |i| &i.data)
    }

    pub fn data_mut(&self) -> RefMut<'_, D> {
        RefMut::map(self.inner.borrow_mut(), |i| &mut i.data)
    }

    pub fn chunksize(&self) -> usize {
        self.inner.borrow().chunksize
    }

    /// Resize the scratch buffer used for subsequent reads. Takes effect on the next read, not
    /// retroactively on a read already in flight.
    pub fn set_chunksize(&self, size: usize) {
        let mut s = self.inner.borrow_mut();
        s.chunksize = size.max(1);
        s.scratch = vec![0u8; s.chunksize];
    }

    /// Replace the whole callback set at once, e.g. right after `Server` hands a freshly
    /// accepted, not-yet-attached `Socket` to `on_connection`.
    pub fn set_callbacks(&self, callbacks: SocketCallbacks<D>) {
        self.inner.borrow_mut().callbacks = callbacks;
    }

    pub fn set_on_connect(&self, f: impl FnMut(&Socket<D>, &mut Loop) + 'static) {
        self.inner.borrow_mut().callbacks.on_connect = Some(Box::new(f));
    }

    pub fn set_on_read(&self, f: impl FnMut(&Socket<D>, &mut Loop, &[u8]) + 'static) {
        self.inner.borrow_mut().callbacks.on_read = Some(Box::new(f));
    }

    pub fn set_on_drain(&self, f: impl FnMut(&Socket<D>, &mut Loop) + 'static) {
        self.inner.borrow_mut().callbacks.on_drain = Some(Box::new(f));
    }

    pub fn set_on_error(&self, f: impl FnMut(&Socket<D>, &mut Loop, Error) + 'static) {
        self.inner.borrow_mut().callbacks.on_error = Some(Box::new(f));
    }

    pub fn set_on_timeout(&self, f: impl FnMut(&Socket<D>, &mut Loop) + 'static) {
        self.inner.borrow_mut().callbacks.on_timeout = Some(Box::new(f));
    }

    pub fn set_on_close(&self, f: impl FnOnce(Socket<D>, &mut Loop) + 'static) {
        self.inner.borrow_mut().callbacks.on_close = Some(Box::new(f));
    }

    /// Begin an outbound connection. The socket moves to `Connecting`; `on_connect` (or the TLS
    /// handshake, if a session was installed first) fires once the connect completes.
    pub fn connect(&self, lp: &mut Loop, addr: SocketAddr) -> Result<()> {
        {
            let s = self.inner.borrow();
            if s.state != State::Init {
                return Err(Error::Misuse("connect called on a socket that is not Init"));
            }
        }
        let mut stream = TcpStream::connect(addr)?;
        let watcher = Rc::new(SocketWatcher { inner: Rc::clone(&self.inner) }) as Rc<dyn IoHandler>;
        let token = lp.attach_io(&mut stream, Interest::READABLE | Interest::WRITABLE, watcher)?;

        let mut s = self.inner.borrow_mut();
        s.stream = Some(stream);
        s.token = Some(token);
        s.peer = Some(addr);
        s.state = State::Connecting;
        Ok(())
    }

    /// Adopt an already-connected stream (used by [`crate::server::Server`] for accepted
    /// connections). Not part of the public surface a caller would use directly on a fresh
    /// socket; servers call it once per accepted peer.
    pub(crate) fn install_accepted(
        &self,
        lp: &mut Loop,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let watcher = Rc::new(SocketWatcher { inner: Rc::clone(&self.inner) }) as Rc<dyn IoHandler>;
        let token = lp.attach_io(&mut stream, Interest::READABLE | Interest::WRITABLE, watcher)?;

        let secure = self.inner.borrow().secure;
        {
            let mut s = self.inner.borrow_mut();
            s.stream = Some(stream);
            s.token = Some(token);
            s.peer = Some(peer);
            s.state = if secure { State::Handshaking } else { State::Open };
        }

        rearm_timer(&self.inner, lp);
        if !secure {
            invoke_on_connect(&self.inner, lp);
        }
        Ok(())
    }

    /// Start delivering `on_read`. A socket that never calls this only ever sees `on_connect`,
    /// `on_drain`, `on_error`, `on_timeout` and `on_close` — useful for a pure sender.
    pub fn read_start(&self, lp: &mut Loop) {
        self.inner.borrow_mut().read_started = true;
        rearm_timer(&self.inner, lp);
    }

    pub fn read_stop(&self) {
        self.inner.borrow_mut().read_started = false;
    }

    /// Reset the inactivity timeout as if progress had just occurred. Typically called from
    /// inside `on_timeout` to grant a connection more time without tearing it down.
    pub fn reset_timeout(&self, lp: &mut Loop) {
        rearm_timer(&self.inner, lp);
    }

    /// Queue `buf` for writing. Buffers are sent in FIFO order; a buffer's release hook (if any)
    /// fires once its bytes have been handed off (to the kernel for plaintext sockets, or to the
    /// TLS session for secure ones) — not necessarily once physically acknowledged by the peer.
    pub fn write(&self, lp: &mut Loop, buf: Buffer) -> Result<()> {
        {
            let mut s = self.inner.borrow_mut();
            match s.state {
                State::Open => {}
                State::Handshaking | State::Connecting => {}
                _ => return Err(Error::Misuse("write called on a socket that is closing or closed")),
            }
            s.write_queue.push(buf);
        }
        rearm_timer(&self.inner, lp);
        process_write_queue(&self.inner, lp);
        Ok(())
    }

    /// Half-close the write side: queued data still drains, but no further `write` calls are
    /// accepted. Mirrors TCP shutdown(SHUT_WR) semantics once the queue empties.
    pub fn write_eof(&self, lp: &mut Loop) -> Result<()> {
        let mut s = self.inner.borrow_mut();
        if !matches!(s.state, State::Open) {
            return Err(Error::Misuse("write_eof called outside the Open state"));
        }
        s.state = State::HalfClosedWrite;
        drop(s);
        try_finalize_half_close(&self.inner, lp);
        Ok(())
    }

    /// Begin closing. Any already-queued writes (and, for TLS, the `close_notify` alert) still
    /// attempt to flush before the socket actually tears down; `on_close` always fires
    /// asynchronously, on a later loop tick, never from inside this call.
    pub fn close(&self, lp: &mut Loop) {
        {
            let mut s = self.inner.borrow_mut();
            if s.closing || s.state == State::Closed {
                return;
            }
            s.closing = true;
            s.state = State::Closing;
            #[cfg(feature = "tls")]
            if s.secure {
                if let Some(tls) = s.tls.as_mut() {
                    tls.send_close_notify();
                }
            }
        }
        process_write_queue(&self.inner, lp);
        arm_closing_deadline(&self.inner, lp);
        try_finalize_closing(&self.inner, lp);
    }
}

fn invoke_on_connect<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let cb = inner.borrow_mut().callbacks.on_connect.take();
    if let Some(mut cb) = cb {
        let handle = Socket { inner: Rc::clone(inner) };
        cb(&handle, lp);
        inner.borrow_mut().callbacks.on_connect = Some(cb);
    }
}

fn invoke_on_read<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop, chunk: &[u8]) {
    let cb = inner.borrow_mut().callbacks.on_read.take();
    if let Some(mut cb) = cb {
        let handle = Socket { inner: Rc::clone(inner) };
        cb(&handle, lp, chunk);
        inner.borrow_mut().callbacks.on_read = Some(cb);
    }
}

fn invoke_on_drain<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let cb = inner.borrow_mut().callbacks.on_drain.take();
    if let Some(mut cb) = cb {
        let handle = Socket { inner: Rc::clone(inner) };
        cb(&handle, lp);
        inner.borrow_mut().callbacks.on_drain = Some(cb);
    }
}

fn invoke_on_timeout<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let cb = inner.borrow_mut().callbacks.on_timeout.take();
    if let Some(mut cb) = cb {
        let handle = Socket { inner: Rc::clone(inner) };
        cb(&handle, lp);
        inner.borrow_mut().callbacks.on_timeout = Some(cb);
    }
}

fn invoke_on_error<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop, err: Error) {
    let cb = inner.borrow_mut().callbacks.on_error.take();
    match cb {
        Some(mut cb) => {
            let handle = Socket { inner: Rc::clone(inner) };
            cb(&handle, lp, err);
            inner.borrow_mut().callbacks.on_error = Some(cb);
        }
        None => log::warn!("socket error with no on_error handler installed: {err}"),
    }
}

fn report_fatal<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop, err: Error) {
    invoke_on_error(inner, lp, err);
    finalize_close(inner, lp);
}

fn rearm_timer<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let mut s = inner.borrow_mut();
    if let Some(t) = s.timer.take() {
        lp.cancel_timer(t);
    }
    let should_arm = !s.timeout.is_zero()
        && s.stream.is_some()
        && !matches!(s.state, State::Closed | State::Closing)
        && (s.read_started || !s.write_queue.is_empty() || s.state == State::Handshaking);
    if !should_arm {
        return;
    }
    let delay = s.timeout;
    drop(s);

    let weak: Weak<RefCell<SocketInner<D>>> = Rc::downgrade(inner);
    let timeout = lp.attach_timer(delay, move |lp| fire_timeout(&weak, lp));
    inner.borrow_mut().timer = Some(timeout);
}

fn fire_timeout<D: 'static>(weak: &Weak<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let Some(inner) = weak.upgrade() else { return };
    inner.borrow_mut().timer = None;
    invoke_on_timeout(&inner, lp);
}

/// One-shot deadline for the `Closing` state when waiting on a TLS peer hangup, so a silent
/// peer can't keep the socket (and its entry in the loop's dispatch table) alive forever.
fn arm_closing_deadline<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let s = inner.borrow();
    #[cfg(feature = "tls")]
    let waiting = s.secure && s.wait_for_secure_hangup;
    #[cfg(not(feature = "tls"))]
    let waiting = false;
    if !waiting {
        return;
    }
    let delay = if s.timeout.is_zero() { Duration::from_secs(5) } else { s.timeout };
    drop(s);

    let weak: Weak<RefCell<SocketInner<D>>> = Rc::downgrade(inner);
    let timeout = lp.attach_timer(delay, move |lp| {
        if let Some(inner) = weak.upgrade() {
            finalize_close(&inner, lp);
        }
    });
    inner.borrow_mut().timer = Some(timeout);
}

fn handle_readable<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let state = inner.borrow().state;
    match state {
        State::Handshaking => drive_handshake(inner, lp),
        State::Open | State::HalfClosedWrite | State::Closing => drive_read(inner, lp),
        _ => {}
    }
}

fn handle_writable<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let state = inner.borrow().state;
    match state {
        State::Connecting => complete_connect(inner, lp),
        State::Handshaking => drive_handshake(inner, lp),
        State::Open | State::HalfClosedWrite | State::Closing => {
            process_write_queue(inner, lp);
            try_finalize_closing(inner, lp);
        }
        _ => {}
    }
}

fn complete_connect<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let connect_err = {
        let s = inner.borrow();
        match s.stream.as_ref() {
            Some(stream) => stream.take_error().ok().flatten(),
            None => None,
        }
    };
    if let Some(e) = connect_err {
        report_fatal(inner, lp, Error::Io(e));
        return;
    }

    let secure = inner.borrow().secure;
    if secure {
        inner.borrow_mut().state = State::Handshaking;
        drive_handshake(inner, lp);
    } else {
        inner.borrow_mut().state = State::Open;
        rearm_timer(inner, lp);
        invoke_on_connect(inner, lp);
        process_write_queue(inner, lp);
    }
}

#[cfg(feature = "tls")]
fn drive_handshake<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let outcome = {
        let mut s = inner.borrow_mut();
        let SocketInner { stream, tls, .. } = &mut *s;
        let (Some(stream), Some(tls)) = (stream.as_mut(), tls.as_mut()) else { return };

        let _ = tls.pump_write(stream);
        match tls.pump_read(stream) {
            Ok(PumpRead::WouldBlock) => None,
            Ok(PumpRead::Eof) => Some(Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection during TLS handshake",
            )))),
            Ok(PumpRead::Progressed) => {
                let _ = tls.pump_write(stream);
                Some(Ok(tls.is_handshaking()))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => Some(Err(Error::Io(e))),
        }
    };

    match outcome {
        None => {}
        Some(Err(err)) => report_fatal(inner, lp, err),
        Some(Ok(still_handshaking)) => {
            rearm_timer(inner, lp);
            if !still_handshaking {
                inner.borrow_mut().state = State::Open;
                invoke_on_connect(inner, lp);
                process_write_queue(inner, lp);
                // A handshake's final flight can arrive bundled with the first application
                // data record; make sure it isn't left sitting in the session's plaintext
                // buffer until the next readiness event.
                drive_read(inner, lp);
            }
        }
    }
}

#[cfg(not(feature = "tls"))]
fn drive_handshake<D: 'static>(_inner: &Rc<RefCell<SocketInner<D>>>, _lp: &mut Loop) {
    unreachable!("Handshaking state is unreachable without the `tls` feature")
}

fn drive_read<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    #[cfg(feature = "tls")]
    let secure = inner.borrow().secure;
    #[cfg(not(feature = "tls"))]
    let secure = false;

    if secure {
        drive_read_secure(inner, lp);
    } else {
        drive_read_plain(inner, lp);
    }
}

fn drive_read_plain<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    loop {
        let step = {
            let mut s = inner.borrow_mut();
            let SocketInner { stream, scratch, .. } = &mut *s;
            let Some(stream) = stream.as_mut() else { return };
            match stream.read(scratch) {
                Ok(0) => ReadStep::Eof,
                Ok(n) => ReadStep::Data(scratch[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadStep::WouldBlock,
                Err(e) => ReadStep::Err(e),
            }
        };

        match step {
            ReadStep::WouldBlock => return,
            ReadStep::Err(e) => {
                report_fatal(inner, lp, Error::Io(e));
                return;
            }
            ReadStep::Eof => {
                on_peer_hangup(inner, lp);
                return;
            }
            ReadStep::Data(chunk) => {
                rearm_timer(inner, lp);
                let deliver = inner.borrow().read_started;
                if deliver {
                    invoke_on_read(inner, lp, &chunk);
                }
            }
        }
    }
}

#[cfg(feature = "tls")]
fn drive_read_secure<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    loop {
        let pump_outcome = {
            let mut s = inner.borrow_mut();
            let SocketInner { stream, tls, .. } = &mut *s;
            let (Some(stream), Some(tls)) = (stream.as_mut(), tls.as_mut()) else { return };
            match tls.pump_read(stream) {
                Ok(PumpRead::WouldBlock) => None,
                Ok(PumpRead::Eof) => Some(Err(None)),
                Ok(PumpRead::Progressed) => Some(Ok(())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                Err(e) => Some(Err(Some(e))),
            }
        };

        match pump_outcome {
            None => return,
            Some(Err(None)) => {
                on_peer_hangup(inner, lp);
                return;
            }
            Some(Err(Some(e))) => {
                report_fatal(inner, lp, Error::Io(e));
                return;
            }
            Some(Ok(())) => {}
        }

        rearm_timer(inner, lp);

        loop {
            let plaintext = {
                let mut s = inner.borrow_mut();
                let SocketInner { tls, scratch, .. } = &mut *s;
                let Some(tls) = tls.as_mut() else { return };
                match tls.read_plaintext(scratch) {
                    Ok(0) => None,
                    Ok(n) => Some(scratch[..n].to_vec()),
                    Err(e) => {
                        log::debug!("dropping TLS plaintext read error: {e}");
                        None
                    }
                }
            };
            let Some(chunk) = plaintext else { break };
            let deliver = inner.borrow().read_started;
            if deliver {
                invoke_on_read(inner, lp, &chunk);
            }
        }

        if inner.borrow().state == State::Closing {
            try_finalize_closing(inner, lp);
        }
    }
}

fn on_peer_hangup<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let deliver = inner.borrow().read_started;
    if deliver {
        invoke_on_read(inner, lp, &[]);
    }
    let state = inner.borrow().state;
    match state {
        State::Closing => try_finalize_closing(inner, lp),
        // We already sent our own FIN via write_eof; the peer's FIN completes the
        // full-duplex shutdown, per SPEC_FULL §4.4's HalfClosedWrite -> Closed transition.
        State::HalfClosedWrite => finalize_close(inner, lp),
        _ => {}
    }
}

enum ReadStep {
    WouldBlock,
    Eof,
    Data(Vec<u8>),
    Err(io::Error),
}

fn process_write_queue<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    #[cfg(feature = "tls")]
    let secure = inner.borrow().secure;
    #[cfg(not(feature = "tls"))]
    let secure = false;

    let was_nonempty = !inner.borrow().write_queue.is_empty();

    if secure {
        process_write_queue_secure(inner, lp);
    } else {
        process_write_queue_plain(inner, lp);
    }

    // A fatal write error finalizes the socket via `report_fatal` -> `finalize_close`, which
    // also clears the write queue; that clear is not a drain and must not raise `on_drain` on
    // an already-`Closed` socket.
    let finalized = inner.borrow().state == State::Closed;
    if was_nonempty && !finalized && inner.borrow().write_queue.is_empty() {
        invoke_on_drain(inner, lp);
    }
}

fn process_write_queue_plain<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    loop {
        let step = {
            let mut s = inner.borrow_mut();
            let SocketInner { stream, write_queue, .. } = &mut *s;
            let Some(stream) = stream.as_mut() else { return };
            let Some(chunk) = write_queue.head_remaining() else { return };
            if chunk.is_empty() {
                write_queue.advance(0);
                continue;
            }
            match stream.write(chunk) {
                Ok(n) => WriteStep::Wrote(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteStep::WouldBlock,
                Err(e) => WriteStep::Err(e),
            }
        };
        match step {
            WriteStep::WouldBlock => return,
            WriteStep::Err(e) => {
                report_fatal(inner, lp, Error::Io(e));
                return;
            }
            WriteStep::Wrote(n) => {
                inner.borrow_mut().write_queue.advance(n);
                rearm_timer(inner, lp);
            }
        }
    }
}

#[cfg(feature = "tls")]
fn process_write_queue_secure<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    loop {
        let step = {
            let mut s = inner.borrow_mut();
            let SocketInner { tls, write_queue, .. } = &mut *s;
            let Some(tls) = tls.as_mut() else { return };
            let Some(chunk) = write_queue.head_remaining() else { break };
            if chunk.is_empty() {
                write_queue.advance(0);
                continue;
            }
            match tls.write_plaintext(chunk) {
                Ok(n) => WriteStep::Wrote(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteStep::WouldBlock,
                Err(e) => WriteStep::Err(e),
            }
        };
        match step {
            WriteStep::WouldBlock => break,
            WriteStep::Err(e) => {
                report_fatal(inner, lp, Error::Io(e));
                return;
            }
            WriteStep::Wrote(n) => {
                inner.borrow_mut().write_queue.advance(n);
                rearm_timer(inner, lp);
            }
        }
    }

    let flush_err = {
        let mut s = inner.borrow_mut();
        let SocketInner { stream, tls, .. } = &mut *s;
        match (stream.as_mut(), tls.as_mut()) {
            (Some(stream), Some(tls)) => tls.pump_write(stream).err(),
            _ => None,
        }
    };
    if let Some(e) = flush_err {
        report_fatal(inner, lp, Error::Io(e));
    }
}

enum WriteStep {
    WouldBlock,
    Wrote(usize),
    Err(io::Error),
}

fn try_finalize_half_close<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    process_write_queue(inner, lp);
    let empty = inner.borrow().write_queue.is_empty();
    if !empty {
        return;
    }

    #[cfg(feature = "tls")]
    let secure = inner.borrow().secure;
    #[cfg(not(feature = "tls"))]
    let secure = false;

    if secure {
        #[cfg(feature = "tls")]
        send_half_close_notify(inner, lp);
    } else if let Some(stream) = inner.borrow().stream.as_ref() {
        let _ = stream.shutdown(std::net::Shutdown::Write);
    }
}

/// TLS's equivalent of `shutdown(SHUT_WR)`: flush a `close_notify` alert on the write side
/// without tearing down the read side, per SPEC_FULL §4.4 ("send FIN (plain) or initiate TLS
/// bidirectional shutdown (secure)"). Unlike `Socket::close`'s full bye exchange, this never
/// transitions the socket away from `HalfClosedWrite`; reads keep flowing until the peer's own
/// FIN arrives.
#[cfg(feature = "tls")]
fn send_half_close_notify<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let flush_err = {
        let mut s = inner.borrow_mut();
        let SocketInner { stream, tls, .. } = &mut *s;
        match (stream.as_mut(), tls.as_mut()) {
            (Some(stream), Some(tls)) => {
                tls.send_close_notify();
                tls.pump_write(stream).err()
            }
            _ => None,
        }
    };
    if let Some(e) = flush_err {
        report_fatal(inner, lp, Error::Io(e));
    }
}

fn try_finalize_closing<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let ready = {
        let s = inner.borrow();
        if s.state != State::Closing || !s.write_queue.is_empty() {
            false
        } else {
            #[cfg(feature = "tls")]
            {
                match &s.tls {
                    Some(tls) => {
                        !tls.wants_write() && (!s.wait_for_secure_hangup || !tls.is_handshaking())
                    }
                    None => true,
                }
            }
            #[cfg(not(feature = "tls"))]
            {
                true
            }
        }
    };
    if ready {
        finalize_close(inner, lp);
    }
}

fn finalize_close<D: 'static>(inner: &Rc<RefCell<SocketInner<D>>>, lp: &mut Loop) {
    let (token, stream) = {
        let mut s = inner.borrow_mut();
        if s.state == State::Closed {
            return (None, None);
        }
        s.state = State::Closed;
        if let Some(t) = s.timer.take() {
            lp.cancel_timer(t);
        }
        s.write_queue.clear();
        (s.token.take(), s.stream.take())
    };

    if let (Some(token), Some(mut stream)) = (token, stream) {
        let _ = lp.detach_io(&mut stream, token);
    }

    let inner2 = Rc::clone(inner);
    lp.defer(move |lp| {
        let cb = inner2.borrow_mut().callbacks.on_close.take();
        if let Some(cb) = cb {
            let handle = Socket { inner: inner2 };
            cb(handle, lp);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    fn loopback_listener() -> (StdTcpListener, SocketAddr) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn connect_then_echo_roundtrip() {
        let mut lp = Loop::new().unwrap();
        let (listener, addr) = loopback_listener();

        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = Rc::clone(&received);
        let mut callbacks = SocketCallbacks::default();
        callbacks.on_connect = Some(Box::new(|sock: &Socket<()>, lp: &mut Loop| {
            sock.read_start(lp);
            sock.write(lp, Buffer::new(b"ping".to_vec())).unwrap();
        }));
        callbacks.on_read = Some(Box::new(move |_sock, _lp, chunk: &[u8]| {
            received2.borrow_mut().extend_from_slice(chunk);
        }));

        let sock = Socket::new((), callbacks);
        sock.connect(&mut lp, addr).unwrap();

        // Drive one tick so the client's SYN lands, then accept + echo from the plain
        // std listener (this test only exercises the Socket side, not Server).
        lp.run_until(|| sock.state() == State::Open, 200).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..200 {
            match peer.read(&mut buf) {
                Ok(n) if n > 0 => {
                    got = n;
                    break;
                }
                _ => {
                    lp.run_until(|| false, 1).unwrap();
                }
            }
        }
        assert!(got > 0);
        peer.write_all(&buf[..got]).unwrap();

        lp.run_until(|| !received.borrow().is_empty(), 200).unwrap();
        assert_eq!(&*received.borrow(), b"ping");
    }

    #[test]
    fn write_after_close_is_rejected() {
        let mut lp = Loop::new().unwrap();
        let (_listener, addr) = loopback_listener();
        let sock: Socket<()> = Socket::new((), SocketCallbacks::default());
        sock.connect(&mut lp, addr).unwrap();
        sock.close(&mut lp);
        let err = sock.write(&mut lp, Buffer::new(b"x".to_vec()));
        assert!(matches!(err, Err(Error::Misuse(_))));
    }
}
