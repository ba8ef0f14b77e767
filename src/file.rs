//! The `File` component: pseudo-asynchronous file I/O built on top of [`crate::pool::Pool`].
//!
//! `mio` itself has nothing to say about regular files — `read(2)`/`write(2)` on a file
//! descriptor backed by a normal filesystem never returns `EWOULDBLOCK`, so there is no
//! readiness event to wait for. The source worked around this by routing every blocking file
//! operation through a fixed worker pool and posting the result back to the loop thread; that
//! shape is exactly what [`crate::pool::Pool`] already provides for this crate; `File` is a thin
//! state machine (one in-flight task per category, as SPEC_FULL §4.5 requires) wrapped around
//! `submit` calls.
//!
//! Reads and writes use `pread(2)`/`pwrite(2)` semantics (`std::os::unix::fs::FileExt`) with an
//! explicit cursor kept in `FileInner` rather than the descriptor's own file position, so the
//! `read`, `write`, and `send` categories never race each other over a shared OS-level offset
//! even though each runs as its own independently-submitted task.

use std::cell::{Ref, RefCell, RefMut};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use crate::buffer::{Buffer, WriteQueue};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::reactor::Loop;
use crate::socket::Socket;

/// Flags for [`File::open_path`], the target-language analogue of the source's raw `open(2)`
/// flag bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn read_only() -> OpenFlags {
        OpenFlags { read: true, ..OpenFlags::default() }
    }

    pub fn write_create_truncate() -> OpenFlags {
        OpenFlags { write: true, create: true, truncate: true, ..OpenFlags::default() }
    }

    fn to_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.read)
            .write(self.write)
            .create(self.create)
            .truncate(self.truncate)
            .append(self.append);
        opts
    }
}

/// Tuning knobs for a single [`File`].
#[derive(Debug, Clone, Copy)]
pub struct FileConfig {
    /// Chunk size used by [`File::send`]'s portable (non-`sendfile`) fallback path.
    pub send_chunk: usize,
}

impl Default for FileConfig {
    fn default() -> FileConfig {
        FileConfig { send_chunk: 64 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Init,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Callbacks a caller wires up before [`File::open_path`]/`open_stdin` etc.
pub struct FileCallbacks<D> {
    pub on_open: Option<Box<dyn FnMut(&File<D>, &mut Loop, Result<()>)>>,
    pub on_read: Option<Box<dyn FnMut(&File<D>, &mut Loop, usize)>>,
    pub on_drain: Option<Box<dyn FnMut(&File<D>, &mut Loop)>>,
    pub on_error: Option<Box<dyn FnMut(&File<D>, &mut Loop, Error)>>,
    pub on_close: Option<Box<dyn FnOnce(File<D>, &mut Loop)>>,
}

impl<D> Default for FileCallbacks<D> {
    fn default() -> FileCallbacks<D> {
        FileCallbacks { on_open: None, on_read: None, on_drain: None, on_error: None, on_close: None }
    }
}

struct FileInner<D> {
    state: FileState,
    handle: Option<Arc<std::fs::File>>,
    pool: Option<Rc<Pool>>,
    send_chunk: usize,

    read_started: bool,
    read_in_flight: bool,
    read_offset: u64,
    read_buf: Vec<u8>,

    write_queue: WriteQueue,
    write_offset: u64,
    write_in_flight: bool,

    send_in_flight: bool,

    callbacks: FileCallbacks<D>,
    data: D,
}

/// A cheap-to-clone handle to an asynchronous file. All state lives behind a shared
/// `Rc<RefCell<FileInner<D>>>`; cloning a `File` never duplicates the underlying descriptor.
pub struct File<D: 'static> {
    inner: Rc<RefCell<FileInner<D>>>,
}

impl<D> Clone for File<D> {
    fn clone(&self) -> File<D> {
        File { inner: Rc::clone(&self.inner) }
    }
}

impl<D: 'static> File<D> {
    pub fn new(data: D, callbacks: FileCallbacks<D>) -> File<D> {
        File::with_config(data, callbacks, FileConfig::default())
    }

    pub fn with_config(data: D, callbacks: FileCallbacks<D>, config: FileConfig) -> File<D> {
        File {
            inner: Rc::new(RefCell::new(FileInner {
                state: FileState::Init,
                handle: None,
                pool: None,
                send_chunk: config.send_chunk.max(1),
                read_started: false,
                read_in_flight: false,
                read_offset: 0,
                read_buf: Vec::new(),
                write_queue: WriteQueue::new(),
                write_offset: 0,
                write_in_flight: false,
                send_in_flight: false,
                callbacks,
                data,
            })),
        }
    }

    pub fn data(&self) -> Ref<'_, D> {
        Ref::map(self.inner.borrow(), |i| &i.data)
    }

    pub fn data_mut(&self) -> RefMut<'_, D> {
        RefMut::map(self.inner.borrow_mut(), |i| &mut i.data)
    }

    /// Bind this `File` to the thread pool it will submit blocking tasks to. Per SPEC_FULL
    /// §4.2, the pool is started lazily — callers typically construct one `Pool` per `Loop`
    /// and share it across every `File` attached to that loop, but nothing here requires that.
    pub fn attach(&self, pool: Rc<Pool>) {
        self.inner.borrow_mut().pool = Some(pool);
    }

    /// The bytes most recently delivered by `on_read`, i.e. `read_buf[..count]` from the last
    /// completed read task. Valid to inspect only from inside (or synchronously after) the
    /// `on_read` callback, mirroring the source's "buffer valid only within the call" contract.
    pub fn read_buf(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.borrow(), |i| i.read_buf.as_slice())
    }

    fn require_pool(inner: &Rc<RefCell<FileInner<D>>>) -> Result<Rc<Pool>> {
        inner.borrow().pool.clone().ok_or(Error::Misuse("File has no pool attached"))
    }

    /// Open a regular file at `path`. `on_open` fires (deferred to the loop, never
    /// synchronously) once the blocking `open(2)` completes on a worker thread.
    pub fn open_path(&self, lp: &mut Loop, path: PathBuf, flags: OpenFlags) -> Result<()> {
        {
            let mut s = self.inner.borrow_mut();
            if s.state != FileState::Init {
                return Err(Error::Misuse("open called on a file that is not Init"));
            }
            s.state = FileState::Opening;
        }
        let pool = Self::require_pool(&self.inner)?;

        let inner2 = Rc::clone(&self.inner);
        let opts = flags.to_options();
        pool.submit(
            move || opts.open(&path).map(Arc::new).map_err(Error::Io),
            move |result: std::result::Result<Arc<std::fs::File>, Error>, lp: &mut Loop| {
                complete_open(&inner2, lp, result);
            },
        )
    }

    /// Adopt an already-open standard stream. Never blocks, but still defers `on_open` to the
    /// next loop tick for the same reason every other completion is deferred: so callers can
    /// treat every `File` uniformly regardless of how it was opened.
    #[cfg(unix)]
    fn adopt_std_fd(&self, lp: &mut Loop, fd: std::os::unix::io::RawFd) -> Result<()> {
        use std::os::unix::io::FromRawFd;
        {
            let mut s = self.inner.borrow_mut();
            if s.state != FileState::Init {
                return Err(Error::Misuse("open called on a file that is not Init"));
            }
            s.state = FileState::Opening;
        }
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            let err = Error::Io(io::Error::last_os_error());
            self.inner.borrow_mut().state = FileState::Init;
            return Err(err);
        }
        let handle = Arc::new(unsafe { std::fs::File::from_raw_fd(dup) });
        let inner2 = Rc::clone(&self.inner);
        lp.defer(move |lp| complete_open(&inner2, lp, Ok(handle)));
        Ok(())
    }

    #[cfg(unix)]
    pub fn open_stdin(&self, lp: &mut Loop) -> Result<()> {
        self.adopt_std_fd(lp, libc::STDIN_FILENO)
    }

    #[cfg(unix)]
    pub fn open_stdout(&self, lp: &mut Loop) -> Result<()> {
        self.adopt_std_fd(lp, libc::STDOUT_FILENO)
    }

    #[cfg(unix)]
    pub fn open_stderr(&self, lp: &mut Loop) -> Result<()> {
        self.adopt_std_fd(lp, libc::STDERR_FILENO)
    }

    /// Begin delivering `on_read(file, count)`, reading sequentially from wherever the file's
    /// internal read cursor currently stands (0 on a freshly opened file). Each completed read
    /// submits the next one, until a zero-byte read (EOF) delivers a final `on_read(file, 0)`
    /// and stops on its own — callers don't need to pair this with `read_stop` at EOF, only to
    /// stop early.
    pub fn read_start(&self, lp: &mut Loop, size: usize) -> Result<()> {
        {
            let mut s = self.inner.borrow_mut();
            if s.state != FileState::Open {
                return Err(Error::Misuse("read_start called on a file that is not Open"));
            }
            s.read_started = true;
            if s.read_buf.len() != size {
                s.read_buf = vec![0u8; size.max(1)];
            }
        }
        submit_next_read(&self.inner, lp)
    }

    pub fn read_stop(&self) {
        self.inner.borrow_mut().read_started = false;
    }

    /// Queue `buf` for writing at the file's current write cursor (advanced by this file's own
    /// prior writes, independent of the read cursor). Release runs once the write task
    /// completes, succeeds or fails.
    pub fn write(&self, lp: &mut Loop, buf: Buffer) -> Result<()> {
        {
            let mut s = self.inner.borrow_mut();
            if s.state != FileState::Open {
                return Err(Error::Misuse("write called on a file that is not Open"));
            }
            s.write_queue.push(buf);
        }
        pump_write_queue(&self.inner, lp)
    }

    pub fn write_simple(&self, lp: &mut Loop, bytes: &[u8]) -> Result<()> {
        self.write(lp, Buffer::new(bytes.to_vec()))
    }

    /// Copy `length` bytes starting at `offset` in this file to `dest`, a connected `Socket`.
    /// Tries a zero-copy `sendfile(2)` burst first (Linux only, and only while `dest`'s write
    /// queue is empty, so bytes can't be reordered against anything already queued); whatever
    /// remains after that burst (or all of it, on other platforms, or once the destination
    /// socket would block) is copied through the thread pool in `send_chunk`-sized pieces and
    /// handed to `dest.write`, so the destination's own write queue still provides backpressure.
    pub fn send<SD: 'static>(
        &self,
        lp: &mut Loop,
        dest: &Socket<SD>,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        {
            let mut s = self.inner.borrow_mut();
            if s.state != FileState::Open {
                return Err(Error::Misuse("send called on a file that is not Open"));
            }
            if s.send_in_flight {
                return Err(Error::Misuse("a send is already in flight on this file"));
            }
            s.send_in_flight = true;
        }

        #[cfg(target_os = "linux")]
        let (offset, length) = {
            match try_sendfile_burst(&self.inner, lp, dest, offset, length) {
                Ok(remaining_offset_len) => remaining_offset_len,
                Err(err) => {
                    self.inner.borrow_mut().send_in_flight = false;
                    invoke_on_error(&self.inner, lp, err);
                    return Ok(());
                }
            }
        };

        if length == 0 {
            self.inner.borrow_mut().send_in_flight = false;
            invoke_on_drain(&self.inner, lp);
            return Ok(());
        }

        pump_send_chunk(&self.inner, lp, dest.clone(), offset, length)
    }

    /// Begin closing. Queued writes and any file handle the worker threads are still holding
    /// are released on a worker thread (closing a file descriptor can itself block on some
    /// filesystems); `on_close` always fires as a deferred callback, never synchronously.
    pub fn close(&self, lp: &mut Loop) {
        let (already_closing, pool) = {
            let mut s = self.inner.borrow_mut();
            if s.state == FileState::Closed || s.state == FileState::Closing {
                (true, None)
            } else {
                s.state = FileState::Closing;
                s.write_queue.clear();
                (false, s.pool.clone())
            }
        };
        if already_closing {
            return;
        }

        let handle = self.inner.borrow_mut().handle.take();
        let inner2 = Rc::clone(&self.inner);

        match pool {
            Some(pool) if handle.is_some() => {
                let submitted = pool.submit(
                    move || drop(handle),
                    move |(), lp: &mut Loop| finalize_close(&inner2, lp),
                );
                if submitted.is_err() {
                    finalize_close(&self.inner, lp);
                }
            }
            _ => finalize_close(&self.inner, lp),
        }
    }
}

fn complete_open<D: 'static>(
    inner: &Rc<RefCell<FileInner<D>>>,
    lp: &mut Loop,
    result: std::result::Result<Arc<std::fs::File>, Error>,
) {
    match result {
        Ok(handle) => {
            let mut s = inner.borrow_mut();
            s.handle = Some(handle);
            s.state = FileState::Open;
            drop(s);
            invoke_on_open(inner, lp, Ok(()));
        }
        Err(err) => {
            inner.borrow_mut().state = FileState::Closed;
            invoke_on_open(inner, lp, Err(()));
            invoke_on_error(inner, lp, err);
        }
    }
}

fn submit_next_read<D: 'static>(inner: &Rc<RefCell<FileInner<D>>>, lp: &mut Loop) -> Result<()> {
    let (should_submit, handle, pool, offset, size) = {
        let s = inner.borrow();
        let should = s.state == FileState::Open && s.read_started && !s.read_in_flight;
        (should, s.handle.clone(), s.pool.clone(), s.read_offset, s.read_buf.len())
    };
    if !should_submit {
        return Ok(());
    }
    let (Some(handle), Some(pool)) = (handle, pool) else {
        return Err(Error::Misuse("read_start called before the file finished opening"));
    };

    inner.borrow_mut().read_in_flight = true;
    let inner2 = Rc::clone(inner);
    pool.submit(
        move || {
            let mut buf = vec![0u8; size];
            let result = handle.read_at(&mut buf, offset).map_err(Error::Io);
            result.map(|n| (buf, n))
        },
        move |result: std::result::Result<(Vec<u8>, usize), Error>, lp: &mut Loop| {
            complete_read(&inner2, lp, result);
        },
    )
}

fn complete_read<D: 'static>(
    inner: &Rc<RefCell<FileInner<D>>>,
    lp: &mut Loop,
    result: std::result::Result<(Vec<u8>, usize), Error>,
) {
    inner.borrow_mut().read_in_flight = false;
    match result {
        Ok((buf, n)) => {
            {
                let mut s = inner.borrow_mut();
                s.read_buf = buf;
                s.read_offset += n as u64;
                if n == 0 {
                    s.read_started = false;
                }
            }
            invoke_on_read(inner, lp, n);
            if n > 0 {
                let _ = submit_next_read(inner, lp);
            }
        }
        Err(err) => {
            inner.borrow_mut().read_started = false;
            invoke_on_error(inner, lp, err);
        }
    }
}

fn pump_write_queue<D: 'static>(inner: &Rc<RefCell<FileInner<D>>>, lp: &mut Loop) -> Result<()> {
    let (should_submit, handle, pool, offset, chunk) = {
        let s = inner.borrow();
        if s.state != FileState::Open || s.write_in_flight {
            return Ok(());
        }
        let chunk = s.write_queue.head_remaining().map(|c| c.to_vec());
        (chunk.is_some(), s.handle.clone(), s.pool.clone(), s.write_offset, chunk)
    };
    if !should_submit {
        return Ok(());
    }
    let (Some(handle), Some(pool), Some(chunk)) = (handle, pool, chunk) else {
        return Err(Error::Misuse("write called before the file finished opening"));
    };
    if chunk.is_empty() {
        inner.borrow_mut().write_queue.advance(0);
        return pump_write_queue(inner, lp);
    }

    inner.borrow_mut().write_in_flight = true;
    let inner2 = Rc::clone(inner);
    let len = chunk.len();
    pool.submit(
        move || handle.write_all_at(&chunk, offset).map(|_| len).map_err(Error::Io),
        move |result: std::result::Result<usize, Error>, lp: &mut Loop| {
            complete_write(&inner2, lp, result);
        },
    )
}

fn complete_write<D: 'static>(
    inner: &Rc<RefCell<FileInner<D>>>,
    lp: &mut Loop,
    result: std::result::Result<usize, Error>,
) {
    inner.borrow_mut().write_in_flight = false;
    match result {
        Ok(n) => {
            let emptied = {
                let mut s = inner.borrow_mut();
                s.write_offset += n as u64;
                s.write_queue.advance(n);
                s.write_queue.is_empty()
            };
            if emptied {
                invoke_on_drain(inner, lp);
            } else {
                let _ = pump_write_queue(inner, lp);
            }
        }
        Err(err) => invoke_on_error(inner, lp, err),
    }
}

#[cfg(target_os = "linux")]
fn try_sendfile_burst<D: 'static, SD: 'static>(
    inner: &Rc<RefCell<FileInner<D>>>,
    lp: &mut Loop,
    dest: &Socket<SD>,
    offset: u64,
    length: u64,
) -> Result<(u64, u64)> {
    use std::os::unix::io::AsRawFd;

    let Some(dest_fd) = dest.raw_fd() else { return Ok((offset, length)) };
    if !dest.write_queue_is_empty() {
        return Ok((offset, length));
    }
    let src_fd = {
        let s = inner.borrow();
        match s.handle.as_ref() {
            Some(h) => h.as_raw_fd(),
            None => return Ok((offset, length)),
        }
    };

    let mut off = offset as libc::off_t;
    let mut remaining = length;
    while remaining > 0 {
        let want = remaining.min(4 * 1024 * 1024) as usize;
        let n = unsafe { libc::sendfile(dest_fd, src_fd, &mut off, want) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                break;
            }
            return Err(Error::Io(err));
        }
        if n == 0 {
            break;
        }
        remaining -= n as u64;
        dest.note_external_write(lp);
    }
    Ok((off as u64, remaining))
}

fn pump_send_chunk<D: 'static, SD: 'static>(
    inner: &Rc<RefCell<FileInner<D>>>,
    lp: &mut Loop,
    dest: Socket<SD>,
    offset: u64,
    remaining: u64,
) -> Result<()> {
    if remaining == 0 {
        inner.borrow_mut().send_in_flight = false;
        invoke_on_drain(inner, lp);
        return Ok(());
    }

    let (handle, pool, chunk_size) = {
        let s = inner.borrow();
        (s.handle.clone(), s.pool.clone(), s.send_chunk as u64)
    };
    let (Some(handle), Some(pool)) = (handle, pool) else {
        inner.borrow_mut().send_in_flight = false;
        return Err(Error::Misuse("send called before the file finished opening"));
    };

    let want = remaining.min(chunk_size) as usize;
    let inner2 = Rc::clone(inner);
    let dest2 = dest.clone();
    pool.submit(
        move || {
            let mut buf = vec![0u8; want];
            handle.read_at(&mut buf, offset).map(|n| {
                buf.truncate(n);
                buf
            })
        },
        move |result: io::Result<Vec<u8>>, lp: &mut Loop| match result {
            Ok(buf) if buf.is_empty() => {
                inner2.borrow_mut().send_in_flight = false;
                invoke_on_drain(&inner2, lp);
            }
            Ok(buf) => {
                let n = buf.len() as u64;
                let inner3 = Rc::clone(&inner2);
                let dest3 = dest2.clone();
                let release_offset = offset + n;
                let release_remaining = remaining - n;
                let released = Buffer::with_release(buf, move |_| {
                    // Fires once `dest` has fully handed these bytes to the kernel (or
                    // dropped them on close/failure); either way this send chunk is done.
                });
                if dest2.write(lp, released).is_err() {
                    inner2.borrow_mut().send_in_flight = false;
                    invoke_on_error(&inner2, lp, Error::Misuse("destination socket rejected write during send"));
                    return;
                }
                let _ = pump_send_chunk(&inner3, lp, dest3, release_offset, release_remaining);
            }
            Err(e) => {
                inner2.borrow_mut().send_in_flight = false;
                invoke_on_error(&inner2, lp, Error::Io(e));
            }
        },
    )
}

fn finalize_close<D: 'static>(inner: &Rc<RefCell<FileInner<D>>>, lp: &mut Loop) {
    inner.borrow_mut().state = FileState::Closed;
    let inner2 = Rc::clone(inner);
    lp.defer(move |lp| {
        let cb = inner2.borrow_mut().callbacks.on_close.take();
        if let Some(cb) = cb {
            let handle = File { inner: inner2 };
            cb(handle, lp);
        }
    });
}

fn invoke_on_open<D: 'static>(
    inner: &Rc<RefCell<FileInner<D>>>,
    lp: &mut Loop,
    result: std::result::Result<(), ()>,
) {
    let cb = inner.borrow_mut().callbacks.on_open.take();
    if let Some(mut cb) = cb {
        let handle = File { inner: Rc::clone(inner) };
        cb(&handle, lp, result.map_err(|()| Error::Misuse("open failed")));
        inner.borrow_mut().callbacks.on_open = Some(cb);
    }
}

fn invoke_on_read<D: 'static>(inner: &Rc<RefCell<FileInner<D>>>, lp: &mut Loop, count: usize) {
    let cb = inner.borrow_mut().callbacks.on_read.take();
    if let Some(mut cb) = cb {
        let handle = File { inner: Rc::clone(inner) };
        cb(&handle, lp, count);
        inner.borrow_mut().callbacks.on_read = Some(cb);
    }
}

fn invoke_on_drain<D: 'static>(inner: &Rc<RefCell<FileInner<D>>>, lp: &mut Loop) {
    let cb = inner.borrow_mut().callbacks.on_drain.take();
    if let Some(mut cb) = cb {
        let handle = File { inner: Rc::clone(inner) };
        cb(&handle, lp);
        inner.borrow_mut().callbacks.on_drain = Some(cb);
    }
}

fn invoke_on_error<D: 'static>(inner: &Rc<RefCell<FileInner<D>>>, lp: &mut Loop, err: Error) {
    let cb = inner.borrow_mut().callbacks.on_error.take();
    match cb {
        Some(mut cb) => {
            let handle = File { inner: Rc::clone(inner) };
            cb(&handle, lp, err);
            inner.borrow_mut().callbacks.on_error = Some(cb);
        }
        None => log::warn!("file error with no on_error handler installed: {err}"),
    }
}
