//! Caller-owned write buffers with a release hook expressed as `Drop`.
//!
//! The source describes a `(pointer, length)` record the caller owns until the library invokes
//! a release hook "exactly once, regardless of outcome." In an owned-by-default language that
//! guarantee is just ordinary ownership: a [`Buffer`] moves into the socket's write queue and
//! the library never has to remember to call anything — letting the value drop *is* releasing
//! it. An optional closure lets callers observe the release (the scenario tests in SPEC_FULL
//! §8 count releases), matching `write_simple`'s "library allocates buf+dup; release hook frees
//! both" by simply holding an owned `Vec<u8>` with no closure at all.

use std::fmt;

/// An owned byte buffer queued for a non-blocking write.
///
/// Dropping a `Buffer` runs its release closure, if any, exactly once. The crate never copies
/// the payload; it only ever reads a suffix of it (tracked by the owning write queue's cursor).
pub struct Buffer {
    data: Vec<u8>,
    on_release: Option<Box<dyn FnOnce(&[u8]) + Send>>,
}

impl Buffer {
    /// Take ownership of `data` with no release notification.
    pub fn new(data: impl Into<Vec<u8>>) -> Buffer {
        Buffer {
            data: data.into(),
            on_release: None,
        }
    }

    /// Take ownership of `data`, invoking `on_release` with the full original payload when the
    /// library is done with this buffer (successful send, failed send, or destruction with the
    /// buffer still queued — the release semantics never imply successful delivery).
    pub fn with_release(
        data: impl Into<Vec<u8>>,
        on_release: impl FnOnce(&[u8]) + Send + 'static,
    ) -> Buffer {
        Buffer {
            data: data.into(),
            on_release: Some(Box::new(on_release)),
        }
    }

    /// The full payload, ignoring any write cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.data.len()).finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(&self.data);
        }
    }
}

/// A FIFO queue of [`Buffer`]s with a cursor into the head element.
///
/// Shared by `Socket` and `File`: both enqueue whole buffers and drain them byte-range by
/// byte-range as the underlying descriptor accepts writes.
#[derive(Default)]
pub struct WriteQueue {
    queue: std::collections::VecDeque<Buffer>,
    cursor: usize,
}

impl WriteQueue {
    pub fn new() -> WriteQueue {
        WriteQueue::default()
    }

    pub fn push(&mut self, buf: Buffer) {
        self.queue.push_back(buf);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// The unwritten suffix of the head buffer, or `None` if the queue is empty.
    pub fn head_remaining(&self) -> Option<&[u8]> {
        self.queue.front().map(|b| &b.as_slice()[self.cursor..])
    }

    /// Record that `n` more bytes of the head buffer were written. Pops and drops the head
    /// (running its release hook) once its whole payload has been consumed.
    pub fn advance(&mut self, n: usize) {
        self.cursor += n;
        if let Some(head) = self.queue.front() {
            if self.cursor >= head.len() {
                self.cursor = 0;
                self.queue.pop_front();
            }
        }
    }

    /// Drop every queued buffer (e.g. on socket destruction), running their release hooks.
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.queue.clear();
    }
}
