//! Thread-safe per-channel byte buffers.
//!
//! The gateway owns four [`ChannelBuffer`]s (text/binary × inbound/outbound).
//! The service thread appends inbound bytes and drains outbound bytes; the
//! foreground loop appends outbound bytes and drains inbound bytes.  Every
//! mutation happens under the buffer's own mutex and readers always receive a
//! snapshot-and-clear, never a partial view.
//!
//! # Overflow policy
//!
//! Each buffer holds at most `limit` bytes (by default
//! [`MAX_FRAME_BYTES`]).  When an append would push the buffer past that
//! limit the *entire* pending content is discarded and
//! [`WebIoError::BufferOverflow`] is returned: a dropped frame is preferable
//! to a truncated one.

use std::borrow::Cow;
use std::mem;
use std::ops::Deref;

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, warn};
use webio_types::{ChannelKind, MAX_FRAME_BYTES, WebIoError};

use crate::dispatcher::CommandPayload;

/// Which way the bytes in a buffer travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the client, waiting for the foreground loop.
    Inbound,
    /// Queued by the foreground loop, waiting for the transport.
    Outbound,
}

/// A mutex-guarded growable byte buffer with a hard size limit.
#[derive(Debug)]
pub struct ChannelBuffer {
    channel: ChannelKind,
    direction: Direction,
    limit: usize,
    bytes: Mutex<Vec<u8>>,
}

impl ChannelBuffer {
    /// Create a buffer limited to [`MAX_FRAME_BYTES`].
    pub fn new(channel: ChannelKind, direction: Direction) -> Self {
        Self::with_limit(channel, direction, MAX_FRAME_BYTES)
    }

    /// Create a buffer with a custom size limit.
    pub fn with_limit(channel: ChannelKind, direction: Direction, limit: usize) -> Self {
        Self {
            channel,
            direction,
            limit,
            bytes: Mutex::new(Vec::new()),
        }
    }

    /// Channel this buffer belongs to.
    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    /// Direction of the bytes held here.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Maximum number of bytes held at once.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append `data`, returning the new buffer length.
    ///
    /// Empty slices are a no-op.  On an inbound buffer a single payload larger
    /// than the limit is rejected without touching the pending content.
    ///
    /// # Errors
    ///
    /// Returns [`WebIoError::BufferOverflow`] when the append would exceed the
    /// limit; the pending content has been discarded when this happens (except
    /// for the oversized-inbound-payload case above).
    pub fn append(&self, data: &[u8]) -> Result<usize, WebIoError> {
        if data.is_empty() {
            return Ok(self.len());
        }
        if self.direction == Direction::Inbound && data.len() > self.limit {
            return Err(self.overflow(data.len()));
        }

        let mut bytes = self.bytes.lock();
        let attempted = bytes.len() + data.len();
        if attempted > self.limit {
            bytes.clear();
            return Err(self.overflow(attempted));
        }
        bytes.extend_from_slice(data);
        Ok(bytes.len())
    }

    /// Take the whole pending content, leaving the buffer empty.
    ///
    /// Returns `None` when nothing is buffered, or when the snapshot exceeds
    /// the limit (it is logged and dropped instead of being written).
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        let frame = mem::take(&mut *self.bytes.lock());
        if frame.is_empty() {
            return None;
        }
        if frame.len() > self.limit {
            error!(
                channel = %self.channel,
                len = frame.len(),
                limit = self.limit,
                "outbound frame exceeds limit; dropped"
            );
            return None;
        }
        Some(frame)
    }

    /// Lock the buffer for reading.  The content is cleared and the lock
    /// released when the returned guard is dropped, on every exit path.
    pub fn drain(&self) -> Drained<'_> {
        Drained {
            guard: self.bytes.lock(),
        }
    }

    /// Discard any pending content.
    pub fn clear(&self) {
        self.bytes.lock().clear();
    }

    /// Number of bytes pending.
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn overflow(&self, attempted: usize) -> WebIoError {
        warn!(
            channel = %self.channel,
            direction = ?self.direction,
            attempted,
            limit = self.limit,
            "buffer overflow; pending data discarded"
        );
        WebIoError::BufferOverflow {
            channel: self.channel,
            attempted,
            limit: self.limit,
        }
    }
}

/// Scoped read access to a [`ChannelBuffer`].
///
/// Holds the buffer's lock for its whole lifetime; on drop the content is
/// cleared and the lock released.
pub struct Drained<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Drained<'_> {
    /// The accumulated bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.guard
    }

    /// The accumulated bytes as UTF-8 (lossy).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.guard)
    }

    /// Parse the accumulated text as newline-delimited command objects.
    /// Lines that fail to parse are skipped.
    pub fn commands(&self) -> impl Iterator<Item = CommandPayload> + '_ {
        self.guard
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| CommandPayload::parse(line).ok())
    }
}

impl Deref for Drained<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl Drop for Drained<'_> {
    fn drop(&mut self) {
        self.guard.clear();
    }
}
