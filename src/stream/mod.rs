// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The stream abstraction: producers of lazy byte sequences with two
//! complementary transfer protocols.
//!
//! A [`Stream`] pushes data into a [`StreamHandler`] during [`Stream::read`]
//! (push mode), or lets the consumer borrow spans of its pending data
//! through [`Stream::fill_buckets`] / [`Stream::consume_buckets`] (pull
//! mode).  Every stream implements both; a stream that cannot enumerate
//! buckets raises the `fallback` flag so the consumer reverts to push mode.
//!
//! Ownership discipline: a stream is owned by exactly one consumer, and the
//! handler is passed into `read()` instead of being stored.  A handler that
//! is shutting down answers [`DataAction::Closed`], upon which the producer
//! must stop immediately; this disposition replaces the stack-sentinel
//! destruction tracking the callback model would otherwise need.

pub mod bucket;
pub mod catch;
pub mod chunked;
pub mod codec;
pub mod concat;
pub mod control;
pub mod dechunk;
pub mod delayed;
pub mod escape;
pub mod fifo;
pub mod head;
pub mod offload;
#[cfg(target_os = "linux")]
pub mod pipe;
pub mod replace;
pub mod sink;
pub mod source;
pub mod subst;
pub mod tee;
pub mod trickle;

pub use bucket::{Bucket, BucketList, MAX_BUCKETS};

use crate::error::{Error, Result};
#[cfg(unix)]
use std::os::fd::{BorrowedFd, OwnedFd};

/// Descriptor kinds a handler may accept for direct (splice) transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// A regular file.
    File,
    /// A pipe endpoint.
    Pipe,
    /// A stream socket.
    Socket,
}

/// Set of [`FdKind`]s, used to advertise splice capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdMask(u8);

impl FdMask {
    pub const NONE: FdMask = FdMask(0);
    pub const FILE: FdMask = FdMask(1);
    pub const PIPE: FdMask = FdMask(2);
    pub const SOCKET: FdMask = FdMask(4);
    pub const ANY: FdMask = FdMask(7);

    pub const fn contains(self, kind: FdKind) -> bool {
        self.0 & FdMask::from_kind(kind).0 != 0
    }

    pub const fn from_kind(kind: FdKind) -> FdMask {
        match kind {
            FdKind::File => FdMask::FILE,
            FdKind::Pipe => FdMask::PIPE,
            FdKind::Socket => FdMask::SOCKET,
        }
    }

    pub const fn union(self, other: FdMask) -> FdMask {
        FdMask(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Disposition returned by [`StreamHandler::on_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAction {
    /// The handler accepted this many bytes.  Zero means the handler is
    /// blocked; the producer must not push again until the next `read()`.
    Consumed(usize),

    /// The consumer is shutting down; the producer must stop immediately
    /// and will be closed by its owner.
    Closed,
}

/// Disposition returned by [`StreamHandler::on_direct`].
#[cfg(unix)]
#[derive(Debug)]
pub enum DirectAction {
    /// The handler moved this many bytes out of the descriptor.
    Consumed(usize),

    /// The handler cannot accept data right now.
    Blocking,

    /// The descriptor had no data available.
    Empty,

    /// The handler saw end-of-file on the descriptor.
    End,

    /// The handler wants ordinary buffered transfer instead.
    Fallback,

    /// The consumer is shutting down.
    Closed,

    /// The transfer failed; the producer delivers this through
    /// `on_error` and finishes.
    Failed(Error),
}

/// Consumer-side interface receiving push callbacks.
pub trait StreamHandler {
    /// Data is available.  Returns how much of it was accepted.
    fn on_data(&mut self, data: &[u8]) -> DataAction;

    /// A descriptor window is available for zero-copy transfer.  Only
    /// invoked for kinds previously enabled via [`Stream::set_direct`].
    #[cfg(unix)]
    fn on_direct(
        &mut self, _kind: FdKind, _fd: BorrowedFd<'_>, _max: usize, _then_eof: bool,
    ) -> DirectAction {
        DirectAction::Fallback
    }

    /// The stream has delivered all its data.  No callback follows.
    fn on_eof(&mut self);

    /// The stream failed.  No callback follows.
    fn on_error(&mut self, error: Error);
}

/// Outcome of a [`Stream::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ReadResult {
    /// `on_eof` or `on_error` was delivered; the stream is finished and
    /// must not be used again.
    Done,

    /// The handler refused some of the offered bytes.  It is responsible
    /// for calling `read()` again once it can make progress.
    Blocked,

    /// The producer has nothing to offer right now but will have more
    /// once its own source progresses.
    Pending,

    /// The handler answered [`DataAction::Closed`]; the owner must close
    /// the stream.
    Closed,
}

/// Result of [`Stream::consume_buckets`].
///
/// `consumed` may exceed the requested amount by at most one byte when the
/// consumption completed an embedded sub-stream and activated the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Consumed {
    pub consumed: usize,
    pub eof: bool,
}

impl Consumed {
    pub const fn new(consumed: usize, eof: bool) -> Self {
        Consumed { consumed, eof }
    }
}

/// Producer of a lazy byte sequence with a single consumer.
pub trait Stream {
    /// Number of bytes this stream will still deliver, or `None` if
    /// unknown.  With `partial == false` the result must be exact; with
    /// `partial == true` it may be a lower bound.
    fn available(&self, partial: bool) -> Option<u64>;

    /// Discard up to `n` bytes; returns the number skipped, or `None` if
    /// the stream cannot skip.
    fn skip(&mut self, _n: u64) -> Option<u64> {
        None
    }

    /// Push pending data into the handler.  Must deliver data, EOF or an
    /// error, or return a result that explains why it could not.
    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult;

    /// Pull mode: append borrowed spans of pending data to `list`.  The
    /// spans stay valid until [`Stream::consume_buckets`] or the next
    /// mutation of this stream.  The default raises the fallback flag.
    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        list.set_more();
        list.enable_fallback();
        Ok(())
    }

    /// Pull mode: advance past `n` bytes previously observed through
    /// [`Stream::fill_buckets`].
    fn consume_buckets(&mut self, _n: usize) -> Consumed {
        Consumed::default()
    }

    /// Advertise which descriptor kinds the handler accepts via
    /// `on_direct`.
    fn set_direct(&mut self, _mask: FdMask) {}

    /// Account bytes moved by the handler during a direct transfer.
    fn consume_direct(&mut self, _n: usize) {}

    /// Hand out the underlying descriptor if the stream's remaining
    /// content is exactly that descriptor's unread tail.  The stream is
    /// spent afterwards.
    #[cfg(unix)]
    fn as_fd(&mut self) -> Option<OwnedFd> {
        None
    }

    /// Stop producing.  The owner drops the stream afterwards; no handler
    /// callback may be issued from here.
    fn close(&mut self);
}

impl Stream for Box<dyn Stream> {
    fn available(&self, partial: bool) -> Option<u64> {
        (**self).available(partial)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        (**self).skip(n)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        (**self).read(handler)
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        (**self).fill_buckets(list)
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        (**self).consume_buckets(n)
    }

    fn set_direct(&mut self, mask: FdMask) {
        (**self).set_direct(mask)
    }

    fn consume_direct(&mut self, n: usize) {
        (**self).consume_direct(n)
    }

    #[cfg(unix)]
    fn as_fd(&mut self) -> Option<OwnedFd> {
        (**self).as_fd()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
