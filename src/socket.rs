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

//! A socket wrapper owning an input buffer, with read/write timeouts and
//! a dispatch loop driven by handler result codes.

use crate::{
    error::{Error, Result},
    stream::{BucketList, DataAction, ReadResult, Stream, StreamHandler},
};
use bytes::BytesMut;
use smallvec::SmallVec;
use std::{io::IoSlice, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::trace;

#[cfg(target_os = "linux")]
use crate::stream::{DirectAction, FdKind, FdMask};
#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd};

/// Capacity of the input buffer.
pub const INPUT_BUFFER_SIZE: usize = 16384;

/// Default inactivity window for reads and writes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How the buffered-data handler wants the dispatch loop to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedResult {
    /// All data was consumed; wait for more.
    Ok,

    /// Some data was consumed; do not read more right now.
    Partial,

    /// The handler needs more data; a full buffer is an overflow error.
    More,

    /// Re-invoke the handler immediately.
    AgainOptional,

    /// Re-invoke the handler immediately; an empty buffer behaves like
    /// [`BufferedResult::More`].
    AgainExpect,

    /// The handler cannot consume right now; it will resume the socket
    /// itself.
    Blocking,

    /// The handler has closed the connection.
    Closed,

    /// The handler has destroyed the socket object.
    Destroyed,
}

/// Result of the direct (splice) dispatch path.
#[derive(Debug)]
pub enum DirectResult {
    /// Some data was transferred.
    Ok,

    /// The handler cannot take the direct path right now; the dispatch
    /// loop reverts to buffered transfers.
    Blocking,

    /// The socket had no data available.
    Empty,

    /// The handler saw end-of-file.
    End,

    /// The socket object was closed by the handler.
    Closed,

    /// An I/O error occurred.
    Errno(std::io::Error),
}

/// Outcome of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveResult {
    /// The handler reported [`BufferedResult::Closed`] or
    /// [`BufferedResult::Destroyed`].
    Done,

    /// The handler blocks.
    Blocking,

    /// The handler consumed part of the buffer and wants to be resumed
    /// later.
    Partial,

    /// The peer closed and the buffer has been drained.
    Ended,
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),

    /// The peer closed its read side; reading may still be possible.
    Broken,
}

/// Consumer view of the input buffer during dispatch.
pub struct InputWindow<'a> {
    buffer: &'a mut BytesMut,
}

impl InputWindow<'_> {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..]
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Advance past `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
    }
}

/// Handler of the buffered dispatch loop.
pub trait BufferedHandler {
    /// Data is available in the input buffer.  Consume through the
    /// window; the dispatch loop acts on the returned code.
    fn on_data(&mut self, window: &mut InputWindow<'_>) -> Result<BufferedResult>;

    /// The socket is ready for a direct (splice) transfer: the input
    /// buffer is empty and direct mode is enabled.  The handler moves
    /// bytes straight out of the descriptor.  [`DirectResult::Blocking`]
    /// reverts the loop to the buffered path.
    #[cfg(target_os = "linux")]
    fn on_direct(&mut self, _kind: FdKind, _fd: BorrowedFd<'_>) -> DirectResult {
        DirectResult::Blocking
    }

    /// The peer has closed the socket.  Data may remain in the buffer.
    /// Return false to stop delivering it.
    fn on_closed(&mut self) -> bool {
        true
    }

    /// The buffer has run empty after the peer closed.
    fn on_end(&mut self) {}
}

/// Capability probe for the splice fast path: transports backed by a
/// plain kernel socket expose their descriptor.
///
/// Implemented for the tokio socket types; custom transports opt out
/// with an empty `impl` (everything then stays on the buffered path).
pub trait SpliceTarget {
    /// The transport's descriptor, or `None` to keep all transfers
    /// buffered.
    #[cfg(unix)]
    fn splice_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl SpliceTarget for tokio::net::TcpStream {
    #[cfg(unix)]
    fn splice_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

#[cfg(unix)]
impl SpliceTarget for tokio::net::UnixStream {
    fn splice_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl SpliceTarget for tokio::io::DuplexStream {}

/// A non-blocking socket with an owned input buffer.
///
/// States: uninitialised → connected → disconnected (buffer may still
/// drain) → ended → destroyed; transitions are one-directional.
pub struct BufferedSocket<S> {
    socket: Option<S>,
    input: BytesMut,

    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,

    /// Attempt direct (splice) transfers when the buffer is empty.
    direct: bool,

    /// The handler announced it needs more data.
    expect_more: bool,

    /// Data was received since the last reset.
    got_data: bool,

    /// The peer has closed its write side.
    peer_closed: bool,

    ended: bool,
}

impl<S> BufferedSocket<S> {
    pub fn new(socket: S) -> Self {
        BufferedSocket {
            socket: Some(socket),
            input: BytesMut::with_capacity(INPUT_BUFFER_SIZE),
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
            direct: false,
            expect_more: false,
            got_data: false,
            peer_closed: false,
            ended: false,
        }
    }

    pub fn with_timeouts(
        mut self, read_timeout: Option<Duration>, write_timeout: Option<Duration>,
    ) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    /// Whether the socket descriptor is still attached.
    pub fn is_connected(&self) -> bool {
        debug_assert!(!self.ended);
        self.socket.is_some() && !self.peer_closed
    }

    /// Whether the descriptor is still owned (it may be half-closed).
    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Data was received since the last [`BufferedSocket::reset_got_data`].
    pub fn got_data(&self) -> bool {
        self.got_data
    }

    pub fn reset_got_data(&mut self) {
        self.got_data = false;
    }

    /// Whether direct (splice) transfers are currently preferred.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Withdraw a previous "expect more data" announcement, e.g. when a
    /// body turns out to be delimited by the connection end.
    pub fn clear_expect_more(&mut self) {
        self.expect_more = false;
    }

    /// Is the object still usable?  The socket may be gone while the
    /// buffer still holds data.
    pub fn is_valid(&self) -> bool {
        self.socket.is_some() || !self.input.is_empty()
    }

    pub fn set_direct(&mut self, direct: bool) {
        self.direct = direct;
    }

    /// Drop the socket descriptor.
    pub fn close(&mut self) {
        self.socket = None;
    }

    /// Surrender the socket descriptor without closing it, e.g. for
    /// connection pooling.  The input buffer stays.
    pub fn abandon(&mut self) -> Option<S> {
        self.socket.take()
    }

    /// Like [`BufferedSocket::abandon`], but only when the buffer is
    /// empty.
    pub fn into_socket(mut self) -> Option<S> {
        if !self.input.is_empty() {
            return None;
        }

        self.socket.take()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.input
    }

    pub fn available(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.input.len() >= INPUT_BUFFER_SIZE
    }

    /// Mark bytes of the input buffer as consumed.
    pub fn consumed(&mut self, n: usize) {
        let _ = self.input.split_to(n);
    }
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin> BufferedSocket<S> {
    /// Read once into the input buffer.
    ///
    /// Returns the number of bytes received; zero means the peer closed.
    /// With `expect_more`, a premature close is an error.  A read
    /// timeout maps to [`Error::Timeout`].
    pub async fn fill(&mut self, expect_more: bool) -> Result<usize> {
        if expect_more {
            self.expect_more = true;
        }

        if self.peer_closed {
            return if self.expect_more && self.input.is_empty() {
                Err(Error::ClosedPrematurely)
            } else {
                Ok(0)
            };
        }

        let Some(socket) = &mut self.socket else {
            return Err(Error::ClosedPrematurely);
        };

        let spare = INPUT_BUFFER_SIZE.saturating_sub(self.input.len());
        if spare == 0 {
            return Err(Error::BufferOverflow);
        }

        let mut chunk = [0u8; 4096];
        let max = spare.min(chunk.len());
        let read = socket.read(&mut chunk[..max]);
        let n = match self.read_timeout {
            Some(window) => timeout(window, read).await.map_err(|_| Error::Timeout)??,
            None => read.await?,
        };
        self.input.extend_from_slice(&chunk[..n]);

        trace!(n, buffered = self.input.len(), "socket fill");

        if n == 0 {
            self.peer_closed = true;
            if self.expect_more && self.input.is_empty() {
                return Err(Error::ClosedPrematurely);
            }
        } else {
            self.got_data = true;
        }

        Ok(n)
    }

    /// Send a byte span.  Partial writes are surfaced; broken pipes are
    /// reported as [`WriteOutcome::Broken`] so the caller may keep
    /// reading.
    pub async fn write(&mut self, data: &[u8]) -> Result<WriteOutcome> {
        let Some(socket) = &mut self.socket else {
            return Err(Error::ClosedPrematurely);
        };

        let write = socket.write(data);
        let result = match self.write_timeout {
            Some(window) => timeout(window, write).await.map_err(|_| Error::Timeout)?,
            None => write.await,
        };

        match result {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e) => match e.kind() {
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                    Ok(WriteOutcome::Broken)
                }
                _ => Err(e.into()),
            },
        }
    }

    /// Vectored variant of [`BufferedSocket::write`].
    pub async fn write_vectored(&mut self, slices: &[IoSlice<'_>]) -> Result<WriteOutcome> {
        let Some(socket) = &mut self.socket else {
            return Err(Error::ClosedPrematurely);
        };

        let write = socket.write_vectored(slices);
        let result = match self.write_timeout {
            Some(window) => timeout(window, write).await.map_err(|_| Error::Timeout)?,
            None => write.await,
        };

        match result {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e) => match e.kind() {
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                    Ok(WriteOutcome::Broken)
                }
                _ => Err(e.into()),
            },
        }
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<WriteOutcome> {
        let mut total = 0;
        while !data.is_empty() {
            match self.write(data).await? {
                WriteOutcome::Wrote(n) => {
                    total += n;
                    data = &data[n..];
                }
                WriteOutcome::Broken => return Ok(WriteOutcome::Broken),
            }
        }

        Ok(WriteOutcome::Wrote(total))
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(socket) = &mut self.socket {
            socket.flush().await?;
        }
        Ok(())
    }

    /// Offer the socket descriptor to the handler for a direct (splice)
    /// transfer.
    #[cfg(target_os = "linux")]
    fn dispatch_direct<H: BufferedHandler>(&mut self, handler: &mut H) -> DirectResult {
        debug_assert!(self.direct);
        debug_assert!(self.input.is_empty());

        let Some(socket) = &self.socket else {
            return DirectResult::Closed;
        };

        match socket.splice_fd() {
            Some(fd) => handler.on_direct(FdKind::Socket, fd),
            None => {
                // transport cannot splice; stay on the buffered path
                DirectResult::Blocking
            }
        }
    }

    /// Run the buffered dispatch loop until the handler yields.
    pub async fn drive<H: BufferedHandler>(&mut self, handler: &mut H) -> Result<DriveResult> {
        loop {
            while !self.input.is_empty() {
                let mut window = InputWindow {
                    buffer: &mut self.input,
                };

                let result = handler.on_data(&mut window)?;
                trace!(?result, buffered = self.input.len(), "buffered dispatch");

                match result {
                    BufferedResult::Ok => {
                        self.expect_more = false;
                        break;
                    }
                    BufferedResult::Partial => return Ok(DriveResult::Partial),
                    BufferedResult::More => {
                        self.expect_more = true;
                        if self.is_full() {
                            return Err(Error::BufferOverflow);
                        }
                        break;
                    }
                    BufferedResult::AgainOptional => continue,
                    BufferedResult::AgainExpect => {
                        if self.input.is_empty() {
                            self.expect_more = true;
                            if self.is_full() {
                                return Err(Error::BufferOverflow);
                            }
                        }
                        continue;
                    }
                    BufferedResult::Blocking => return Ok(DriveResult::Blocking),
                    BufferedResult::Closed | BufferedResult::Destroyed => {
                        return Ok(DriveResult::Done);
                    }
                }
            }

            if self.peer_closed {
                // no more data will arrive
                if self.expect_more {
                    return Err(Error::ClosedPrematurely);
                }

                self.ended = true;
                handler.on_end();
                return Ok(DriveResult::Ended);
            }

            // direct escalation: with an empty buffer, let the handler
            // splice straight out of the descriptor
            #[cfg(target_os = "linux")]
            while self.direct && self.input.is_empty() && !self.peer_closed {
                match self.dispatch_direct(handler) {
                    DirectResult::Ok => continue,
                    DirectResult::Blocking => {
                        // the handler reverts to buffered transfers;
                        // re-enter that path in the same iteration
                        self.direct = false;
                        break;
                    }
                    DirectResult::Empty => break,
                    DirectResult::End => {
                        self.peer_closed = true;
                        break;
                    }
                    DirectResult::Closed => return Ok(DriveResult::Done),
                    DirectResult::Errno(e) => return Err(e.into()),
                }
            }

            #[cfg(target_os = "linux")]
            if self.peer_closed {
                continue;
            }

            let n = self.fill(false).await?;
            if n == 0 && !handler.on_closed() {
                return Ok(DriveResult::Done);
            }
        }
    }
}

/// Outcome of pumping a request stream into a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The stream is depleted; everything was written.
    Done,

    /// The stream has nothing to offer right now; more may follow after
    /// its producer progresses.
    Pending,

    /// The peer closed its read side mid-transfer.
    Broken,
}

/// Write a stream into the socket: splice when the stream can hand out
/// a descriptor, vectored writes over the bucket path otherwise, push
/// mode as the last resort.
pub async fn pump_stream<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin>(
    socket: &mut BufferedSocket<S>, stream: &mut dyn Stream,
) -> Result<PumpOutcome> {
    // invite pipe/file descriptors when the transport can splice
    #[cfg(target_os = "linux")]
    if socket.transport_fd().is_some() {
        stream.set_direct(FdMask::PIPE.union(FdMask::FILE));
    }

    loop {
        let mut list = BucketList::new();
        stream.fill_buckets(&mut list)?;

        let total = list.total_size();
        let more = list.has_more();
        let fallback = list.should_fallback();

        if total > 0 {
            let slices: SmallVec<[IoSlice<'_>; 64]> =
                list.iter().map(|b| IoSlice::new(b.buffer())).collect();

            let outcome = socket.write_vectored(&slices).await?;
            drop(slices);
            drop(list);

            match outcome {
                WriteOutcome::Wrote(n) => {
                    let consumed = stream.consume_buckets(n);
                    if consumed.eof {
                        socket.flush().await?;
                        return Ok(PumpOutcome::Done);
                    }
                }
                WriteOutcome::Broken => return Ok(PumpOutcome::Broken),
            }
            continue;
        }
        drop(list);

        if !more && !fallback {
            socket.flush().await?;
            return Ok(PumpOutcome::Done);
        }

        // push-mode fallback; also reached when the producer cannot
        // enumerate buckets yet (a gated body reports Pending below) or
        // when it prefers to hand out a descriptor via on_direct
        let mut staging = Vec::new();
        let mut eof = false;
        let mut error = None;
        let result = {
            let mut sink = PumpSink {
                socket: &mut *socket,
                staging: &mut staging,
                eof: &mut eof,
                error: &mut error,
            };
            stream.read(&mut sink)
        };

        if let Some(error) = error {
            return Err(error);
        }

        if !staging.is_empty() {
            match socket.write_all(&staging).await? {
                WriteOutcome::Wrote(_) => {}
                WriteOutcome::Broken => return Ok(PumpOutcome::Broken),
            }
        }

        match result {
            ReadResult::Done => {
                socket.flush().await?;
                return Ok(PumpOutcome::Done);
            }
            ReadResult::Pending => return Ok(PumpOutcome::Pending),
            ReadResult::Blocked | ReadResult::Closed => {}
        }
    }
}

struct PumpSink<'a, S> {
    socket: &'a mut BufferedSocket<S>,
    staging: &'a mut Vec<u8>,
    eof: &'a mut bool,
    error: &'a mut Option<Error>,
}

impl<S: SpliceTarget> StreamHandler for PumpSink<'_, S> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.staging.extend_from_slice(data);
        DataAction::Consumed(data.len())
    }

    #[cfg(target_os = "linux")]
    fn on_direct(
        &mut self, kind: FdKind, fd: BorrowedFd<'_>, max: usize, _then_eof: bool,
    ) -> DirectAction {
        if !self.staging.is_empty() {
            // earlier buffered bytes must reach the wire first
            return DirectAction::Blocking;
        }

        match self.socket.write_from(fd, kind, max) {
            Ok(Some(n)) => DirectAction::Consumed(n),
            Ok(None) => DirectAction::Fallback,
            Err(error) => DirectAction::Failed(error),
        }
    }

    fn on_eof(&mut self) {
        *self.eof = true;
    }

    fn on_error(&mut self, error: Error) {
        *self.error = Some(error);
    }
}

#[cfg(unix)]
impl<S: SpliceTarget> BufferedSocket<S> {
    /// The transport's descriptor, when it can take part in splice
    /// transfers.
    pub fn transport_fd(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().and_then(SpliceTarget::splice_fd)
    }
}

#[cfg(target_os = "linux")]
impl<S: SpliceTarget> BufferedSocket<S> {
    /// Transfer up to `max` bytes from `fd` into the socket without
    /// copying through userspace.
    ///
    /// `Ok(None)` means the fast path is not possible right now — the
    /// transport has no descriptor, the descriptor kind cannot be
    /// spliced, or the call would block — and the caller must fall back
    /// to a buffered copy.
    pub fn write_from(
        &mut self, fd: BorrowedFd<'_>, kind: FdKind, max: usize,
    ) -> Result<Option<usize>> {
        let Some(socket) = &self.socket else {
            return Err(Error::ClosedPrematurely);
        };
        let Some(target) = socket.splice_fd() else {
            return Ok(None);
        };

        match kind {
            FdKind::Pipe => crate::stream::pipe::splice_bytes(fd, target, max),
            FdKind::File => {
                match nix::sys::sendfile::sendfile(target, fd, None, max) {
                    Ok(n) => Ok(Some(n)),
                    Err(nix::errno::Errno::EAGAIN) => Ok(None),
                    Err(errno) => {
                        Err(std::io::Error::from_raw_os_error(errno as i32).into())
                    }
                }
            }
            // socket-to-socket would need a pipe in between
            FdKind::Socket => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LineHandler {
        lines: Vec<String>,
        done: bool,
    }

    impl BufferedHandler for LineHandler {
        fn on_data(&mut self, window: &mut InputWindow<'_>) -> Result<BufferedResult> {
            let data = window.data();
            let Some(pos) = data.iter().position(|&b| b == b'\n') else {
                return Ok(BufferedResult::More);
            };

            let line = String::from_utf8_lossy(&data[..pos]).into_owned();
            window.consume(pos + 1);

            if line == "quit" {
                self.done = true;
                return Ok(BufferedResult::Closed);
            }

            self.lines.push(line);
            Ok(BufferedResult::AgainExpect)
        }
    }

    #[tokio::test]
    async fn dispatch_lines() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut socket = BufferedSocket::new(server);

        tokio::spawn(async move {
            client.write_all(b"one\ntwo\nquit\n").await.unwrap();
        });

        let mut handler = LineHandler {
            lines: Vec::new(),
            done: false,
        };

        let result = socket.drive(&mut handler).await.unwrap();
        assert_eq!(result, DriveResult::Done);
        assert!(handler.done);
        assert_eq!(handler.lines, ["one", "two"]);
    }

    #[tokio::test]
    async fn expect_more_detects_premature_close() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut socket = BufferedSocket::new(server);

        tokio::spawn(async move {
            client.write_all(b"incomplete").await.unwrap();
            // dropping the client closes the stream
        });

        let mut handler = LineHandler {
            lines: Vec::new(),
            done: false,
        };

        let error = socket.drive(&mut handler).await.unwrap_err();
        assert!(matches!(error, Error::ClosedPrematurely));
    }

    #[tokio::test]
    async fn read_timeout_fires() {
        let (_client, server) = tokio::io::duplex(256);
        let mut socket = BufferedSocket::new(server)
            .with_timeouts(Some(Duration::from_millis(10)), None);

        let error = socket.fill(false).await.unwrap_err();
        assert!(matches!(error, Error::Timeout));
    }

    #[tokio::test]
    async fn abandon_keeps_buffer() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut socket = BufferedSocket::new(server);

        client.write_all(b"leftover").await.unwrap();
        socket.fill(false).await.unwrap();

        let inner = socket.abandon();
        assert!(inner.is_some());
        assert_eq!(socket.buffer(), b"leftover");
        assert!(socket.is_valid());
    }

    #[tokio::test]
    async fn direct_mode_reverts_to_buffered_without_descriptor() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut socket = BufferedSocket::new(server);
        // a duplex pipe has no kernel descriptor; the dispatch loop must
        // flip direct off and keep going buffered
        socket.set_direct(true);

        tokio::spawn(async move {
            client.write_all(b"one\nquit\n").await.unwrap();
        });

        let mut handler = LineHandler {
            lines: Vec::new(),
            done: false,
        };

        let result = socket.drive(&mut handler).await.unwrap();
        assert_eq!(result, DriveResult::Done);
        assert_eq!(handler.lines, ["one"]);
        #[cfg(target_os = "linux")]
        assert!(!socket.is_direct());
    }

    #[tokio::test]
    async fn write_round_trip() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut socket = BufferedSocket::new(server);

        let outcome = socket.write_all(b"payload").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Wrote(7));
        socket.flush().await.unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }
}
