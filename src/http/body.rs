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

//! The HTTP response body: a stream over the socket's input buffer with
//! three framing modes (known length, chunked, until-close).

use crate::{
    error::{Error, HttpErrorCode, Result},
    lease::{Lease, PutAction},
    socket::{BufferedSocket, SpliceTarget},
    stream::{
        dechunk::{DechunkHandler, DechunkInputAction, DechunkStream},
        BucketList, Consumed, DataAction, FdKind, FdMask, ReadResult, Stream, StreamHandler,
    },
};
use std::{cell::Cell, rc::Rc};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

#[cfg(target_os = "linux")]
use crate::stream::DirectAction;

/// Remaining length accounting of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rest {
    /// Exactly this many bytes remain.
    Known(u64),

    /// The raw chunked stream; the dechunker on top tracks the framing.
    ChunkedRaw,

    /// Ends when the peer closes the connection.
    UntilEof,
}

/// Marks the moment the dechunker has seen the EOF chunk.
pub(crate) struct EndSeen(pub(crate) Rc<Cell<bool>>);

impl DechunkHandler for EndSeen {
    fn on_end_seen(&mut self) {
        self.0.set(true);
    }

    fn on_end(&mut self) -> DechunkInputAction {
        DechunkInputAction::Keep
    }
}

/// The socket-backed raw body reader.
pub(crate) struct RawBody<S, L: Lease<S>> {
    pub(crate) socket: BufferedSocket<S>,
    pub(crate) lease: Option<L>,
    pub(crate) rest: Rest,
    pub(crate) keep_alive: bool,

    /// The chunked EOF marker has been observed (chunked mode only).
    pub(crate) end_seen: Rc<Cell<bool>>,

    /// Descriptor kinds the consumer accepts through `on_direct`.
    pub(crate) direct_mask: FdMask,

    pub(crate) peer_done: bool,
}

/// Outcome of offering the socket descriptor to the consumer.
#[cfg(target_os = "linux")]
enum DirectOffer {
    /// A final result to propagate.
    Result(ReadResult),

    /// State advanced; run the read loop again.
    Progress,

    /// No direct transfer possible; carry on buffered.
    Unavailable,
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> RawBody<S, L> {
    /// Let the consumer splice straight out of the socket descriptor.
    #[cfg(target_os = "linux")]
    fn offer_direct(&mut self, handler: &mut dyn StreamHandler) -> DirectOffer {
        if !self.direct_mask.contains(FdKind::Socket) {
            return DirectOffer::Unavailable;
        }

        let (max, then_eof) = match self.rest {
            Rest::Known(rest) => (rest as usize, true),
            Rest::UntilEof => (1 << 20, false),
            // chunked framing must go through the parser
            Rest::ChunkedRaw => return DirectOffer::Unavailable,
        };

        let action = {
            let Some(fd) = self.socket.transport_fd() else {
                return DirectOffer::Unavailable;
            };
            handler.on_direct(FdKind::Socket, fd, max, then_eof)
        };

        match action {
            DirectAction::Consumed(0) => DirectOffer::Unavailable,
            DirectAction::Consumed(n) => {
                if let Rest::Known(rest) = &mut self.rest {
                    *rest = rest.saturating_sub(n as u64);
                }

                if matches!(self.rest, Rest::Known(0)) {
                    self.release_if_done();
                    handler.on_eof();
                    return DirectOffer::Result(ReadResult::Done);
                }

                DirectOffer::Progress
            }
            DirectAction::Blocking => DirectOffer::Result(ReadResult::Blocked),
            DirectAction::Empty => DirectOffer::Result(ReadResult::Pending),
            DirectAction::End => {
                self.peer_done = true;
                DirectOffer::Progress
            }
            DirectAction::Fallback => DirectOffer::Unavailable,
            DirectAction::Closed => DirectOffer::Result(ReadResult::Closed),
            DirectAction::Failed(error) => {
                self.release_socket(PutAction::Destroy);
                handler.on_error(error);
                DirectOffer::Result(ReadResult::Done)
            }
        }
    }

    fn release_socket(&mut self, action: PutAction) {
        if let Some(mut lease) = self.lease.take() {
            if let Some(socket) = self.socket.abandon() {
                debug!(?action, "release HTTP connection");
                lease.release(socket, action);
            }
        }
    }

    /// All bytes the body still needs are in the buffer already?
    pub(crate) fn is_socket_done(&self) -> bool {
        match self.rest {
            Rest::Known(rest) => self.socket.available() as u64 >= rest,
            Rest::ChunkedRaw => self.end_seen.get(),
            Rest::UntilEof => false,
        }
    }

    /// Release the socket as soon as it is no longer needed.
    pub(crate) fn release_if_done(&mut self) {
        if self.lease.is_none() {
            return;
        }

        if self.is_socket_done() {
            let reuse = self.keep_alive;
            self.release_socket(if reuse {
                PutAction::Reuse
            } else {
                PutAction::Destroy
            });
        }
    }

    /// Pull more data from the socket.  Returns false on peer close.
    pub(crate) async fn fetch(&mut self) -> Result<bool> {
        if self.peer_done {
            return Ok(false);
        }

        if !self.socket.has_socket() {
            // released early; whatever is buffered is all there is
            self.peer_done = true;
            return Ok(false);
        }

        let expect_more = match self.rest {
            Rest::Known(rest) => rest > 0,
            Rest::ChunkedRaw => !self.end_seen.get(),
            Rest::UntilEof => false,
        };
        if !expect_more {
            self.socket.clear_expect_more();
        }

        match self.socket.fill(expect_more).await {
            Ok(0) => {
                self.peer_done = true;
                Ok(false)
            }
            Ok(_) => {
                self.release_if_done();
                Ok(true)
            }
            Err(Error::ClosedPrematurely) => {
                self.peer_done = true;
                self.release_socket(PutAction::Destroy);
                Err(Error::http(
                    HttpErrorCode::Premature,
                    "server closed the connection before the response body was complete",
                ))
            }
            Err(Error::Timeout) => {
                self.release_socket(PutAction::Destroy);
                Err(Error::Timeout)
            }
            Err(error) => {
                self.release_socket(PutAction::Destroy);
                Err(Error::http_nested(
                    HttpErrorCode::Io,
                    "HTTP client socket error",
                    error,
                ))
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> Stream for RawBody<S, L> {
    fn available(&self, partial: bool) -> Option<u64> {
        match self.rest {
            Rest::Known(rest) => Some(rest),
            _ if partial => Some(self.socket.available() as u64),
            _ => None,
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        loop {
            if let Rest::Known(0) = self.rest {
                self.release_if_done();
                handler.on_eof();
                return ReadResult::Done;
            }

            let buffered = self.socket.available();
            if buffered == 0 && !self.peer_done {
                #[cfg(target_os = "linux")]
                match self.offer_direct(handler) {
                    DirectOffer::Result(result) => return result,
                    DirectOffer::Progress => continue,
                    DirectOffer::Unavailable => {}
                }

                return ReadResult::Pending;
            }

            if buffered == 0 {
                if self.peer_done {
                    return match self.rest {
                        Rest::UntilEof | Rest::ChunkedRaw => {
                            // for chunked, the dechunker decides whether
                            // this end was premature
                            handler.on_eof();
                            ReadResult::Done
                        }
                        Rest::Known(_) => {
                            self.release_socket(PutAction::Destroy);
                            handler.on_error(Error::http(
                                HttpErrorCode::Premature,
                                "server closed the connection before the response body was complete",
                            ));
                            ReadResult::Done
                        }
                    };
                }

                return ReadResult::Pending;
            }

            let max = match self.rest {
                Rest::Known(rest) => buffered.min(rest as usize),
                _ => buffered,
            };

            let chunk = self.socket.buffer()[..max].to_vec();
            match handler.on_data(&chunk) {
                DataAction::Consumed(0) => return ReadResult::Blocked,
                DataAction::Consumed(n) => {
                    self.socket.consumed(n);
                    if let Rest::Known(rest) = &mut self.rest {
                        *rest -= n as u64;
                    }

                    // the consumer may just have parsed the chunked EOF
                    if self.rest == Rest::ChunkedRaw && self.end_seen.get() {
                        self.release_if_done();
                    }

                    if n < max {
                        return ReadResult::Blocked;
                    }
                }
                DataAction::Closed => return ReadResult::Closed,
            }
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        let buffered = self.socket.buffer();

        let (window, then_eof) = match self.rest {
            Rest::Known(rest) => {
                let take = buffered.len().min(rest as usize);
                (&buffered[..take], take as u64 == rest)
            }
            _ => (buffered, false),
        };

        if !window.is_empty() {
            list.push(window);
        }

        if !then_eof {
            list.set_more();
        }

        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        let n = match self.rest {
            Rest::Known(rest) => n.min(rest as usize),
            _ => n,
        }
        .min(self.socket.available());

        self.socket.consumed(n);
        if let Rest::Known(rest) = &mut self.rest {
            *rest -= n as u64;
        }

        let eof = matches!(self.rest, Rest::Known(0));
        if eof {
            self.release_if_done();
        }

        Consumed::new(n, eof)
    }

    fn set_direct(&mut self, mask: FdMask) {
        self.direct_mask = mask;
        self.socket.set_direct(mask.contains(FdKind::Socket));
    }

    fn close(&mut self) {
        self.release_socket(PutAction::Destroy);
    }
}

impl<S, L: Lease<S>> Drop for RawBody<S, L> {
    fn drop(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            if let Some(socket) = self.socket.abandon() {
                lease.release(socket, PutAction::Destroy);
            }
        }
    }
}

/// Maps a premature chunked end onto the client's error vocabulary.
struct MapPremature<'a> {
    down: &'a mut dyn StreamHandler,
}

impl StreamHandler for MapPremature<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.down.on_data(data)
    }

    fn on_eof(&mut self) {
        self.down.on_eof();
    }

    fn on_error(&mut self, error: Error) {
        let error = match error {
            Error::ClosedPrematurely => Error::http(
                HttpErrorCode::Premature,
                "server closed the connection before the response body was complete",
            ),
            other => other,
        };
        self.down.on_error(error);
    }
}

pub(crate) enum BodyKind<S, L: Lease<S>> {
    /// The response has no body.
    Empty,

    /// Identity framing (known length or until-close).
    Plain(RawBody<S, L>),

    /// Chunked framing.
    Chunked(DechunkStream<RawBody<S, L>, EndSeen>),
}

/// The response body handed to the caller.
pub struct HttpBody<S, L: Lease<S>> {
    pub(crate) kind: BodyKind<S, L>,
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> HttpBody<S, L> {
    fn raw_mut(&mut self) -> Option<&mut RawBody<S, L>> {
        match &mut self.kind {
            BodyKind::Empty => None,
            BodyKind::Plain(raw) => Some(raw),
            BodyKind::Chunked(dechunk) => dechunk.input_mut(),
        }
    }

    /// Pull more data from the socket.  Returns false on peer close.
    pub async fn fetch(&mut self) -> Result<bool> {
        match self.raw_mut() {
            Some(raw) => raw.fetch().await,
            None => Ok(false),
        }
    }

    /// Collect the whole body.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        loop {
            let mut sink = crate::stream::sink::VecSink::default();
            let result = self.read(&mut sink);
            out.extend_from_slice(sink.data());

            match result {
                ReadResult::Done => {
                    return match sink.take_error() {
                        Some(error) => Err(error),
                        None => Ok(out),
                    };
                }
                ReadResult::Pending => {
                    if !self.fetch().await? {
                        // a read on the drained stream reports the end
                        continue;
                    }
                }
                ReadResult::Blocked => {}
                ReadResult::Closed => {
                    return Err(Error::http(
                        HttpErrorCode::Unspecified,
                        "response body stalled",
                    ));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> Stream for HttpBody<S, L> {
    fn available(&self, partial: bool) -> Option<u64> {
        match &self.kind {
            BodyKind::Empty => Some(0),
            BodyKind::Plain(raw) => raw.available(partial),
            BodyKind::Chunked(dechunk) => dechunk.available(partial),
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        match &mut self.kind {
            BodyKind::Empty => {
                handler.on_eof();
                ReadResult::Done
            }
            BodyKind::Plain(raw) => raw.read(handler),
            BodyKind::Chunked(dechunk) => dechunk.read(&mut MapPremature { down: handler }),
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        match &mut self.kind {
            BodyKind::Empty => Ok(()),
            BodyKind::Plain(raw) => raw.fill_buckets(list),
            BodyKind::Chunked(dechunk) => dechunk.fill_buckets(list),
        }
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        match &mut self.kind {
            BodyKind::Empty => Consumed::new(0, true),
            BodyKind::Plain(raw) => raw.consume_buckets(n),
            BodyKind::Chunked(dechunk) => dechunk.consume_buckets(n),
        }
    }

    fn set_direct(&mut self, mask: FdMask) {
        match &mut self.kind {
            // chunked framing must go through the parser
            BodyKind::Empty | BodyKind::Chunked(_) => {}
            BodyKind::Plain(raw) => raw.set_direct(mask),
        }
    }

    fn close(&mut self) {
        match &mut self.kind {
            BodyKind::Empty => {}
            BodyKind::Plain(raw) => raw.close(),
            BodyKind::Chunked(dechunk) => dechunk.close(),
        }
    }
}
