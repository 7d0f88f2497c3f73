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

//! A filter parsing HTTP "chunked" transfer encoding.
//!
//! The owner is notified through a [`DechunkHandler`]: `on_end_seen` fires
//! as soon as the EOF chunk has been observed in the raw input (so a
//! socket can be marked reusable before the consumer has drained the
//! stream), `on_end` fires once the consumer has everything and decides
//! whether the input should be closed.

use crate::{
    error::{Error, Result},
    http::chunk::HttpChunkParser,
    stream::{BucketList, DataAction, ReadResult, Stream, StreamHandler},
};
use smallvec::SmallVec;

/// How to dispose of the input stream when the chunked stream has ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DechunkInputAction {
    /// Close the input stream.
    #[default]
    Close,

    /// Leave the input alone; its owner keeps using it (for example a
    /// socket that carries further responses).
    Keep,
}

/// Observer for the dechunker's end-of-stream transitions.
pub trait DechunkHandler {
    /// The EOF chunk was seen in the raw input.  Fires exactly once,
    /// strictly before the downstream EOF.
    fn on_end_seen(&mut self);

    /// The consumer has received the complete stream.
    fn on_end(&mut self) -> DechunkInputAction {
        DechunkInputAction::Close
    }
}

/// A [`DechunkHandler`] that does not care.
#[derive(Default)]
pub struct NullDechunkHandler;

impl DechunkHandler for NullDechunkHandler {
    fn on_end_seen(&mut self) {}
}

/// Capacity of the parsed-chunk queue; when it fills, parsing yields and
/// resumes after the consumer caught up.
const MAX_PARSED_CHUNKS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct ParsedChunk {
    header: usize,
    data: usize,
}

struct DechunkState<D> {
    parser: HttpChunkParser,

    /// Raw input bytes that have been fed to the parser but not yet
    /// skipped/delivered.
    parsed_input: usize,

    chunks: SmallVec<[ParsedChunk; MAX_PARSED_CHUNKS]>,

    handler: D,

    /// Forward the raw chunked bytes instead of the decoded payload.
    verbatim: bool,

    /// The chunked stream has ended and everything was delivered; the
    /// input must not feed this filter any more.
    end_ready: bool,

    input_action: DechunkInputAction,
    finished: bool,
    downstream_closed: bool,
}

impl<D: DechunkHandler> DechunkState<D> {
    fn add_header(&mut self, size: usize) {
        debug_assert!(size > 0);

        match self.chunks.last_mut() {
            Some(last) if last.data == 0 => last.header += size,
            _ => self.chunks.push(ParsedChunk {
                header: size,
                data: 0,
            }),
        }
    }

    fn add_data(&mut self, size: usize) {
        debug_assert!(size > 0);

        match self.chunks.last_mut() {
            Some(last) => last.data += size,
            None => self.chunks.push(ParsedChunk {
                header: 0,
                data: size,
            }),
        }
    }

    /// Parse chunk boundaries from the not-yet-attributed tail of `src`.
    fn parse_input(&mut self, src: &[u8]) -> Result<()> {
        if self.parser.has_ended() {
            return Ok(());
        }

        let mut rest = &src[self.parsed_input..];
        while !rest.is_empty() {
            if self.chunks.len() == MAX_PARSED_CHUNKS {
                // queue full: yield, resume after the consumer caught up
                break;
            }

            let (meta, data) = self.parser.parse(rest)?;
            if meta > 0 {
                self.add_header(meta);
                self.parsed_input += meta;
            }

            if data > 0 {
                self.add_data(data);
                self.parsed_input += data;
                self.parser.consume(data);
            }

            rest = &rest[meta + data..];

            if self.parser.has_ended() {
                self.handler.on_end_seen();
                break;
            }
        }

        Ok(())
    }

    fn check_end(&mut self) {
        if self.chunks.is_empty() && self.parser.has_ended() && !self.end_ready {
            self.end_ready = true;
            self.input_action = self.handler.on_end();
        }
    }

    fn feed(&mut self, src: &[u8], down: &mut dyn StreamHandler) -> DataAction {
        if self.end_ready {
            return DataAction::Consumed(0);
        }

        let original_len = src.len();
        let mut src = src;

        while !src.is_empty() && (!self.chunks.is_empty() || !self.parser.has_ended()) {
            if src.len() > self.parsed_input && !self.parser.has_ended() {
                if let Err(error) = self.parse_input(src) {
                    self.finished = true;
                    down.on_error(error);
                    return DataAction::Closed;
                }
            }

            while let Some(chunk) = self.chunks.first_mut() {
                debug_assert!(chunk.header > 0 || chunk.data > 0);

                // skip the framing bytes in front of the data
                if src.len() < chunk.header {
                    chunk.header -= src.len();
                    self.parsed_input -= src.len();
                    src = &[];
                    break;
                }

                self.parsed_input -= chunk.header;
                src = &src[chunk.header..];
                chunk.header = 0;

                let data_size = src.len().min(chunk.data);
                if data_size > 0 {
                    match down.on_data(&src[..data_size]) {
                        DataAction::Consumed(n) => {
                            self.parsed_input -= n;
                            src = &src[n..];

                            let chunk = self.chunks.first_mut().unwrap();
                            chunk.data -= n;

                            if n < data_size {
                                return DataAction::Consumed(original_len - src.len());
                            }
                        }
                        DataAction::Closed => {
                            self.downstream_closed = true;
                            return DataAction::Closed;
                        }
                    }
                }

                let chunk = self.chunks.first_mut().unwrap();
                if chunk.data > 0 {
                    // there was not enough input
                    break;
                }

                self.chunks.remove(0);
            }
        }

        self.check_end();
        DataAction::Consumed(original_len - src.len())
    }

    fn feed_verbatim(&mut self, src: &[u8], down: &mut dyn StreamHandler) -> DataAction {
        if self.end_ready {
            return DataAction::Consumed(0);
        }

        while self.parsed_input < src.len() && !self.parser.has_ended() {
            let result = self.parser.parse(&src[self.parsed_input..]);
            let (meta, data) = match result {
                Ok(x) => x,
                Err(error) => {
                    self.finished = true;
                    down.on_error(error);
                    return DataAction::Closed;
                }
            };

            if data > 0 {
                self.parser.consume(data);
            }
            self.parsed_input += meta + data;

            if self.parser.has_ended() {
                self.handler.on_end_seen();
            }

            if meta + data == 0 {
                break;
            }
        }

        let mut total = 0;
        if self.parsed_input > 0 {
            match down.on_data(&src[..self.parsed_input]) {
                DataAction::Consumed(n) => {
                    self.parsed_input -= n;
                    total = n;
                }
                DataAction::Closed => {
                    self.downstream_closed = true;
                    return DataAction::Closed;
                }
            }
        }

        if self.parser.has_ended() && self.parsed_input == 0 && !self.end_ready {
            self.end_ready = true;
            self.input_action = self.handler.on_end();
        }

        DataAction::Consumed(total)
    }
}

struct Fwd<'a, D> {
    state: &'a mut DechunkState<D>,
    down: &'a mut dyn StreamHandler,
}

impl<D: DechunkHandler> StreamHandler for Fwd<'_, D> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        if self.state.verbatim {
            self.state.feed_verbatim(data, self.down)
        } else {
            self.state.feed(data, self.down)
        }
    }

    fn on_eof(&mut self) {
        if !self.state.end_ready && !self.state.finished {
            self.state.finished = true;
            self.down.on_error(Error::ClosedPrematurely);
        }
    }

    fn on_error(&mut self, error: Error) {
        if !self.state.end_ready && !self.state.finished {
            self.state.finished = true;
            self.down.on_error(error);
        }
    }
}

/// The chunked transfer decoder.
pub struct DechunkStream<S, D> {
    input: Option<S>,
    state: DechunkState<D>,
}

impl<S: Stream, D: DechunkHandler> DechunkStream<S, D> {
    pub fn new(input: S, handler: D) -> Self {
        DechunkStream {
            input: Some(input),
            state: DechunkState {
                parser: HttpChunkParser::new(),
                parsed_input: 0,
                chunks: SmallVec::new(),
                handler,
                verbatim: false,
                end_ready: false,
                input_action: DechunkInputAction::default(),
                finished: false,
                downstream_closed: false,
            },
        }
    }

    /// Switch to verbatim mode: forward the raw chunked bytes unchanged
    /// while still tracking the framing.  Only possible before any input
    /// was processed.
    pub fn set_verbatim(&mut self) -> bool {
        if self.state.parsed_input > 0 || !self.state.chunks.is_empty() {
            return false;
        }

        self.state.verbatim = true;
        true
    }

    /// The input stream, still attached after the chunked stream ended
    /// with [`DechunkInputAction::Keep`].
    pub fn input_mut(&mut self) -> Option<&mut S> {
        self.input.as_mut()
    }

    pub fn input_ref(&self) -> Option<&S> {
        self.input.as_ref()
    }

    fn finish(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        match self.state.input_action {
            DechunkInputAction::Close => {
                if let Some(mut input) = self.input.take() {
                    input.close();
                }
            }
            DechunkInputAction::Keep => {
                // the input's owner keeps using it
            }
        }

        self.state.finished = true;
        handler.on_eof();
        ReadResult::Done
    }
}

impl<S: Stream, D: DechunkHandler> Stream for DechunkStream<S, D> {
    fn available(&self, partial: bool) -> Option<u64> {
        if self.state.verbatim {
            return match partial {
                true => Some(self.state.parsed_input as u64),
                false => None,
            };
        }

        if !partial && !self.state.parser.has_ended() {
            return None;
        }

        Some(self.state.chunks.iter().map(|c| c.data as u64).sum())
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if self.state.finished {
            return ReadResult::Done;
        }

        if self.state.end_ready {
            return self.finish(handler);
        }

        let Some(input) = &mut self.input else {
            return ReadResult::Pending;
        };

        let result = input.read(&mut Fwd {
            state: &mut self.state,
            down: handler,
        });

        if self.state.finished {
            if let Some(mut input) = self.input.take() {
                if result == ReadResult::Closed {
                    // we stopped the input after delivering the error
                    input.close();
                }
            }
            return ReadResult::Done;
        }

        if self.state.end_ready {
            return self.finish(handler);
        }

        result
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        list.set_more();
        list.enable_fallback();
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }
}
