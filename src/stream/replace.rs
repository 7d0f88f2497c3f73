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

//! A template engine stream: byte ranges of the input are replaced with
//! arbitrary sub-streams.
//!
//! The input accumulates in a growing buffer while the owner registers
//! `(start, end, stream)` substitutions in increasing, non-overlapping
//! order.  Output interleaves buffered source bytes with the substitution
//! streams.  Emission never runs past the settled watermark while
//! registration is still open, so late substitutions cannot be missed.

use crate::{
    buffer::GrowingBuffer,
    error::{Error, Result},
    stream::{BucketList, DataAction, ReadResult, Stream, StreamHandler},
};
use std::collections::VecDeque;

/// Source size limit; the stream fails beyond it.
pub const DEFAULT_MAX_SOURCE_SIZE: u64 = 8 * 1024 * 1024;

struct Substitution {
    start: u64,
    end: u64,
    stream: Option<Box<dyn Stream>>,
}

struct Fill<'a> {
    state: &'a mut ReplaceState,
}

impl StreamHandler for Fill<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        let mut data = data;

        // bytes belonging to an already-skipped range are dropped
        if self.state.skip_debt > 0 {
            let n = (self.state.skip_debt as usize).min(data.len());
            self.state.skip_debt -= n as u64;
            self.state.source_length += n as u64;
            data = &data[n..];
        }

        if self.state.source_length + data.len() as u64 > self.state.max_size {
            self.state.overflow = true;
            return DataAction::Closed;
        }

        self.state.buffer.write(data);
        self.state.source_length += data.len() as u64;
        DataAction::Consumed(data.len())
    }

    fn on_eof(&mut self) {
        self.state.input_eof = true;
    }

    fn on_error(&mut self, error: Error) {
        self.state.input_error = Some(error);
    }
}

struct ReplaceState {
    buffer: GrowingBuffer,

    /// Total source bytes received (including skipped ranges).
    source_length: u64,

    /// Absolute output cursor over the source.
    position: u64,

    /// Registration may still happen up to this offset.
    settled_position: u64,

    /// Bytes of a replaced range that have not arrived yet.
    skip_debt: u64,

    max_size: u64,
    input_eof: bool,
    input_error: Option<Error>,
    overflow: bool,
    finished_registration: bool,
    finished: bool,
}

impl ReplaceState {
    /// Offset up to which plain buffer data may be emitted.
    fn buffer_end_offset(&self, next_start: Option<u64>) -> u64 {
        match next_start {
            Some(start) => start,
            None if self.finished_registration => self.source_length,
            None => self.settled_position.min(self.source_length),
        }
    }
}

/// The replace stream.
pub struct ReplaceStream<S> {
    input: Option<S>,
    state: ReplaceState,
    substitutions: VecDeque<Substitution>,
}

impl<S: Stream> ReplaceStream<S> {
    pub fn new(input: S) -> Self {
        ReplaceStream {
            input: Some(input),
            state: ReplaceState {
                buffer: GrowingBuffer::new(),
                source_length: 0,
                position: 0,
                settled_position: 0,
                skip_debt: 0,
                max_size: DEFAULT_MAX_SOURCE_SIZE,
                input_eof: false,
                input_error: None,
                overflow: false,
                finished_registration: false,
                finished: false,
            },
            substitutions: VecDeque::new(),
        }
    }

    /// Override the source size cap.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.state.max_size = max_size;
        self
    }

    /// Replace the source range `[start, end)` with `stream`; `None`
    /// plainly deletes the range.  Ranges must be registered in
    /// increasing order and must not overlap.
    pub fn add(&mut self, start: u64, end: u64, stream: Option<Box<dyn Stream>>) {
        assert!(!self.state.finished_registration);
        assert!(start <= end);
        assert!(start >= self.state.position);
        if let Some(last) = self.substitutions.back() {
            assert!(start >= last.end);
        }

        if end > self.state.settled_position {
            self.state.settled_position = end;
        }

        self.substitutions.push_back(Substitution { start, end, stream });
    }

    /// Everything up to `offset` is final; no substitution will start
    /// before it.
    pub fn settle(&mut self, offset: u64) {
        assert!(offset >= self.state.settled_position);
        self.state.settled_position = offset;
    }

    /// No further substitutions will be registered.
    pub fn finish(&mut self) {
        self.state.finished_registration = true;
    }

    fn front_active(&self) -> bool {
        self.substitutions
            .front()
            .is_some_and(|s| s.start == self.state.position)
    }

    /// Skip past the front substitution's replaced range.
    fn to_next_substitution(&mut self) {
        let sub = self.substitutions.pop_front().unwrap();
        debug_assert!(sub.start == self.state.position);

        let range = sub.end - sub.start;
        let buffered = self.state.source_length - self.state.position;
        let pay = range.min(buffered);
        self.state.buffer.skip(pay as usize);
        // part of the range may still be in flight; drop it on arrival
        self.state.skip_debt += range - pay;
        self.state.position = sub.end;
    }

    fn is_eof(&self) -> bool {
        self.state.finished_registration
            && self.state.input_eof
            && self.substitutions.is_empty()
            && self.state.position >= self.state.source_length
    }

    /// Emit plain buffer data up to `end`.  Returns false when blocked.
    fn emit_buffer(&mut self, end: u64, handler: &mut dyn StreamHandler) -> Option<bool> {
        while self.state.position < end {
            let max = (end - self.state.position) as usize;
            let span = self.state.buffer.read();
            if span.is_empty() {
                return Some(true);
            }

            let span_len = span.len().min(max);
            match handler.on_data(&span[..span_len]) {
                DataAction::Consumed(n) => {
                    self.state.buffer.consume(n);
                    self.state.position += n as u64;
                    if n < span_len {
                        return Some(false);
                    }
                }
                DataAction::Closed => return None,
            }
        }

        Some(true)
    }

    /// Read from the active substitution stream.  Returns the result to
    /// propagate, or `None` to continue the emit loop.
    fn read_substitution(&mut self, handler: &mut dyn StreamHandler) -> Option<ReadResult> {
        let has_stream = self
            .substitutions
            .front()
            .is_some_and(|s| s.stream.is_some());
        if !has_stream {
            self.to_next_substitution();
            return None;
        }

        let stream = self
            .substitutions
            .front_mut()
            .unwrap()
            .stream
            .as_mut()
            .unwrap();

        let mut saw_eof = false;
        let mut error = None;
        let result = stream.read(&mut SubFwd {
            down: handler,
            saw_eof: &mut saw_eof,
            error: &mut error,
        });

        if let Some(error) = error {
            self.state.finished = true;
            self.close_all();
            handler.on_error(error);
            return Some(ReadResult::Done);
        }

        if saw_eof {
            self.substitutions.front_mut().unwrap().stream = None;
            self.to_next_substitution();
            return None;
        }

        match result {
            ReadResult::Done => {
                self.substitutions.front_mut().unwrap().stream = None;
                self.to_next_substitution();
                None
            }
            other => Some(other),
        }
    }

    fn close_all(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }

        for sub in self.substitutions.drain(..) {
            if let Some(mut stream) = sub.stream {
                stream.close();
            }
        }
    }
}

struct SubFwd<'a> {
    down: &'a mut dyn StreamHandler,
    saw_eof: &'a mut bool,
    error: &'a mut Option<Error>,
}

impl StreamHandler for SubFwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.down.on_data(data)
    }

    fn on_eof(&mut self) {
        *self.saw_eof = true;
    }

    fn on_error(&mut self, error: Error) {
        *self.error = Some(error);
    }
}

impl<S: Stream> Stream for ReplaceStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        if !partial {
            return None;
        }

        let next_start = self.substitutions.front().map(|s| s.start);
        let end = self.state.buffer_end_offset(next_start);
        Some(end.saturating_sub(self.state.position))
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if self.state.finished {
            return ReadResult::Done;
        }

        // pull more source data in
        let pull = match &mut self.input {
            Some(input) => Some(input.read(&mut Fill {
                state: &mut self.state,
            })),
            None => None,
        };

        if let Some(result) = pull {
            if self.state.input_eof || result == ReadResult::Done || self.state.overflow {
                if let Some(mut input) = self.input.take() {
                    if self.state.overflow {
                        input.close();
                    }
                }
            }

            if self.state.overflow {
                self.state.finished = true;
                self.close_all();
                handler.on_error(Error::Message("replace source too large".into()));
                return ReadResult::Done;
            }

            if let Some(error) = self.state.input_error.take() {
                self.state.finished = true;
                self.close_all();
                handler.on_error(error);
                return ReadResult::Done;
            }
        }

        // emit until input or output blocks
        loop {
            while self.front_active() {
                match self.read_substitution(handler) {
                    Some(result) => return result,
                    None => {}
                }
            }

            let next_start = self.substitutions.front().map(|s| s.start);
            let end = self.state.buffer_end_offset(next_start);
            match self.emit_buffer(end, handler) {
                Some(true) => {}
                Some(false) => return ReadResult::Blocked,
                None => return ReadResult::Closed,
            }

            if !self.front_active() {
                break;
            }
        }

        if self.is_eof() {
            self.state.finished = true;
            handler.on_eof();
            return ReadResult::Done;
        }

        ReadResult::Pending
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        list.set_more();
        list.enable_fallback();
        Ok(())
    }

    fn close(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        sink::{read_all, VecSink},
        source::BytesStream,
    };

    #[test]
    fn no_substitutions_passes_through() {
        let mut replace = ReplaceStream::new(BytesStream::new(&b"plain text"[..]));
        replace.finish();
        assert_eq!(read_all(&mut replace).unwrap(), b"plain text");
    }

    #[test]
    fn replaces_ranges_with_streams() {
        let mut replace = ReplaceStream::new(BytesStream::new(&b"foo [x] baz"[..]));
        replace.add(4, 7, Some(Box::new(BytesStream::new(&b"bar"[..]))));
        replace.finish();

        assert_eq!(read_all(&mut replace).unwrap(), b"foo bar baz");
    }

    #[test]
    fn deletes_ranges() {
        let mut replace = ReplaceStream::new(BytesStream::new(&b"keep<cut>keep"[..]));
        replace.add(4, 9, None);
        replace.finish();

        assert_eq!(read_all(&mut replace).unwrap(), b"keepkeep");
    }

    #[test]
    fn multiple_ordered_substitutions() {
        let mut replace = ReplaceStream::new(BytesStream::new(&b"a_b_c"[..]));
        replace.add(1, 2, Some(Box::new(BytesStream::new(&b"1"[..]))));
        replace.add(3, 4, Some(Box::new(BytesStream::new(&b"22"[..]))));
        replace.finish();

        assert_eq!(read_all(&mut replace).unwrap(), b"a1b22c");
    }

    #[test]
    fn unsettled_data_is_withheld() {
        let mut replace = ReplaceStream::new(BytesStream::new(&b"abcdef"[..]));
        replace.settle(3);

        let mut sink = VecSink::default();
        assert_eq!(replace.read(&mut sink), ReadResult::Pending);
        assert_eq!(sink.data(), b"abc");

        replace.finish();
        assert_eq!(replace.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"abcdef");
        assert!(sink.is_eof());
    }

    #[test]
    fn source_size_cap() {
        let big = vec![b'x'; 64];
        let mut replace =
            ReplaceStream::new(BytesStream::new(big)).with_max_size(32);
        replace.finish();

        let error = read_all(&mut replace).unwrap_err();
        assert!(matches!(error, Error::Message(m) if m.contains("too large")));
    }
}
