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

//! A filter producing HTTP "chunked" transfer encoding.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, DataAction, ReadResult, Stream, StreamHandler},
};
use std::fmt::Write as _;

/// Upper bound for the data portion of one chunk.
pub const MAX_CHUNK_SIZE: usize = 0x8000;

/// Header/trailer staging buffer.  Seven bytes fit the longest possible
/// content: a pending chunk trailer plus the EOF chunk (`"\r\n0\r\n\r\n"`).
const BUFFER_SIZE: usize = 7;

enum SendOutcome {
    Sent,
    Blocked,
    Closed,
}

#[derive(Default)]
struct ChunkState {
    buffer: [u8; BUFFER_SIZE],
    buffer_sent: usize,

    /// Bytes still belonging to the data portion of the current chunk.
    missing: usize,

    /// Reentrancy guard around buffer flushes in `read()`.
    writing_buffer: bool,

    saw_eof: bool,
    finished: bool,
    downstream_closed: bool,
}

impl ChunkState {
    fn new() -> Self {
        ChunkState {
            buffer_sent: BUFFER_SIZE,
            ..Default::default()
        }
    }

    fn is_buffer_empty(&self) -> bool {
        self.buffer_sent == BUFFER_SIZE
    }

    fn pending(&self) -> &[u8] {
        &self.buffer[self.buffer_sent..]
    }

    /// Place `src` into the (empty) buffer, aligned to its end.
    fn set_buffer(&mut self, src: &[u8]) {
        debug_assert!(self.is_buffer_empty());
        debug_assert!(src.len() <= BUFFER_SIZE);

        self.buffer_sent = BUFFER_SIZE - src.len();
        self.buffer[self.buffer_sent..].copy_from_slice(src);
    }

    /// Append `src` behind the current buffer content.
    fn append_to_buffer(&mut self, src: &[u8]) {
        let old_len = BUFFER_SIZE - self.buffer_sent;
        let new_len = old_len + src.len();
        debug_assert!(new_len <= BUFFER_SIZE);

        let start = BUFFER_SIZE - new_len;
        self.buffer
            .copy_within(self.buffer_sent..BUFFER_SIZE, start);
        self.buffer[start + old_len..].copy_from_slice(src);
        self.buffer_sent = start;
    }

    fn start_chunk(&mut self, length: usize) {
        debug_assert!(length > 0);
        debug_assert!(self.is_buffer_empty());
        debug_assert_eq!(self.missing, 0);

        let length = length.min(MAX_CHUNK_SIZE);
        self.missing = length;

        let mut header = String::with_capacity(6);
        let _ = write!(header, "{length:x}\r\n");
        self.set_buffer(header.as_bytes());
    }

    fn consume_buffer(&mut self, nbytes: usize) -> usize {
        let size = self.pending().len().min(nbytes);
        self.buffer_sent += size;
        size
    }

    fn send_buffer(&mut self, down: &mut dyn StreamHandler) -> SendOutcome {
        let pending = self.buffer;
        let pending = &pending[self.buffer_sent..];
        if pending.is_empty() {
            return SendOutcome::Sent;
        }

        match down.on_data(pending) {
            DataAction::Consumed(n) => {
                self.buffer_sent += n;
                if self.is_buffer_empty() {
                    SendOutcome::Sent
                } else {
                    SendOutcome::Blocked
                }
            }
            DataAction::Closed => {
                self.downstream_closed = true;
                SendOutcome::Closed
            }
        }
    }

    fn feed(&mut self, src: &[u8], down: &mut dyn StreamHandler) -> DataAction {
        let mut total = 0;

        loop {
            if self.is_buffer_empty() && self.missing == 0 {
                if total == src.len() {
                    return DataAction::Consumed(total);
                }
                self.start_chunk(src.len() - total);
            }

            match self.send_buffer(down) {
                SendOutcome::Sent => {}
                SendOutcome::Blocked => return DataAction::Consumed(total),
                SendOutcome::Closed => return DataAction::Closed,
            }

            if self.missing == 0 {
                // the previous chunk's trailer went out; start over
                continue;
            }

            let rest = (src.len() - total).min(self.missing);
            if rest == 0 {
                return DataAction::Consumed(total);
            }

            match down.on_data(&src[total..total + rest]) {
                DataAction::Consumed(0) => return DataAction::Consumed(total),
                DataAction::Consumed(n) => {
                    total += n;
                    self.missing -= n;
                    if self.missing == 0 {
                        self.set_buffer(b"\r\n");
                    }
                    if n < rest {
                        return DataAction::Consumed(total);
                    }
                }
                DataAction::Closed => {
                    self.downstream_closed = true;
                    return DataAction::Closed;
                }
            }
        }
    }
}

struct Fwd<'a> {
    state: &'a mut ChunkState,
    down: &'a mut dyn StreamHandler,
}

impl StreamHandler for Fwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        if self.state.writing_buffer {
            return DataAction::Consumed(0);
        }

        self.state.feed(data, self.down)
    }

    fn on_eof(&mut self) {
        debug_assert_eq!(self.state.missing, 0);

        self.state.saw_eof = true;
        self.state.append_to_buffer(b"0\r\n\r\n");

        if let SendOutcome::Sent = self.state.send_buffer(self.down) {
            self.state.finished = true;
            self.down.on_eof();
        }
    }

    fn on_error(&mut self, error: Error) {
        self.state.saw_eof = true;
        self.state.finished = true;
        self.down.on_error(error);
    }
}

/// The chunked transfer encoder.
pub struct ChunkedStream<S> {
    input: Option<S>,
    state: ChunkState,
}

impl<S: Stream> ChunkedStream<S> {
    pub fn new(input: S) -> Self {
        ChunkedStream {
            input: Some(input),
            state: ChunkState::new(),
        }
    }
}

impl<S: Stream> Stream for ChunkedStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        if !partial {
            return None;
        }

        let mut result = self.state.pending().len() as u64;

        if let Some(input) = &self.input {
            if let Some(available) = input.available(true) {
                if available > 0 {
                    result += available;
                    if available >= self.state.missing as u64 {
                        // a new chunk header will be needed
                        result += 6;
                    }
                }
            }

            // EOF chunk
            result += 5;
        }

        Some(result)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        self.state.writing_buffer = true;
        let sent = self.state.send_buffer(handler);
        self.state.writing_buffer = false;

        match sent {
            SendOutcome::Sent => {}
            SendOutcome::Blocked => return ReadResult::Blocked,
            SendOutcome::Closed => return ReadResult::Closed,
        }

        let Some(input) = &mut self.input else {
            self.state.finished = true;
            handler.on_eof();
            return ReadResult::Done;
        };

        if self.state.is_buffer_empty() && self.state.missing == 0 {
            if let Some(available) = input.available(true) {
                if available > 0 {
                    self.state.start_chunk(available as usize);

                    self.state.writing_buffer = true;
                    let sent = self.state.send_buffer(handler);
                    self.state.writing_buffer = false;

                    match sent {
                        SendOutcome::Sent => {}
                        SendOutcome::Blocked => return ReadResult::Blocked,
                        SendOutcome::Closed => return ReadResult::Closed,
                    }
                }
            }
        }

        let result = input.read(&mut Fwd {
            state: &mut self.state,
            down: handler,
        });

        if self.state.saw_eof || result == ReadResult::Done {
            self.input = None;

            if self.state.finished {
                return ReadResult::Done;
            }
            if self.state.downstream_closed {
                return ReadResult::Closed;
            }
            // the EOF chunk is still queued; flushed on the next read()
            return ReadResult::Blocked;
        }

        result
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        let Some(input) = &mut self.input else {
            let pending = self.state.pending();
            if !pending.is_empty() {
                list.push(pending);
            }
            return Ok(());
        };

        if self.state.is_buffer_empty() && self.state.missing == 0 {
            if let Some(available) = input.available(true) {
                if available > 0 {
                    self.state.start_chunk(available as usize);
                }
            }
        }

        let missing = self.state.missing;
        let pending = &self.state.buffer[self.state.buffer_sent..];
        if !pending.is_empty() {
            list.push(pending);
        }

        if missing > 0 {
            let mut sub = BucketList::new();
            input.fill_buckets(&mut sub)?;

            let nbytes = list.splice_buffers_from(sub, missing, true);
            if nbytes >= missing {
                list.push(if list.has_more() {
                    &b"\r\n"[..]
                } else {
                    &b"\r\n0\r\n\r\n"[..]
                });
            }
        } else {
            list.set_more();
        }

        Ok(())
    }

    fn consume_buckets(&mut self, nbytes: usize) -> Consumed {
        let mut total = 0;
        let mut nbytes = nbytes;

        let size = self.state.consume_buffer(nbytes);
        nbytes -= size;
        total += size;

        let size = nbytes.min(self.state.missing);
        if size > 0 {
            let result = self
                .input
                .as_mut()
                .map(|input| input.consume_buckets(size))
                .unwrap_or_default();

            if result.eof {
                if let Some(mut input) = self.input.take() {
                    input.close();
                }
            }

            total += result.consumed;
            nbytes -= result.consumed;
            self.state.missing -= result.consumed;

            if self.state.missing == 0 {
                if self.input.is_some() {
                    self.state.set_buffer(b"\r\n");
                } else {
                    self.state.set_buffer(b"\r\n0\r\n\r\n");
                }

                let size = self.state.consume_buffer(nbytes);
                total += size;
            }
        }

        let eof =
            self.state.missing == 0 && self.state.is_buffer_empty() && self.input.is_none();
        Consumed::new(total, eof)
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        sink::{read_all, read_all_buckets},
        source::BytesStream,
        trickle::ByteStream,
    };

    const INPUT: &[u8] = b"foo_bar_0123456789abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn encodes_single_chunk() {
        let mut chunked = ChunkedStream::new(BytesStream::new(INPUT));
        assert!(chunked.available(true).unwrap() >= 44 + 6 + 5);

        let out = read_all(&mut chunked).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(b"2c\r\n");
        expected.extend_from_slice(INPUT);
        expected.extend_from_slice(b"\r\n0\r\n\r\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn encodes_via_buckets() {
        let mut chunked = ChunkedStream::new(BytesStream::new(INPUT));
        let out = read_all_buckets(&mut chunked).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"2c\r\n");
        expected.extend_from_slice(INPUT);
        expected.extend_from_slice(b"\r\n0\r\n\r\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn empty_input() {
        let mut chunked = ChunkedStream::new(BytesStream::new(&b""[..]));
        assert_eq!(read_all(&mut chunked).unwrap(), b"0\r\n\r\n");
    }

    #[test]
    fn survives_backpressure() {
        // a one-byte-per-push throttle below would reject most of each
        // chunk; the encoder must resume exactly where it stopped
        let chunked = ChunkedStream::new(BytesStream::new(&b"xy"[..]));
        let mut throttled = ByteStream::new(chunked);
        let out = read_all(&mut throttled).unwrap();
        assert_eq!(out, b"2\r\nxy\r\n0\r\n\r\n");
    }

    #[test]
    fn large_input_is_split() {
        let data = vec![b'a'; MAX_CHUNK_SIZE + 1];
        let mut chunked = ChunkedStream::new(BytesStream::new(data));
        let out = read_all(&mut chunked).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"8000\r\n");
        expected.extend_from_slice(&vec![b'a'; MAX_CHUNK_SIZE]);
        expected.extend_from_slice(b"\r\n1\r\na\r\n0\r\n\r\n");
        assert_eq!(out, expected);
    }
}
