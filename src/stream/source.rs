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

//! Elementary source streams: in-memory bytes, the empty stream, the
//! failing stream and the growing-buffer adapter.

use crate::{
    buffer::GrowingBuffer,
    error::{Error, Result},
    stream::{BucketList, Consumed, DataAction, ReadResult, Stream, StreamHandler},
};
use bytes::Bytes;

/// A stream over an in-memory byte sequence.  Push mode emits the whole
/// remainder in one call; pull mode yields a single bucket.
pub struct BytesStream {
    data: Bytes,
}

impl BytesStream {
    pub fn new(data: impl Into<Bytes>) -> Self {
        BytesStream { data: data.into() }
    }
}

impl Stream for BytesStream {
    fn available(&self, _partial: bool) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        let n = (n as usize).min(self.data.len());
        let _ = self.data.split_to(n);
        Some(n as u64)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if !self.data.is_empty() {
            match handler.on_data(&self.data) {
                DataAction::Consumed(n) => {
                    let _ = self.data.split_to(n);
                    if !self.data.is_empty() {
                        return ReadResult::Blocked;
                    }
                }
                DataAction::Closed => return ReadResult::Closed,
            }
        }

        handler.on_eof();
        ReadResult::Done
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        if !self.data.is_empty() {
            list.push(&self.data[..]);
        }
        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        let n = n.min(self.data.len());
        let _ = self.data.split_to(n);
        Consumed::new(n, self.data.is_empty())
    }

    fn close(&mut self) {
        self.data = Bytes::new();
    }
}

/// Convenience constructor for a static-string stream.
pub fn string_stream(s: &'static str) -> BytesStream {
    BytesStream::new(Bytes::from_static(s.as_bytes()))
}

/// A stream that is empty from the start.
#[derive(Default)]
pub struct NullStream;

impl Stream for NullStream {
    fn available(&self, _partial: bool) -> Option<u64> {
        Some(0)
    }

    fn skip(&mut self, _n: u64) -> Option<u64> {
        Some(0)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        handler.on_eof();
        ReadResult::Done
    }

    fn fill_buckets<'a>(&'a mut self, _list: &mut BucketList<'a>) -> Result<()> {
        Ok(())
    }

    fn consume_buckets(&mut self, _n: usize) -> Consumed {
        Consumed::new(0, true)
    }

    fn close(&mut self) {}
}

/// A stream that fails with a stored error on first use.
pub struct FailStream {
    error: Option<Error>,
}

impl FailStream {
    pub fn new(error: Error) -> Self {
        FailStream { error: Some(error) }
    }

    fn take(&mut self) -> Error {
        self.error
            .take()
            .unwrap_or_else(|| Error::Message("stream already failed".into()))
    }
}

impl Stream for FailStream {
    fn available(&self, _partial: bool) -> Option<u64> {
        None
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        let error = self.take();
        handler.on_error(error);
        ReadResult::Done
    }

    fn fill_buckets<'a>(&'a mut self, _list: &mut BucketList<'a>) -> Result<()> {
        Err(self.take())
    }

    fn close(&mut self) {
        self.error = None;
    }
}

/// A stream draining a [`GrowingBuffer`].
pub struct GrowingBufferStream {
    buffer: GrowingBuffer,
}

impl GrowingBufferStream {
    pub fn new(buffer: GrowingBuffer) -> Self {
        GrowingBufferStream { buffer }
    }
}

impl Stream for GrowingBufferStream {
    fn available(&self, _partial: bool) -> Option<u64> {
        Some(self.buffer.size() as u64)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        let n = (n as usize).min(self.buffer.size());
        self.buffer.skip(n);
        Some(n as u64)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        loop {
            let span = self.buffer.read();
            if span.is_empty() {
                handler.on_eof();
                return ReadResult::Done;
            }

            match handler.on_data(span) {
                DataAction::Consumed(n) => {
                    let blocked = n < span.len();
                    self.buffer.consume(n);
                    if blocked {
                        return ReadResult::Blocked;
                    }
                }
                DataAction::Closed => return ReadResult::Closed,
            }
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        self.buffer.fill_buckets(list);
        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        let n = self.buffer.consume_buckets(n);
        Consumed::new(n, self.buffer.is_empty())
    }

    fn close(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sink::VecSink;

    #[test]
    fn bytes_stream_push() {
        let mut stream = BytesStream::new(&b"foobar"[..]);
        assert_eq!(stream.available(false), Some(6));

        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"foobar");
        assert!(sink.is_eof());
    }

    #[test]
    fn bytes_stream_buckets() {
        let mut stream = BytesStream::new(&b"foobar"[..]);

        let mut list = BucketList::new();
        stream.fill_buckets(&mut list).unwrap();
        assert!(!list.has_more());
        assert_eq!(list.total_size(), 6);
        drop(list);

        assert_eq!(stream.consume_buckets(3), Consumed::new(3, false));
        assert_eq!(stream.consume_buckets(3), Consumed::new(3, true));
    }

    #[test]
    fn null_stream_is_empty() {
        let mut stream = NullStream;
        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert!(sink.is_eof());
        assert!(sink.data().is_empty());
    }

    #[test]
    fn fail_stream_reports_error() {
        let mut stream = FailStream::new(Error::Message("boom".into()));
        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert!(matches!(sink.take_error(), Some(Error::Message(m)) if m == "boom"));
    }

    #[test]
    fn growing_buffer_stream_roundtrip() {
        let mut gb = GrowingBuffer::with_chunk_size(4);
        gb.write(b"spanning multiple chunks");
        let mut stream = GrowingBufferStream::new(gb);

        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"spanning multiple chunks");
    }
}
