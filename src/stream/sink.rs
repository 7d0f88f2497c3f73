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

//! Terminal consumers: collecting sinks, the capped buffer sink, and the
//! blocking/discarding test sinks.

use crate::{
    buffer::GrowingBuffer,
    error::{Error, Result},
    stream::{BucketList, DataAction, ReadResult, Stream, StreamHandler},
};

/// A sink that collects everything into a `Vec<u8>` and remembers how the
/// stream ended.
#[derive(Default)]
pub struct VecSink {
    data: Vec<u8>,
    eof: bool,
    error: Option<Error>,
}

impl VecSink {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

impl StreamHandler for VecSink {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.data.extend_from_slice(data);
        DataAction::Consumed(data.len())
    }

    fn on_eof(&mut self) {
        self.eof = true;
    }

    fn on_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}

/// A sink that copies everything into a caller-owned [`GrowingBuffer`].
pub struct GrowingBufferSink {
    buffer: GrowingBuffer,
    eof: bool,
    error: Option<Error>,
}

impl GrowingBufferSink {
    pub fn new(buffer: GrowingBuffer) -> Self {
        GrowingBufferSink {
            buffer,
            eof: false,
            error: None,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub fn into_buffer(self) -> GrowingBuffer {
        self.buffer
    }
}

impl StreamHandler for GrowingBufferSink {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.buffer.write(data);
        DataAction::Consumed(data.len())
    }

    fn on_eof(&mut self) {
        self.eof = true;
    }

    fn on_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}

/// Outcome of a [`BufferSink`]; exactly one is reported.
#[derive(Debug)]
pub enum SinkOutcome {
    /// The stream ended and everything fit.
    Done(Vec<u8>),

    /// The backing allocation failed.
    OutOfMemory,

    /// The stream exceeded the configured size cap.
    TooLarge,

    /// The stream failed.
    Error(Error),
}

/// A sink accumulating into a size-capped buffer.
pub struct BufferSink {
    data: Vec<u8>,
    max_size: usize,
    outcome: Option<SinkOutcome>,
}

impl BufferSink {
    pub fn new(max_size: usize) -> Self {
        BufferSink {
            data: Vec::new(),
            max_size,
            outcome: None,
        }
    }

    /// The final outcome; only available after the stream has finished.
    pub fn into_outcome(mut self) -> Option<SinkOutcome> {
        self.outcome.take()
    }
}

impl StreamHandler for BufferSink {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        if self.outcome.is_some() {
            return DataAction::Closed;
        }

        if self.data.len() + data.len() > self.max_size {
            self.outcome = Some(SinkOutcome::TooLarge);
            return DataAction::Closed;
        }

        if self.data.try_reserve(data.len()).is_err() {
            self.outcome = Some(SinkOutcome::OutOfMemory);
            return DataAction::Closed;
        }

        self.data.extend_from_slice(data);
        DataAction::Consumed(data.len())
    }

    fn on_eof(&mut self) {
        if self.outcome.is_none() {
            self.outcome = Some(SinkOutcome::Done(std::mem::take(&mut self.data)));
        }
    }

    fn on_error(&mut self, error: Error) {
        if self.outcome.is_none() {
            self.outcome = Some(SinkOutcome::Error(error));
        }
    }
}

/// A sink that never accepts anything; for backpressure tests.
#[derive(Default)]
pub struct BlockSink {
    eof: bool,
    error: Option<Error>,
}

impl BlockSink {
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

impl StreamHandler for BlockSink {
    fn on_data(&mut self, _data: &[u8]) -> DataAction {
        DataAction::Consumed(0)
    }

    fn on_eof(&mut self) {
        self.eof = true;
    }

    fn on_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}

/// A sink that consumes and drops everything.
#[derive(Default)]
pub struct DiscardSink {
    consumed: u64,
    eof: bool,
}

impl DiscardSink {
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

impl StreamHandler for DiscardSink {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.consumed += data.len() as u64;
        DataAction::Consumed(data.len())
    }

    fn on_eof(&mut self) {
        self.eof = true;
    }

    fn on_error(&mut self, _error: Error) {}
}

/// Drain a stream completely in push mode.  Intended for pipelines whose
/// sources never suspend; a stalling stream is reported as an error.
pub fn read_all(stream: &mut dyn Stream) -> Result<Vec<u8>> {
    let mut sink = VecSink::default();

    loop {
        match stream.read(&mut sink) {
            ReadResult::Done => {
                return match sink.take_error() {
                    Some(error) => Err(error),
                    None => Ok(sink.into_data()),
                };
            }
            // the sink always consumes, so this can only be a producer
            // that hands out less than asked; reading again progresses
            ReadResult::Blocked => continue,
            ReadResult::Pending => {
                return Err(Error::Message("stream stalled while draining".into()));
            }
            ReadResult::Closed => {
                return Err(Error::Message("stream closed while draining".into()));
            }
        }
    }
}

/// Drain a stream in pull mode, reverting to push mode when the stream
/// requests fallback.  Verifies that both protocols observe the same byte
/// sequence.
pub fn read_all_buckets(stream: &mut dyn Stream) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    loop {
        let mut list = BucketList::new();
        stream.fill_buckets(&mut list)?;

        let fallback = list.should_fallback();
        let more = list.has_more();
        let total = list.total_size();
        for bucket in list.iter() {
            out.extend_from_slice(bucket.buffer());
        }
        drop(list);

        if total > 0 {
            let consumed = stream.consume_buckets(total);
            if consumed.eof {
                return Ok(out);
            }
        } else if !more {
            return Ok(out);
        }

        if fallback {
            out.extend(read_all(stream)?);
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::source::BytesStream;

    #[test]
    fn buffer_sink_too_large() {
        let mut stream = BytesStream::new(&b"0123456789"[..]);
        let mut sink = BufferSink::new(4);
        let result = stream.read(&mut sink);
        assert_eq!(result, ReadResult::Closed);
        assert!(matches!(sink.into_outcome(), Some(SinkOutcome::TooLarge)));
    }

    #[test]
    fn buffer_sink_done() {
        let mut stream = BytesStream::new(&b"0123"[..]);
        let mut sink = BufferSink::new(4);
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        match sink.into_outcome() {
            Some(SinkOutcome::Done(data)) => assert_eq!(data, b"0123"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn block_sink_blocks() {
        let mut stream = BytesStream::new(&b"abc"[..]);
        let mut sink = BlockSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Blocked);
        assert!(!sink.is_eof());
    }
}
