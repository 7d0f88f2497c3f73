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

//! Throttling filters that forward at most one or four bytes per push.
//! They exist to exercise backpressure edges in tests.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, DataAction, ReadResult, Stream, StreamHandler},
};

/// Forwards at most `N` bytes per push.
pub struct TrickleStream<S, const N: usize> {
    input: S,
}

/// One byte per push.
pub type ByteStream<S> = TrickleStream<S, 1>;

/// Four bytes per push.
pub type FourStream<S> = TrickleStream<S, 4>;

impl<S: Stream, const N: usize> TrickleStream<S, N> {
    pub fn new(input: S) -> Self {
        TrickleStream { input }
    }
}

struct Fwd<'a, const N: usize> {
    down: &'a mut dyn StreamHandler,
}

impl<const N: usize> StreamHandler for Fwd<'_, N> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        let take = data.len().min(N);
        self.down.on_data(&data[..take])
    }

    fn on_eof(&mut self) {
        self.down.on_eof();
    }

    fn on_error(&mut self, error: Error) {
        self.down.on_error(error);
    }
}

impl<S: Stream, const N: usize> Stream for TrickleStream<S, N> {
    fn available(&self, partial: bool) -> Option<u64> {
        self.input.available(partial)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        self.input.read(&mut Fwd::<N> { down: handler })
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        let mut sub = BucketList::new();
        self.input.fill_buckets(&mut sub)?;

        if sub.should_fallback() {
            list.set_more();
            list.enable_fallback();
            return Ok(());
        }

        let truncated = sub.has_more() || sub.total_size() > N;
        list.splice_buffers_from(sub, N, false);
        if truncated {
            list.set_more();
        }

        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        self.input.consume_buckets(n.min(N))
    }

    fn close(&mut self) {
        self.input.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{sink::read_all_buckets, source::BytesStream, DataAction, StreamHandler};

    /// Collects and records the size of every push.
    #[derive(Default)]
    struct ChunkRecorder {
        chunks: Vec<Vec<u8>>,
        eof: bool,
    }

    impl StreamHandler for ChunkRecorder {
        fn on_data(&mut self, data: &[u8]) -> DataAction {
            self.chunks.push(data.to_vec());
            DataAction::Consumed(data.len())
        }

        fn on_eof(&mut self) {
            self.eof = true;
        }

        fn on_error(&mut self, _error: Error) {}
    }

    fn drain<S: Stream>(stream: &mut S, sink: &mut ChunkRecorder) {
        loop {
            match stream.read(sink) {
                ReadResult::Done => return,
                ReadResult::Blocked => continue,
                other => panic!("unexpected read result: {other:?}"),
            }
        }
    }

    #[test]
    fn one_byte_per_push() {
        let mut stream = ByteStream::new(BytesStream::new(&b"abc"[..]));
        let mut sink = ChunkRecorder::default();
        drain(&mut stream, &mut sink);
        assert!(sink.eof);
        assert_eq!(sink.chunks, [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn four_bytes_per_push() {
        let mut stream = FourStream::new(BytesStream::new(&b"abcdef"[..]));
        let mut sink = ChunkRecorder::default();
        drain(&mut stream, &mut sink);
        assert_eq!(sink.chunks, [b"abcd".to_vec(), b"ef".to_vec()]);
    }

    #[test]
    fn bucket_mode_slices() {
        let mut stream = ByteStream::new(BytesStream::new(&b"abc"[..]));
        assert_eq!(read_all_buckets(&mut stream).unwrap(), b"abc");
    }
}
