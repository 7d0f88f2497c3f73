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

//! A filter that truncates its input to a fixed number of bytes.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, DataAction, FdMask, ReadResult, Stream, StreamHandler},
};

#[cfg(unix)]
use crate::stream::{DirectAction, FdKind};
#[cfg(unix)]
use std::os::fd::BorrowedFd;

/// Truncates the input stream after `rest` bytes.  With `authoritative`
/// set, the remaining length is reported as exactly `rest` regardless of
/// what the input claims.
pub struct HeadStream<S> {
    input: S,
    rest: u64,
    authoritative: bool,
}

impl<S: Stream> HeadStream<S> {
    pub fn new(input: S, size: u64, authoritative: bool) -> Self {
        HeadStream {
            input,
            rest: size,
            authoritative,
        }
    }
}

struct Fwd<'a> {
    rest: &'a mut u64,
    down: &'a mut dyn StreamHandler,

    /// Set when EOF or an error has been delivered downstream.
    finished: &'a mut bool,
}

impl StreamHandler for Fwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        if *self.rest == 0 {
            *self.finished = true;
            self.down.on_eof();
            return DataAction::Closed;
        }

        let take = data.len().min(*self.rest as usize);
        match self.down.on_data(&data[..take]) {
            DataAction::Consumed(n) => {
                debug_assert!(n as u64 <= *self.rest);
                *self.rest -= n as u64;
                if *self.rest == 0 {
                    *self.finished = true;
                    self.down.on_eof();
                    return DataAction::Closed;
                }
                DataAction::Consumed(n)
            }
            DataAction::Closed => DataAction::Closed,
        }
    }

    #[cfg(unix)]
    fn on_direct(
        &mut self, kind: FdKind, fd: BorrowedFd<'_>, max: usize, then_eof: bool,
    ) -> DirectAction {
        if *self.rest == 0 {
            *self.finished = true;
            self.down.on_eof();
            return DirectAction::Closed;
        }

        let mut max = max;
        let mut then_eof = then_eof;
        if max as u64 > *self.rest {
            max = *self.rest as usize;
            then_eof = true;
        }

        match self.down.on_direct(kind, fd, max, then_eof) {
            DirectAction::Consumed(n) => {
                *self.rest -= n as u64;
                if *self.rest == 0 {
                    *self.finished = true;
                    self.down.on_eof();
                    return DirectAction::Closed;
                }
                DirectAction::Consumed(n)
            }
            other => other,
        }
    }

    fn on_eof(&mut self) {
        *self.finished = true;
        self.down.on_eof();
    }

    fn on_error(&mut self, error: Error) {
        *self.finished = true;
        self.down.on_error(error);
    }
}

impl<S: Stream> Stream for HeadStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        if self.authoritative {
            return Some(self.rest);
        }

        self.input.available(partial).map(|n| n.min(self.rest))
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        let n = n.min(self.rest);
        let skipped = self.input.skip(n)?;
        debug_assert!(skipped <= n);
        self.rest -= skipped;
        Some(skipped)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if self.rest == 0 {
            self.input.close();
            handler.on_eof();
            return ReadResult::Done;
        }

        let mut finished = false;
        let result = self.input.read(&mut Fwd {
            rest: &mut self.rest,
            down: handler,
            finished: &mut finished,
        });

        if finished {
            if result == ReadResult::Closed {
                // we stopped the input, not the other way around
                self.input.close();
            }
            return ReadResult::Done;
        }

        result
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        if self.rest == 0 {
            return Ok(());
        }

        let mut sub = BucketList::new();
        self.input.fill_buckets(&mut sub)?;

        let sub_more = sub.has_more();
        let sub_fallback = sub.should_fallback();
        let nbytes = list.splice_buffers_from(sub, self.rest as usize, false);

        if (nbytes as u64) < self.rest && sub_more {
            list.set_more();
            if sub_fallback {
                list.enable_fallback();
            }
        }

        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        let n = (n as u64).min(self.rest) as usize;
        let result = self.input.consume_buckets(n);
        debug_assert!(result.consumed <= n);
        self.rest -= result.consumed as u64;
        Consumed::new(result.consumed, result.eof || self.rest == 0)
    }

    fn set_direct(&mut self, mask: FdMask) {
        self.input.set_direct(mask);
    }

    fn consume_direct(&mut self, n: usize) {
        debug_assert!(n as u64 <= self.rest);
        self.rest -= n as u64;
        self.input.consume_direct(n);
    }

    fn close(&mut self) {
        self.input.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        sink::{read_all, read_all_buckets},
        source::BytesStream,
    };

    #[test]
    fn truncates_push() {
        let mut head = HeadStream::new(BytesStream::new(&b"0123456789"[..]), 4, false);
        assert_eq!(head.available(false), Some(4));
        assert_eq!(read_all(&mut head).unwrap(), b"0123");
    }

    #[test]
    fn truncates_buckets() {
        let mut head = HeadStream::new(BytesStream::new(&b"0123456789"[..]), 4, false);
        assert_eq!(read_all_buckets(&mut head).unwrap(), b"0123");
    }

    #[test]
    fn authoritative_available() {
        let head = HeadStream::new(BytesStream::new(&b"01"[..]), 10, true);
        assert_eq!(head.available(false), Some(10));
    }

    #[test]
    fn longer_than_input() {
        let mut head = HeadStream::new(BytesStream::new(&b"xy"[..]), 10, false);
        assert_eq!(read_all(&mut head).unwrap(), b"xy");
    }
}
