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

//! Serial concatenation of several input streams.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, DataAction, FdMask, ReadResult, Stream, StreamHandler},
};
use std::collections::VecDeque;

#[cfg(unix)]
use crate::stream::{DirectAction, FdKind};
#[cfg(unix)]
use std::os::fd::{BorrowedFd, OwnedFd};

/// Concatenates its inputs; only the current (front) input may deliver
/// data.
pub struct ConcatStream {
    inputs: VecDeque<Box<dyn Stream>>,
    direct_mask: FdMask,
}

impl ConcatStream {
    pub fn new(inputs: impl IntoIterator<Item = Box<dyn Stream>>) -> Self {
        ConcatStream {
            inputs: inputs.into_iter().collect(),
            direct_mask: FdMask::NONE,
        }
    }

    /// Append another input after the existing ones.
    pub fn append(&mut self, mut input: Box<dyn Stream>) {
        input.set_direct(self.direct_mask);
        self.inputs.push_back(input);
    }

    fn close_all(&mut self) {
        for mut input in self.inputs.drain(..) {
            input.close();
        }
    }
}

struct Fwd<'a> {
    down: &'a mut dyn StreamHandler,
    is_last: bool,
    saw_eof: &'a mut bool,
    error: &'a mut Option<Error>,
}

impl StreamHandler for Fwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.down.on_data(data)
    }

    #[cfg(unix)]
    fn on_direct(
        &mut self, kind: FdKind, fd: BorrowedFd<'_>, max: usize, then_eof: bool,
    ) -> DirectAction {
        self.down.on_direct(kind, fd, max, then_eof && self.is_last)
    }

    fn on_eof(&mut self) {
        *self.saw_eof = true;
    }

    fn on_error(&mut self, error: Error) {
        *self.error = Some(error);
    }
}

impl Stream for ConcatStream {
    fn available(&self, partial: bool) -> Option<u64> {
        let mut total = 0;

        for input in &self.inputs {
            match input.available(partial) {
                Some(n) => total += n,
                None if partial => {}
                None => return None,
            }
        }

        Some(total)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        match self.inputs.front_mut() {
            Some(input) => input.skip(n),
            None => Some(0),
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        loop {
            let is_last = self.inputs.len() == 1;
            let Some(front) = self.inputs.front_mut() else {
                handler.on_eof();
                return ReadResult::Done;
            };

            let mut saw_eof = false;
            let mut error = None;
            let result = front.read(&mut Fwd {
                down: handler,
                is_last,
                saw_eof: &mut saw_eof,
                error: &mut error,
            });

            if let Some(error) = error {
                self.inputs.pop_front();
                self.close_all();
                handler.on_error(error);
                return ReadResult::Done;
            }

            if saw_eof {
                self.inputs.pop_front();
                continue;
            }

            return result;
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        for input in self.inputs.iter_mut() {
            input.fill_buckets(list)?;

            if list.has_more() || list.should_fallback() {
                break;
            }
        }

        Ok(())
    }

    fn consume_buckets(&mut self, mut nbytes: usize) -> Consumed {
        let mut total = 0;

        while nbytes > 0 {
            let Some(front) = self.inputs.front_mut() else {
                break;
            };

            let result = front.consume_buckets(nbytes);
            total += result.consumed;
            nbytes -= result.consumed;

            if result.eof {
                if let Some(mut input) = self.inputs.pop_front() {
                    input.close();
                }
                continue;
            }

            if result.consumed == 0 {
                break;
            }
        }

        Consumed::new(total, self.inputs.is_empty())
    }

    fn set_direct(&mut self, mask: FdMask) {
        self.direct_mask = mask;
        for input in self.inputs.iter_mut() {
            input.set_direct(mask);
        }
    }

    fn consume_direct(&mut self, n: usize) {
        if let Some(front) = self.inputs.front_mut() {
            front.consume_direct(n);
        }
    }

    #[cfg(unix)]
    fn as_fd(&mut self) -> Option<OwnedFd> {
        // only safe when the remaining content is exactly the last input
        if self.inputs.len() != 1 {
            return None;
        }

        let fd = self.inputs.front_mut().unwrap().as_fd();
        if fd.is_some() {
            self.inputs.clear();
        }

        fd
    }

    fn close(&mut self) {
        self.close_all();
    }
}
