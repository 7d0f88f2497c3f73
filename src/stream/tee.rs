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

//! One-to-many fan-out.
//!
//! Each output is a stream of its own.  An output that runs ahead of its
//! siblings remembers the surplus as `skip`; the input only sees bytes as
//! consumed once every remaining output has acknowledged them, so the
//! source never advances past the slowest consumer.

use crate::{
    error::{Error, Result},
    stream::{BucketList, DataAction, ReadResult, Stream, StreamHandler},
};
use std::{cell::RefCell, rc::Rc};

struct OutputState {
    /// Absolute offset of bytes this output has received.
    offset: u64,
    alive: bool,

    /// A weak output does not keep the tee alive on its own.
    weak: bool,
}

struct Shared {
    input: Option<Box<dyn Stream>>,

    /// Absolute offset the input has been advanced to; always the
    /// minimum of the live outputs' offsets.
    master: u64,

    outputs: Vec<OutputState>,
    input_eof: bool,
    error_text: Option<String>,
}

impl Shared {
    fn min_alive_offset(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.alive)
            .map(|o| o.offset)
            .min()
            .unwrap_or(self.master)
    }

    fn has_strong_output(&self) -> bool {
        self.outputs.iter().any(|o| o.alive && !o.weak)
    }
}

/// Builder for a tee; create the outputs, then drop it.
pub struct Tee {
    shared: Rc<RefCell<Shared>>,
}

impl Tee {
    pub fn new(input: Box<dyn Stream>) -> Self {
        Tee {
            shared: Rc::new(RefCell::new(Shared {
                input: Some(input),
                master: 0,
                outputs: Vec::new(),
                input_eof: false,
                error_text: None,
            })),
        }
    }

    /// Create another output.  Weak outputs are torn down once all
    /// strong outputs are gone.
    pub fn output(&mut self, weak: bool) -> TeeOutput {
        let mut shared = self.shared.borrow_mut();
        let index = shared.outputs.len();
        let offset = shared.master;
        shared.outputs.push(OutputState {
            offset,
            alive: true,
            weak,
        });

        TeeOutput {
            shared: self.shared.clone(),
            index,
            finished: false,
        }
    }
}

/// Push adapter between the shared input and the currently reading
/// output.
struct Fill<'a> {
    shared: &'a Rc<RefCell<Shared>>,
    index: usize,
    down: &'a mut dyn StreamHandler,
}

impl StreamHandler for Fill<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        // bytes [master, master+len) are on offer; skip what this output
        // has already seen
        let (master, my_offset) = {
            let shared = self.shared.borrow();
            (shared.master, shared.outputs[self.index].offset)
        };

        let skip = (my_offset - master) as usize;
        let mut delivered = 0;

        if skip < data.len() {
            match self.down.on_data(&data[skip..]) {
                DataAction::Consumed(n) => delivered = n,
                DataAction::Closed => return DataAction::Closed,
            }
        }

        let mut shared = self.shared.borrow_mut();
        shared.outputs[self.index].offset += delivered as u64;

        let advance = shared.min_alive_offset() - shared.master;
        shared.master += advance;
        DataAction::Consumed(advance as usize)
    }

    fn on_eof(&mut self) {
        self.shared.borrow_mut().input_eof = true;
    }

    fn on_error(&mut self, error: Error) {
        self.shared.borrow_mut().error_text = Some(error.to_string());
    }
}

/// One output of a [`Tee`].
pub struct TeeOutput {
    shared: Rc<RefCell<Shared>>,
    index: usize,
    finished: bool,
}

impl Stream for TeeOutput {
    fn available(&self, partial: bool) -> Option<u64> {
        let shared = self.shared.borrow();
        let ahead = shared.outputs[self.index].offset - shared.master;

        match &shared.input {
            Some(input) => input
                .available(partial)
                .map(|n| n.saturating_sub(ahead)),
            None => Some(0),
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        debug_assert!(!self.finished);

        loop {
            let mut shared = self.shared.borrow_mut();

            if let Some(text) = &shared.error_text {
                let error = Error::Message(text.clone());
                drop(shared);
                self.finished = true;
                handler.on_error(error);
                return ReadResult::Done;
            }

            if shared.input_eof {
                drop(shared);
                self.finished = true;
                handler.on_eof();
                return ReadResult::Done;
            }

            let Some(mut input) = shared.input.take() else {
                // the input is gone without an EOF: the tee was aborted
                drop(shared);
                self.finished = true;
                handler.on_error(Error::Message("stream fan-out aborted".into()));
                return ReadResult::Done;
            };
            drop(shared);

            let result = input.read(&mut Fill {
                shared: &self.shared,
                index: self.index,
                down: handler,
            });

            let mut shared = self.shared.borrow_mut();
            match result {
                ReadResult::Done => {
                    // input reported eof or error; loop to deliver it
                    continue;
                }
                ReadResult::Closed => {
                    // this output's handler closed; siblings keep going
                    shared.input = Some(input);
                    return ReadResult::Closed;
                }
                other => {
                    shared.input = Some(input);
                    return other;
                }
            }
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        list.set_more();
        list.enable_fallback();
        Ok(())
    }

    fn close(&mut self) {
        self.finished = true;

        let mut shared = self.shared.borrow_mut();
        if !shared.outputs[self.index].alive {
            return;
        }

        shared.outputs[self.index].alive = false;

        // a closed laggard may unblock its siblings
        let advance = shared.min_alive_offset().saturating_sub(shared.master);
        shared.master += advance;

        if !shared.has_strong_output() {
            if let Some(mut input) = shared.input.take() {
                drop(shared);
                input.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        sink::VecSink,
        source::BytesStream,
        {DataAction, StreamHandler},
    };

    /// Refuses data for the first `refusals` calls.
    #[derive(Default)]
    struct ReluctantSink {
        refusals: usize,
        data: Vec<u8>,
        eof: bool,
    }

    impl StreamHandler for ReluctantSink {
        fn on_data(&mut self, data: &[u8]) -> DataAction {
            if self.refusals > 0 {
                self.refusals -= 1;
                return DataAction::Consumed(0);
            }

            self.data.extend_from_slice(data);
            DataAction::Consumed(data.len())
        }

        fn on_eof(&mut self) {
            self.eof = true;
        }

        fn on_error(&mut self, _error: Error) {}
    }

    #[test]
    fn fan_out_with_slow_output() {
        let mut tee = Tee::new(Box::new(BytesStream::new(&b"hello"[..])));
        let mut out1 = tee.output(false);
        let mut out2 = tee.output(false);

        let mut sink1 = VecSink::default();
        let mut sink2 = ReluctantSink {
            refusals: 3,
            ..Default::default()
        };

        // the fast output runs ahead; the input cursor must wait for
        // the slow one
        assert_eq!(out1.read(&mut sink1), ReadResult::Blocked);
        assert_eq!(sink1.data(), b"hello");

        for _ in 0..3 {
            let result = out2.read(&mut sink2);
            assert_eq!(result, ReadResult::Blocked);
            assert!(sink2.data.is_empty());
        }

        assert_eq!(out2.read(&mut sink2), ReadResult::Done);
        assert_eq!(sink2.data, b"hello");
        assert!(sink2.eof);

        assert_eq!(out1.read(&mut sink1), ReadResult::Done);
        assert!(sink1.is_eof());
    }

    #[test]
    fn closing_one_output_keeps_siblings() {
        let mut tee = Tee::new(Box::new(BytesStream::new(&b"data"[..])));
        let mut out1 = tee.output(false);
        let mut out2 = tee.output(false);

        out2.close();

        let mut sink = VecSink::default();
        assert_eq!(out1.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"data");
        assert!(sink.is_eof());
    }

    #[test]
    fn weak_output_does_not_keep_input() {
        let mut tee = Tee::new(Box::new(BytesStream::new(&b"data"[..])));
        let mut strong = tee.output(false);
        let mut weak = tee.output(true);

        strong.close();

        let mut sink = VecSink::default();
        // the input is gone; the weak output is aborted
        let result = weak.read(&mut sink);
        assert_eq!(result, ReadResult::Done);
        assert!(sink.take_error().is_some());
    }
}
