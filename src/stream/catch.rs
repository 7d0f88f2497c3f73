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

//! A filter that intercepts errors from its input.
//!
//! The callback decides whether to rethrow (possibly transformed) or to
//! swallow the error.  A swallowed error must not break the byte contract:
//! if earlier `available()` calls promised data, the filter pads the
//! stream with spaces before reporting EOF.

use crate::{
    error::Error,
    stream::{DataAction, ReadResult, Stream, StreamHandler},
};
use std::cell::Cell;

const SPACES: [u8; 256] = [b' '; 256];

struct CatchState<F> {
    callback: F,

    /// The largest remaining length ever promised, minus what was
    /// delivered since.
    promised: Cell<u64>,

    /// Space padding still owed after a swallowed error.
    padding: u64,

    saw_eof: bool,
    finished: bool,
    downstream_closed: bool,
}

struct Fwd<'a, F> {
    state: &'a mut CatchState<F>,
    down: &'a mut dyn StreamHandler,
}

impl<F: FnMut(Error) -> Option<Error>> StreamHandler for Fwd<'_, F> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        match self.down.on_data(data) {
            DataAction::Consumed(n) => {
                let promised = self.state.promised.get();
                self.state.promised.set(promised.saturating_sub(n as u64));
                DataAction::Consumed(n)
            }
            DataAction::Closed => {
                self.state.downstream_closed = true;
                DataAction::Closed
            }
        }
    }

    fn on_eof(&mut self) {
        self.state.saw_eof = true;
        self.state.finished = true;
        self.down.on_eof();
    }

    fn on_error(&mut self, error: Error) {
        self.state.saw_eof = true;

        match (self.state.callback)(error) {
            Some(error) => {
                self.state.finished = true;
                self.down.on_error(error);
            }
            None => {
                // swallowed; honor the promised length with padding
                self.state.padding = self.state.promised.get();
                if self.state.padding == 0 {
                    self.state.finished = true;
                    self.down.on_eof();
                }
            }
        }
    }
}

/// The error-catch filter.
pub struct CatchStream<S, F> {
    input: Option<S>,
    state: CatchState<F>,
}

impl<S: Stream, F: FnMut(Error) -> Option<Error>> CatchStream<S, F> {
    pub fn new(input: S, callback: F) -> Self {
        CatchStream {
            input: Some(input),
            state: CatchState {
                callback,
                promised: Cell::new(0),
                padding: 0,
                saw_eof: false,
                finished: false,
                downstream_closed: false,
            },
        }
    }

    /// Push space padding; returns true when all of it went out.
    fn send_padding(&mut self, handler: &mut dyn StreamHandler) -> bool {
        while self.state.padding > 0 {
            let n = (self.state.padding as usize).min(SPACES.len());
            match handler.on_data(&SPACES[..n]) {
                DataAction::Consumed(0) => return false,
                DataAction::Consumed(n) => {
                    self.state.padding -= n as u64;
                }
                DataAction::Closed => {
                    self.state.downstream_closed = true;
                    return false;
                }
            }
        }

        true
    }
}

impl<S: Stream, F: FnMut(Error) -> Option<Error>> Stream for CatchStream<S, F> {
    fn available(&self, partial: bool) -> Option<u64> {
        if self.state.saw_eof {
            return Some(self.state.padding);
        }

        let available = self.input.as_ref().and_then(|i| i.available(partial));
        if let Some(n) = available {
            if n > self.state.promised.get() {
                self.state.promised.set(n);
            }
        }

        available
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if self.state.saw_eof {
            if !self.send_padding(handler) {
                return if self.state.downstream_closed {
                    ReadResult::Closed
                } else {
                    ReadResult::Blocked
                };
            }

            self.state.finished = true;
            handler.on_eof();
            return ReadResult::Done;
        }

        let Some(input) = &mut self.input else {
            handler.on_eof();
            return ReadResult::Done;
        };

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

            // a swallowed error left padding to deliver
            return self.read(handler);
        }

        result
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
        concat::ConcatStream,
        sink::read_all,
        source::{BytesStream, FailStream},
        Stream,
    };

    #[test]
    fn rethrow() {
        let inner = FailStream::new(Error::Message("inner".into()));
        let mut stream =
            CatchStream::new(inner, |e| Some(Error::Message(format!("wrapped: {e}"))));
        let error = read_all(&mut stream).unwrap_err();
        assert!(matches!(error, Error::Message(m) if m == "wrapped: inner"));
    }

    #[test]
    fn swallow_without_promise() {
        let inner = FailStream::new(Error::Message("inner".into()));
        let mut stream = CatchStream::new(inner, |_| None);
        assert_eq!(read_all(&mut stream).unwrap(), b"");
    }

    /// Promises bytes it will never deliver.
    struct PromiseThenFail(u64);

    impl Stream for PromiseThenFail {
        fn available(&self, _partial: bool) -> Option<u64> {
            Some(self.0)
        }

        fn read(&mut self, handler: &mut dyn crate::stream::StreamHandler) -> ReadResult {
            handler.on_error(Error::Message("broken promise".into()));
            ReadResult::Done
        }

        fn close(&mut self) {}
    }

    #[test]
    fn swallow_pads_promised_bytes() {
        let mut stream = CatchStream::new(PromiseThenFail(4), |_| None);
        assert_eq!(stream.available(false), Some(4));

        let out = read_all(&mut stream).unwrap();
        assert_eq!(out, b"    ");
    }

    #[test]
    fn swallow_after_partial_delivery() {
        let inner: Vec<Box<dyn Stream>> = vec![
            Box::new(BytesStream::new(&b"ok"[..])),
            Box::new(FailStream::new(Error::Message("inner".into()))),
        ];
        let inner = ConcatStream::new(inner);

        let mut stream = CatchStream::new(inner, |_| None);
        // a fail stream reports unknown length, so only the delivered
        // part was ever promised
        assert_eq!(stream.available(true), Some(2));

        let out = read_all(&mut stream).unwrap();
        assert_eq!(out, b"ok");
    }
}
