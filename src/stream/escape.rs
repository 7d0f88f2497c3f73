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

//! A filter replacing single characters with escape entities.

use crate::{
    error::Error,
    stream::{DataAction, ReadResult, Stream, StreamHandler},
};
use std::borrow::Cow;

/// A table of characters needing replacement.
pub trait EscapeClass {
    /// Position of the next character in `src` that needs escaping.
    fn find(&self, src: &[u8]) -> Option<usize>;

    /// The replacement text for one character.
    fn entity(&self, ch: u8) -> Cow<'static, str>;
}

/// HTML entity escaping for `< > & " '`.
#[derive(Default, Clone, Copy)]
pub struct HtmlEscape;

impl EscapeClass for HtmlEscape {
    fn find(&self, src: &[u8]) -> Option<usize> {
        src.iter()
            .position(|ch| matches!(ch, b'<' | b'>' | b'&' | b'"' | b'\''))
    }

    fn entity(&self, ch: u8) -> Cow<'static, str> {
        Cow::Borrowed(match ch {
            b'<' => "&lt;",
            b'>' => "&gt;",
            b'&' => "&amp;",
            b'"' => "&quot;",
            b'\'' => "&apos;",
            _ => "",
        })
    }
}

/// Percent-encoding of everything outside the URI "unreserved" set.
#[derive(Default, Clone, Copy)]
pub struct UriEscape;

fn is_uri_unreserved(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, b'-' | b'.' | b'_' | b'~')
}

impl EscapeClass for UriEscape {
    fn find(&self, src: &[u8]) -> Option<usize> {
        src.iter().position(|&ch| !is_uri_unreserved(ch))
    }

    fn entity(&self, ch: u8) -> Cow<'static, str> {
        Cow::Owned(format!("%{ch:02X}"))
    }
}

struct EscapeState<C> {
    class: C,

    /// The pending entity; must be delivered before any further input.
    escaped: Vec<u8>,
    escaped_sent: usize,

    saw_eof: bool,
    finished: bool,
    downstream_closed: bool,
}

impl<C: EscapeClass> EscapeState<C> {
    fn pending(&self) -> &[u8] {
        &self.escaped[self.escaped_sent..]
    }

    /// Returns false when the entity could not be fully delivered.
    fn send_escaped(&mut self, down: &mut dyn StreamHandler) -> bool {
        if self.pending().is_empty() {
            return true;
        }

        let pending = self.escaped[self.escaped_sent..].to_vec();
        match down.on_data(&pending) {
            DataAction::Consumed(n) => {
                self.escaped_sent += n;
                self.pending().is_empty()
            }
            DataAction::Closed => {
                self.downstream_closed = true;
                false
            }
        }
    }

    fn feed(&mut self, src: &[u8], down: &mut dyn StreamHandler) -> DataAction {
        if !self.send_escaped(down) {
            if self.downstream_closed {
                return DataAction::Closed;
            }
            return DataAction::Consumed(0);
        }

        let mut data = src;
        let mut total = 0;

        loop {
            match self.class.find(data) {
                None => {
                    // no control character: forward the whole block
                    if !data.is_empty() {
                        match down.on_data(data) {
                            DataAction::Consumed(n) => total += n,
                            DataAction::Closed => {
                                self.downstream_closed = true;
                                return DataAction::Closed;
                            }
                        }
                    }
                    break;
                }
                Some(control) => {
                    if control > 0 {
                        match down.on_data(&data[..control]) {
                            DataAction::Consumed(n) => {
                                total += n;
                                if n < control {
                                    break;
                                }
                            }
                            DataAction::Closed => {
                                self.downstream_closed = true;
                                return DataAction::Closed;
                            }
                        }
                    }

                    // the control character itself is consumed now
                    let ch = data[control];
                    data = &data[control + 1..];
                    total += 1;

                    self.escaped = self.class.entity(ch).as_bytes().to_vec();
                    self.escaped_sent = 0;

                    if !self.send_escaped(down) {
                        if self.downstream_closed {
                            return DataAction::Closed;
                        }
                        break;
                    }
                }
            }

            if data.is_empty() {
                break;
            }
        }

        DataAction::Consumed(total)
    }
}

struct Fwd<'a, C> {
    state: &'a mut EscapeState<C>,
    down: &'a mut dyn StreamHandler,
}

impl<C: EscapeClass> StreamHandler for Fwd<'_, C> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.state.feed(data, self.down)
    }

    fn on_eof(&mut self) {
        self.state.saw_eof = true;

        if self.state.pending().is_empty() {
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

/// The escaping filter.
pub struct EscapeStream<S, C> {
    input: Option<S>,
    state: EscapeState<C>,
}

impl<S: Stream, C: EscapeClass> EscapeStream<S, C> {
    pub fn new(input: S, class: C) -> Self {
        EscapeStream {
            input: Some(input),
            state: EscapeState {
                class,
                escaped: Vec::new(),
                escaped_sent: 0,
                saw_eof: false,
                finished: false,
                downstream_closed: false,
            },
        }
    }
}

impl<S: Stream, C: EscapeClass> Stream for EscapeStream<S, C> {
    fn available(&self, partial: bool) -> Option<u64> {
        let pending = self.state.pending().len() as u64;

        match &self.input {
            None => Some(pending),
            Some(input) if partial => input.available(true).map(|n| n + pending),
            Some(_) => None,
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if !self.state.send_escaped(handler) {
            return if self.state.downstream_closed {
                ReadResult::Closed
            } else {
                ReadResult::Blocked
            };
        }

        let Some(input) = &mut self.input else {
            self.state.finished = true;
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
            // pending entity flushed on the next read()
            return ReadResult::Blocked;
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
    use crate::stream::{sink::read_all, source::BytesStream, trickle::ByteStream};

    #[test]
    fn html_escape() {
        let input = &b"test<foo&bar>test\"test'"[..];
        let mut stream = EscapeStream::new(BytesStream::new(input), HtmlEscape);
        let out = read_all(&mut stream).unwrap();
        assert_eq!(out, b"test&lt;foo&amp;bar&gt;test&quot;test&apos;");
    }

    #[test]
    fn html_escape_under_backpressure() {
        let input = &b"a<b"[..];
        let escape = EscapeStream::new(BytesStream::new(input), HtmlEscape);
        let mut throttled = ByteStream::new(escape);
        let out = read_all(&mut throttled).unwrap();
        assert_eq!(out, b"a&lt;b");
    }

    #[test]
    fn uri_escape() {
        let input = &b"a b/c"[..];
        let mut stream = EscapeStream::new(BytesStream::new(input), UriEscape);
        let out = read_all(&mut stream).unwrap();
        assert_eq!(out, b"a%20b%2Fc");
    }

    #[test]
    fn no_controls_passes_through() {
        let mut stream = EscapeStream::new(BytesStream::new(&b"plain"[..]), HtmlEscape);
        assert_eq!(read_all(&mut stream).unwrap(), b"plain");
    }
}
