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

//! A filter wrapping a request body into FastCGI STDIN records.

use crate::{
    error::Error,
    fcgi::{RecordHeader, RecordType, HEADER_LEN, MAX_CONTENT},
    stream::{DataAction, ReadResult, Stream, StreamHandler},
};

enum SendOutcome {
    Sent,
    Blocked,
    Closed,
}

struct StdinState {
    request_id: u16,
    header: [u8; HEADER_LEN],
    header_sent: usize,

    /// Bytes still belonging to the current record's payload.
    missing: usize,

    saw_eof: bool,
    finished: bool,
    downstream_closed: bool,
}

impl StdinState {
    fn header_pending(&self) -> bool {
        self.header_sent < HEADER_LEN
    }

    fn start_record(&mut self, length: usize) {
        debug_assert_eq!(self.missing, 0);
        debug_assert!(!self.header_pending());

        let length = length.min(MAX_CONTENT);
        self.header =
            RecordHeader::new(RecordType::Stdin, self.request_id, length as u16).encode();
        self.header_sent = 0;
        self.missing = length;
    }

    fn write_header(&mut self, down: &mut dyn StreamHandler) -> SendOutcome {
        if !self.header_pending() {
            return SendOutcome::Sent;
        }

        let pending = self.header;
        match down.on_data(&pending[self.header_sent..]) {
            DataAction::Consumed(n) => {
                self.header_sent += n;
                if self.header_pending() {
                    SendOutcome::Blocked
                } else {
                    SendOutcome::Sent
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
            match self.write_header(down) {
                SendOutcome::Sent => {}
                SendOutcome::Blocked => return DataAction::Consumed(total),
                SendOutcome::Closed => return DataAction::Closed,
            }

            if self.missing > 0 {
                let rest = (src.len() - total).min(self.missing);
                if rest == 0 {
                    return DataAction::Consumed(total);
                }

                match down.on_data(&src[total..total + rest]) {
                    DataAction::Consumed(0) => return DataAction::Consumed(total),
                    DataAction::Consumed(n) => {
                        total += n;
                        self.missing -= n;
                        if self.missing > 0 {
                            // handler is blocking or ran out of data
                            return DataAction::Consumed(total);
                        }
                    }
                    DataAction::Closed => {
                        self.downstream_closed = true;
                        return DataAction::Closed;
                    }
                }
            }

            let rest = src.len() - total;
            if rest == 0 {
                return DataAction::Consumed(total);
            }

            self.start_record(rest);
        }
    }
}

struct Fwd<'a> {
    state: &'a mut StdinState,
    down: &'a mut dyn StreamHandler,
}

impl StreamHandler for Fwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.state.feed(data, self.down)
    }

    fn on_eof(&mut self) {
        debug_assert_eq!(self.state.missing, 0);

        self.state.saw_eof = true;

        // the empty STDIN record terminates the body
        if !self.state.header_pending() {
            self.state.start_record(0);
        }

        if let SendOutcome::Sent = self.state.write_header(self.down) {
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

/// Wraps `input` into STDIN records addressed to `request_id`, followed
/// by the empty terminator record.
pub struct FcgiStdinStream<S> {
    input: Option<S>,
    state: StdinState,
}

impl<S: Stream> FcgiStdinStream<S> {
    pub fn new(input: S, request_id: u16) -> Self {
        FcgiStdinStream {
            input: Some(input),
            state: StdinState {
                request_id,
                header: [0; HEADER_LEN],
                header_sent: HEADER_LEN,
                missing: 0,
                saw_eof: false,
                finished: false,
                downstream_closed: false,
            },
        }
    }
}

impl<S: Stream> Stream for FcgiStdinStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        if !partial {
            return None;
        }

        let pending = (HEADER_LEN - self.state.header_sent.min(HEADER_LEN)) as u64;
        match &self.input {
            Some(input) => input.available(true).map(|n| n + pending),
            None => Some(pending),
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        match self.state.write_header(handler) {
            SendOutcome::Sent => {}
            SendOutcome::Blocked => return ReadResult::Blocked,
            SendOutcome::Closed => return ReadResult::Closed,
        }

        let Some(input) = &mut self.input else {
            self.state.finished = true;
            handler.on_eof();
            return ReadResult::Done;
        };

        if self.state.missing == 0 {
            if let Some(available) = input.available(true) {
                if available > 0 {
                    self.state.start_record(available as usize);

                    match self.state.write_header(handler) {
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
            if let Some(mut input) = self.input.take() {
                if result == ReadResult::Closed {
                    input.close();
                }
            }

            if self.state.finished {
                return ReadResult::Done;
            }
            if self.state.downstream_closed {
                return ReadResult::Closed;
            }
            // terminator record still queued
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
    use crate::{
        fcgi::RecordHeader,
        stream::{sink::read_all, source::BytesStream, trickle::ByteStream},
    };

    fn parse_records(mut data: &[u8]) -> Vec<(RecordType, u16, Vec<u8>)> {
        let mut records = Vec::new();
        while !data.is_empty() {
            let header = RecordHeader::parse(&data[..HEADER_LEN].try_into().unwrap());
            let len = header.content_length as usize;
            let content = data[HEADER_LEN..HEADER_LEN + len].to_vec();
            records.push((header.record_type, header.request_id, content));
            data = &data[HEADER_LEN + len + header.padding_length as usize..];
        }
        records
    }

    #[test]
    fn frames_body_and_terminates() {
        let mut stream = FcgiStdinStream::new(BytesStream::new(&b"request body"[..]), 3);
        let out = read_all(&mut stream).unwrap();

        let records = parse_records(&out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, RecordType::Stdin);
        assert_eq!(records[0].1, 3);
        assert_eq!(records[0].2, b"request body");
        assert_eq!(records[1].0, RecordType::Stdin);
        assert!(records[1].2.is_empty());
    }

    #[test]
    fn empty_body_only_terminates() {
        let mut stream = FcgiStdinStream::new(BytesStream::new(&b""[..]), 1);
        let out = read_all(&mut stream).unwrap();

        let records = parse_records(&out);
        assert_eq!(records.len(), 1);
        assert!(records[0].2.is_empty());
    }

    #[test]
    fn survives_backpressure() {
        let framed = FcgiStdinStream::new(BytesStream::new(&b"xy"[..]), 2);
        let mut throttled = ByteStream::new(framed);
        let out = read_all(&mut throttled).unwrap();

        let records = parse_records(&out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].2, b"xy");
        assert!(records[1].2.is_empty());
    }
}
