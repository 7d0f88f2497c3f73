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

//! A stream fed through a writer handle, with producer-side callbacks.

use crate::{
    error::Result,
    stream::{BucketList, Consumed, DataAction, ReadResult, Stream, StreamHandler},
};
use bytes::BytesMut;
use std::{cell::RefCell, rc::Rc};

/// Producer-side callbacks of a [`FifoBufferStream`].
pub trait FifoBufferHandler {
    /// The consumer took `n` bytes; the producer may refill.
    fn on_consumed(&mut self, _n: usize) {}

    /// The buffer has become empty.
    fn on_drained(&mut self) {}

    /// The consumer closed the stream.
    fn on_closed(&mut self) {}
}

/// A [`FifoBufferHandler`] that does not care.
#[derive(Default)]
pub struct NullFifoHandler;

impl FifoBufferHandler for NullFifoHandler {}

#[derive(Default)]
struct Shared {
    buffer: BytesMut,
    eof: bool,
    closed: bool,
}

/// Writer handle feeding a [`FifoBufferStream`].
#[derive(Clone)]
pub struct FifoBufferWriter {
    shared: Rc<RefCell<Shared>>,
}

impl FifoBufferWriter {
    /// Append data for the consumer.
    pub fn push(&self, data: &[u8]) {
        let mut shared = self.shared.borrow_mut();
        debug_assert!(!shared.eof);
        shared.buffer.extend_from_slice(data);
    }

    /// Announce that no more data will be pushed.
    pub fn set_eof(&self) {
        self.shared.borrow_mut().eof = true;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}

/// A caller-pushable buffer exposed as a stream.
pub struct FifoBufferStream<H> {
    shared: Rc<RefCell<Shared>>,

    /// Data moved out of the shared cell, so that pull-mode borrows have
    /// a stable home.
    staged: BytesMut,

    handler: H,
}

impl FifoBufferStream<NullFifoHandler> {
    pub fn new() -> (Self, FifoBufferWriter) {
        Self::with_handler(NullFifoHandler)
    }
}

impl<H: FifoBufferHandler> FifoBufferStream<H> {
    pub fn with_handler(handler: H) -> (Self, FifoBufferWriter) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        (
            FifoBufferStream {
                shared: shared.clone(),
                staged: BytesMut::new(),
                handler,
            },
            FifoBufferWriter { shared },
        )
    }

    fn sync(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if !shared.buffer.is_empty() {
            let incoming = shared.buffer.split();
            drop(shared);
            self.staged.unsplit(incoming);
        }
    }

    fn is_eof(&self) -> bool {
        self.staged.is_empty() && self.shared.borrow().eof
    }

    fn note_consumed(&mut self, n: usize) {
        if n == 0 {
            return;
        }

        self.handler.on_consumed(n);
        if self.staged.is_empty() && self.shared.borrow().buffer.is_empty() {
            self.handler.on_drained();
        }
    }
}

impl<H: FifoBufferHandler> Stream for FifoBufferStream<H> {
    fn available(&self, partial: bool) -> Option<u64> {
        let shared = self.shared.borrow();
        let pending = (self.staged.len() + shared.buffer.len()) as u64;

        if shared.eof || partial {
            Some(pending)
        } else {
            None
        }
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        self.sync();
        let n = (n as usize).min(self.staged.len());
        let _ = self.staged.split_to(n);
        self.note_consumed(n);
        Some(n as u64)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        self.sync();

        if !self.staged.is_empty() {
            let data = self.staged.split();
            match handler.on_data(&data) {
                DataAction::Consumed(n) => {
                    let mut data = data;
                    let rest = data.split_off(n);
                    if !rest.is_empty() {
                        // keep the unconsumed tail in front of anything
                        // pushed during the callback
                        let mut staged = rest;
                        staged.unsplit(std::mem::take(&mut self.staged));
                        self.staged = staged;
                    }

                    self.note_consumed(n);

                    if !self.staged.is_empty() {
                        return ReadResult::Blocked;
                    }
                }
                DataAction::Closed => return ReadResult::Closed,
            }
        }

        if self.is_eof() {
            handler.on_eof();
            return ReadResult::Done;
        }

        ReadResult::Pending
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        self.sync();

        if !self.staged.is_empty() {
            list.push(&self.staged[..]);
        }

        if !self.shared.borrow().eof {
            list.set_more();
        }

        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        let n = n.min(self.staged.len());
        let _ = self.staged.split_to(n);
        self.note_consumed(n);
        Consumed::new(n, self.is_eof())
    }

    fn close(&mut self) {
        self.shared.borrow_mut().closed = true;
        self.staged.clear();
        self.handler.on_closed();
    }
}
