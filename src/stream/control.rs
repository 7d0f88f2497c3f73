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

//! Control streams for testing timing and failure edges: fault
//! injection, holding, and suspension.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, ReadResult, Stream, StreamHandler},
};
use std::{cell::RefCell, rc::Rc};

/// Control handle that can asynchronously turn an [`InjectStream`] into an
/// error.
#[derive(Clone)]
pub struct InjectControl {
    fault: Rc<RefCell<Option<Error>>>,
}

impl InjectControl {
    /// Make the stream fail on its next read.
    pub fn fault(&self, error: Error) {
        *self.fault.borrow_mut() = Some(error);
    }
}

/// A transparent filter whose [`InjectControl`] can inject a fault.
pub struct InjectStream<S> {
    input: Option<S>,
    fault: Rc<RefCell<Option<Error>>>,
}

impl<S: Stream> InjectStream<S> {
    pub fn new(input: S) -> (Self, InjectControl) {
        let fault = Rc::new(RefCell::new(None));
        (
            InjectStream {
                input: Some(input),
                fault: fault.clone(),
            },
            InjectControl { fault },
        )
    }
}

impl<S: Stream> Stream for InjectStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        // never pretend to know the length; the fault may hit first
        match &self.input {
            Some(input) if partial => input.available(true),
            _ => None,
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if let Some(error) = self.fault.borrow_mut().take() {
            if let Some(mut input) = self.input.take() {
                input.close();
            }
            handler.on_error(error);
            return ReadResult::Done;
        }

        match &mut self.input {
            Some(input) => input.read(handler),
            None => ReadResult::Pending,
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        if let Some(error) = self.fault.borrow_mut().take() {
            return Err(error);
        }

        match &mut self.input {
            Some(input) => input.fill_buckets(list),
            None => {
                list.set_more();
                Ok(())
            }
        }
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        match &mut self.input {
            Some(input) => input.consume_buckets(n),
            None => Consumed::default(),
        }
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }
}

/// Control handle for [`HoldStream`] and the suspend streams.
#[derive(Clone)]
pub struct ReleaseControl {
    released: Rc<RefCell<bool>>,
}

impl ReleaseControl {
    pub fn release(&self) {
        *self.released.borrow_mut() = true;
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }
}

/// Withholds all data until released; bridges a producer that exists
/// before its consumer is ready.
pub struct HoldStream<S> {
    input: S,
    released: Rc<RefCell<bool>>,
}

impl<S: Stream> HoldStream<S> {
    pub fn new(input: S) -> (Self, ReleaseControl) {
        let released = Rc::new(RefCell::new(false));
        (
            HoldStream {
                input,
                released: released.clone(),
            },
            ReleaseControl { released },
        )
    }

    fn is_released(&self) -> bool {
        *self.released.borrow()
    }
}

impl<S: Stream> Stream for HoldStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        self.input.available(partial)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if !self.is_released() {
            return ReadResult::Pending;
        }

        self.input.read(handler)
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        if !self.is_released() {
            list.set_more();
            return Ok(());
        }

        self.input.fill_buckets(list)
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        self.input.consume_buckets(n)
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Withholds data until resumed; the whole stream, or only everything
/// after the first delivery (`half` mode).
pub struct SuspendStream<S> {
    input: S,
    released: Rc<RefCell<bool>>,

    /// In half mode the first batch passes through before suspension
    /// starts.
    half: bool,
    delivered_first: bool,
}

impl<S: Stream> SuspendStream<S> {
    pub fn new(input: S) -> (Self, ReleaseControl) {
        Self::with_mode(input, false)
    }

    /// Deliver the first batch, then suspend.
    pub fn new_half(input: S) -> (Self, ReleaseControl) {
        Self::with_mode(input, true)
    }

    fn with_mode(input: S, half: bool) -> (Self, ReleaseControl) {
        let released = Rc::new(RefCell::new(false));
        (
            SuspendStream {
                input,
                released: released.clone(),
                half,
                delivered_first: false,
            },
            ReleaseControl { released },
        )
    }

    fn is_suspended(&self) -> bool {
        if *self.released.borrow() {
            return false;
        }

        !(self.half && !self.delivered_first)
    }
}

/// Alias for the half-suspending variant.
pub type HalfSuspendStream<S> = SuspendStream<S>;

impl<S: Stream> Stream for SuspendStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        self.input.available(partial)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if self.is_suspended() {
            return ReadResult::Pending;
        }

        self.delivered_first = true;
        self.input.read(handler)
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        if self.is_suspended() {
            list.set_more();
            return Ok(());
        }

        self.delivered_first = true;
        self.input.fill_buckets(list)
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        self.input.consume_buckets(n)
    }

    fn close(&mut self) {
        self.input.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{sink::read_all, sink::VecSink, source::BytesStream};

    #[test]
    fn inject_fault() {
        let (mut stream, control) = InjectStream::new(BytesStream::new(&b"data"[..]));
        control.fault(Error::Message("injected".into()));

        let error = read_all(&mut stream).unwrap_err();
        assert!(matches!(error, Error::Message(m) if m == "injected"));
    }

    #[test]
    fn inject_without_fault_is_transparent() {
        let (mut stream, _control) = InjectStream::new(BytesStream::new(&b"data"[..]));
        assert_eq!(read_all(&mut stream).unwrap(), b"data");
    }

    #[test]
    fn hold_until_release() {
        let (mut stream, control) = HoldStream::new(BytesStream::new(&b"held"[..]));

        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Pending);
        assert!(sink.data().is_empty());

        control.release();
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"held");
    }

    #[test]
    fn half_suspend_passes_first_batch() {
        let (mut stream, control) =
            SuspendStream::new_half(BytesStream::new(&b"first"[..]));

        let mut sink = VecSink::default();
        // the first delivery passes through, then the stream suspends
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"first");
        let _ = control;
    }

    #[test]
    fn suspend_blocks_until_resume() {
        let (mut stream, control) = SuspendStream::new(BytesStream::new(&b"later"[..]));

        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Pending);

        control.release();
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"later");
    }
}
