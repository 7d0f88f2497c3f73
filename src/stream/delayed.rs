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

//! A placeholder stream whose content arrives later through a control
//! handle.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, ReadResult, Stream, StreamHandler},
};
use std::{cell::RefCell, rc::Rc};

enum Command {
    Set(Box<dyn Stream>),
    Eof,
    Error(Error),
}

#[derive(Default)]
struct Shared {
    command: Option<Command>,

    /// Invoked if the stream is closed while still empty.
    cancel: Option<Box<dyn FnOnce()>>,

    closed: bool,
}

/// Control handle populating a [`DelayedStream`].
#[derive(Clone)]
pub struct DelayedControl {
    shared: Rc<RefCell<Shared>>,
}

impl DelayedControl {
    /// Provide the real stream.
    pub fn set(&self, inner: Box<dyn Stream>) {
        self.shared.borrow_mut().command = Some(Command::Set(inner));
    }

    /// End the stream without any data.
    pub fn set_eof(&self) {
        self.shared.borrow_mut().command = Some(Command::Eof);
    }

    /// Fail the stream.
    pub fn set_error(&self, error: Error) {
        self.shared.borrow_mut().command = Some(Command::Error(error));
    }

    /// Register a hook to run if the stream is closed while still empty.
    pub fn on_cancel(&self, hook: impl FnOnce() + 'static) {
        self.shared.borrow_mut().cancel = Some(Box::new(hook));
    }

    /// Whether the consumer has closed the stream.
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}

/// A stream that is empty until its [`DelayedControl`] provides content.
pub struct DelayedStream {
    shared: Rc<RefCell<Shared>>,
    inner: Option<Box<dyn Stream>>,
    eof_pending: bool,
    error_pending: Option<Error>,
}

impl DelayedStream {
    pub fn new() -> (Self, DelayedControl) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        (
            DelayedStream {
                shared: shared.clone(),
                inner: None,
                eof_pending: false,
                error_pending: None,
            },
            DelayedControl { shared },
        )
    }

    fn poll_command(&mut self) {
        if self.inner.is_some() {
            return;
        }

        match self.shared.borrow_mut().command.take() {
            Some(Command::Set(inner)) => self.inner = Some(inner),
            Some(Command::Eof) => self.eof_pending = true,
            Some(Command::Error(error)) => self.error_pending = Some(error),
            None => {}
        }
    }
}

impl Stream for DelayedStream {
    fn available(&self, partial: bool) -> Option<u64> {
        match &self.inner {
            Some(inner) => inner.available(partial),
            None => None,
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        self.poll_command();

        if let Some(error) = self.error_pending.take() {
            handler.on_error(error);
            return ReadResult::Done;
        }

        if self.eof_pending {
            handler.on_eof();
            return ReadResult::Done;
        }

        match &mut self.inner {
            Some(inner) => inner.read(handler),
            None => ReadResult::Pending,
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        self.poll_command();

        if let Some(error) = self.error_pending.take() {
            return Err(error);
        }

        if self.eof_pending {
            return Ok(());
        }

        match &mut self.inner {
            Some(inner) => inner.fill_buckets(list),
            None => {
                list.set_more();
                Ok(())
            }
        }
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        match &mut self.inner {
            Some(inner) => inner.consume_buckets(n),
            None => Consumed::new(0, self.eof_pending),
        }
    }

    fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();
        shared.closed = true;
        let cancel = shared.cancel.take();
        drop(shared);

        match self.inner.take() {
            Some(mut inner) => inner.close(),
            None => {
                if let Some(cancel) = cancel {
                    cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{sink::read_all, sink::VecSink, source::BytesStream};

    #[test]
    fn empty_until_set() {
        let (mut stream, control) = DelayedStream::new();

        let mut sink = VecSink::default();
        assert_eq!(stream.read(&mut sink), ReadResult::Pending);

        control.set(Box::new(BytesStream::new(&b"late"[..])));
        assert_eq!(stream.read(&mut sink), ReadResult::Done);
        assert_eq!(sink.data(), b"late");
    }

    #[test]
    fn eof_command() {
        let (mut stream, control) = DelayedStream::new();
        control.set_eof();
        assert_eq!(read_all(&mut stream).unwrap(), b"");
    }

    #[test]
    fn error_command() {
        let (mut stream, control) = DelayedStream::new();
        control.set_error(Error::Message("late failure".into()));
        let error = read_all(&mut stream).unwrap_err();
        assert!(matches!(error, Error::Message(m) if m == "late failure"));
    }

    #[test]
    fn cancel_hook_runs_on_early_close() {
        let (mut stream, control) = DelayedStream::new();

        let canceled = Rc::new(RefCell::new(false));
        let flag = canceled.clone();
        control.on_cancel(move || *flag.borrow_mut() = true);

        stream.close();
        assert!(*canceled.borrow());
        assert!(control.is_closed());
    }
}
