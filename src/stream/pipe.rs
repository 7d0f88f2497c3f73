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

//! Pipe plumbing for the zero-copy fast path: a stock of reusable pipe
//! pairs, a stream serving a pre-filled pipe, and the auto-pipe filter
//! that turns plain data into splice-able data.

use crate::{
    error::{Error, Result},
    stream::{
        BucketList, Consumed, DataAction, DirectAction, FdKind, FdMask, ReadResult, Stream,
        StreamHandler,
    },
};
use nix::{
    errno::Errno,
    fcntl::{splice, OFlag, SpliceFFlags},
    unistd::pipe2,
};
use std::{
    cell::RefCell,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    rc::Rc,
};

fn errno_error(errno: Errno) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(errno as i32))
}

/// A nonblocking pipe pair.
pub struct PipePair {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl PipePair {
    fn new() -> Result<Self> {
        let (read, write) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(errno_error)?;
        Ok(PipePair { read, write })
    }
}

/// A stock of reusable pipe pairs.  A pipe may only be returned when it
/// is empty; otherwise it must be destroyed.
#[derive(Default)]
pub struct PipeStock {
    idle: RefCell<Vec<PipePair>>,
}

impl PipeStock {
    pub fn new() -> Rc<Self> {
        Rc::new(PipeStock::default())
    }

    pub fn lease(self: &Rc<Self>) -> Result<PipeLease> {
        let pair = match self.idle.borrow_mut().pop() {
            Some(pair) => pair,
            None => PipePair::new()?,
        };

        Ok(PipeLease {
            stock: Rc::downgrade(self),
            pair: Some(pair),
        })
    }
}

/// A leased pipe pair; returned to the stock on release if still clean.
pub struct PipeLease {
    stock: std::rc::Weak<PipeStock>,
    pair: Option<PipePair>,
}

impl PipeLease {
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.pair.as_ref().unwrap().read.as_fd()
    }

    pub fn write_fd(&self) -> BorrowedFd<'_> {
        self.pair.as_ref().unwrap().write.as_fd()
    }

    /// Give the pipe back.  `reusable` must only be set when the pipe is
    /// known to be empty.
    pub fn release(&mut self, reusable: bool) {
        let Some(pair) = self.pair.take() else {
            return;
        };

        if reusable {
            if let Some(stock) = self.stock.upgrade() {
                stock.idle.borrow_mut().push(pair);
            }
        }
    }
}

impl Drop for PipeLease {
    fn drop(&mut self) {
        self.release(false);
    }
}

/// Move up to `max` bytes between descriptors.  `Ok(None)` means the
/// operation would block.
pub fn splice_bytes(
    from: BorrowedFd<'_>, to: BorrowedFd<'_>, max: usize,
) -> Result<Option<usize>> {
    match splice(from, None, to, None, max, SpliceFFlags::SPLICE_F_NONBLOCK) {
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => Ok(None),
        Err(errno) => Err(errno_error(errno)),
    }
}

/// Write a byte span into a descriptor.  `Ok(None)` means the operation
/// would block.
pub fn write_bytes(fd: BorrowedFd<'_>, data: &[u8]) -> Result<Option<usize>> {
    match nix::unistd::write(fd, data) {
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => Ok(None),
        Err(errno) => Err(errno_error(errno)),
    }
}

/// Read from a descriptor.  `Ok(None)` means the operation would block.
pub fn read_bytes(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<Option<usize>> {
    match nix::unistd::read(fd, buf) {
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => Ok(None),
        Err(errno) => Err(errno_error(errno)),
    }
}

/// A stream serving a leased pipe that already holds `remaining` bytes.
/// Prefers handing the descriptor to the handler for splicing; falls
/// back to copying through an internal buffer.
pub struct PipeLeaseStream {
    lease: PipeLease,
    remaining: u64,
    direct_mask: FdMask,
}

impl PipeLeaseStream {
    pub fn new(lease: PipeLease, remaining: u64) -> Self {
        PipeLeaseStream {
            lease,
            remaining,
            direct_mask: FdMask::NONE,
        }
    }
}

impl Stream for PipeLeaseStream {
    fn available(&self, _partial: bool) -> Option<u64> {
        Some(self.remaining)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        while self.remaining > 0 {
            if self.direct_mask.contains(FdKind::Pipe) {
                let fd = self.lease.read_fd();
                let max = self.remaining as usize;
                match handler.on_direct(FdKind::Pipe, fd, max, true) {
                    DirectAction::Consumed(n) => {
                        self.remaining -= n as u64;
                        continue;
                    }
                    DirectAction::Blocking => return ReadResult::Blocked,
                    DirectAction::Empty => return ReadResult::Pending,
                    DirectAction::End => break,
                    DirectAction::Fallback => {}
                    DirectAction::Closed => return ReadResult::Closed,
                    DirectAction::Failed(error) => {
                        handler.on_error(error);
                        return ReadResult::Done;
                    }
                }
            }

            // buffered fallback
            let mut buf = [0u8; 8192];
            let max = buf.len().min(self.remaining as usize);
            let n = {
                let fd = self.lease.read_fd();
                match read_bytes(fd, &mut buf[..max]) {
                    Ok(Some(0)) => break,
                    Ok(Some(n)) => n,
                    Ok(None) => return ReadResult::Pending,
                    Err(error) => {
                        handler.on_error(error);
                        return ReadResult::Done;
                    }
                }
            };

            match handler.on_data(&buf[..n]) {
                DataAction::Consumed(m) => {
                    self.remaining -= m as u64;
                    if m < n {
                        // bytes were taken out of the pipe; the pipe is
                        // dirty now and cannot be reused
                        self.remaining = self.remaining.saturating_sub((n - m) as u64);
                        self.lease.release(false);
                        handler.on_error(Error::Message(
                            "pipe consumer blocked mid-transfer".into(),
                        ));
                        return ReadResult::Done;
                    }
                }
                DataAction::Closed => return ReadResult::Closed,
            }
        }

        self.lease.release(self.remaining == 0);
        handler.on_eof();
        ReadResult::Done
    }

    fn set_direct(&mut self, mask: FdMask) {
        self.direct_mask = mask;
    }

    fn consume_direct(&mut self, n: usize) {
        self.remaining = self.remaining.saturating_sub(n as u64);
    }

    fn close(&mut self) {
        self.lease.release(self.remaining == 0);
    }
}

/// Inserts a pipe between a plain-data producer and a consumer that can
/// splice from pipes.
pub struct AutoPipeStream<S> {
    input: Option<S>,
    stock: Rc<PipeStock>,
    lease: Option<PipeLease>,

    /// Bytes currently parked in the managed pipe.
    piped: u64,

    direct_mask: FdMask,
    input_eof: bool,
}

impl<S: Stream> AutoPipeStream<S> {
    pub fn new(input: S, stock: Rc<PipeStock>) -> Self {
        AutoPipeStream {
            input: Some(input),
            stock,
            lease: None,
            piped: 0,
            direct_mask: FdMask::NONE,
            input_eof: false,
        }
    }

    /// Offer the pipe content to the handler.  Returns `None` to
    /// continue, or a result to propagate.
    fn offer_piped(&mut self, handler: &mut dyn StreamHandler) -> Option<ReadResult> {
        debug_assert!(self.piped > 0);

        let then_eof = self.input_eof;
        let lease = self.lease.as_mut().unwrap();
        let max = self.piped as usize;

        match handler.on_direct(FdKind::Pipe, lease.read_fd(), max, then_eof) {
            DirectAction::Consumed(n) => {
                self.piped -= n as u64;
                if self.piped == 0 {
                    if let Some(lease) = &mut self.lease {
                        lease.release(true);
                    }
                    self.lease = None;
                }
                None
            }
            DirectAction::Blocking => Some(ReadResult::Blocked),
            DirectAction::Empty => Some(ReadResult::Pending),
            DirectAction::End | DirectAction::Fallback => {
                // drain through userspace instead
                let mut buf = [0u8; 8192];
                let n = {
                    let fd = lease.read_fd();
                    let limit = max.min(buf.len());
                    match read_bytes(fd, &mut buf[..limit]) {
                        Ok(Some(n)) => n,
                        Ok(None) => return Some(ReadResult::Pending),
                        Err(error) => {
                            handler.on_error(error);
                            return Some(ReadResult::Done);
                        }
                    }
                };

                match handler.on_data(&buf[..n]) {
                    DataAction::Consumed(m) => {
                        self.piped -= m as u64;
                        if m < n {
                            self.piped -= (n - m) as u64;
                            if let Some(lease) = &mut self.lease {
                                lease.release(false);
                            }
                            self.lease = None;
                            handler.on_error(Error::Message(
                                "pipe consumer blocked mid-transfer".into(),
                            ));
                            return Some(ReadResult::Done);
                        }
                        None
                    }
                    DataAction::Closed => Some(ReadResult::Closed),
                }
            }
            DirectAction::Closed => Some(ReadResult::Closed),
            DirectAction::Failed(error) => {
                handler.on_error(error);
                Some(ReadResult::Done)
            }
        }
    }
}

struct Fwd<'a> {
    stock: &'a Rc<PipeStock>,
    lease: &'a mut Option<PipeLease>,
    piped: &'a mut u64,
    want_pipe: bool,
    down: &'a mut dyn StreamHandler,
    saw_eof: &'a mut bool,
}

impl StreamHandler for Fwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        if !self.want_pipe {
            return self.down.on_data(data);
        }

        if self.lease.is_none() {
            match self.stock.lease() {
                Ok(lease) => *self.lease = Some(lease),
                Err(_) => return self.down.on_data(data),
            }
        }

        let lease = self.lease.as_mut().unwrap();
        let written = match write_bytes(lease.write_fd(), data) {
            Ok(Some(n)) => n,
            Ok(None) => return DataAction::Consumed(0),
            Err(_) => return self.down.on_data(data),
        };

        *self.piped += written as u64;

        // let the consumer splice right away
        let max = *self.piped as usize;
        match self
            .down
            .on_direct(FdKind::Pipe, lease.read_fd(), max, false)
        {
            DirectAction::Consumed(n) => {
                *self.piped -= n as u64;
            }
            DirectAction::Closed => return DataAction::Closed,
            _ => {}
        }

        DataAction::Consumed(written)
    }

    fn on_eof(&mut self) {
        *self.saw_eof = true;
    }

    fn on_error(&mut self, error: Error) {
        *self.saw_eof = true;
        self.down.on_error(error);
    }
}

impl<S: Stream> Stream for AutoPipeStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        let inner = match &self.input {
            Some(input) => input.available(partial),
            None => Some(0),
        };

        inner.map(|n| n + self.piped)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        loop {
            if self.piped > 0 {
                match self.offer_piped(handler) {
                    Some(result) => return result,
                    None => continue,
                }
            }

            if self.input_eof || self.input.is_none() {
                if let Some(lease) = &mut self.lease {
                    lease.release(true);
                }
                self.lease = None;
                handler.on_eof();
                return ReadResult::Done;
            }

            let want_pipe = self.direct_mask.contains(FdKind::Pipe);
            let mut saw_eof = false;
            let input = self.input.as_mut().unwrap();
            let result = input.read(&mut Fwd {
                stock: &self.stock,
                lease: &mut self.lease,
                piped: &mut self.piped,
                want_pipe,
                down: handler,
                saw_eof: &mut saw_eof,
            });

            if saw_eof || result == ReadResult::Done {
                self.input = None;
                self.input_eof = true;
                continue;
            }

            return result;
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        // bytes inside the pipe cannot be re-ordered into buckets
        if self.piped > 0 {
            list.set_more();
            list.enable_fallback();
            return Ok(());
        }

        match &mut self.input {
            Some(input) => input.fill_buckets(list),
            None => Ok(()),
        }
    }

    fn consume_buckets(&mut self, n: usize) -> Consumed {
        match &mut self.input {
            Some(input) => input.consume_buckets(n),
            None => Consumed::default(),
        }
    }

    fn set_direct(&mut self, mask: FdMask) {
        self.direct_mask = mask;
        if let Some(input) = &mut self.input {
            // the input may itself offer descriptors we can splice from
            input.set_direct(mask.union(FdMask::PIPE));
        }
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        if let Some(lease) = &mut self.lease {
            lease.release(self.piped == 0);
        }
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{sink::read_all, source::BytesStream};

    #[test]
    fn pipe_lease_stream_buffered_read() {
        let stock = PipeStock::new();
        let lease = stock.lease().unwrap();

        let payload = b"pipe payload";
        let written = write_bytes(lease.write_fd(), payload).unwrap().unwrap();
        assert_eq!(written, payload.len());

        let mut stream = PipeLeaseStream::new(lease, payload.len() as u64);
        assert_eq!(stream.available(false), Some(payload.len() as u64));
        assert_eq!(read_all(&mut stream).unwrap(), payload);
    }

    #[test]
    fn stock_reuses_clean_pipes() {
        let stock = PipeStock::new();
        let mut lease = stock.lease().unwrap();
        lease.release(true);
        assert_eq!(stock.idle.borrow().len(), 1);

        let mut lease = stock.lease().unwrap();
        assert!(stock.idle.borrow().is_empty());
        lease.release(false);
        assert!(stock.idle.borrow().is_empty());
    }

    #[test]
    fn splice_between_pipes() {
        let stock = PipeStock::new();
        let a = stock.lease().unwrap();
        let b = stock.lease().unwrap();

        write_bytes(a.write_fd(), b"spliced").unwrap().unwrap();
        let n = splice_bytes(a.read_fd(), b.write_fd(), 64).unwrap().unwrap();
        assert_eq!(n, 7);

        let mut buf = [0u8; 64];
        let n = read_bytes(b.read_fd(), &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"spliced");
    }

    #[test]
    fn auto_pipe_passthrough_without_direct() {
        let stock = PipeStock::new();
        let mut stream =
            AutoPipeStream::new(BytesStream::new(&b"plain path"[..]), stock);
        assert_eq!(read_all(&mut stream).unwrap(), b"plain path");
    }

    #[test]
    fn auto_pipe_offers_descriptor() {
        use crate::stream::DataAction;

        struct SpliceSink {
            out: PipeLease,
            received: Vec<u8>,
            eof: bool,
        }

        impl StreamHandler for SpliceSink {
            fn on_data(&mut self, data: &[u8]) -> DataAction {
                self.received.extend_from_slice(data);
                DataAction::Consumed(data.len())
            }

            fn on_direct(
                &mut self, _kind: FdKind, fd: BorrowedFd<'_>, max: usize, _then_eof: bool,
            ) -> DirectAction {
                match splice_bytes(fd, self.out.write_fd(), max) {
                    Ok(Some(n)) => DirectAction::Consumed(n),
                    Ok(None) => DirectAction::Empty,
                    Err(error) => DirectAction::Failed(error),
                }
            }

            fn on_eof(&mut self) {
                self.eof = true;
            }

            fn on_error(&mut self, _error: Error) {}
        }

        let stock = PipeStock::new();
        let out = stock.lease().unwrap();

        let mut stream =
            AutoPipeStream::new(BytesStream::new(&b"zero copy"[..]), stock.clone());
        stream.set_direct(FdMask::PIPE);

        let mut sink = SpliceSink {
            out,
            received: Vec::new(),
            eof: false,
        };

        loop {
            match stream.read(&mut sink) {
                ReadResult::Done => break,
                ReadResult::Blocked | ReadResult::Pending => continue,
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert!(sink.eof);

        let mut buf = [0u8; 64];
        let n = read_bytes(sink.out.read_fd(), &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"zero copy");
    }
}
