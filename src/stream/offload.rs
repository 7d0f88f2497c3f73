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

//! Offloading CPU-bound transforms to a worker-thread queue.
//!
//! The stream side stages input under a mutex and returns to the event
//! loop; a worker runs the codec under the same mutex and wakes the
//! stream through a notifier.  Output moves from the protected buffer
//! into an unprotected main-thread buffer from which the downstream
//! handler is fed.

use crate::{
    error::Error,
    stream::{
        codec::{Codec, CodecMode},
        DataAction, ReadResult, Stream, StreamHandler,
    },
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread,
};
use tokio::sync::Notify;

type Job = Box<dyn FnOnce() + Send>;

struct QueueShared {
    jobs: Mutex<Option<VecDeque<Job>>>,
    cond: Condvar,
}

/// A fixed pool of worker threads executing queued jobs.
#[derive(Clone)]
pub struct ThreadQueue {
    shared: Arc<QueueShared>,
}

impl ThreadQueue {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);

        let shared = Arc::new(QueueShared {
            jobs: Mutex::new(Some(VecDeque::new())),
            cond: Condvar::new(),
        });

        for _ in 0..workers {
            let shared = shared.clone();
            thread::spawn(move || {
                loop {
                    let job = {
                        let mut guard = shared.jobs.lock().unwrap();
                        loop {
                            match guard.as_mut() {
                                None => return,
                                Some(jobs) => match jobs.pop_front() {
                                    Some(job) => break job,
                                    None => guard = shared.cond.wait(guard).unwrap(),
                                },
                            }
                        }
                    };

                    job();
                }
            });
        }

        ThreadQueue { shared }
    }

    fn submit(&self, job: Job) {
        let mut guard = self.shared.jobs.lock().unwrap();
        if let Some(jobs) = guard.as_mut() {
            jobs.push_back(job);
            self.shared.cond.notify_one();
        }
    }

    /// Stop accepting jobs and let the workers exit.
    pub fn shutdown(&self) {
        *self.shared.jobs.lock().unwrap() = None;
        self.shared.cond.notify_all();
    }
}

struct JobState {
    codec: Box<dyn Codec>,

    /// Staged input, owned by the worker while a job runs.
    input: Vec<u8>,

    /// Output produced by the worker, not yet claimed by the stream.
    output: Vec<u8>,

    running: bool,
    canceled: bool,
    finish_requested: bool,
    finished: bool,

    /// The codec consumed input without producing output; a sync flush
    /// is owed.
    unflushed: bool,

    error: Option<String>,
}

/// A filter that runs its codec on a [`ThreadQueue`].
pub struct CodecStream<S> {
    input: Option<S>,
    queue: ThreadQueue,
    job: Arc<Mutex<JobState>>,
    notify: Arc<Notify>,

    /// Main-thread output staging the downstream handler reads from.
    unprotected: Vec<u8>,

    input_eof: bool,
    finished: bool,
}

impl<S: Stream> CodecStream<S> {
    pub fn new(input: S, codec: Box<dyn Codec>, queue: ThreadQueue) -> Self {
        CodecStream {
            input: Some(input),
            queue,
            job: Arc::new(Mutex::new(JobState {
                codec,
                input: Vec::new(),
                output: Vec::new(),
                running: false,
                canceled: false,
                finish_requested: false,
                finished: false,
                unflushed: false,
                error: None,
            })),
            notify: Arc::new(Notify::new()),
            unprotected: Vec::new(),
            input_eof: false,
            finished: false,
        }
    }

    /// Wait until the worker has produced something new.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    fn schedule(&self, mode: CodecMode) {
        {
            let mut job = self.job.lock().unwrap();
            if job.running || job.finished || job.canceled {
                return;
            }
            job.running = true;
            if mode == CodecMode::Finish {
                job.finish_requested = true;
            }
        }

        let state = self.job.clone();
        let notify = self.notify.clone();
        self.queue.submit(Box::new(move || {
            let mut job = state.lock().unwrap();
            if job.canceled {
                job.running = false;
                return;
            }

            let input = std::mem::take(&mut job.input);
            let mode = if job.finish_requested {
                CodecMode::Finish
            } else if mode == CodecMode::Sync {
                CodecMode::Sync
            } else {
                CodecMode::Run
            };

            let mut output = std::mem::take(&mut job.output);
            let before = output.len();
            let result = job.codec.transform(&input, &mut output, mode);
            let produced = output.len() - before;
            job.output = output;

            match result {
                Ok(consumed) => {
                    if consumed < input.len() {
                        job.input = input[consumed..].to_vec();
                    }

                    job.unflushed = match mode {
                        CodecMode::Run => produced == 0 && consumed > 0,
                        _ => false,
                    };

                    if mode == CodecMode::Finish {
                        job.finished = true;
                    }
                }
                Err(error) => {
                    job.error = Some(error.to_string());
                }
            }

            job.running = false;
            drop(job);
            notify.notify_one();
        }));
    }

    /// Move worker output into the unprotected buffer.  Returns whether
    /// the codec has fully finished.
    fn claim_output(&mut self) -> bool {
        let mut job = self.job.lock().unwrap();
        if !job.output.is_empty() {
            self.unprotected.append(&mut job.output);
        }
        job.finished && !job.running
    }

    fn take_error(&self) -> Option<Error> {
        self.job
            .lock()
            .unwrap()
            .error
            .take()
            .map(Error::Message)
    }

    fn stage_input(&self, data: &[u8]) {
        self.job.lock().unwrap().input.extend_from_slice(data);
    }

    fn job_idle(&self) -> bool {
        let job = self.job.lock().unwrap();
        !job.running
    }

    fn needs_sync(&self) -> bool {
        let job = self.job.lock().unwrap();
        !job.running && job.unflushed
    }

    fn has_staged_input(&self) -> bool {
        let job = self.job.lock().unwrap();
        !job.input.is_empty()
    }
}

impl<S: Stream> Stream for CodecStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        if partial {
            Some(self.unprotected.len() as u64)
        } else {
            None
        }
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        debug_assert!(!self.finished);

        loop {
            // drain what the worker produced
            let codec_done = self.claim_output();

            if !self.unprotected.is_empty() {
                let pending = std::mem::take(&mut self.unprotected);
                match handler.on_data(&pending) {
                    DataAction::Consumed(n) => {
                        if n < pending.len() {
                            self.unprotected = pending[n..].to_vec();
                            return ReadResult::Blocked;
                        }
                    }
                    DataAction::Closed => {
                        self.unprotected = pending;
                        return ReadResult::Closed;
                    }
                }
                continue;
            }

            if let Some(error) = self.take_error() {
                if let Some(mut input) = self.input.take() {
                    input.close();
                }
                self.finished = true;
                handler.on_error(error);
                return ReadResult::Done;
            }

            if codec_done {
                self.finished = true;
                handler.on_eof();
                return ReadResult::Done;
            }

            if !self.job_idle() {
                return ReadResult::Pending;
            }

            if self.input_eof {
                self.schedule(CodecMode::Finish);
                return ReadResult::Pending;
            }

            // pull more input from upstream
            let Some(input) = &mut self.input else {
                return ReadResult::Pending;
            };

            let mut collected = Vec::new();
            let mut error = None;
            let result = {
                let mut fwd = CollectInput {
                    collected: &mut collected,
                    eof: &mut self.input_eof,
                    error: &mut error,
                };
                input.read(&mut fwd)
            };

            if let Some(error) = error {
                self.input = None;
                self.finished = true;
                handler.on_error(error);
                return ReadResult::Done;
            }

            if self.input_eof || result == ReadResult::Done {
                self.input = None;
                self.input_eof = true;
            }

            if !collected.is_empty() {
                self.stage_input(&collected);
                self.schedule(CodecMode::Run);
                return ReadResult::Pending;
            }

            if self.input_eof {
                self.schedule(CodecMode::Finish);
                return ReadResult::Pending;
            }

            if self.has_staged_input() {
                self.schedule(CodecMode::Run);
                return ReadResult::Pending;
            }

            if self.needs_sync() {
                self.schedule(CodecMode::Sync);
                return ReadResult::Pending;
            }

            return match result {
                ReadResult::Pending => ReadResult::Pending,
                other => other,
            };
        }
    }

    fn close(&mut self) {
        self.job.lock().unwrap().canceled = true;

        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }
}

struct CollectInput<'a> {
    collected: &'a mut Vec<u8>,
    eof: &'a mut bool,
    error: &'a mut Option<Error>,
}

impl StreamHandler for CollectInput<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        self.collected.extend_from_slice(data);
        DataAction::Consumed(data.len())
    }

    fn on_eof(&mut self) {
        *self.eof = true;
    }

    fn on_error(&mut self, error: Error) {
        *self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{
        codec::{DeflateCodec, GzipCodec},
        sink::VecSink,
        source::BytesStream,
    };
    use std::io::Read;

    async fn drain<S: Stream>(stream: &mut CodecStream<S>) -> Vec<u8> {
        let mut sink = VecSink::default();
        loop {
            match stream.read(&mut sink) {
                ReadResult::Done => {
                    assert!(sink.take_error().is_none());
                    return sink.into_data();
                }
                ReadResult::Pending => stream.ready().await,
                ReadResult::Blocked => continue,
                ReadResult::Closed => panic!("unexpected close"),
            }
        }
    }

    #[tokio::test]
    async fn gzip_through_worker() {
        let queue = ThreadQueue::new(1);
        let mut stream = CodecStream::new(
            BytesStream::new(&b"offloaded gzip data"[..]),
            Box::new(GzipCodec::new()),
            queue.clone(),
        );

        let compressed = drain(&mut stream).await;
        assert!(!compressed.is_empty());

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "offloaded gzip data");

        queue.shutdown();
    }

    #[tokio::test]
    async fn cancel_discards_job() {
        let queue = ThreadQueue::new(1);
        let mut stream = CodecStream::new(
            BytesStream::new(&b"abandoned"[..]),
            Box::new(DeflateCodec::new()),
            queue.clone(),
        );

        let mut sink = VecSink::default();
        let _ = stream.read(&mut sink);
        stream.close();

        queue.shutdown();
    }
}
