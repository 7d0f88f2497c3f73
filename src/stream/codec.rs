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

//! Byte-transform codecs run on the worker queue: gzip, raw deflate and
//! brotli encoders.

use crate::error::{Error, Result};
use flate2::{Compress, Compression, FlushCompress, Status};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};

/// How a [`Codec::transform`] call should flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// Plain transformation; the codec may buffer.
    Run,

    /// Flush buffered data so the consumer can make progress.
    Sync,

    /// The input has ended; emit the stream trailer.
    Finish,
}

/// A CPU-bound byte transformation, executed on a worker thread.
pub trait Codec: Send {
    /// Transform `input`, appending to `output`.  Returns the number of
    /// input bytes consumed.
    fn transform(&mut self, input: &[u8], output: &mut Vec<u8>, mode: CodecMode) -> Result<usize>;
}

/// Raw deflate encoder over `flate2`.
pub struct DeflateCodec {
    compress: Compress,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        DeflateCodec::new()
    }
}

impl DeflateCodec {
    pub fn new() -> Self {
        DeflateCodec {
            compress: Compress::new(Compression::default(), false),
        }
    }
}

impl Codec for DeflateCodec {
    fn transform(&mut self, input: &[u8], output: &mut Vec<u8>, mode: CodecMode) -> Result<usize> {
        let flush = match mode {
            CodecMode::Run => FlushCompress::None,
            CodecMode::Sync => FlushCompress::Sync,
            CodecMode::Finish => FlushCompress::Finish,
        };

        let mut consumed = 0;

        loop {
            output.reserve(4096);

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            let status = self
                .compress
                .compress_vec(&input[consumed..], output, flush)
                .map_err(|e| Error::Message(format!("deflate failed: {e}")))?;

            consumed += (self.compress.total_in() - before_in) as usize;
            let produced = self.compress.total_out() - before_out;

            if status == Status::StreamEnd {
                break;
            }

            if consumed == input.len() {
                match mode {
                    CodecMode::Run => break,
                    CodecMode::Sync => {
                        if produced == 0 {
                            break;
                        }
                    }
                    CodecMode::Finish => {}
                }
            }
        }

        Ok(consumed)
    }
}

/// `Write` sink collecting into a shared buffer, so that the encoder's
/// output survives finalization.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Gzip encoder.
pub struct GzipCodec {
    writer: Option<flate2::write::GzEncoder<SharedBuf>>,
    sink: SharedBuf,
}

impl Default for GzipCodec {
    fn default() -> Self {
        GzipCodec::new()
    }
}

impl GzipCodec {
    pub fn new() -> Self {
        let sink = SharedBuf::default();
        GzipCodec {
            writer: Some(flate2::write::GzEncoder::new(
                sink.clone(),
                Compression::default(),
            )),
            sink,
        }
    }
}

impl Codec for GzipCodec {
    fn transform(&mut self, input: &[u8], output: &mut Vec<u8>, mode: CodecMode) -> Result<usize> {
        let Some(writer) = &mut self.writer else {
            return Err(Error::Message("gzip encoder already finished".into()));
        };

        writer
            .write_all(input)
            .map_err(|e| Error::Message(format!("gzip failed: {e}")))?;

        match mode {
            CodecMode::Run => {}
            CodecMode::Sync => {
                writer
                    .flush()
                    .map_err(|e| Error::Message(format!("gzip flush failed: {e}")))?;
            }
            CodecMode::Finish => {
                let writer = self.writer.take().unwrap();
                writer
                    .finish()
                    .map_err(|e| Error::Message(format!("gzip finish failed: {e}")))?;
            }
        }

        let mut buffered = self.sink.0.lock().unwrap();
        output.append(&mut buffered);
        Ok(input.len())
    }
}

/// Brotli encoder.
pub struct BrotliCodec {
    writer: Option<brotli::CompressorWriter<SharedBuf>>,
    sink: SharedBuf,
}

impl Default for BrotliCodec {
    fn default() -> Self {
        BrotliCodec::new()
    }
}

impl BrotliCodec {
    pub fn new() -> Self {
        let sink = SharedBuf::default();
        BrotliCodec {
            writer: Some(brotli::CompressorWriter::new(sink.clone(), 4096, 5, 22)),
            sink,
        }
    }
}

impl Codec for BrotliCodec {
    fn transform(&mut self, input: &[u8], output: &mut Vec<u8>, mode: CodecMode) -> Result<usize> {
        let Some(writer) = &mut self.writer else {
            return Err(Error::Message("brotli encoder already finished".into()));
        };

        writer
            .write_all(input)
            .map_err(|e| Error::Message(format!("brotli failed: {e}")))?;

        match mode {
            CodecMode::Run => {}
            CodecMode::Sync => {
                writer
                    .flush()
                    .map_err(|e| Error::Message(format!("brotli flush failed: {e}")))?;
            }
            CodecMode::Finish => {
                // dropping the writer emits the stream trailer
                self.writer = None;
            }
        }

        let mut buffered = self.sink.0.lock().unwrap();
        output.append(&mut buffered);
        Ok(input.len())
    }
}
