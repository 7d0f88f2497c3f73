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

//! The FastCGI client: request serialization, response record parsing
//! and the response body stream.

use crate::{
    buffer::GrowingBuffer,
    error::{Error, FcgiErrorCode, Result},
    fcgi::{
        begin_request_body, serialize::FcgiParamsSerializer, stdin::FcgiStdinStream,
        RecordHeader, RecordType, Role, HEADER_LEN,
    },
    lease::{Lease, NoopStopwatch, PutAction, Stopwatch},
    socket::{pump_stream, BufferedSocket, PumpOutcome, SpliceTarget},
    stream::{
        concat::ConcatStream, source::GrowingBufferStream, BucketList, Consumed, DataAction,
        ReadResult, Stream, StreamHandler,
    },
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::{
    io::Write,
    sync::atomic::{AtomicU16, Ordering},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// A response header line must stay below this size.
const MAX_HEADER_SIZE: usize = 8192;

/// All response header lines together must stay below this size.
const MAX_TOTAL_HEADER_SIZE: usize = 65536;

static NEXT_REQUEST_ID: AtomicU16 = AtomicU16::new(1);

fn next_request_id() -> u16 {
    loop {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

fn garbage(message: &str) -> Error {
    Error::fcgi(FcgiErrorCode::Garbage, message.to_string())
}

/// A FastCGI request.
pub struct FcgiRequest<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub script_filename: &'a str,
    pub script_name: &'a str,
    pub path_info: &'a str,
    pub query_string: &'a str,
    pub document_root: &'a str,
    pub remote_addr: Option<&'a str>,

    /// Request headers, forwarded as `HTTP_*` parameters.
    pub headers: HeaderMap,

    /// Extra parameters in `NAME=value` form.
    pub params: &'a [(&'a str, &'a str)],

    pub body: Option<Box<dyn Stream>>,
}

impl<'a> FcgiRequest<'a> {
    pub fn new(method: Method, uri: &'a str) -> Self {
        FcgiRequest {
            method,
            uri,
            script_filename: "",
            script_name: "",
            path_info: "",
            query_string: "",
            document_root: "",
            remote_addr: None,
            headers: HeaderMap::new(),
            params: &[],
            body: None,
        }
    }
}

/// The response: status, headers and the body stream.
pub struct FcgiResponse<S, L: Lease<S>> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: FcgiBody<S, L>,
}

/// Async client for one FastCGI request over a leased connection.
pub struct FcgiClient<S, L: Lease<S>> {
    socket: BufferedSocket<S>,
    lease: L,
    stderr: Option<Box<dyn Write>>,
    stopwatch: Box<dyn Stopwatch>,
    id: u16,
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> FcgiClient<S, L> {
    pub fn new(socket: S, lease: L) -> Self {
        FcgiClient {
            socket: BufferedSocket::new(socket),
            lease,
            stderr: None,
            stopwatch: Box::new(NoopStopwatch),
            id: next_request_id(),
        }
    }

    /// Attach an event recorder for request tracing.
    pub fn with_stopwatch(mut self, stopwatch: Box<dyn Stopwatch>) -> Self {
        self.stopwatch = stopwatch;
        self
    }

    /// Redirect the application's STDERR payloads.
    pub fn with_stderr(mut self, stderr: Box<dyn Write>) -> Self {
        self.stderr = Some(stderr);
        self
    }

    /// Serialize the BEGIN_REQUEST and PARAMS records.
    fn serialize_head(&self, request: &FcgiRequest<'_>) -> GrowingBuffer {
        let mut buffer = GrowingBuffer::new();

        let begin = begin_request_body(Role::Responder, true);
        let header =
            RecordHeader::new(RecordType::BeginRequest, self.id, begin.len() as u16);
        buffer.write(&header.encode());
        buffer.write(&begin);

        let mut ps = FcgiParamsSerializer::new(self.id);
        ps.pair("REQUEST_METHOD", request.method.as_str().as_bytes())
            .pair("REQUEST_URI", request.uri.as_bytes())
            .pair("SCRIPT_FILENAME", request.script_filename.as_bytes())
            .pair("SCRIPT_NAME", request.script_name.as_bytes())
            .pair("PATH_INFO", request.path_info.as_bytes())
            .pair("QUERY_STRING", request.query_string.as_bytes())
            .pair("DOCUMENT_ROOT", request.document_root.as_bytes())
            .pair("SERVER_SOFTWARE", b"proxy-stream");

        if let Some(remote_addr) = request.remote_addr {
            ps.pair("REMOTE_ADDR", remote_addr.as_bytes());
        }

        if let Some(body) = &request.body {
            if let Some(available) = body.available(false) {
                let value = available.to_string();
                ps.pair("HTTP_CONTENT_LENGTH", value.as_bytes())
                    // PHP wants the parameter without "HTTP_"
                    .pair("CONTENT_LENGTH", value.as_bytes());
            }
        }

        if let Some(content_type) = request.headers.get(http::header::CONTENT_TYPE) {
            ps.pair("CONTENT_TYPE", content_type.as_bytes());
        }

        for (name, value) in request.headers.iter() {
            if *name == http::header::CONTENT_TYPE {
                continue;
            }

            let param = format!(
                "HTTP_{}",
                name.as_str().to_ascii_uppercase().replace('-', "_")
            );
            ps.pair(&param, value.as_bytes());
        }

        for (name, value) in request.params {
            ps.pair(name, value.as_bytes());
        }

        ps.commit(&mut buffer);
        buffer
    }

    /// Send the request and parse the response head.
    pub async fn execute(mut self, request: FcgiRequest<'_>) -> Result<FcgiResponse<S, L>> {
        debug!(id = self.id, uri = request.uri, "start FastCGI request");

        let no_body_response = request.method == Method::HEAD;

        let mut head = self.serialize_head(&request);
        let mut request_stream: Box<dyn Stream> = match request.body {
            Some(body) => {
                let parts: Vec<Box<dyn Stream>> = vec![
                    Box::new(GrowingBufferStream::new(head)),
                    Box::new(FcgiStdinStream::new(body, self.id)),
                ];
                Box::new(ConcatStream::new(parts))
            }
            None => {
                // no request body: just the empty STDIN record
                let end = RecordHeader::new(RecordType::Stdin, self.id, 0);
                head.write(&end.encode());
                Box::new(GrowingBufferStream::new(head))
            }
        };

        match pump_stream(&mut self.socket, request_stream.as_mut()).await {
            Ok(PumpOutcome::Done) => {}
            Ok(PumpOutcome::Pending) => {
                return Err(Error::fcgi(
                    FcgiErrorCode::Unspecified,
                    "request stream stalled",
                ));
            }
            Ok(PumpOutcome::Broken) | Err(Error::ClosedPrematurely) => {
                return Err(Error::fcgi_nested(
                    FcgiErrorCode::Io,
                    "write to FastCGI application failed",
                    Error::ClosedPrematurely,
                ));
            }
            Err(error) => {
                return Err(Error::fcgi_nested(
                    FcgiErrorCode::Io,
                    "write to FastCGI application failed",
                    error,
                ));
            }
        }

        self.stopwatch.record("request_end");
        debug!(id = self.id, "request sent");

        let mut parser = HeadParser {
            id: self.id,
            content_length: 0,
            skip_length: 0,
            stderr: false,
            headers: HeaderMap::new(),
            total_header_size: 0,
            done: false,
            end_request: false,
        };

        loop {
            let consumed = parser.feed(self.socket.buffer(), &mut self.stderr)?;
            self.socket.consumed(consumed);

            if parser.done {
                break;
            }

            match self.socket.fill(true).await {
                Ok(0) | Err(Error::ClosedPrematurely) => {
                    return Err(if self.socket.available() == 0 && parser.fresh() {
                        Error::fcgi(
                            FcgiErrorCode::Refused,
                            "FastCGI application refused the request",
                        )
                    } else {
                        Error::ClosedPrematurely
                    });
                }
                Ok(_) => {}
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(error) => {
                    return Err(Error::fcgi_nested(
                        FcgiErrorCode::Io,
                        "FastCGI socket error",
                        error,
                    ));
                }
            }
        }

        let mut status = StatusCode::OK;
        if let Some(value) = parser.headers.get("status") {
            let digits = value.as_bytes();
            let digits = &digits[..digits.len().min(3)];
            if let Ok(parsed) = StatusCode::from_bytes(digits) {
                status = parsed;
            }
        }
        parser.headers.remove("status");

        let empty_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let no_body = no_body_response || empty_status;

        let available = parser
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        self.stopwatch.record("response_headers");
        debug!(id = self.id, status = %status, "response headers received");

        let mut body = FcgiBody {
            socket: self.socket,
            lease: Some(self.lease),
            stderr: self.stderr,
            id: self.id,
            content_length: parser.content_length,
            skip_length: parser.skip_length,
            skip_stderr: 0,
            stderr_record: parser.stderr,
            end_request: parser.end_request,
            available: if no_body { Some(0) } else { available },
            pending_release: None,
            no_body,
            done: false,
        };

        body.release_if_complete();

        if no_body {
            body.drain().await?;
        }

        Ok(FcgiResponse {
            status,
            headers: parser.headers,
            body,
        })
    }
}

/// Parser for the STDOUT header block.
struct HeadParser {
    id: u16,
    content_length: usize,
    skip_length: usize,
    stderr: bool,
    headers: HeaderMap,
    total_header_size: usize,
    done: bool,
    end_request: bool,
}

impl HeadParser {
    /// Nothing received yet?
    fn fresh(&self) -> bool {
        self.headers.is_empty() && self.total_header_size == 0 && !self.done
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<bool> {
        if line.is_empty() {
            return Ok(true);
        }

        if line.len() >= MAX_HEADER_SIZE {
            return Err(garbage("response header is too long"));
        }

        self.total_header_size += line.len();
        if self.total_header_size >= MAX_TOTAL_HEADER_SIZE {
            return Err(garbage("too many response headers"));
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| garbage("malformed FastCGI response header"))?;

        let name = HeaderName::from_bytes(line[..colon].trim_ascii())
            .map_err(|_| garbage("malformed FastCGI response header"))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|_| garbage("malformed FastCGI response header"))?;

        self.headers.append(name, value);
        Ok(false)
    }

    /// Parse complete header lines from a STDOUT payload window.
    /// Returns the number of bytes consumed.
    fn parse_headers(&mut self, src: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        while let Some(pos) = src[consumed..].iter().position(|&b| b == b'\n') {
            let line = &src[consumed..consumed + pos];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            consumed += pos + 1;

            if self.handle_line(line)? {
                self.done = true;
                break;
            }
        }

        Ok(consumed)
    }

    /// Walk the record structure.  Returns the number of buffer bytes
    /// consumed.
    fn feed(&mut self, buf: &[u8], stderr_sink: &mut Option<Box<dyn Write>>) -> Result<usize> {
        let mut pos = 0;

        loop {
            if self.done {
                return Ok(pos);
            }

            if self.content_length > 0 {
                let window = &buf[pos..];
                if window.is_empty() {
                    return Ok(pos);
                }

                let payload = window.len().min(self.content_length);

                if self.stderr {
                    write_stderr(stderr_sink, &window[..payload]);
                    pos += payload;
                    self.content_length -= payload;
                    continue;
                }

                let consumed = self.parse_headers(&window[..payload])?;
                pos += consumed;
                self.content_length -= consumed;

                if self.done {
                    return Ok(pos);
                }

                if consumed < payload {
                    // incomplete header line; need more data
                    return Ok(pos);
                }
                continue;
            }

            if self.skip_length > 0 {
                let n = (buf.len() - pos).min(self.skip_length);
                pos += n;
                self.skip_length -= n;
                if self.skip_length > 0 {
                    return Ok(pos);
                }
                continue;
            }

            let window = &buf[pos..];
            if window.len() < HEADER_LEN {
                return Ok(pos);
            }

            let header = RecordHeader::parse(&window[..HEADER_LEN].try_into().unwrap());
            pos += HEADER_LEN;

            self.content_length = header.content_length as usize;
            self.skip_length = header.padding_length as usize;

            if header.request_id != self.id {
                // wrong request id; discard this record
                self.skip_length += std::mem::take(&mut self.content_length);
                continue;
            }

            match header.record_type {
                RecordType::Stdout => self.stderr = false,
                RecordType::Stderr => self.stderr = true,
                RecordType::EndRequest => {
                    return Err(garbage(
                        "premature end of headers from FastCGI application",
                    ));
                }
                _ => {
                    self.skip_length += std::mem::take(&mut self.content_length);
                }
            }
        }
    }
}

fn write_stderr(sink: &mut Option<Box<dyn Write>>, payload: &[u8]) {
    // failures while forwarding STDERR must never disturb the response
    match sink.as_deref_mut() {
        Some(sink) => {
            let _ = sink.write_all(payload);
        }
        None => {
            let _ = std::io::stderr().write_all(payload);
        }
    }
}

/// The response body: a stream fed from the socket's input buffer.
pub struct FcgiBody<S, L: Lease<S>> {
    socket: BufferedSocket<S>,
    lease: Option<L>,
    stderr: Option<Box<dyn Write>>,
    id: u16,

    /// Payload bytes remaining in the current record.
    content_length: usize,

    /// Padding or ignored payload to drop.
    skip_length: usize,

    /// STDERR payload already handled by a previous bucket fill.
    skip_stderr: usize,

    /// The current record is STDERR.
    stderr_record: bool,

    /// END_REQUEST was seen; draining its payload/padding.
    end_request: bool,

    /// Body bytes remaining, once known.
    available: Option<u64>,

    /// A lease release decided during a bucket fill, applied as soon as
    /// the borrows are gone.
    pending_release: Option<PutAction>,

    no_body: bool,
    done: bool,
}

struct BufferAnalysis {
    /// Offset of the end of the END_REQUEST record, or 0 if none found.
    end_request_offset: usize,

    /// STDOUT payload bytes found in the buffer.
    total_stdout: u64,
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> FcgiBody<S, L> {
    /// Find the END_REQUEST record in the buffer, without consuming.
    fn analyse_buffer(&self) -> BufferAnalysis {
        let buf = self.socket.buffer();
        let mut result = BufferAnalysis {
            end_request_offset: 0,
            total_stdout: 0,
        };

        if self.content_length > 0 && !self.stderr_record {
            result.total_stdout += self.content_length as u64;
        }

        // skip the rest of the current record
        let mut pos = self.content_length + self.skip_length;

        while pos + HEADER_LEN <= buf.len() {
            let header = RecordHeader::parse(&buf[pos..pos + HEADER_LEN].try_into().unwrap());
            pos += HEADER_LEN + header.content_length as usize + header.padding_length as usize;

            if header.request_id == self.id {
                match header.record_type {
                    RecordType::EndRequest => {
                        result.end_request_offset = pos;
                        break;
                    }
                    RecordType::Stdout => {
                        result.total_stdout += header.content_length as u64;
                    }
                    _ => {}
                }
            }
        }

        result
    }

    /// Release the socket early when the whole remaining response is
    /// already buffered.
    fn release_if_complete(&mut self) {
        if !self.socket.is_connected() || self.lease.is_none() {
            return;
        }

        let analysis = self.analyse_buffer();
        if analysis.end_request_offset > 0 {
            let reuse = analysis.end_request_offset == self.socket.available();
            self.release_socket(if reuse {
                PutAction::Reuse
            } else {
                PutAction::Destroy
            });
        }
    }

    fn release_socket(&mut self, action: PutAction) {
        if let Some(mut lease) = self.lease.take() {
            if let Some(socket) = self.socket.abandon() {
                debug!(id = self.id, ?action, "release FastCGI connection");
                lease.release(socket, action);
            }
        }
    }

    fn apply_pending_release(&mut self) {
        if let Some(action) = self.pending_release.take() {
            self.release_socket(action);
        }
    }

    /// Pull more data from the socket.  Returns false when the peer
    /// closed.
    pub async fn fetch(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        if self.lease.is_none() && self.socket.is_empty() {
            // everything was already consumed
            return Ok(false);
        }

        match self.socket.fill(true).await {
            Ok(0) | Err(Error::ClosedPrematurely) => {
                self.release_socket(PutAction::Destroy);
                Err(Error::ClosedPrematurely)
            }
            Ok(_) => {
                self.release_if_complete();
                Ok(true)
            }
            Err(Error::Timeout) => {
                self.release_socket(PutAction::Destroy);
                Err(Error::Timeout)
            }
            Err(error) => {
                self.release_socket(PutAction::Destroy);
                Err(Error::fcgi_nested(
                    FcgiErrorCode::Io,
                    "FastCGI socket error",
                    error,
                ))
            }
        }
    }

    /// Drain and discard the rest of the response (HEAD and empty
    /// statuses).
    pub(crate) async fn drain(&mut self) -> Result<()> {
        use crate::stream::sink::DiscardSink;

        loop {
            let mut sink = DiscardSink::default();
            match self.read(&mut sink) {
                ReadResult::Done => return Ok(()),
                ReadResult::Pending => {
                    if !self.fetch().await? {
                        return Err(Error::ClosedPrematurely);
                    }
                }
                ReadResult::Blocked | ReadResult::Closed => {
                    return Err(garbage("response body drain stalled"));
                }
            }
        }
    }

    /// Collect the whole body.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        loop {
            let mut sink = crate::stream::sink::VecSink::default();
            let result = self.read(&mut sink);
            out.extend_from_slice(sink.data());

            match result {
                ReadResult::Done => {
                    return match sink.take_error() {
                        Some(error) => Err(error),
                        None => Ok(out),
                    };
                }
                ReadResult::Pending => {
                    if !self.fetch().await? {
                        return Err(Error::ClosedPrematurely);
                    }
                }
                ReadResult::Blocked | ReadResult::Closed => {
                    return Err(garbage("response body stalled"));
                }
            }
        }
    }

    fn finish(&mut self) {
        debug_assert!(!self.done);
        self.done = true;

        let reuse = self.socket.is_empty();
        self.release_socket(if reuse {
            PutAction::Reuse
        } else {
            PutAction::Destroy
        });
    }

    fn fail(&mut self, handler: &mut dyn StreamHandler, error: Error) -> ReadResult {
        self.done = true;
        self.release_socket(PutAction::Destroy);
        handler.on_error(error);
        ReadResult::Done
    }
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> Stream for FcgiBody<S, L> {
    fn available(&self, partial: bool) -> Option<u64> {
        if let Some(available) = self.available {
            return Some(available);
        }

        let analysis = self.analyse_buffer();
        if analysis.end_request_offset > 0 || partial {
            return Some(analysis.total_stdout);
        }

        None
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        self.apply_pending_release();

        if self.done {
            handler.on_eof();
            return ReadResult::Done;
        }

        loop {
            if self.content_length > 0 {
                let window = self.socket.buffer();
                if window.is_empty() {
                    return ReadResult::Pending;
                }

                let payload = window.len().min(self.content_length);

                if self.stderr_record {
                    let chunk = window[..payload].to_vec();
                    let skip = self.skip_stderr.min(chunk.len());
                    self.skip_stderr -= skip;
                    write_stderr(&mut self.stderr, &chunk[skip..]);
                    self.socket.consumed(payload);
                    self.content_length -= payload;
                    continue;
                }

                if self.no_body {
                    self.socket.consumed(payload);
                    self.content_length -= payload;
                    continue;
                }

                if let Some(available) = self.available {
                    if payload as u64 > available {
                        return self.fail(
                            handler,
                            garbage("excess data at end of body from FastCGI application"),
                        );
                    }
                }

                let chunk = window[..payload].to_vec();
                match handler.on_data(&chunk) {
                    DataAction::Consumed(0) => return ReadResult::Blocked,
                    DataAction::Consumed(n) => {
                        self.socket.consumed(n);
                        self.content_length -= n;
                        if let Some(available) = &mut self.available {
                            *available -= n as u64;
                        }

                        if n < payload {
                            return ReadResult::Blocked;
                        }
                    }
                    DataAction::Closed => return ReadResult::Closed,
                }
                continue;
            }

            if self.skip_length > 0 {
                let n = self.socket.available().min(self.skip_length);
                self.socket.consumed(n);
                self.skip_length -= n;

                if self.skip_length > 0 {
                    return ReadResult::Pending;
                }

                if self.end_request {
                    self.finish();
                    handler.on_eof();
                    return ReadResult::Done;
                }
                continue;
            }

            if self.end_request {
                self.finish();
                handler.on_eof();
                return ReadResult::Done;
            }

            let window = self.socket.buffer();
            if window.len() < HEADER_LEN {
                return ReadResult::Pending;
            }

            let header = RecordHeader::parse(&window[..HEADER_LEN].try_into().unwrap());

            self.content_length = header.content_length as usize;
            self.skip_length = header.padding_length as usize;

            if header.request_id != self.id {
                // records of other requests are skipped wholesale
                self.skip_length += std::mem::take(&mut self.content_length);
            } else {
                match header.record_type {
                    RecordType::Stdout => self.stderr_record = false,
                    RecordType::Stderr => self.stderr_record = true,
                    RecordType::EndRequest => {
                        if let Some(available) = self.available {
                            if available > 0 {
                                return self.fail(
                                    handler,
                                    garbage(
                                        "premature end of body from FastCGI application",
                                    ),
                                );
                            }
                        }

                        self.available = Some(0);
                        self.end_request = true;
                        self.skip_length += std::mem::take(&mut self.content_length);
                    }
                    _ => {
                        self.skip_length += std::mem::take(&mut self.content_length);
                    }
                }
            }

            self.socket.consumed(HEADER_LEN);
        }
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        self.apply_pending_release();

        if self.done {
            return Ok(());
        }

        // walk the record structure in place, without consuming
        let mut content_length = self.content_length;
        let mut skip_length = self.skip_length;
        let mut current_skip_stderr = self.skip_stderr;
        let mut current_stderr = self.stderr_record;
        let mut available = self.available;
        let mut found_end = self.end_request;
        let mut total: u64 = 0;
        let mut new_skip_stderr = 0;
        let mut consumed_to_end = false;

        // STDERR payloads are absorbed right here, never emitted as
        // buckets; remember how much so repeated fills stay idempotent
        {
            let Self {
                socket,
                stderr,
                id,
                ..
            } = self;

            let buf = socket.buffer();
            let mut pos = 0;

            loop {
                if content_length > 0 && current_stderr {
                    let remaining = buf.len() - pos;
                    let size = remaining.min(content_length);

                    if size > current_skip_stderr {
                        let payload = &buf[pos + current_skip_stderr..pos + size];
                        write_stderr(stderr, payload);
                        new_skip_stderr += payload.len();
                        current_skip_stderr = 0;
                    } else {
                        current_skip_stderr -= size;
                    }

                    pos += size;
                    content_length -= size;

                    if content_length > 0 {
                        break;
                    }
                }

                if content_length > 0 {
                    let remaining = buf.len() - pos;
                    if remaining == 0 {
                        break;
                    }

                    if let Some(a) = available {
                        if content_length as u64 > a {
                            return Err(garbage(
                                "excess data at end of body from FastCGI application",
                            ));
                        }
                    }

                    let mut size = remaining.min(content_length);
                    if let Some(a) = &mut available {
                        if size as u64 > *a {
                            size = *a as usize;
                        }
                        *a -= size as u64;
                    }

                    list.push(&buf[pos..pos + size]);
                    total += size as u64;
                    pos += size;
                    content_length -= size;

                    if content_length > 0 {
                        break;
                    }
                }

                if skip_length > 0 {
                    let remaining = buf.len() - pos;
                    let size = remaining.min(skip_length);
                    pos += size;
                    skip_length -= size;

                    if skip_length > 0 {
                        break;
                    }
                }

                if found_end {
                    break;
                }

                let remaining = buf.len() - pos;
                if remaining < HEADER_LEN {
                    break;
                }

                let header =
                    RecordHeader::parse(&buf[pos..pos + HEADER_LEN].try_into().unwrap());

                content_length = header.content_length as usize;
                skip_length = header.padding_length as usize;

                if header.request_id != *id {
                    skip_length += std::mem::take(&mut content_length);
                } else {
                    match header.record_type {
                        RecordType::EndRequest => {
                            if let Some(a) = available {
                                if a > 0 {
                                    return Err(garbage(
                                        "premature end of body from FastCGI application",
                                    ));
                                }
                            }
                            found_end = true;
                            skip_length += std::mem::take(&mut content_length);
                        }
                        RecordType::Stdout => current_stderr = false,
                        RecordType::Stderr => current_stderr = true,
                        _ => {
                            skip_length += std::mem::take(&mut content_length);
                        }
                    }
                }

                pos += HEADER_LEN;
            }

            consumed_to_end = pos == buf.len();
        }

        self.skip_stderr += new_skip_stderr;

        if self.available.is_none() && found_end && !self.end_request {
            // now the total body length is known
            self.available = Some(total);
        }

        if found_end && skip_length == 0 {
            if self.lease.is_some() {
                self.pending_release = Some(if consumed_to_end {
                    PutAction::Reuse
                } else {
                    PutAction::Destroy
                });
            }
        } else {
            list.set_more();
        }

        Ok(())
    }

    fn consume_buckets(&mut self, mut nbytes: usize) -> Consumed {
        self.apply_pending_release();

        let mut total = 0;

        loop {
            if self.content_length > 0 {
                let mut consumed = self.content_length;

                if self.stderr_record {
                    let buffered = self.socket.available();
                    consumed = consumed.min(buffered);
                    let skip = consumed.min(self.skip_stderr);
                    self.skip_stderr -= skip;
                } else {
                    consumed = consumed.min(nbytes);
                    nbytes -= consumed;
                    total += consumed;

                    if let Some(available) = &mut self.available {
                        *available = available.saturating_sub(consumed as u64);
                    }
                }

                self.socket.consumed(consumed);
                self.content_length -= consumed;

                if self.content_length > 0 {
                    break;
                }
                continue;
            }

            if self.skip_length > 0 {
                let n = self.socket.available().min(self.skip_length);
                if n == 0 {
                    break;
                }

                self.socket.consumed(n);
                self.skip_length -= n;

                if self.skip_length > 0 {
                    break;
                }
                continue;
            }

            if self.end_request {
                if !self.done {
                    self.finish();
                }
                return Consumed::new(total, true);
            }

            let window = self.socket.buffer();
            if window.len() < HEADER_LEN {
                break;
            }

            let header = RecordHeader::parse(&window[..HEADER_LEN].try_into().unwrap());

            self.content_length = header.content_length as usize;
            self.skip_length = header.padding_length as usize;

            if header.request_id != self.id {
                self.skip_length += std::mem::take(&mut self.content_length);
            } else {
                match header.record_type {
                    RecordType::EndRequest => {
                        self.end_request = true;
                        self.available = Some(0);
                        self.skip_length += std::mem::take(&mut self.content_length);
                    }
                    RecordType::Stdout => self.stderr_record = false,
                    RecordType::Stderr => self.stderr_record = true,
                    _ => {
                        self.skip_length += std::mem::take(&mut self.content_length);
                    }
                }
            }

            self.socket.consumed(HEADER_LEN);
        }

        debug_assert_eq!(nbytes, 0);
        Consumed::new(total, false)
    }

    fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.release_socket(PutAction::Destroy);
        }
    }
}

impl<S, L: Lease<S>> Drop for FcgiBody<S, L> {
    fn drop(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            if let Some(socket) = self.socket.abandon() {
                lease.release(socket, PutAction::Destroy);
            }
        }
    }
}
