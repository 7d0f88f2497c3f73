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

//! The HTTP/1.1 client: request serialization, response parsing and
//! keep-alive handling.

use crate::{
    buffer::GrowingBuffer,
    error::{Error, HttpErrorCode, Result},
    http::{
        body::{BodyKind, EndSeen, HttpBody, RawBody, Rest},
        headers::{list_contains, parse_header_line, write_header},
    },
    lease::{Lease, NoopStopwatch, PutAction, Stopwatch},
    socket::{pump_stream, BufferedSocket, PumpOutcome, SpliceTarget},
    stream::{
        chunked::ChunkedStream, concat::ConcatStream, dechunk::DechunkStream,
        source::GrowingBufferStream, FdMask, Stream,
    },
};
use http::{HeaderMap, Method, StatusCode};
use std::{cell::Cell, rc::Rc};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Bodies of at least this size ask the server for confirmation with
/// `Expect: 100-continue`.
pub const EXPECT_100_THRESHOLD: u64 = 1024;

/// A request body and how to frame it.
pub enum RequestBody {
    None,

    /// Plain data; framed by content-length or chunked encoding.
    Plain(Box<dyn Stream>),

    /// The stream already carries chunked framing (a dechunked stream in
    /// verbatim mode); forwarded unchanged.
    VerbatimChunked(Box<dyn Stream>),
}

/// An HTTP request.
pub struct HttpRequest<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub headers: HeaderMap,
    pub body: RequestBody,

    /// Offer the server a chance to decline a large body.
    pub expect_100: bool,
}

impl<'a> HttpRequest<'a> {
    pub fn new(method: Method, uri: &'a str) -> Self {
        HttpRequest {
            method,
            uri,
            headers: HeaderMap::new(),
            body: RequestBody::None,
            expect_100: false,
        }
    }
}

/// The response head plus the body stream.
pub struct HttpResponse<S, L: Lease<S>> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HttpBody<S, L>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Status,
    Headers,
}

/// Async client for one HTTP/1.1 request over a leased connection.
pub struct HttpClient<S, L: Lease<S>> {
    socket: BufferedSocket<S>,
    lease: Option<L>,
    stopwatch: Box<dyn Stopwatch>,
    keep_alive: bool,
}

fn garbage(message: &str) -> Error {
    Error::http(HttpErrorCode::Garbage, message.to_string())
}

impl<S: AsyncRead + AsyncWrite + SpliceTarget + Unpin, L: Lease<S>> HttpClient<S, L> {
    pub fn new(socket: S, lease: L) -> Self {
        HttpClient {
            socket: BufferedSocket::new(socket),
            lease: Some(lease),
            stopwatch: Box::new(NoopStopwatch),
            keep_alive: true,
        }
    }

    /// Attach an event recorder for request tracing.
    pub fn with_stopwatch(mut self, stopwatch: Box<dyn Stopwatch>) -> Self {
        self.stopwatch = stopwatch;
        self
    }

    fn release_socket(&mut self, action: PutAction) {
        if let Some(mut lease) = self.lease.take() {
            if let Some(socket) = self.socket.abandon() {
                debug!(?action, "release HTTP connection");
                lease.release(socket, action);
            }
        }
    }

    /// Give the connection up and return the error.
    fn fail(&mut self, error: Error) -> Error {
        self.release_socket(PutAction::Destroy);
        error
    }

    /// Send the request and parse the response head.
    pub async fn execute(mut self, request: HttpRequest<'_>) -> Result<HttpResponse<S, L>> {
        debug!(method = %request.method, uri = request.uri, "start HTTP request");

        let no_body_response = request.method == Method::HEAD;
        let mut headers = GrowingBuffer::new();

        headers.write(request.method.as_str().as_bytes());
        headers.write(b" ");
        headers.write(request.uri.as_bytes());
        headers.write(b" HTTP/1.1\r\n");

        let request_upgrade = request
            .headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| list_contains(v, "upgrade"));

        // the body, framed for the wire
        let mut body: Option<Box<dyn Stream>> = None;
        let mut pending_body: Option<Box<dyn Stream>> = None;

        match request.body {
            RequestBody::None => {}
            RequestBody::Plain(b) if request_upgrade => {
                // forward the hop-by-hop headers asking for the upgrade
                write_header(&mut headers, "connection", b"upgrade");
                if let Some(value) = request.headers.get(http::header::UPGRADE) {
                    write_header(&mut headers, "upgrade", value.as_bytes());
                }
                self.keep_alive = false;
                body = Some(b);
            }
            RequestBody::VerbatimChunked(b) => {
                write_header(&mut headers, "transfer-encoding", b"chunked");
                body = Some(b);
            }
            RequestBody::Plain(b) => {
                let framed: Box<dyn Stream> = match b.available(false) {
                    Some(content_length) => {
                        write_header(
                            &mut headers,
                            "content-length",
                            content_length.to_string().as_bytes(),
                        );
                        b
                    }
                    None => {
                        write_header(&mut headers, "transfer-encoding", b"chunked");
                        Box::new(ChunkedStream::new(b))
                    }
                };

                let partial = framed.available(true);
                if request.expect_100
                    && partial.map_or(true, |n| n >= EXPECT_100_THRESHOLD)
                {
                    // large request body: ask the server for confirmation
                    write_header(&mut headers, "expect", b"100-continue");
                    pending_body = Some(framed);
                } else {
                    body = Some(framed);
                }
            }
        }

        for (name, value) in request.headers.iter() {
            if *name == http::header::CONNECTION
                || *name == http::header::UPGRADE
                || *name == http::header::TRANSFER_ENCODING
                || *name == http::header::CONTENT_LENGTH
                || *name == http::header::EXPECT
            {
                continue;
            }
            write_header(&mut headers, name.as_str(), value.as_bytes());
        }
        headers.write(b"\r\n");

        let mut request_stream: Box<dyn Stream> = match body {
            Some(body) => {
                let parts: Vec<Box<dyn Stream>> = vec![
                    Box::new(GrowingBufferStream::new(headers)),
                    body,
                ];
                Box::new(ConcatStream::new(parts))
            }
            None => Box::new(GrowingBufferStream::new(headers)),
        };

        match pump_stream(&mut self.socket, request_stream.as_mut()).await {
            Ok(PumpOutcome::Done) => {}
            Ok(PumpOutcome::Pending) => {
                return Err(self.fail(Error::http(
                    HttpErrorCode::Unspecified,
                    "request stream stalled",
                )));
            }
            Ok(PumpOutcome::Broken) => {
                // the server is not interested in the rest of the
                // request; it may still send a response
                self.keep_alive = false;
                pending_body = None;
            }
            Err(Error::ClosedPrematurely) => {
                return Err(self.fail(Error::http(
                    HttpErrorCode::Refused,
                    "server closed the socket prematurely without sending any response data",
                )));
            }
            Err(error) => {
                return Err(
                    self.fail(Error::http_nested(HttpErrorCode::Io, "write error", error))
                );
            }
        }

        self.stopwatch.record("request_end");
        debug!("request sent");

        // response head
        let mut state = ParseState::Status;
        let mut status = StatusCode::OK;
        let mut headers = HeaderMap::new();
        let mut got_anything = false;

        loop {
            let mut made_progress = true;
            while made_progress {
                made_progress = false;

                let Some(line_end) =
                    self.socket.buffer().iter().position(|&b| b == b'\n')
                else {
                    break;
                };

                got_anything = true;
                let mut line = self.socket.buffer()[..line_end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.socket.consumed(line_end + 1);

                match state {
                    ParseState::Status => {
                        status = parse_status_line(&line).map_err(|e| self.fail(e))?;
                        state = ParseState::Headers;
                        made_progress = true;
                    }
                    ParseState::Headers => {
                        if line.is_empty() {
                            // end of this header block
                            if status == StatusCode::CONTINUE {
                                let Some(mut resume) = pending_body.take() else {
                                    return Err(self.fail(Error::http(
                                        HttpErrorCode::Unspecified,
                                        "unexpected status 100",
                                    )));
                                };

                                debug!("100 Continue; resuming request body");

                                match pump_stream(&mut self.socket, resume.as_mut())
                                    .await
                                {
                                    Ok(PumpOutcome::Done) => {}
                                    Ok(PumpOutcome::Pending) => {
                                        return Err(self.fail(Error::http(
                                            HttpErrorCode::Unspecified,
                                            "request stream stalled",
                                        )));
                                    }
                                    Ok(PumpOutcome::Broken) => {
                                        self.keep_alive = false;
                                    }
                                    Err(error) => {
                                        return Err(self.fail(Error::http_nested(
                                            HttpErrorCode::Io,
                                            "write error",
                                            error,
                                        )));
                                    }
                                }

                                // expect the real response now
                                state = ParseState::Status;
                                headers = HeaderMap::new();
                                made_progress = true;
                                continue;
                            }

                            self.stopwatch.record("headers");
                            return self.submit_response(
                                status,
                                headers,
                                no_body_response,
                                request_upgrade,
                            );
                        }

                        parse_header_line(&mut headers, &line)
                            .map_err(|e| self.fail(e))?;
                        made_progress = true;
                    }
                }
            }

            match self.socket.fill(true).await {
                Ok(0) | Err(Error::ClosedPrematurely) => {
                    let error = if !got_anything {
                        Error::http(
                            HttpErrorCode::Refused,
                            "server closed the socket prematurely without sending any response data",
                        )
                    } else {
                        Error::http(
                            HttpErrorCode::Premature,
                            "server closed the socket prematurely in the response head",
                        )
                    };
                    return Err(self.fail(error));
                }
                Ok(_) => {}
                Err(Error::Timeout) => return Err(self.fail(Error::Timeout)),
                Err(error) => {
                    return Err(self.fail(Error::http_nested(
                        HttpErrorCode::Io,
                        "HTTP client socket error",
                        error,
                    )));
                }
            }
        }
    }

    /// Decide the body framing and hand the response to the caller.
    fn submit_response(
        mut self, status: StatusCode, mut headers: HeaderMap, no_body_response: bool,
        request_upgrade: bool,
    ) -> Result<HttpResponse<S, L>> {
        // hop-by-hop headers are consumed here
        let connection = headers.remove(http::header::CONNECTION);
        if let Some(connection) = &connection {
            if let Ok(value) = connection.to_str() {
                if list_contains(value, "close") {
                    self.keep_alive = false;
                }
            }
        }

        let transfer_encoding = headers.remove(http::header::TRANSFER_ENCODING);
        let content_length = headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(http::header::PROXY_AUTHENTICATE);

        let empty_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let no_body = no_body_response || empty_status;

        if no_body {
            return self.finish_without_body(status, headers);
        }

        let chunked = transfer_encoding
            .as_ref()
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));

        let rest = if chunked {
            Rest::ChunkedRaw
        } else if let Some(value) = &content_length {
            let length = value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::http(
                        HttpErrorCode::Unspecified,
                        "invalid Content-Length header in response",
                    )
                })
                .map_err(|e| self.fail(e))?;

            if length == 0 {
                return self.finish_without_body(status, headers);
            }

            Rest::Known(length)
        } else {
            let upgrade = request_upgrade
                && (status == StatusCode::SWITCHING_PROTOCOLS
                    || connection
                        .as_ref()
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| list_contains(v, "upgrade")));

            if upgrade {
                self.keep_alive = false;
            } else if self.keep_alive {
                return Err(self.fail(Error::http(
                    HttpErrorCode::Unspecified,
                    "no Content-Length response header",
                )));
            }

            Rest::UntilEof
        };

        debug!(status = %status, ?rest, "response headers received");

        let end_seen = Rc::new(Cell::new(false));
        let mut raw = RawBody {
            socket: self.socket,
            lease: self.lease.take(),
            rest,
            keep_alive: self.keep_alive,
            end_seen: end_seen.clone(),
            direct_mask: FdMask::NONE,
            peer_done: false,
        };
        raw.release_if_done();

        let body = HttpBody {
            kind: match rest {
                Rest::ChunkedRaw => {
                    BodyKind::Chunked(DechunkStream::new(raw, EndSeen(end_seen)))
                }
                _ => BodyKind::Plain(raw),
            },
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn finish_without_body(
        mut self, status: StatusCode, headers: HeaderMap,
    ) -> Result<HttpResponse<S, L>> {
        self.stopwatch.record("end");

        if !self.socket.is_empty() {
            warn!("excess data after HTTP response");
            self.keep_alive = false;
        }

        let action = if self.keep_alive {
            PutAction::Reuse
        } else {
            PutAction::Destroy
        };
        self.release_socket(action);

        Ok(HttpResponse {
            status,
            headers,
            body: HttpBody {
                kind: BodyKind::Empty,
            },
        })
    }
}

fn parse_status_line(line: &[u8]) -> Result<StatusCode> {
    let line = line
        .strip_prefix(b"HTTP/")
        .ok_or_else(|| garbage("malformed HTTP status line"))?;

    let space = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| garbage("no HTTP status found"))?;

    let status = &line[space + 1..];
    if status.len() < 3 || !status[..3].iter().all(u8::is_ascii_digit) {
        return Err(garbage("no HTTP status found"));
    }

    StatusCode::from_bytes(&status[..3]).map_err(|_| garbage("invalid HTTP status"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_lines() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 200 OK").unwrap(),
            StatusCode::OK
        );
        assert_eq!(
            parse_status_line(b"HTTP/1.1 404 Not Found").unwrap(),
            StatusCode::NOT_FOUND
        );
        assert!(parse_status_line(b"ICY 200 OK").is_err());
        assert!(parse_status_line(b"HTTP/1.1 xx").is_err());
        assert!(parse_status_line(b"HTTP/1.1 99").is_err());
    }
}
