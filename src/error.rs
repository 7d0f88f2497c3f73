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

//! Error types and result type alias shared by all stream stages and
//! protocol clients.
//!
//! Retryability is a pure function of the outermost error code: callers
//! use [`Error::is_retryable`] to decide whether a failed request may be
//! reissued on a fresh connection.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes of the FastCGI client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcgiErrorCode {
    /// Unspecified error; not retryable.
    Unspecified,

    /// The server refused the request before anything was transferred.
    Refused,

    /// An I/O failure on the FastCGI connection.
    Io,

    /// The server sent a malformed response; not retryable.
    Garbage,
}

/// Error codes of the HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorCode {
    /// Unspecified error; not retryable.
    Unspecified,

    /// The server closed the connection without sending any response data.
    Refused,

    /// The server closed the connection before the response body was
    /// complete.
    Premature,

    /// An I/O failure on the HTTP connection.
    Io,

    /// The server sent something that is not HTTP.
    Garbage,
}

/// Error types that can occur inside a stream pipeline or one of the
/// protocol clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrapper of `std::io::Error`.  `EAGAIN`/`WouldBlock` is never
    /// surfaced through this variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer closed the socket before a framed body was complete.
    #[error("peer closed the socket prematurely")]
    ClosedPrematurely,

    /// No activity on the socket within the configured window.
    #[error("socket timeout")]
    Timeout,

    /// The handler demanded more data while the input buffer was already
    /// full.
    #[error("input buffer overflow")]
    BufferOverflow,

    /// FastCGI client failure.
    #[error("FastCGI client: {message}")]
    Fcgi {
        code: FcgiErrorCode,
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// HTTP client failure.
    #[error("HTTP client: {message}")]
    Http {
        code: HttpErrorCode,
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Free-form stream error, used by stages that wrap or fabricate
    /// errors (fault injection, error-catch filters, size caps).
    #[error("{0}")]
    Message(String),
}

impl Error {
    pub(crate) fn fcgi(code: FcgiErrorCode, message: impl Into<String>) -> Self {
        Error::Fcgi {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn fcgi_nested(
        code: FcgiErrorCode, message: impl Into<String>, source: Error,
    ) -> Self {
        Error::Fcgi {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn http(code: HttpErrorCode, message: impl Into<String>) -> Self {
        Error::Http {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn http_nested(
        code: HttpErrorCode, message: impl Into<String>, source: Error,
    ) -> Self {
        Error::Http {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the caller may retry the request on a fresh connection.
    ///
    /// Protocol errors are final; connection-level failures that happened
    /// before the response could be produced are worth a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ClosedPrematurely => true,
            Error::Fcgi { code, .. } => {
                matches!(code, FcgiErrorCode::Refused | FcgiErrorCode::Io)
            }
            Error::Http { code, .. } => !matches!(code, HttpErrorCode::Unspecified),
            _ => false,
        }
    }

    /// The FastCGI error code, if this is a FastCGI client error.
    pub fn fcgi_code(&self) -> Option<FcgiErrorCode> {
        match self {
            Error::Fcgi { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The HTTP error code, if this is an HTTP client error.
    pub fn http_code(&self) -> Option<HttpErrorCode> {
        match self {
            Error::Http { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(Error::ClosedPrematurely.is_retryable());
        assert!(Error::fcgi(FcgiErrorCode::Refused, "refused").is_retryable());
        assert!(Error::fcgi(FcgiErrorCode::Io, "io").is_retryable());
        assert!(!Error::fcgi(FcgiErrorCode::Garbage, "garbage").is_retryable());
        assert!(!Error::fcgi(FcgiErrorCode::Unspecified, "other").is_retryable());

        assert!(Error::http(HttpErrorCode::Premature, "premature").is_retryable());
        assert!(Error::http(HttpErrorCode::Garbage, "garbage").is_retryable());
        assert!(!Error::http(HttpErrorCode::Unspecified, "other").is_retryable());

        assert!(!Error::Timeout.is_retryable());
        assert!(!Error::BufferOverflow.is_retryable());
    }
}
