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

//! Header line parsing and marshalling helpers.

use crate::{
    buffer::GrowingBuffer,
    error::{Error, HttpErrorCode, Result},
};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Parse one `Name: value` line into the map.
pub fn parse_header_line(headers: &mut HeaderMap, line: &[u8]) -> Result<()> {
    let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
        Error::http(HttpErrorCode::Garbage, "malformed HTTP header line")
    })?;

    let name = HeaderName::from_bytes(line[..colon].trim_ascii())
        .map_err(|_| Error::http(HttpErrorCode::Garbage, "malformed HTTP header line"))?;
    let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
        .map_err(|_| Error::http(HttpErrorCode::Garbage, "malformed HTTP header line"))?;

    headers.append(name, value);
    Ok(())
}

/// Append one header line to the wire representation.
pub fn write_header(out: &mut GrowingBuffer, name: &str, value: &[u8]) {
    out.write(name.as_bytes());
    out.write(b": ");
    out.write(value);
    out.write(b"\r\n");
}

/// Append all headers of the map.
pub fn write_headers(out: &mut GrowingBuffer, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        write_header(out, name.as_str(), value.as_bytes());
    }
}

/// Case-insensitive membership test in a comma-separated token list.
pub fn list_contains(list: &str, token: &str) -> bool {
    list.split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line() {
        let mut headers = HeaderMap::new();
        parse_header_line(&mut headers, b"Content-Type: text/html").unwrap();
        assert_eq!(headers["content-type"], "text/html");
    }

    #[test]
    fn rejects_missing_colon() {
        let mut headers = HeaderMap::new();
        assert!(parse_header_line(&mut headers, b"no colon here").is_err());
    }

    #[test]
    fn token_lists() {
        assert!(list_contains("keep-alive, Upgrade", "upgrade"));
        assert!(!list_contains("keep-alive", "close"));
    }

    #[test]
    fn writes_lines() {
        let mut out = GrowingBuffer::new();
        write_header(&mut out, "host", b"example.com");
        assert_eq!(out.to_vec(), b"host: example.com\r\n");
    }
}
