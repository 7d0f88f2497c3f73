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

//! FastCGI protocol metadata: record headers, record types and the
//! begin/end request payloads.

pub mod client;
pub mod serialize;
pub mod stdin;

pub use client::{FcgiBody, FcgiClient, FcgiRequest, FcgiResponse};

/// FastCGI protocol version 1.
pub(crate) const VERSION_1: u8 = 1;

/// Length of a record header in bytes.
pub(crate) const HEADER_LEN: usize = 8;

/// Maximum payload of one record.
pub(crate) const MAX_CONTENT: usize = 0xffff;

/// Flag in the BEGIN_REQUEST body: keep the connection open after the
/// request.
pub(crate) const FLAG_KEEP_CONN: u8 = 1;

/// FastCGI record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    Unknown = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            _ => RecordType::Unknown,
        }
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    #[allow(dead_code)]
    Authorizer = 2,
    #[allow(dead_code)]
    Filter = 3,
}

/// The 8-byte record header.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        RecordHeader {
            version: VERSION_1,
            record_type,
            request_id,
            content_length,
            padding_length: 0,
        }
    }

    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        RecordHeader {
            version: buf[0],
            record_type: RecordType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type as u8,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }
}

/// Payload of a BEGIN_REQUEST record.
pub(crate) fn begin_request_body(role: Role, keep_alive: bool) -> [u8; 8] {
    let role = (role as u16).to_be_bytes();
    let flags = if keep_alive { FLAG_KEEP_CONN } else { 0 };
    [role[0], role[1], flags, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = RecordHeader::new(RecordType::Stdout, 0x1234, 0xabc);
        let encoded = header.encode();
        let parsed = RecordHeader::parse(&encoded);
        assert_eq!(parsed.version, VERSION_1);
        assert_eq!(parsed.record_type, RecordType::Stdout);
        assert_eq!(parsed.request_id, 0x1234);
        assert_eq!(parsed.content_length, 0xabc);
        assert_eq!(parsed.padding_length, 0);
    }

    #[test]
    fn begin_request_flags() {
        let body = begin_request_body(Role::Responder, true);
        assert_eq!(&body[..3], &[0, 1, FLAG_KEEP_CONN]);
        let body = begin_request_body(Role::Responder, false);
        assert_eq!(body[2], 0);
    }
}
