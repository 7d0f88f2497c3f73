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

//! Serialization of FastCGI PARAMS records.

use crate::{
    buffer::GrowingBuffer,
    fcgi::{RecordHeader, RecordType, MAX_CONTENT},
};

/// Append a name/value length in the 1-or-4-byte encoding.
fn put_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else {
        out.extend_from_slice(&((length as u32) | (1 << 31)).to_be_bytes());
    }
}

/// Accumulates name/value pairs and emits them as a sequence of PARAMS
/// records.
pub struct FcgiParamsSerializer {
    request_id: u16,
    content: Vec<u8>,
}

impl FcgiParamsSerializer {
    pub fn new(request_id: u16) -> Self {
        FcgiParamsSerializer {
            request_id,
            content: Vec::new(),
        }
    }

    pub fn pair(&mut self, name: &str, value: &[u8]) -> &mut Self {
        put_length(&mut self.content, name.len());
        put_length(&mut self.content, value.len());
        self.content.extend_from_slice(name.as_bytes());
        self.content.extend_from_slice(value);
        self
    }

    /// Write all accumulated pairs as PARAMS records, followed by the
    /// empty end-of-params record.
    pub fn commit(self, out: &mut GrowingBuffer) {
        let mut content = &self.content[..];

        while !content.is_empty() {
            let chunk = content.len().min(MAX_CONTENT);
            let header =
                RecordHeader::new(RecordType::Params, self.request_id, chunk as u16);
            out.write(&header.encode());
            out.write(&content[..chunk]);
            content = &content[chunk..];
        }

        let end = RecordHeader::new(RecordType::Params, self.request_id, 0);
        out.write(&end.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcgi::HEADER_LEN;

    #[test]
    fn serializes_pairs_with_terminator() {
        let mut serializer = FcgiParamsSerializer::new(7);
        serializer
            .pair("REQUEST_METHOD", b"GET")
            .pair("QUERY_STRING", b"");

        let mut out = GrowingBuffer::new();
        serializer.commit(&mut out);
        let bytes = out.to_vec();

        let header = RecordHeader::parse(&bytes[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.record_type, RecordType::Params);
        assert_eq!(header.request_id, 7);

        let content =
            &bytes[HEADER_LEN..HEADER_LEN + header.content_length as usize];
        assert_eq!(content[0] as usize, "REQUEST_METHOD".len());
        assert_eq!(content[1] as usize, 3);
        assert_eq!(&content[2..16], b"REQUEST_METHOD");
        assert_eq!(&content[16..19], b"GET");

        // terminator record at the very end
        let tail: &[u8; HEADER_LEN] =
            &bytes[bytes.len() - HEADER_LEN..].try_into().unwrap();
        let tail = RecordHeader::parse(tail);
        assert_eq!(tail.record_type, RecordType::Params);
        assert_eq!(tail.content_length, 0);
    }

    #[test]
    fn long_value_uses_four_byte_length() {
        let value = vec![b'v'; 300];
        let mut serializer = FcgiParamsSerializer::new(1);
        serializer.pair("NAME", &value);

        let mut out = GrowingBuffer::new();
        serializer.commit(&mut out);
        let bytes = out.to_vec();

        let content = &bytes[HEADER_LEN..];
        assert_eq!(content[0], 4);
        // high bit marks the long form
        assert_eq!(content[1] & 0x80, 0x80);
        let long = u32::from_be_bytes([content[1], content[2], content[3], content[4]]);
        assert_eq!(long & 0x7fff_ffff, 300);
    }
}
