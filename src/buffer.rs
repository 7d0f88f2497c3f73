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

//! An auto-growing chunked byte buffer, used for marshalling request
//! headers and protocol records.
//!
//! Data lives in a chain of fixed-size chunks; the reader cursor consumes
//! from the front and releases each chunk once it has been passed.  An
//! empty buffer can reserve space at the front so that a prefix (for
//! example a status line) can be inserted after the rest was written.

use crate::stream::BucketList;
use std::collections::VecDeque;

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

struct Chunk {
    data: Box<[u8]>,
    fill: usize,
}

impl Chunk {
    fn new(size: usize) -> Self {
        Chunk {
            data: vec![0; size].into_boxed_slice(),
            fill: 0,
        }
    }

    fn spare(&self) -> usize {
        self.data.len() - self.fill
    }
}

/// An auto-growing buffer you can write to.
pub struct GrowingBuffer {
    chunks: VecDeque<Chunk>,
    chunk_size: usize,

    /// Read cursor into the first chunk.  Doubles as the remaining
    /// reserve after [`GrowingBuffer::reserve`].
    position: usize,
}

impl Default for GrowingBuffer {
    fn default() -> Self {
        GrowingBuffer::new()
    }
}

impl GrowingBuffer {
    pub fn new() -> Self {
        GrowingBuffer::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);

        GrowingBuffer {
            chunks: VecDeque::new(),
            chunk_size,
            position: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total number of unread bytes.
    pub fn size(&self) -> usize {
        self.chunks.iter().map(|c| c.fill).sum::<usize>() - self.position
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.position = 0;
    }

    /// Reserve at least one byte of space at the tail and return the
    /// writable range.
    pub fn begin_write(&mut self, min: usize) -> &mut [u8] {
        let need_new = match self.chunks.back() {
            Some(tail) => tail.spare() < min.max(1),
            None => true,
        };

        if need_new {
            self.chunks.push_back(Chunk::new(self.chunk_size.max(min)));
        }

        let tail = self.chunks.back_mut().unwrap();
        let fill = tail.fill;
        &mut tail.data[fill..]
    }

    /// Commit bytes written into the range returned by
    /// [`GrowingBuffer::begin_write`].
    pub fn commit_write(&mut self, n: usize) {
        let tail = self.chunks.back_mut().unwrap();
        assert!(n <= tail.spare());
        tail.fill += n;
    }

    /// Append, splitting across chunks as needed.  Small writes land in
    /// the current tail chunk.
    pub fn write(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let dest = self.begin_write(1);
            let n = dest.len().min(src.len());
            dest[..n].copy_from_slice(&src[..n]);
            self.commit_write(n);
            src = &src[n..];
        }
    }

    pub fn write_str(&mut self, src: &str) {
        self.write(src.as_bytes());
    }

    /// Move all chunks of `src` to the tail of this buffer.
    pub fn append_from(&mut self, mut src: GrowingBuffer) {
        assert_eq!(src.position, 0);
        self.chunks.append(&mut src.chunks);
    }

    /// Reserve space at the beginning of an empty buffer, to be claimed
    /// later by [`GrowingBuffer::prepend`].
    pub fn reserve(&mut self, n: usize) {
        assert!(self.chunks.is_empty());
        assert_eq!(self.position, 0);

        let dest = self.begin_write(n);
        debug_assert!(dest.len() >= n);
        self.commit_write(n);
        self.position = n;
    }

    /// Claim `n` bytes in front of the current beginning.  Requires a
    /// prior [`GrowingBuffer::reserve`] of at least that much.
    pub fn prepend(&mut self, n: usize) -> &mut [u8] {
        assert!(self.position >= n);

        self.position -= n;
        let position = self.position;
        let first = self.chunks.front_mut().unwrap();
        &mut first.data[position..position + n]
    }

    /// The contiguous unread span at the front.  Empty iff the buffer is
    /// empty.
    pub fn read(&self) -> &[u8] {
        match self.chunks.front() {
            Some(first) => &first.data[self.position..first.fill],
            None => &[],
        }
    }

    /// Consume data returned by [`GrowingBuffer::read`].
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }

        let first = self.chunks.front().unwrap();
        assert!(self.position + n <= first.fill);
        self.position += n;
        self.release_front();
    }

    /// Discard bytes, which may span several chunks.
    pub fn skip(&mut self, mut n: usize) {
        while n > 0 {
            let span = self.read().len();
            assert!(span > 0);
            let step = span.min(n);
            self.consume(step);
            n -= step;
        }
    }

    fn release_front(&mut self) {
        while let Some(first) = self.chunks.front() {
            if self.position < first.fill {
                break;
            }

            self.position = 0;
            self.chunks.pop_front();
        }
    }

    /// Flatten the whole content into one vector, without consuming.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        let mut skip = self.position;
        for chunk in &self.chunks {
            let span = &chunk.data[..chunk.fill];
            if skip >= span.len() {
                skip -= span.len();
                continue;
            }
            out.extend_from_slice(&span[skip..]);
            skip = 0;
        }
        out
    }

    /// Emit all unread chunks as buckets.
    pub fn fill_buckets<'a>(&'a self, list: &mut BucketList<'a>) {
        let mut skip = self.position;
        for chunk in &self.chunks {
            let mut span = &chunk.data[..chunk.fill];
            if skip > 0 {
                if skip >= span.len() {
                    skip -= span.len();
                    continue;
                }
                span = &span[skip..];
                skip = 0;
            }

            if !span.is_empty() {
                list.push(span);
            }
        }
    }

    /// Consume bytes observed through [`GrowingBuffer::fill_buckets`].
    /// Returns the number actually consumed.
    pub fn consume_buckets(&mut self, n: usize) -> usize {
        let n = n.min(self.size());
        self.skip(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_across_chunks() {
        let mut gb = GrowingBuffer::with_chunk_size(4);
        gb.write(b"hello world");
        assert_eq!(gb.size(), 11);

        let mut out = Vec::new();
        while !gb.is_empty() {
            let span = gb.read().to_vec();
            assert!(!span.is_empty());
            gb.consume(span.len());
            out.extend_from_slice(&span);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(gb.size(), 0);
    }

    #[test]
    fn reserve_and_prepend() {
        let mut gb = GrowingBuffer::with_chunk_size(64);
        gb.reserve(4);
        gb.write(b"body");
        gb.prepend(4).copy_from_slice(b"head");
        assert_eq!(gb.to_vec(), b"headbody");
        assert_eq!(gb.size(), 8);
    }

    #[test]
    fn partial_prepend() {
        let mut gb = GrowingBuffer::with_chunk_size(64);
        gb.reserve(8);
        gb.write(b"tail");
        gb.prepend(2).copy_from_slice(b"x:");
        // the unclaimed part of the reserve stays in front of the cursor
        assert_eq!(gb.size(), 2 + 4);
        assert_eq!(gb.to_vec(), b"x:tail");
    }

    #[test]
    fn buckets_cover_all_chunks() {
        let mut gb = GrowingBuffer::with_chunk_size(3);
        gb.write(b"abcdefgh");

        let mut list = BucketList::new();
        gb.fill_buckets(&mut list);
        let total: Vec<u8> = list
            .iter()
            .flat_map(|b| b.buffer().iter().copied())
            .collect();
        assert_eq!(total, b"abcdefgh");
        drop(list);

        assert_eq!(gb.consume_buckets(5), 5);
        assert_eq!(gb.to_vec(), b"fgh");
    }

    #[test]
    fn append_from_moves_chunks() {
        let mut a = GrowingBuffer::with_chunk_size(4);
        a.write(b"one");
        let mut b = GrowingBuffer::with_chunk_size(4);
        b.write(b"twothree");
        a.append_from(b);
        assert_eq!(a.to_vec(), b"onetwothree");
    }
}
