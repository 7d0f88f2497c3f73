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

//! Zero-copy pull-mode batches: bounded lists of borrowed byte spans.

use smallvec::SmallVec;

/// Maximum number of buckets in one [`BucketList`].  Pushing into a full
/// list implicitly sets the `more` flag instead.
pub const MAX_BUCKETS: usize = 64;

/// A borrowed byte span emitted in pull mode.  The span stays valid until
/// the producing stream is consumed from or otherwise mutated.
#[derive(Debug, Clone, Copy)]
pub struct Bucket<'a>(&'a [u8]);

impl<'a> Bucket<'a> {
    pub const fn new(buffer: &'a [u8]) -> Self {
        Bucket(buffer)
    }

    pub const fn buffer(&self) -> &'a [u8] {
        self.0
    }

    pub const fn len(&self) -> usize {
        self.0.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> From<&'a [u8]> for Bucket<'a> {
    fn from(buffer: &'a [u8]) -> Self {
        Bucket(buffer)
    }
}

/// A bounded vector of [`Bucket`]s plus two producer flags.
///
/// `more` tells the consumer that the producer holds further data which was
/// not pushed in this round; `fallback` tells it that the producer cannot
/// enumerate further buckets at all and push mode should be used instead.
#[derive(Debug, Default)]
pub struct BucketList<'a> {
    list: SmallVec<[Bucket<'a>; MAX_BUCKETS]>,
    more: bool,
    fallback: bool,
}

impl<'a> BucketList<'a> {
    pub fn new() -> Self {
        BucketList::default()
    }

    pub fn set_more(&mut self) {
        self.more = true;
    }

    pub fn has_more(&self) -> bool {
        self.more
    }

    /// Request push-mode continuation.  Implies `more`.
    pub fn enable_fallback(&mut self) {
        self.fallback = true;
    }

    pub fn should_fallback(&self) -> bool {
        self.fallback
    }

    /// Copy the `more` and `fallback` flags from another list.
    pub fn copy_flags_from(&mut self, src: &BucketList<'_>) {
        self.more |= src.more;
        self.fallback |= src.fallback;
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.list.len() >= MAX_BUCKETS
    }

    pub fn clear(&mut self) {
        self.list.clear();
        self.more = false;
        self.fallback = false;
    }

    pub fn push(&mut self, bucket: impl Into<Bucket<'a>>) {
        if self.is_full() {
            self.set_more();
            return;
        }

        self.list.push(bucket.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket<'a>> {
        self.list.iter()
    }

    /// Total number of bytes in all buckets.
    pub fn total_size(&self) -> usize {
        self.list.iter().map(|b| b.len()).sum()
    }

    /// Whether consuming `consumed` bytes would exhaust this producer for
    /// good.
    pub fn is_depleted(&self, consumed: usize) -> bool {
        !self.more && consumed == self.total_size()
    }

    /// Move buckets over from `src`, stopping after `max_size` bytes.  A
    /// bucket crossing the budget is truncated.  Returns the number of
    /// bytes moved.  When `copy_more` is set, truncation or a pending
    /// `more` flag on `src` is reflected in this list's `more` flag.
    pub fn splice_buffers_from(
        &mut self, src: BucketList<'a>, mut max_size: usize, copy_more: bool,
    ) -> usize {
        if src.more && copy_more {
            self.set_more();
        }

        let mut total = 0;
        for bucket in src.list {
            if max_size == 0 {
                if copy_more {
                    self.set_more();
                }
                break;
            }

            let mut buffer = bucket.buffer();
            if buffer.len() > max_size {
                buffer = &buffer[..max_size];
                if copy_more {
                    self.set_more();
                }
            }

            max_size -= buffer.len();
            total += buffer.len();
            self.push(buffer);
        }

        total
    }

    /// Move all buckets over from `src`, carrying its flags.
    pub fn splice_from(&mut self, src: BucketList<'a>) -> usize {
        if src.more {
            self.set_more();
        }
        if src.fallback {
            self.enable_fallback();
        }

        let mut total = 0;
        for bucket in src.list {
            total += bucket.len();
            self.push(bucket);
        }

        total
    }

    /// Copy buckets from `src`, skipping the first `skip` bytes.  Returns
    /// the number of bytes copied.
    pub fn copy_buffers_from(&mut self, mut skip: usize, src: &BucketList<'a>) -> usize {
        if src.more {
            self.set_more();
        }

        let mut total = 0;
        for bucket in &src.list {
            let buffer = bucket.buffer();
            if buffer.len() > skip {
                let buffer = &buffer[skip..];
                skip = 0;
                total += buffer.len();
                self.push(buffer);
            } else {
                skip -= buffer.len();
            }
        }

        total
    }
}

impl<'a> IntoIterator for BucketList<'a> {
    type Item = Bucket<'a>;
    type IntoIter = smallvec::IntoIter<[Bucket<'a>; MAX_BUCKETS]>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_total() {
        let mut list = BucketList::new();
        list.push(&b"foo"[..]);
        list.push(&b"bar"[..]);
        assert_eq!(list.total_size(), 6);
        assert!(!list.has_more());
        assert!(list.is_depleted(6));
        assert!(!list.is_depleted(3));
    }

    #[test]
    fn overflow_sets_more() {
        let data = [0u8; 1];
        let mut list = BucketList::new();
        for _ in 0..MAX_BUCKETS {
            list.push(&data[..]);
        }
        assert!(list.is_full());
        assert!(!list.has_more());

        list.push(&data[..]);
        assert!(list.has_more());
        assert_eq!(list.total_size(), MAX_BUCKETS);
    }

    #[test]
    fn splice_with_byte_limit() {
        let mut src = BucketList::new();
        src.push(&b"hello"[..]);
        src.push(&b"world"[..]);

        let mut dst = BucketList::new();
        let n = dst.splice_buffers_from(src, 7, true);
        assert_eq!(n, 7);
        assert_eq!(dst.total_size(), 7);
        assert!(dst.has_more());

        let parts: Vec<&[u8]> = dst.iter().map(|b| b.buffer()).collect();
        assert_eq!(parts, [&b"hello"[..], &b"wo"[..]]);
    }

    #[test]
    fn copy_with_skip() {
        let mut src = BucketList::new();
        src.push(&b"hello"[..]);
        src.push(&b"world"[..]);
        src.set_more();

        let mut dst = BucketList::new();
        let n = dst.copy_buffers_from(6, &src);
        assert_eq!(n, 4);
        assert!(dst.has_more());
        let parts: Vec<&[u8]> = dst.iter().map(|b| b.buffer()).collect();
        assert_eq!(parts, [&b"orld"[..]]);
    }
}
