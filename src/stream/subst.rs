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

//! String substitution over a ternary search tree.
//!
//! The filter scans its input for any of the registered search words and
//! replaces them on the fly.  A partially matched word whose continuation
//! turns out not to match is replayed through the parser, with its first
//! byte forcibly emitted so the same mismatch cannot recur.  A partial
//! match at end of input is emitted verbatim.

use crate::{
    error::{Error, Result},
    stream::{BucketList, Consumed, DataAction, ReadResult, Stream, StreamHandler},
};

type NodeId = usize;

struct Leaf {
    /// The search word.
    a: Box<[u8]>,
    /// The replacement.
    b: Box<[u8]>,
}

struct Node {
    /// Zero marks a leaf node.
    ch: u8,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    equals: Option<NodeId>,
    leaf: Option<Leaf>,
}

#[derive(Clone, Copy)]
enum Slot {
    Root,
    Left(NodeId),
    Right(NodeId),
    Equals(NodeId),
}

/// The set of search words, arranged as a ternary search tree.
#[derive(Default)]
pub struct SubstTree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl SubstTree {
    pub fn new() -> Self {
        SubstTree::default()
    }

    fn get_slot(&self, slot: Slot) -> Option<NodeId> {
        match slot {
            Slot::Root => self.root,
            Slot::Left(id) => self.nodes[id].left,
            Slot::Right(id) => self.nodes[id].right,
            Slot::Equals(id) => self.nodes[id].equals,
        }
    }

    fn set_slot(&mut self, slot: Slot, value: NodeId) {
        match slot {
            Slot::Root => self.root = Some(value),
            Slot::Left(id) => self.nodes[id].left = Some(value),
            Slot::Right(id) => self.nodes[id].right = Some(value),
            Slot::Equals(id) => self.nodes[id].equals = Some(value),
        }
    }

    fn new_node(&mut self, ch: u8, parent: Option<NodeId>, leaf: Option<Leaf>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            ch,
            parent,
            left: None,
            right: None,
            equals: None,
            leaf,
        });
        id
    }

    fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].ch == 0
    }

    /// Register a search word and its replacement.  Returns false if the
    /// word was already registered.
    pub fn add(&mut self, a: &str, b: &str) -> bool {
        assert!(!a.is_empty());
        assert!(!a.as_bytes().contains(&0));

        let a_bytes = a.as_bytes();
        let mut parent = None;
        let mut slot = Slot::Root;
        let mut i = 0;

        while i < a_bytes.len() {
            match self.get_slot(slot) {
                None => {
                    let id = self.new_node(a_bytes[i], parent, None);
                    self.set_slot(slot, id);
                    parent = Some(id);
                    slot = Slot::Equals(id);
                    i += 1;
                }
                Some(id) => {
                    let ch = self.nodes[id].ch;
                    parent = Some(id);
                    if a_bytes[i] < ch {
                        slot = Slot::Left(id);
                    } else if a_bytes[i] > ch {
                        slot = Slot::Right(id);
                    } else {
                        slot = Slot::Equals(id);
                        i += 1;
                    }
                }
            }
        }

        if self.get_slot(slot).is_some() {
            return false;
        }

        let leaf = self.new_node(
            0,
            parent,
            Some(Leaf {
                a: a_bytes.into(),
                b: b.as_bytes().into(),
            }),
        );
        self.set_slot(slot, leaf);
        true
    }

    /// Find `ch` within the binary level starting at `node`; returns the
    /// next level.
    fn find_char(&self, mut node: Option<NodeId>, ch: u8) -> Option<NodeId> {
        if ch == 0 {
            // search words cannot contain null bytes
            return None;
        }

        while let Some(id) = node {
            let n = &self.nodes[id];
            if n.ch == ch {
                return n.equals;
            }

            node = if ch < n.ch { n.left } else { n.right };
        }

        None
    }

    /// Find the leaf ending the current word within a binary level.
    fn find_leaf(&self, mut node: Option<NodeId>) -> Option<NodeId> {
        while let Some(id) = node {
            let n = &self.nodes[id];
            if n.ch == 0 {
                return Some(id);
            }

            node = n.left;
        }

        None
    }

    /// Find any leaf reachable from `node`, used to recover the text of
    /// a partial match.
    fn find_any_leaf(&self, mut node: NodeId) -> Option<NodeId> {
        loop {
            if let Some(leaf) = self.find_leaf(Some(node)) {
                return Some(leaf);
            }

            node = self.nodes[node].equals?;
        }
    }

    /// Whether `input` could still be (the beginning of) a match below
    /// `node`.
    fn check_match(&self, mut node: Option<NodeId>, input: &[u8]) -> bool {
        for &ch in input {
            if self.find_leaf(node).is_some() {
                return true;
            }

            node = self.find_char(node, ch);
            if node.is_none() {
                return false;
            }
        }

        true
    }

    /// Preorder successor among the non-leaf nodes of the root level.
    fn next_non_leaf(&self, mut node: NodeId, root: NodeId) -> Option<NodeId> {
        let n = &self.nodes[node];
        if let Some(left) = n.left {
            if !self.is_leaf(left) {
                return Some(left);
            }
        }
        if let Some(right) = n.right {
            if !self.is_leaf(right) {
                return Some(right);
            }
        }

        loop {
            if node == root {
                return None;
            }

            let parent = self.nodes[node].parent?;
            if self.nodes[parent].left == Some(node) {
                if let Some(right) = self.nodes[parent].right {
                    if !self.is_leaf(right) {
                        return Some(right);
                    }
                }
            }

            node = parent;
        }
    }

    /// Find the first position in `src` where one of the search words
    /// can (possibly) start.  Returns the matching second level and the
    /// position.
    fn find_first_char(&self, src: &[u8]) -> Option<(NodeId, usize)> {
        let root = self.root?;
        let mut best: Option<(NodeId, usize)> = None;

        let mut n = Some(root);
        while let Some(id) = n {
            debug_assert!(!self.is_leaf(id));

            let ch = self.nodes[id].ch;
            let mut from = 0;

            // find an occurrence of this start character whose
            // continuation can still match
            while let Some(rel) = src[from..].iter().position(|&c| c == ch) {
                let pos = from + rel;
                if best.is_some_and(|(_, min)| pos >= min) {
                    break;
                }

                if !self.check_match(self.nodes[id].equals, &src[pos + 1..]) {
                    from = pos + 1;
                    continue;
                }

                if let Some(level) = self.nodes[id].equals {
                    best = Some((level, pos));
                }
                break;
            }

            n = self.next_non_leaf(id, root);
        }

        best
    }

    fn partial_match_bytes(&self, node: NodeId, length: usize) -> Vec<u8> {
        match self.find_any_leaf(node) {
            Some(leaf) => {
                let leaf = self.nodes[leaf].leaf.as_ref().unwrap();
                leaf.a[..length.min(leaf.a.len())].to_vec()
            }
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Searching for the first matching character.
    None,

    /// At least one character matched; checking the rest.
    Match,

    /// Emitting the replacement.
    Insert,
}

struct SubstState {
    tree: SubstTree,

    phase: Phase,

    /// In `Match`: the level matching the most recent character.
    /// In `Insert`: the leaf holding the replacement.
    match_node: Option<NodeId>,

    /// How many bytes of the search word have matched.
    a_match: usize,

    /// How many bytes of the replacement were delivered.
    b_sent: usize,

    /// A false-match prefix that must be re-fed to the parser.
    mismatch: Vec<u8>,
    mismatch_pos: usize,

    /// Emit the first mismatch byte directly instead of re-parsing it.
    send_first: bool,

    saw_eof: bool,
    finished: bool,
    downstream_closed: bool,
}

impl SubstState {
    fn mismatch_pending(&self) -> &[u8] {
        &self.mismatch[self.mismatch_pos..]
    }

    fn consume_mismatch(&mut self, n: usize) -> bool {
        self.mismatch_pos += n;
        if self.mismatch_pos >= self.mismatch.len() {
            self.mismatch.clear();
            self.mismatch_pos = 0;
            return false;
        }
        true
    }

    /// Emit replacement bytes; returns the number still pending.
    fn try_write_b(&mut self, down: &mut dyn StreamHandler) -> usize {
        debug_assert_eq!(self.phase, Phase::Insert);

        let leaf = self.match_node.expect("insert without match");
        let b = {
            let leaf = self.tree.nodes[leaf].leaf.as_ref().unwrap();
            leaf.b[self.b_sent..].to_vec()
        };
        debug_assert!(!b.is_empty());

        match down.on_data(&b) {
            DataAction::Consumed(n) => {
                self.b_sent += n;
                if n == b.len() {
                    self.phase = Phase::None;
                }
                b.len() - n
            }
            DataAction::Closed => {
                self.downstream_closed = true;
                b.len()
            }
        }
    }

    /// Re-feed the mismatch buffer to the parser; returns true while
    /// mismatch data remains.
    fn feed_mismatch(&mut self, down: &mut dyn StreamHandler) -> bool {
        debug_assert_eq!(self.phase, Phase::None);
        debug_assert!(!self.mismatch_pending().is_empty());

        if self.send_first {
            let first = [self.mismatch[self.mismatch_pos]];
            match down.on_data(&first) {
                DataAction::Consumed(0) | DataAction::Closed => return true,
                DataAction::Consumed(_) => {}
            }

            if !self.consume_mismatch(1) {
                return false;
            }

            self.send_first = false;
        }

        let pending = self.mismatch_pending().to_vec();
        match self.feed(&pending, down) {
            DataAction::Consumed(0) | DataAction::Closed => true,
            DataAction::Consumed(n) => self.consume_mismatch(n),
        }
    }

    /// Deliver the mismatch buffer verbatim (input already ended);
    /// returns true while data remains.
    fn write_mismatch(&mut self, down: &mut dyn StreamHandler) -> bool {
        let pending = self.mismatch_pending().to_vec();
        debug_assert!(!pending.is_empty());

        match down.on_data(&pending) {
            DataAction::Consumed(0) | DataAction::Closed => true,
            DataAction::Consumed(n) => self.consume_mismatch(n),
        }
    }

    /// Forward a plain source chunk.  `Ok(())` if fully consumed,
    /// `Err(absolute)` with the absolute consumed count when blocked.
    fn forward_chunk(
        &mut self, src: &[u8], from: usize, to: usize, down: &mut dyn StreamHandler,
    ) -> std::result::Result<(), usize> {
        match down.on_data(&src[from..to]) {
            DataAction::Consumed(n) => {
                if from + n < to {
                    self.phase = Phase::None;
                    Err(from + n)
                } else {
                    Ok(())
                }
            }
            DataAction::Closed => {
                self.downstream_closed = true;
                Err(from)
            }
        }
    }

    /// Feed input data to the parser; returns how much of `src` was
    /// consumed.
    fn feed(&mut self, src: &[u8], down: &mut dyn StreamHandler) -> DataAction {
        let mut data = 0;
        let mut p = 0;
        let mut first: Option<usize> = None;

        loop {
            match self.phase {
                Phase::None => {
                    debug_assert!(first.is_none());

                    match self.tree.find_first_char(&src[p..]) {
                        None => {
                            if data == src.len() {
                                return DataAction::Consumed(data);
                            }

                            // no match ahead: pass the rest through
                            match down.on_data(&src[data..]) {
                                DataAction::Consumed(n) => {
                                    return DataAction::Consumed(data + n);
                                }
                                DataAction::Closed => {
                                    self.downstream_closed = true;
                                    return DataAction::Closed;
                                }
                            }
                        }
                        Some((level, rel)) => {
                            let pos = p + rel;
                            first = Some(pos);
                            self.match_node = Some(level);
                            self.phase = Phase::Match;
                            self.a_match = 1;
                            p = pos + 1;
                        }
                    }
                }

                Phase::Match => {
                    if let Some(level) = self.tree.find_char(self.match_node, src[p]) {
                        // next character matches
                        self.a_match += 1;
                        p += 1;
                        self.match_node = Some(level);

                        if let Some(leaf) = self.tree.find_leaf(Some(level)) {
                            // full match
                            self.match_node = Some(leaf);

                            if let Some(f) = first {
                                if f > data {
                                    if let Err(consumed) =
                                        self.forward_chunk(src, data, f, down)
                                    {
                                        if self.downstream_closed {
                                            return DataAction::Closed;
                                        }
                                        return DataAction::Consumed(consumed);
                                    }
                                }
                            }

                            data = p;
                            first = None;

                            let has_replacement = !self.tree.nodes[leaf]
                                .leaf
                                .as_ref()
                                .unwrap()
                                .b
                                .is_empty();
                            if has_replacement {
                                self.phase = Phase::Insert;
                                self.b_sent = 0;
                            } else {
                                self.phase = Phase::None;
                            }
                        }
                    } else {
                        // mismatch: replay the matched prefix
                        if let Some(f) = first {
                            if f > data || !self.mismatch.is_empty() {
                                let chunk_end =
                                    if !self.mismatch.is_empty() { f + 1 } else { f };
                                if let Err(consumed) =
                                    self.forward_chunk(src, data, chunk_end, down)
                                {
                                    if self.downstream_closed {
                                        return DataAction::Closed;
                                    }
                                    return DataAction::Consumed(consumed);
                                }
                            }
                        } else {
                            debug_assert!(self.mismatch.is_empty());
                        }

                        data = p;
                        first = None;
                        self.phase = Phase::None;

                        if self.mismatch.is_empty() {
                            self.send_first = true;
                            self.mismatch = self
                                .tree
                                .partial_match_bytes(self.match_node.unwrap(), self.a_match);
                            self.mismatch_pos = 0;

                            if self.feed_mismatch(down) {
                                if self.downstream_closed {
                                    return DataAction::Closed;
                                }
                                return DataAction::Consumed(data);
                            }
                        }
                    }
                }

                Phase::Insert => {
                    let remaining = self.try_write_b(down);
                    if remaining > 0 {
                        if self.downstream_closed {
                            return DataAction::Closed;
                        }
                        return DataAction::Consumed(data);
                    }

                    debug_assert_eq!(self.phase, Phase::None);
                }
            }

            if !(p < src.len() || self.phase == Phase::Insert) {
                break;
            }
        }

        let chunk_len = if let Some(f) = first {
            // discard the partial match; it is tracked in `a_match`
            f - data
        } else if self.phase == Phase::Match || self.phase == Phase::Insert {
            0
        } else {
            src.len() - data
        };

        if chunk_len > 0 {
            if let Err(consumed) = self.forward_chunk(src, data, data + chunk_len, down) {
                if self.downstream_closed {
                    return DataAction::Closed;
                }
                return DataAction::Consumed(consumed);
            }
        }

        DataAction::Consumed(p)
    }
}

struct Fwd<'a> {
    state: &'a mut SubstState,
    down: &'a mut dyn StreamHandler,
}

impl StreamHandler for Fwd<'_> {
    fn on_data(&mut self, data: &[u8]) -> DataAction {
        if !self.state.mismatch_pending().is_empty() && self.state.feed_mismatch(self.down) {
            if self.state.downstream_closed {
                return DataAction::Closed;
            }
            return DataAction::Consumed(0);
        }

        self.state.feed(data, self.down)
    }

    fn on_eof(&mut self) {
        self.state.saw_eof = true;

        match self.state.phase {
            Phase::None => {}

            Phase::Match => {
                // end of input in the middle of a match: emit the
                // partial match verbatim
                if self.state.mismatch.is_empty() {
                    self.state.mismatch = self
                        .state
                        .tree
                        .partial_match_bytes(
                            self.state.match_node.unwrap(),
                            self.state.a_match,
                        );
                    self.state.mismatch_pos = 0;
                    self.state.phase = Phase::None;

                    if !self.state.mismatch.is_empty()
                        && self.state.write_mismatch(self.down)
                    {
                        return;
                    }
                }
            }

            Phase::Insert => {
                if self.state.try_write_b(self.down) > 0 {
                    return;
                }
            }
        }

        if self.state.phase == Phase::None && self.state.mismatch.is_empty() {
            self.state.finished = true;
            self.down.on_eof();
        }
    }

    fn on_error(&mut self, error: Error) {
        self.state.saw_eof = true;
        self.state.finished = true;
        self.down.on_error(error);
    }
}

/// The substitution filter.
pub struct SubstStream<S> {
    input: Option<S>,
    state: SubstState,
}

impl<S: Stream> SubstStream<S> {
    pub fn new(input: S, tree: SubstTree) -> Self {
        SubstStream {
            input: Some(input),
            state: SubstState {
                tree,
                phase: Phase::None,
                match_node: None,
                a_match: 0,
                b_sent: 0,
                mismatch: Vec::new(),
                mismatch_pos: 0,
                send_first: false,
                saw_eof: false,
                finished: false,
                downstream_closed: false,
            },
        }
    }

    /// Flush whatever is pending after the input has ended.  Returns
    /// `None` while output remains, the final result otherwise.
    fn flush_tail(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if !self.state.mismatch_pending().is_empty()
            && self.state.write_mismatch(handler)
        {
            return if self.state.downstream_closed {
                ReadResult::Closed
            } else {
                ReadResult::Blocked
            };
        }

        if self.state.phase == Phase::Insert && self.state.try_write_b(handler) > 0 {
            return if self.state.downstream_closed {
                ReadResult::Closed
            } else {
                ReadResult::Blocked
            };
        }

        self.state.finished = true;
        handler.on_eof();
        ReadResult::Done
    }
}

impl<S: Stream> Stream for SubstStream<S> {
    fn available(&self, partial: bool) -> Option<u64> {
        if !partial {
            return None;
        }

        let mut pending = self.state.mismatch_pending().len() as u64;

        if self.state.phase == Phase::Insert {
            if let Some(leaf) = self.state.match_node {
                if let Some(leaf) = self.state.tree.nodes[leaf].leaf.as_ref() {
                    pending += (leaf.b.len() - self.state.b_sent) as u64;
                }
            }
        }

        Some(pending)
    }

    fn read(&mut self, handler: &mut dyn StreamHandler) -> ReadResult {
        if self.state.finished {
            return ReadResult::Done;
        }

        let Some(input) = &mut self.input else {
            return self.flush_tail(handler);
        };

        // flush the mismatch buffer first
        if !self.state.mismatch_pending().is_empty()
            && self.state.feed_mismatch(handler)
        {
            return if self.state.downstream_closed {
                ReadResult::Closed
            } else {
                ReadResult::Blocked
            };
        }

        if self.state.phase == Phase::Insert {
            if self.state.try_write_b(handler) > 0 {
                return if self.state.downstream_closed {
                    ReadResult::Closed
                } else {
                    ReadResult::Blocked
                };
            }
        }

        let result = input.read(&mut Fwd {
            state: &mut self.state,
            down: handler,
        });

        if self.state.saw_eof || result == ReadResult::Done {
            if let Some(mut input) = self.input.take() {
                if result == ReadResult::Closed {
                    input.close();
                }
            }

            if self.state.finished {
                return ReadResult::Done;
            }
            if self.state.downstream_closed {
                return ReadResult::Closed;
            }
            return ReadResult::Blocked;
        }

        result
    }

    fn fill_buckets<'a>(&'a mut self, list: &mut BucketList<'a>) -> Result<()> {
        let state = &mut self.state;

        if !state.mismatch.is_empty() {
            if self.input.is_some() {
                if state.send_first {
                    list.push(&state.mismatch[state.mismatch_pos..state.mismatch_pos + 1]);
                }
                list.set_more();
                list.enable_fallback();
            } else {
                list.push(&state.mismatch[state.mismatch_pos..]);
            }
            return Ok(());
        }

        let Some(input) = &mut self.input else {
            return Ok(());
        };

        match state.phase {
            Phase::None => {
                let mut sub = BucketList::new();
                input.fill_buckets(&mut sub)?;
                list.copy_flags_from(&sub);

                for bucket in sub {
                    let buffer = bucket.buffer();
                    match state.tree.find_first_char(buffer) {
                        Some((_, pos)) => {
                            if pos > 0 {
                                list.push(&buffer[..pos]);
                            }
                            list.set_more();
                            list.enable_fallback();
                            return Ok(());
                        }
                        None => list.push(buffer),
                    }
                }

                Ok(())
            }

            Phase::Match => {
                list.set_more();
                list.enable_fallback();
                Ok(())
            }

            Phase::Insert => {
                let leaf = state.match_node.expect("insert without match");
                if let Some(leaf) = state.tree.nodes[leaf].leaf.as_ref() {
                    list.push(&leaf.b[state.b_sent..]);
                }
                list.set_more();
                list.enable_fallback();
                Ok(())
            }
        }
    }

    fn consume_buckets(&mut self, nbytes: usize) -> Consumed {
        let state = &mut self.state;

        if !state.mismatch.is_empty() {
            if self.input.is_some() {
                if state.send_first {
                    state.send_first = false;
                    state.consume_mismatch(1);
                    return Consumed::new(1, false);
                }
                return Consumed::new(0, false);
            }

            let n = nbytes.min(state.mismatch_pending().len());
            state.consume_mismatch(n);
            return Consumed::new(n, false);
        }

        match state.phase {
            Phase::None => match &mut self.input {
                Some(input) => input.consume_buckets(nbytes),
                None => Consumed::default(),
            },

            Phase::Match => Consumed::default(),

            Phase::Insert => {
                let leaf = state.match_node.expect("insert without match");
                let length = state.tree.nodes[leaf]
                    .leaf
                    .as_ref()
                    .map(|l| l.b.len() - state.b_sent)
                    .unwrap_or(0);

                let consumed = nbytes.min(length);
                state.b_sent += consumed;
                if consumed == length {
                    state.phase = Phase::None;
                }
                Consumed::new(consumed, false)
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{concat::ConcatStream, sink::read_all, source::BytesStream};

    fn subst(input: &'static [u8], pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut tree = SubstTree::new();
        for (a, b) in pairs {
            assert!(tree.add(a, b));
        }

        let mut stream = SubstStream::new(BytesStream::new(input), tree);
        read_all(&mut stream).unwrap()
    }

    #[test]
    fn simple_replacement() {
        assert_eq!(subst(b"hello foo world", &[("foo", "bar")]), b"hello bar world");
    }

    #[test]
    fn replacement_at_edges() {
        assert_eq!(subst(b"foo.foo", &[("foo", "XYZ")]), b"XYZ.XYZ");
    }

    #[test]
    fn multiple_words() {
        assert_eq!(
            subst(b"a[one]b[two]", &[("[one]", "1"), ("[two]", "2")]),
            b"a1b2"
        );
    }

    #[test]
    fn deletion() {
        assert_eq!(subst(b"a<del>b", &[("<del>", "")]), b"ab");
    }

    #[test]
    fn late_mismatch_rewinds() {
        assert_eq!(subst(b"ababc!", &[("abc", "XYZ")]), b"abXYZ!");
    }

    #[test]
    fn partial_match_at_eof_is_verbatim() {
        assert_eq!(subst(b"xx ab", &[("abc", "XYZ")]), b"xx ab");
    }

    #[test]
    fn match_across_pushes() {
        let mut tree = SubstTree::new();
        assert!(tree.add("abc", "XYZ"));

        let parts: Vec<Box<dyn Stream>> = vec![
            Box::new(BytesStream::new(&b"xa"[..])),
            Box::new(BytesStream::new(&b"bcy"[..])),
        ];
        let mut stream = SubstStream::new(ConcatStream::new(parts), tree);
        assert_eq!(read_all(&mut stream).unwrap(), b"xXYZy");
    }

    #[test]
    fn mismatch_across_pushes() {
        let mut tree = SubstTree::new();
        assert!(tree.add("abc", "XYZ"));

        let parts: Vec<Box<dyn Stream>> = vec![
            Box::new(BytesStream::new(&b"xa"[..])),
            Box::new(BytesStream::new(&b"bd"[..])),
        ];
        let mut stream = SubstStream::new(ConcatStream::new(parts), tree);
        assert_eq!(read_all(&mut stream).unwrap(), b"xabd");
    }

    #[test]
    fn duplicate_word_rejected() {
        let mut tree = SubstTree::new();
        assert!(tree.add("foo", "bar"));
        assert!(!tree.add("foo", "baz"));
    }
}
