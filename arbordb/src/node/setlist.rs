/*
 * Created on Sun Mar 17 2024
 *
 * This file is a part of ArborDB
 * ArborDB is a free and open-source persistent copy-on-write radix trie
 * storage engine written by Sayan Nandan ("the Author") with the
 * vision to provide snapshot isolation and live space reclamation without
 * compromising on performance, consistency or durability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Set-list nodes are the sparse inner variant: a sorted list of present
//! branch bytes next to an equal-length array of child ids, plus a common
//! prefix and an optional end-of-string value id. Every edit is a fresh
//! image (the engine never patches these in place).
//!
//! ```text
//! +----+----------+---------+----------+----------------+--------+
//! | nb | plen u16 | eos u64 | bytes[n] | children[n]u64 | prefix |
//! +----+----------+---------+----------+----------------+--------+
//! ```

use {
    super::{get_u16, get_u64, put_u16, put_u64},
    crate::meta::NodeId,
};

const HEAD: usize = 12;

#[derive(Clone, Copy)]
pub struct SetListNode<'a> {
    buf: &'a [u8],
}

impl<'a> SetListNode<'a> {
    #[inline(always)]
    pub fn read(buf: &'a [u8]) -> Self {
        Self { buf }
    }
    #[inline(always)]
    pub fn num_branches(&self) -> usize {
        get_u16(self.buf, 0) as usize
    }
    #[inline(always)]
    pub fn prefix(&self) -> &'a [u8] {
        let n = self.num_branches();
        let plen = get_u16(self.buf, 2) as usize;
        &self.buf[HEAD + 9 * n..HEAD + 9 * n + plen]
    }
    #[inline(always)]
    pub fn eos(&self) -> NodeId {
        NodeId::from_raw(get_u64(self.buf, 4))
    }
    #[inline(always)]
    pub fn branch_byte(&self, i: usize) -> u8 {
        self.buf[HEAD + i]
    }
    #[inline(always)]
    pub fn child(&self, i: usize) -> NodeId {
        let n = self.num_branches();
        NodeId::from_raw(get_u64(self.buf, HEAD + n + i * 8))
    }
    fn bytes(&self) -> &'a [u8] {
        &self.buf[HEAD..HEAD + self.num_branches()]
    }
    /// Index of the branch for `b`, if present
    pub fn find_branch(&self, b: u8) -> Option<usize> {
        self.bytes().binary_search(&b).ok()
    }
    /// Index of the first branch byte `>= b`
    pub fn lower_bound(&self, b: u8) -> usize {
        self.bytes().partition_point(|x| *x < b)
    }
    pub fn branches(&self) -> impl Iterator<Item = (u8, NodeId)> + '_ {
        (0..self.num_branches()).map(move |i| (self.branch_byte(i), self.child(i)))
    }
}

pub fn encoded_size(branches: usize, prefix_len: usize) -> usize {
    HEAD + 9 * branches + prefix_len
}

/// Write a fresh set-list image. `entries` must be sorted by branch byte and
/// free of duplicates.
pub fn write_new(buf: &mut [u8], prefix: &[u8], eos: NodeId, entries: &[(u8, NodeId)]) {
    debug_assert!(buf.len() >= encoded_size(entries.len(), prefix.len()));
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    let n = entries.len();
    put_u16(buf, 0, n as u16);
    put_u16(buf, 2, prefix.len() as u16);
    put_u64(buf, 4, eos.raw());
    for (i, (b, id)) in entries.iter().enumerate() {
        buf[HEAD + i] = *b;
        put_u64(buf, HEAD + n + i * 8, id.raw());
    }
    buf[HEAD + 9 * n..HEAD + 9 * n + prefix.len()].copy_from_slice(prefix);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let entries = [
            (b'a', NodeId::new(1, 2)),
            (b'c', NodeId::new(1, 3)),
            (b'z', NodeId::new(1, 4)),
        ];
        let mut buf = vec![0u8; encoded_size(3, 3)];
        write_new(&mut buf, b"pre", NodeId::new(9, 9), &entries);
        let v = SetListNode::read(&buf);
        assert_eq!(v.num_branches(), 3);
        assert_eq!(v.prefix(), b"pre");
        assert_eq!(v.eos(), NodeId::new(9, 9));
        assert_eq!(v.find_branch(b'c'), Some(1));
        assert_eq!(v.find_branch(b'b'), None);
        assert_eq!(v.child(2), NodeId::new(1, 4));
        assert_eq!(v.branches().collect::<Vec<_>>(), entries);
    }

    #[test]
    fn lower_bound_walk() {
        let entries = [(5u8, NodeId::new(1, 1)), (9, NodeId::new(1, 2))];
        let mut buf = vec![0u8; encoded_size(2, 0)];
        write_new(&mut buf, b"", NodeId::NULL, &entries);
        let v = SetListNode::read(&buf);
        assert_eq!(v.lower_bound(0), 0);
        assert_eq!(v.lower_bound(5), 0);
        assert_eq!(v.lower_bound(6), 1);
        assert_eq!(v.lower_bound(10), 2);
    }
}
