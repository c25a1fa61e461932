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

//! Full-256 nodes are the dense inner variant: a 256-bit present bitmap and
//! a popcount-indexed child array. Promotion from set-list happens at the
//! configured branch threshold; removals never demote.
//!
//! ```text
//! +----------+-----+---------+---------------+----------------+--------+
//! | plen u16 | rsv | eos u64 | bitmap 4xu64  | children[n]u64 | prefix |
//! +----------+-----+---------+---------------+----------------+--------+
//! ```

use {
    super::{get_u16, get_u64, put_u16, put_u64},
    crate::meta::NodeId,
};

const HEAD: usize = 12;
const BITMAP: usize = 32;
const CHILDREN: usize = HEAD + BITMAP;

#[derive(Clone, Copy)]
pub struct FullNode<'a> {
    buf: &'a [u8],
}

impl<'a> FullNode<'a> {
    #[inline(always)]
    pub fn read(buf: &'a [u8]) -> Self {
        Self { buf }
    }
    #[inline(always)]
    fn word(&self, w: usize) -> u64 {
        get_u64(self.buf, HEAD + w * 8)
    }
    pub fn num_branches(&self) -> usize {
        (0..4).map(|w| self.word(w).count_ones() as usize).sum()
    }
    pub fn prefix(&self) -> &'a [u8] {
        let n = self.num_branches();
        let plen = get_u16(self.buf, 0) as usize;
        &self.buf[CHILDREN + 8 * n..CHILDREN + 8 * n + plen]
    }
    #[inline(always)]
    pub fn eos(&self) -> NodeId {
        NodeId::from_raw(get_u64(self.buf, 4))
    }
    #[inline(always)]
    pub fn has_branch(&self, b: u8) -> bool {
        self.word(b as usize / 64) & (1 << (b % 64)) != 0
    }
    /// Index into the child array for branch `b` (which must be present)
    fn branch_index(&self, b: u8) -> usize {
        let w = b as usize / 64;
        let mask = if b % 64 == 0 { 0 } else { !0u64 >> (64 - b % 64) };
        let mut idx = (self.word(w) & mask).count_ones() as usize;
        for prior in 0..w {
            idx += self.word(prior).count_ones() as usize;
        }
        idx
    }
    pub fn child(&self, b: u8) -> Option<NodeId> {
        if !self.has_branch(b) {
            return None;
        }
        Some(self.child_at(self.branch_index(b)))
    }
    #[inline(always)]
    pub fn child_at(&self, idx: usize) -> NodeId {
        NodeId::from_raw(get_u64(self.buf, CHILDREN + idx * 8))
    }
    /// The first present branch `>= b`, with its child index
    pub fn lower_bound(&self, b: u8) -> Option<(u8, usize)> {
        let mut idx = 0;
        for w in 0..4 {
            let mut word = self.word(w);
            if w < b as usize / 64 {
                idx += word.count_ones() as usize;
                continue;
            }
            if w == b as usize / 64 {
                let below = if b % 64 == 0 { 0 } else { !0u64 >> (64 - b % 64) };
                idx += (word & below).count_ones() as usize;
                word &= !below;
            }
            if word != 0 {
                let bit = word.trailing_zeros() as u8;
                return Some(((w * 64) as u8 + bit, idx));
            }
        }
        None
    }
    pub fn branches(&self) -> impl Iterator<Item = (u8, NodeId)> + '_ {
        let mut idx = 0;
        (0usize..256).filter_map(move |b| {
            if self.has_branch(b as u8) {
                let out = (b as u8, self.child_at(idx));
                idx += 1;
                Some(out)
            } else {
                None
            }
        })
    }
}

pub fn encoded_size(branches: usize, prefix_len: usize) -> usize {
    CHILDREN + 8 * branches + prefix_len
}

/// Write a fresh full-256 image. `entries` must be sorted and duplicate-free.
pub fn write_new(buf: &mut [u8], prefix: &[u8], eos: NodeId, entries: &[(u8, NodeId)]) {
    debug_assert!(buf.len() >= encoded_size(entries.len(), prefix.len()));
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    put_u16(buf, 0, prefix.len() as u16);
    put_u16(buf, 2, 0);
    put_u64(buf, 4, eos.raw());
    let mut bitmap = [0u64; 4];
    for (b, _) in entries {
        bitmap[*b as usize / 64] |= 1 << (*b % 64);
    }
    for (w, bits) in bitmap.iter().enumerate() {
        put_u64(buf, HEAD + w * 8, *bits);
    }
    for (i, (_, id)) in entries.iter().enumerate() {
        put_u64(buf, CHILDREN + i * 8, id.raw());
    }
    let n = entries.len();
    buf[CHILDREN + 8 * n..CHILDREN + 8 * n + prefix.len()].copy_from_slice(prefix);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<u8>, Vec<(u8, NodeId)>) {
        let entries: Vec<_> = [0u8, 3, 63, 64, 130, 255]
            .iter()
            .enumerate()
            .map(|(i, b)| (*b, NodeId::new(1, i as u32 + 1)))
            .collect();
        let mut buf = vec![0u8; encoded_size(entries.len(), 2)];
        write_new(&mut buf, b"pp", NodeId::new(7, 7), &entries);
        (buf, entries)
    }

    #[test]
    fn roundtrip() {
        let (buf, entries) = sample();
        let v = FullNode::read(&buf);
        assert_eq!(v.num_branches(), entries.len());
        assert_eq!(v.prefix(), b"pp");
        assert_eq!(v.eos(), NodeId::new(7, 7));
        for (b, id) in &entries {
            assert_eq!(v.child(*b), Some(*id));
        }
        assert_eq!(v.child(5), None);
        assert_eq!(v.branches().collect::<Vec<_>>(), entries);
    }

    #[test]
    fn lower_bound_scans_words() {
        let (buf, entries) = sample();
        let v = FullNode::read(&buf);
        assert_eq!(v.lower_bound(0), Some((0, 0)));
        assert_eq!(v.lower_bound(1), Some((3, 1)));
        assert_eq!(v.lower_bound(64), Some((64, 3)));
        assert_eq!(v.lower_bound(131), Some((255, 5)));
        assert_eq!(v.lower_bound(255), Some((255, 5)));
        let _ = entries;
    }
}
