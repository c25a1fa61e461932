/*
 * Created on Sat Mar 16 2024
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

//! Value nodes terminate a path: a key suffix plus either raw payload bytes
//! (`NodeType::Value`) or a packed array of subtree root ids
//! (`NodeType::Roots`).
//!
//! ```text
//! +-------------+--------------+-----------+------------------+
//! | key_len u16 | data_len u32 | key bytes | data bytes       |
//! +-------------+--------------+-----------+------------------+
//! ```

use {
    super::{get_u16, get_u32, get_u64, put_u16, put_u32},
    crate::meta::NodeId,
};

const HEAD: usize = 6;

#[derive(Clone, Copy)]
pub struct ValueNode<'a> {
    buf: &'a [u8],
}

impl<'a> ValueNode<'a> {
    #[inline(always)]
    pub fn read(buf: &'a [u8]) -> Self {
        Self { buf }
    }
    #[inline(always)]
    pub fn key(&self) -> &'a [u8] {
        let klen = get_u16(self.buf, 0) as usize;
        &self.buf[HEAD..HEAD + klen]
    }
    #[inline(always)]
    pub fn data(&self) -> &'a [u8] {
        let klen = get_u16(self.buf, 0) as usize;
        let dlen = get_u32(self.buf, 2) as usize;
        &self.buf[HEAD + klen..HEAD + klen + dlen]
    }
    pub fn num_roots(&self) -> usize {
        self.data().len() / sizeof!(u64)
    }
    pub fn root(&self, i: usize) -> NodeId {
        NodeId::from_raw(get_u64(self.data(), i * sizeof!(u64)))
    }
    pub fn roots(&self) -> impl Iterator<Item = NodeId> + 'a {
        let data = self.data();
        (0..data.len() / sizeof!(u64)).map(move |i| NodeId::from_raw(get_u64(data, i * 8)))
    }
}

pub fn encoded_size(key: &[u8], data_len: usize) -> usize {
    HEAD + key.len() + data_len
}

/// Write a fresh value node image. `buf` may be longer than the encoded size
/// (allocation rounds up); the trailing pad is never read back.
pub fn write_new(buf: &mut [u8], key: &[u8], data: &[u8]) {
    debug_assert!(buf.len() >= encoded_size(key, data.len()));
    put_u16(buf, 0, key.len() as u16);
    put_u32(buf, 2, data.len() as u32);
    buf[HEAD..HEAD + key.len()].copy_from_slice(key);
    buf[HEAD + key.len()..HEAD + key.len() + data.len()].copy_from_slice(data);
}

/// Write a roots-typed value node from an id list
pub fn write_roots(buf: &mut [u8], key: &[u8], roots: &[NodeId]) {
    debug_assert!(buf.len() >= encoded_size(key, roots.len() * 8));
    put_u16(buf, 0, key.len() as u16);
    put_u32(buf, 2, (roots.len() * 8) as u32);
    buf[HEAD..HEAD + key.len()].copy_from_slice(key);
    let base = HEAD + key.len();
    for (i, id) in roots.iter().enumerate() {
        buf[base + i * 8..base + i * 8 + 8].copy_from_slice(&id.raw().to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let mut buf = vec![0u8; 64];
        write_new(&mut buf, b"suffix", b"payload");
        let v = ValueNode::read(&buf);
        assert_eq!(v.key(), b"suffix");
        assert_eq!(v.data(), b"payload");
    }

    #[test]
    fn empty_key_and_value() {
        let mut buf = vec![0u8; 16];
        write_new(&mut buf, b"", b"");
        let v = ValueNode::read(&buf);
        assert_eq!(v.key(), b"");
        assert_eq!(v.data(), b"");
    }

    #[test]
    fn roots_roundtrip() {
        let mut buf = vec![0u8; 64];
        let ids = [NodeId::new(1, 7), NodeId::new(2, 9)];
        write_roots(&mut buf, b"", &ids);
        let v = ValueNode::read(&buf);
        assert_eq!(v.num_roots(), 2);
        assert_eq!(v.root(0), ids[0]);
        assert_eq!(v.roots().collect::<Vec<_>>(), ids);
    }
}
