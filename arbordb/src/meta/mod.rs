/*
 * Created on Sat Feb 24 2024
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

//! The identity layer: stable 40-bit node names, 46-bit packed storage
//! locations, and the atomic meta word that ties one to the other

mod idalloc;
mod word;

pub use {
    idalloc::IdAlloc,
    word::{MetaView, MetaWord, MoveParker, MoveResult},
};

/// Bits in the index part of a node id
pub const ID_INDEX_BITS: u32 = 24;
/// Number of id regions (one per 16-bit region selector)
pub const ID_REGIONS: usize = 1 << 16;
/// Bits in a packed node location
pub const LOCATION_BITS: u32 = 46;

const ID_INDEX_MASK: u64 = (1 << ID_INDEX_BITS) - 1;
const LOCATION_MASK: u64 = (1 << LOCATION_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
/// The stable 40-bit name of a node: a 16-bit region plus a 24-bit index
/// within that region. Zero is reserved for "none".
pub struct NodeId(u64);

impl NodeId {
    pub const NULL: Self = Self(0);
    #[inline(always)]
    pub fn new(region: u16, index: u32) -> Self {
        debug_assert!(index as u64 <= ID_INDEX_MASK);
        Self(((region as u64) << ID_INDEX_BITS) | index as u64)
    }
    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
    #[inline(always)]
    pub const fn region(self) -> u16 {
        (self.0 >> ID_INDEX_BITS) as u16
    }
    #[inline(always)]
    pub const fn index(self) -> u32 {
        (self.0 & ID_INDEX_MASK) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
/// A storage location: the byte offset of an object header divided by 16,
/// which lets 46 bits address a petabyte
pub struct NodeLocation(u64);

impl NodeLocation {
    /// assigned at id allocation, before the segment store places the node
    pub const NULL: Self = Self(LOCATION_MASK - 1);
    /// terminates a region's intrusive free list
    pub const END_OF_FREELIST: Self = Self(LOCATION_MASK);

    #[inline(always)]
    pub fn from_offset(offset: u64) -> Self {
        debug_assert!(offset % 16 == 0);
        debug_assert!(offset >> 4 < LOCATION_MASK - 1);
        Self(offset >> 4)
    }
    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & LOCATION_MASK)
    }
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
    #[inline(always)]
    pub const fn offset(self) -> u64 {
        self.0 << 4
    }
    #[inline(always)]
    pub const fn segment(self, seg_bits: u32) -> u32 {
        (self.offset() >> seg_bits) as u32
    }
    #[inline(always)]
    pub const fn in_segment(self, seg_bits: u32) -> u32 {
        (self.offset() & ((1 << seg_bits) - 1)) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// The four node variants plus the two bookkeeping states. Must fit the
/// meta word's 4-bit type field.
pub enum NodeType {
    /// an unallocated id sitting on a region free list
    FreeList = 0,
    /// binary-search node
    Binary = 1,
    /// value node carrying raw bytes
    Value = 2,
    /// set-list node
    SetList = 3,
    /// value node whose payload is an array of subtree root ids
    Roots = 4,
    /// full-256 node
    Full = 5,
    /// allocated but not yet published
    Undefined = 6,
}

impl NodeType {
    #[inline(always)]
    pub const fn from_bits(v: u8) -> Self {
        match v {
            0 => Self::FreeList,
            1 => Self::Binary,
            2 => Self::Value,
            3 => Self::SetList,
            4 => Self::Roots,
            5 => Self::Full,
            _ => Self::Undefined,
        }
    }
    /// Inner nodes carry branches; everything else terminates a path
    #[inline(always)]
    pub const fn is_inner(self) -> bool {
        matches!(self, Self::SetList | Self::Full)
    }
    #[inline(always)]
    pub const fn is_value(self) -> bool {
        matches!(self, Self::Value | Self::Roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packing() {
        let id = NodeId::new(0xbeef, 0x00_1234);
        assert_eq!(id.region(), 0xbeef);
        assert_eq!(id.index(), 0x1234);
        assert_eq!(NodeId::from_raw(id.raw()), id);
        assert!(NodeId::NULL.is_null());
    }

    #[test]
    fn location_packing() {
        let loc = NodeLocation::from_offset(0x1000);
        assert_eq!(loc.offset(), 0x1000);
        // 64 KiB segments
        let loc = NodeLocation::from_offset(3 * 65536 + 128);
        assert_eq!(loc.segment(16), 3);
        assert_eq!(loc.in_segment(16), 128);
        assert_ne!(NodeLocation::NULL, NodeLocation::END_OF_FREELIST);
    }

    #[test]
    fn type_bits_roundtrip() {
        for t in [
            NodeType::FreeList,
            NodeType::Binary,
            NodeType::Value,
            NodeType::SetList,
            NodeType::Roots,
            NodeType::Full,
            NodeType::Undefined,
        ] {
            assert_eq!(NodeType::from_bits(t as u8), t);
        }
    }
}
