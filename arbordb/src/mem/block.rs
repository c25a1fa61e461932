/*
 * Created on Sun Feb 18 2024
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

use {
    super::Mapping,
    crate::error::{ArborError, ArborResult},
    parking_lot::Mutex,
    std::sync::atomic::{AtomicU32, Ordering},
};

/// A grow-on-demand allocator of fixed-size blocks inside a [`Mapping`],
/// starting at a base offset (the id map's header sits below it). Blocks are
/// only ever appended; `reserve` is idempotent under races so two threads
/// that both notice exhaustion do the growth once.
#[derive(Debug)]
pub struct BlockAlloc {
    base: u64,
    block_size: u64,
    max_blocks: u32,
    blocks: AtomicU32,
    grow_lock: Mutex<()>,
}

impl BlockAlloc {
    pub fn new(base: u64, block_size: u64, max_blocks: u32, current_blocks: u32) -> Self {
        Self {
            base,
            block_size,
            max_blocks,
            blocks: AtomicU32::new(current_blocks),
            grow_lock: Mutex::new(()),
        }
    }
    pub fn num_blocks(&self) -> u32 {
        self.blocks.load(Ordering::Acquire)
    }
    pub fn block_size(&self) -> u64 {
        self.block_size
    }
    pub fn block_off(&self, block: u32) -> u64 {
        debug_assert!(block < self.num_blocks());
        self.base + block as u64 * self.block_size
    }
    /// Ensure at least `min` blocks are materialized, growing the backing
    /// file if needed. Returns the number of blocks now available.
    pub fn reserve(&self, map: &Mapping, min: u32) -> ArborResult<u32> {
        let have = self.num_blocks();
        if have >= min {
            return Ok(have);
        }
        let _g = self.grow_lock.lock();
        // someone else may have grown while we waited
        let have = self.num_blocks();
        if have >= min {
            return Ok(have);
        }
        if min > self.max_blocks {
            return Err(ArborError::IdExhaustion);
        }
        map.grow_to(self.base + min as u64 * self.block_size)?;
        map.sync_file()?;
        self.blocks.store(min, Ordering::Release);
        Ok(min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_grows_once() {
        let path = std::env::temp_dir().join(format!("arbordb-blk-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (map, _) = Mapping::open(&path, 1 << 22, 4096).unwrap();
        let blocks = BlockAlloc::new(4096, 64 * 1024, 8, 0);
        assert_eq!(blocks.reserve(&map, 2).unwrap(), 2);
        assert_eq!(blocks.reserve(&map, 1).unwrap(), 2);
        assert_eq!(map.len(), 4096 + 2 * 64 * 1024);
        assert_eq!(blocks.reserve(&map, 9).unwrap_err(), ArborError::IdExhaustion);
        let _ = std::fs::remove_file(&path);
    }
}
