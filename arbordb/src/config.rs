/*
 * Created on Mon Feb 12 2024
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

use crate::error::{ArborError, ArborResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Whether user-visible commits wait for the data to hit the disk
pub enum SyncMode {
    /// never issue syncs on the commit path
    None,
    /// issue syncs but do not wait for them
    Async,
    /// commits return only once the root and everything it reaches is durable
    Blocking,
}

#[derive(Debug, Clone)]
/// Open options and engine tunables. The geometry fields (`segment_size`,
/// `id_page_size`, `max_segments`) are fixed at create time and read back
/// from the store header on every subsequent open.
pub struct Config {
    /// size of each segment in bytes; must be a power of two
    pub segment_size: usize,
    /// hard cap on store growth, in segments; must be a power of two (it also
    /// sizes the free-segment ring)
    pub max_segments: usize,
    /// page granularity of the id map; must be a power of two
    pub id_page_size: usize,
    /// cap on id map growth, in blocks of `id_page_size << 16` bytes
    pub max_id_blocks: usize,
    /// start the background compactor on open
    pub run_compact_thread: bool,
    /// commit durability mode
    pub sync_mode: SyncMode,
    /// a writer-session read that finds a small node in a cold segment may
    /// relocate it into the current segment for recency
    pub cache_on_read: bool,
    /// branch count at which a set-list node is rewritten as full-256
    pub full_node_threshold: usize,
    /// extra branch slots reserved when a binary node is cloned
    pub binary_spare_branches: usize,
    /// extra arena bytes reserved when a binary node is cloned
    pub binary_spare_bytes: usize,
    /// values at or below this size are stored inline in binary records
    pub max_inline_value: usize,
    /// a segment qualifies for compaction once its free bytes reach
    /// `segment_size / compact_min_free_div`
    pub compact_min_free_div: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: 32 * 1024 * 1024,
            max_segments: 4096,
            id_page_size: 4096,
            max_id_blocks: 16,
            run_compact_thread: true,
            sync_mode: SyncMode::Async,
            cache_on_read: false,
            full_node_threshold: 36,
            binary_spare_branches: 8,
            binary_spare_bytes: 256,
            max_inline_value: 127,
            compact_min_free_div: 16,
        }
    }
}

impl Config {
    /// A geometry small enough for test stores that want to exercise segment
    /// churn without writing megabytes
    #[cfg(test)]
    pub fn small() -> Self {
        Self {
            segment_size: 64 * 1024,
            max_segments: 1024,
            id_page_size: 512,
            max_id_blocks: 64,
            run_compact_thread: false,
            sync_mode: SyncMode::None,
            ..Self::default()
        }
    }
    pub(crate) fn validate(&self) -> ArborResult<()> {
        if !self.segment_size.is_power_of_two()
            || self.segment_size < 64 * 1024
            || self.segment_size > 1024 * 1024 * 1024
        {
            return Err(ArborError::BadConfig("segment_size"));
        }
        if !self.max_segments.is_power_of_two() || self.max_segments < 4 {
            return Err(ArborError::BadConfig("max_segments"));
        }
        if !self.id_page_size.is_power_of_two() || self.id_page_size < 64 {
            return Err(ArborError::BadConfig("id_page_size"));
        }
        if self.max_id_blocks == 0 {
            return Err(ArborError::BadConfig("max_id_blocks"));
        }
        if self.full_node_threshold < 4 || self.full_node_threshold > 256 {
            return Err(ArborError::BadConfig("full_node_threshold"));
        }
        if self.max_inline_value > 1024 {
            return Err(ArborError::BadConfig("max_inline_value"));
        }
        if self.compact_min_free_div == 0 {
            return Err(ArborError::BadConfig("compact_min_free_div"));
        }
        Ok(())
    }
    pub(crate) fn seg_bits(&self) -> u32 {
        self.segment_size.trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::small().validate().is_ok());
    }

    #[test]
    fn rejects_unaligned_geometry() {
        let cfg = Config {
            segment_size: (32 * 1024 * 1024) - 1,
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Err(ArborError::BadConfig("segment_size")));
    }
}
