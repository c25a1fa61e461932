/*
 * Created on Sat Feb 17 2024
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
    crate::{error::ArborResult, util::os_page_size},
    memmap2::{MmapOptions, MmapRaw},
    std::{
        fs::{File, OpenOptions},
        path::Path,
        sync::atomic::{AtomicU64, Ordering},
    },
};

#[derive(Debug, Clone, Copy)]
/// Access pattern hints forwarded to the OS
pub enum MapAdvice {
    WillNeed,
    Sequential,
    Random,
}

/// A file mapping that reserves its maximum address range up front. Growth is
/// a plain `ftruncate`: the pages between the old and new length become valid
/// without ever remapping, so raw pointers into the map stay stable for the
/// life of the store.
#[derive(Debug)]
pub struct Mapping {
    file: File,
    map: MmapRaw,
    reserved: u64,
    len: AtomicU64,
}

// UNSAFE(@ohsayan): the raw map pointer is always used at offsets the owning
// layer has validated against `len`, and every mutable range is owned by
// exactly one role (writer segment, compactor segment, or an id slot guarded
// by the meta-word protocol)
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Open (or create) the file and map `reserved` bytes of address space
    /// over it. A fresh file is extended to `initial_len` first. Returns the
    /// mapping and whether the file was created by this call.
    pub fn open(path: &Path, reserved: u64, initial_len: u64) -> ArborResult<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut flen = file.metadata()?.len();
        let created = flen == 0;
        if created && initial_len != 0 {
            file.set_len(initial_len)?;
            flen = initial_len;
        }
        let map = MmapOptions::new().len(reserved as usize).map_raw(&file)?;
        Ok((
            Self {
                file,
                map,
                reserved,
                len: AtomicU64::new(flen),
            },
            created,
        ))
    }
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }
    pub fn reserved(&self) -> u64 {
        self.reserved
    }
    /// Extend the file. The caller serializes growth; concurrent readers of
    /// already-valid offsets are unaffected because the map never moves.
    pub fn grow_to(&self, new_len: u64) -> ArborResult<()> {
        debug_assert!(new_len <= self.reserved);
        if new_len > self.len() {
            self.file.set_len(new_len)?;
            self.len.store(new_len, Ordering::Release);
        }
        Ok(())
    }
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
    /// Borrow a range of the map
    ///
    /// ## Safety
    /// The range must lie inside the valid file length and must not overlap a
    /// range another thread is mutating outside the meta-word protocol
    #[inline(always)]
    pub unsafe fn slice(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(offset + len as u64 <= self.len());
        core::slice::from_raw_parts(self.as_ptr().add(offset as usize), len)
    }
    /// Mutably borrow a range of the map
    ///
    /// ## Safety
    /// Same as [`Mapping::slice`], plus the caller must hold the exclusive
    /// write right for the range
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        debug_assert!(offset + len as u64 <= self.len());
        core::slice::from_raw_parts_mut(self.as_ptr().add(offset as usize), len)
    }
    /// Flush a byte range to disk, widening it to page boundaries. Clamped to
    /// the valid file length, so callers can pass object-granular ranges.
    pub fn flush_range(&self, offset: u64, len: u64, blocking: bool) -> ArborResult<()> {
        if len == 0 {
            return Ok(());
        }
        let page = os_page_size() as u64;
        let start = offset & !(page - 1);
        let end = (offset + len).min(self.len());
        if end <= start {
            return Ok(());
        }
        let (start, span) = (start as usize, (end - start) as usize);
        if blocking {
            self.map.flush_range(start, span)?;
        } else {
            self.map.flush_async_range(start, span)?;
        }
        Ok(())
    }
    pub fn flush_all(&self, blocking: bool) -> ArborResult<()> {
        self.flush_range(0, self.len(), blocking)
    }
    /// File-level sync (metadata included). Used after growth so a crash
    /// cannot lose the new length.
    pub fn sync_file(&self) -> ArborResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
    #[allow(unused_variables)]
    pub fn advise(&self, offset: u64, len: u64, advice: MapAdvice) {
        #[cfg(unix)]
        {
            use memmap2::Advice;
            let advice = match advice {
                MapAdvice::WillNeed => Advice::WillNeed,
                MapAdvice::Sequential => Advice::Sequential,
                MapAdvice::Random => Advice::Random,
            };
            // advisory only; failure is not actionable
            let _ = self.map.advise_range(advice, offset as usize, len as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::PathBuf};

    fn scratch(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("arbordb-map-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn grows_without_remap() {
        let path = scratch("grow");
        let (map, created) = Mapping::open(&path, 1 << 20, 4096).unwrap();
        assert!(created);
        let base = map.as_ptr();
        unsafe {
            map.slice_mut(0, 4)[..4].copy_from_slice(b"arbo");
        }
        map.grow_to(64 * 1024).unwrap();
        assert_eq!(map.as_ptr(), base);
        unsafe {
            map.slice_mut(4096, 4)[..4].copy_from_slice(b"rdbx");
            assert_eq!(map.slice(0, 4), b"arbo");
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopen_sees_data() {
        let path = scratch("reopen");
        {
            let (map, _) = Mapping::open(&path, 1 << 20, 4096).unwrap();
            unsafe {
                map.slice_mut(100, 5).copy_from_slice(b"hello");
            }
            map.flush_range(100, 5, true).unwrap();
        }
        {
            let (map, created) = Mapping::open(&path, 1 << 20, 4096).unwrap();
            assert!(!created);
            unsafe {
                assert_eq!(map.slice(100, 5), b"hello");
            }
        }
        let _ = std::fs::remove_file(&path);
    }
}
