/*
 * Created on Sat Mar 02 2024
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

//! The id allocator hands out 40-bit node names and owns the ids.dat
//! mapping that stores one meta word per name. Names are drawn from 65,536
//! regions in round-robin order so that concurrent frees rarely contend on
//! the same region lock. Within a region the fast path is a lock-free bump
//! cursor; the free list is only consulted (under the region's mutex) once
//! the bump range is spent.
//!
//! File layout:
//!
//! ```text
//! [ header | region table (65536 x 16B) | id blocks ... ]
//! ```
//!
//! Each block adds `id_page_size / 8` meta words to *every* region: block b,
//! region r, slot i lives at `blocks_base + b*block_size + r*id_page_size +
//! (i % ids_per_page)*8`. A free slot's meta word doubles as the intrusive
//! free-list link, storing the index of the next free slot in its location
//! field.

use {
    super::{MetaView, MetaWord, NodeId, NodeLocation, NodeType, ID_REGIONS},
    crate::{
        error::{ArborError, ArborResult},
        mem::{BlockAlloc, Mapping},
        util::os_page_size,
    },
    log::warn,
    parking_lot::Mutex,
    std::{
        path::Path,
        sync::atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

const IDS_MAGIC: u64 = u64::from_le_bytes(*b"ARBORIDS");
const IDS_VERSION: u32 = 1;

// header field offsets
const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_PAGE_BITS: u64 = 12;
const OFF_CLEAN: u64 = 16;
const OFF_NEXT_REGION: u64 = 24;
const OFF_NUM_BLOCKS: u64 = 28;
const OFF_AUDIT: u64 = 32;
const OFF_REGIONS: u64 = 64;
const REGION_ENTRY: u64 = 16;

struct RegionRef<'a> {
    use_count: &'a AtomicU32,
    next_alloc: &'a AtomicU32,
    first_free: &'a AtomicU64,
}

#[derive(Debug)]
pub struct IdAlloc {
    map: Mapping,
    blocks: BlockAlloc,
    page_size: u64,
    ids_per_page: u32,
    region_locks: Box<[Mutex<()>]>,
}

impl IdAlloc {
    pub fn header_len(page_size: u64) -> u64 {
        let raw = OFF_REGIONS + REGION_ENTRY * ID_REGIONS as u64;
        let page = os_page_size() as u64;
        // the first id block must start page aligned; the region table is a
        // hair over a megabyte so this wastes at most a page
        ((raw + page - 1) & !(page - 1)).max(page_size)
    }
    pub fn open(path: &Path, page_size: u64, max_blocks: u32) -> ArborResult<(Self, bool)> {
        let header = Self::header_len(page_size);
        let block_size = page_size << 16;
        let reserved = header + max_blocks as u64 * block_size;
        let (map, created) = Mapping::open(path, reserved, header + block_size)?;
        let slf = Self {
            map,
            blocks: BlockAlloc::new(header, block_size, max_blocks, 1),
            page_size,
            ids_per_page: (page_size / sizeof!(u64) as u64) as u32,
            region_locks: (0..ID_REGIONS).map(|_| Mutex::new(())).collect(),
        };
        if created {
            slf.format()?;
        } else {
            slf.validate(page_size)?;
        }
        Ok((slf, created))
    }
    fn format(&self) -> ArborResult<()> {
        let empty = MetaView::pack(0, NodeType::FreeList, NodeLocation::END_OF_FREELIST, false);
        for r in 0..ID_REGIONS {
            let rh = self.region(r as u16);
            rh.use_count.store(0, Ordering::Relaxed);
            rh.next_alloc.store((r == 0) as u32, Ordering::Relaxed);
            rh.first_free.store(empty.raw(), Ordering::Relaxed);
        }
        self.hdr_u32(OFF_VERSION).store(IDS_VERSION, Ordering::Relaxed);
        self.hdr_u32(OFF_PAGE_BITS)
            .store(self.page_size.trailing_zeros(), Ordering::Relaxed);
        self.hdr_u32(OFF_CLEAN).store(0, Ordering::Relaxed);
        self.hdr_u32(OFF_NEXT_REGION).store(0, Ordering::Relaxed);
        self.hdr_u32(OFF_NUM_BLOCKS).store(1, Ordering::Relaxed);
        self.hdr_u64(OFF_AUDIT).store(0, Ordering::Relaxed);
        // magic goes in last so a torn create reads as unformatted
        self.hdr_u64(OFF_MAGIC).store(IDS_MAGIC, Ordering::Release);
        self.map.flush_all(true)?;
        Ok(())
    }
    fn validate(&self, page_size: u64) -> ArborResult<()> {
        if self.hdr_u64(OFF_MAGIC).load(Ordering::Acquire) != IDS_MAGIC
            || self.hdr_u32(OFF_VERSION).load(Ordering::Relaxed) != IDS_VERSION
        {
            return Err(ArborError::Corruption);
        }
        if self.hdr_u32(OFF_PAGE_BITS).load(Ordering::Relaxed) != page_size.trailing_zeros() {
            return Err(ArborError::BadConfig("id_page_size"));
        }
        let blocks = self.hdr_u32(OFF_NUM_BLOCKS).load(Ordering::Relaxed);
        // a store that already grew past the configured cap cannot shrink
        self.blocks
            .reserve(&self.map, blocks)
            .map_err(|_| ArborError::BadConfig("max_id_blocks"))?;
        Ok(())
    }

    /*
        header plumbing
    */

    #[inline(always)]
    fn hdr_u32(&self, off: u64) -> &AtomicU32 {
        unsafe {
            // UNSAFE(@ohsayan): fixed in-bounds header offset, 4-byte aligned
            &*(self.map.as_ptr().add(off as usize) as *const AtomicU32)
        }
    }
    #[inline(always)]
    fn hdr_u64(&self, off: u64) -> &AtomicU64 {
        unsafe {
            // UNSAFE(@ohsayan): fixed in-bounds header offset, 8-byte aligned
            &*(self.map.as_ptr().add(off as usize) as *const AtomicU64)
        }
    }
    fn region(&self, r: u16) -> RegionRef<'_> {
        let base = OFF_REGIONS + r as u64 * REGION_ENTRY;
        RegionRef {
            use_count: self.hdr_u32(base),
            next_alloc: self.hdr_u32(base + 4),
            first_free: self.hdr_u64(base + 8),
        }
    }

    /*
        meta access
    */

    /// The meta word for an id. The id must name a materialized slot.
    #[inline(always)]
    pub fn meta(&self, id: NodeId) -> &MetaWord {
        debug_assert!(!id.is_null());
        debug_assert!(id.index() < self.capacity_per_region());
        self.meta_at(id.region(), id.index())
    }
    #[inline(always)]
    pub(crate) fn meta_at(&self, region: u16, index: u32) -> &MetaWord {
        let abs = index as u64 * sizeof!(u64) as u64;
        let block = abs / self.page_size;
        let in_page = abs & (self.page_size - 1);
        let off = self.blocks.block_off(block as u32) + region as u64 * self.page_size + in_page;
        unsafe {
            // UNSAFE(@ohsayan): in-bounds by the block/page arithmetic above,
            // 8-byte aligned because slots are 8 bytes into aligned pages
            &*(self.map.as_ptr().add(off as usize) as *const MetaWord)
        }
    }
    /// Bounds-checked lookup for ids read off the disk (compactor walks,
    /// recovery): `None` means the id cannot name a live node
    pub fn meta_checked(&self, id: NodeId) -> Option<&MetaWord> {
        if id.is_null() || id.index() >= self.capacity_per_region() {
            return None;
        }
        Some(self.meta_at(id.region(), id.index()))
    }
    pub fn capacity_per_region(&self) -> u32 {
        self.blocks.num_blocks() * self.ids_per_page
    }
    pub fn num_blocks(&self) -> u32 {
        self.blocks.num_blocks()
    }

    /*
        allocation
    */

    /// Allocate a fresh id with `ref = 1`, `location = null`. Regions are
    /// rotated per call; within a region the bump cursor wins over the free
    /// list.
    pub fn new_id(&self) -> ArborResult<(NodeId, &MetaWord)> {
        self.hdr_u64(OFF_AUDIT).fetch_add(1, Ordering::Relaxed);
        match self.new_id_inner() {
            Ok(ret) => Ok(ret),
            Err(e) => {
                self.hdr_u64(OFF_AUDIT).fetch_sub(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
    fn new_id_inner(&self) -> ArborResult<(NodeId, &MetaWord)> {
        'region: loop {
            let r = (self.hdr_u32(OFF_NEXT_REGION).fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
            let rh = self.region(r);
            let prior_uc = rh.use_count.fetch_add(1, Ordering::Relaxed);
            if crate::util::compiler::unlikely(prior_uc >= self.capacity_per_region()) {
                // every region fills at the same rate, so grow them all
                warn!("id region {r} exhausted its {} slots; growing the id map", self.capacity_per_region());
                let want = self.blocks.num_blocks() + 1;
                if let Err(e) = self.blocks.reserve(&self.map, want) {
                    rh.use_count.fetch_sub(1, Ordering::Relaxed);
                    return Err(e);
                }
                self.hdr_u32(OFF_NUM_BLOCKS)
                    .store(self.blocks.num_blocks(), Ordering::Release);
            }
            let capacity = self.capacity_per_region();
            if rh.next_alloc.load(Ordering::Relaxed) < capacity {
                let idx = rh.next_alloc.fetch_add(1, Ordering::Relaxed);
                if idx < capacity {
                    debug_assert!(!(r == 0 && idx == 0), "the null id must never be handed out");
                    let id = NodeId::new(r, idx);
                    let meta = self.meta_at(r, idx);
                    meta.store_raw(
                        MetaView::pack(1, NodeType::Undefined, NodeLocation::NULL, false).raw(),
                        Ordering::Relaxed,
                    );
                    return Ok((id, meta));
                }
                // raced past the end of the bump range; restore and fall
                // through to the free list
                rh.next_alloc.fetch_sub(1, Ordering::Relaxed);
            }
            // free list pop. the mutex serializes pops; pushes stay lock-free
            {
                let _g = self.region_locks[r as usize].lock();
                let mut head = rh.first_free.load(Ordering::Acquire);
                loop {
                    let hv = MetaView::from_raw(head);
                    if hv.location() == NodeLocation::END_OF_FREELIST {
                        // a racing free has bumped use_count down but not yet
                        // pushed; give the next region a try
                        rh.use_count.fetch_sub(1, Ordering::Relaxed);
                        continue 'region;
                    }
                    let idx = hv.location().raw() as u32;
                    let next = self.meta_at(r, idx).raw(Ordering::Relaxed);
                    match rh.first_free.compare_exchange_weak(
                        head,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            let id = NodeId::new(r, idx);
                            let meta = self.meta_at(r, idx);
                            meta.store_raw(
                                MetaView::pack(1, NodeType::Undefined, NodeLocation::NULL, false)
                                    .raw(),
                                Ordering::Relaxed,
                            );
                            return Ok((id, meta));
                        }
                        Err(now) => head = now,
                    }
                }
            }
        }
    }
    /// Return an id to its region's free list. The caller must have observed
    /// the refcount hit zero and finished the destructor.
    pub fn free_id(&self, id: NodeId) {
        debug_assert!(!id.is_null());
        self.hdr_u64(OFF_AUDIT).fetch_sub(1, Ordering::Relaxed);
        let rh = self.region(id.region());
        let meta = self.meta(id);
        let new_head = MetaView::pack(
            0,
            NodeType::FreeList,
            NodeLocation::from_raw(id.index() as u64),
            false,
        )
        .raw();
        let mut head = rh.first_free.load(Ordering::Acquire);
        loop {
            // the freed slot's meta word becomes the link to the old head
            meta.store_raw(head, Ordering::Release);
            match rh
                .first_free
                .compare_exchange_weak(head, new_head, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
        rh.use_count.fetch_sub(1, Ordering::Relaxed);
    }

    /*
        durability + shutdown state
    */

    pub fn sync(&self, blocking: bool) -> ArborResult<()> {
        self.map.flush_all(blocking)
    }
    pub fn was_clean_shutdown(&self) -> bool {
        self.hdr_u32(OFF_CLEAN).load(Ordering::Acquire) == 1
    }
    pub fn set_clean_shutdown(&self, clean: bool) -> ArborResult<()> {
        self.hdr_u32(OFF_CLEAN)
            .store(clean as u32, Ordering::Release);
        self.map.flush_range(0, os_page_size() as u64, true)
    }
    /// allocations minus frees since format; recovery resets it to the live
    /// node count so a later crash can be diffed against it
    pub fn audit_count(&self) -> u64 {
        self.hdr_u64(OFF_AUDIT).load(Ordering::Relaxed)
    }
    pub(crate) fn set_audit_count(&self, v: u64) {
        self.hdr_u64(OFF_AUDIT).store(v, Ordering::Relaxed)
    }

    /*
        recovery plumbing
    */

    /// Reset every region to "nothing allocated"; recovery then replays the
    /// live tree on top
    pub(crate) fn reset_regions(&self) {
        let empty = MetaView::pack(0, NodeType::FreeList, NodeLocation::END_OF_FREELIST, false);
        for r in 0..ID_REGIONS {
            let rh = self.region(r as u16);
            rh.use_count.store(0, Ordering::Relaxed);
            rh.next_alloc.store((r == 0) as u32, Ordering::Relaxed);
            rh.first_free.store(empty.raw(), Ordering::Relaxed);
        }
    }
    pub(crate) fn set_region_state(&self, r: u16, use_count: u32, next_alloc: u32) {
        let rh = self.region(r);
        rh.use_count.store(use_count, Ordering::Relaxed);
        rh.next_alloc.store(next_alloc, Ordering::Relaxed);
    }
    /// Free-list push without touching the use counters (recovery rebuilds
    /// those wholesale)
    pub(crate) fn freelist_push_raw(&self, r: u16, idx: u32) {
        let rh = self.region(r);
        let head = rh.first_free.load(Ordering::Relaxed);
        self.meta_at(r, idx).store_raw(head, Ordering::Relaxed);
        rh.first_free.store(
            MetaView::pack(
                0,
                NodeType::FreeList,
                NodeLocation::from_raw(idx as u64),
                false,
            )
            .raw(),
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::PathBuf};

    fn scratch(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("arbordb-ids-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn alloc_free_realloc() {
        let path = scratch("afr");
        let (ids, created) = IdAlloc::open(&path, 512, 4).unwrap();
        assert!(created);
        let (a, meta_a) = ids.new_id().unwrap();
        assert!(!a.is_null());
        assert_eq!(meta_a.view(Ordering::Relaxed).ref_count(), 1);
        assert_eq!(meta_a.view(Ordering::Relaxed).location(), NodeLocation::NULL);
        let (b, _) = ids.new_id().unwrap();
        assert_ne!(a, b);
        // regions rotate per allocation
        assert_ne!(a.region(), b.region());
        ids.free_id(a);
        assert_eq!(ids.audit_count(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn freelist_reuses_indices() {
        let path = scratch("reuse");
        let (ids, _) = IdAlloc::open(&path, 512, 4).unwrap();
        let cap = ids.capacity_per_region();
        // pretend region 3's bump range is spent, then hand two slots back
        ids.set_region_state(3, cap, cap);
        ids.free_id(NodeId::new(3, 5));
        ids.free_id(NodeId::new(3, 9));
        let blocks_before = ids.num_blocks();
        let mut got = vec![];
        for _ in 0..(1usize << 17) {
            let (id, _) = ids.new_id().unwrap();
            if id.region() == 3 {
                got.push(id.index());
                if got.len() == 2 {
                    break;
                }
            }
        }
        // LIFO: 9 went in last, comes out first; and no growth happened
        assert_eq!(got, vec![9, 5]);
        assert_eq!(ids.num_blocks(), blocks_before);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn survives_reopen() {
        let path = scratch("reopen");
        let first;
        {
            let (ids, _) = IdAlloc::open(&path, 512, 4).unwrap();
            first = ids.new_id().unwrap().0;
            ids.set_clean_shutdown(true).unwrap();
            ids.sync(true).unwrap();
        }
        {
            let (ids, created) = IdAlloc::open(&path, 512, 4).unwrap();
            assert!(!created);
            assert!(ids.was_clean_shutdown());
            assert_eq!(ids.meta(first).view(Ordering::Relaxed).ref_count(), 1);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_mismatched_page_size() {
        let path = scratch("pgsz");
        {
            let _ = IdAlloc::open(&path, 512, 4).unwrap();
        }
        assert_eq!(
            IdAlloc::open(&path, 1024, 4).unwrap_err(),
            ArborError::BadConfig("id_page_size")
        );
        let _ = std::fs::remove_file(&path);
    }
}
