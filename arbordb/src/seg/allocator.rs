/*
 * Created on Sat Mar 09 2024
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

//! The segment allocator owns segments.dat and header.dat. The append cursor
//! of any given segment belongs to exactly one role (the writer and the
//! compactor fill disjoint segments), the free-segment ring is SPMC (only the
//! compactor advances `end_ptr`, only allocation advances `alloc_ptr`, and
//! reader slots are written only by their owning session), and everything
//! else here is either immutable geometry or atomics.

use {
    super::{ObjectHeader, MAX_OBJECT_PAYLOAD, OBJ_HEADER_SIZE, SEG_HEADER_SIZE, SEG_SEALED},
    crate::{
        config::Config,
        error::{ArborError, ArborResult},
        mem::{MapAdvice, Mapping},
        meta::{NodeId, NodeLocation, NodeType},
        util::round_up_16,
    },
    log::info,
    parking_lot::Mutex,
    std::{
        path::Path,
        sync::atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

const HDR_MAGIC: u64 = u64::from_le_bytes(*b"ARBORHDR");
const HDR_VERSION: u32 = 1;

const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_SEG_BITS: u64 = 12;
const OFF_MAX_SEGMENTS: u64 = 16;
const OFF_ALLOC_PTR: u64 = 24;
const OFF_END_PTR: u64 = 32;
const OFF_NEXT_AGE: u64 = 40;
const OFF_NUM_SEGMENTS: u64 = 48;
const OFF_RING: u64 = 64;
const SEG_META_ENTRY: u64 = 16;

/// Reader slot capacity. A slot holding `u64::MAX` is unpinned.
pub const MAX_SESSIONS: usize = 64;
const SLOT_FREE: u64 = u64::MAX;

/// Atomic field views over a segment's in-place header
pub struct SegHeaderRef<'a> {
    alloc_pos: &'a AtomicU32,
    num_objects: &'a AtomicU32,
    age: &'a AtomicU64,
    last_sync_copy: &'a AtomicU32,
}

impl SegHeaderRef<'_> {
    #[inline(always)]
    pub fn alloc_pos(&self) -> u32 {
        self.alloc_pos.load(Ordering::Acquire)
    }
    pub fn set_alloc_pos(&self, v: u32) {
        self.alloc_pos.store(v, Ordering::Release)
    }
    pub fn is_sealed(&self) -> bool {
        self.alloc_pos() == SEG_SEALED
    }
    pub fn num_objects(&self) -> u32 {
        self.num_objects.load(Ordering::Relaxed)
    }
    pub fn set_num_objects(&self, v: u32) {
        self.num_objects.store(v, Ordering::Relaxed)
    }
    pub fn bump_num_objects(&self) {
        self.num_objects.fetch_add(1, Ordering::Relaxed);
    }
    pub fn age(&self) -> u64 {
        self.age.load(Ordering::Relaxed)
    }
    pub fn set_age(&self, v: u64) {
        self.age.store(v, Ordering::Relaxed)
    }
    pub fn set_last_sync_copy(&self, v: u32) {
        self.last_sync_copy.store(v, Ordering::Relaxed)
    }
}

/// Atomic field views over a segment's row in the header.dat metadata table
pub struct SegMetaRef<'a> {
    /// low 32 bits: freed bytes; high 32 bits: freed objects
    free_info: &'a AtomicU64,
    last_sync: &'a AtomicU32,
}

impl SegMetaRef<'_> {
    pub fn free_object(&self, span: u32) {
        self.free_info
            .fetch_add(span as u64 | (1 << 32), Ordering::Relaxed);
    }
    pub fn add_free_bytes(&self, bytes: u32) {
        self.free_info.fetch_add(bytes as u64, Ordering::Relaxed);
    }
    pub fn free_and_objs(&self) -> (u32, u32) {
        let v = self.free_info.load(Ordering::Relaxed);
        (v as u32, (v >> 32) as u32)
    }
    pub fn clear(&self) {
        self.free_info.store(0, Ordering::Relaxed);
    }
    pub fn last_sync(&self) -> u32 {
        self.last_sync.load(Ordering::Relaxed)
    }
    pub fn set_last_sync(&self, v: u32) {
        self.last_sync.store(v, Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct SegStore {
    segs: Mapping,
    hdr: Mapping,
    seg_bits: u32,
    segment_size: u64,
    max_segments: u64,
    meta_off: u64,
    grow_lock: Mutex<()>,
    session_slots: [AtomicU64; MAX_SESSIONS],
    free_sessions: AtomicU64,
    min_read_ptr: AtomicU64,
}

impl SegStore {
    pub fn open(dir: &Path, cfg: &Config) -> ArborResult<(Self, bool)> {
        let seg_path = dir.join("segments.dat");
        let hdr_path = dir.join("header.dat");
        // the header file is fixed-size; compute with the configured geometry
        // first, then re-derive if an existing store disagrees
        let hdr_len = Self::header_len(cfg.max_segments as u64);
        let (mut hdr, hdr_created) = Mapping::open(&hdr_path, hdr_len, hdr_len)?;
        let (seg_bits, max_segments) = if hdr_created {
            (cfg.seg_bits(), cfg.max_segments as u64)
        } else {
            let magic = unsafe { (hdr.as_ptr() as *const u64).read() };
            let version = unsafe { (hdr.as_ptr().add(OFF_VERSION as usize) as *const u32).read() };
            if u64::from_le(magic) != HDR_MAGIC || u32::from_le(version) != HDR_VERSION {
                return Err(ArborError::Corruption);
            }
            let bits =
                unsafe { (hdr.as_ptr().add(OFF_SEG_BITS as usize) as *const u32).read() };
            let maxs =
                unsafe { (hdr.as_ptr().add(OFF_MAX_SEGMENTS as usize) as *const u64).read() };
            (u32::from_le(bits), u64::from_le(maxs))
        };
        // an existing store's geometry wins over the configured one, which
        // can leave the mapping sized for the wrong ring: remap
        if !hdr_created && Self::header_len(max_segments) != hdr_len {
            let real = Self::header_len(max_segments);
            drop(hdr);
            hdr = Mapping::open(&hdr_path, real, real)?.0;
        }
        let segment_size = 1u64 << seg_bits;
        let (segs, _) = Mapping::open(&seg_path, max_segments * segment_size, 0)?;
        let slf = Self {
            segs,
            hdr,
            seg_bits,
            segment_size,
            max_segments,
            meta_off: round_up_16((OFF_RING + max_segments * 4) as usize) as u64,
            grow_lock: Mutex::new(()),
            session_slots: core::array::from_fn(|_| AtomicU64::new(SLOT_FREE)),
            free_sessions: AtomicU64::new(u64::MAX),
            min_read_ptr: AtomicU64::new(0),
        };
        if hdr_created {
            slf.hdr_u32(OFF_SEG_BITS).store(seg_bits, Ordering::Relaxed);
            slf.hdr_u64(OFF_MAX_SEGMENTS)
                .store(max_segments, Ordering::Relaxed);
            slf.hdr_u32(OFF_VERSION).store(HDR_VERSION, Ordering::Relaxed);
            slf.hdr_u64(OFF_MAGIC).store(HDR_MAGIC, Ordering::Release);
            slf.hdr.flush_all(true)?;
        } else if slf.segs.len() < slf.num_segments() * segment_size {
            // the data file is shorter than the header believes: torn create
            return Err(ArborError::Corruption);
        }
        Ok((slf, hdr_created))
    }
    fn header_len(max_segments: u64) -> u64 {
        let meta_off = round_up_16((OFF_RING + max_segments * 4) as usize) as u64;
        let raw = meta_off + max_segments * SEG_META_ENTRY;
        let page = crate::util::os_page_size() as u64;
        (raw + page - 1) & !(page - 1)
    }

    /*
        geometry
    */

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
    pub fn seg_bits(&self) -> u32 {
        self.seg_bits
    }
    pub fn max_segments(&self) -> u64 {
        self.max_segments
    }
    pub fn num_segments(&self) -> u64 {
        self.hdr_u64(OFF_NUM_SEGMENTS).load(Ordering::Acquire)
    }

    /*
        header plumbing
    */

    #[inline(always)]
    fn hdr_u32(&self, off: u64) -> &AtomicU32 {
        unsafe {
            // UNSAFE(@ohsayan): fixed in-bounds header offset, 4-byte aligned
            &*(self.hdr.as_ptr().add(off as usize) as *const AtomicU32)
        }
    }
    #[inline(always)]
    fn hdr_u64(&self, off: u64) -> &AtomicU64 {
        unsafe {
            // UNSAFE(@ohsayan): fixed in-bounds header offset, 8-byte aligned
            &*(self.hdr.as_ptr().add(off as usize) as *const AtomicU64)
        }
    }
    pub fn alloc_ptr(&self) -> u64 {
        self.hdr_u64(OFF_ALLOC_PTR).load(Ordering::Acquire)
    }
    pub fn end_ptr(&self) -> u64 {
        self.hdr_u64(OFF_END_PTR).load(Ordering::Acquire)
    }
    fn ring_slot(&self, at: u64) -> &AtomicU32 {
        self.hdr_u32(OFF_RING + (at & (self.max_segments - 1)) * 4)
    }
    pub fn seg_header(&self, seg: u32) -> SegHeaderRef<'_> {
        debug_assert!((seg as u64) < self.num_segments());
        let base = seg as u64 * self.segment_size;
        unsafe {
            // UNSAFE(@ohsayan): the first 32 bytes of every materialized
            // segment are its header; all fields are naturally aligned
            SegHeaderRef {
                alloc_pos: &*(self.segs.as_ptr().add(base as usize) as *const AtomicU32),
                num_objects: &*(self.segs.as_ptr().add(base as usize + 4) as *const AtomicU32),
                age: &*(self.segs.as_ptr().add(base as usize + 8) as *const AtomicU64),
                last_sync_copy: &*(self.segs.as_ptr().add(base as usize + 16) as *const AtomicU32),
            }
        }
    }
    pub fn seg_meta(&self, seg: u32) -> SegMetaRef<'_> {
        debug_assert!((seg as u64) < self.max_segments);
        let base = self.meta_off + seg as u64 * SEG_META_ENTRY;
        SegMetaRef {
            free_info: self.hdr_u64(base),
            last_sync: self.hdr_u32(base + 8),
        }
    }

    /*
        object access
    */

    #[inline(always)]
    pub fn seg_base(&self, seg: u32) -> *mut u8 {
        unsafe {
            // UNSAFE(@ohsayan): bounded by num_segments everywhere this is
            // reachable from
            self.segs.as_ptr().add((seg as u64 * self.segment_size) as usize)
        }
    }
    /// Pointer to the object *header* at a location
    #[inline(always)]
    pub fn object_ptr(&self, loc: NodeLocation) -> *mut u8 {
        debug_assert!(loc.offset() + OBJ_HEADER_SIZE as u64 <= self.segs.len());
        unsafe {
            // UNSAFE(@ohsayan): locations are only ever minted by alloc()
            // below, which keeps them inside the materialized file
            self.segs.as_ptr().add(loc.offset() as usize)
        }
    }
    /// Record freed space once a node at `loc` has been destroyed
    pub fn note_freed(&self, loc: NodeLocation, span: u32) {
        self.seg_meta(loc.segment(self.seg_bits)).free_object(span);
    }
    /// Linearly parse a segment's object records. Stops at the tail
    /// sentinel, at the unsealed cursor, or at the first structurally
    /// implausible header (a crashed writer's torn tail).
    pub fn walk_objects(&self, seg: u32) -> ObjectWalker<'_> {
        let sh = self.seg_header(seg);
        let end = if sh.is_sealed() {
            self.segment_size as u32
        } else {
            // a crashed writer can leave a nonsense cursor behind
            sh.alloc_pos().min(self.segment_size as u32)
        };
        ObjectWalker {
            store: self,
            seg,
            pos: SEG_HEADER_SIZE,
            end,
        }
    }

    /*
        allocation
    */

    /// Bump-allocate an object in the caller's current segment, sealing and
    /// replacing it when the record does not fit. Returns the location and a
    /// pointer to the (zeroed-by-the-OS or stale) payload bytes.
    pub fn alloc(
        &self,
        cur: &mut Option<u32>,
        payload: u32,
        id: NodeId,
        ty: NodeType,
    ) -> ArborResult<(NodeLocation, *mut u8)> {
        let size = round_up_16(payload as usize) as u32;
        if size > MAX_OBJECT_PAYLOAD
            || size as u64 + (SEG_HEADER_SIZE + OBJ_HEADER_SIZE) as u64 > self.segment_size
        {
            return Err(ArborError::TooLarge);
        }
        let span = OBJ_HEADER_SIZE + size;
        loop {
            let seg = match *cur {
                Some(seg) => seg,
                None => {
                    let seg = self.new_segment()?;
                    *cur = Some(seg);
                    seg
                }
            };
            let sh = self.seg_header(seg);
            let pos = sh.alloc_pos();
            debug_assert_ne!(pos, SEG_SEALED, "allocating into a sealed segment");
            if pos as u64 + span as u64 > self.segment_size {
                self.seal(seg)?;
                *cur = None;
                continue;
            }
            let at = unsafe {
                // UNSAFE(@ohsayan): [pos, pos+span) is unallocated space in a
                // segment whose cursor only we advance
                self.seg_base(seg).add(pos as usize)
            };
            unsafe {
                ObjectHeader { size, id, ty }.write(at);
            }
            sh.bump_num_objects();
            sh.set_alloc_pos(pos + span);
            let loc = NodeLocation::from_offset(seg as u64 * self.segment_size + pos as u64);
            return Ok((loc, unsafe { at.add(OBJ_HEADER_SIZE as usize) }));
        }
    }
    /// Seal a segment: pad the tail with a free-space sentinel, mark the
    /// cursor, and flush its contents. The flush blocks: "sealed" doubles as
    /// "durable up to the seal" everywhere ring reuse is decided.
    pub fn seal(&self, seg: u32) -> ArborResult<()> {
        let sh = self.seg_header(seg);
        let pos = sh.alloc_pos();
        debug_assert_ne!(pos, SEG_SEALED);
        let remaining = self.segment_size as u32 - pos;
        debug_assert_eq!(remaining % 16, 0);
        if remaining >= OBJ_HEADER_SIZE {
            unsafe {
                // UNSAFE(@ohsayan): the tail belongs to this segment's owner
                ObjectHeader::sentinel(remaining).write(self.seg_base(seg).add(pos as usize));
            }
            self.seg_meta(seg).add_free_bytes(remaining);
        }
        sh.set_last_sync_copy(pos);
        sh.set_alloc_pos(SEG_SEALED);
        self.sync_segment(seg, true)
    }
    /// Grab a segment to fill: reuse off the ring if every reader has moved
    /// past one, otherwise extend the file
    fn new_segment(&self) -> ArborResult<u32> {
        let mut ap = self.alloc_ptr();
        let min = self.min_read_ptr();
        while min.wrapping_sub(ap) >= 1 && ap < min {
            match self.hdr_u64(OFF_ALLOC_PTR).compare_exchange_weak(
                ap,
                ap + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let seg = self.ring_slot(ap).load(Ordering::Acquire);
                    return Ok(self.prepare_segment(seg));
                }
                Err(now) => ap = now,
            }
        }
        // nothing reusable: extend the file
        let _g = self.grow_lock.lock();
        let n = self.num_segments();
        if n >= self.max_segments {
            return Err(ArborError::OutOfSpace);
        }
        self.segs.grow_to((n + 1) * self.segment_size)?;
        self.hdr_u64(OFF_NUM_SEGMENTS).store(n + 1, Ordering::Release);
        info!("segment store grew to {} segments", n + 1);
        Ok(self.prepare_segment(n as u32))
    }
    fn prepare_segment(&self, seg: u32) -> u32 {
        let base = seg as u64 * self.segment_size;
        self.segs.advise(base, self.segment_size, MapAdvice::WillNeed);
        let sh = self.seg_header(seg);
        sh.set_num_objects(0);
        sh.set_age(self.hdr_u64(OFF_NEXT_AGE).fetch_add(1, Ordering::Relaxed));
        sh.set_last_sync_copy(0);
        let sm = self.seg_meta(seg);
        sm.clear();
        sm.set_last_sync(0);
        // the store stays forward-parseable: the cursor is published last
        sh.set_alloc_pos(SEG_HEADER_SIZE);
        seg
    }
    /// Publish an evacuated, fully durable segment for reuse. Only the
    /// compactor calls this.
    pub fn push_free(&self, seg: u32) {
        debug_assert_eq!(self.seg_meta(seg).last_sync(), self.segment_size as u32);
        let ep = self.end_ptr();
        self.ring_slot(ep).store(seg, Ordering::Release);
        self.hdr_u64(OFF_END_PTR).fetch_add(1, Ordering::Release);
    }

    /*
        reader slots
    */

    /// Claim a reader slot, pinning the ring at the current end pointer:
    /// segments evacuated from now on cannot be reused under this session
    pub fn claim_session(&self) -> ArborResult<usize> {
        let mut fs = self.free_sessions.load(Ordering::Acquire);
        loop {
            if fs == 0 {
                return Err(ArborError::SessionLimit);
            }
            let slot = fs.trailing_zeros() as usize;
            match self.free_sessions.compare_exchange_weak(
                fs,
                fs & !(1 << slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.session_slots[slot].store(self.end_ptr(), Ordering::Release);
                    return Ok(slot);
                }
                Err(now) => fs = now,
            }
        }
    }
    /// Claim a slot without pinning (the write session pins per operation)
    pub fn claim_session_unpinned(&self) -> ArborResult<usize> {
        let slot = self.claim_session()?;
        self.unpin_session(slot);
        Ok(slot)
    }
    pub fn pin_session(&self, slot: usize) {
        self.session_slots[slot].store(self.end_ptr(), Ordering::Release);
    }
    pub fn unpin_session(&self, slot: usize) {
        self.session_slots[slot].store(SLOT_FREE, Ordering::Release);
    }
    pub fn release_session(&self, slot: usize) {
        self.session_slots[slot].store(SLOT_FREE, Ordering::Release);
        self.free_sessions.fetch_or(1 << slot, Ordering::AcqRel);
    }
    /// `alloc_ptr <= min(reader pins) <= end_ptr`, recomputed lazily the way
    /// the ring is actually consumed
    pub fn min_read_ptr(&self) -> u64 {
        let ap = self.alloc_ptr();
        let ep = self.end_ptr();
        let mut min = self.min_read_ptr.load(Ordering::Acquire);
        if ap >= min {
            min = ep;
            let taken = !self.free_sessions.load(Ordering::Acquire);
            for slot in 0..MAX_SESSIONS {
                if taken & (1 << slot) != 0 {
                    let p = self.session_slots[slot].load(Ordering::Relaxed);
                    if p < min {
                        min = p;
                    }
                    if min == ap {
                        break;
                    }
                }
            }
        }
        if min > ep {
            min = ep;
        }
        self.min_read_ptr.store(min, Ordering::Release);
        min
    }

    /*
        durability
    */

    /// Flush a segment's unwritten range. Sealed segments flush through to
    /// their end so they can satisfy the full-durability bar for ring reuse.
    pub fn sync_segment(&self, seg: u32, blocking: bool) -> ArborResult<()> {
        let sm = self.seg_meta(seg);
        let pos = self.seg_header(seg).alloc_pos();
        let upto = if pos == SEG_SEALED {
            self.segment_size as u32
        } else {
            pos
        };
        let last = sm.last_sync();
        if upto > last {
            self.segs.flush_range(
                seg as u64 * self.segment_size + last as u64,
                (upto - last) as u64,
                blocking,
            )?;
            sm.set_last_sync(upto);
        }
        Ok(())
    }
    /// Recovery: find where a segment's valid data really ends by parsing
    /// with no trust in the (possibly stale) cursor. Stops at the first
    /// implausible header or sentinel; committed objects always sit below
    /// that point because the writer lays records down back to back.
    pub(crate) fn parse_data_end(&self, seg: u32) -> u32 {
        let mut pos = SEG_HEADER_SIZE;
        let size = self.segment_size as u32;
        while pos + OBJ_HEADER_SIZE <= size {
            let hdr = unsafe {
                // UNSAFE(@ohsayan): in-bounds by the loop condition
                ObjectHeader::read(self.seg_base(seg).add(pos as usize))
            };
            if !hdr.looks_sane(pos, size) || hdr.is_sentinel() {
                break;
            }
            pos += hdr.span();
        }
        pos
    }
    /// Recovery: forget every queued free segment and reader pin
    pub(crate) fn reset_ring(&self) {
        self.hdr_u64(OFF_ALLOC_PTR).store(0, Ordering::Release);
        self.hdr_u64(OFF_END_PTR).store(0, Ordering::Release);
        self.min_read_ptr.store(0, Ordering::Release);
    }
    /// Flush every segment plus the allocator header
    pub fn sync_all(&self, blocking: bool) -> ArborResult<()> {
        for seg in 0..self.num_segments() as u32 {
            self.sync_segment(seg, blocking)?;
        }
        self.hdr.flush_all(blocking)?;
        Ok(())
    }
    pub fn advise_segment(&self, seg: u32, advice: MapAdvice) {
        self.segs
            .advise(seg as u64 * self.segment_size, self.segment_size, advice);
    }
}

/// See [`SegStore::walk_objects`]
pub struct ObjectWalker<'a> {
    store: &'a SegStore,
    seg: u32,
    pos: u32,
    end: u32,
}

impl ObjectWalker<'_> {
    /// Where the walk stopped (used by recovery to find a crashed writer's
    /// last good byte)
    pub fn pos(&self) -> u32 {
        self.pos
    }
}

impl Iterator for ObjectWalker<'_> {
    /// `(offset within segment, header)`
    type Item = (u32, ObjectHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + OBJ_HEADER_SIZE > self.end {
            return None;
        }
        let hdr = unsafe {
            // UNSAFE(@ohsayan): pos is within the segment by the check above
            ObjectHeader::read(self.store.seg_base(self.seg).add(self.pos as usize))
        };
        if !hdr.looks_sane(self.pos, self.store.segment_size as u32) || hdr.is_sentinel() {
            return None;
        }
        let at = self.pos;
        self.pos += hdr.span();
        Some((at, hdr))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::PathBuf};

    fn scratch(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("arbordb-seg-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&d);
        std::fs::create_dir_all(&d).unwrap();
        d
    }
    fn cfg() -> Config {
        Config::small()
    }

    #[test]
    fn alloc_places_headers() {
        let dir = scratch("alloc");
        let (store, created) = SegStore::open(&dir, &cfg()).unwrap();
        assert!(created);
        let mut cur = None;
        let id = NodeId::new(1, 1);
        let (loc, _) = store.alloc(&mut cur, 100, id, NodeType::Value).unwrap();
        assert_eq!(loc.in_segment(store.seg_bits()), SEG_HEADER_SIZE);
        let hdr = unsafe { ObjectHeader::read(store.object_ptr(loc)) };
        assert_eq!(hdr.id, id);
        assert_eq!(hdr.size, 112); // rounded to 16
        assert_eq!(hdr.ty, NodeType::Value);
        assert_eq!(store.seg_header(cur.unwrap()).num_objects(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn seal_rolls_to_next_segment() {
        let dir = scratch("seal");
        let (store, _) = SegStore::open(&dir, &cfg()).unwrap();
        let mut cur = None;
        // fill most of the 64 KiB segment, then force a rollover
        let big = 60 * 1024;
        let (first, _) = store
            .alloc(&mut cur, big, NodeId::new(1, 1), NodeType::Value)
            .unwrap();
        let (second, _) = store
            .alloc(&mut cur, big, NodeId::new(1, 2), NodeType::Value)
            .unwrap();
        assert_eq!(first.segment(store.seg_bits()), 0);
        assert_eq!(second.segment(store.seg_bits()), 1);
        assert!(store.seg_header(0).is_sealed());
        // the sealed tail is a parseable sentinel
        let tail_pos = SEG_HEADER_SIZE + OBJ_HEADER_SIZE + round_up_16(big as usize) as u32;
        let tail = unsafe {
            ObjectHeader::read(store.seg_base(0).add(tail_pos as usize))
        };
        assert!(tail.is_sentinel());
        assert_eq!(tail_pos + tail.span(), store.segment_size() as u32);
        // sealed means fully durable
        assert_eq!(store.seg_meta(0).last_sync(), store.segment_size() as u32);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ring_respects_reader_pins() {
        let dir = scratch("ring");
        let (store, _) = SegStore::open(&dir, &cfg()).unwrap();
        let mut cur = None;
        let (_, _) = store
            .alloc(&mut cur, 64, NodeId::new(1, 1), NodeType::Value)
            .unwrap();
        let seg = cur.unwrap();
        // a reader pins before the segment is evacuated
        let slot = store.claim_session().unwrap();
        store.seal(seg).unwrap();
        store.seg_meta(seg).set_last_sync(store.segment_size() as u32);
        store.push_free(seg);
        // the pin predates the push, so the segment must not be reused
        let mut cur2 = None;
        store
            .alloc(&mut cur2, 64, NodeId::new(1, 2), NodeType::Value)
            .unwrap();
        assert_ne!(cur2.unwrap(), seg);
        // release the reader: now the ring serves it back
        store.release_session(slot);
        let mut cur3 = None;
        store
            .alloc(&mut cur3, 64, NodeId::new(1, 3), NodeType::Value)
            .unwrap();
        assert_eq!(cur3.unwrap(), seg);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn out_of_space_is_reported() {
        let dir = scratch("oos");
        let mut c = cfg();
        c.max_segments = 4;
        let (store, _) = SegStore::open(&dir, &c).unwrap();
        let mut cur = None;
        let mut last = Ok(());
        for i in 0..5u32 {
            last = store
                .alloc(&mut cur, 60 * 1024, NodeId::new(1, i + 1), NodeType::Value)
                .map(|_| ());
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last.unwrap_err(), ArborError::OutOfSpace);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
