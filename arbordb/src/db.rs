/*
 * Created on Sat Apr 27 2024
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

//! The store itself: three memory-mapped files plus the root journal in one
//! directory, owned by a single [`ArborDB`] value. Opening an uncleanly
//! closed store runs recovery, which rebuilds every refcount, free list and
//! space accounting from the most recent recoverable journaled root.

use {
    crate::{
        config::{Config, SyncMode},
        error::{ArborError, ArborResult},
        journal::RootJournal,
        meta::{IdAlloc, MetaWord, MoveParker, NodeId, NodeLocation, NodeType, ID_REGIONS},
        seg::{
            allocator::SegStore,
            compactor::{self, CompactorHandle},
            ObjectHeader, SEG_HEADER_SIZE, SEG_SEALED,
        },
        session::{ReadSession, RootHandle, WriteSession},
    },
    log::{info, warn},
    parking_lot::Mutex,
    std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Everything the sessions, the trie engine and the compactor share
#[derive(Debug)]
pub(crate) struct Store {
    pub cfg: Config,
    pub segs: SegStore,
    pub ids: IdAlloc,
    pub parker: MoveParker,
    pub current_root: Mutex<NodeId>,
    pub journal: Mutex<RootJournal>,
    pub writer_taken: AtomicBool,
    /// the compactor's destination segment; the lock also serializes
    /// compaction passes (manual and background)
    pub compact_state: Mutex<Option<u32>>,
    epoch: AtomicU64,
}

impl Store {
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
    pub fn set_epoch(&self, v: u64) {
        self.epoch.store(v, Ordering::Release)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One row of [`StoreStats`]
pub struct SegmentStats {
    pub segment: u32,
    pub sealed: bool,
    pub alloc_pos: u32,
    pub num_objects: u32,
    pub free_bytes: u32,
    pub freed_objects: u32,
    pub age: u64,
    pub last_sync_pos: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A point-in-time picture of the segment allocator
pub struct StoreStats {
    pub segments: Vec<SegmentStats>,
    pub num_segments: u64,
    pub alloc_ptr: u64,
    pub end_ptr: u64,
    pub min_read_ptr: u64,
    pub total_free_bytes: u64,
    /// allocations minus frees since format (the crash audit counter)
    pub live_ids: u64,
}

/// A persistent copy-on-write radix trie store
pub struct ArborDB {
    store: Arc<Store>,
    compactor: Mutex<Option<CompactorHandle>>,
    closed: AtomicBool,
}

impl ArborDB {
    /// Open a store directory, creating it if empty. Unclean shutdowns are
    /// recovered here, before anything else can see the store.
    pub fn open(path: &Path, config: Config) -> ArborResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(path)?;
        let (ids, ids_created) = IdAlloc::open(
            &path.join("ids.dat"),
            config.id_page_size as u64,
            config.max_id_blocks as u32,
        )?;
        let (segs, segs_created) = SegStore::open(path, &config)?;
        if ids_created != segs_created {
            // half a store is no store
            return Err(ArborError::Corruption);
        }
        let created = ids_created;
        let (journal, committed_roots, _) = RootJournal::open(&path.join("roots.dat"))?;
        let clean = ids.was_clean_shutdown();
        // geometry always comes from the store header once it exists
        let mut cfg = config;
        cfg.segment_size = segs.segment_size() as usize;
        cfg.max_segments = segs.max_segments() as usize;
        let store = Arc::new(Store {
            epoch: AtomicU64::new(journal.next_event_id()),
            cfg,
            segs,
            ids,
            parker: MoveParker::default(),
            current_root: Mutex::new(NodeId::NULL),
            journal: Mutex::new(journal),
            writer_taken: AtomicBool::new(false),
            compact_state: Mutex::new(None),
        });
        let root = if created {
            NodeId::NULL
        } else if clean {
            let root = committed_roots.last().copied().unwrap_or(NodeId::NULL);
            if !root.is_null() {
                let meta = store.ids.meta_checked(root).ok_or(ArborError::Corruption)?;
                if meta.view(Ordering::Acquire).ref_count() == 0 {
                    return Err(ArborError::Corruption);
                }
            }
            root
        } else {
            warn!("store was not shut down cleanly, recovering");
            let root = recover(&store, &committed_roots)?;
            // the recovered root is re-journaled so the log and the store
            // agree even if older commits were unrecoverable
            let epoch = store.journal.lock().append_commit(root, true)?;
            store.set_epoch(epoch);
            info!("recovery complete; root {:#x}", root.raw());
            root
        };
        *store.current_root.lock() = root;
        // we are dirty from here until a clean close
        store.ids.set_clean_shutdown(false)?;
        let db = Self {
            store,
            compactor: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if db.store.cfg.run_compact_thread {
            db.start_compact_thread();
        }
        Ok(db)
    }
    /// Create a brand new store; fails if one already exists at `path`
    pub fn create(path: &Path, config: Config) -> ArborResult<Self> {
        if path.join("ids.dat").exists() || path.join("segments.dat").exists() {
            return Err(ArborError::AlreadyExists);
        }
        Self::open(path, config)
    }

    /*
        sessions + roots
    */

    /// The single write session. A second concurrent writer is refused.
    pub fn writer(&self) -> ArborResult<WriteSession> {
        WriteSession::new(self.store.clone())
    }
    /// A snapshot read session (bounded slot count)
    pub fn reader(&self) -> ArborResult<ReadSession> {
        ReadSession::new(self.store.clone())
    }
    /// A handle to the most recently committed root
    pub fn current_root(&self) -> ArborResult<RootHandle> {
        let cur = self.store.current_root.lock();
        if !cur.is_null() && !self.store.ids.meta(*cur).retain() {
            return Err(ArborError::RefOverflow);
        }
        Ok(RootHandle::new(self.store.clone(), *cur, self.store.epoch()))
    }
    /// A handle to the empty trie
    pub fn empty_root(&self) -> RootHandle {
        RootHandle::new(self.store.clone(), NodeId::NULL, self.store.epoch())
    }

    /*
        administration
    */

    /// Run one compaction pass by hand. Returns whether a segment was
    /// evacuated.
    pub fn compact_next_segment(&self) -> ArborResult<bool> {
        compactor::compact_next_segment(&self.store)
    }
    pub fn start_compact_thread(&self) {
        let mut guard = self.compactor.lock();
        if guard.is_none() {
            *guard = Some(CompactorHandle::spawn(self.store.clone()));
        }
    }
    pub fn stop_compact_thread(&self) {
        if let Some(handle) = self.compactor.lock().take() {
            handle.shutdown();
        }
    }
    /// Flush with an explicit mode, regardless of the configured one
    pub fn sync(&self, mode: SyncMode) -> ArborResult<()> {
        let blocking = match mode {
            SyncMode::None => return Ok(()),
            SyncMode::Async => false,
            SyncMode::Blocking => true,
        };
        self.store.segs.sync_all(blocking)?;
        self.store.ids.sync(blocking)
    }
    pub fn stats(&self) -> StoreStats {
        let segs = &self.store.segs;
        let mut rows = Vec::with_capacity(segs.num_segments() as usize);
        let mut total_free = 0u64;
        for seg in 0..segs.num_segments() as u32 {
            let sh = segs.seg_header(seg);
            let sm = segs.seg_meta(seg);
            let (free, fobjs) = sm.free_and_objs();
            total_free += free as u64;
            rows.push(SegmentStats {
                segment: seg,
                sealed: sh.is_sealed(),
                alloc_pos: sh.alloc_pos(),
                num_objects: sh.num_objects(),
                free_bytes: free,
                freed_objects: fobjs,
                age: sh.age(),
                last_sync_pos: sm.last_sync(),
            });
        }
        StoreStats {
            segments: rows,
            num_segments: segs.num_segments(),
            alloc_ptr: segs.alloc_ptr(),
            end_ptr: segs.end_ptr(),
            min_read_ptr: segs.min_read_ptr(),
            total_free_bytes: total_free,
            live_ids: self.store.ids.audit_count(),
        }
    }
    /// Log the allocator state the way an operator would want to read it
    pub fn dump_segment_stats(&self) {
        let stats = self.stats();
        info!(
            "segment allocator: {} segments, ring A={} E={} minR={}, {} free bytes, {} live ids",
            stats.num_segments,
            stats.alloc_ptr,
            stats.end_ptr,
            stats.min_read_ptr,
            stats.total_free_bytes,
            stats.live_ids
        );
        for s in &stats.segments {
            info!(
                "  seg {:>4} | {} | pos {:>10} | objs {:>6} | freed {:>10}B/{:>6} | age {:>4} | synced {:>10}",
                s.segment,
                if s.sealed { "sealed" } else { "open  " },
                s.alloc_pos,
                s.num_objects,
                s.free_bytes,
                s.freed_objects,
                s.age,
                s.last_sync_pos
            );
        }
    }
    /// Close the store: stop compaction, flush everything, mark the
    /// shutdown clean. Also runs on drop; call it directly to observe
    /// errors.
    pub fn close(self) -> ArborResult<()> {
        self.shutdown()
    }
    fn shutdown(&self) -> ArborResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_compact_thread();
        if let Some(seg) = self.store.compact_state.lock().take() {
            self.store.segs.seal(seg)?;
        }
        self.store.segs.sync_all(true)?;
        self.store.ids.sync(true)?;
        self.store.journal.lock().append_close()?;
        if self.store.writer_taken.load(Ordering::Acquire) {
            // a live write session can still dirty the store; leave the
            // dirty flag so the next open recovers
            warn!("store closed with an active write session; not marking clean");
            return Ok(());
        }
        self.store.ids.set_clean_shutdown(true)?;
        Ok(())
    }
}

impl Drop for ArborDB {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("error while closing store: {e}");
        }
    }
}

/*
    crash recovery
*/

/// Children referenced by a node's payload, read without any refcount
/// preconditions (recovery rebuilds those)
fn raw_children(store: &Store, id: NodeId, loc: NodeLocation, ty: NodeType) -> ArborResult<(u32, Vec<NodeId>)> {
    use crate::node::{
        binary::{BinVal, BinaryNode},
        full::FullNode,
        setlist::SetListNode,
        value::ValueNode,
    };
    let at = store.segs.object_ptr(loc);
    let hdr = unsafe {
        // UNSAFE(@ohsayan): recovery runs single threaded before any session
        // exists
        ObjectHeader::read(at)
    };
    if hdr.id != id {
        return Err(ArborError::Corruption);
    }
    let payload = unsafe { core::slice::from_raw_parts(at.add(16), hdr.size as usize) };
    let children = match ty {
        NodeType::Value => vec![],
        NodeType::Roots => ValueNode::read(payload).roots().collect(),
        NodeType::Binary => {
            let b = BinaryNode::read(payload);
            (0..b.num_branches())
                .filter_map(|i| match b.value(i) {
                    BinVal::Child(c) => Some(c),
                    BinVal::Inline(_) => None,
                })
                .collect()
        }
        NodeType::SetList => {
            let s = SetListNode::read(payload);
            let mut v: Vec<NodeId> = s.branches().map(|(_, c)| c).collect();
            v.push(s.eos());
            v
        }
        NodeType::Full => {
            let f = FullNode::read(payload);
            let mut v: Vec<NodeId> = f.branches().map(|(_, c)| c).collect();
            v.push(f.eos());
            v
        }
        NodeType::FreeList | NodeType::Undefined => return Err(ArborError::Corruption),
    };
    Ok((hdr.span(), children))
}

fn for_each_meta(store: &Store, mut f: impl FnMut(u16, u32, &MetaWord)) {
    let cap = store.ids.capacity_per_region();
    for r in 0..ID_REGIONS as u16 {
        for idx in 0..cap {
            f(r, idx, store.ids.meta_at(r, idx));
        }
    }
}

/// Strip every refcount in the id map (pass one of recovery)
fn strip_all_refs(store: &Store) {
    for_each_meta(store, |_, _, m| m.strip_refs());
}

/// Walk a candidate root, re-counting references. Fails if anything it can
/// reach does not check out.
fn replay_refs(store: &Store, root: NodeId, live: &mut Vec<(u32, u32)>) -> ArborResult<u64> {
    let seg_bits = store.segs.seg_bits();
    let mut count = 0u64;
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if id.is_null() {
            continue;
        }
        let meta = store.ids.meta_checked(id).ok_or(ArborError::Corruption)?;
        let prior = meta.add_ref_relaxed();
        if prior != 0 {
            // shared node, already visited
            continue;
        }
        let view = meta.view(Ordering::Relaxed);
        if view.location() == NodeLocation::NULL {
            return Err(ArborError::Corruption);
        }
        let (span, children) = raw_children(store, id, view.location(), view.node_type())?;
        let seg = view.location().segment(seg_bits) as usize;
        if seg >= live.len() {
            return Err(ArborError::Corruption);
        }
        live[seg].0 += span;
        live[seg].1 += 1;
        count += 1;
        stack.extend(children);
    }
    Ok(count)
}

/// Rebuild the store's derived state after a crash: refcounts from the most
/// recent recoverable journaled root, then segment accounting, then the id
/// regions' bump cursors and free lists, then a clean, empty free ring.
fn recover(store: &Store, candidates: &[NodeId]) -> ArborResult<NodeId> {
    let num_segs = store.segs.num_segments() as usize;
    // find the newest journaled root whose whole tree checks out
    let mut chosen = NodeId::NULL;
    let mut live = vec![(0u32, 0u32); num_segs];
    let mut live_total = 0u64;
    strip_all_refs(store);
    for root in candidates.iter().rev() {
        let mut attempt = vec![(0u32, 0u32); num_segs];
        match replay_refs(store, *root, &mut attempt) {
            Ok(count) => {
                chosen = *root;
                live = attempt;
                live_total = count;
                break;
            }
            Err(_) => {
                warn!(
                    "recovery: journaled root {:#x} is not intact, trying an older one",
                    root.raw()
                );
                strip_all_refs(store);
            }
        }
    }
    // segment pass: reseal everything, recompute reclaimable space
    let seg_size = store.segs.segment_size() as u32;
    for seg in 0..num_segs as u32 {
        let sh = store.segs.seg_header(seg);
        let (live_bytes, live_objs) = live[seg as usize];
        if !sh.is_sealed() {
            // a crashed writer's segment: find its last parseable byte
            // (the persisted cursor cannot be trusted) and seal there
            let end = store.segs.parse_data_end(seg);
            unsafe {
                // UNSAFE(@ohsayan): single threaded; the tail belongs to us
                if seg_size - end >= crate::seg::OBJ_HEADER_SIZE {
                    ObjectHeader::sentinel(seg_size - end)
                        .write(store.segs.seg_base(seg).add(end as usize));
                }
            }
            sh.set_last_sync_copy(end);
            sh.set_alloc_pos(SEG_SEALED);
        }
        sh.set_num_objects(live_objs);
        let sm = store.segs.seg_meta(seg);
        sm.clear();
        sm.add_free_bytes(seg_size - SEG_HEADER_SIZE - live_bytes);
        sm.set_last_sync(0);
        store.segs.sync_segment(seg, true)?;
    }
    store.segs.reset_ring();
    // id region pass: bump cursors above the highest live index, everything
    // below that is either live or goes back to the free list
    store.ids.reset_regions();
    let cap = store.ids.capacity_per_region();
    for r in 0..ID_REGIONS as u16 {
        let mut max_live = None;
        let mut use_count = 0u32;
        for idx in 0..cap {
            if store.ids.meta_at(r, idx).view(Ordering::Relaxed).ref_count() > 0 {
                max_live = Some(idx);
                use_count += 1;
            }
        }
        let floor = (r == 0) as u32;
        let next_alloc = max_live.map(|m| m + 1).unwrap_or(floor).max(floor);
        store.ids.set_region_state(r, use_count, next_alloc);
        // reset the free list, then repopulate the holes below the cursor
        for idx in floor..next_alloc {
            if store.ids.meta_at(r, idx).view(Ordering::Relaxed).ref_count() == 0 {
                store.ids.freelist_push_raw(r, idx);
            }
        }
    }
    store.ids.set_audit_count(live_total);
    store.ids.sync(true)?;
    info!(
        "recovery rebuilt {} live nodes across {} segments",
        live_total, num_segs
    );
    Ok(chosen)
}
