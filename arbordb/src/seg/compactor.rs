/*
 * Created on Sat Mar 23 2024
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

//! The compactor: a background role that walks the emptiest sealed segment,
//! relocates whatever is still live into its own destination segment through
//! the meta-word move protocol, and hands the evacuated segment to the free
//! ring once everything moved out of it is durable. The writer can defeat
//! any individual move (it always wins the meta-word race) but never the
//! walk itself, so a pass over a segment is bounded by the segment size.

use {
    super::OBJ_HEADER_SIZE,
    crate::{
        db::Store,
        error::ArborResult,
        mem::MapAdvice,
        meta::{MoveResult, NodeLocation},
    },
    log::{debug, info, warn},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// How long the loop naps when no segment qualifies
const IDLE_NAP: Duration = Duration::from_millis(2);

pub(crate) struct CompactorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CompactorHandle {
    pub fn spawn(store: Arc<Store>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name("compactor".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match compact_next_segment(&store) {
                        Ok(true) => {}
                        Ok(false) => thread::sleep(IDLE_NAP),
                        Err(e) => {
                            warn!("compactor: pass failed: {e}; backing off");
                            thread::sleep(IDLE_NAP * 50);
                        }
                    }
                }
            })
            .expect("spawning the compactor thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Pick the most reclaimable sealed segment and evacuate it. Returns false
/// when nothing clears the free-space bar. The destination-segment lock
/// serializes passes, which also keeps `end_ptr` single-producer.
pub(crate) fn compact_next_segment(store: &Store) -> ArborResult<bool> {
    let mut dest = store.compact_state.lock();
    let threshold = (store.segs.segment_size() as usize / store.cfg.compact_min_free_div) as u32;
    let total = store.segs.num_segments() as u32;
    let mut victim: Option<(u32, u32, u64)> = None; // (seg, free, age)
    for seg in 0..total {
        if Some(seg) == *dest {
            continue;
        }
        let sh = store.segs.seg_header(seg);
        if !sh.is_sealed() {
            // the writer (or we) are still filling it
            continue;
        }
        let (free, _) = store.segs.seg_meta(seg).free_and_objs();
        if free < threshold {
            continue;
        }
        let better = match victim {
            None => true,
            // most free space wins; older data breaks ties
            Some((_, bf, ba)) => free > bf || (free == bf && sh.age() < ba),
        };
        if better {
            victim = Some((seg, free, sh.age()));
        }
    }
    let Some((victim, free, _)) = victim else {
        return Ok(false);
    };
    debug!("compactor: evacuating segment {victim} ({free} reclaimable bytes)");
    compact_segment(store, &mut dest, victim)?;
    Ok(true)
}

/// Walk one sealed segment and move every still-live object out
fn compact_segment(store: &Store, dest: &mut Option<u32>, victim: u32) -> ArborResult<()> {
    store.segs.advise_segment(victim, MapAdvice::Sequential);
    let seg_bits = store.segs.seg_bits();
    let seg_base = (victim as u64) << seg_bits;
    let mut moved = 0u32;
    let mut skipped = 0u32;
    for (pos, hdr) in store.segs.walk_objects(victim) {
        let meta = match store.ids.meta_checked(hdr.id) {
            Some(m) => m,
            None => continue,
        };
        let obj_loc = NodeLocation::from_offset(seg_base + pos as u64);
        // an object must not still live here once we recycle the segment, so
        // a move the writer dirties mid-copy is retried, not abandoned
        loop {
            let view = meta.view(Ordering::Acquire);
            if view.location() != obj_loc || view.ref_count() == 0 {
                // dead, or already living somewhere else
                skipped += 1;
                break;
            }
            if !meta.try_start_move(obj_loc, &store.parker) {
                skipped += 1;
                break;
            }
            let (new_loc, ptr) = match store.segs.alloc(dest, hdr.size, hdr.id, view.node_type())
            {
                Ok(x) => x,
                Err(e) => {
                    // surrender the claim by "moving" the node onto itself
                    let _ = meta.try_move(obj_loc, obj_loc);
                    return Err(e);
                }
            };
            unsafe {
                // UNSAFE(@ohsayan): the copy flag grants the exclusive
                // relocation right; source bytes are stable until the
                // location swings
                core::ptr::copy_nonoverlapping(
                    store.segs.object_ptr(obj_loc).add(OBJ_HEADER_SIZE as usize),
                    ptr,
                    hdr.size as usize,
                );
            }
            match meta.try_move(obj_loc, new_loc) {
                MoveResult::Success => {
                    moved += 1;
                    break;
                }
                // the writer modified the node mid-copy: our bytes are dead
                // on arrival and the node is still here, so go again
                MoveResult::Dirty => store.segs.note_freed(new_loc, hdr.span()),
                // released or relocated while we copied
                MoveResult::Moved | MoveResult::Freed => {
                    store.segs.note_freed(new_loc, hdr.span());
                    break;
                }
            }
        }
    }
    // everything that moved must be durable (bytes and meta words both)
    // before the evacuated segment may ever be reused
    if let Some(d) = *dest {
        store.segs.sync_segment(d, true)?;
    }
    store.ids.sync(true)?;
    let sh = store.segs.seg_header(victim);
    sh.set_num_objects(0);
    let sm = store.segs.seg_meta(victim);
    sm.clear();
    sm.set_last_sync(store.segs.segment_size() as u32);
    store.segs.advise_segment(victim, MapAdvice::Random);
    store.segs.push_free(victim);
    info!("compactor: segment {victim} recycled ({moved} objects moved, {skipped} dead)");
    Ok(())
}
