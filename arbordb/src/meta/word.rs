/*
 * Created on Sun Feb 25 2024
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

//! The meta word is 8 bytes of state per node and carries most of the
//! engine's lock-free properties. Packed layout (LSB first):
//!
//! ```text
//! ref:12 | type:4 | copy:1 | const:1 | location:46
//! ```
//!
//! The `(const, copy)` pair is a tiny state machine:
//!
//! | const | copy | meaning                                   |
//! |-------|------|-------------------------------------------|
//! |   1   |  0   | stable, readable                          |
//! |   0   |  0   | writer is modifying in place              |
//! |   1   |  1   | compactor is relocating                   |
//! |   0   |  1   | writer preempted a relocation; it wins    |

use {
    super::{NodeLocation, NodeType},
    parking_lot::{Condvar, Mutex},
    std::{
        sync::atomic::{fence, AtomicU64, Ordering},
        time::Duration,
    },
};

const REF_MASK: u64 = 0xfff;
const TYPE_SHIFT: u32 = 12;
const TYPE_MASK: u64 = 0xf << TYPE_SHIFT;
const COPY_FLAG: u64 = 1 << 16;
const CONST_FLAG: u64 = 1 << 17;
const LOC_SHIFT: u32 = 18;

/// `retain` uses a plain fetch-add, so concurrent retains could overshoot the
/// 12-bit field before any of them undoes the damage. Stopping 64 below the
/// hard maximum means 64 threads would all have to be mid-retain at once for
/// an overflow, which is not a real machine.
pub const MAX_REF: u64 = REF_MASK - 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A decoded, non-atomic snapshot of a meta word
pub struct MetaView(u64);

impl MetaView {
    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
    #[inline(always)]
    pub const fn ref_count(self) -> u64 {
        self.0 & REF_MASK
    }
    #[inline(always)]
    pub const fn node_type(self) -> NodeType {
        NodeType::from_bits(((self.0 & TYPE_MASK) >> TYPE_SHIFT) as u8)
    }
    #[inline(always)]
    pub const fn is_const(self) -> bool {
        self.0 & CONST_FLAG != 0
    }
    #[inline(always)]
    pub const fn is_copying(self) -> bool {
        self.0 & COPY_FLAG != 0
    }
    #[inline(always)]
    pub const fn location(self) -> NodeLocation {
        NodeLocation::from_raw(self.0 >> LOC_SHIFT)
    }
    #[inline(always)]
    pub const fn with_location(self, loc: NodeLocation) -> Self {
        Self((self.0 & !(!0u64 << LOC_SHIFT)) | (loc.raw() << LOC_SHIFT))
    }
    #[inline(always)]
    pub const fn without_copy_flag(self) -> Self {
        Self(self.0 & !COPY_FLAG)
    }
    #[inline(always)]
    pub const fn pack(refs: u64, ty: NodeType, loc: NodeLocation, constant: bool) -> Self {
        Self(
            (refs & REF_MASK)
                | ((ty as u64) << TYPE_SHIFT)
                | (loc.raw() << LOC_SHIFT)
                | if constant { CONST_FLAG } else { 0 },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of the compactor's second relocation phase
pub enum MoveResult {
    /// the new location is published
    Success,
    /// someone already relocated the node
    Moved,
    /// the node was released while we were copying
    Freed,
    /// the writer started a modification; the copied bytes are stale
    Dirty,
}

/// The single-process stand-in for a futex on the meta word: `end_modify`
/// rings it when a compactor was seen waiting, `try_start_move` parks on it.
/// The word itself stays the source of truth; the timeout only covers the
/// notifier racing past us before we park.
#[derive(Debug, Default)]
pub struct MoveParker {
    lock: Mutex<()>,
    cv: Condvar,
}

impl MoveParker {
    const PARK_TIMEOUT: Duration = Duration::from_micros(500);
    pub fn notify_all(&self) {
        let _g = self.lock.lock();
        self.cv.notify_all();
    }
    fn wait_while(&self, word: &MetaWord, observed: u64) {
        let mut g = self.lock.lock();
        if word.raw(Ordering::Acquire) == observed {
            self.cv.wait_for(&mut g, Self::PARK_TIMEOUT);
        }
    }
}

#[repr(transparent)]
#[derive(Debug)]
/// One atomic meta word, living inside the ids.dat mapping
pub struct MetaWord(AtomicU64);

impl MetaWord {
    #[inline(always)]
    pub fn raw(&self, ord: Ordering) -> u64 {
        self.0.load(ord)
    }
    #[inline(always)]
    pub fn view(&self, ord: Ordering) -> MetaView {
        MetaView(self.0.load(ord))
    }
    #[inline(always)]
    pub fn store_raw(&self, raw: u64, ord: Ordering) {
        self.0.store(raw, ord)
    }
    #[inline(always)]
    pub fn cas_raw(&self, current: u64, new: u64, ok: Ordering, fail: Ordering) -> Result<u64, u64> {
        self.0.compare_exchange_weak(current, new, ok, fail)
    }
    /// Publish a freshly written node: the id is not yet visible to any other
    /// role, so a plain release store is enough
    pub fn publish(&self, ty: NodeType, loc: NodeLocation) {
        let refs = self.view(Ordering::Relaxed).ref_count();
        self.store_raw(
            MetaView::pack(refs, ty, loc, true).raw(),
            Ordering::Release,
        );
    }
    /// Add a reference. Only safe for callers that already own (or can reach
    /// through an owned path) one reference. Fails at the safety ceiling.
    #[must_use = "a failed retain must be answered by cloning the subtree"]
    pub fn retain(&self) -> bool {
        let prior = MetaView(self.0.fetch_add(1, Ordering::Relaxed));
        if prior.ref_count() >= MAX_REF {
            self.0.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }
    /// Drop a reference, returning the prior view. When the prior count was 1
    /// the caller owns the destructor; the fence pairs with the release
    /// decrement of every other past owner.
    pub fn release(&self) -> MetaView {
        let prior = MetaView(self.0.fetch_sub(1, Ordering::Release));
        debug_assert_ne!(prior.ref_count(), 0, "double release");
        if prior.ref_count() == 1 {
            fence(Ordering::Acquire);
        }
        prior
    }
    /// Clear both coordination flags, taking the exclusive modification
    /// right. Returns the prior view (whose location is the one to modify).
    pub fn start_modify(&self) -> MetaView {
        MetaView(self.0.fetch_and(!(COPY_FLAG | CONST_FLAG), Ordering::Acquire))
    }
    /// Publish the modification. If a compactor tried to start a relocation
    /// in the meantime its copy bit is still set and it is parked: wake it.
    pub fn end_modify(&self, parker: &MoveParker) -> MetaView {
        let prior = MetaView(self.0.fetch_or(CONST_FLAG, Ordering::Release));
        if prior.is_copying() {
            parker.notify_all();
        }
        prior
    }
    /// Recovery: zero the refcount bits, keeping type and location
    pub(crate) fn strip_refs(&self) {
        let w = self.0.load(Ordering::Relaxed);
        self.0.store(w & !REF_MASK, Ordering::Relaxed);
    }
    /// Recovery: single-threaded refcount bump; returns the prior count
    pub(crate) fn add_ref_relaxed(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) & REF_MASK
    }
    /// Phase one of a relocation: set the copy flag. Fails if the node was
    /// freed or already moved away from `expected`. If the writer is mid
    /// modification, park until it finishes and retry.
    pub fn try_start_move(&self, expected: NodeLocation, parker: &MoveParker) -> bool {
        loop {
            let prior = MetaView(self.0.fetch_or(COPY_FLAG, Ordering::Acquire));
            if prior.ref_count() == 0 || prior.location() != expected {
                self.0.fetch_and(!COPY_FLAG, Ordering::Relaxed);
                return false;
            }
            if prior.is_const() {
                return true;
            }
            // writer owns the node right now; wait for its end_modify
            parker.wait_while(self, prior.raw() | COPY_FLAG);
        }
    }
    /// Phase two: swing the location to the copy, clearing the copy flag. Any
    /// interleaved writer activity makes the copied bytes worthless.
    pub fn try_move(&self, expected: NodeLocation, new_loc: NodeLocation) -> MoveResult {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let ex = MetaView(current);
            if !ex.is_copying() {
                return MoveResult::Dirty;
            }
            if ex.location() != expected {
                return MoveResult::Moved;
            }
            if ex.ref_count() == 0 {
                return MoveResult::Freed;
            }
            let next = ex.with_location(new_loc).without_copy_flag();
            match self.cas_raw(current, next.raw(), Ordering::Release, Ordering::Acquire) {
                Ok(_) => return MoveResult::Success,
                Err(now) => current = now,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(refs: u64, ty: NodeType, loc: u64) -> MetaWord {
        MetaWord(AtomicU64::new(
            MetaView::pack(refs, ty, NodeLocation::from_raw(loc), true).raw(),
        ))
    }

    #[test]
    fn pack_roundtrip() {
        let v = MetaView::pack(7, NodeType::Binary, NodeLocation::from_offset(0x40), true);
        assert_eq!(v.ref_count(), 7);
        assert_eq!(v.node_type(), NodeType::Binary);
        assert_eq!(v.location().offset(), 0x40);
        assert!(v.is_const());
        assert!(!v.is_copying());
    }

    #[test]
    fn retain_release() {
        let w = word(1, NodeType::Value, 4);
        assert!(w.retain());
        assert_eq!(w.view(Ordering::Relaxed).ref_count(), 2);
        assert_eq!(w.release().ref_count(), 2);
        let prior = w.release();
        assert_eq!(prior.ref_count(), 1); // we were the last owner
    }

    #[test]
    fn retain_ceiling() {
        let w = word(MAX_REF, NodeType::Value, 4);
        assert!(!w.retain());
        assert_eq!(w.view(Ordering::Relaxed).ref_count(), MAX_REF);
    }

    #[test]
    fn modify_blocks_move() {
        let parker = MoveParker::default();
        let w = word(1, NodeType::Binary, 4);
        let loc = NodeLocation::from_raw(4);
        let prior = w.start_modify();
        assert!(prior.is_const());
        // a concurrent try_move must bail out as dirty
        assert_eq!(
            w.try_move(loc, NodeLocation::from_raw(8)),
            MoveResult::Dirty
        );
        w.end_modify(&parker);
        assert!(w.view(Ordering::Relaxed).is_const());
    }

    #[test]
    fn move_protocol() {
        let parker = MoveParker::default();
        let w = word(1, NodeType::Binary, 4);
        let old = NodeLocation::from_raw(4);
        let new = NodeLocation::from_raw(8);
        assert!(w.try_start_move(old, &parker));
        assert_eq!(w.try_move(old, new), MoveResult::Success);
        let v = w.view(Ordering::Relaxed);
        assert_eq!(v.location(), new);
        assert!(!v.is_copying());
        // a second mover must fail: the location changed
        assert!(!w.try_start_move(old, &parker));
    }

    #[test]
    fn move_loses_to_release() {
        let parker = MoveParker::default();
        let w = word(1, NodeType::Binary, 4);
        let old = NodeLocation::from_raw(4);
        assert!(w.try_start_move(old, &parker));
        let prior = w.release();
        assert_eq!(prior.ref_count(), 1);
        assert_eq!(
            w.try_move(old, NodeLocation::from_raw(8)),
            MoveResult::Freed
        );
    }

    #[test]
    fn writer_preempts_mover() {
        let parker = MoveParker::default();
        let w = word(2, NodeType::Binary, 4);
        let old = NodeLocation::from_raw(4);
        assert!(w.try_start_move(old, &parker));
        // writer starts a modification between the two phases
        let prior = w.start_modify();
        assert!(prior.is_copying());
        assert_eq!(w.try_move(old, NodeLocation::from_raw(8)), MoveResult::Dirty);
        let prior = w.end_modify(&parker);
        assert!(!prior.is_copying()); // start_modify cleared it
    }
}
