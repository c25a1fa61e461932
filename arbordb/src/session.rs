/*
 * Created on Sat Apr 13 2024
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

//! Sessions and root handles. A [`RootHandle`] owns one reference to its
//! root node; dropping it releases the whole snapshot. Read sessions claim a
//! reader slot for their lifetime, pinning the free-segment ring so nothing
//! they can reach is recycled under them. The single write session claims a
//! slot too but pins it only per operation, and its mutation verbs *consume*
//! the handle they are given: a caller that wants to keep the old snapshot
//! clones the handle first (a refcount bump), and it is exactly that extra
//! reference that forces the engine down the copy path instead of editing a
//! shared node in place.

use {
    crate::{
        config::SyncMode,
        db::Store,
        error::{ArborError, ArborResult},
        meta::NodeId,
        seg::OBJ_HEADER_SIZE,
        tree::{
            self, get_node,
            iter::RangeIter,
            AllocCtx, PutMode, PutVal, RawVal,
        },
    },
    std::sync::{
        atomic::Ordering,
        Arc,
    },
};

/*
    values
*/

#[derive(Debug, Clone, Copy)]
/// A value to store: raw bytes, or whole subtrees embedded by their roots
pub enum ValueRef<'a> {
    Bytes(&'a [u8]),
    Roots(&'a [RootHandle]),
}

impl<'a> From<&'a [u8]> for ValueRef<'a> {
    fn from(v: &'a [u8]) -> Self {
        Self::Bytes(v)
    }
}

#[derive(Debug)]
/// An owned value read back from the store
pub enum Value {
    Bytes(Vec<u8>),
    Roots(Vec<RootHandle>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Roots(_) => None,
        }
    }
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Roots(_) => None,
        }
    }
    pub fn as_roots(&self) -> Option<&[RootHandle]> {
        match self {
            Self::Roots(r) => Some(r),
            Self::Bytes(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Roots(a), Self::Roots(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.id() == y.id())
            }
            _ => false,
        }
    }
}

impl<T: AsRef<[u8]>> PartialEq<T> for Value {
    fn eq(&self, other: &T) -> bool {
        self.as_bytes() == Some(other.as_ref())
    }
}

pub(crate) fn to_public_value(store: &Arc<Store>, raw: RawVal) -> ArborResult<Value> {
    match raw {
        RawVal::Bytes(b) => Ok(Value::Bytes(b)),
        RawVal::Roots(ids) => {
            let mut handles = Vec::with_capacity(ids.len());
            for id in ids {
                // the ids are reachable from the caller's snapshot, so the
                // refcount is stable and a plain retain is sound
                if !id.is_null() && !store.ids.meta(id).retain() {
                    return Err(ArborError::RefOverflow);
                }
                handles.push(RootHandle::new(store.clone(), id, store.epoch()));
            }
            Ok(Value::Roots(handles))
        }
    }
}

/*
    root handles
*/

/// An owned reference to a trie root: `(identifier, snapshot epoch)`. As
/// long as the handle lives, everything reachable from it stays retained.
pub struct RootHandle {
    store: Arc<Store>,
    id: NodeId,
    epoch: u64,
}

impl core::fmt::Debug for RootHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RootHandle")
            .field("id", &self.id.raw())
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl RootHandle {
    pub(crate) fn new(store: Arc<Store>, id: NodeId, epoch: u64) -> Self {
        Self { store, id, epoch }
    }
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
    /// An empty trie has no root node
    pub fn is_empty(&self) -> bool {
        self.id.is_null()
    }
    pub(crate) fn belongs_to(&self, store: &Arc<Store>) -> bool {
        Arc::ptr_eq(&self.store, store)
    }
    /// Clone the handle by bumping the root's refcount. Fails only at the
    /// refcount safety ceiling.
    pub fn try_clone(&self) -> ArborResult<Self> {
        if !self.id.is_null() && !self.store.ids.meta(self.id).retain() {
            return Err(ArborError::RefOverflow);
        }
        Ok(Self {
            store: self.store.clone(),
            id: self.id,
            epoch: self.epoch,
        })
    }
    /// Steal the owned reference out of the handle without releasing it
    pub(crate) fn into_id(self) -> NodeId {
        let id = self.id;
        core::mem::forget(self);
        id
    }
}

impl Drop for RootHandle {
    fn drop(&mut self) {
        if !self.id.is_null() {
            tree::release_tree(&self.store, self.id);
        }
    }
}

/*
    read sessions
*/

/// A snapshot reader. Claims one of the fixed reader slots on creation and
/// holds it (and therefore its ring pin) until dropped.
pub struct ReadSession {
    store: Arc<Store>,
    slot: usize,
}

impl ReadSession {
    pub(crate) fn new(store: Arc<Store>) -> ArborResult<Self> {
        let slot = store.segs.claim_session()?;
        Ok(Self { store, slot })
    }
    fn check(&self, root: &RootHandle) -> ArborResult<()> {
        if !root.belongs_to(&self.store) {
            return Err(ArborError::InvalidHandle);
        }
        Ok(())
    }
    /// Point lookup against the handle's snapshot. Never allocates in the
    /// store.
    pub fn get(&self, root: &RootHandle, key: &[u8]) -> ArborResult<Option<Value>> {
        self.check(root)?;
        match tree::get(&self.store, root.id(), key)? {
            Some(raw) => Ok(Some(to_public_value(&self.store, raw)?)),
            None => Ok(None),
        }
    }
    pub fn contains(&self, root: &RootHandle, key: &[u8]) -> ArborResult<bool> {
        Ok(self.get(root, key)?.is_some())
    }
    /// An ordered cursor over `[lower, upper)`
    pub fn iter<'a>(
        &'a self,
        root: &'a RootHandle,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> ArborResult<RangeIter<'a>> {
        self.check(root)?;
        RangeIter::new(self, self.store.clone(), root, lower, upper.map(|u| u.to_vec()))
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        self.store.segs.release_session(self.slot);
    }
}

/*
    the write session
*/

/// The singleton writer. Owns the segment currently being filled and the
/// right to mutate; readers never wait on it.
#[derive(Debug)]
pub struct WriteSession {
    store: Arc<Store>,
    slot: usize,
    seg: Option<u32>,
}

impl WriteSession {
    pub(crate) fn new(store: Arc<Store>) -> ArborResult<Self> {
        if store
            .writer_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ArborError::SessionLimit);
        }
        let slot = match store.segs.claim_session_unpinned() {
            Ok(s) => s,
            Err(e) => {
                store.writer_taken.store(false, Ordering::Release);
                return Err(e);
            }
        };
        Ok(Self { store, slot, seg: None })
    }
    fn check(&self, root: &RootHandle) -> ArborResult<()> {
        if !root.belongs_to(&self.store) {
            return Err(ArborError::InvalidHandle);
        }
        Ok(())
    }
    /// A handle to the empty trie, useful for building from scratch
    pub fn empty_root(&self) -> RootHandle {
        RootHandle::new(self.store.clone(), NodeId::NULL, self.store.epoch())
    }
    fn mutate(
        &mut self,
        root: RootHandle,
        f: impl FnOnce(&mut AllocCtx<'_>, NodeId) -> ArborResult<NodeId>,
    ) -> ArborResult<RootHandle> {
        self.check(&root)?;
        self.store.segs.pin_session(self.slot);
        let out = {
            let store = self.store.clone();
            let mut ctx = AllocCtx {
                store: &store,
                seg: &mut self.seg,
            };
            let id = root.into_id();
            match f(&mut ctx, id) {
                Ok(new) => Ok(new),
                Err(e) => {
                    // a failed mutation leaves the tree untouched, so the
                    // reference the consumed handle carried is still ours to
                    // let go of
                    tree::release_tree(&store, id);
                    Err(e)
                }
            }
        };
        self.store.segs.unpin_session(self.slot);
        let epoch = self.store.epoch();
        out.map(|id| RootHandle::new(self.store.clone(), id, epoch))
    }
    fn to_putval<'a>(val: &'a ValueRef<'a>, scratch: &'a mut Vec<NodeId>) -> PutVal<'a> {
        match val {
            ValueRef::Bytes(b) => PutVal::Bytes(b),
            ValueRef::Roots(handles) => {
                scratch.extend(handles.iter().map(|h| h.id()));
                PutVal::Roots(scratch)
            }
        }
    }
    /// Insert or overwrite `key`, consuming the handle and returning the new
    /// root. The old snapshot survives exactly when someone else still holds
    /// a reference to it.
    pub fn upsert(
        &mut self,
        root: RootHandle,
        key: &[u8],
        val: ValueRef<'_>,
    ) -> ArborResult<RootHandle> {
        self.put(root, key, val, PutMode::Upsert)
    }
    /// Like [`WriteSession::upsert`] but fails with
    /// [`ArborError::AlreadyExists`] when the key is present
    pub fn insert(
        &mut self,
        root: RootHandle,
        key: &[u8],
        val: ValueRef<'_>,
    ) -> ArborResult<RootHandle> {
        self.put(root, key, val, PutMode::Insert)
    }
    /// Like [`WriteSession::upsert`] but fails with
    /// [`ArborError::NotFound`] when the key is absent
    pub fn update(
        &mut self,
        root: RootHandle,
        key: &[u8],
        val: ValueRef<'_>,
    ) -> ArborResult<RootHandle> {
        self.put(root, key, val, PutMode::Update)
    }
    fn put(
        &mut self,
        root: RootHandle,
        key: &[u8],
        val: ValueRef<'_>,
        mode: PutMode,
    ) -> ArborResult<RootHandle> {
        for h in match &val {
            ValueRef::Roots(handles) => *handles,
            ValueRef::Bytes(_) => &[],
        } {
            self.check(h)?;
        }
        let mut scratch = vec![];
        self.mutate(root, |ctx, id| {
            let pv = Self::to_putval(&val, &mut scratch);
            tree::put(ctx, id, true, key, &pv, mode)
        })
    }
    /// Remove `key`; absence is a no-op, not an error
    pub fn remove(&mut self, root: RootHandle, key: &[u8]) -> ArborResult<RootHandle> {
        self.mutate(root, |ctx, id| tree::remove(ctx, id, key).map(|(id, _)| id))
    }
    /// Point lookup through the writer. With `cache_on_read` enabled, small
    /// nodes found in cold segments are relocated into the current write
    /// segment on the way.
    pub fn get(&mut self, root: &RootHandle, key: &[u8]) -> ArborResult<Option<Value>> {
        self.check(root)?;
        self.store.segs.pin_session(self.slot);
        let out = (|| {
            let mut path = vec![];
            let path_opt = if self.store.cfg.cache_on_read {
                Some(&mut path)
            } else {
                None
            };
            let raw = tree::get_path(&self.store, root.id(), key, path_opt)?;
            for id in path {
                self.cache_node(id);
            }
            match raw {
                Some(raw) => Ok(Some(to_public_value(&self.store, raw)?)),
                None => Ok(None),
            }
        })();
        self.store.segs.unpin_session(self.slot);
        out
    }
    /// Relocate a small node out of a cold (sealed) segment into the current
    /// write segment, using the same two-phase move the compactor runs.
    /// Failures just leave the node where it is.
    fn cache_node(&mut self, id: NodeId) {
        const CACHE_MAX_SPAN: u32 = 512;
        let store = self.store.clone();
        let node = match get_node(&store, id) {
            Ok(n) => n,
            Err(_) => return,
        };
        if node.span > CACHE_MAX_SPAN {
            return;
        }
        let loc = node.view.location();
        let seg = loc.segment(store.segs.seg_bits());
        if Some(seg) == self.seg || !store.segs.seg_header(seg).is_sealed() {
            return;
        }
        let meta = store.ids.meta(id);
        if !meta.try_start_move(loc, &store.parker) {
            return;
        }
        let size = node.span - OBJ_HEADER_SIZE;
        let (new_loc, ptr) = match store.segs.alloc(&mut self.seg, size, id, node.view.node_type())
        {
            Ok(x) => x,
            Err(_) => {
                // back out of the move claim by "moving" in place
                let _ = meta.try_move(loc, loc);
                return;
            }
        };
        unsafe {
            // UNSAFE(@ohsayan): the copy flag gives us the exclusive
            // relocation right; the source bytes are stable
            core::ptr::copy_nonoverlapping(
                store.segs.object_ptr(loc).add(OBJ_HEADER_SIZE as usize),
                ptr,
                size as usize,
            );
        }
        match meta.try_move(loc, new_loc) {
            crate::meta::MoveResult::Success => {
                store.segs.note_freed(loc, node.span);
            }
            _ => {
                store.segs.note_freed(new_loc, node.span);
            }
        }
    }
    /// Publish a root durably: flush everything it reaches (per the store's
    /// sync mode), journal the commit, and make it the store's current root
    pub fn commit_root(&mut self, root: &RootHandle) -> ArborResult<()> {
        self.check(root)?;
        // the store takes its own reference
        if !root.id().is_null() && !self.store.ids.meta(root.id()).retain() {
            return Err(ArborError::RefOverflow);
        }
        // data first, then the journal entry that names it
        let blocking = match self.store.cfg.sync_mode {
            SyncMode::Blocking => true,
            SyncMode::Async => false,
            SyncMode::None => false,
        };
        if self.store.cfg.sync_mode != SyncMode::None {
            if let Some(seg) = self.seg {
                self.store.segs.sync_segment(seg, blocking)?;
            }
            self.store.segs.sync_all(blocking)?;
            self.store.ids.sync(blocking)?;
        }
        let epoch = {
            let mut journal = self.store.journal.lock();
            journal.append_commit(root.id(), blocking)?
        };
        self.store.set_epoch(epoch);
        let old = {
            let mut cur = self.store.current_root.lock();
            core::mem::replace(&mut *cur, root.id())
        };
        if !old.is_null() {
            tree::release_tree(&self.store, old);
        }
        Ok(())
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if let Some(seg) = self.seg.take() {
            // a sealed segment is parseable and sync-tracked; never leave a
            // half-open one behind
            let _ = self.store.segs.seal(seg);
        }
        self.store.segs.release_session(self.slot);
        self.store.writer_taken.store(false, Ordering::Release);
    }
}
