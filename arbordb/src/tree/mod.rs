/*
 * Created on Sat Mar 30 2024
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

//! The copy-on-write trie engine. Mutations take ownership of one reference
//! to the node they are handed and give back an owned reference to the
//! replacement (which is the same id when nothing changed, or when a binary
//! node on a writer-unique path absorbed the edit in place). Cloned nodes
//! retain the children they carry over; releasing the displaced original
//! then settles every count. An error anywhere leaves the original tree
//! untouched — partially built replacements are torn back down before the
//! error surfaces.

pub mod iter;

use {
    crate::{
        config::Config,
        db::Store,
        error::{ArborError, ArborResult},
        meta::{MetaView, NodeId, NodeLocation, NodeType},
        node::{
            binary::{self, BinVal, BinaryNode, BinaryNodeMut, BINARY_NODE_MAX},
            full::{self, FullNode},
            setlist::{self, SetListNode},
            value::{self, ValueNode},
        },
        seg::{ObjectHeader, OBJ_HEADER_SIZE},
        util::{compiler, lcp, round_up_16},
    },
    std::sync::atomic::Ordering,
};

/*
    node access
*/

pub(crate) struct NodeRef<'a> {
    pub id: NodeId,
    pub view: MetaView,
    pub payload: &'a [u8],
    pub span: u32,
}

/// Resolve an id to its current bytes. The location can move under us (the
/// compactor), in which case the header's id no longer matches and we retry
/// against the refreshed meta word; a bounded number of retries failing is a
/// real integrity problem, not a race.
pub(crate) fn get_node(store: &Store, id: NodeId) -> ArborResult<NodeRef<'_>> {
    let meta = store.ids.meta_checked(id).ok_or(ArborError::Corruption)?;
    let mut spins = 0usize;
    loop {
        let view = meta.view(Ordering::Acquire);
        if compiler::unlikely(view.ref_count() == 0 || view.location() == NodeLocation::NULL) {
            return Err(ArborError::Corruption);
        }
        let at = store.segs.object_ptr(view.location());
        let hdr = unsafe {
            // UNSAFE(@ohsayan): location was published by the allocator, and
            // the bytes cannot be recycled while this session pins the ring
            ObjectHeader::read(at)
        };
        if hdr.id == id {
            let payload = unsafe {
                // UNSAFE(@ohsayan): same argument as the header read
                core::slice::from_raw_parts(at.add(OBJ_HEADER_SIZE as usize), hdr.size as usize)
            };
            return Ok(NodeRef {
                id,
                view,
                payload,
                span: hdr.span(),
            });
        }
        // stale read: the slot was relocated and reused; the meta reload
        // settles it
        spins += 1;
        if spins > 1_000 {
            return Err(ArborError::Corruption);
        }
        core::hint::spin_loop();
    }
}

/*
    allocation context
*/

pub(crate) struct AllocCtx<'a> {
    pub store: &'a Store,
    pub seg: &'a mut Option<u32>,
}

pub(crate) struct NewNode {
    pub id: NodeId,
    pub loc: NodeLocation,
    ptr: *mut u8,
    len: usize,
}

impl NewNode {
    pub fn buf(&mut self) -> &mut [u8] {
        unsafe {
            // UNSAFE(@ohsayan): until publish() the bytes belong solely to
            // the allocating thread
            core::slice::from_raw_parts_mut(self.ptr, self.len)
        }
    }
    /// Make the node visible: store type + location into the meta word
    pub fn publish(self, store: &Store, ty: NodeType) -> NodeId {
        store.ids.meta(self.id).publish(ty, self.loc);
        self.id
    }
    /// Give the bytes and the id back (error unwinding)
    pub fn abandon(self, store: &Store) {
        store
            .segs
            .note_freed(self.loc, OBJ_HEADER_SIZE + round_up_16(self.len) as u32);
        store.ids.free_id(self.id);
    }
}

impl<'a> AllocCtx<'a> {
    pub fn cfg(&self) -> &Config {
        &self.store.cfg
    }
    pub fn alloc(&mut self, payload: usize, ty: NodeType) -> ArborResult<NewNode> {
        let (id, _) = self.store.ids.new_id()?;
        match self.store.segs.alloc(self.seg, payload as u32, id, ty) {
            Ok((loc, ptr)) => Ok(NewNode {
                id,
                loc,
                ptr,
                len: payload,
            }),
            Err(e) => {
                self.store.ids.free_id(id);
                Err(e)
            }
        }
    }
}

/*
    reference management
*/

/// Drop one reference; a count that hits zero destroys the node, recursively
/// releasing everything it points at and crediting the freed bytes to the
/// owning segment
pub(crate) fn release_tree(store: &Store, id: NodeId) {
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
        if id.is_null() {
            continue;
        }
        let meta = store.ids.meta(id);
        let prior = meta.release();
        if compiler::likely(prior.ref_count() != 1) {
            continue;
        }
        // we were the last owner: run the destructor. the location is stable
        // now (try_move refuses refless nodes).
        let loc = prior.location();
        let at = store.segs.object_ptr(loc);
        let hdr = unsafe {
            // UNSAFE(@ohsayan): exclusive access by refcount
            ObjectHeader::read(at)
        };
        debug_assert_eq!(hdr.id, id);
        let payload = unsafe {
            core::slice::from_raw_parts(at.add(OBJ_HEADER_SIZE as usize), hdr.size as usize)
        };
        match prior.node_type() {
            NodeType::Value => {}
            NodeType::Roots => {
                stack.extend(ValueNode::read(payload).roots());
            }
            NodeType::Binary => {
                let b = BinaryNode::read(payload);
                for i in 0..b.num_branches() {
                    if let BinVal::Child(cid) = b.value(i) {
                        stack.push(cid);
                    }
                }
            }
            NodeType::SetList => {
                let s = SetListNode::read(payload);
                stack.push(s.eos());
                stack.extend(s.branches().map(|(_, c)| c));
            }
            NodeType::Full => {
                let f = FullNode::read(payload);
                stack.push(f.eos());
                stack.extend(f.branches().map(|(_, c)| c));
            }
            NodeType::FreeList | NodeType::Undefined => {
                debug_assert!(false, "released a node that was never published");
            }
        }
        store.segs.note_freed(loc, hdr.span());
        store.ids.free_id(id);
    }
}

/// Take ownership of one more reference to `id`. If the count is at the
/// ceiling the subtree root is cloned instead, which is invisible to the
/// caller (ids differ, content does not).
pub(crate) fn bump_or_copy(ctx: &mut AllocCtx<'_>, id: NodeId) -> ArborResult<NodeId> {
    if id.is_null() {
        return Ok(id);
    }
    if ctx.store.ids.meta(id).retain() {
        return Ok(id);
    }
    copy_node(ctx, id)
}

/// Shallow-copy a node under a fresh id, retaining its children
fn copy_node(ctx: &mut AllocCtx<'_>, id: NodeId) -> ArborResult<NodeId> {
    let node = get_node(ctx.store, id)?;
    match node.view.node_type() {
        NodeType::Value => {
            let v = ValueNode::read(node.payload);
            make_value_node(ctx, v.key(), &PutVal::Bytes(v.data()))
        }
        NodeType::Roots => {
            let v = ValueNode::read(node.payload);
            let roots: Vec<NodeId> = v.roots().collect();
            make_value_node(ctx, v.key(), &PutVal::Roots(&roots))
        }
        NodeType::Binary => {
            let b = BinaryNode::read(node.payload);
            let size = binary::encoded_size(b.branch_cap(), b.arena_live_size(usize::MAX));
            let mut n = ctx.alloc(size, NodeType::Binary)?;
            binary::clone_compact(n.buf(), b, b.branch_cap());
            if let Err(e) = retain_binary_children(ctx.store, BinaryNode::read(n.buf()), usize::MAX)
            {
                n.abandon(ctx.store);
                return Err(e);
            }
            Ok(n.publish(ctx.store, NodeType::Binary))
        }
        NodeType::SetList | NodeType::Full => {
            let inner = InnerView::read(&node)?;
            clone_inner(ctx, &inner, inner.prefix(), None, BranchEdit::None)
        }
        NodeType::FreeList | NodeType::Undefined => Err(ArborError::Corruption),
    }
}

/// Retain every child id a freshly cloned binary node carries, skipping the
/// slot whose ownership was transferred in. Rolls itself back on failure.
fn retain_binary_children(store: &Store, node: BinaryNode<'_>, skip: usize) -> ArborResult<()> {
    for i in 0..node.num_branches() {
        if i == skip {
            continue;
        }
        if let BinVal::Child(cid) = node.value(i) {
            if !store.ids.meta(cid).retain() {
                for j in 0..i {
                    if j == skip {
                        continue;
                    }
                    if let BinVal::Child(prev) = node.value(j) {
                        release_tree(store, prev);
                    }
                }
                return Err(ArborError::RefOverflow);
            }
        }
    }
    Ok(())
}

/*
    values
*/

#[derive(Debug, Clone, Copy)]
/// What a mutation wants stored under the key
pub(crate) enum PutVal<'a> {
    Bytes(&'a [u8]),
    /// ids of subtrees to embed; the tree retains them on success, the
    /// caller's own references are untouched
    Roots(&'a [NodeId]),
}

impl PutVal<'_> {
    fn inline(&self, cfg: &Config) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) if v.len() <= cfg.max_inline_value => Some(v),
            _ => None,
        }
    }
}

/// Build a value (or roots) node with the given key suffix
fn make_value_node(ctx: &mut AllocCtx<'_>, key: &[u8], val: &PutVal<'_>) -> ArborResult<NodeId> {
    if key.len() > u16::MAX as usize {
        return Err(ArborError::TooLarge);
    }
    match val {
        PutVal::Bytes(v) => {
            let mut n = ctx.alloc(value::encoded_size(key, v.len()), NodeType::Value)?;
            value::write_new(n.buf(), key, v);
            Ok(n.publish(ctx.store, NodeType::Value))
        }
        PutVal::Roots(ids) => {
            for (i, rid) in ids.iter().enumerate() {
                if !rid.is_null() && !ctx.store.ids.meta(*rid).retain() {
                    for prev in &ids[..i] {
                        release_tree(ctx.store, *prev);
                    }
                    return Err(ArborError::RefOverflow);
                }
            }
            let size = value::encoded_size(key, ids.len() * 8);
            let mut n = match ctx.alloc(size, NodeType::Roots) {
                Ok(n) => n,
                Err(e) => {
                    for rid in *ids {
                        release_tree(ctx.store, *rid);
                    }
                    return Err(e);
                }
            };
            value::write_roots(n.buf(), key, ids);
            Ok(n.publish(ctx.store, NodeType::Roots))
        }
    }
}

/// Copy an existing value node under a different key suffix, retaining the
/// embedded roots when there are any
fn clone_value_with_key(
    ctx: &mut AllocCtx<'_>,
    src: &NodeRef<'_>,
    key: &[u8],
) -> ArborResult<NodeId> {
    let v = ValueNode::read(src.payload);
    match src.view.node_type() {
        NodeType::Value => make_value_node(ctx, key, &PutVal::Bytes(v.data())),
        NodeType::Roots => {
            let roots: Vec<NodeId> = v.roots().collect();
            make_value_node(ctx, key, &PutVal::Roots(&roots))
        }
        _ => Err(ArborError::Corruption),
    }
}

/// Encoded form a value takes inside a binary record
enum EncVal<'a> {
    Inline(&'a [u8]),
    /// freshly created, owned by this mutation until it lands in a record
    Child(NodeId),
}

impl EncVal<'_> {
    fn as_binval(&self) -> BinVal<'_> {
        match self {
            Self::Inline(v) => BinVal::Inline(v),
            Self::Child(id) => BinVal::Child(*id),
        }
    }
    fn len(&self) -> usize {
        self.as_binval().encoded_len()
    }
    fn cleanup(self, store: &Store) {
        if let Self::Child(id) = self {
            release_tree(store, id);
        }
    }
}

fn encode_val<'a>(ctx: &mut AllocCtx<'_>, val: &'a PutVal<'a>) -> ArborResult<EncVal<'a>> {
    if let Some(v) = val.inline(ctx.cfg()) {
        return Ok(EncVal::Inline(v));
    }
    Ok(EncVal::Child(make_value_node(ctx, b"", val)?))
}

/*
    inner nodes (set-list / full-256), unified
*/

pub(crate) enum InnerView<'a> {
    Set(SetListNode<'a>),
    Full(FullNode<'a>),
}

impl<'a> InnerView<'a> {
    pub fn read(node: &NodeRef<'a>) -> ArborResult<Self> {
        match node.view.node_type() {
            NodeType::SetList => Ok(Self::Set(SetListNode::read(node.payload))),
            NodeType::Full => Ok(Self::Full(FullNode::read(node.payload))),
            _ => Err(ArborError::Corruption),
        }
    }
    pub fn prefix(&self) -> &'a [u8] {
        match self {
            Self::Set(s) => s.prefix(),
            Self::Full(f) => f.prefix(),
        }
    }
    pub fn eos(&self) -> NodeId {
        match self {
            Self::Set(s) => s.eos(),
            Self::Full(f) => f.eos(),
        }
    }
    pub fn child(&self, b: u8) -> Option<NodeId> {
        match self {
            Self::Set(s) => s.find_branch(b).map(|i| s.child(i)),
            Self::Full(f) => f.child(b),
        }
    }
    pub fn num_branches(&self) -> usize {
        match self {
            Self::Set(s) => s.num_branches(),
            Self::Full(f) => f.num_branches(),
        }
    }
    pub fn is_full_repr(&self) -> bool {
        matches!(self, Self::Full(_))
    }
    pub fn collect_branches(&self) -> Vec<(u8, NodeId)> {
        match self {
            Self::Set(s) => s.branches().collect(),
            Self::Full(f) => f.branches().collect(),
        }
    }
}

enum BranchEdit {
    None,
    /// set (insert or replace) a branch to an id owned by the caller
    Set(u8, NodeId),
    Remove(u8),
}

/// Allocate a fresh inner node image. `entries` children marked carried are
/// retained; `owned_*` slots transfer ownership in. On error nothing is
/// retained and owned slots remain the caller's to clean up.
fn write_inner(
    ctx: &mut AllocCtx<'_>,
    prefix: &[u8],
    eos: NodeId,
    entries: &[(u8, NodeId)],
    force_full: bool,
) -> ArborResult<NodeId> {
    let full_repr = force_full || entries.len() >= ctx.cfg().full_node_threshold;
    let size = if full_repr {
        full::encoded_size(entries.len(), prefix.len())
    } else {
        setlist::encoded_size(entries.len(), prefix.len())
    };
    let ty = if full_repr {
        NodeType::Full
    } else {
        NodeType::SetList
    };
    let mut n = ctx.alloc(size, ty)?;
    if full_repr {
        full::write_new(n.buf(), prefix, eos, entries);
    } else {
        setlist::write_new(n.buf(), prefix, eos, entries);
    }
    Ok(n.publish(ctx.store, ty))
}

/// Clone an inner node applying at most one branch edit and/or an eos swap.
/// Carried-over children (and a carried eos) are retained; the ids inside
/// `eos_edit`/`BranchEdit::Set` transfer in without a retain. On error the
/// caller keeps ownership of its transferred ids.
fn clone_inner(
    ctx: &mut AllocCtx<'_>,
    src: &InnerView<'_>,
    prefix: &[u8],
    eos_edit: Option<NodeId>,
    edit: BranchEdit,
) -> ArborResult<NodeId> {
    let mut entries = src.collect_branches();
    let mut transferred: Option<u8> = None;
    match edit {
        BranchEdit::None => {}
        BranchEdit::Set(b, id) => {
            transferred = Some(b);
            match entries.binary_search_by_key(&b, |e| e.0) {
                Ok(i) => entries[i].1 = id,
                Err(i) => entries.insert(i, (b, id)),
            }
        }
        BranchEdit::Remove(b) => {
            if let Ok(i) = entries.binary_search_by_key(&b, |e| e.0) {
                entries.remove(i);
            }
        }
    }
    let eos = match eos_edit {
        Some(e) => e,
        None => src.eos(),
    };
    // retain everything carried over
    let mut retained: Vec<NodeId> = Vec::with_capacity(entries.len() + 1);
    let retain = |store: &Store, id: NodeId, retained: &mut Vec<NodeId>| -> bool {
        if id.is_null() || store.ids.meta(id).retain() {
            retained.push(id);
            true
        } else {
            false
        }
    };
    let mut ok = true;
    if eos_edit.is_none() && !eos.is_null() {
        ok = retain(ctx.store, eos, &mut retained);
    }
    if ok {
        for (b, id) in &entries {
            if Some(*b) == transferred {
                continue;
            }
            if !retain(ctx.store, *id, &mut retained) {
                ok = false;
                break;
            }
        }
    }
    if !ok {
        for id in retained {
            release_tree(ctx.store, id);
        }
        return Err(ArborError::RefOverflow);
    }
    match write_inner(ctx, prefix, eos, &entries, src.is_full_repr()) {
        Ok(id) => Ok(id),
        Err(e) => {
            for id in retained {
                release_tree(ctx.store, id);
            }
            Err(e)
        }
    }
}

/*
    leaf construction
*/

/// A single-key subtree for a suffix: a binary bucket when the record fits
/// (so future neighbors cluster cheaply), a bare value node otherwise
fn make_leaf(ctx: &mut AllocCtx<'_>, suffix: &[u8], val: &PutVal<'_>) -> ArborResult<NodeId> {
    let cap = ctx.cfg().binary_spare_branches.max(4);
    // if even an id-sized record cannot live in a bucket, skip the bucket
    if binary::encoded_size(cap, binary::record_size(suffix.len(), 8)) > BINARY_NODE_MAX {
        return make_value_node(ctx, suffix, val);
    }
    let mut enc = encode_val(ctx, val)?;
    if binary::encoded_size(cap, binary::record_size(suffix.len(), enc.len())) > BINARY_NODE_MAX {
        // the inline form overflowed the bucket; demote to a child id (only
        // inline values can get here, so nothing to clean up)
        enc = EncVal::Child(make_value_node(ctx, b"", val)?);
    }
    let rec = binary::record_size(suffix.len(), enc.len());
    let size = binary::encoded_size(cap, rec + ctx.cfg().binary_spare_bytes)
        .min(BINARY_NODE_MAX)
        .max(binary::encoded_size(cap, rec));
    let mut n = match ctx.alloc(size, NodeType::Binary) {
        Ok(n) => n,
        Err(e) => {
            enc.cleanup(ctx.store);
            return Err(e);
        }
    };
    BinaryNodeMut::init_empty(n.buf(), cap);
    BinaryNodeMut::read(n.buf()).append(suffix, enc.as_binval());
    Ok(n.publish(ctx.store, NodeType::Binary))
}

/*
    subtree building (binary splits and bulk refactors)
*/

struct BuildEntry<'a> {
    key: &'a [u8],
    val: BinVal<'a>,
}

/// Size of a binary node holding every entry with the configured spare
fn bucket_size(cfg: &Config, entries: &[BuildEntry<'_>]) -> (usize, usize) {
    let cap = entries.len() + cfg.binary_spare_branches;
    let arena: usize = entries
        .iter()
        .map(|e| binary::record_size(e.key.len(), e.val.encoded_len()))
        .sum();
    (cap, binary::encoded_size(cap, arena + cfg.binary_spare_bytes))
}

/// Build a subtree out of sorted, unique `(suffix, value)` entries. Children
/// referenced by the entries are retained as they are stored; on error the
/// partial construction is torn down and nothing is retained.
fn build_subtree(ctx: &mut AllocCtx<'_>, entries: &[BuildEntry<'_>]) -> ArborResult<NodeId> {
    debug_assert!(!entries.is_empty());
    debug_assert!(entries.windows(2).all(|w| w[0].key < w[1].key));
    // terminal: one entry that cannot share a bucket with anyone
    let (cap, size) = bucket_size(ctx.cfg(), entries);
    if size <= BINARY_NODE_MAX {
        let mut n = ctx.alloc(size, NodeType::Binary)?;
        BinaryNodeMut::init_empty(n.buf(), cap);
        {
            let mut out = BinaryNodeMut::read(n.buf());
            for e in entries {
                out.append(e.key, e.val);
            }
        }
        if let Err(e) = retain_binary_children(ctx.store, BinaryNode::read(n.buf()), usize::MAX) {
            n.abandon(ctx.store);
            return Err(e);
        }
        return Ok(n.publish(ctx.store, NodeType::Binary));
    }
    if entries.len() == 1 {
        let e = &entries[0];
        return match e.val {
            BinVal::Inline(v) => make_value_node(ctx, e.key, &PutVal::Bytes(v)),
            BinVal::Child(cid) => {
                let node = get_node(ctx.store, cid)?;
                clone_value_with_key(ctx, &node, e.key)
            }
        };
    }
    // too big for one bucket: factor out the common prefix, group by the
    // next byte, recurse
    let mut common = entries[0].key;
    for e in &entries[1..] {
        let l = lcp(common, e.key);
        common = &common[..l];
        if common.is_empty() {
            break;
        }
    }
    let plen = common.len();
    let mut created: Vec<NodeId> = vec![];
    let mut eos = NodeId::NULL;
    let mut branches: Vec<(u8, NodeId)> = vec![];
    let fail = |ctx: &mut AllocCtx<'_>, created: &[NodeId], e: ArborError| -> ArborError {
        for id in created {
            release_tree(ctx.store, *id);
        }
        e
    };
    let mut i = 0;
    while i < entries.len() {
        let key = &entries[i].key[plen..];
        if key.is_empty() {
            // this key ends exactly at the node: it becomes the eos value
            eos = match entries[i].val {
                BinVal::Inline(v) => match make_value_node(ctx, b"", &PutVal::Bytes(v)) {
                    Ok(id) => id,
                    Err(e) => return Err(fail(ctx, &created, e)),
                },
                BinVal::Child(cid) => {
                    if !ctx.store.ids.meta(cid).retain() {
                        return Err(fail(ctx, &created, ArborError::RefOverflow));
                    }
                    cid
                }
            };
            created.push(eos);
            i += 1;
            continue;
        }
        let b = key[0];
        let start = i;
        while i < entries.len()
            && entries[i].key.len() > plen
            && entries[i].key[plen] == b
        {
            i += 1;
        }
        let sub: Vec<BuildEntry<'_>> = entries[start..i]
            .iter()
            .map(|e| BuildEntry {
                key: &e.key[plen + 1..],
                val: e.val,
            })
            .collect();
        match build_subtree(ctx, &sub) {
            Ok(child) => {
                created.push(child);
                branches.push((b, child));
            }
            Err(e) => return Err(fail(ctx, &created, e)),
        }
    }
    match write_inner(ctx, common, eos, &branches, false) {
        Ok(id) => Ok(id),
        Err(e) => Err(fail(ctx, &created, e)),
    }
}

/*
    lookup
*/

#[derive(Debug, Clone, PartialEq, Eq)]
/// An owned copy of a stored value
pub(crate) enum RawVal {
    Bytes(Vec<u8>),
    Roots(Vec<NodeId>),
}

pub(crate) fn value_of(node: &NodeRef<'_>) -> RawVal {
    let v = ValueNode::read(node.payload);
    match node.view.node_type() {
        NodeType::Roots => RawVal::Roots(v.roots().collect()),
        _ => RawVal::Bytes(v.data().to_vec()),
    }
}

/// Point lookup. Never allocates in the store.
pub(crate) fn get(store: &Store, root: NodeId, key: &[u8]) -> ArborResult<Option<RawVal>> {
    get_path(store, root, key, None)
}

/// Point lookup that can also report the ids it walked (the write session
/// feeds these to its cache-on-read relocation)
pub(crate) fn get_path(
    store: &Store,
    root: NodeId,
    key: &[u8],
    mut path: Option<&mut Vec<NodeId>>,
) -> ArborResult<Option<RawVal>> {
    let mut id = root;
    let mut rest = key;
    loop {
        if id.is_null() {
            return Ok(None);
        }
        if let Some(p) = path.as_deref_mut() {
            p.push(id);
        }
        let node = get_node(store, id)?;
        match node.view.node_type() {
            NodeType::Binary => {
                let b = BinaryNode::read(node.payload);
                return match b.find(rest) {
                    Some(i) => match b.value(i) {
                        BinVal::Inline(v) => Ok(Some(RawVal::Bytes(v.to_vec()))),
                        BinVal::Child(cid) => {
                            let vn = get_node(store, cid)?;
                            Ok(Some(value_of(&vn)))
                        }
                    },
                    None => Ok(None),
                };
            }
            NodeType::Value | NodeType::Roots => {
                let v = ValueNode::read(node.payload);
                return if v.key() == rest {
                    Ok(Some(value_of(&node)))
                } else {
                    Ok(None)
                };
            }
            NodeType::SetList | NodeType::Full => {
                let inner = InnerView::read(&node)?;
                let p = inner.prefix();
                if rest.len() < p.len() || &rest[..p.len()] != p {
                    return Ok(None);
                }
                rest = &rest[p.len()..];
                if rest.is_empty() {
                    let eos = inner.eos();
                    if eos.is_null() {
                        return Ok(None);
                    }
                    let vn = get_node(store, eos)?;
                    return Ok(Some(value_of(&vn)));
                }
                match inner.child(rest[0]) {
                    Some(cid) => {
                        id = cid;
                        rest = &rest[1..];
                    }
                    None => return Ok(None),
                }
            }
            NodeType::FreeList | NodeType::Undefined => return Err(ArborError::Corruption),
        }
    }
}

/*
    mutation
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    Insert,
    Update,
    Upsert,
}

/// Write `key -> val` into the subtree rooted at `id`, consuming one
/// reference to `id` and returning an owned reference to the replacement.
/// `unique` is true when every node from the session's root down to here had
/// a refcount of one, which is what licenses in-place binary edits.
pub(crate) fn put(
    ctx: &mut AllocCtx<'_>,
    id: NodeId,
    unique: bool,
    key: &[u8],
    val: &PutVal<'_>,
    mode: PutMode,
) -> ArborResult<NodeId> {
    if key.len() > u16::MAX as usize {
        return Err(ArborError::TooLarge);
    }
    if id.is_null() {
        if mode == PutMode::Update {
            return Err(ArborError::NotFound);
        }
        return make_leaf(ctx, key, val);
    }
    let node = get_node(ctx.store, id)?;
    let unique = unique && node.view.ref_count() == 1;
    match node.view.node_type() {
        NodeType::Binary => put_binary(ctx, node, unique, key, val, mode),
        NodeType::Value | NodeType::Roots => put_value(ctx, node, key, val, mode),
        NodeType::SetList | NodeType::Full => put_inner(ctx, node, unique, key, val, mode),
        NodeType::FreeList | NodeType::Undefined => Err(ArborError::Corruption),
    }
}

fn put_binary(
    ctx: &mut AllocCtx<'_>,
    node: NodeRef<'_>,
    unique: bool,
    key: &[u8],
    val: &PutVal<'_>,
    mode: PutMode,
) -> ArborResult<NodeId> {
    let b = BinaryNode::read(node.payload);
    let id = node.id;
    match b.find(key) {
        Some(i) => {
            if mode == PutMode::Insert {
                return Err(ArborError::AlreadyExists);
            }
            // fast path: same-size inline overwrite on a writer-unique node
            if unique {
                if let (BinVal::Inline(old), Some(new)) = (b.value(i), val.inline(ctx.cfg())) {
                    if old.len() == new.len() {
                        return modify_in_place(ctx.store, id, |buf| {
                            BinaryNodeMut::read(buf).update_inline_same_size(i, new)
                        });
                    }
                }
            }
            let enc = encode_val(ctx, val)?;
            let arena = b.arena_live_size(i) + binary::record_size(key.len(), enc.len());
            let size = binary::encoded_size(b.branch_cap(), arena);
            if compiler::unlikely(size > BINARY_NODE_MAX) {
                return compiler::cold_call(|| rebuild_binary(ctx, node, Some((i, key, enc)), id));
            }
            let mut n = match ctx.alloc(size, NodeType::Binary) {
                Ok(n) => n,
                Err(e) => {
                    enc.cleanup(ctx.store);
                    return Err(e);
                }
            };
            binary::clone_update(n.buf(), b, b.branch_cap(), i, enc.as_binval());
            if let Err(e) = retain_binary_children(ctx.store, BinaryNode::read(n.buf()), i) {
                n.abandon(ctx.store);
                enc.cleanup(ctx.store);
                return Err(e);
            }
            release_tree(ctx.store, id);
            Ok(n.publish(ctx.store, NodeType::Binary))
        }
        None => {
            if mode == PutMode::Update {
                return Err(ArborError::NotFound);
            }
            let enc = encode_val(ctx, val)?;
            let at = b.lower_bound(key);
            if unique && b.can_insert(key, enc.len()) {
                let bv = enc.as_binval();
                return modify_in_place(ctx.store, id, |buf| {
                    BinaryNodeMut::read(buf).insert(at, key, bv)
                });
            }
            let cap = b.num_branches() + 1 + ctx.cfg().binary_spare_branches;
            let arena = b.arena_live_size(usize::MAX) + binary::record_size(key.len(), enc.len());
            let size = binary::encoded_size(cap, arena + ctx.cfg().binary_spare_bytes);
            if compiler::unlikely(size > BINARY_NODE_MAX) {
                return compiler::cold_call(|| {
                    rebuild_binary(ctx, node, Some((usize::MAX, key, enc)), id)
                });
            }
            let mut n = match ctx.alloc(size, NodeType::Binary) {
                Ok(n) => n,
                Err(e) => {
                    enc.cleanup(ctx.store);
                    return Err(e);
                }
            };
            binary::clone_insert(n.buf(), b, cap, at, key, enc.as_binval());
            if let Err(e) = retain_binary_children(ctx.store, BinaryNode::read(n.buf()), at) {
                n.abandon(ctx.store);
                enc.cleanup(ctx.store);
                return Err(e);
            }
            release_tree(ctx.store, id);
            Ok(n.publish(ctx.store, NodeType::Binary))
        }
    }
}

/// Run an in-place edit under the modify protocol: clear the flags, mutate
/// at the location the cleared word pointed at, set const back and wake any
/// parked compactor
fn modify_in_place(
    store: &Store,
    id: NodeId,
    edit: impl FnOnce(&mut [u8]),
) -> ArborResult<NodeId> {
    let meta = store.ids.meta(id);
    let prior = meta.start_modify();
    let at = store.segs.object_ptr(prior.location());
    let hdr = unsafe {
        // UNSAFE(@ohsayan): const bit is down: the location cannot move
        ObjectHeader::read(at)
    };
    debug_assert_eq!(hdr.id, id);
    let payload = unsafe {
        core::slice::from_raw_parts_mut(
            at.add(OBJ_HEADER_SIZE as usize) as *mut u8,
            hdr.size as usize,
        )
    };
    edit(payload);
    meta.end_modify(&store.parker);
    Ok(id)
}

/// A binary node that cannot absorb the edit even after cloning: explode it
/// into entries (applying the optional replacement/insert) and rebuild
fn rebuild_binary(
    ctx: &mut AllocCtx<'_>,
    node: NodeRef<'_>,
    change: Option<(usize, &[u8], EncVal<'_>)>,
    id: NodeId,
) -> ArborResult<NodeId> {
    let b = BinaryNode::read(node.payload);
    let mut entries: Vec<BuildEntry<'_>> = vec![];
    let (replace, new_key, enc) = match &change {
        Some((i, k, e)) => (*i, *k, Some(e)),
        None => (usize::MAX, &[][..], None),
    };
    for i in 0..b.num_branches() {
        if i == replace {
            continue;
        }
        entries.push(BuildEntry {
            key: b.key(i),
            val: b.value(i),
        });
    }
    if let Some(enc) = enc {
        let at = entries
            .binary_search_by(|e| e.key.cmp(new_key))
            .unwrap_err();
        entries.insert(
            at,
            BuildEntry {
                key: new_key,
                val: enc.as_binval(),
            },
        );
    }
    let built = build_subtree(ctx, &entries);
    match built {
        Ok(new_id) => {
            // build_subtree retained everything it stored, including the
            // fresh value node a large value may have been wrapped in: drop
            // the construction reference we still own
            if let Some((_, _, ev)) = change {
                ev.cleanup(ctx.store);
            }
            release_tree(ctx.store, id);
            Ok(new_id)
        }
        Err(e) => {
            if let Some((_, _, ev)) = change {
                ev.cleanup(ctx.store);
            }
            Err(e)
        }
    }
}

fn put_value(
    ctx: &mut AllocCtx<'_>,
    node: NodeRef<'_>,
    key: &[u8],
    val: &PutVal<'_>,
    mode: PutMode,
) -> ArborResult<NodeId> {
    let v = ValueNode::read(node.payload);
    let id = node.id;
    let vkey = v.key();
    if vkey == key {
        if mode == PutMode::Insert {
            return Err(ArborError::AlreadyExists);
        }
        let new_id = make_value_node(ctx, key, val)?;
        release_tree(ctx.store, id);
        return Ok(new_id);
    }
    if mode == PutMode::Update {
        return Err(ArborError::NotFound);
    }
    // keys diverge: interpose an inner node at the split point
    let common = lcp(vkey, key);
    let mut created: Vec<NodeId> = vec![];
    let mut eos = NodeId::NULL;
    let mut branches: Vec<(u8, NodeId)> = vec![];
    let bail = |ctx: &mut AllocCtx<'_>, created: &[NodeId], e: ArborError| -> ArborError {
        for c in created {
            release_tree(ctx.store, *c);
        }
        e
    };
    // the displaced value node, re-keyed past the split
    if vkey.len() == common {
        let moved = match clone_value_with_key(ctx, &node, b"") {
            Ok(x) => x,
            Err(e) => return Err(bail(ctx, &created, e)),
        };
        created.push(moved);
        eos = moved;
    } else {
        let moved = match clone_value_with_key(ctx, &node, &vkey[common + 1..]) {
            Ok(x) => x,
            Err(e) => return Err(bail(ctx, &created, e)),
        };
        created.push(moved);
        branches.push((vkey[common], moved));
    }
    // the incoming key
    if key.len() == common {
        let fresh = match make_value_node(ctx, b"", val) {
            Ok(x) => x,
            Err(e) => return Err(bail(ctx, &created, e)),
        };
        created.push(fresh);
        eos = fresh;
    } else {
        let fresh = match make_leaf(ctx, &key[common + 1..], val) {
            Ok(x) => x,
            Err(e) => return Err(bail(ctx, &created, e)),
        };
        created.push(fresh);
        branches.push((key[common], fresh));
    }
    branches.sort_unstable_by_key(|e| e.0);
    match write_inner(ctx, &key[..common], eos, &branches, false) {
        Ok(new_id) => {
            release_tree(ctx.store, id);
            Ok(new_id)
        }
        Err(e) => Err(bail(ctx, &created, e)),
    }
}

fn put_inner(
    ctx: &mut AllocCtx<'_>,
    node: NodeRef<'_>,
    unique: bool,
    key: &[u8],
    val: &PutVal<'_>,
    mode: PutMode,
) -> ArborResult<NodeId> {
    let inner = InnerView::read(&node)?;
    let id = node.id;
    let p = inner.prefix();
    let common = lcp(key, p);
    if common < p.len() {
        // the key diverges inside this node's prefix: split the prefix
        if mode == PutMode::Update {
            return Err(ArborError::NotFound);
        }
        let tail = clone_inner(ctx, &inner, &p[common + 1..], None, BranchEdit::None)?;
        let mut created = vec![tail];
        let bail = |ctx: &mut AllocCtx<'_>, created: &[NodeId], e: ArborError| -> ArborError {
            for c in created {
                release_tree(ctx.store, *c);
            }
            e
        };
        let mut eos = NodeId::NULL;
        let mut branches: Vec<(u8, NodeId)> = vec![(p[common], tail)];
        if key.len() == common {
            let fresh = match make_value_node(ctx, b"", val) {
                Ok(x) => x,
                Err(e) => return Err(bail(ctx, &created, e)),
            };
            created.push(fresh);
            eos = fresh;
        } else {
            let fresh = match make_leaf(ctx, &key[common + 1..], val) {
                Ok(x) => x,
                Err(e) => return Err(bail(ctx, &created, e)),
            };
            created.push(fresh);
            branches.push((key[common], fresh));
        }
        branches.sort_unstable_by_key(|e| e.0);
        match write_inner(ctx, &key[..common], eos, &branches, false) {
            Ok(new_id) => {
                release_tree(ctx.store, id);
                Ok(new_id)
            }
            Err(e) => Err(bail(ctx, &created, e)),
        }
    } else {
        let rest = &key[common..];
        if rest.is_empty() {
            // the key terminates at this node: the eos slot
            let eos = inner.eos();
            if !eos.is_null() && mode == PutMode::Insert {
                return Err(ArborError::AlreadyExists);
            }
            if eos.is_null() && mode == PutMode::Update {
                return Err(ArborError::NotFound);
            }
            let fresh = make_value_node(ctx, b"", val)?;
            match clone_inner(ctx, &inner, p, Some(fresh), BranchEdit::None) {
                Ok(new_id) => {
                    release_tree(ctx.store, id);
                    Ok(new_id)
                }
                Err(e) => {
                    release_tree(ctx.store, fresh);
                    Err(e)
                }
            }
        } else {
            let b = rest[0];
            match inner.child(b) {
                Some(child) => {
                    // recurse, handing the recursion its own reference
                    if !ctx.store.ids.meta(child).retain() {
                        return Err(ArborError::RefOverflow);
                    }
                    let new_child = match put(ctx, child, unique, &rest[1..], val, mode) {
                        Ok(x) => x,
                        Err(e) => {
                            release_tree(ctx.store, child);
                            return Err(e);
                        }
                    };
                    if new_child == child {
                        // in-place edit below: this node is untouched
                        release_tree(ctx.store, child);
                        return Ok(id);
                    }
                    match clone_inner(ctx, &inner, p, None, BranchEdit::Set(b, new_child)) {
                        Ok(new_id) => {
                            release_tree(ctx.store, id);
                            Ok(new_id)
                        }
                        Err(e) => {
                            release_tree(ctx.store, new_child);
                            Err(e)
                        }
                    }
                }
                None => {
                    if mode == PutMode::Update {
                        return Err(ArborError::NotFound);
                    }
                    let leaf = make_leaf(ctx, &rest[1..], val)?;
                    match clone_inner(ctx, &inner, p, None, BranchEdit::Set(b, leaf)) {
                        Ok(new_id) => {
                            release_tree(ctx.store, id);
                            Ok(new_id)
                        }
                        Err(e) => {
                            release_tree(ctx.store, leaf);
                            Err(e)
                        }
                    }
                }
            }
        }
    }
}

/*
    removal
*/

/// Remove `key`, consuming one reference to `id`. Returns the replacement id
/// (same id when the key was absent) and whether a removal happened.
pub(crate) fn remove(
    ctx: &mut AllocCtx<'_>,
    id: NodeId,
    key: &[u8],
) -> ArborResult<(NodeId, bool)> {
    if id.is_null() {
        return Ok((id, false));
    }
    let node = get_node(ctx.store, id)?;
    match node.view.node_type() {
        NodeType::Binary => {
            let b = BinaryNode::read(node.payload);
            match b.find(key) {
                None => Ok((id, false)),
                Some(i) => {
                    if b.num_branches() == 1 {
                        release_tree(ctx.store, id);
                        return Ok((NodeId::NULL, true));
                    }
                    let size = binary::encoded_size(b.branch_cap(), b.arena_live_size(i));
                    let mut n = ctx.alloc(size, NodeType::Binary)?;
                    binary::clone_remove(n.buf(), b, b.branch_cap(), i);
                    if let Err(e) =
                        retain_binary_children(ctx.store, BinaryNode::read(n.buf()), usize::MAX)
                    {
                        n.abandon(ctx.store);
                        return Err(e);
                    }
                    release_tree(ctx.store, id);
                    Ok((n.publish(ctx.store, NodeType::Binary), true))
                }
            }
        }
        NodeType::Value | NodeType::Roots => {
            if ValueNode::read(node.payload).key() == key {
                release_tree(ctx.store, id);
                Ok((NodeId::NULL, true))
            } else {
                Ok((id, false))
            }
        }
        NodeType::SetList | NodeType::Full => {
            let inner = InnerView::read(&node)?;
            let p = inner.prefix();
            let common = lcp(key, p);
            if common < p.len() {
                return Ok((id, false));
            }
            let rest = &key[common..];
            if rest.is_empty() {
                if inner.eos().is_null() {
                    return Ok((id, false));
                }
                let new_id =
                    clone_inner(ctx, &inner, p, Some(NodeId::NULL), BranchEdit::None)?;
                release_tree(ctx.store, id);
                // simplification is opportunistic: an error here must not
                // poison an otherwise complete removal
                let new_id = simplify_inner(ctx, new_id).unwrap_or(new_id);
                return Ok((new_id, true));
            }
            let b = rest[0];
            let child = match inner.child(b) {
                Some(c) => c,
                None => return Ok((id, false)),
            };
            if !ctx.store.ids.meta(child).retain() {
                return Err(ArborError::RefOverflow);
            }
            let (new_child, removed) = match remove(ctx, child, &rest[1..]) {
                Ok(x) => x,
                Err(e) => {
                    release_tree(ctx.store, child);
                    return Err(e);
                }
            };
            if !removed {
                release_tree(ctx.store, child);
                return Ok((id, false));
            }
            let edit = if new_child.is_null() {
                BranchEdit::Remove(b)
            } else {
                BranchEdit::Set(b, new_child)
            };
            match clone_inner(ctx, &inner, p, None, edit) {
                Ok(new_id) => {
                    release_tree(ctx.store, id);
                    let new_id = simplify_inner(ctx, new_id).unwrap_or(new_id);
                    Ok((new_id, true))
                }
                Err(e) => {
                    if !new_child.is_null() {
                        release_tree(ctx.store, new_child);
                    }
                    Err(e)
                }
            }
        }
        NodeType::FreeList | NodeType::Undefined => Err(ArborError::Corruption),
    }
}

/// Post-removal structural cleanup of an owned (ref == 1) inner node: an
/// empty node vanishes, a node holding only an eos value collapses into a
/// value node, and a single-branch node without an eos merges into its child
/// with the prefixes concatenated
fn simplify_inner(ctx: &mut AllocCtx<'_>, id: NodeId) -> ArborResult<NodeId> {
    let node = get_node(ctx.store, id)?;
    if !matches!(node.view.node_type(), NodeType::SetList | NodeType::Full) {
        return Ok(id);
    }
    let inner = InnerView::read(&node)?;
    let n = inner.num_branches();
    let eos = inner.eos();
    if n == 0 && eos.is_null() {
        release_tree(ctx.store, id);
        return Ok(NodeId::NULL);
    }
    if n == 0 {
        // only the end-of-string value remains
        let vn = get_node(ctx.store, eos)?;
        let replacement = clone_value_with_key(ctx, &vn, inner.prefix())?;
        release_tree(ctx.store, id);
        return Ok(replacement);
    }
    if n != 1 || !eos.is_null() {
        return Ok(id);
    }
    let (byte, child) = inner.collect_branches()[0];
    let mut joined = Vec::with_capacity(inner.prefix().len() + 1);
    joined.extend_from_slice(inner.prefix());
    joined.push(byte);
    let cnode = get_node(ctx.store, child)?;
    match cnode.view.node_type() {
        NodeType::Value | NodeType::Roots => {
            let ckey = ValueNode::read(cnode.payload).key();
            joined.extend_from_slice(ckey);
            let replacement = clone_value_with_key(ctx, &cnode, &joined)?;
            release_tree(ctx.store, id);
            Ok(replacement)
        }
        NodeType::SetList | NodeType::Full => {
            let cinner = InnerView::read(&cnode)?;
            joined.extend_from_slice(cinner.prefix());
            let replacement = clone_inner(ctx, &cinner, &joined, None, BranchEdit::None)?;
            release_tree(ctx.store, id);
            Ok(replacement)
        }
        NodeType::Binary => {
            // only worth merging when every record still fits one bucket
            // with the byte spliced back onto its key
            let b = BinaryNode::read(cnode.payload);
            let grown: usize = (0..b.num_branches())
                .map(|i| {
                    binary::record_size(
                        joined.len() + b.key(i).len(),
                        b.value(i).encoded_len(),
                    )
                })
                .sum();
            let size = binary::encoded_size(b.branch_cap(), grown);
            if size > BINARY_NODE_MAX {
                return Ok(id);
            }
            let keys: Vec<Vec<u8>> = (0..b.num_branches())
                .map(|i| {
                    let mut k = joined.clone();
                    k.extend_from_slice(b.key(i));
                    k
                })
                .collect();
            let entries: Vec<BuildEntry<'_>> = keys
                .iter()
                .zip(0..b.num_branches())
                .map(|(k, i)| BuildEntry {
                    key: k,
                    val: b.value(i),
                })
                .collect();
            let replacement = build_subtree(ctx, &entries)?;
            release_tree(ctx.store, id);
            Ok(replacement)
        }
        NodeType::FreeList | NodeType::Undefined => Err(ArborError::Corruption),
    }
}
