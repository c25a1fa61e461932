/*
 * Created on Sat Apr 06 2024
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

//! Ordered range iteration. The iterator keeps an explicit stack of
//! `(node, position)` frames plus the key bytes reconstructed so far; since
//! it borrows the root handle (and the session whose slot pins the ring) it
//! observes one stable snapshot no matter what the writer does meanwhile.

use {
    super::{get_node, value_of, InnerView, NodeRef},
    crate::{
        db::Store,
        error::ArborResult,
        meta::{NodeId, NodeType},
        node::{binary::BinaryNode, value::ValueNode},
        session::{to_public_value, ReadSession, RootHandle, Value},
    },
    std::sync::Arc,
};

enum FrameKind {
    /// a value node reached as a child; emits once
    Value { id: NodeId, emitted: bool },
    /// a binary bucket walking its sorted records
    Binary { id: NodeId, idx: usize },
    /// an inner node: end-of-string value first, then branches ascending.
    /// `next_branch` is the next branch byte to consider (256 = exhausted).
    Inner {
        id: NodeId,
        eos_pending: bool,
        next_branch: u16,
    },
}

struct Frame {
    kind: FrameKind,
    /// keybuf length to restore when this frame pops
    truncate_to: usize,
}

/// A lexicographic `[lower, upper)` cursor over one root's snapshot. Borrows
/// both the root handle (keeps the nodes retained) and the read session
/// (keeps the ring pinned so relocated-out segments cannot be recycled
/// mid-read).
pub struct RangeIter<'a> {
    store: Arc<Store>,
    _sess: &'a ReadSession,
    _root: &'a RootHandle,
    stack: Vec<Frame>,
    keybuf: Vec<u8>,
    upper: Option<Vec<u8>>,
    done: bool,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn new(
        sess: &'a ReadSession,
        store: Arc<Store>,
        root: &'a RootHandle,
        lower: Option<&[u8]>,
        upper: Option<Vec<u8>>,
    ) -> ArborResult<Self> {
        let mut slf = Self {
            store,
            _sess: sess,
            _root: root,
            stack: vec![],
            keybuf: vec![],
            upper,
            done: false,
        };
        let root_id = root.id();
        slf.position(root_id, lower.unwrap_or(b""), 0)?;
        Ok(slf)
    }
    /// Restart the cursor from the first key `>= key` (the upper bound is
    /// kept)
    pub fn seek(&mut self, key: &[u8]) -> ArborResult<()> {
        let root = self._root.id();
        self.stack.clear();
        self.keybuf.clear();
        self.done = false;
        self.position(root, key, 0)
    }
    /// Push the frames that place the cursor at the first key `>= lower`
    /// inside the subtree at `id`. `lower` is relative to the path already
    /// in `keybuf`; `truncate_to` is what the frame restores on pop (the
    /// length before this subtree's branch byte and prefix were appended).
    /// Pushes nothing when the whole subtree sorts below the bound.
    fn position(&mut self, id: NodeId, lower: &[u8], truncate_to: usize) -> ArborResult<()> {
        if id.is_null() {
            return Ok(());
        }
        let store = self.store.clone();
        let node = get_node(&store, id)?;
        match node.view.node_type() {
            NodeType::Value | NodeType::Roots => {
                if ValueNode::read(node.payload).key() >= lower {
                    self.stack.push(Frame {
                        kind: FrameKind::Value { id, emitted: false },
                        truncate_to,
                    });
                }
            }
            NodeType::Binary => {
                let b = BinaryNode::read(node.payload);
                let idx = b.lower_bound(lower);
                if idx < b.num_branches() {
                    self.stack.push(Frame {
                        kind: FrameKind::Binary { id, idx },
                        truncate_to,
                    });
                }
            }
            NodeType::SetList | NodeType::Full => {
                let inner = InnerView::read(&node)?;
                let p = inner.prefix().to_vec();
                let m = p.len().min(lower.len());
                if p[..m] < lower[..m] {
                    // everything under this prefix sorts below the bound
                    return Ok(());
                }
                if p[..m] > lower[..m] || lower.len() <= p.len() {
                    // the whole subtree clears the bound
                    self.keybuf.extend_from_slice(&p);
                    self.stack.push(Frame {
                        kind: FrameKind::Inner {
                            id,
                            eos_pending: true,
                            next_branch: 0,
                        },
                        truncate_to,
                    });
                    return Ok(());
                }
                // prefix consumed exactly; the bound continues below. the
                // eos key equals the path and is therefore below the bound.
                let rest = lower[p.len()..].to_vec();
                let b = rest[0];
                self.keybuf.extend_from_slice(&p);
                let parent_frame_at = self.stack.len();
                self.stack.push(Frame {
                    kind: FrameKind::Inner {
                        id,
                        eos_pending: false,
                        next_branch: b as u16 + 1,
                    },
                    truncate_to,
                });
                if let Some(child) = inner.child(b) {
                    let before_byte = self.keybuf.len();
                    self.keybuf.push(b);
                    self.position(child, &rest[1..], before_byte)?;
                    if self.stack.len() == parent_frame_at + 1 {
                        // the child subtree sat entirely below the bound
                        self.keybuf.pop();
                    }
                }
            }
            NodeType::FreeList | NodeType::Undefined => {
                return Err(crate::error::ArborError::Corruption)
            }
        }
        Ok(())
    }
    fn emit(&mut self, key: Vec<u8>, node: &NodeRef<'_>) -> Option<ArborResult<(Vec<u8>, Value)>> {
        if let Some(upper) = &self.upper {
            if key.as_slice() >= upper.as_slice() {
                self.done = true;
                self.stack.clear();
                return None;
            }
        }
        let raw = value_of(node);
        Some(to_public_value(&self.store, raw).map(|v| (key, v)))
    }
}

impl Iterator for RangeIter<'_> {
    type Item = ArborResult<(Vec<u8>, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let store = self.store.clone();
        loop {
            let frame = match self.stack.last_mut() {
                Some(f) => f,
                None => {
                    self.done = true;
                    return None;
                }
            };
            match &mut frame.kind {
                FrameKind::Value { id, emitted } => {
                    if *emitted {
                        let t = frame.truncate_to;
                        self.stack.pop();
                        self.keybuf.truncate(t);
                        continue;
                    }
                    *emitted = true;
                    let id = *id;
                    let node = match get_node(&store, id) {
                        Ok(n) => n,
                        Err(e) => return Some(Err(e)),
                    };
                    let mut key = self.keybuf.clone();
                    key.extend_from_slice(ValueNode::read(node.payload).key());
                    if let Some(out) = self.emit(key, &node) {
                        return Some(out);
                    }
                    return None;
                }
                FrameKind::Binary { id, idx } => {
                    let id = *id;
                    let i = *idx;
                    let node = match get_node(&store, id) {
                        Ok(n) => n,
                        Err(e) => return Some(Err(e)),
                    };
                    let b = BinaryNode::read(node.payload);
                    if i >= b.num_branches() {
                        let t = frame.truncate_to;
                        self.stack.pop();
                        self.keybuf.truncate(t);
                        continue;
                    }
                    *idx = i + 1;
                    let mut key = self.keybuf.clone();
                    key.extend_from_slice(b.key(i));
                    let out = match b.value(i) {
                        crate::node::binary::BinVal::Inline(v) => {
                            let v = v.to_vec();
                            if let Some(upper) = &self.upper {
                                if key.as_slice() >= upper.as_slice() {
                                    self.done = true;
                                    self.stack.clear();
                                    return None;
                                }
                            }
                            Some(Ok((key, Value::Bytes(v))))
                        }
                        crate::node::binary::BinVal::Child(cid) => {
                            let vn = match get_node(&store, cid) {
                                Ok(n) => n,
                                Err(e) => return Some(Err(e)),
                            };
                            self.emit(key, &vn)
                        }
                    };
                    return match out {
                        Some(x) => Some(x),
                        None => None,
                    };
                }
                FrameKind::Inner {
                    id,
                    eos_pending,
                    next_branch,
                } => {
                    let id = *id;
                    let node = match get_node(&store, id) {
                        Ok(n) => n,
                        Err(e) => return Some(Err(e)),
                    };
                    let inner = match InnerView::read(&node) {
                        Ok(i) => i,
                        Err(e) => return Some(Err(e)),
                    };
                    if *eos_pending {
                        *eos_pending = false;
                        let eos = inner.eos();
                        if !eos.is_null() {
                            let vn = match get_node(&store, eos) {
                                Ok(n) => n,
                                Err(e) => return Some(Err(e)),
                            };
                            let key = self.keybuf.clone();
                            if let Some(out) = self.emit(key, &vn) {
                                return Some(out);
                            }
                            return None;
                        }
                        continue;
                    }
                    // advance to the next present branch
                    let nb = *next_branch;
                    if nb > 255 {
                        let t = frame.truncate_to;
                        self.stack.pop();
                        self.keybuf.truncate(t);
                        continue;
                    }
                    let found = match &inner {
                        InnerView::Set(s) => {
                            let at = s.lower_bound(nb as u8);
                            if at < s.num_branches() {
                                Some((s.branch_byte(at), s.child(at)))
                            } else {
                                None
                            }
                        }
                        InnerView::Full(f) => {
                            f.lower_bound(nb as u8).map(|(b, i)| (b, f.child_at(i)))
                        }
                    };
                    match found {
                        None => {
                            let t = frame.truncate_to;
                            self.stack.pop();
                            self.keybuf.truncate(t);
                            continue;
                        }
                        Some((byte, child)) => {
                            *next_branch = byte as u16 + 1;
                            self.keybuf.push(byte);
                            let t = self.keybuf.len() - 1;
                            if let Err(e) = self.push_child(child, t) {
                                return Some(Err(e));
                            }
                            continue;
                        }
                    }
                }
            }
        }
    }
}

impl RangeIter<'_> {
    /// Push a plain start-of-subtree frame for a child (no bound filtering;
    /// used while walking forward)
    fn push_child(&mut self, id: NodeId, truncate_to: usize) -> ArborResult<()> {
        let store = self.store.clone();
        let node = get_node(&store, id)?;
        match node.view.node_type() {
            NodeType::Value | NodeType::Roots => self.stack.push(Frame {
                kind: FrameKind::Value { id, emitted: false },
                truncate_to,
            }),
            NodeType::Binary => self.stack.push(Frame {
                kind: FrameKind::Binary { id, idx: 0 },
                truncate_to,
            }),
            NodeType::SetList | NodeType::Full => {
                let inner = InnerView::read(&node)?;
                self.keybuf.extend_from_slice(inner.prefix());
                self.stack.push(Frame {
                    kind: FrameKind::Inner {
                        id,
                        eos_pending: true,
                        next_branch: 0,
                    },
                    truncate_to,
                });
            }
            NodeType::FreeList | NodeType::Undefined => {
                return Err(crate::error::ArborError::Corruption)
            }
        }
        Ok(())
    }
}
