/*
 * Created on Sat Feb 10 2024
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

//! # ArborDB
//!
//! ArborDB maps arbitrary byte-string keys to byte-string values (or to whole
//! embedded subtrees) inside a segmented, memory-mapped, append-only store.
//! Nodes are immutable once published: every mutation clones the path from the
//! root, which is what gives readers their free snapshots. A single write
//! session races only against the background compactor, and the two are
//! coordinated exclusively through the per-node atomic meta word.
//!
//! The modules are layered bottom up:
//! - [`mem`]: raw file mappings and the grow-on-demand block allocator
//! - [`meta`]: node identifiers, the meta-word protocol and the id allocator
//! - [`seg`]: the segment store, free-segment ring, durability and compaction
//! - [`node`]: the packed codecs for the four node variants
//! - [`tree`]: copy-on-write mutation, lookup and ordered iteration
//! - [`session`], [`journal`], [`db`]: the public surface

#[macro_use]
mod macros;
mod util;

pub mod config;
pub mod error;

mod db;
mod journal;
mod mem;
mod meta;
mod node;
mod seg;
mod session;
mod tree;

#[cfg(test)]
mod tests;

pub use {
    config::{Config, SyncMode},
    db::{ArborDB, SegmentStats, StoreStats},
    error::{ArborError, ArborResult},
    session::{ReadSession, RootHandle, Value, ValueRef, WriteSession},
    tree::iter::RangeIter,
};
