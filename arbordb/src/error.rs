/*
 * Created on Sun Feb 11 2024
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

use std::{fmt, io::Error as IoError};

pub type ArborResult<T> = Result<T, ArborError>;

#[derive(Debug)]
/// Errors surfaced at the engine boundary. Transient races inside the
/// meta-word protocol are retried internally and never reach here.
pub enum ArborError {
    /// `update` (or a reader verb) addressed a key that does not exist
    NotFound,
    /// `insert` addressed a key that already exists
    AlreadyExists,
    /// the store cannot grow past `max_segments` and the free ring is empty
    OutOfSpace,
    /// an id region exhausted both its bump range and its free list, and the
    /// id map cannot grow further
    IdExhaustion,
    /// a retain would have pushed a refcount past the safety ceiling
    RefOverflow,
    /// an object header did not match its meta word (stale read that did not
    /// settle), or an on-disk structure failed validation
    Corruption,
    /// a root handle from another store (or a released session) was used
    InvalidHandle,
    /// all reader slots are taken
    SessionLimit,
    /// a key or value exceeds what the node codecs can represent
    TooLarge,
    /// bad open options
    BadConfig(&'static str),
    /// an OS-level I/O failure
    Io(IoError),
}

impl ArborError {
    /// Kind-level equality; the payload of [`ArborError::Io`] is ignored
    pub fn kind_eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}

impl PartialEq for ArborError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::BadConfig(a), Self::BadConfig(b)) => a == b,
            (a, b) => core::mem::discriminant(a) == core::mem::discriminant(b),
        }
    }
}

impl From<IoError> for ArborError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for ArborError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::AlreadyExists => write!(f, "key already exists"),
            Self::OutOfSpace => write!(f, "store reached max_segments and no segment is free"),
            Self::IdExhaustion => write!(f, "node id space exhausted"),
            Self::RefOverflow => write!(f, "reference count ceiling reached"),
            Self::Corruption => write!(f, "store integrity check failed"),
            Self::InvalidHandle => write!(f, "root handle does not belong to this store"),
            Self::SessionLimit => write!(f, "all reader slots are in use"),
            Self::TooLarge => write!(f, "key or value too large for the node codecs"),
            Self::BadConfig(which) => write!(f, "bad configuration: {which}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for ArborError {}
