/*
 * Created on Sat Apr 20 2024
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

//! The root journal (roots.dat): an append-only log of committed root ids.
//! Fixed 32-byte entries, each carrying a monotonically increasing event id,
//! a source marker, and a CRC over everything ahead of it:
//!
//! ```text
//! +--------------+------------+-------------+---------+----------+
//! | event id u64 | marker u64 | root id u64 | crc u32 | rsv u32  |
//! +--------------+------------+-------------+---------+----------+
//! ```
//!
//! On open the journal is scrolled entry by entry; the first entry whose CRC
//! or event id does not line up marks a torn tail and the file is truncated
//! right there. Whatever commit survived last names the restart root.

use {
    crate::{
        error::{ArborError, ArborResult},
        meta::NodeId,
        util::copy_slice_to_array,
    },
    log::warn,
    std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::Path,
    },
};

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

const JNL_MAGIC: u64 = u64::from_le_bytes(*b"ARBORJNL");
const JNL_VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 32;

/// entry markers
const MARKER_COMMIT: u64 = 1 << 63;
const MARKER_CLOSED: u64 = 0;
const MARKER_REOPENED: u64 = 1;

struct Entry {
    event_id: u64,
    marker: u64,
    root: u64,
}

impl Entry {
    fn encoded(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.event_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.marker.to_le_bytes());
        buf[16..24].copy_from_slice(&self.root.to_le_bytes());
        let crc = CRC.checksum(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }
    fn decode(buf: &[u8; ENTRY_SIZE]) -> Option<Self> {
        let crc = u32::from_le_bytes(copy_slice_to_array(&buf[24..28]));
        if CRC.checksum(&buf[..24]) != crc {
            return None;
        }
        Some(Self {
            event_id: u64::from_le_bytes(copy_slice_to_array(&buf[0..8])),
            marker: u64::from_le_bytes(copy_slice_to_array(&buf[8..16])),
            root: u64::from_le_bytes(copy_slice_to_array(&buf[16..24])),
        })
    }
}

#[derive(Debug)]
pub struct RootJournal {
    file: File,
    next_id: u64,
}

impl RootJournal {
    /// Open or create the journal, scrolling every intact entry. Returns the
    /// journal positioned for appends, the surviving commit history (oldest
    /// first), and whether the previous run closed cleanly.
    pub fn open(path: &Path) -> ArborResult<(Self, Vec<NodeId>, bool)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            let mut header = [0u8; HEADER_SIZE];
            header[0..8].copy_from_slice(&JNL_MAGIC.to_le_bytes());
            header[8..12].copy_from_slice(&JNL_VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            return Ok((Self { file, next_id: 0 }, vec![], true));
        }
        // small file, whole-buffer scroll like any sane person would
        let mut raw = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;
        if raw.len() < HEADER_SIZE
            || u64::from_le_bytes(copy_slice_to_array(&raw[0..8])) != JNL_MAGIC
            || u32::from_le_bytes(copy_slice_to_array(&raw[8..12])) != JNL_VERSION
        {
            return Err(ArborError::Corruption);
        }
        let mut pos = HEADER_SIZE;
        let mut next_id = 0u64;
        let mut roots = vec![];
        let mut closed = false;
        while pos + ENTRY_SIZE <= raw.len() {
            let buf: [u8; ENTRY_SIZE] = copy_slice_to_array(&raw[pos..pos + ENTRY_SIZE]);
            let entry = match Entry::decode(&buf) {
                Some(e) if e.event_id == next_id => e,
                _ => {
                    warn!(
                        "root journal: torn entry at offset {pos}, truncating {} bytes",
                        raw.len() - pos
                    );
                    break;
                }
            };
            match entry.marker {
                MARKER_COMMIT => {
                    roots.push(NodeId::from_raw(entry.root));
                    closed = false;
                }
                MARKER_CLOSED => closed = true,
                MARKER_REOPENED => closed = false,
                _ => {
                    warn!("root journal: unknown marker at offset {pos}, truncating");
                    break;
                }
            }
            next_id += 1;
            pos += ENTRY_SIZE;
        }
        if pos as u64 != len {
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(pos as u64))?;
        let mut slf = Self { file, next_id };
        slf.append(MARKER_REOPENED, 0, true)?;
        Ok((slf, roots, closed))
    }
    fn append(&mut self, marker: u64, root: u64, fsync: bool) -> ArborResult<u64> {
        let event_id = self.next_id;
        let entry = Entry {
            event_id,
            marker,
            root,
        };
        self.file.write_all(&entry.encoded())?;
        if fsync {
            self.file.sync_data()?;
        }
        self.next_id += 1;
        Ok(event_id)
    }
    /// Record a commit; returns its event id (which doubles as the commit
    /// epoch)
    pub fn append_commit(&mut self, root: NodeId, fsync: bool) -> ArborResult<u64> {
        self.append(MARKER_COMMIT, root.raw(), fsync)
    }
    /// Record a clean shutdown
    pub fn append_close(&mut self) -> ArborResult<()> {
        self.append(MARKER_CLOSED, 0, true).map(|_| ())
    }
    pub fn next_event_id(&self) -> u64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::PathBuf};

    fn scratch(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("arbordb-jnl-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn scrolls_commits() {
        let path = scratch("scroll");
        {
            let (mut j, roots, _) = RootJournal::open(&path).unwrap();
            assert!(roots.is_empty());
            j.append_commit(NodeId::from_raw(42), true).unwrap();
            j.append_commit(NodeId::from_raw(77), true).unwrap();
            j.append_close().unwrap();
        }
        {
            let (j, roots, closed) = RootJournal::open(&path).unwrap();
            assert_eq!(roots, vec![NodeId::from_raw(42), NodeId::from_raw(77)]);
            assert!(closed);
            // two commits + close from the first run, plus our reopen marker
            assert_eq!(j.next_event_id(), 4);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncates_torn_tail() {
        let path = scratch("torn");
        {
            let (mut j, _, _) = RootJournal::open(&path).unwrap();
            j.append_commit(NodeId::from_raw(1), true).unwrap();
            j.append_commit(NodeId::from_raw(2), true).unwrap();
        }
        // chop the last entry in half
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - (ENTRY_SIZE as u64 / 2)).unwrap();
        drop(f);
        {
            let (_, roots, closed) = RootJournal::open(&path).unwrap();
            assert_eq!(roots, vec![NodeId::from_raw(1)]);
            assert!(!closed);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_corrupt_entries_midway() {
        let path = scratch("crc");
        {
            let (mut j, _, _) = RootJournal::open(&path).unwrap();
            j.append_commit(NodeId::from_raw(5), true).unwrap();
            j.append_commit(NodeId::from_raw(6), true).unwrap();
        }
        // flip a byte inside the second entry's root field
        let mut raw = std::fs::read(&path).unwrap();
        let off = HEADER_SIZE + ENTRY_SIZE + 16;
        raw[off] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();
        {
            let (_, roots, _) = RootJournal::open(&path).unwrap();
            // the bad entry and everything after it is gone
            assert_eq!(roots, vec![NodeId::from_raw(5)]);
        }
        let _ = std::fs::remove_file(&path);
    }
}
