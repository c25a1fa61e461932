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

pub mod compiler {
    //! Dark compiler arts and hackery to defy the normal. Use at your own
    //! risk

    #[cold]
    #[inline(never)]
    pub const fn cold() {}

    pub const fn likely(b: bool) -> bool {
        if !b {
            cold()
        }
        b
    }

    pub const fn unlikely(b: bool) -> bool {
        if b {
            cold()
        }
        b
    }

    #[cold]
    #[inline(never)]
    pub fn cold_call<U>(v: impl FnOnce() -> U) -> U {
        v()
    }
}

/// Copy exactly `N` bytes out of a slice that is at least `N` bytes long
#[inline(always)]
pub fn copy_slice_to_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut dst = [0u8; N];
    dst.copy_from_slice(&src[..N]);
    dst
}

/// Round up to the next multiple of 16 (the object alignment of the store)
#[inline(always)]
pub const fn round_up_16(v: usize) -> usize {
    (v + 15) & !15
}

/// Longest common prefix of two byte strings
#[inline(always)]
pub fn lcp(a: &[u8], b: &[u8]) -> usize {
    let max = a.len().min(b.len());
    let mut i = 0;
    while i < max && a[i] == b[i] {
        i += 1;
    }
    i
}

/// The OS page size. Cached because `sysconf` is a syscall on some libcs
pub fn os_page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        unsafe {
            // UNSAFE(@ohsayan): plain sysconf call; falls back if the libc
            // reports something nonsensical
            let sz = libc::sysconf(libc::_SC_PAGESIZE);
            if sz > 0 {
                return sz as usize;
            }
            4096
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

#[test]
fn test_lcp() {
    assert_eq!(lcp(b"apple", b"apply"), 4);
    assert_eq!(lcp(b"", b"apply"), 0);
    assert_eq!(lcp(b"same", b"same"), 4);
}

#[test]
fn test_round_up() {
    assert_eq!(round_up_16(0), 0);
    assert_eq!(round_up_16(1), 16);
    assert_eq!(round_up_16(16), 16);
    assert_eq!(round_up_16(17), 32);
}
