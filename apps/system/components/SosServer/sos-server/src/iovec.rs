// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scatter-gather lists over client buffers.
//!
//! A client (buffer, length) pair becomes a chain of spans split at
//! page boundaries, each validated against the owning region's rights
//! up front. Device handlers consume the chain progressively across
//! suspensions.

use alloc::collections::VecDeque;
use log::debug;
use sos_addrspace::AddressSpace;
use sos_os_common::caps::CapRights;
use sos_os_common::mem::PAGE_SIZE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoDirection {
    /// Device consumes client memory (write syscall): region must be
    /// readable.
    FromClient,
    /// Device fills client memory (read syscall): region must be
    /// writable.
    ToClient,
}

impl IoDirection {
    fn required_rights(&self) -> CapRights {
        match self {
            IoDirection::FromClient => CapRights::READ,
            IoDirection::ToClient => CapRights::WRITE,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoSpan {
    pub vstart: usize,
    pub len: usize,
    /// Span addresses SOS's own frame window rather than client memory.
    pub sos_owned: bool,
}

/// Splits a client buffer into page-bounded spans, checking every page
/// lies in a region with the required right. `None` on any violation.
pub fn cbuf_to_iov(
    aspace: &AddressSpace,
    buf: usize,
    nbyte: usize,
    dir: IoDirection,
) -> Option<VecDeque<IoSpan>> {
    let required = dir.required_rights();
    let check = |vaddr: usize| -> bool {
        match aspace.region_of(vaddr) {
            Some(region) => region.rights.contains(required),
            None => false,
        }
    };

    let mut chain = VecDeque::new();
    if nbyte == 0 {
        if !check(buf) {
            debug!("iov: {:#x} outside usable region", buf);
            return None;
        }
        chain.push_back(IoSpan {
            vstart: buf,
            len: 0,
            sos_owned: false,
        });
        return Some(chain);
    }

    let mut vaddr = buf;
    let mut remaining = nbyte;
    while remaining > 0 {
        let offset = vaddr % PAGE_SIZE;
        let len = (PAGE_SIZE - offset).min(remaining);
        if !check(vaddr) {
            debug!("iov: {:#x} outside usable region", vaddr);
            return None;
        }
        chain.push_back(IoSpan {
            vstart: vaddr,
            len,
            sos_owned: false,
        });
        vaddr += len;
        remaining -= len;
    }
    debug_assert_eq!(chain.iter().map(|s| s.len).sum::<usize>(), nbyte);
    Some(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    const BUF: usize = 0x0060_0000;

    fn aspace_with_region(f: &mut Fixture, rights: CapRights) -> AddressSpace {
        let mut aspace = f.aspace();
        aspace.create_region(BUF, BUF + 0x10000, rights, None).unwrap();
        aspace
    }

    #[test]
    fn test_splits_at_page_boundaries() {
        let mut f = Fixture::new();
        let aspace = aspace_with_region(&mut f, CapRights::RW);
        // 10000 bytes starting mid-page: head partial, full pages,
        // tail partial.
        let chain = cbuf_to_iov(&aspace, BUF + 0xf00, 10000, IoDirection::ToClient).unwrap();
        assert_eq!(chain[0].len, 0x100);
        assert!(chain.iter().skip(1).take(chain.len() - 2).all(|s| s.len == PAGE_SIZE));
        assert_eq!(chain.iter().map(|s| s.len).sum::<usize>(), 10000);
        assert_eq!(chain[1].vstart % PAGE_SIZE, 0);
    }

    #[test]
    fn test_rights_checked_per_direction() {
        let mut f = Fixture::new();
        let aspace = aspace_with_region(&mut f, CapRights::READ);
        assert!(cbuf_to_iov(&aspace, BUF, 64, IoDirection::FromClient).is_some());
        assert!(cbuf_to_iov(&aspace, BUF, 64, IoDirection::ToClient).is_none());
    }

    #[test]
    fn test_region_miss_rejected() {
        let mut f = Fixture::new();
        let aspace = aspace_with_region(&mut f, CapRights::RW);
        // Tail crosses out of the region.
        assert!(cbuf_to_iov(&aspace, BUF + 0xf000, 0x2000, IoDirection::ToClient).is_none());
        assert!(cbuf_to_iov(&aspace, 0x10, 4, IoDirection::ToClient).is_none());
    }

    #[test]
    fn test_zero_length() {
        let mut f = Fixture::new();
        let aspace = aspace_with_region(&mut f, CapRights::RW);
        let chain = cbuf_to_iov(&aspace, BUF, 0, IoDirection::ToClient).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].len, 0);
    }
}
