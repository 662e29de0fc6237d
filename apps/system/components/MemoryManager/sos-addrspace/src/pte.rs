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

//! Leaf page-table entries.
//!
//! Entries live in an arena with stable integer ids; the clock ring is
//! threaded through them as prev/next ids rather than pointers, so ring
//! maintenance never aliases.

use sos_frame_table::FrameId;
use sos_os_common::caps::CPtr;
use sos_swap_store::SwapOffset;

use alloc::vec::Vec;

pub type PteId = usize;

/// Where the page's contents live. Exactly one of the two is ever
/// valid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageBacking {
    Frame(FrameId),
    Swapped(SwapOffset),
}

#[derive(Debug)]
pub struct Pte {
    pub backing: PageBacking,
    /// Mapping capability: the copy of the frame cap installed in the
    /// client page directory. Non-null iff resident and currently
    /// mapped.
    pub cap: Option<CPtr>,
    /// Set when the client touched the page since the last replacement
    /// scan.
    pub referenced: bool,
    /// A pinned entry is never chosen as an eviction victim.
    pub pinned: bool,
    // Clock ring links (arena ids).
    pub(crate) next: PteId,
    pub(crate) prev: PteId,
}

impl Pte {
    pub fn is_swapped(&self) -> bool { matches!(self.backing, PageBacking::Swapped(_)) }

    pub fn frame(&self) -> Option<FrameId> {
        match self.backing {
            PageBacking::Frame(f) => Some(f),
            PageBacking::Swapped(_) => None,
        }
    }

    pub fn swap_offset(&self) -> Option<SwapOffset> {
        match self.backing {
            PageBacking::Swapped(off) => Some(off),
            PageBacking::Frame(_) => None,
        }
    }
}

/// Arena of PTE records with id recycling.
#[derive(Default)]
pub struct PteArena {
    slots: Vec<Option<Pte>>,
    free: Vec<PteId>,
}

impl PteArena {
    pub fn insert(&mut self, pte: Pte) -> PteId {
        match self.free.pop() {
            Some(id) => {
                debug_assert!(self.slots[id].is_none());
                self.slots[id] = Some(pte);
                id
            }
            None => {
                self.slots.push(Some(pte));
                self.slots.len() - 1
            }
        }
    }

    pub fn remove(&mut self, id: PteId) -> Pte {
        let pte = self.slots[id].take();
        self.free.push(id);
        pte.expect("pte arena: remove of free slot")
    }

    pub fn get(&self, id: PteId) -> &Pte {
        self.slots[id].as_ref().expect("pte arena: free slot")
    }

    pub fn get_mut(&mut self, id: PteId) -> &mut Pte {
        self.slots[id].as_mut().expect("pte arena: free slot")
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = PteId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
    }

    pub fn len(&self) -> usize { self.slots.iter().filter(|s| s.is_some()).count() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
