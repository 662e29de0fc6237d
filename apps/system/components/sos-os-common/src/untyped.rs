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

//! The untyped-memory arena seam. The arena owns the boot-time untyped
//! memory and hands out naturally aligned chunks by log2 size; the
//! concrete allocator lives with the frame table.

use crate::caps::Paddr;

pub trait UntypedArena {
    /// Allocates `1 << size_bits` bytes of untyped memory, naturally
    /// aligned. Returns `None` when exhausted; callers convert to an
    /// error, never panic.
    fn alloc(&mut self, size_bits: usize) -> Option<Paddr>;

    /// Returns a previously allocated chunk.
    fn free(&mut self, paddr: Paddr, size_bits: usize);
}
