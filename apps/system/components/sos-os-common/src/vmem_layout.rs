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

//! Fixed virtual-memory layout.
//!
//! The frame window is the region of SOS's own address space where every
//! allocated frame is mapped at an offset derived from its index, so SOS
//! can read or write any frame by address. Client layout constants are
//! the addresses baked into the client runtime.

use crate::mem::PAGE_SIZE;
use static_assertions::const_assert;

/// SOS frame window.
pub const FRAME_VSTART: usize = 0x2000_0000;
pub const FRAME_SIZE_BITS: usize = 30;
pub const FRAME_VEND: usize = FRAME_VSTART + (1 << FRAME_SIZE_BITS);

/// Client address-space layout.
pub const PROCESS_STACK_BOTTOM: usize = 0x8000_0000;
pub const PROCESS_STACK_TOP: usize = 0x9000_0000;
pub const PROCESS_IPC_BUFFER: usize = 0xA000_0000;

const_assert!(FRAME_VSTART % PAGE_SIZE == 0);
const_assert!(PROCESS_STACK_BOTTOM < PROCESS_STACK_TOP);
const_assert!(PROCESS_STACK_TOP <= PROCESS_IPC_BUFFER);
