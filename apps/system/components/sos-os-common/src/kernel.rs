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

//! The microkernel seam.
//!
//! Everything SOS asks of the kernel goes through `KernelInterface`:
//! retyping untyped memory into objects, capability bookkeeping, page
//! mapping, TCB control, and the IPC endpoint the syscall loop waits on.
//! The production implementation is a thin wrapper over the kernel
//! bindings; tests substitute a fake that models caps and frame
//! contents in memory.

use crate::caps::{CPtr, CapRights, Paddr};
use crate::error::SosError;
use crate::Word;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum number of message registers in one IPC.
pub const MSG_MAX_WORDS: usize = 120;

/// Badge bit marking interrupt notifications; remaining bits identify
/// the source.
pub const IRQ_EP_BADGE: Word = 1 << 27;
pub const IRQ_BADGE_NETWORK: Word = 1 << 0;
pub const IRQ_BADGE_CLOCK: Word = 1 << 1;

/// IPC labels as delivered by the kernel on the endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum IpcLabel {
    /// Client system call (no fault).
    Syscall = 0,
    /// Error reply label.
    UserException = 2,
    /// Virtual-memory fault forwarded from a client thread.
    VmFault = 3,
}

/// One message received from the IPC endpoint.
#[derive(Clone, Copy)]
pub struct IpcMessage {
    pub badge: Word,
    pub label: Word,
    pub mrs: [Word; MSG_MAX_WORDS],
    pub len: usize,
}

impl IpcMessage {
    pub fn new(badge: Word, label: Word, args: &[Word]) -> Self {
        let mut mrs = [0; MSG_MAX_WORDS];
        mrs[..args.len()].copy_from_slice(args);
        IpcMessage {
            badge,
            label,
            mrs,
            len: args.len(),
        }
    }

    pub fn mr(&self, index: usize) -> Word { self.mrs[index] }
}

/// Page-map failures are split so callers can install a missing leaf
/// page table and retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// No leaf page table covers the address.
    MissingPageTable,
    Failed,
}

impl From<MapError> for SosError {
    fn from(_: MapError) -> SosError { SosError::InvalidArgument }
}

pub trait KernelInterface {
    // Object construction. Each takes untyped memory previously handed
    // out by the arena and returns the new object's capability.
    fn retype_frame(&mut self, paddr: Paddr) -> Result<CPtr, SosError>;
    fn retype_page_table(&mut self, paddr: Paddr) -> Result<CPtr, SosError>;
    fn retype_page_directory(&mut self, paddr: Paddr) -> Result<CPtr, SosError>;
    fn retype_tcb(&mut self, paddr: Paddr) -> Result<CPtr, SosError>;

    // Capability bookkeeping.
    fn copy_cap(&mut self, cap: CPtr, rights: CapRights) -> Result<CPtr, SosError>;
    fn mint_endpoint(&mut self, ep: CPtr, badge: Word) -> Result<CPtr, SosError>;
    fn revoke(&mut self, cap: CPtr);
    fn delete(&mut self, cap: CPtr);

    // Mapping.
    fn map_frame(
        &mut self,
        frame: CPtr,
        root: CPtr,
        vaddr: usize,
        rights: CapRights,
    ) -> Result<(), MapError>;
    fn unmap_frame(&mut self, frame: CPtr);
    fn map_page_table(&mut self, pt: CPtr, root: CPtr, vaddr: usize) -> Result<(), SosError>;

    // SOS frame window. `map_window` installs a frame at a window
    // address in SOS's own vspace; `frame_bytes` is direct access to a
    // window-mapped frame's contents.
    fn map_window(&mut self, frame: CPtr, vaddr: usize) -> Result<(), SosError>;
    fn unmap_window(&mut self, frame: CPtr);
    fn frame_bytes(&mut self, frame: CPtr) -> &mut [u8];

    // TCB control.
    fn configure_tcb(
        &mut self,
        tcb: CPtr,
        fault_ep: CPtr,
        vspace_root: CPtr,
        ipc_buffer_addr: usize,
        ipc_buffer_frame: CPtr,
    ) -> Result<(), SosError>;
    fn start_thread(&mut self, tcb: CPtr, pc: usize, sp: usize) -> Result<(), SosError>;

    // IPC. `wait` blocks for the next message; `None` means the
    // endpoint is gone and the syscall loop should exit. `save_reply`
    // captures the caller's reply capability so the reply can be sent
    // after an arbitrary number of suspensions.
    fn wait(&mut self) -> Option<IpcMessage>;
    fn save_reply(&mut self) -> Result<CPtr, SosError>;
    fn reply(&mut self, reply_cap: CPtr, label: IpcLabel, mrs: &[Word]);

    // Make freshly written frame contents observable to instruction
    // fetch before a client resumes into them.
    fn flush_icache(&mut self, frame: CPtr);
}
