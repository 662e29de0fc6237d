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

//! Fakes for the primitive collaborators, and helpers to drive the
//! whole server in tests.
//!
//! `FakeKernel` models capabilities, frame contents and the two-level
//! mapping checks. `FakeFiles` is an in-memory file server that
//! completes every RPC immediately; completions still only reach the
//! server when a (synthetic) network interrupt is pumped, preserving
//! the asynchronous shape.

use crate::process::Process;
use crate::server::{SosConfig, SosServer};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use sos_addrspace::AddressSpace;
use sos_frame_table::{BootUntyped, FrameTable, UntypedDesc};
use sos_interface::msg;
use sos_os_common::caps::{CPtr, CapRights, Paddr};
use sos_os_common::error::SosError;
use sos_os_common::files::{
    FileAttr, FileCompletion, FileError, FileHandle, FileKind, FileServerInterface,
};
use sos_os_common::kernel::{
    IpcLabel, IpcMessage, KernelInterface, MapError, IRQ_BADGE_CLOCK, IRQ_BADGE_NETWORK,
    IRQ_EP_BADGE,
};
use sos_os_common::mem::{page_align, PAGE_SIZE};
use sos_os_common::serial::SerialInterface;
use sos_os_common::timer::{TimerId, TimerInterface};
use sos_os_common::{CallbackToken, Pid, Word};
use sos_swap_store::SwapStore;

//  ---  Kernel  ---

#[derive(Default)]
pub struct FakeKernel {
    next_cap: CPtr,
    live: HashSet<CPtr>,
    copies: HashMap<CPtr, CPtr>,
    pub storage: HashMap<CPtr, Box<[u8; PAGE_SIZE]>>,
    window: HashSet<CPtr>,
    page_tables: HashMap<CPtr, HashSet<usize>>,
    mappings: HashMap<(CPtr, usize), CPtr>,

    pub msgs: VecDeque<IpcMessage>,
    pub replies: Vec<(CPtr, IpcLabel, Vec<Word>)>,
    pub started: Vec<(CPtr, usize, usize)>,
    pub icache_flushes: usize,
}

impl FakeKernel {
    pub fn new() -> Self {
        FakeKernel {
            next_cap: 100,
            ..Default::default()
        }
    }

    fn fresh(&mut self) -> CPtr {
        let cap = self.next_cap;
        self.next_cap += 1;
        self.live.insert(cap);
        cap
    }

    pub fn live_caps(&self) -> usize { self.live.len() }

    pub fn is_mapped(&self, root: CPtr, vaddr: usize) -> bool {
        self.mappings.contains_key(&(root, page_align(vaddr)))
    }

    pub fn last_reply(&self) -> Option<&(CPtr, IpcLabel, Vec<Word>)> { self.replies.last() }
}

impl KernelInterface for FakeKernel {
    fn retype_frame(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> {
        let cap = self.fresh();
        self.storage.insert(cap, Box::new([0; PAGE_SIZE]));
        Ok(cap)
    }
    fn retype_page_table(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> {
        Ok(self.fresh())
    }
    fn retype_page_directory(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> {
        Ok(self.fresh())
    }
    fn retype_tcb(&mut self, _paddr: Paddr) -> Result<CPtr, SosError> { Ok(self.fresh()) }
    fn copy_cap(&mut self, cap: CPtr, _rights: CapRights) -> Result<CPtr, SosError> {
        assert!(self.live.contains(&cap));
        let copy = self.fresh();
        self.copies.insert(copy, cap);
        Ok(copy)
    }
    fn mint_endpoint(&mut self, _ep: CPtr, _badge: Word) -> Result<CPtr, SosError> {
        Ok(self.fresh())
    }
    fn revoke(&mut self, cap: CPtr) {
        let derived: Vec<CPtr> = self
            .copies
            .iter()
            .filter(|(_, &orig)| orig == cap)
            .map(|(&copy, _)| copy)
            .collect();
        for copy in derived {
            self.delete(copy);
        }
    }
    fn delete(&mut self, cap: CPtr) {
        self.live.remove(&cap);
        self.copies.remove(&cap);
        self.storage.remove(&cap);
        self.window.remove(&cap);
        self.mappings.retain(|_, &mut mapped| mapped != cap);
        self.page_tables.remove(&cap);
    }
    fn map_frame(
        &mut self,
        frame: CPtr,
        root: CPtr,
        vaddr: usize,
        _rights: CapRights,
    ) -> Result<(), MapError> {
        assert!(self.live.contains(&frame));
        if !self
            .page_tables
            .get(&root)
            .map(|pts| pts.contains(&(vaddr >> 22)))
            .unwrap_or(false)
        {
            return Err(MapError::MissingPageTable);
        }
        if self.mappings.contains_key(&(root, vaddr)) {
            return Err(MapError::Failed);
        }
        self.mappings.insert((root, vaddr), frame);
        Ok(())
    }
    fn unmap_frame(&mut self, frame: CPtr) {
        self.mappings.retain(|_, &mut mapped| mapped != frame);
    }
    fn map_page_table(&mut self, pt: CPtr, root: CPtr, vaddr: usize) -> Result<(), SosError> {
        assert!(self.live.contains(&pt));
        self.page_tables.entry(root).or_default().insert(vaddr >> 22);
        Ok(())
    }
    fn map_window(&mut self, frame: CPtr, _vaddr: usize) -> Result<(), SosError> {
        self.window.insert(frame);
        Ok(())
    }
    fn unmap_window(&mut self, frame: CPtr) {
        self.window.remove(&frame);
    }
    fn frame_bytes(&mut self, frame: CPtr) -> &mut [u8] {
        assert!(self.window.contains(&frame), "frame not window-mapped");
        &mut self.storage.get_mut(&frame).unwrap()[..]
    }
    fn configure_tcb(
        &mut self,
        tcb: CPtr,
        _fault_ep: CPtr,
        _vspace_root: CPtr,
        _ipc_buffer_addr: usize,
        _ipc_buffer_frame: CPtr,
    ) -> Result<(), SosError> {
        assert!(self.live.contains(&tcb));
        Ok(())
    }
    fn start_thread(&mut self, tcb: CPtr, pc: usize, sp: usize) -> Result<(), SosError> {
        self.started.push((tcb, pc, sp));
        Ok(())
    }
    fn wait(&mut self) -> Option<IpcMessage> { self.msgs.pop_front() }
    fn save_reply(&mut self) -> Result<CPtr, SosError> { Ok(self.fresh()) }
    fn reply(&mut self, reply_cap: CPtr, label: IpcLabel, mrs: &[Word]) {
        self.replies.push((reply_cap, label, mrs.to_vec()));
        self.delete(reply_cap);
    }
    fn flush_icache(&mut self, _frame: CPtr) {
        self.icache_flushes += 1;
    }
}

//  ---  File server  ---

/// In-memory file server. Every request enqueues its completion at
/// once; the server only sees it after a network interrupt.
#[derive(Default)]
pub struct FakeFiles {
    pub fs: HashMap<String, Vec<u8>>,
    handles: Vec<String>,
    pub completions: VecDeque<FileCompletion>,
    /// Cap read/write transfer sizes to exercise the short-I/O paths.
    pub chunk_limit: Option<usize>,
}

impl FakeFiles {
    pub fn new() -> Self { FakeFiles::default() }

    pub fn has_pending(&self) -> bool { !self.completions.is_empty() }

    fn handle_for(&mut self, name: &str) -> FileHandle {
        if let Some(idx) = self.handles.iter().position(|h| h == name) {
            return (idx + 1) as FileHandle;
        }
        self.handles.push(String::from(name));
        self.handles.len() as FileHandle
    }

    fn name_of(&self, fh: FileHandle) -> Option<&String> { self.handles.get(fh as usize - 1) }

    fn attr_of(content: &[u8]) -> FileAttr {
        FileAttr {
            kind: FileKind::Regular,
            mode: 0o7,
            size: content.len() as u64,
            ctime_s: 11,
            atime_s: 22,
        }
    }
}

impl FileServerInterface for FakeFiles {
    fn lookup(&mut self, name: &str, token: CallbackToken) -> Result<(), SosError> {
        let result = match self.fs.get(name) {
            Some(content) => {
                let attr = Self::attr_of(content);
                Ok((self.handle_for(name), attr))
            }
            None => Err(FileError::NotFound),
        };
        self.completions
            .push_back(FileCompletion::Lookup { token, result });
        Ok(())
    }
    fn create(&mut self, name: &str, token: CallbackToken) -> Result<(), SosError> {
        self.fs.insert(String::from(name), Vec::new());
        let fh = self.handle_for(name);
        self.completions.push_back(FileCompletion::Create {
            token,
            result: Ok(fh),
        });
        Ok(())
    }
    fn read(
        &mut self,
        fh: FileHandle,
        offset: u64,
        count: usize,
        token: CallbackToken,
    ) -> Result<(), SosError> {
        let count = self.chunk_limit.map_or(count, |limit| count.min(limit));
        let result = match self.name_of(fh).and_then(|name| self.fs.get(name)) {
            Some(content) => {
                let start = (offset as usize).min(content.len());
                let end = (start + count).min(content.len());
                Ok(content[start..end].to_vec())
            }
            None => Err(FileError::Io),
        };
        self.completions
            .push_back(FileCompletion::Read { token, result });
        Ok(())
    }
    fn write(
        &mut self,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        token: CallbackToken,
    ) -> Result<(), SosError> {
        let n = self.chunk_limit.map_or(data.len(), |limit| data.len().min(limit));
        let result = match self.name_of(fh).cloned() {
            Some(name) => {
                let content = self.fs.get_mut(&name).expect("file vanished");
                let offset = offset as usize;
                if content.len() < offset + n {
                    content.resize(offset + n, 0);
                }
                content[offset..offset + n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(FileError::Io),
        };
        self.completions
            .push_back(FileCompletion::Write { token, result });
        Ok(())
    }
    fn getattr(&mut self, fh: FileHandle, token: CallbackToken) -> Result<(), SosError> {
        let result = match self.name_of(fh).and_then(|name| self.fs.get(name)) {
            Some(content) => Ok(Self::attr_of(content)),
            None => Err(FileError::Io),
        };
        self.completions
            .push_back(FileCompletion::GetAttr { token, result });
        Ok(())
    }
    fn readdir(&mut self, cookie: u64, token: CallbackToken) -> Result<(), SosError> {
        const BATCH: usize = 2;
        let mut names: Vec<String> = self.fs.keys().cloned().collect();
        names.sort();
        let start = cookie as usize;
        let batch: Vec<String> = names.iter().skip(start).take(BATCH).cloned().collect();
        let next = if start + BATCH < names.len() {
            (start + BATCH) as u64
        } else {
            0
        };
        self.completions.push_back(FileCompletion::ReadDir {
            token,
            result: Ok((batch, next)),
        });
        Ok(())
    }
    fn poll(&mut self) -> Option<FileCompletion> { self.completions.pop_front() }
}

//  ---  Serial and timer  ---

#[derive(Default)]
pub struct FakeSerial {
    pub input: VecDeque<u8>,
    pub sent: Vec<u8>,
}

impl SerialInterface for FakeSerial {
    fn send(&mut self, data: &[u8]) -> usize {
        self.sent.extend_from_slice(data);
        data.len()
    }
    fn poll(&mut self) -> Option<u8> { self.input.pop_front() }
}

#[derive(Default)]
pub struct FakeTimer {
    pub now: u64,
    next_id: TimerId,
    pending: Vec<(u64, TimerId, CallbackToken)>,
}

impl FakeTimer {
    pub fn advance(&mut self, dt_us: u64) { self.now += dt_us; }
}

impl TimerInterface for FakeTimer {
    fn timestamp_us(&self) -> u64 { self.now }
    fn oneshot(&mut self, delay_us: u64, token: CallbackToken) -> Result<TimerId, SosError> {
        self.next_id += 1;
        self.pending.push((self.now + delay_us, self.next_id, token));
        Ok(self.next_id)
    }
    fn cancel(&mut self, id: TimerId) {
        self.pending.retain(|&(_, i, _)| i != id);
    }
    fn poll_expired(&mut self) -> Option<CallbackToken> {
        let idx = self.pending.iter().position(|&(deadline, _, _)| deadline <= self.now)?;
        Some(self.pending.swap_remove(idx).2)
    }
}

//  ---  Fixtures  ---

/// Standalone subsystem fixture (no server) for the lower-level module
/// tests.
pub struct Fixture {
    pub kernel: FakeKernel,
    pub untyped: BootUntyped,
    pub frames: FrameTable,
    pub swap: SwapStore,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            kernel: FakeKernel::new(),
            untyped: BootUntyped::new(&[UntypedDesc {
                paddr: 0x4000_0000,
                size_bits: 22,
            }]),
            frames: FrameTable::new(64),
            swap: SwapStore::new(16 * PAGE_SIZE),
        }
    }

    pub fn aspace(&mut self) -> AddressSpace {
        AddressSpace::new(&mut self.frames, &mut self.untyped, &mut self.kernel).unwrap()
    }
}

pub type TestServer = SosServer<FakeKernel, FakeFiles, FakeSerial, FakeTimer>;

pub const TEST_IPC_EP: CPtr = 7;

pub fn make_server_with_frames(frame_capacity: usize) -> TestServer {
    SosServer::new(
        FakeKernel::new(),
        FakeFiles::new(),
        FakeSerial::default(),
        FakeTimer::default(),
        &[UntypedDesc {
            paddr: 0x4000_0000,
            size_bits: 23, // 8M
        }],
        SosConfig {
            frame_capacity,
            swap_file_size: 32 * PAGE_SIZE,
            ipc_ep: TEST_IPC_EP,
        },
    )
}

pub fn make_server() -> TestServer { make_server_with_frames(64) }

//  ---  Drivers  ---

pub fn irq_message(bits: Word) -> IpcMessage {
    IpcMessage::new(IRQ_EP_BADGE | bits, 0, &[])
}

/// Runs the loop until no message, completion or ready continuation
/// remains, injecting network interrupts as the fake file server
/// produces completions.
pub fn pump(server: &mut TestServer) {
    loop {
        if !server.ready.is_empty() || !server.kernel.msgs.is_empty() {
            server.step();
            continue;
        }
        if server.files.has_pending() || !server.serial.input.is_empty() {
            server.kernel.msgs.push_back(irq_message(IRQ_BADGE_NETWORK));
            continue;
        }
        break;
    }
}

pub fn send_syscall(server: &mut TestServer, pid: Pid, args: &[Word]) {
    server
        .kernel
        .msgs
        .push_back(IpcMessage::new(pid, IpcLabel::Syscall.into(), args));
    pump(server);
}

pub fn send_fault(server: &mut TestServer, pid: Pid, addr: usize, write: bool) {
    let fsr = if write { 1 << 11 } else { 0 };
    server.kernel.msgs.push_back(IpcMessage::new(
        pid,
        IpcLabel::VmFault.into(),
        &[0xdead_0000, addr, 0, fsr],
    ));
    pump(server);
}

pub fn tick_clock(server: &mut TestServer, dt_us: u64) {
    server.timer.advance(dt_us);
    server.kernel.msgs.push_back(irq_message(IRQ_BADGE_CLOCK));
    pump(server);
}

/// Message-register image of a string-carrying syscall.
pub fn syscall_with_path(number: Word, arg1: Word, start: usize, path: &str) -> Vec<Word> {
    let mut mrs = [0 as Word; 80];
    mrs[0] = number;
    mrs[1] = arg1;
    let words = msg::write_str(&mut mrs, start, path);
    mrs[..start + words].to_vec()
}

//  ---  Boot image  ---

pub const BOOT_ENTRY: usize = 0x0001_0000;
pub const BOOT_TEXT_OFFSET: usize = 0x200;
pub const BOOT_TEXT_SIZE: usize = 0x4000;

const PF_X: u32 = 1;
const PF_R: u32 = 4;

/// Builds an ELF32 header block for (offset, vaddr, filesz, memsz,
/// flags) segments.
pub fn build_elf(entry: usize, segments: &[(usize, usize, usize, usize, u32)]) -> Vec<u8> {
    let phnum = segments.len();
    let mut image = alloc::vec![0u8; 52 + phnum * 32];
    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 1; // ELFCLASS32
    image[5] = 1; // little-endian
    image[6] = 1; // version
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&40u16.to_le_bytes()); // EM_ARM
    image[24..28].copy_from_slice(&(entry as u32).to_le_bytes());
    image[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
    image[40..42].copy_from_slice(&52u16.to_le_bytes()); // ehsize
    image[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
    image[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());
    for (i, &(offset, vaddr, filesz, memsz, flags)) in segments.iter().enumerate() {
        let ph = 52 + i * 32;
        image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image[ph + 4..ph + 8].copy_from_slice(&(offset as u32).to_le_bytes());
        image[ph + 8..ph + 12].copy_from_slice(&(vaddr as u32).to_le_bytes());
        image[ph + 16..ph + 20].copy_from_slice(&(filesz as u32).to_le_bytes());
        image[ph + 20..ph + 24].copy_from_slice(&(memsz as u32).to_le_bytes());
        image[ph + 24..ph + 28].copy_from_slice(&flags.to_le_bytes());
    }
    image
}

/// Deterministic content byte for position `i` of a binary.
pub fn text_byte(i: usize) -> u8 { (i % 251) as u8 }

/// A complete boot binary: one R+X text segment with patterned
/// contents.
pub fn boot_binary() -> Vec<u8> {
    let mut image = build_elf(
        BOOT_ENTRY,
        &[(BOOT_TEXT_OFFSET, BOOT_ENTRY, BOOT_TEXT_SIZE, BOOT_TEXT_SIZE, PF_R | PF_X)],
    );
    image.resize(BOOT_TEXT_OFFSET + BOOT_TEXT_SIZE, 0);
    for i in 0..BOOT_TEXT_SIZE {
        image[BOOT_TEXT_OFFSET + i] = text_byte(i);
    }
    image
}

/// Boots the standard test image and returns its pid.
pub fn boot(server: &mut TestServer) -> Pid {
    server.files.fs.insert(String::from("sosh"), boot_binary());
    let pid = server.start_initial_process("sosh").unwrap();
    pump(server);
    pid
}

/// Reads `len` client bytes at `vaddr` through the frame window.
pub fn client_bytes(server: &mut TestServer, pid: Pid, vaddr: usize, len: usize) -> Vec<u8> {
    let proc: &Process = server.procs.get(pid).expect("no such process");
    let (frame, offset) = proc
        .addrspace
        .resident_frame(vaddr)
        .expect("page not resident");
    let cap = server.frames.cap_of(frame);
    server.kernel.frame_bytes(cap)[offset..offset + len].to_vec()
}

/// Writes client bytes at `vaddr` through the frame window.
pub fn poke_client_bytes(server: &mut TestServer, pid: Pid, vaddr: usize, data: &[u8]) {
    let proc: &Process = server.procs.get(pid).expect("no such process");
    let (frame, offset) = proc
        .addrspace
        .resident_frame(vaddr)
        .expect("page not resident");
    let cap = server.frames.cap_of(frame);
    server.kernel.frame_bytes(cap)[offset..offset + data.len()].copy_from_slice(data);
}
