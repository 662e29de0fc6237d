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

//! ELF32 program-header walking.
//!
//! Only what process construction needs: the entry point and the
//! loadable segments. The header and program-header table must fit in
//! the first page of the binary, which is all spawn reads.

use log::error;
use smallvec::SmallVec;
use sos_os_common::caps::CapRights;
use sos_os_common::error::SosError;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ElfSegment {
    pub offset: usize,
    pub vaddr: usize,
    pub filesz: usize,
    pub memsz: usize,
    pub rights: CapRights,
}

#[derive(Debug)]
pub struct ElfImage {
    pub entry: usize,
    pub segments: SmallVec<[ElfSegment; 4]>,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn segment_rights(flags: u32) -> CapRights {
    let mut rights = CapRights::empty();
    if flags & (PF_R | PF_X) != 0 {
        rights |= CapRights::READ;
    }
    if flags & PF_W != 0 {
        rights |= CapRights::WRITE;
    }
    if flags & PF_X != 0 {
        rights |= CapRights::EXECUTE;
    }
    rights
}

/// Parses the header page of an ELF32 binary.
pub fn parse(bytes: &[u8]) -> Result<ElfImage, SosError> {
    if bytes.len() < EHDR_SIZE || bytes[0..4] != ELF_MAGIC {
        error!("not an ELF image");
        return Err(SosError::InvalidArgument);
    }
    if bytes[4] != ELFCLASS32 {
        error!("not a 32-bit ELF image");
        return Err(SosError::InvalidArgument);
    }
    let entry = read_u32(bytes, 24) as usize;
    let phoff = read_u32(bytes, 28) as usize;
    let phentsize = read_u16(bytes, 42) as usize;
    let phnum = read_u16(bytes, 44) as usize;

    if phentsize < PHDR_SIZE || phoff + phnum * phentsize > bytes.len() {
        // The whole program-header table must sit in the header page.
        error!("ELF program headers out of bounds");
        return Err(SosError::InvalidArgument);
    }

    let mut segments = SmallVec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(bytes, ph) != PT_LOAD {
            continue;
        }
        let filesz = read_u32(bytes, ph + 16) as usize;
        let memsz = read_u32(bytes, ph + 20) as usize;
        if memsz == 0 {
            continue;
        }
        if filesz > memsz {
            error!("ELF segment file size exceeds memory size");
            return Err(SosError::InvalidArgument);
        }
        segments.push(ElfSegment {
            offset: read_u32(bytes, ph + 4) as usize,
            vaddr: read_u32(bytes, ph + 8) as usize,
            filesz,
            memsz,
            rights: segment_rights(read_u32(bytes, ph + 24)),
        });
    }
    if segments.is_empty() {
        error!("ELF image has no loadable segments");
        return Err(SosError::InvalidArgument);
    }
    Ok(ElfImage { entry, segments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::build_elf;

    #[test]
    fn test_parse_roundtrip() {
        let image = build_elf(
            0x10004,
            &[(0x200, 0x10000, 0x1000, 0x4000, PF_R | PF_X), (0x1200, 0x30000, 0x100, 0x100, PF_R | PF_W)],
        );
        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.entry, 0x10004);
        assert_eq!(parsed.segments.len(), 2);
        let text = &parsed.segments[0];
        assert_eq!(text.offset, 0x200);
        assert_eq!(text.vaddr, 0x10000);
        assert_eq!(text.memsz, 0x4000);
        assert!(text.rights.contains(CapRights::READ | CapRights::EXECUTE));
        assert!(!text.rights.contains(CapRights::WRITE));
        let data = &parsed.segments[1];
        assert!(data.rights.contains(CapRights::READ | CapRights::WRITE));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse(b"not an elf").is_err());
        let mut bogus = build_elf(0x10000, &[(0, 0x10000, 0x100, 0x100, PF_R)]);
        bogus[4] = 2; // 64-bit class
        assert!(parse(&bogus).is_err());
    }

    #[test]
    fn test_rejects_filesz_over_memsz() {
        let image = build_elf(0x10000, &[(0, 0x10000, 0x2000, 0x1000, PF_R)]);
        assert!(parse(&image).is_err());
    }
}
