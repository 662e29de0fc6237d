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

//! The remote file-server seam.
//!
//! Every call is an asynchronous RPC: it is issued and returns
//! immediately; the result arrives later as a `FileCompletion` drained
//! from `poll()` on the network-interrupt path. Requests carry a
//! `CallbackToken` so completions for recycled pids can be discarded.

use crate::error::SosError;
use crate::CallbackToken;
use alloc::string::String;
use alloc::vec::Vec;

/// Opaque remote file handle.
pub type FileHandle = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Regular,
    Special,
}

#[derive(Clone, Copy, Debug)]
pub struct FileAttr {
    pub kind: FileKind,
    pub mode: u32,
    pub size: u64,
    pub ctime_s: u32,
    pub atime_s: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileError {
    NotFound,
    Io,
}

impl From<FileError> for SosError {
    fn from(err: FileError) -> SosError {
        match err {
            FileError::NotFound => SosError::NotFound,
            FileError::Io => SosError::RemoteIoFailure,
        }
    }
}

/// A completed RPC, tagged with the token of the request that issued it.
#[derive(Debug)]
pub enum FileCompletion {
    Lookup {
        token: CallbackToken,
        result: Result<(FileHandle, FileAttr), FileError>,
    },
    Create {
        token: CallbackToken,
        result: Result<FileHandle, FileError>,
    },
    Read {
        token: CallbackToken,
        result: Result<Vec<u8>, FileError>,
    },
    Write {
        token: CallbackToken,
        result: Result<usize, FileError>,
    },
    GetAttr {
        token: CallbackToken,
        result: Result<FileAttr, FileError>,
    },
    ReadDir {
        token: CallbackToken,
        result: Result<(Vec<String>, u64), FileError>,
    },
}

impl FileCompletion {
    pub fn token(&self) -> CallbackToken {
        match self {
            FileCompletion::Lookup { token, .. }
            | FileCompletion::Create { token, .. }
            | FileCompletion::Read { token, .. }
            | FileCompletion::Write { token, .. }
            | FileCompletion::GetAttr { token, .. }
            | FileCompletion::ReadDir { token, .. } => *token,
        }
    }
}

pub trait FileServerInterface {
    fn lookup(&mut self, name: &str, token: CallbackToken) -> Result<(), SosError>;
    fn create(&mut self, name: &str, token: CallbackToken) -> Result<(), SosError>;
    fn read(
        &mut self,
        fh: FileHandle,
        offset: u64,
        count: usize,
        token: CallbackToken,
    ) -> Result<(), SosError>;
    fn write(
        &mut self,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        token: CallbackToken,
    ) -> Result<(), SosError>;
    fn getattr(&mut self, fh: FileHandle, token: CallbackToken) -> Result<(), SosError>;
    fn readdir(&mut self, cookie: u64, token: CallbackToken) -> Result<(), SosError>;

    /// Next pending completion, if any. Drained after each network
    /// interrupt.
    fn poll(&mut self) -> Option<FileCompletion>;
}
