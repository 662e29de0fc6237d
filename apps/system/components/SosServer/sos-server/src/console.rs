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

//! Console line buffering.
//!
//! Input bytes accumulate until a newline (or a full buffer) and are
//! then delivered to the single console reader. Undelivered bytes stay
//! buffered for the next read.

use sos_os_common::Pid;

pub const SERIAL_BUF_SIZE: usize = 1024;

pub struct Console {
    line_buf: [u8; SERIAL_BUF_SIZE],
    len: usize,
    /// At most one process may hold the console open for reading.
    pub reader: Option<Pid>,
}

impl Console {
    pub fn new() -> Self {
        Console {
            line_buf: [0; SERIAL_BUF_SIZE],
            len: 0,
            reader: None,
        }
    }

    /// Buffers one byte; true when the buffered data should be flushed
    /// to the reader.
    pub fn push(&mut self, byte: u8) -> bool {
        self.line_buf[self.len] = byte;
        self.len += 1;
        byte == b'\n' || self.len == SERIAL_BUF_SIZE
    }

    pub fn data(&self) -> &[u8] { &self.line_buf[..self.len] }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Drops the first `n` delivered bytes, compacting the remainder.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.line_buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}
