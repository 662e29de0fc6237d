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

//! The serial-device seam. Output is synchronous; input bytes are
//! buffered by the driver and drained from `poll()` on the interrupt
//! path.

pub trait SerialInterface {
    /// Sends `data`, returning the number of bytes accepted.
    fn send(&mut self, data: &[u8]) -> usize;

    /// Next received byte, if any.
    fn poll(&mut self) -> Option<u8>;
}
