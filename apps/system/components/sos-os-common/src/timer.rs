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

//! The clock-driver seam. One-shot timeouts carry a `CallbackToken`;
//! expirations are drained from `poll_expired()` on the clock-interrupt
//! path. A timeout whose process died in the interim fires harmlessly:
//! the token check drops it.

use crate::error::SosError;
use crate::CallbackToken;

pub type TimerId = u32;

pub trait TimerInterface {
    /// Microseconds since boot.
    fn timestamp_us(&self) -> u64;

    /// Registers a one-shot timeout `delay_us` from now.
    fn oneshot(&mut self, delay_us: u64, token: CallbackToken) -> Result<TimerId, SosError>;

    /// Cancels a previously registered timeout.
    fn cancel(&mut self, id: TimerId);

    /// Next expired timeout, if any.
    fn poll_expired(&mut self) -> Option<CallbackToken>;
}
