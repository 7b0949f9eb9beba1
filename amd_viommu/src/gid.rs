//
// Copyright 2022 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//


//! Allocation of guest IDs.

use hashbrown::HashMap;
use spinning_top::Spinlock;
#[cfg(not(test))]
use x86_64::instructions::interrupts::without_interrupts;

use crate::error::ViommuError;

#[cfg(test)]
std::thread_local! {
    static MASKED: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

/// CLI faults in user mode, so unit tests only record the nesting depth.
#[cfg(test)]
fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    MASKED.with(|depth| depth.set(depth.get() + 1));
    let result = f();
    MASKED.with(|depth| depth.set(depth.get() - 1));
    result
}

#[cfg(test)]
fn masked_depth() -> usize {
    MASKED.with(|depth| depth.get())
}

/// Number of probes after which allocation gives up; every 16-bit value has
/// been visited by then.
const MAX_PROBES: u32 = 1 << 16;

struct GidIndex<T> {
    next: u16,
    wrapped: bool,
    entries: HashMap<u16, T>,
}

/// Hands out unique, non-zero guest IDs and keeps the record of every live
/// GID.
///
/// IDs are handed out in increasing order. Once the counter has wrapped
/// around, IDs that are still live are skipped.
///
/// The index is only locked with interrupts masked on the current CPU, so an
/// interrupt handler that reaches the allocator can't spin on its own CPU.
pub struct GidAllocator<T> {
    index: Spinlock<GidIndex<T>>,
}

impl<T> Default for GidAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GidAllocator<T> {
    pub fn new() -> Self {
        Self {
            index: Spinlock::new(GidIndex { next: 0, wrapped: false, entries: HashMap::new() }),
        }
    }

    /// Allocates a GID and stores `record` under it.
    pub fn allocate(&self, record: T) -> Result<u16, ViommuError> {
        without_interrupts(|| {
            let mut index = self.index.lock();
            for _ in 0..MAX_PROBES {
                index.next = index.next.wrapping_add(1);
                let gid = index.next;
                // GID 0 is never handed out.
                if gid == 0 {
                    index.wrapped = true;
                    continue;
                }
                if index.wrapped && index.entries.contains_key(&gid) {
                    continue;
                }
                log::debug!("allocated GID {gid}");
                index.entries.insert(gid, record);
                return Ok(gid);
            }
            Err(ViommuError::GidExhausted)
        })
    }

    /// Releases `gid`, returning its record.
    pub fn free(&self, gid: u16) -> Option<T> {
        log::debug!("freeing GID {gid}");
        without_interrupts(|| self.index.lock().entries.remove(&gid))
    }

    /// Runs `f` on the record of `gid` with the index locked.
    pub fn with<R>(&self, gid: u16, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let result = without_interrupts(|| self.index.lock().entries.get_mut(&gid).map(f));
        if result.is_none() {
            log::warn!("GID {gid} not found");
        }
        result
    }

    pub fn contains(&self, gid: u16) -> bool {
        without_interrupts(|| self.index.lock().entries.contains_key(&gid))
    }

    pub fn len(&self) -> usize {
        without_interrupts(|| self.index.lock().entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
