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

//! Interfaces to the processor and to the surrounding kernel.
//!
//! The protocol logic in this crate only talks to the machine through these
//! traits. The `Vmgexit`, `InterruptGuard`, `DirectMemory` and `Pvalidate`
//! types implement them on real hardware.

use snafu::prelude::*;
use x86_64::{
    instructions::interrupts,
    structures::paging::{Page, PhysFrame, Size4KiB},
    VirtAddr,
};

use crate::{
    ghcb::Ghcb,
    instructions::{pvalidate, InstructionError, PageSize, Validation},
    msr::{
        read_protocol_msr, request_termination, write_protocol_msr_and_exit, GhcbGpa,
        TerminationRequest,
    },
};

/// Access to the hypervisor through the GHCB MSR and VMGEXIT.
pub trait Hypervisor {
    /// Writes `request` to the GHCB MSR, exits to the hypervisor and returns
    /// the value of the GHCB MSR after the guest is resumed.
    fn msr_exchange(&mut self, request: u64) -> u64;

    /// Points the GHCB MSR at the GHCB page and exits to the hypervisor. The
    /// response is in `ghcb` when this returns.
    fn ghcb_exit(&mut self, ghcb: &mut Ghcb, gpa: GhcbGpa);

    /// Asks the hypervisor to terminate the guest.
    fn terminate(&mut self, request: TerminationRequest) -> !;
}

/// Masks interrupts and preemption on the current CPU.
pub trait CriticalSection {
    /// State needed to undo `enter`.
    type Token;

    fn enter(&self) -> Self::Token;

    fn exit(&self, token: Self::Token);
}

/// Access to guest-virtual memory for instruction fetch and string I/O.
pub trait GuestMemory {
    /// Copies up to `buffer.len()` bytes starting at `address` and returns the
    /// number of bytes copied.
    fn read(&self, address: VirtAddr, buffer: &mut [u8]) -> usize;

    /// Copies `data` to `address` and returns the number of bytes copied.
    fn write(&mut self, address: VirtAddr, data: &[u8]) -> usize;
}

#[derive(Debug, PartialEq, Snafu)]
pub enum MappingError {
    #[snafu(display("could not change the mapping of page {address:#x}"))]
    MappingFailed { address: u64 },
}

/// Changes the encryption attribute and presence of kernel mappings.
pub trait PageEncryption {
    /// Maps the page without the encryption bit so the hypervisor can read it.
    fn set_decrypted(&mut self, page: Page<Size4KiB>) -> Result<(), MappingError>;

    /// Maps the page with the encryption bit set.
    fn set_encrypted(&mut self, page: Page<Size4KiB>) -> Result<(), MappingError>;

    /// Removes the mapping of the page.
    fn unmap(&mut self, page: Page<Size4KiB>) -> Result<(), MappingError>;
}

/// Changes the validated state of a page in the RMP.
pub trait PageValidator {
    fn pvalidate(
        &mut self,
        frame: PhysFrame<Size4KiB>,
        validation: Validation,
    ) -> Result<(), InstructionError>;
}

/// Everything the #VC handler needs while a GHCB exchange is in progress.
pub trait VcPlatform: Hypervisor + CriticalSection + GuestMemory {}
impl<P: Hypervisor + CriticalSection + GuestMemory> VcPlatform for P {}

/// The hypervisor reached through the real GHCB MSR.
#[derive(Clone, Copy, Debug, Default)]
pub struct Vmgexit;

impl Hypervisor for Vmgexit {
    fn msr_exchange(&mut self, request: u64) -> u64 {
        write_protocol_msr_and_exit(request);
        read_protocol_msr()
    }

    fn ghcb_exit(&mut self, _ghcb: &mut Ghcb, gpa: GhcbGpa) {
        write_protocol_msr_and_exit(gpa.into());
    }

    fn terminate(&mut self, request: TerminationRequest) -> ! {
        request_termination(request)
    }
}

/// Disables interrupts on the current CPU.
///
/// Code that runs under this crate is not preemptible while interrupts are
/// disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterruptGuard;

impl CriticalSection for InterruptGuard {
    type Token = bool;

    fn enter(&self) -> bool {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled
    }

    fn exit(&self, was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }
}

/// Accesses guest memory directly through the current address space.
#[derive(Debug)]
pub struct DirectMemory {
    _private: (),
}

impl DirectMemory {
    /// # Safety
    ///
    /// Every address handed to `read` and `write` must be mapped, and writes
    /// must not alias memory that Rust code holds references to.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl GuestMemory for DirectMemory {
    fn read(&self, address: VirtAddr, buffer: &mut [u8]) -> usize {
        // Safety: the constructor requires that guest addresses are mapped.
        unsafe {
            core::ptr::copy_nonoverlapping(address.as_ptr::<u8>(), buffer.as_mut_ptr(), buffer.len())
        };
        buffer.len()
    }

    fn write(&mut self, address: VirtAddr, data: &[u8]) -> usize {
        // Safety: the constructor requires that guest addresses are mapped.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), address.as_mut_ptr::<u8>(), data.len()) };
        data.len()
    }
}

/// Validates pages with the PVALIDATE instruction.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pvalidate;

impl PageValidator for Pvalidate {
    fn pvalidate(
        &mut self,
        frame: PhysFrame<Size4KiB>,
        validation: Validation,
    ) -> Result<(), InstructionError> {
        pvalidate(frame.start_address().as_u64() as usize, PageSize::Page4KiB, validation)
    }
}
