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

//! Emulation of the instructions that raise #VC.
//!
//! A trap is handled in three steps: the instruction at RIP is copied out of
//! guest memory and decoded, a handler is picked based on the exit code, and
//! the handler performs the GHCB exchange and writes the result back into the
//! [`TrapFrame`].

use snafu::prelude::*;
use strum::FromRepr;
use x86_64::VirtAddr;

use crate::{
    decoder::{decode, DecodeError, DecodedInstruction, MAX_INSTRUCTION_LENGTH},
    event::EventInjection,
    ghcb::{Ghcb, GhcbSession},
    platform::{GuestMemory, VcPlatform},
    Translator,
};

mod context;
mod cpu;
mod ioio;
mod mmio;

pub use context::{Gpr, TrapFrame, RFLAGS_DF};

/// The #VC error codes this crate knows how to emulate.
///
/// See Appendix C of <https://www.amd.com/system/files/TechDocs/24593.pdf>.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u64)]
pub enum VcExitCode {
    Rdtsc = 0x6E,
    Cpuid = 0x72,
    Ioio = 0x7B,
    Msr = 0x7C,
    Rdtscp = 0x87,
    NestedPageFault = 0x400,
}

/// The result of a successfully emulated trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Emulated {
    /// The instruction is done and RIP was moved past it.
    Complete,
    /// RIP was left alone so the instruction runs, and traps, again.
    Retry,
}

#[derive(Debug, PartialEq, Snafu)]
pub enum VcError {
    #[snafu(display("couldn't decode the faulting instruction"))]
    DecodeFailed { source: DecodeError },
    #[snafu(display("exit code {exit_code:#x} can't be emulated"))]
    Unsupported { exit_code: u64 },
    #[snafu(display("the hypervisor didn't return the expected registers"))]
    VmmError,
    #[snafu(display("couldn't access guest memory at {address:#x}"))]
    MemoryAccess { address: u64 },
    #[snafu(display("the hypervisor requested exception {event:?}"))]
    Exception { event: EventInjection },
}

impl From<EventInjection> for VcError {
    fn from(event: EventInjection) -> Self {
        VcError::Exception { event }
    }
}

fn fetch<M: GuestMemory>(memory: &M, rip: u64) -> Result<DecodedInstruction, VcError> {
    let address = VirtAddr::try_new(rip).ok().context(MemoryAccessSnafu { address: rip })?;
    let mut buffer = [0u8; MAX_INSTRUCTION_LENGTH];
    let copied = memory.read(address, &mut buffer);
    ensure!(copied > 0, MemoryAccessSnafu { address: rip });
    decode(&buffer[..copied], rip).context(DecodeFailedSnafu)
}

/// Emulates the instruction that raised #VC with `exit_code`.
///
/// The session must have been started on the trapping CPU's GHCB. On
/// [`Emulated::Complete`] RIP in `frame` has been advanced past the
/// instruction.
pub fn emulate<G, P, T>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    exit_code: u64,
    translate: &T,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
    T: Translator,
{
    let instruction = fetch(&*session.platform(), frame.rip)?;
    let exit = VcExitCode::from_repr(exit_code).context(UnsupportedSnafu { exit_code })?;

    let outcome = match exit {
        VcExitCode::Rdtsc | VcExitCode::Rdtscp => cpu::rdtsc(session, frame, &instruction, exit)?,
        VcExitCode::Cpuid => cpu::cpuid(session, frame, &instruction)?,
        VcExitCode::Msr => cpu::msr(session, frame, &instruction)?,
        VcExitCode::Ioio => ioio::emulate(session, frame, &instruction)?,
        VcExitCode::NestedPageFault => mmio::emulate(session, frame, &instruction, translate)?,
    };

    log::debug!("emulated {:?} at {:#x}: {:?}", exit, frame.rip, outcome);
    if outcome == Emulated::Complete {
        frame.rip = frame.rip.wrapping_add(instruction.len() as u64);
    }
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        ghcb::tests::{channel, identity},
        platform::testing::FakePlatform,
    };

    /// Where tests place the trapping instruction.
    pub(crate) const RIP: u64 = 0x10_0000;

    pub(crate) fn frame() -> TrapFrame {
        TrapFrame { rip: RIP, xcr0: 1, ..Default::default() }
    }

    /// Runs a single trap for the instruction `bytes` on a fresh GHCB.
    pub(crate) fn run(
        platform: &mut FakePlatform,
        frame: &mut TrapFrame,
        bytes: &[u8],
        exit_code: VcExitCode,
    ) -> Result<Emulated, VcError> {
        platform.load(frame.rip, bytes);
        let mut channel = channel();
        let mut session = channel.start(platform);
        emulate(&mut session, frame, exit_code as u64, &identity)
    }
}
