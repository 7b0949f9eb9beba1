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

//! RDTSC, RDTSCP, CPUID, RDMSR and WRMSR.

use iced_x86::Code;
use snafu::prelude::*;

use super::{Emulated, Gpr, TrapFrame, UnsupportedSnafu, VcError, VcExitCode, VmmSnafu};
use crate::{
    decoder::DecodedInstruction,
    ghcb::{Ghcb, GhcbSession},
    platform::VcPlatform,
};

const LOW_HALF: u64 = 0xFFFF_FFFF;

fn expect_code(
    instruction: &DecodedInstruction,
    code: Code,
    exit: VcExitCode,
) -> Result<(), VcError> {
    ensure!(instruction.code() == code, UnsupportedSnafu { exit_code: exit as u64 });
    Ok(())
}

pub(super) fn rdtsc<G, P>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
    exit: VcExitCode,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
{
    let rdtscp = exit == VcExitCode::Rdtscp;
    expect_code(instruction, if rdtscp { Code::Rdtscp } else { Code::Rdtsc }, exit)?;

    session.exit(exit as u64, 0, 0)?;

    let ghcb = session.ghcb();
    let rax = ghcb.valid_rax().context(VmmSnafu)?;
    let rdx = ghcb.valid_rdx().context(VmmSnafu)?;
    if rdtscp {
        frame[Gpr::Rcx] = ghcb.valid_rcx().context(VmmSnafu)? & LOW_HALF;
    }
    frame[Gpr::Rax] = rax & LOW_HALF;
    frame[Gpr::Rdx] = rdx & LOW_HALF;
    Ok(Emulated::Complete)
}

pub(super) fn cpuid<G, P>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
{
    expect_code(instruction, Code::Cpuid, VcExitCode::Cpuid)?;

    let ghcb = session.ghcb();
    ghcb.set_rax(frame[Gpr::Rax]);
    ghcb.set_rcx(frame[Gpr::Rcx]);
    ghcb.set_xcr0(frame.xcr0);
    session.exit(VcExitCode::Cpuid as u64, 0, 0)?;

    let ghcb = session.ghcb();
    let eax = ghcb.valid_rax().context(VmmSnafu)?;
    let ebx = ghcb.valid_rbx().context(VmmSnafu)?;
    let ecx = ghcb.valid_rcx().context(VmmSnafu)?;
    let edx = ghcb.valid_rdx().context(VmmSnafu)?;
    frame[Gpr::Rax] = eax & LOW_HALF;
    frame[Gpr::Rbx] = ebx & LOW_HALF;
    frame[Gpr::Rcx] = ecx & LOW_HALF;
    frame[Gpr::Rdx] = edx & LOW_HALF;
    Ok(Emulated::Complete)
}

pub(super) fn msr<G, P>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
{
    let exit_code = VcExitCode::Msr as u64;
    match instruction.code() {
        Code::Rdmsr => {
            session.ghcb().set_rcx(frame[Gpr::Rcx] & LOW_HALF);
            session.exit(exit_code, 0, 0)?;

            let ghcb = session.ghcb();
            let rax = ghcb.valid_rax().context(VmmSnafu)?;
            let rdx = ghcb.valid_rdx().context(VmmSnafu)?;
            frame[Gpr::Rax] = rax & LOW_HALF;
            frame[Gpr::Rdx] = rdx & LOW_HALF;
        }
        Code::Wrmsr => {
            let ghcb = session.ghcb();
            ghcb.set_rcx(frame[Gpr::Rcx] & LOW_HALF);
            ghcb.set_rax(frame[Gpr::Rax] & LOW_HALF);
            ghcb.set_rdx(frame[Gpr::Rdx] & LOW_HALF);
            session.exit(exit_code, 1, 0)?;
        }
        _ => return UnsupportedSnafu { exit_code }.fail(),
    }
    Ok(Emulated::Complete)
}
