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

//! MMIO accesses that hit a nested page fault.
//!
//! Only the MOV, MOVZX and MOVSX forms that compilers emit for volatile
//! register accesses are supported.

use iced_x86::{Code, Register};
use snafu::prelude::*;
use x86_64::VirtAddr;

use super::{
    Emulated, MemoryAccessSnafu, TrapFrame, UnsupportedSnafu, VcError, VcExitCode,
};
use crate::{
    decoder::DecodedInstruction,
    ghcb::{Ghcb, GhcbSession, SW_EXIT_CODE_MMIO_READ, SW_EXIT_CODE_MMIO_WRITE},
    platform::VcPlatform,
    Translator,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Register,
    Immediate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Extension {
    /// Plain MOV into a register of the access width.
    None,
    Zero,
    Sign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MmioAccess {
    Write { bytes: usize, source: Source },
    Read { bytes: usize, extension: Extension },
}

fn classify(code: Code) -> Option<MmioAccess> {
    use MmioAccess::*;
    Some(match code {
        Code::Mov_rm8_r8 => Write { bytes: 1, source: Source::Register },
        Code::Mov_rm16_r16 => Write { bytes: 2, source: Source::Register },
        Code::Mov_rm32_r32 => Write { bytes: 4, source: Source::Register },
        Code::Mov_rm64_r64 => Write { bytes: 8, source: Source::Register },
        Code::Mov_rm8_imm8 => Write { bytes: 1, source: Source::Immediate },
        Code::Mov_rm16_imm16 => Write { bytes: 2, source: Source::Immediate },
        Code::Mov_rm32_imm32 => Write { bytes: 4, source: Source::Immediate },
        Code::Mov_rm64_imm32 => Write { bytes: 8, source: Source::Immediate },
        Code::Mov_r8_rm8 => Read { bytes: 1, extension: Extension::None },
        Code::Mov_r16_rm16 => Read { bytes: 2, extension: Extension::None },
        Code::Mov_r32_rm32 => Read { bytes: 4, extension: Extension::None },
        Code::Mov_r64_rm64 => Read { bytes: 8, extension: Extension::None },
        Code::Movzx_r16_rm8 | Code::Movzx_r32_rm8 | Code::Movzx_r64_rm8 => {
            Read { bytes: 1, extension: Extension::Zero }
        }
        Code::Movzx_r16_rm16 | Code::Movzx_r32_rm16 | Code::Movzx_r64_rm16 => {
            Read { bytes: 2, extension: Extension::Zero }
        }
        Code::Movsx_r16_rm8 | Code::Movsx_r32_rm8 | Code::Movsx_r64_rm8 => {
            Read { bytes: 1, extension: Extension::Sign }
        }
        Code::Movsx_r16_rm16 | Code::Movsx_r32_rm16 | Code::Movsx_r64_rm16 => {
            Read { bytes: 2, extension: Extension::Sign }
        }
        _ => return None,
    })
}

fn sign_extend(value: u64, bytes: usize) -> u64 {
    let shift = 64 - 8 * bytes as u32;
    (((value << shift) as i64) >> shift) as u64
}

pub(super) fn emulate<G, P, T>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
    translate: &T,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
    T: Translator,
{
    let unsupported = UnsupportedSnafu { exit_code: VcExitCode::NestedPageFault as u64 };
    let access = classify(instruction.code()).context(unsupported)?;
    // Register-direct forms never touch memory.
    let memory = instruction.memory_operand().context(unsupported)?;
    // The other operand of a two operand MOV.
    let other = 1 - memory;

    let address = instruction
        .effective_address(memory, |register| frame.register_value(register))
        .context(unsupported)?;
    let physical = VirtAddr::try_new(address)
        .ok()
        .and_then(|address| translate(address))
        .context(MemoryAccessSnafu { address })?
        .as_u64();
    let scratch = session.shared_buffer_gpa();

    match access {
        MmioAccess::Write { bytes, source } => {
            let value = match source {
                Source::Register => instruction
                    .register_operand(other)
                    .and_then(|register| frame.read_register(register)),
                Source::Immediate => instruction.immediate(other),
            }
            .context(unsupported)?;

            let ghcb = session.ghcb();
            ghcb.shared_buffer[..bytes].copy_from_slice(&value.to_le_bytes()[..bytes]);
            ghcb.set_sw_scratch(scratch);
            session.exit(SW_EXIT_CODE_MMIO_WRITE, physical, bytes as u64)?;
        }
        MmioAccess::Read { bytes, extension } => {
            let destination: Register = instruction.register_operand(other).context(unsupported)?;

            session.ghcb().set_sw_scratch(scratch);
            session.exit(SW_EXIT_CODE_MMIO_READ, physical, bytes as u64)?;

            let mut data = [0u8; 8];
            data[..bytes].copy_from_slice(&session.ghcb().shared_buffer[..bytes]);
            let value = u64::from_le_bytes(data);
            let value = match extension {
                Extension::Sign => sign_extend(value, bytes),
                Extension::None | Extension::Zero => value,
            };
            frame.write_register(destination, value).context(unsupported)?;
        }
    }
    Ok(Emulated::Complete)
}
