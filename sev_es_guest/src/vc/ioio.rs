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

//! Port I/O: IN, OUT, INS and OUTS.
//!
//! String forms move as many elements as fit into the shared buffer per
//! exit. A REP prefixed instruction that has more elements left is retried.

use bitflags::bitflags;
use iced_x86::{Code, Register};
use snafu::prelude::*;
use x86_64::VirtAddr;

use super::{
    Emulated, Gpr, MemoryAccessSnafu, TrapFrame, UnsupportedSnafu, VcError, VcExitCode,
};
use crate::{
    decoder::DecodedInstruction,
    ghcb::{Ghcb, GhcbSession, SHARED_BUFFER_SIZE},
    platform::{GuestMemory, VcPlatform},
};

bitflags! {
    /// SW_EXIT_INFO_1 for an IOIO exit, as defined for the SVM IOIO intercept.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IoioExitInfo: u64 {
        const TYPE_IN = 1 << 0;
        const STRING = 1 << 2;
        const REP = 1 << 3;
        const DATA_8 = 1 << 4;
        const DATA_16 = 1 << 5;
        const DATA_32 = 1 << 6;
        const ADDRESS_16 = 1 << 7;
        const ADDRESS_32 = 1 << 8;
        const ADDRESS_64 = 1 << 9;
        const _ = !0;
    }
}

const SEGMENT_SHIFT: u64 = 10;
const PORT_SHIFT: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

struct PortAccess {
    direction: Direction,
    /// Element size in bytes.
    size: usize,
    string: bool,
}

fn classify(code: Code) -> Option<PortAccess> {
    use Direction::*;
    let (direction, size, string) = match code {
        Code::In_AL_imm8 | Code::In_AL_DX => (In, 1, false),
        Code::In_AX_imm8 | Code::In_AX_DX => (In, 2, false),
        Code::In_EAX_imm8 | Code::In_EAX_DX => (In, 4, false),
        Code::Out_imm8_AL | Code::Out_DX_AL => (Out, 1, false),
        Code::Out_imm8_AX | Code::Out_DX_AX => (Out, 2, false),
        Code::Out_imm8_EAX | Code::Out_DX_EAX => (Out, 4, false),
        Code::Insb_m8_DX => (In, 1, true),
        Code::Insw_m16_DX => (In, 2, true),
        Code::Insd_m32_DX => (In, 4, true),
        Code::Outsb_DX_m8 => (Out, 1, true),
        Code::Outsw_DX_m16 => (Out, 2, true),
        Code::Outsd_DX_m32 => (Out, 4, true),
        _ => return None,
    };
    Some(PortAccess { direction, size, string })
}

fn segment_number(segment: Register) -> u64 {
    match segment {
        Register::ES => 0,
        Register::CS => 1,
        Register::SS => 2,
        Register::FS => 4,
        Register::GS => 5,
        _ => 3,
    }
}

/// Builds SW_EXIT_INFO_1 for the access.
fn exit_info(
    instruction: &DecodedInstruction,
    access: &PortAccess,
    port: u16,
) -> IoioExitInfo {
    let mut info = IoioExitInfo::from_bits_retain(u64::from(port) << PORT_SHIFT);
    info |= match access.size {
        1 => IoioExitInfo::DATA_8,
        2 => IoioExitInfo::DATA_16,
        _ => IoioExitInfo::DATA_32,
    };
    info |= match instruction.address_size() {
        2 => IoioExitInfo::ADDRESS_16,
        4 => IoioExitInfo::ADDRESS_32,
        _ => IoioExitInfo::ADDRESS_64,
    };
    if access.direction == Direction::In {
        info |= IoioExitInfo::TYPE_IN;
    }
    if access.string {
        info |= IoioExitInfo::STRING;
        let segment = match access.direction {
            // INS always stores through ES.
            Direction::In => Register::ES,
            Direction::Out => instruction.memory_segment(),
        };
        info |= IoioExitInfo::from_bits_retain(segment_number(segment) << SEGMENT_SHIFT);
    }
    if instruction.has_rep_prefix() {
        info |= IoioExitInfo::REP;
    }
    info
}

pub(super) fn emulate<G, P>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
{
    let access = classify(instruction.code())
        .context(UnsupportedSnafu { exit_code: VcExitCode::Ioio as u64 })?;
    let port = match (0..2).find_map(|operand| instruction.immediate(operand)) {
        Some(immediate) => immediate as u16,
        None => frame[Gpr::Rdx] as u16,
    };
    let info = exit_info(instruction, &access, port);

    if access.string {
        string_io(session, frame, instruction, &access, info)
    } else {
        port_io(session, frame, instruction, &access, info)
    }
}

fn port_io<G, P>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
    access: &PortAccess,
    info: IoioExitInfo,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
{
    let mask = u64::MAX >> (64 - 8 * access.size);
    let value = match access.direction {
        Direction::Out => frame[Gpr::Rax] & mask,
        Direction::In => 0,
    };
    session.ghcb().set_rax(value);
    session.exit(VcExitCode::Ioio as u64, info.bits(), 0)?;

    if access.direction == Direction::In {
        let rax = session.ghcb().valid_rax().context(super::VmmSnafu)?;
        // The destination is the first operand: AL, AX or EAX.
        let destination = instruction
            .register_operand(0)
            .context(UnsupportedSnafu { exit_code: VcExitCode::Ioio as u64 })?;
        frame
            .write_register(destination, rax & mask)
            .context(UnsupportedSnafu { exit_code: VcExitCode::Ioio as u64 })?;
    }
    Ok(Emulated::Complete)
}

/// Address of element `index` of a string starting at `start`, wrapped to the
/// address size.
fn element_address(start: u64, index: usize, size: usize, backwards: bool, mask: u64) -> u64 {
    let offset = (index * size) as u64;
    let address = if backwards { start.wrapping_sub(offset) } else { start.wrapping_add(offset) };
    address & mask
}

/// Stores `value` into RCX, RSI or RDI the way an `address_size` wide write
/// does: 32-bit writes clear the upper half, 16-bit writes keep it.
fn update_counter(old: u64, value: u64, address_size: usize) -> u64 {
    match address_size {
        2 => (old & !0xFFFF) | (value & 0xFFFF),
        4 => value & 0xFFFF_FFFF,
        _ => value,
    }
}

fn guest_address(address: u64) -> Result<VirtAddr, VcError> {
    VirtAddr::try_new(address).ok().context(MemoryAccessSnafu { address })
}

fn string_io<G, P>(
    session: &mut GhcbSession<'_, G, P>,
    frame: &mut TrapFrame,
    instruction: &DecodedInstruction,
    access: &PortAccess,
    info: IoioExitInfo,
) -> Result<Emulated, VcError>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: VcPlatform,
{
    let rep = instruction.has_rep_prefix();
    let address_size = instruction.address_size();
    let mask = u64::MAX >> (64 - 8 * address_size);
    let requested = if rep { frame[Gpr::Rcx] & mask } else { 1 };
    let count = requested.min((SHARED_BUFFER_SIZE / access.size) as u64) as usize;
    if count == 0 {
        return Ok(Emulated::Complete);
    }
    let size = access.size;
    let source = frame[Gpr::Rsi] & mask;
    let destination = frame[Gpr::Rdi] & mask;
    let backwards = frame.direction_flag();
    let scratch = session.shared_buffer_gpa();

    if access.direction == Direction::Out {
        let (ghcb, platform) = session.split();
        for index in 0..count {
            let address = element_address(source, index, size, backwards, mask);
            let element = &mut ghcb.shared_buffer[index * size..(index + 1) * size];
            ensure!(
                platform.read(guest_address(address)?, element) == size,
                MemoryAccessSnafu { address }
            );
        }
    }

    session.ghcb().set_sw_scratch(scratch);
    session.exit(VcExitCode::Ioio as u64, info.bits(), count as u64)?;

    let (index_register, start) = match access.direction {
        Direction::In => {
            let (ghcb, platform) = session.split();
            for index in 0..count {
                let address = element_address(destination, index, size, backwards, mask);
                let element = &ghcb.shared_buffer[index * size..(index + 1) * size];
                ensure!(
                    platform.write(guest_address(address)?, element) == size,
                    MemoryAccessSnafu { address }
                );
            }
            (Gpr::Rdi, destination)
        }
        Direction::Out => (Gpr::Rsi, source),
    };
    frame[index_register] = update_counter(
        frame[index_register],
        element_address(start, count, size, backwards, mask),
        address_size,
    );

    if rep {
        let remaining = requested - count as u64;
        frame[Gpr::Rcx] = update_counter(frame[Gpr::Rcx], remaining, address_size);
        if remaining != 0 {
            return Ok(Emulated::Retry);
        }
    }
    Ok(Emulated::Complete)
}
