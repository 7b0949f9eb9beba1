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

//! Thin wrapper around the iced-x86 decoder exposing the parts of an
//! instruction the #VC handlers need.

use iced_x86::{Code, CodeSize, Decoder, DecoderOptions, Instruction, OpKind, Register};
use snafu::prelude::*;

/// The longest valid x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

#[derive(Debug, PartialEq, Snafu)]
pub enum DecodeError {
    #[snafu(display("invalid or truncated instruction at {rip:#x}"))]
    InvalidInstruction { rip: u64 },
}

/// A decoded 64-bit mode instruction.
#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    instruction: Instruction,
}

/// Decodes the first instruction in `bytes`, which were fetched from `rip`.
pub fn decode(bytes: &[u8], rip: u64) -> Result<DecodedInstruction, DecodeError> {
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    let instruction = decoder.decode();
    ensure!(!instruction.is_invalid(), InvalidInstructionSnafu { rip });
    Ok(DecodedInstruction { instruction })
}

impl DecodedInstruction {
    /// Length of the instruction in bytes.
    pub fn len(&self) -> usize {
        self.instruction.len()
    }

    pub fn code(&self) -> Code {
        self.instruction.code()
    }

    pub fn has_rep_prefix(&self) -> bool {
        self.instruction.has_rep_prefix()
    }

    /// Index of the memory operand, `None` for register-direct forms.
    pub fn memory_operand(&self) -> Option<u32> {
        (0..self.instruction.op_count()).find(|&i| self.instruction.op_kind(i) == OpKind::Memory)
    }

    pub fn register_operand(&self, operand: u32) -> Option<Register> {
        (operand < self.instruction.op_count()
            && self.instruction.op_kind(operand) == OpKind::Register)
            .then(|| self.instruction.op_register(operand))
    }

    /// The immediate of `operand`, sign-extended the way the instruction does.
    pub fn immediate(&self, operand: u32) -> Option<u64> {
        if operand >= self.instruction.op_count() {
            return None;
        }
        match self.instruction.op_kind(operand) {
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Some(self.instruction.immediate(operand)),
            _ => None,
        }
    }

    /// The segment used by the memory operand, including overrides.
    pub fn memory_segment(&self) -> Register {
        self.instruction.memory_segment()
    }

    /// Address size in bytes.
    pub fn address_size(&self) -> usize {
        let instruction = &self.instruction;
        for operand in 0..instruction.op_count() {
            match instruction.op_kind(operand) {
                OpKind::MemorySegSI | OpKind::MemorySegDI | OpKind::MemoryESDI => return 2,
                OpKind::MemorySegESI | OpKind::MemorySegEDI | OpKind::MemoryESEDI => return 4,
                OpKind::MemorySegRSI | OpKind::MemorySegRDI | OpKind::MemoryESRDI => return 8,
                _ => {}
            }
        }
        if instruction.memory_base() != Register::None {
            instruction.memory_base().size()
        } else if instruction.memory_index() != Register::None {
            instruction.memory_index().size()
        } else {
            match instruction.code_size() {
                CodeSize::Code32 => 4,
                CodeSize::Code16 => 2,
                CodeSize::Code64 | CodeSize::Unknown => 8,
            }
        }
    }

    /// Computes the linear address of the memory operand `operand`.
    ///
    /// `register_value` supplies general purpose registers and segment bases.
    /// RIP-relative operands are resolved by the decoder.
    pub fn effective_address<F>(&self, operand: u32, mut register_value: F) -> Option<u64>
    where
        F: FnMut(Register) -> Option<u64>,
    {
        self.instruction.virtual_address(operand, 0, |register, _, _| register_value(register))
    }
}
