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

use core::ops::{Index, IndexMut};

use iced_x86::Register;
use strum::FromRepr;

/// The direction flag in RFLAGS.
pub const RFLAGS_DF: u64 = 1 << 10;

/// General purpose registers, in the order of their instruction encoding.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(usize)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Guest state captured by the #VC entry point.
///
/// The handlers update it in place; the entry point restores it when the
/// trap returns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    /// XCR0 at the time of the trap, or 1 if XSAVE is not enabled.
    pub xcr0: u64,
}

impl Index<Gpr> for TrapFrame {
    type Output = u64;

    fn index(&self, register: Gpr) -> &u64 {
        &self.gprs[register as usize]
    }
}

impl IndexMut<Gpr> for TrapFrame {
    fn index_mut(&mut self, register: Gpr) -> &mut u64 {
        &mut self.gprs[register as usize]
    }
}

fn is_high_byte(register: Register) -> bool {
    matches!(register, Register::AH | Register::CH | Register::DH | Register::BH)
}

impl TrapFrame {
    fn slot(register: Register) -> Option<Gpr> {
        if !register.is_gpr() {
            return None;
        }
        Gpr::from_repr(register.full_register().number())
    }

    /// Reads a general purpose register of any width.
    pub fn read_register(&self, register: Register) -> Option<u64> {
        let value = self[Self::slot(register)?];
        Some(match register.size() {
            1 if is_high_byte(register) => (value >> 8) & 0xFF,
            1 => value & 0xFF,
            2 => value & 0xFFFF,
            4 => value & 0xFFFF_FFFF,
            _ => value,
        })
    }

    /// Writes a general purpose register the way a MOV to it would.
    ///
    /// 32-bit writes clear the upper half. 8 and 16-bit writes keep the
    /// remaining bits.
    pub fn write_register(&mut self, register: Register, value: u64) -> Option<()> {
        let slot = &mut self[Self::slot(register)?];
        *slot = match register.size() {
            1 if is_high_byte(register) => (*slot & !0xFF00) | ((value & 0xFF) << 8),
            1 => (*slot & !0xFF) | (value & 0xFF),
            2 => (*slot & !0xFFFF) | (value & 0xFFFF),
            4 => value & 0xFFFF_FFFF,
            _ => value,
        };
        Some(())
    }

    /// Base of a segment in 64-bit mode. Only FS and GS have one.
    pub fn segment_base(&self, segment: Register) -> u64 {
        match segment {
            Register::FS => self.fs_base,
            Register::GS => self.gs_base,
            _ => 0,
        }
    }

    /// Register lookup used for effective address calculations.
    pub fn register_value(&self, register: Register) -> Option<u64> {
        if register.is_segment_register() {
            Some(self.segment_base(register))
        } else {
            self.read_register(register)
        }
    }

    pub fn direction_flag(&self) -> bool {
        self.rflags & RFLAGS_DF != 0
    }
}
