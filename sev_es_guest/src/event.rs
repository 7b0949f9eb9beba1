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

//! Exceptions that the hypervisor asks the guest to raise.
//!
//! The hypervisor returns them in SW_EXIT_INFO_2 using the EVENTINJ encoding.
//! See section 15.20 of <https://www.amd.com/system/files/TechDocs/24593.pdf>.

use strum::FromRepr;

const VECTOR_MASK: u64 = 0xFF;
const TYPE_MASK: u64 = 0x7 << 8;
const TYPE_EXCEPTION: u64 = 3 << 8;
const ERROR_CODE_VALID: u64 = 1 << 11;
const VALID: u64 = 1 << 31;

/// The exception vectors a hypervisor may ask us to raise.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionVector {
    /// #UD
    InvalidOpcode = 6,
    /// #GP
    GeneralProtection = 13,
}

/// An event in the EVENTINJ encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventInjection(u64);

impl EventInjection {
    /// The event used whenever the hypervisor response cannot be trusted: a
    /// general-protection fault without an error code.
    pub const UNSUPPORTED: Self =
        Self(ExceptionVector::GeneralProtection as u64 | TYPE_EXCEPTION | VALID);

    /// Checks an event requested by the hypervisor.
    ///
    /// Only valid #GP and #UD exceptions are passed through, everything else
    /// is replaced by [`EventInjection::UNSUPPORTED`].
    pub fn from_hypervisor(raw: u64) -> Self {
        let event = Self(raw);
        if raw & TYPE_MASK == TYPE_EXCEPTION && raw & VALID != 0 && event.vector().is_some() {
            event
        } else {
            log::warn!("hypervisor requested unsupported event {raw:#x}");
            Self::UNSUPPORTED
        }
    }

    pub fn vector(&self) -> Option<ExceptionVector> {
        ExceptionVector::from_repr((self.0 & VECTOR_MASK) as u8)
    }

    /// The error code to push for the exception, 0 if the event has none.
    pub fn error_code(&self) -> u32 {
        if self.0 & ERROR_CODE_VALID != 0 {
            (self.0 >> 32) as u32
        } else {
            0
        }
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}
