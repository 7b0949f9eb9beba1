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

//! PVALIDATE and VMGEXIT.
//!
//! Both are described in AMD APM volume 3 (publication 24594).

use core::arch::asm;

use strum::FromRepr;

/// Target RMP validation state, passed to PVALIDATE in EDX.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum Validation {
    Unvalidated = 0,
    Validated = 1,
}

/// Page size operand of PVALIDATE, passed in ECX.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum PageSize {
    Page4KiB = 0,
    Page2MiB = 1,
}

/// Failures reported by PVALIDATE.
///
/// Codes below 254 come from EAX; the remaining ones are synthesized here.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum InstructionError {
    FailInput = 1,
    FailPermission = 2,
    /// The RMP entry describes a page of a different size.
    FailSizeMismatch = 6,
    /// EAX held a code we don't know about.
    UnknownReturnCode = 254,
    /// EAX was 0 but CF was set: the page already had the requested state.
    ValidationStatusNotUpdated = 255,
}

/// Changes the validated bit of the RMP entry for the page at `gpa`.
#[inline]
pub fn pvalidate(gpa: usize, size: PageSize, validation: Validation) -> Result<(), InstructionError> {
    let result: u32;
    let carry: u8;
    // Safety: PVALIDATE only touches the RMP, never the contents of guest memory.
    unsafe {
        asm!(
            "pvalidate",
            "setc dl",
            in("rax") gpa,
            in("ecx") size as u32,
            in("edx") validation as u32,
            lateout("eax") result,
            lateout("dl") carry,
            options(nomem, nostack)
        );
    }
    match (result, carry) {
        (0, 0) => Ok(()),
        (0, _) => Err(InstructionError::ValidationStatusNotUpdated),
        (code, _) => {
            Err(InstructionError::from_repr(code).unwrap_or(InstructionError::UnknownReturnCode))
        }
    }
}

/// Hands control to the hypervisor.
///
/// The request itself lives in the GHCB MSR or the GHCB page.
pub fn vmgexit() {
    // Safety: exiting to the hypervisor has no effect on guest memory as seen
    // by Rust.
    unsafe {
        // VMGEXIT is encoded as REP VMMCALL; not every assembler knows the
        // mnemonic.
        asm!("rep vmmcall", options(nomem, nostack, preserves_flags));
    }
}
