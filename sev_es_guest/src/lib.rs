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

//! Handling of the VMM communication exception (#VC) for AMD SEV-ES and
//! SEV-SNP guests.
//!
//! When register state is protected the hypervisor can no longer emulate
//! intercepted instructions on its own. The processor instead raises #VC in the
//! guest, which decodes the faulting instruction and asks the hypervisor for
//! the result through the guest-hypervisor communication block (GHCB).
//!
//! See <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use x86_64::{PhysAddr, VirtAddr};

pub mod boot;
pub mod decoder;
pub mod event;
pub mod ghcb;
pub mod instructions;
pub mod msr;
pub mod page_state;
pub mod platform;
pub mod runtime;
pub mod vc;

/// Translates a guest-virtual address into a guest-physical address by walking
/// the active page tables.
pub trait Translator: Fn(VirtAddr) -> Option<PhysAddr> {}
impl<X: Fn(VirtAddr) -> Option<PhysAddr>> Translator for X {}
