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

//! The GHCB page and the exchanges made over it.
//!
//! [`GhcbChannel::start`] masks interrupts on the current CPU, clears the save
//! area and returns a [`GhcbSession`]. The session fills in the request, exits
//! to the hypervisor and reads the response. Dropping it ends the exchange.
//!
//! Offsets and exit codes are from the GHCB standardization document, AMD
//! publication 56421 (table 3 and section 4).

use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use snafu::prelude::*;
use x86_64::{
    structures::paging::{Page, Size4KiB},
    VirtAddr,
};
use zerocopy::FromBytes;

use crate::{
    event::EventInjection,
    msr::GhcbGpa,
    platform::{CriticalSection, Hypervisor},
    Translator,
};

pub const GHCB_PAGE_SIZE: usize = 4096;

/// Protocol version written into every request.
pub const GHCB_PROTOCOL_VERSION: u16 = 2;

pub const SHARED_BUFFER_SIZE: usize = 2032;

pub const SW_EXIT_CODE_MMIO_READ: u64 = 0x8000_0001;

pub const SW_EXIT_CODE_MMIO_WRITE: u64 = 0x8000_0002;

/// Tells the hypervisor that the guest could not emulate an exit.
pub const SW_EXIT_CODE_UNSUPPORTED_EVENT: u64 = 0x8000_FFFF;

/// Fields that are part of every request.
const BASE_VALID_BITMAP: ValidBitmap =
    ValidBitmap::SW_EXIT_CODE.union(ValidBitmap::SW_EXIT_INFO_1).union(ValidBitmap::SW_EXIT_INFO_2);

/// Bits of sw_exit_info_1 that hold the hypervisor's action code.
const SW_EXIT_INFO_1_ACTION_MASK: u64 = 0xffff_ffff;

/// Layout of the page shared with the hypervisor.
///
/// Only the save area fields used by the #VC handler are named; the rest is
/// padding that must stay zero.
#[repr(C, align(4096))]
#[derive(Debug, FromBytes)]
pub struct Ghcb {
    _reserved_0: [u8; 203],
    pub cpl: u8,
    _reserved_1: [u8; 116],
    /// IA32_XSS.
    pub xss: u64,
    _reserved_2: [u8; 24],
    pub dr7: u64,
    _reserved_3: [u8; 144],
    pub rax: u64,
    _reserved_4: [u8; 264],
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _reserved_5: [u8; 112],
    pub sw_exit_code: u64,
    pub sw_exit_info_1: u64,
    pub sw_exit_info_2: u64,
    /// Address of the data for string I/O and MMIO exits.
    pub sw_scratch: u64,
    _reserved_6: [u8; 56],
    pub xcr0: u64,
    /// One bit per quadword of the save area (offsets 0x000 to 0x3ef).
    ///
    /// The guest sets the bits of the fields it filled in, and only trusts
    /// fields whose bit the hypervisor set in the response.
    pub valid_bitmap: ValidBitmap,
    pub x87_state_gpa: u64,
    _reserved_7: [u8; 1016],
    /// Scratch space for payloads too large for the save area.
    pub shared_buffer: [u8; SHARED_BUFFER_SIZE],
    _reserved_8: [u8; 10],
    pub protocol_version: u16,
    /// 0 for the standard layout; other values are hypervisor defined.
    pub ghcb_usage: u32,
}

static_assertions::assert_eq_size!(Ghcb, [u8; GHCB_PAGE_SIZE]);

impl Default for Ghcb {
    fn default() -> Self {
        Self::new()
    }
}

impl AsMut<Ghcb> for Ghcb {
    #[inline]
    fn as_mut(&mut self) -> &mut Ghcb {
        self
    }
}

impl AsRef<Ghcb> for Ghcb {
    #[inline]
    fn as_ref(&self) -> &Ghcb {
        self
    }
}

/// Save area fields marked valid, indexed by quadword offset.
#[derive(Clone, Copy, Debug, Default, FromBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct ValidBitmap(u128);

bitflags! {
    impl ValidBitmap: u128 {
        const CPL = (1 << 25);
        const XSS = (1 << 40);
        const DR7 = (1 << 44);
        const RAX = (1 << 63);
        const RCX = (1 << 97);
        const RDX = (1 << 98);
        const RBX = (1 << 99);
        const SW_EXIT_CODE = (1 << 114);
        const SW_EXIT_INFO_1 = (1 << 115);
        const SW_EXIT_INFO_2 = (1 << 116);
        const SW_SCRATCH = (1 << 117);
        const XCR0 = (1 << 125);
    }
}

impl Ghcb {
    pub const fn new() -> Self {
        Ghcb {
            _reserved_0: [0; 203],
            cpl: 0,
            _reserved_1: [0; 116],
            xss: 0,
            _reserved_2: [0; 24],
            dr7: 0,
            _reserved_3: [0; 144],
            rax: 0,
            _reserved_4: [0; 264],
            rbx: 0,
            rcx: 0,
            rdx: 0,
            _reserved_5: [0; 112],
            sw_exit_code: 0,
            sw_exit_info_1: 0,
            sw_exit_info_2: 0,
            sw_scratch: 0,
            _reserved_6: [0; 56],
            xcr0: 0,
            valid_bitmap: ValidBitmap::empty(),
            x87_state_gpa: 0,
            _reserved_7: [0; 1016],
            shared_buffer: [0; SHARED_BUFFER_SIZE],
            _reserved_8: [0; 10],
            protocol_version: 0,
            ghcb_usage: 0,
        }
    }

    /// Clears the page, shared buffer included.
    pub fn reset(&mut self) {
        self.reset_save_area();
        self.shared_buffer.fill(0);
        self._reserved_8.fill(0);
        self.protocol_version = 0;
        self.ghcb_usage = 0;
    }

    /// Zeroes everything in front of the shared buffer, including the valid
    /// bitmap.
    pub fn reset_save_area(&mut self) {
        self._reserved_0.fill(0);
        self.cpl = 0;
        self._reserved_1.fill(0);
        self.xss = 0;
        self._reserved_2.fill(0);
        self.dr7 = 0;
        self._reserved_3.fill(0);
        self.rax = 0;
        self._reserved_4.fill(0);
        self.rcx = 0;
        self.rdx = 0;
        self.rbx = 0;
        self._reserved_5.fill(0);
        self.sw_exit_code = 0;
        self.sw_exit_info_1 = 0;
        self.sw_exit_info_2 = 0;
        self.sw_scratch = 0;
        self._reserved_6.fill(0);
        self.xcr0 = 0;
        self.valid_bitmap = ValidBitmap::empty();
        self.x87_state_gpa = 0;
        self._reserved_7.fill(0);
    }

    pub fn set_rax(&mut self, value: u64) {
        self.rax = value;
        self.valid_bitmap |= ValidBitmap::RAX;
    }

    pub fn set_rbx(&mut self, value: u64) {
        self.rbx = value;
        self.valid_bitmap |= ValidBitmap::RBX;
    }

    pub fn set_rcx(&mut self, value: u64) {
        self.rcx = value;
        self.valid_bitmap |= ValidBitmap::RCX;
    }

    pub fn set_rdx(&mut self, value: u64) {
        self.rdx = value;
        self.valid_bitmap |= ValidBitmap::RDX;
    }

    pub fn set_xcr0(&mut self, value: u64) {
        self.xcr0 = value;
        self.valid_bitmap |= ValidBitmap::XCR0;
    }

    pub fn set_sw_scratch(&mut self, value: u64) {
        self.sw_scratch = value;
        self.valid_bitmap |= ValidBitmap::SW_SCRATCH;
    }

    /// Returns RAX if the hypervisor marked it as valid.
    pub fn valid_rax(&self) -> Option<u64> {
        self.valid_bitmap.contains(ValidBitmap::RAX).then_some(self.rax)
    }

    pub fn valid_rbx(&self) -> Option<u64> {
        self.valid_bitmap.contains(ValidBitmap::RBX).then_some(self.rbx)
    }

    pub fn valid_rcx(&self) -> Option<u64> {
        self.valid_bitmap.contains(ValidBitmap::RCX).then_some(self.rcx)
    }

    pub fn valid_rdx(&self) -> Option<u64> {
        self.valid_bitmap.contains(ValidBitmap::RDX).then_some(self.rdx)
    }

    /// Interprets the hypervisor's answer to an exit.
    ///
    /// The low 32 bits of sw_exit_info_1 hold the action: 0 is success and 1
    /// asks the guest to raise the exception in sw_exit_info_2. Anything else
    /// is treated as a protocol violation.
    fn response(&self) -> Result<(), EventInjection> {
        match self.sw_exit_info_1 & SW_EXIT_INFO_1_ACTION_MASK {
            0 => Ok(()),
            1 => Err(EventInjection::from_hypervisor(self.sw_exit_info_2)),
            action => {
                log::warn!("invalid GHCB action code {action:#x}");
                Err(EventInjection::UNSUPPORTED)
            }
        }
    }
}

#[derive(Debug, PartialEq, Snafu)]
pub enum GhcbError {
    #[snafu(display("couldn't translate the GHCB address {address:#x}"))]
    TranslationFailed { address: u64 },
    #[snafu(display("GHCB at {address:#x} is not page aligned"))]
    NotAligned { address: u64 },
}

/// A GHCB page together with its guest-physical address.
///
/// At most one exchange can be in progress on a channel, which the borrow in
/// [`GhcbChannel::start`] enforces.
pub struct GhcbChannel<G: AsMut<Ghcb> + AsRef<Ghcb>> {
    ghcb: G,
    gpa: GhcbGpa,
}

impl<G> GhcbChannel<G>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
{
    pub fn new<VP: Translator>(ghcb: G, translate: VP) -> Result<Self, GhcbError> {
        let address = VirtAddr::from_ptr(ghcb.as_ref() as *const Ghcb);
        let gpa = translate(address)
            .context(TranslationFailedSnafu { address: address.as_u64() })?;
        let gpa = GhcbGpa::new(gpa).ok().context(NotAlignedSnafu { address: gpa.as_u64() })?;
        Ok(Self { ghcb, gpa })
    }

    /// Gets the guest-physical address of the GHCB page.
    pub fn gpa(&self) -> GhcbGpa {
        self.gpa
    }

    /// The page the GHCB lives on, in the current address space.
    pub fn page(&self) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::from_ptr(self.ghcb.as_ref() as *const Ghcb))
    }

    pub fn ghcb(&self) -> &Ghcb {
        self.ghcb.as_ref()
    }

    /// Zeroes the whole page.
    pub fn reset(&mut self) {
        self.ghcb.as_mut().reset();
    }

    /// Consumes the channel, yielding back the underlying GHCB page.
    pub fn into_inner(self) -> G {
        self.ghcb
    }

    /// Begins an exchange with the hypervisor.
    ///
    /// Interrupts stay masked until the returned session is dropped.
    pub fn start<'s, P>(&'s mut self, platform: &'s mut P) -> GhcbSession<'s, G, P>
    where
        P: Hypervisor + CriticalSection,
    {
        let token = platform.enter();
        let ghcb = self.ghcb.as_mut();
        ghcb.reset_save_area();
        ghcb.protocol_version = GHCB_PROTOCOL_VERSION;
        ghcb.ghcb_usage = 0;
        GhcbSession { channel: self, platform, token: Some(token) }
    }
}

/// A single exchange with the hypervisor over a GHCB page.
pub struct GhcbSession<'s, G, P>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: Hypervisor + CriticalSection,
{
    channel: &'s mut GhcbChannel<G>,
    platform: &'s mut P,
    token: Option<P::Token>,
}

impl<G, P> GhcbSession<'_, G, P>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: Hypervisor + CriticalSection,
{
    pub fn ghcb(&mut self) -> &mut Ghcb {
        self.channel.ghcb.as_mut()
    }

    pub fn platform(&mut self) -> &mut P {
        self.platform
    }

    /// Borrows the page and the platform at the same time.
    pub fn split(&mut self) -> (&mut Ghcb, &mut P) {
        (self.channel.ghcb.as_mut(), self.platform)
    }

    /// The guest-physical address of the shared buffer, as expected in
    /// sw_scratch.
    pub fn shared_buffer_gpa(&self) -> u64 {
        self.channel.gpa.as_u64() + core::mem::offset_of!(Ghcb, shared_buffer) as u64
    }

    /// Writes the exit fields, hands control to the hypervisor and checks its
    /// response.
    ///
    /// On failure the returned event is the exception the guest has to raise.
    pub fn exit(
        &mut self,
        exit_code: u64,
        exit_info_1: u64,
        exit_info_2: u64,
    ) -> Result<(), EventInjection> {
        let gpa = self.channel.gpa;
        let ghcb = self.channel.ghcb.as_mut();
        ghcb.sw_exit_code = exit_code;
        ghcb.sw_exit_info_1 = exit_info_1;
        ghcb.sw_exit_info_2 = exit_info_2;
        ghcb.valid_bitmap |= BASE_VALID_BITMAP;
        ghcb.protocol_version = GHCB_PROTOCOL_VERSION;
        // The request must be visible before the hypervisor runs.
        fence(Ordering::SeqCst);
        self.platform.ghcb_exit(ghcb, gpa);
        // Don't read the response ahead of the exit.
        fence(Ordering::SeqCst);
        ghcb.response()
    }

    /// Reports an exit the guest cannot handle to the hypervisor.
    ///
    /// The result is always an event to raise: the one the hypervisor asked
    /// for, or [`EventInjection::UNSUPPORTED`] if it claimed success.
    pub fn issue_unsupported(&mut self, exit_info_1: u64, exit_info_2: u64) -> EventInjection {
        self.ghcb().reset_save_area();
        match self.exit(SW_EXIT_CODE_UNSUPPORTED_EVENT, exit_info_1, exit_info_2) {
            Ok(()) => EventInjection::UNSUPPORTED,
            Err(event) => event,
        }
    }

    /// Ends the exchange and unmasks interrupts.
    pub fn finish(self) {}
}

impl<G, P> Drop for GhcbSession<'_, G, P>
where
    G: AsMut<Ghcb> + AsRef<Ghcb>,
    P: Hypervisor + CriticalSection,
{
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.platform.exit(token);
        }
    }
}
