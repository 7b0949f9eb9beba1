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

//! Moving SEV-SNP pages between the private and the shared state.
//!
//! The validated bit in the RMP and the hypervisor's view of the page owner
//! must never disagree: a page is only validated once the hypervisor has
//! assigned it to the guest, and it is invalidated before it is handed back.

use snafu::prelude::*;
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::{
    instructions::{InstructionError, Validation},
    msr::{
        change_snp_page_state, MsrProtocolError, PageAssignment, SevStatus,
        SnpPageStateChangeRequest, TerminationReason, TerminationRequest,
    },
    platform::{Hypervisor, PageValidator},
};

#[derive(Debug, PartialEq, Snafu)]
pub enum PageStateError {
    #[snafu(display("page state change for {address:#x} failed"))]
    PageStateChange { address: u64, source: MsrProtocolError },
    #[snafu(display("couldn't change the validation of {address:#x}: {error:?}"))]
    Validation { address: u64, error: InstructionError },
}

impl PageStateError {
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            PageStateError::PageStateChange { .. } => TerminationReason::PageStateChange,
            PageStateError::Validation { .. } => TerminationReason::PageValidation,
        }
    }
}

fn request_state<P: Hypervisor + ?Sized>(
    platform: &mut P,
    frame: PhysFrame<Size4KiB>,
    assignment: PageAssignment,
) -> Result<(), PageStateError> {
    let address = frame.start_address();
    SnpPageStateChangeRequest::new(address, assignment)
        .and_then(|request| change_snp_page_state(platform, request))
        .context(PageStateChangeSnafu { address: address.as_u64() })
}

fn validate<P: PageValidator + ?Sized>(
    platform: &mut P,
    frame: PhysFrame<Size4KiB>,
    validation: Validation,
) -> Result<(), PageStateError> {
    platform
        .pvalidate(frame, validation)
        .map_err(|error| PageStateError::Validation { address: frame.start_address().as_u64(), error })
}

/// Assigns the page containing `address` to the guest and validates it.
pub fn make_private<P: Hypervisor + PageValidator + ?Sized>(
    platform: &mut P,
    address: PhysAddr,
) -> Result<(), PageStateError> {
    let frame = PhysFrame::containing_address(address);
    request_state(platform, frame, PageAssignment::Private)?;
    validate(platform, frame, Validation::Validated)
}

/// Invalidates the page containing `address` and hands it to the hypervisor.
pub fn make_shared<P: Hypervisor + PageValidator + ?Sized>(
    platform: &mut P,
    address: PhysAddr,
) -> Result<(), PageStateError> {
    let frame = PhysFrame::containing_address(address);
    validate(platform, frame, Validation::Unvalidated)?;
    request_state(platform, frame, PageAssignment::Shared)
}

/// Entry points used by the memory encryption code whenever the encryption
/// attribute of a page changes.
///
/// Nothing happens unless SEV-SNP is active. Calls for the same page must
/// not race.
#[derive(Clone, Copy, Debug)]
pub struct PageStateController {
    status: SevStatus,
}

impl PageStateController {
    pub fn new(status: SevStatus) -> Self {
        Self { status }
    }

    pub fn try_set_private<P: Hypervisor + PageValidator + ?Sized>(
        &self,
        platform: &mut P,
        address: PhysAddr,
    ) -> Result<(), PageStateError> {
        if !self.status.snp_active() {
            return Ok(());
        }
        log::debug!("making {:#x} private", address.as_u64());
        make_private(platform, address)
    }

    pub fn try_set_shared<P: Hypervisor + PageValidator + ?Sized>(
        &self,
        platform: &mut P,
        address: PhysAddr,
    ) -> Result<(), PageStateError> {
        if !self.status.snp_active() {
            return Ok(());
        }
        log::debug!("making {:#x} shared", address.as_u64());
        make_shared(platform, address)
    }

    /// Like [`PageStateController::try_set_private`], but a failure
    /// terminates the guest.
    pub fn set_private<P: Hypervisor + PageValidator + ?Sized>(
        &self,
        platform: &mut P,
        address: PhysAddr,
    ) {
        if let Err(err) = self.try_set_private(platform, address) {
            log::error!("{err}");
            platform.terminate(TerminationRequest::from(err.termination_reason()));
        }
    }

    /// Like [`PageStateController::try_set_shared`], but a failure
    /// terminates the guest.
    pub fn set_shared<P: Hypervisor + PageValidator + ?Sized>(
        &self,
        platform: &mut P,
        address: PhysAddr,
    ) {
        if let Err(err) = self.try_set_shared(platform, address) {
            log::error!("{err}");
            platform.terminate(TerminationRequest::from(err.termination_reason()));
        }
    }
}
