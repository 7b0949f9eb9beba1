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

//! The GHCB MSR protocol.
//!
//! Requests are written to MSR 0xC001_0130 before executing VMGEXIT, and the
//! hypervisor leaves its answer in the same MSR when it resumes the guest.
//! Bits 11:0 of every value carry the operation code, bits 63:12 its payload.
//!
//! Only the operations needed before a GHCB page is usable are implemented
//! here: protocol negotiation, hypervisor feature discovery, GHCB
//! registration, page state changes and termination.
//!
//! Layouts follow section 2.3.1 of the GHCB standardization document (AMD
//! publication 56421).

use bitflags::bitflags;
use snafu::prelude::*;
use strum::FromRepr;
use x86_64::{registers::model_specific::Msr, PhysAddr};

use crate::{instructions::vmgexit, platform::Hypervisor};

/// The version of the GHCB protocol that this library speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u16 = 2;

/// Payload returned when the hypervisor rejects a GHCB registration.
const GHCB_LOCATION_NOT_ACCEPTED: u64 = 0xFFFFFFFFFFFFF000;

/// GHCB MSR.
const PROTOCOL_MSR_IDENTIFIER: u32 = 0xC001_0130;

/// SEV_STATUS MSR.
const STATUS_MSR_IDENTIFIER: u32 = 0xC001_0131;

/// Operation code bits.
const GHCB_INFO_MASK: u64 = 0xFFF;

/// Payload bits.
const GHCB_DATA_MASK: u64 = !GHCB_INFO_MASK;

const SEV_INFO_REQUEST: u64 = 0x002;
const SEV_INFO_RESPONSE: u64 = 0x001;
const REGISTER_GHCB_GPA_REQUEST: u64 = 0x012;
const REGISTER_GHCB_GPA_RESPONSE: u64 = 0x013;
const SNP_PAGE_STATE_CHANGE_REQUEST: u64 = 0x014;
const SNP_PAGE_STATE_CHANGE_RESPONSE: u64 = 0x015;
const HYPERVISOR_FEATURE_SUPPORT_REQUEST: u64 = 0x080;
const HYPERVISOR_FEATURE_SUPPORT_RESPONSE: u64 = 0x081;
const TERMINATION_REQUEST: u64 = 0x100;

/// Errors when decoding a response read back from the protocol MSR.
#[derive(Debug, PartialEq, Snafu)]
pub enum MsrProtocolError {
    /// The response info code does not match the request.
    #[snafu(display("unexpected response {response:#x}, expected info code {expected:#x}"))]
    UnexpectedResponse { response: u64, expected: u64 },
    /// Reserved bits in the response were set.
    #[snafu(display("reserved bits set in response {response:#x}"))]
    ReservedBitsSet { response: u64 },
    /// The page address is not 4KiB-aligned or does not fit in 52 bits.
    InvalidPageAddress,
    /// The hypervisor reported a non-zero page state change error code.
    #[snafu(display("page state change failed with error code {error_code:#x}"))]
    PageStateChangeFailed { error_code: u32 },
}

fn check_info(response: u64, expected: u64) -> Result<(), MsrProtocolError> {
    ensure!(response & GHCB_INFO_MASK == expected, UnexpectedResponseSnafu { response, expected });
    Ok(())
}

/// Page-aligned guest-physical address of a GHCB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GhcbGpa {
    gpa: u64,
}

impl GhcbGpa {
    pub fn new(gpa: PhysAddr) -> Result<Self, RegisterGhcbGpaError> {
        let gpa = gpa.as_u64();
        ensure!(gpa & GHCB_INFO_MASK == 0, AddressNotAlignedSnafu);
        Ok(Self { gpa })
    }

    pub fn as_u64(&self) -> u64 {
        self.gpa
    }
}

impl From<GhcbGpa> for u64 {
    fn from(ghcb_gpa: GhcbGpa) -> Self {
        ghcb_gpa.gpa
    }
}

/// Protocol version range and C-bit position advertised by the hypervisor.
#[derive(Debug, PartialEq)]
pub struct SevInfoResponse {
    /// Oldest protocol version the hypervisor accepts.
    pub min_protocol_version: u16,
    /// Newest protocol version the hypervisor accepts.
    pub max_protocol_version: u16,
    /// Page table bit that marks a mapping as encrypted.
    pub encryption_bit: u8,
}

impl SevInfoResponse {
    /// Whether the version spoken by this library lies in the advertised range.
    pub fn supports(&self, version: u16) -> bool {
        (self.min_protocol_version..=self.max_protocol_version).contains(&version)
    }
}

impl TryFrom<u64> for SevInfoResponse {
    type Error = MsrProtocolError;
    fn try_from(msr_value: u64) -> Result<Self, Self::Error> {
        check_info(msr_value, SEV_INFO_RESPONSE)?;
        Ok(Self {
            max_protocol_version: (msr_value >> 48) as u16,
            min_protocol_version: (msr_value >> 32) as u16,
            encryption_bit: (msr_value >> 24) as u8,
        })
    }
}

/// Asks for the [`SevInfoResponse`].
pub struct SevInfoRequest;

impl From<SevInfoRequest> for u64 {
    fn from(_request: SevInfoRequest) -> Self {
        SEV_INFO_REQUEST
    }
}

/// Negotiation step: fetches the hypervisor's version range.
pub fn get_sev_info<H: Hypervisor + ?Sized>(
    hypervisor: &mut H,
) -> Result<SevInfoResponse, MsrProtocolError> {
    hypervisor.msr_exchange(SevInfoRequest.into()).try_into()
}

/// Announces the GHCB of the current vCPU.
pub struct RegisterGhcbGpaRequest {
    ghcb_gpa: u64,
}

impl RegisterGhcbGpaRequest {
    pub fn new(ghcb_gpa: GhcbGpa) -> Self {
        Self { ghcb_gpa: ghcb_gpa.into() }
    }
}

impl From<RegisterGhcbGpaRequest> for u64 {
    fn from(request: RegisterGhcbGpaRequest) -> Self {
        REGISTER_GHCB_GPA_REQUEST | request.ghcb_gpa
    }
}

/// Hypervisor's answer to [`RegisterGhcbGpaRequest`].
pub struct RegisterGhcbGpaResponse {
    /// Address the hypervisor recorded, or [`GHCB_LOCATION_NOT_ACCEPTED`].
    ghcb_gpa: u64,
}

#[derive(Debug, PartialEq, Snafu)]
pub enum RegisterGhcbGpaError {
    /// The address has bits set below 4KiB.
    AddressNotAligned,
    InvalidResponse,
    GhcbLocationNotAccepted,
    GhcbResponseLocationNotMatchingRequest {
        response_ghcb_gpa: u64,
    },
}

impl TryFrom<u64> for RegisterGhcbGpaResponse {
    type Error = RegisterGhcbGpaError;
    fn try_from(msr_value: u64) -> Result<Self, Self::Error> {
        ensure!(msr_value & GHCB_INFO_MASK == REGISTER_GHCB_GPA_RESPONSE, InvalidResponseSnafu);
        Ok(Self { ghcb_gpa: msr_value & GHCB_DATA_MASK })
    }
}

/// Tells the hypervisor where the current vCPU keeps its GHCB.
///
/// Fails unless the hypervisor echoes the requested address back.
pub fn register_ghcb_location<H: Hypervisor + ?Sized>(
    hypervisor: &mut H,
    request: RegisterGhcbGpaRequest,
) -> Result<(), RegisterGhcbGpaError> {
    let request_ghcb_gpa = request.ghcb_gpa;
    let response: RegisterGhcbGpaResponse = hypervisor.msr_exchange(request.into()).try_into()?;
    ensure!(response.ghcb_gpa != GHCB_LOCATION_NOT_ACCEPTED, GhcbLocationNotAcceptedSnafu);
    ensure!(
        response.ghcb_gpa == request_ghcb_gpa,
        GhcbResponseLocationNotMatchingRequestSnafu { response_ghcb_gpa: response.ghcb_gpa }
    );
    Ok(())
}

/// Target owner of a page in a page state change.
#[derive(Debug, FromRepr, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageAssignment {
    Private = 1,
    Shared = 2,
}

/// Request to change a 4KiB page from shared to private or private to shared.
#[derive(Debug)]
pub struct SnpPageStateChangeRequest {
    page_gpa: u64,
    assignment: PageAssignment,
}

impl SnpPageStateChangeRequest {
    pub fn new(page_gpa: PhysAddr, assignment: PageAssignment) -> Result<Self, MsrProtocolError> {
        let page_gpa = page_gpa.as_u64();
        // Only 52 bits can be used for an address.
        const ADDRESS_MAX: u64 = (1 << 52) - 1;
        ensure!(page_gpa & GHCB_INFO_MASK == 0 && page_gpa <= ADDRESS_MAX, InvalidPageAddressSnafu);
        Ok(Self { page_gpa, assignment })
    }
}

impl From<SnpPageStateChangeRequest> for u64 {
    fn from(request: SnpPageStateChangeRequest) -> Self {
        SNP_PAGE_STATE_CHANGE_REQUEST | request.page_gpa | ((request.assignment as u64) << 52)
    }
}

/// Outcome of a [`SnpPageStateChangeRequest`].
pub struct SnpPageStateChangeResponse {
    /// Zero on success. The page keeps its old state otherwise.
    error_code: u32,
}

impl TryFrom<u64> for SnpPageStateChangeResponse {
    type Error = MsrProtocolError;
    fn try_from(msr_value: u64) -> Result<Self, Self::Error> {
        const RESERVED_MASK: u64 = 0xFFFFF000;
        check_info(msr_value, SNP_PAGE_STATE_CHANGE_RESPONSE)?;
        ensure!(msr_value & RESERVED_MASK == 0, ReservedBitsSetSnafu { response: msr_value });
        Ok(Self { error_code: (msr_value >> 32) as u32 })
    }
}

/// Moves a single page between the guest and the hypervisor in the RMP.
///
/// This does not need a GHCB page, so it can be used while one is being set
/// up.
pub fn change_snp_page_state<H: Hypervisor + ?Sized>(
    hypervisor: &mut H,
    request: SnpPageStateChangeRequest,
) -> Result<(), MsrProtocolError> {
    let response: SnpPageStateChangeResponse =
        hypervisor.msr_exchange(request.into()).try_into()?;
    ensure!(
        response.error_code == 0,
        PageStateChangeFailedSnafu { error_code: response.error_code }
    );
    Ok(())
}

/// Asks for [`HypervisorFeatureSupportResponse`].
pub struct HypervisorFeatureSupportRequest;

impl From<HypervisorFeatureSupportRequest> for u64 {
    fn from(_request: HypervisorFeatureSupportRequest) -> Self {
        HYPERVISOR_FEATURE_SUPPORT_REQUEST
    }
}

bitflags! {
    /// Optional protocol features the hypervisor implements.
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct HypervisorFeatureSupportResponse: u64 {
        /// SEV-SNP guests.
        const SEV_SNP = (1 << 0);
        /// The SEV-SNP AP creation NAE is supported.
        const AP_CREATION = (1 << 1);
        /// Restricted injection of interrupts.
        const RESTRICTED_INJECTION = (1 << 2);
        /// Timer interrupts under restricted injection.
        const RESTRICTED_INJECTION_TIMER = (1 << 3);
    }
}

impl TryFrom<u64> for HypervisorFeatureSupportResponse {
    type Error = MsrProtocolError;
    fn try_from(msr_value: u64) -> Result<Self, Self::Error> {
        check_info(msr_value, HYPERVISOR_FEATURE_SUPPORT_RESPONSE)?;
        // Newer hypervisors advertise features we don't know about yet.
        Ok(HypervisorFeatureSupportResponse::from_bits_retain(msr_value >> 12))
    }
}

/// Fetches the hypervisor feature bitmap.
pub fn get_hypervisor_feature_support<H: Hypervisor + ?Sized>(
    hypervisor: &mut H,
) -> Result<HypervisorFeatureSupportResponse, MsrProtocolError> {
    hypervisor.msr_exchange(HypervisorFeatureSupportRequest.into()).try_into()
}

/// Why the guest gives up.
///
/// The first three reasons belong to the standard reason set 0; the others are
/// guest-specific and use reason set 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// No specific reason.
    General,
    /// The hypervisor does not speak our protocol version.
    GhcbProtocolVersion,
    /// The hypervisor lacks SEV-SNP support.
    SnpFeatureNotSupported,
    /// The GHCB page could not be registered with the hypervisor.
    GhcbRegistration,
    /// A page state change request failed.
    PageStateChange,
    /// PVALIDATE failed.
    PageValidation,
}

impl TerminationReason {
    /// The reason set this reason belongs to.
    pub fn reason_set(&self) -> u8 {
        match self {
            Self::General | Self::GhcbProtocolVersion | Self::SnpFeatureNotSupported => 0,
            Self::GhcbRegistration | Self::PageStateChange | Self::PageValidation => 1,
        }
    }

    /// The reason code within the reason set.
    pub fn reason_code(&self) -> u8 {
        match self {
            Self::General => 0,
            Self::GhcbProtocolVersion => 1,
            Self::SnpFeatureNotSupported => 2,
            Self::GhcbRegistration => 0,
            Self::PageStateChange => 1,
            Self::PageValidation => 2,
        }
    }
}

/// Termination message sent through the GHCB MSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminationRequest {
    pub reason: TerminationReason,
}

impl From<TerminationReason> for TerminationRequest {
    fn from(reason: TerminationReason) -> Self {
        Self { reason }
    }
}

impl From<TerminationRequest> for u64 {
    fn from(request: TerminationRequest) -> Self {
        TERMINATION_REQUEST
            | (request.reason.reason_set() as u64) << 12
            | (request.reason.reason_code() as u64) << 16
    }
}

/// Asks the hypervisor to stop the guest and halts if it doesn't.
pub fn request_termination(request: TerminationRequest) -> ! {
    log::error!("requesting termination: {:?}", request.reason);
    write_protocol_msr_and_exit(request.into());
    // The hypervisor should never resume us.
    loop {
        x86_64::instructions::hlt();
    }
}

bitflags! {
    /// Contents of the SEV_STATUS MSR (AMD APM volume 2, section 15.34.10).
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct SevStatus: u64 {
        const SEV_ENABLED = (1 << 0);
        const SEV_ES_ENABLED = (1 << 1);
        const SNP_ACTIVE = (1 << 2);
        const VTOM_ENABLED = (1 << 3);
        const REFLECT_VC_ENABLED = (1 << 4);
        const RESTRICTED_INJECTION_ENABLED = (1 << 5);
        const ALTERNATE_INJECTION_ENABLED = (1 << 6);
        const DEBUG_SWAP_ENABLED = (1 << 7);
        const PREVENT_HOST_IBS_ENABLED = (1 << 8);
        const SNP_BTB_ISOLATION_ENABLED = (1 << 9);
        const VMPL_SSS_ENABLED = (1 << 10);
        const SECURE_TSC_ENABLED = (1 << 11);
        const VMGEXIT_PARAMETER_ENABLED = (1 << 12);
        const INSTRUCTION_BASED_SAMPLING_ENABLED = (1 << 14);
        const VMSA_REG_PROT_ENABLED = (1 << 16);
        const SMT_PROTECTION_ENABLED = (1 << 17);
    }
}

impl SevStatus {
    pub fn es_active(&self) -> bool {
        self.contains(SevStatus::SEV_ES_ENABLED)
    }

    pub fn snp_active(&self) -> bool {
        self.contains(SevStatus::SNP_ACTIVE)
    }
}

#[derive(Debug, Snafu)]
pub enum SevStatusError {
    InvalidValue,
}

/// Reads SEV_STATUS on the current CPU.
pub fn get_sev_status() -> Result<SevStatus, SevStatusError> {
    // Safety: SEV_STATUS is read-only and reading it has no side effects.
    let value = unsafe { Msr::new(STATUS_MSR_IDENTIFIER).read() };
    SevStatus::from_bits(value).ok_or(SevStatusError::InvalidValue)
}

/// Stores `msr_value` in the GHCB MSR and exits to the hypervisor.
pub(crate) fn write_protocol_msr_and_exit(msr_value: u64) {
    // Safety: the GHCB MSR only carries messages for the hypervisor; the guest
    // state is not affected by writing it.
    unsafe {
        Msr::new(PROTOCOL_MSR_IDENTIFIER).write(msr_value);
    }
    vmgexit();
}

/// Current value of the GHCB MSR.
pub(crate) fn read_protocol_msr() -> u64 {
    // Safety: see `write_protocol_msr_and_exit`.
    unsafe { Msr::new(PROTOCOL_MSR_IDENTIFIER).read() }
}
