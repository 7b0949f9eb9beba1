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

//! #VC handling while the kernel is still being decompressed and loaded.
//!
//! There is a single GHCB at this point. It is set up the first time a trap
//! is taken, and every failure terminates the guest.

use x86_64::{structures::paging::Page, PhysAddr, VirtAddr};

use crate::{
    ghcb::{Ghcb, GhcbChannel},
    msr::{
        get_hypervisor_feature_support, get_sev_info, register_ghcb_location,
        HypervisorFeatureSupportResponse, RegisterGhcbGpaRequest, SevStatus, TerminationReason,
        TerminationRequest, SUPPORTED_PROTOCOL_VERSION,
    },
    page_state::{make_private, make_shared},
    platform::{PageEncryption, PageValidator, VcPlatform},
    vc::{emulate, TrapFrame},
    Translator,
};

/// Everything the boot handler needs from the machine.
pub trait BootPlatform: VcPlatform + PageEncryption + PageValidator {}
impl<P: VcPlatform + PageEncryption + PageValidator> BootPlatform for P {}

fn terminate_with(reason: TerminationReason) -> TerminationRequest {
    TerminationRequest::from(reason)
}

/// The #VC handler of the early boot stage.
pub struct BootVcHandler<G: AsMut<Ghcb> + AsRef<Ghcb>> {
    status: SevStatus,
    /// The page before the first trap.
    page: Option<G>,
    channel: Option<GhcbChannel<G>>,
}

impl<G: AsMut<Ghcb> + AsRef<Ghcb>> BootVcHandler<G> {
    pub fn new(page: G, status: SevStatus) -> Self {
        Self { status, page: Some(page), channel: None }
    }

    /// Whether the GHCB has been set up.
    pub fn is_ready(&self) -> bool {
        self.channel.is_some()
    }

    fn setup<P: BootPlatform, T: Translator>(
        &mut self,
        platform: &mut P,
        translate: &T,
    ) -> Result<(), TerminationRequest> {
        let info = get_sev_info(platform).map_err(|err| {
            log::error!("couldn't get SEV info: {err}");
            terminate_with(TerminationReason::GhcbProtocolVersion)
        })?;
        if !info.supports(SUPPORTED_PROTOCOL_VERSION) {
            log::error!(
                "GHCB protocol versions {}..={} don't include {}",
                info.min_protocol_version,
                info.max_protocol_version,
                SUPPORTED_PROTOCOL_VERSION
            );
            return Err(terminate_with(TerminationReason::GhcbProtocolVersion));
        }

        if self.status.snp_active() {
            let features = get_hypervisor_feature_support(platform).map_err(|err| {
                log::error!("couldn't get the hypervisor features: {err}");
                terminate_with(TerminationReason::GhcbProtocolVersion)
            })?;
            if !features.contains(HypervisorFeatureSupportResponse::SEV_SNP) {
                log::error!("hypervisor doesn't support SEV-SNP: {features:?}");
                return Err(terminate_with(TerminationReason::SnpFeatureNotSupported));
            }
        }

        let page = self.page.take().ok_or(terminate_with(TerminationReason::General))?;
        let mut channel = GhcbChannel::new(page, translate).map_err(|err| {
            log::error!("{err}");
            terminate_with(TerminationReason::General)
        })?;
        platform.set_decrypted(channel.page()).map_err(|err| {
            log::error!("{err}");
            terminate_with(TerminationReason::General)
        })?;
        channel.reset();

        if self.status.snp_active() {
            let gpa = channel.gpa();
            make_shared(platform, PhysAddr::new(gpa.as_u64())).map_err(|err| {
                log::error!("{err}");
                terminate_with(err.termination_reason())
            })?;
            register_ghcb_location(platform, RegisterGhcbGpaRequest::new(gpa)).map_err(|err| {
                log::error!("couldn't register the GHCB: {err}");
                terminate_with(TerminationReason::GhcbRegistration)
            })?;
        }

        log::debug!("boot GHCB at {:#x}", channel.gpa().as_u64());
        self.channel = Some(channel);
        Ok(())
    }

    /// Handles a #VC raised with `exit_code`.
    ///
    /// The error is the reason the guest has to be terminated for.
    pub fn handle<P: BootPlatform, T: Translator>(
        &mut self,
        platform: &mut P,
        frame: &mut TrapFrame,
        exit_code: u64,
        translate: &T,
    ) -> Result<(), TerminationRequest> {
        if self.channel.is_none() {
            self.setup(platform, translate)?;
        }
        let channel = self.channel.as_mut().ok_or(terminate_with(TerminationReason::General))?;
        let mut session = channel.start(platform);
        emulate(&mut session, frame, exit_code, translate).map(|_| ()).map_err(|err| {
            log::error!("couldn't handle #VC {exit_code:#x} at {:#x}: {err}", frame.rip);
            terminate_with(TerminationReason::General)
        })
    }

    /// The #VC entry point: handles the trap or terminates the guest.
    pub fn handle_or_terminate<P: BootPlatform, T: Translator>(
        &mut self,
        platform: &mut P,
        frame: &mut TrapFrame,
        exit_code: u64,
        translate: &T,
    ) {
        if let Err(request) = self.handle(platform, frame, exit_code, translate) {
            platform.terminate(request);
        }
    }

    /// Hands the GHCB page back to the guest and removes its mapping.
    ///
    /// Returns the page, or `None` if no trap ever set it up.
    pub fn try_shutdown<P: BootPlatform>(
        &mut self,
        platform: &mut P,
    ) -> Result<Option<G>, TerminationRequest> {
        let Some(channel) = self.channel.take() else {
            return Ok(None);
        };
        if self.status.snp_active() {
            make_private(platform, PhysAddr::new(channel.gpa().as_u64())).map_err(|err| {
                log::error!("{err}");
                terminate_with(err.termination_reason())
            })?;
        }
        let page = channel.page();
        platform
            .set_encrypted(page)
            .and_then(|()| platform.unmap(page))
            .map_err(|err| {
                log::error!("{err}");
                terminate_with(TerminationReason::General)
            })?;
        Ok(Some(channel.into_inner()))
    }

    pub fn shutdown<P: BootPlatform>(&mut self, platform: &mut P) -> Option<G> {
        match self.try_shutdown(platform) {
            Ok(page) => page,
            Err(request) => platform.terminate(request),
        }
    }

    /// Whether a page fault at `address` hit the boot GHCB.
    pub fn is_ghcb_fault(&self, address: VirtAddr) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.page() == Page::containing_address(address))
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use googletest::prelude::*;

    use super::*;
    use crate::{
        ghcb::tests::identity,
        instructions::Validation,
        platform::testing::{Call, FakePlatform},
        vc::{
            testing::{frame, RIP},
            Gpr,
        },
    };

    const SEV_INFO: u64 = 0x0002_0001_3300_0001;
    const SNP_FEATURES: u64 = 0x081 | (1 << 12);
    const PSC_OK: u64 = 0x015;
    const CPUID: [u8; 2] = [0x0F, 0xA2];

    fn es() -> SevStatus {
        SevStatus::SEV_ENABLED | SevStatus::SEV_ES_ENABLED
    }

    fn snp() -> SevStatus {
        es() | SevStatus::SNP_ACTIVE
    }

    fn page() -> (Box<Ghcb>, u64) {
        let ghcb = Box::new(Ghcb::new());
        let address = &*ghcb as *const Ghcb as u64;
        (ghcb, address)
    }

    fn cpuid_platform(responses: &[u64]) -> FakePlatform {
        let mut platform = FakePlatform::with_ghcb_handler(|ghcb| {
            ghcb.set_rax(1);
            ghcb.set_rbx(2);
            ghcb.set_rcx(3);
            ghcb.set_rdx(4);
        });
        platform.msr_responses = responses.iter().copied().collect();
        platform.load(RIP, &CPUID);
        platform
    }

    #[googletest::test]
    fn first_trap_sets_up_the_ghcb() {
        let (ghcb, address) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        let mut platform = cpuid_platform(&[SEV_INFO]);
        let mut frame = frame();

        assert_that!(handler.handle(&mut platform, &mut frame, 0x72, &identity), ok(eq(())));

        assert!(handler.is_ready());
        assert_eq!(frame[Gpr::Rbx], 2);
        assert_eq!(frame.rip, RIP + 2);
        assert_eq!(
            platform.calls,
            vec![
                Call::Msr(0x002),
                Call::Decrypt(address),
                Call::GhcbExit { gpa: address, exit_code: 0x72 }
            ]
        );
        assert_eq!(platform.interrupt_depth.get(), 0);
    }

    #[test]
    fn setup_happens_once() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        let mut platform = cpuid_platform(&[SEV_INFO]);

        for _ in 0..2 {
            let mut frame = frame();
            handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap();
        }

        assert_eq!(platform.msr_requests, vec![0x002]);
        assert_eq!(platform.ghcb_exits(), vec![0x72, 0x72]);
    }

    #[test]
    fn snp_setup_shares_and_registers_the_page() {
        let (ghcb, address) = page();
        let mut handler = BootVcHandler::new(ghcb, snp());
        let mut platform = cpuid_platform(&[SEV_INFO, SNP_FEATURES, PSC_OK, address | 0x013]);
        let mut frame = frame();

        assert_eq!(handler.handle(&mut platform, &mut frame, 0x72, &identity), Ok(()));
        assert_eq!(
            platform.calls,
            vec![
                Call::Msr(0x002),
                Call::Msr(0x080),
                Call::Decrypt(address),
                Call::Pvalidate(address, Validation::Unvalidated),
                Call::Msr(0x014 | address | (2 << 52)),
                Call::Msr(0x012 | address),
                Call::GhcbExit { gpa: address, exit_code: 0x72 }
            ]
        );
    }

    #[test]
    fn unsupported_protocol_version_terminates() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        // Versions 3..=4 only.
        let mut platform = cpuid_platform(&[0x0004_0003_3300_0001]);
        let mut frame = frame();

        let request = handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap_err();

        assert_eq!(request.reason, TerminationReason::GhcbProtocolVersion);
        assert_eq!(u64::from(request), 0x100 | (1 << 16));
        assert!(!handler.is_ready());
    }

    #[test]
    fn missing_snp_feature_terminates() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, snp());
        let mut platform = cpuid_platform(&[SEV_INFO, 0x081]);
        let mut frame = frame();

        let request = handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap_err();

        assert_eq!(request.reason, TerminationReason::SnpFeatureNotSupported);
    }

    #[test]
    fn unknown_hypervisor_features_are_ignored() {
        let (ghcb, address) = page();
        let mut handler = BootVcHandler::new(ghcb, snp());
        let mut platform =
            cpuid_platform(&[SEV_INFO, SNP_FEATURES | (1 << 52), PSC_OK, address | 0x013]);
        let mut frame = frame();

        assert_eq!(handler.handle(&mut platform, &mut frame, 0x72, &identity), Ok(()));
        assert!(handler.is_ready());
    }

    #[test]
    fn malformed_feature_response_terminates() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, snp());
        // Answer to a different request.
        let mut platform = cpuid_platform(&[SEV_INFO, 0x013 | (1 << 12)]);
        let mut frame = frame();

        let request = handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap_err();

        assert_eq!(request.reason, TerminationReason::GhcbProtocolVersion);
    }

    #[test]
    fn rejected_registration_terminates() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, snp());
        let mut platform =
            cpuid_platform(&[SEV_INFO, SNP_FEATURES, PSC_OK, 0xFFFF_FFFF_FFFF_F013]);
        let mut frame = frame();

        let request = handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap_err();

        assert_eq!(request.reason, TerminationReason::GhcbRegistration);
        assert_eq!(u64::from(request), 0x100 | (1 << 12));
    }

    #[test]
    fn unhandled_trap_terminates() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        let mut platform = cpuid_platform(&[SEV_INFO]);
        let mut frame = frame();

        let request = handler.handle(&mut platform, &mut frame, 0x7B, &identity).unwrap_err();

        assert_eq!(request.reason, TerminationReason::General);
        assert_eq!(frame.rip, RIP);
    }

    #[test]
    #[should_panic(expected = "General")]
    fn handle_or_terminate_terminates() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        let mut platform = cpuid_platform(&[SEV_INFO]);
        let mut frame = frame();

        handler.handle_or_terminate(&mut platform, &mut frame, 0x400, &identity);
    }

    #[test]
    fn shutdown_encrypts_and_unmaps() {
        let (ghcb, address) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        let mut platform = cpuid_platform(&[SEV_INFO]);
        let mut frame = frame();
        handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap();
        assert!(handler.is_ghcb_fault(VirtAddr::new(address + 0x10)));
        platform.calls.clear();

        let page = handler.shutdown(&mut platform);

        assert!(page.is_some());
        assert_eq!(platform.calls, vec![Call::Encrypt(address), Call::Unmap(address)]);
        assert!(!handler.is_ghcb_fault(VirtAddr::new(address + 0x10)));
    }

    #[test]
    fn shutdown_before_setup_does_nothing() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, snp());
        let mut platform = FakePlatform::default();

        assert_eq!(handler.try_shutdown(&mut platform).map(|page| page.is_some()), Ok(false));
        assert!(platform.calls.is_empty());
    }

    #[test]
    fn failed_unmap_is_fatal() {
        let (ghcb, _) = page();
        let mut handler = BootVcHandler::new(ghcb, es());
        let mut platform = cpuid_platform(&[SEV_INFO]);
        let mut frame = frame();
        handler.handle(&mut platform, &mut frame, 0x72, &identity).unwrap();
        platform.fail_mapping = true;

        let result = handler.try_shutdown(&mut platform).map(|page| page.is_some());

        assert_eq!(result, Err(TerminationRequest::from(TerminationReason::General)));
    }
}
