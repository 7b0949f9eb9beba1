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

//! The GHCBs used once the kernel is running.
//!
//! The boot CPU starts out with a single early GHCB. When the per-CPU areas
//! are available every CPU gets its own page and the early one is released.
//! A trap that can't be emulated is turned into an exception for the normal
//! fault handlers instead of terminating the guest.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use snafu::prelude::*;
use spinning_top::Spinlock;
use x86_64::PhysAddr;

use crate::{
    boot::BootPlatform,
    event::{EventInjection, ExceptionVector},
    ghcb::{Ghcb, GhcbChannel, GhcbError},
    msr::{register_ghcb_location, RegisterGhcbGpaError, RegisterGhcbGpaRequest, SevStatus},
    page_state::{make_private, make_shared, PageStateError},
    platform::{Hypervisor, MappingError, PageEncryption, PageValidator, VcPlatform},
    vc::{emulate, TrapFrame, VcError},
    Translator,
};

#[derive(Debug, PartialEq, Snafu)]
pub enum RuntimeError {
    #[snafu(display("CPU {cpu} doesn't exist"))]
    InvalidCpu { cpu: usize },
    #[snafu(display("got {actual} GHCB pages for {expected} CPUs"))]
    CpuCount { expected: usize, actual: usize },
    #[snafu(display("the GHCB of CPU {cpu} is in use"))]
    Busy { cpu: usize },
    #[snafu(display("couldn't set up the GHCB"))]
    Channel { source: GhcbError },
    #[snafu(display("couldn't change the GHCB mapping"))]
    Mapping { source: MappingError },
    #[snafu(display("couldn't change the GHCB page state"))]
    PageState { source: PageStateError },
    #[snafu(display("couldn't register the GHCB"))]
    Registration { source: RegisterGhcbGpaError },
}

/// An exception to raise on the trapping CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InjectedFault {
    pub vector: ExceptionVector,
    pub error_code: u32,
}

impl From<EventInjection> for InjectedFault {
    fn from(event: EventInjection) -> Self {
        Self {
            vector: event.vector().unwrap_or(ExceptionVector::GeneralProtection),
            error_code: event.error_code(),
        }
    }
}

#[derive(Debug, PartialEq, Snafu)]
pub enum TrapError {
    #[snafu(display("CPU {cpu} has no GHCB"))]
    NoGhcb { cpu: usize },
    /// A trap was taken while the GHCB was in the middle of an exchange.
    #[snafu(display("nested #VC on CPU {cpu}"))]
    GhcbBusy { cpu: usize },
    #[snafu(display("raising {fault:?}"))]
    Inject { fault: InjectedFault },
}

type Slot<G> = Spinlock<Option<GhcbChannel<G>>>;

pub struct RuntimeGhcbs<G: AsMut<Ghcb> + AsRef<Ghcb>> {
    status: SevStatus,
    early: Slot<G>,
    per_cpu: Vec<Slot<G>>,
    promoted: AtomicBool,
}

impl<G: AsMut<Ghcb> + AsRef<Ghcb>> RuntimeGhcbs<G> {
    pub fn new(status: SevStatus, cpus: usize) -> Self {
        Self {
            status,
            early: Spinlock::new(None),
            per_cpu: (0..cpus).map(|_| Spinlock::new(None)).collect(),
            promoted: AtomicBool::new(false),
        }
    }

    fn prepare<P, T>(
        &self,
        platform: &mut P,
        page: G,
        translate: &T,
    ) -> Result<GhcbChannel<G>, RuntimeError>
    where
        P: Hypervisor + PageEncryption + PageValidator,
        T: Translator,
    {
        let mut channel = GhcbChannel::new(page, translate).context(ChannelSnafu)?;
        platform.set_decrypted(channel.page()).context(MappingSnafu)?;
        channel.reset();
        if self.status.snp_active() {
            if let Err(err) = make_shared(platform, PhysAddr::new(channel.gpa().as_u64())) {
                let page = channel.page();
                if let Err(unwind) =
                    platform.set_encrypted(page).and_then(|()| platform.unmap(page))
                {
                    log::error!("couldn't re-encrypt GHCB {:#x}: {unwind}", channel.gpa().as_u64());
                }
                return Err(err).context(PageStateSnafu);
            }
        }
        Ok(channel)
    }

    /// Releases channels that never got installed. Failures are logged so
    /// that every page gets a chance to be re-encrypted.
    fn discard<P>(&self, platform: &mut P, channels: Vec<GhcbChannel<G>>)
    where
        P: Hypervisor + PageEncryption + PageValidator,
    {
        for channel in channels {
            let gpa = channel.gpa().as_u64();
            if let Err(err) = self.release(platform, channel) {
                log::error!("couldn't release GHCB {gpa:#x}: {err}");
            }
        }
    }

    fn release<P>(&self, platform: &mut P, channel: GhcbChannel<G>) -> Result<(), RuntimeError>
    where
        P: Hypervisor + PageEncryption + PageValidator,
    {
        if self.status.snp_active() {
            make_private(platform, PhysAddr::new(channel.gpa().as_u64())).context(PageStateSnafu)?;
        }
        let page = channel.page();
        platform.set_encrypted(page).context(MappingSnafu)?;
        platform.unmap(page).context(MappingSnafu)
    }

    /// Installs the GHCB used by the boot CPU until [`RuntimeGhcbs::promote`].
    ///
    /// Does nothing unless SEV-ES is active.
    pub fn early_init<P: BootPlatform, T: Translator>(
        &self,
        platform: &mut P,
        page: G,
        translate: &T,
    ) -> Result<(), RuntimeError> {
        if !self.status.es_active() {
            return Ok(());
        }
        let channel = self.prepare(platform, page, translate)?;
        if self.status.snp_active() {
            if let Err(err) =
                register_ghcb_location(platform, RegisterGhcbGpaRequest::new(channel.gpa()))
            {
                self.discard(platform, alloc::vec![channel]);
                return Err(err).context(RegistrationSnafu);
            }
        }
        log::info!("early GHCB at {:#x}", channel.gpa().as_u64());
        *self.early.lock() = Some(channel);
        Ok(())
    }

    /// Gives every CPU its own GHCB and releases the early one.
    ///
    /// Under SEV-SNP each CPU still has to call [`RuntimeGhcbs::register_cpu`]
    /// before it takes a trap.
    pub fn promote<P, I, T>(&self, platform: &mut P, pages: I, translate: &T) -> Result<(), RuntimeError>
    where
        P: BootPlatform,
        I: IntoIterator<Item = G>,
        T: Translator,
    {
        if !self.status.es_active() {
            return Ok(());
        }
        let pages: Vec<G> = pages.into_iter().collect();
        ensure!(
            pages.len() == self.per_cpu.len(),
            CpuCountSnafu { expected: self.per_cpu.len(), actual: pages.len() }
        );
        let mut channels = Vec::with_capacity(pages.len());
        for page in pages {
            match self.prepare(platform, page, translate) {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    self.discard(platform, channels);
                    return Err(err);
                }
            }
        }
        for (slot, channel) in self.per_cpu.iter().zip(channels) {
            *slot.lock() = Some(channel);
        }
        self.promoted.store(true, Ordering::Release);

        let early = self.early.lock().take();
        if let Some(early) = early {
            self.release(platform, early)?;
        }
        log::info!("switched to per-CPU GHCBs for {} CPUs", self.per_cpu.len());
        Ok(())
    }

    /// Registers the GHCB of `cpu` with the hypervisor. Must run on `cpu`.
    pub fn register_cpu<P: Hypervisor>(&self, cpu: usize, platform: &mut P) -> Result<(), RuntimeError> {
        if !self.status.snp_active() {
            return Ok(());
        }
        let slot = self.per_cpu.get(cpu).context(InvalidCpuSnafu { cpu })?;
        let guard = slot.try_lock().context(BusySnafu { cpu })?;
        match guard.as_ref() {
            Some(channel) => register_ghcb_location(platform, RegisterGhcbGpaRequest::new(channel.gpa()))
                .context(RegistrationSnafu),
            None => Ok(()),
        }
    }

    /// Releases the GHCB of `cpu` before it goes offline.
    pub fn shutdown_cpu<P: BootPlatform>(&self, cpu: usize, platform: &mut P) -> Result<(), RuntimeError> {
        let slot = self.per_cpu.get(cpu).context(InvalidCpuSnafu { cpu })?;
        let channel = slot.try_lock().context(BusySnafu { cpu })?.take();
        match channel {
            Some(channel) => self.release(platform, channel),
            None => Ok(()),
        }
    }

    /// Handles a #VC raised on `cpu`.
    pub fn handle<P: VcPlatform, T: Translator>(
        &self,
        cpu: usize,
        platform: &mut P,
        frame: &mut TrapFrame,
        exit_code: u64,
        translate: &T,
    ) -> Result<(), TrapError> {
        let slot = if self.promoted.load(Ordering::Acquire) {
            self.per_cpu.get(cpu).context(NoGhcbSnafu { cpu })?
        } else {
            &self.early
        };
        let mut guard = slot.try_lock().context(GhcbBusySnafu { cpu })?;
        let channel = guard.as_mut().context(NoGhcbSnafu { cpu })?;
        let mut session = channel.start(platform);

        let event = match emulate(&mut session, frame, exit_code, translate) {
            Ok(_) => return Ok(()),
            Err(VcError::Exception { event }) => event,
            Err(err) => {
                log::error!("couldn't handle #VC {exit_code:#x} at {:#x}: {err}", frame.rip);
                session.issue_unsupported(exit_code, 0)
            }
        };
        InjectSnafu { fault: InjectedFault::from(event) }.fail()
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use x86_64::VirtAddr;

    use super::*;
    use crate::{
        ghcb::{tests::identity, SW_EXIT_CODE_UNSUPPORTED_EVENT},
        platform::testing::{Call, FakePlatform},
        vc::{
            testing::{frame, RIP},
            Gpr,
        },
    };

    const CPUID: [u8; 2] = [0x0F, 0xA2];

    fn es() -> SevStatus {
        SevStatus::SEV_ENABLED | SevStatus::SEV_ES_ENABLED
    }

    fn page() -> (Box<Ghcb>, u64) {
        let ghcb = Box::new(Ghcb::new());
        let address = &*ghcb as *const Ghcb as u64;
        (ghcb, address)
    }

    fn platform() -> FakePlatform {
        let mut platform = FakePlatform::with_ghcb_handler(|ghcb| {
            ghcb.set_rax(0xA);
            ghcb.set_rbx(0xB);
            ghcb.set_rcx(0xC);
            ghcb.set_rdx(0xD);
        });
        platform.load(RIP, &CPUID);
        platform
    }

    fn gpas(platform: &FakePlatform) -> Vec<u64> {
        platform
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::GhcbExit { gpa, .. } => Some(*gpa),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn early_ghcb_serves_the_boot_cpu() {
        let ghcbs = RuntimeGhcbs::new(es(), 2);
        let (early, address) = page();
        let mut platform = platform();
        let mut frame = frame();

        ghcbs.early_init(&mut platform, early, &identity).unwrap();
        let result = ghcbs.handle(0, &mut platform, &mut frame, 0x72, &identity);

        assert_eq!(result, Ok(()));
        assert_eq!(frame[Gpr::Rdx], 0xD);
        assert_eq!(platform.calls[0], Call::Decrypt(address));
        assert_eq!(gpas(&platform), vec![address]);
    }

    #[test]
    fn nothing_is_set_up_without_sev_es() {
        let ghcbs = RuntimeGhcbs::new(SevStatus::SEV_ENABLED, 1);
        let (early, _) = page();
        let mut platform = platform();
        let mut frame = frame();

        ghcbs.early_init(&mut platform, early, &identity).unwrap();

        assert!(platform.calls.is_empty());
        assert_eq!(
            ghcbs.handle(0, &mut platform, &mut frame, 0x72, &identity),
            Err(TrapError::NoGhcb { cpu: 0 })
        );
    }

    #[test]
    fn promote_switches_to_per_cpu_pages() {
        let ghcbs = RuntimeGhcbs::new(es(), 2);
        let (early, early_address) = page();
        let (cpu0, _) = page();
        let (cpu1, cpu1_address) = page();
        let mut platform = platform();
        ghcbs.early_init(&mut platform, early, &identity).unwrap();
        platform.calls.clear();

        ghcbs.promote(&mut platform, [cpu0, cpu1], &identity).unwrap();

        assert_eq!(
            platform.calls[2..],
            [Call::Encrypt(early_address), Call::Unmap(early_address)]
        );
        let mut frame = frame();
        ghcbs.handle(1, &mut platform, &mut frame, 0x72, &identity).unwrap();
        assert_eq!(gpas(&platform), vec![cpu1_address]);
    }

    #[test]
    fn promote_needs_a_page_per_cpu() {
        let ghcbs = RuntimeGhcbs::new(es(), 2);
        let (cpu0, _) = page();
        let mut platform = platform();

        assert_eq!(
            ghcbs.promote(&mut platform, [cpu0], &identity),
            Err(RuntimeError::CpuCount { expected: 2, actual: 1 })
        );
        assert!(platform.calls.is_empty());
    }

    #[test]
    fn failed_promote_re_encrypts_prepared_pages() {
        let ghcbs = RuntimeGhcbs::new(es(), 2);
        let (cpu0, cpu0_address) = page();
        let (cpu1, cpu1_address) = page();
        let mut platform = platform();
        let translate = move |address: VirtAddr| {
            (address.as_u64() != cpu1_address).then(|| PhysAddr::new(address.as_u64()))
        };

        let result = ghcbs.promote(&mut platform, [cpu0, cpu1], &translate);

        assert_eq!(
            result,
            Err(RuntimeError::Channel {
                source: GhcbError::TranslationFailed { address: cpu1_address }
            })
        );
        assert_eq!(
            platform.calls,
            vec![Call::Decrypt(cpu0_address), Call::Encrypt(cpu0_address), Call::Unmap(cpu0_address)]
        );
        let mut frame = frame();
        assert_eq!(
            ghcbs.handle(0, &mut platform, &mut frame, 0x72, &identity),
            Err(TrapError::NoGhcb { cpu: 0 })
        );
    }

    #[test]
    fn failed_registration_re_encrypts_the_early_page() {
        let ghcbs = RuntimeGhcbs::new(es() | SevStatus::SNP_ACTIVE, 1);
        let (early, address) = page();
        let mut platform = FakePlatform::default();
        platform.msr_responses = [0x015, 0x6013, 0x015].into_iter().collect();

        let result = ghcbs.early_init(&mut platform, early, &identity);

        assert_eq!(
            result,
            Err(RuntimeError::Registration {
                source: RegisterGhcbGpaError::GhcbResponseLocationNotMatchingRequest {
                    response_ghcb_gpa: 0x6000
                }
            })
        );
        assert_eq!(platform.calls[0], Call::Decrypt(address));
        assert_eq!(platform.calls[platform.calls.len() - 2..], [Call::Encrypt(address), Call::Unmap(address)]);
        assert!(ghcbs.early.lock().is_none());
    }

    #[test]
    fn failed_page_state_change_re_encrypts_the_page() {
        let ghcbs = RuntimeGhcbs::new(es() | SevStatus::SNP_ACTIVE, 1);
        let (early, address) = page();
        let mut platform = FakePlatform::default();
        platform.msr_responses = [0x015 | (1 << 32)].into_iter().collect();

        let result = ghcbs.early_init(&mut platform, early, &identity);

        assert!(matches!(result, Err(RuntimeError::PageState { .. })));
        assert_eq!(platform.calls[platform.calls.len() - 2..], [Call::Encrypt(address), Call::Unmap(address)]);
    }

    #[test]
    fn offline_cpu_has_no_ghcb() {
        let ghcbs = RuntimeGhcbs::new(es(), 1);
        let (cpu0, address) = page();
        let mut platform = platform();
        ghcbs.promote(&mut platform, [cpu0], &identity).unwrap();
        platform.calls.clear();

        ghcbs.shutdown_cpu(0, &mut platform).unwrap();

        assert_eq!(platform.calls, vec![Call::Encrypt(address), Call::Unmap(address)]);
        let mut frame = frame();
        assert_eq!(
            ghcbs.handle(0, &mut platform, &mut frame, 0x72, &identity),
            Err(TrapError::NoGhcb { cpu: 0 })
        );
        assert_eq!(ghcbs.shutdown_cpu(3, &mut platform), Err(RuntimeError::InvalidCpu { cpu: 3 }));
    }

    #[test]
    fn nested_trap_is_rejected() {
        let ghcbs = RuntimeGhcbs::new(es(), 1);
        let (early, _) = page();
        let mut platform = platform();
        ghcbs.early_init(&mut platform, early, &identity).unwrap();

        let _in_use = ghcbs.early.lock();
        let mut frame = frame();

        assert_eq!(
            ghcbs.handle(0, &mut platform, &mut frame, 0x72, &identity),
            Err(TrapError::GhcbBusy { cpu: 0 })
        );
    }

    #[test]
    fn hypervisor_exception_is_injected() {
        let ghcbs = RuntimeGhcbs::new(es(), 1);
        let (early, _) = page();
        // #GP with error code 0x18.
        let mut platform = FakePlatform::with_ghcb_handler(|ghcb| {
            ghcb.sw_exit_info_1 = 1;
            ghcb.sw_exit_info_2 = 0x0000_0018_8000_0B0D;
        });
        platform.load(RIP, &CPUID);
        ghcbs.early_init(&mut platform, early, &identity).unwrap();
        let mut frame = frame();

        let result = ghcbs.handle(0, &mut platform, &mut frame, 0x72, &identity);

        assert_eq!(
            result,
            Err(TrapError::Inject {
                fault: InjectedFault { vector: ExceptionVector::GeneralProtection, error_code: 0x18 }
            })
        );
        assert_eq!(frame.rip, RIP);
    }

    #[test]
    fn unsupported_trap_is_reported_to_the_hypervisor() {
        let ghcbs = RuntimeGhcbs::new(es(), 1);
        let (early, _) = page();
        let mut platform = FakePlatform::default();
        platform.load(RIP, &CPUID);
        ghcbs.early_init(&mut platform, early, &identity).unwrap();
        let mut frame = frame();

        let result = ghcbs.handle(0, &mut platform, &mut frame, 0x400, &identity);

        assert_eq!(
            result,
            Err(TrapError::Inject {
                fault: InjectedFault { vector: ExceptionVector::GeneralProtection, error_code: 0 }
            })
        );
        assert_eq!(platform.ghcb_exits(), vec![SW_EXIT_CODE_UNSUPPORTED_EVENT]);
        assert_eq!(platform.interrupt_depth.get(), 0);
    }

    #[test]
    fn snp_pages_are_shared_and_registered() {
        let ghcbs = RuntimeGhcbs::new(es() | SevStatus::SNP_ACTIVE, 1);
        let (early, address) = page();
        let mut platform = FakePlatform::default();
        platform.msr_responses = [0x015, address | 0x013].into_iter().collect();

        ghcbs.early_init(&mut platform, early, &identity).unwrap();

        assert_eq!(
            platform.msr_requests,
            vec![0x014 | address | (2 << 52), 0x012 | address]
        );
    }
}
