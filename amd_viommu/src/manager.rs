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


//! Per-IOMMU and per-guest vIOMMU resources.
//!
//! Locks are always taken in the same order: the IOMMU first, then the GID
//! index.

use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use snafu::prelude::*;
use spinning_top::{guard::SpinlockGuard, Spinlock};
use x86_64::PhysAddr;

use crate::{
    config::ViommuConfig,
    device::DeviceId,
    error::{
        CapabilityNotFoundSnafu, DeviceNotBoundSnafu, DomainNotBoundSnafu, DomainNotFoundSnafu,
        FeatureNotSupportedSnafu, GidNotFoundSnafu, HardwareSnafu, InvalidBarSnafu,
        NoDeviceSnafu, ViommuError,
    },
    gid::GidAllocator,
    hardware::{ControlFeature, GuestRegisters, IommuHardware, MmioWindows},
    mmio,
    region::{
        per_gid_iova, PrivateRegion, DEVICE_ID_ENTRY_SHIFT, DEVICE_ID_TABLE_BASE,
        DEVICE_ID_TABLE_SIZE, DIRTY_STATUS_BASE, DIRTY_STATUS_SIZE, DOMAIN_ID_ENTRY_SHIFT,
        DOMAIN_ID_TABLE_BASE, DOMAIN_ID_TABLE_SIZE, GUEST_MMIO_BASE, GUEST_MMIO_SIZE,
    },
    registers::{
        id_map_clear, id_map_control, ExtendedFeatures, VfctrlRegister, MAPPING_HOST_ID,
        MAPPING_VALID, MISC_HOST_DEVICE_ID, VFCTRL_WINDOW_SIZE, VF_WINDOW_SIZE,
        VSC_BAR_ENABLE, VSC_VFCTRL_BAR_HIGH, VSC_VFCTRL_BAR_LOW, VSC_VF_BAR_HIGH, VSC_VF_BAR_LOW,
    },
};

/// PASID whose translations are flushed after a device is bound.
const DEFAULT_PASID: u32 = 0;

fn hardware_error(message: &'static str) -> ViommuError {
    ViommuError::Hardware { message }
}

/// Byte offset and bit of the command buffer dirty status of `gid`.
fn dirty_status_position(gid: u16) -> (usize, u32) {
    let offset = ((gid & 0xFF) << 4) | (((gid >> 13) & 0x7) << 2);
    (offset as usize, ((gid >> 8) & 0x1F) as u32)
}

/// Allocates `size` bytes of private memory and maps it at `iova`.
fn map_region<H: IommuHardware>(
    hardware: &mut H,
    iova: u64,
    size: usize,
) -> Result<PrivateRegion, ViommuError> {
    let region = PrivateRegion::allocate(iova, size)?;
    hardware.map_private(&region).map_err(hardware_error)?;
    log::debug!("mapped {size:#x} bytes of private memory at IOVA {iova:#x}");
    Ok(region)
}

/// Reads a 64-bit BAR out of the vendor-specific capability at `vsc`.
fn read_bar<H: IommuHardware>(
    hardware: &mut H,
    vsc: u8,
    low: u8,
    high: u8,
) -> Result<PhysAddr, ViommuError> {
    let offset = |register: u8| {
        vsc.checked_add(register).context(HardwareSnafu { message: "capability out of range" })
    };
    let low_bits = hardware.read_config(offset(low)?).map_err(hardware_error)?;
    let high_bits = hardware.read_config(offset(high)?).map_err(hardware_error)?;
    let bar = (high_bits as u64) << 32 | low_bits as u64;
    ensure!(bar & VSC_BAR_ENABLE != 0, InvalidBarSnafu { offset: low });

    let address = bar & !VSC_BAR_ENABLE;
    ensure!(address != 0, InvalidBarSnafu { offset: low });
    PhysAddr::try_new(address).ok().context(InvalidBarSnafu { offset: low })
}

/// An IOMMU with virtualization enabled.
struct Iommu<H> {
    hardware: H,
    windows: MmioWindows,
    /// Kept alive for as long as the IOMMU uses its private address space.
    _guest_mmio: PrivateRegion,
    dirty_status: PrivateRegion,
}

impl<H: IommuHardware> Iommu<H> {
    /// Sets up the VF windows and the private address space, and turns on
    /// IOMMU virtualization.
    fn new(mut hardware: H) -> Result<Self, ViommuError> {
        let id = hardware.device_id();
        ensure!(
            hardware.extended_features().contains(ExtendedFeatures::VIOMMU),
            FeatureNotSupportedSnafu { iommu: id }
        );
        let vsc = hardware.vendor_capability().context(CapabilityNotFoundSnafu { iommu: id })?;
        log::debug!("IOMMU {id}: vendor-specific capability at {vsc:#x}");

        let windows = MmioWindows {
            vf: read_bar(&mut hardware, vsc, VSC_VF_BAR_LOW, VSC_VF_BAR_HIGH)?,
            vfctrl: read_bar(&mut hardware, vsc, VSC_VFCTRL_BAR_LOW, VSC_VFCTRL_BAR_HIGH)?,
        };
        hardware.map_mmio(windows.vf, VF_WINDOW_SIZE).map_err(hardware_error)?;
        hardware.map_mmio(windows.vfctrl, VFCTRL_WINDOW_SIZE).map_err(hardware_error)?;
        log::debug!(
            "IOMMU {id}: VF at {:#x}, VF control at {:#x}",
            windows.vf.as_u64(),
            windows.vfctrl.as_u64()
        );

        hardware.create_private_domain().map_err(hardware_error)?;
        let guest_mmio = match map_region(&mut hardware, GUEST_MMIO_BASE, GUEST_MMIO_SIZE) {
            Ok(region) => region,
            Err(err) => {
                hardware.destroy_private_domain();
                return Err(err);
            }
        };
        let dirty_status = match map_region(&mut hardware, DIRTY_STATUS_BASE, DIRTY_STATUS_SIZE) {
            Ok(region) => region,
            Err(err) => {
                hardware.unmap_private(&guest_mmio);
                hardware.destroy_private_domain();
                return Err(err);
            }
        };

        hardware.enable_feature(ControlFeature::VirtualCommands);
        hardware.enable_feature(ControlFeature::Viommu);

        Ok(Self { hardware, windows, _guest_mmio: guest_mmio, dirty_status })
    }

    fn registers(&mut self, gid: u16) -> GuestRegisters<'_, H> {
        GuestRegisters::new(&mut self.hardware, &self.windows, gid)
    }

    /// Allocates and maps the mapping tables of `gid` and wipes whatever a
    /// previous owner of the GID left behind.
    fn init_guest(&mut self, gid: u16) -> Result<GuestTables, ViommuError> {
        let device_ids = map_region(
            &mut self.hardware,
            per_gid_iova(DEVICE_ID_TABLE_BASE, DEVICE_ID_TABLE_SIZE, gid),
            DEVICE_ID_TABLE_SIZE,
        )?;
        let domain_ids = match map_region(
            &mut self.hardware,
            per_gid_iova(DOMAIN_ID_TABLE_BASE, DOMAIN_ID_TABLE_SIZE, gid),
            DOMAIN_ID_TABLE_SIZE,
        ) {
            Ok(region) => region,
            Err(err) => {
                self.hardware.unmap_private(&device_ids);
                return Err(err);
            }
        };

        self.clear_mappings(gid);
        self.clear_dirty_status(gid);
        Ok(GuestTables { device_ids, domain_ids })
    }

    fn release_tables(&mut self, tables: GuestTables) {
        self.hardware.unmap_private(&tables.device_ids);
        self.hardware.unmap_private(&tables.domain_ids);
    }

    /// Removes every device and domain ID mapping of `gid`.
    fn clear_mappings(&mut self, gid: u16) {
        let mut registers = self.registers(gid);
        for guest in 0..=u16::MAX {
            registers.write_vfctrl(VfctrlRegister::DeviceIdMap, id_map_clear(guest));
        }
        registers.update_vfctrl(VfctrlRegister::Misc, |misc| MISC_HOST_DEVICE_ID.set(misc, 0));
        for guest in 0..=u16::MAX {
            registers.write_vfctrl(VfctrlRegister::DomainIdMap, id_map_clear(guest));
        }
    }

    fn clear_dirty_status(&mut self, gid: u16) {
        let (offset, bit) = dirty_status_position(gid);
        if self.dirty_status.clear_bit(offset, bit).is_none() {
            log::warn!("dirty status of GID {gid} is out of range");
        }
    }

    /// Points the device table entry of `host` and the device ID map of `gid`
    /// at each other.
    fn program_device(&mut self, host: DeviceId, gid: u16, guest_device: u16) {
        let mut entry = self.hardware.device_table_entry(host);
        entry.clear_viommu();
        entry.set_viommu(gid, guest_device);
        self.hardware.set_device_table_entry(host, entry);
        self.hardware.flush_device_table_entry(host);

        self.registers(gid)
            .write_vfctrl(VfctrlRegister::DeviceIdMap, id_map_control(guest_device, host.into()));
        self.hardware.wbinvd_all_cpus();
        self.registers(gid).update_vfctrl(VfctrlRegister::Misc, |misc| {
            MISC_HOST_DEVICE_ID.set(misc, u16::from(host) as u64)
        });
    }

    fn unprogram_device(&mut self, host: DeviceId, gid: u16, guest_device: u16) {
        let mut entry = self.hardware.device_table_entry(host);
        entry.clear_viommu();
        self.hardware.set_device_table_entry(host, entry);
        self.hardware.flush_device_table_entry(host);

        self.registers(gid).write_vfctrl(VfctrlRegister::DeviceIdMap, id_map_clear(guest_device));
        self.hardware.wbinvd_all_cpus();
        self.registers(gid)
            .update_vfctrl(VfctrlRegister::Misc, |misc| MISC_HOST_DEVICE_ID.set(misc, 0));
    }

    /// Flushes the IOTLB of the domain `host` is attached to.
    fn flush_device_domain(&mut self, host: DeviceId) -> Result<(), ViommuError> {
        let domain = self
            .hardware
            .attached_domain(host)
            .context(DomainNotFoundSnafu { device: host })?;
        self.hardware.flush_domain_tlb(domain, DEFAULT_PASID);
        Ok(())
    }

    fn program_domain(&mut self, gid: u16, guest_domain: u16, host_domain: u16) {
        self.registers(gid)
            .write_vfctrl(VfctrlRegister::DomainIdMap, id_map_control(guest_domain, host_domain));
        self.hardware.wbinvd_all_cpus();
    }

    fn unprogram_domain(&mut self, gid: u16, guest_domain: u16) {
        self.registers(gid).write_vfctrl(VfctrlRegister::DomainIdMap, id_map_clear(guest_domain));
        self.hardware.wbinvd_all_cpus();
    }
}

/// The device and domain ID mapping tables of one guest.
struct GuestTables {
    device_ids: PrivateRegion,
    domain_ids: PrivateRegion,
}

fn mapping_entry(host: u16) -> u64 {
    MAPPING_VALID.set(MAPPING_HOST_ID.set(0, host as u64), 1)
}

fn mapped_host(entry: u64) -> Option<u16> {
    (MAPPING_VALID.get(entry) != 0).then_some(MAPPING_HOST_ID.get(entry) as u16)
}

impl GuestTables {
    fn host_device(&self, guest_device: u16) -> Option<DeviceId> {
        let entry = self.device_ids.read_u64((guest_device as usize) << DEVICE_ID_ENTRY_SHIFT)?;
        mapped_host(entry).map(DeviceId::from)
    }

    fn set_host_device(&mut self, guest_device: u16, host: Option<DeviceId>) -> Option<()> {
        let entry = host.map_or(0, |host| mapping_entry(host.into()));
        self.device_ids.write_u64((guest_device as usize) << DEVICE_ID_ENTRY_SHIFT, entry)
    }

    fn host_domain(&self, guest_domain: u16) -> Option<u16> {
        let entry = self.domain_ids.read_u64((guest_domain as usize) << DOMAIN_ID_ENTRY_SHIFT)?;
        mapped_host(entry)
    }

    fn set_host_domain(&mut self, guest_domain: u16, host: Option<u16>) -> Option<()> {
        let entry = host.map_or(0, mapping_entry);
        self.domain_ids.write_u64((guest_domain as usize) << DOMAIN_ID_ENTRY_SHIFT, entry)
    }
}

struct GuestContext {
    iommu: DeviceId,
    /// `None` until the guest is fully initialized.
    tables: Option<GuestTables>,
}

/// Owner of every vIOMMU resource on the host: the IOMMUs with
/// virtualization enabled and the guests attached to them.
pub struct ViommuManager<H> {
    enabled: AtomicBool,
    gids: GidAllocator<GuestContext>,
    iommus: HashMap<DeviceId, Spinlock<Iommu<H>>>,
}

impl<H: IommuHardware> ViommuManager<H> {
    pub fn new(config: ViommuConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            gids: GidAllocator::new(),
            iommus: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables IOMMU virtualization on `hardware`.
    ///
    /// A failure turns vIOMMU support off for every IOMMU initialized after
    /// this one.
    pub fn init_iommu(&mut self, hardware: H) -> Result<(), ViommuError> {
        ensure!(self.is_enabled(), crate::error::DisabledSnafu);
        let id = hardware.device_id();
        match Iommu::new(hardware) {
            Ok(iommu) => {
                log::info!("IOMMU {id}: virtualization enabled");
                self.iommus.insert(id, Spinlock::new(iommu));
                Ok(())
            }
            Err(err) => {
                log::error!("IOMMU {id}: couldn't enable virtualization: {err}");
                self.enabled.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn iommu(&self, id: DeviceId) -> Result<SpinlockGuard<'_, Iommu<H>>, ViommuError> {
        self.iommus.get(&id).map(|iommu| iommu.lock()).context(NoDeviceSnafu { iommu: id })
    }

    /// Runs `f` on the tables of an initialized guest of IOMMU `iommu`.
    fn guest<R>(
        &self,
        iommu: DeviceId,
        gid: u16,
        f: impl FnOnce(&mut GuestTables) -> R,
    ) -> Result<R, ViommuError> {
        self.gids
            .with(gid, |context| match &mut context.tables {
                Some(tables) if context.iommu == iommu => Some(f(tables)),
                _ => None,
            })
            .flatten()
            .context(GidNotFoundSnafu { gid })
    }

    /// Allocates a GID on IOMMU `iommu_id` together with its mapping tables.
    ///
    /// On failure nothing stays allocated and the GID is released.
    pub fn init_guest(&self, iommu_id: DeviceId) -> Result<u16, ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        let gid = self.gids.allocate(GuestContext { iommu: iommu_id, tables: None })?;
        match iommu.init_guest(gid) {
            Ok(tables) => {
                self.gids.with(gid, |context| context.tables = Some(tables));
                log::debug!("IOMMU {iommu_id}: initialized GID {gid}");
                Ok(gid)
            }
            Err(err) => {
                log::error!("IOMMU {iommu_id}: couldn't initialize GID {gid}: {err}");
                self.gids.free(gid);
                Err(err)
            }
        }
    }

    /// Releases the mapping tables of `gid` and the GID itself.
    pub fn destroy_guest(&self, iommu_id: DeviceId, gid: u16) -> Result<(), ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        let tables = self
            .gids
            .with(gid, |context| (context.iommu == iommu_id).then(|| context.tables.take()))
            .flatten()
            .context(GidNotFoundSnafu { gid })?;
        if let Some(tables) = tables {
            iommu.release_tables(tables);
        }
        self.gids.free(gid);
        log::debug!("IOMMU {iommu_id}: destroyed GID {gid}");
        Ok(())
    }

    /// Makes host device `host` visible to guest `gid` as `guest_device`.
    pub fn bind_device(
        &self,
        iommu_id: DeviceId,
        host: DeviceId,
        gid: u16,
        guest_device: u16,
    ) -> Result<(), ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |_| ())?;

        iommu.program_device(host, gid, guest_device);
        if let Err(err) = iommu.flush_device_domain(host) {
            log::error!("GID {gid}: couldn't bind device {host}: {err}");
            iommu.unprogram_device(host, gid, guest_device);
            return Err(err);
        }
        self.guest(iommu_id, gid, |tables| tables.set_host_device(guest_device, Some(host)))?
            .context(HardwareSnafu { message: "device mapping table entry out of range" })?;
        log::debug!("GID {gid}: bound device {host} as {guest_device:#x}");
        Ok(())
    }

    pub fn unbind_device(
        &self,
        iommu_id: DeviceId,
        host: DeviceId,
        gid: u16,
        guest_device: u16,
    ) -> Result<(), ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |_| ())?;

        iommu.unprogram_device(host, gid, guest_device);
        self.guest(iommu_id, gid, |tables| tables.set_host_device(guest_device, None))?
            .context(HardwareSnafu { message: "device mapping table entry out of range" })?;
        log::debug!("GID {gid}: unbound device {host} from {guest_device:#x}");
        Ok(())
    }

    /// Maps `guest_domain` to the host domain of the device bound as
    /// `guest_device`.
    pub fn bind_domain(
        &self,
        iommu_id: DeviceId,
        gid: u16,
        guest_device: u16,
        guest_domain: u16,
    ) -> Result<(), ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        let host = self
            .guest(iommu_id, gid, |tables| tables.host_device(guest_device))?
            .context(DeviceNotBoundSnafu { gid, guest_device })?;
        let host_domain = iommu.hardware.device_table_entry(host).domain_id();

        iommu.program_domain(gid, guest_domain, host_domain);
        self.guest(iommu_id, gid, |tables| tables.set_host_domain(guest_domain, Some(host_domain)))?
            .context(HardwareSnafu { message: "domain mapping table entry out of range" })?;
        log::debug!("GID {gid}: bound domain {host_domain:#x} as {guest_domain:#x}");
        Ok(())
    }

    pub fn unbind_domain(
        &self,
        iommu_id: DeviceId,
        gid: u16,
        guest_domain: u16,
    ) -> Result<(), ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |_| ())?;

        iommu.unprogram_domain(gid, guest_domain);
        self.guest(iommu_id, gid, |tables| tables.set_host_domain(guest_domain, None))?
            .context(HardwareSnafu { message: "domain mapping table entry out of range" })?;
        log::debug!("GID {gid}: unbound domain {guest_domain:#x}");
        Ok(())
    }

    /// Host device bound to `guest_device` of `gid`.
    pub fn host_device_id(
        &self,
        iommu_id: DeviceId,
        gid: u16,
        guest_device: u16,
    ) -> Result<DeviceId, ViommuError> {
        let _iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |tables| tables.host_device(guest_device))?
            .context(DeviceNotBoundSnafu { gid, guest_device })
    }

    /// Host domain bound to `guest_domain` of `gid`.
    pub fn host_domain_id(
        &self,
        iommu_id: DeviceId,
        gid: u16,
        guest_domain: u16,
    ) -> Result<u16, ViommuError> {
        let _iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |tables| tables.host_domain(guest_domain))?
            .context(DomainNotBoundSnafu { gid, guest_domain })
    }

    /// Logs every device and domain mapping of `gid` at debug level.
    pub fn dump_mappings(&self, iommu_id: DeviceId, gid: u16) -> Result<(), ViommuError> {
        let _iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |tables| {
            log::debug!(
                "GID {gid}: device table at IOVA {:#x}, domain table at IOVA {:#x}",
                tables.device_ids.iova(),
                tables.domain_ids.iova()
            );
            for guest in 0..=u16::MAX {
                if let Some(host) = tables.host_device(guest) {
                    log::debug!("GID {gid}: device {guest:#x} -> {host}");
                }
                if let Some(host) = tables.host_domain(guest) {
                    log::debug!("GID {gid}: domain {guest:#x} -> {host:#x}");
                }
            }
        })
    }

    /// Emulates a guest read of the IOMMU MMIO register at `offset`.
    ///
    /// Every access operates on the full 64-bit register; `width` is only
    /// logged.
    pub fn mmio_read(
        &self,
        iommu_id: DeviceId,
        gid: u16,
        offset: u64,
        width: u8,
    ) -> Result<u64, ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |_| ())?;
        let value = mmio::read(&mut iommu.registers(gid), offset);
        log::debug!("GID {gid}: MMIO read of {width} bytes at {offset:#x}: {value:#x}");
        Ok(value)
    }

    /// Emulates a guest write of `value` to the IOMMU MMIO register at
    /// `offset`.
    pub fn mmio_write(
        &self,
        iommu_id: DeviceId,
        gid: u16,
        offset: u64,
        width: u8,
        value: u64,
    ) -> Result<(), ViommuError> {
        let mut iommu = self.iommu(iommu_id)?;
        self.guest(iommu_id, gid, |_| ())?;
        log::debug!("GID {gid}: MMIO write of {width} bytes at {offset:#x}: {value:#x}");
        mmio::write(&mut iommu.registers(gid), offset, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;
    use crate::{
        registers::DeviceTableEntry,
        testing::{FakeIommu, IOMMU_ID, VFCTRL_BAR, VF_BAR, VSC_OFFSET},
    };

    const HOST_DEVICE: DeviceId = DeviceId::from_raw(0x0008);
    const HOST_DOMAIN: u16 = 0x42;

    fn manager() -> ViommuManager<FakeIommu> {
        let mut iommu = FakeIommu::default();
        iommu.domains.insert(HOST_DEVICE, HOST_DOMAIN);
        iommu.device_table.insert(HOST_DEVICE, DeviceTableEntry { data: [0x3, 0x42, 0, 0] });
        let mut manager = ViommuManager::new(ViommuConfig::enabled());
        manager.init_iommu(iommu).unwrap();
        manager
    }

    fn hardware(manager: &ViommuManager<FakeIommu>) -> SpinlockGuard<'_, Iommu<FakeIommu>> {
        manager.iommu(IOMMU_ID).unwrap()
    }

    #[test]
    fn test_init_iommu() {
        let manager = manager();
        let iommu = hardware(&manager);

        assert!(manager.is_enabled());
        assert_eq!(
            iommu.windows,
            MmioWindows { vf: PhysAddr::new(VF_BAR), vfctrl: PhysAddr::new(VFCTRL_BAR) }
        );
        assert_eq!(iommu.hardware.mmio_windows, vec![(VF_BAR, 0x1000_0000), (VFCTRL_BAR, 0x40_0000)]);
        assert!(iommu.hardware.private_domain);
        assert_eq!(
            iommu.hardware.mapped.iter().map(|(&iova, &size)| (iova, size)).collect::<Vec<_>>(),
            vec![(0, 0x1_0000), (0x40_0000, 0x2000)]
        );
        assert_eq!(iommu.hardware.uncached.len(), 2);
        assert_eq!(
            iommu.hardware.enabled,
            vec![ControlFeature::VirtualCommands, ControlFeature::Viommu]
        );
    }

    #[googletest::test]
    fn test_init_iommu_disabled() {
        let mut manager = ViommuManager::new(ViommuConfig::default());

        assert_that!(manager.init_iommu(FakeIommu::default()), err(eq(ViommuError::Disabled)));
        assert_that!(manager.init_guest(IOMMU_ID), err(eq(ViommuError::NoDevice { iommu: IOMMU_ID })));
    }

    #[googletest::test]
    fn test_missing_feature_disables_viommu() {
        let mut manager = ViommuManager::new(ViommuConfig::enabled());
        let iommu = FakeIommu { features: ExtendedFeatures::GT, ..Default::default() };

        assert_that!(
            manager.init_iommu(iommu),
            err(eq(ViommuError::FeatureNotSupported { iommu: IOMMU_ID }))
        );
        assert_that!(manager.is_enabled(), eq(false));
        assert_that!(manager.init_iommu(FakeIommu::default()), err(eq(ViommuError::Disabled)));
    }

    #[test]
    fn test_missing_capability() {
        let mut manager = ViommuManager::new(ViommuConfig::enabled());
        let iommu = FakeIommu { vsc: None, ..Default::default() };

        assert_eq!(manager.init_iommu(iommu), Err(ViommuError::CapabilityNotFound { iommu: IOMMU_ID }));
    }

    #[test]
    fn test_unassigned_bars() {
        let mut iommu = FakeIommu::default();
        iommu.config.insert(VSC_OFFSET + 0x08, 0x1000_0000);
        let mut manager = ViommuManager::new(ViommuConfig::enabled());
        assert_eq!(manager.init_iommu(&mut iommu), Err(ViommuError::InvalidBar { offset: 0x08 }));

        let mut iommu = FakeIommu::default();
        iommu.config.insert(VSC_OFFSET + 0x10, 1);
        iommu.config.insert(VSC_OFFSET + 0x14, 0);
        let mut manager = ViommuManager::new(ViommuConfig::enabled());
        assert_eq!(manager.init_iommu(&mut iommu), Err(ViommuError::InvalidBar { offset: 0x10 }));
    }

    #[test]
    fn test_init_iommu_rolls_back_private_space() {
        let mut iommu = FakeIommu { fail_map_at: Some(0x40_0000), ..Default::default() };

        let mut manager = ViommuManager::new(ViommuConfig::enabled());
        assert!(matches!(manager.init_iommu(&mut iommu), Err(ViommuError::Hardware { .. })));
        drop(manager);

        assert!(iommu.mapped.is_empty());
        assert!(!iommu.private_domain);
        assert!(iommu.enabled.is_empty());
    }

    #[googletest::test]
    fn test_init_guest() {
        let manager = manager();
        // Stale dirty bit of GID 1.
        hardware(&manager).dirty_status.write_u64(0x10, 0xFF).unwrap();

        assert_that!(manager.init_guest(IOMMU_ID), ok(eq(1)));

        let iommu = hardware(&manager);
        assert_that!(iommu.hardware.mapped.get(&0x10_0010_0000), some(eq(&0x10_0000)));
        assert_that!(iommu.hardware.mapped.get(&0x20_0008_0000), some(eq(&0x8_0000)));
        assert_that!(iommu.dirty_status.read_u64(0x10), some(eq(0xFE)));
        // Every device and domain ID mapping has been cleared, plus the MISC
        // register.
        assert_that!(iommu.hardware.mmio_writes, eq(2 * 0x10000 + 1));
        assert_eq!(iommu.hardware.vfctrl(1, 0x00), id_map_clear(0xFFFF));
        assert_eq!(iommu.hardware.vfctrl(1, 0x08), id_map_clear(0xFFFF));
    }

    #[test]
    fn test_dirty_status_position() {
        assert_eq!(dirty_status_position(1), (0x10, 0));
        assert_eq!(dirty_status_position(0x0100), (0, 1));
        assert_eq!(dirty_status_position(0xE1FF), (0xFFC, 1));
        assert_eq!(dirty_status_position(0x2000), (0x4, 0));
    }

    #[test]
    fn test_init_guest_rolls_back() {
        let manager = manager();
        hardware(&manager).hardware.fail_map_at = Some(0x20_0008_0000);

        assert!(matches!(manager.init_guest(IOMMU_ID), Err(ViommuError::Hardware { .. })));
        assert!(!hardware(&manager).hardware.mapped.contains_key(&0x10_0010_0000));
        assert!(manager.gids.is_empty());
        assert_eq!(manager.host_device_id(IOMMU_ID, 1, 0), Err(ViommuError::GidNotFound { gid: 1 }));

        hardware(&manager).hardware.fail_map_at = None;
        assert_eq!(manager.init_guest(IOMMU_ID), Ok(2));
    }

    #[test]
    fn test_bind_device() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();

        assert_eq!(manager.bind_device(IOMMU_ID, HOST_DEVICE, gid, 3), Ok(()));

        assert_eq!(manager.host_device_id(IOMMU_ID, gid, 3), Ok(HOST_DEVICE));
        let entry = manager.guest(IOMMU_ID, gid, |tables| tables.device_ids.read_u64(3 << 4));
        assert_eq!(entry, Ok(Some(0x0008 << 24 | 1)));

        let iommu = hardware(&manager);
        let dte = iommu.hardware.device_table_entry(HOST_DEVICE);
        assert!(dte.viommu_enabled());
        assert!(dte.guest_valid());
        assert_eq!((dte.guest_id(), dte.guest_device_id()), (gid, 3));
        assert_eq!(iommu.hardware.dte_flushes, vec![HOST_DEVICE]);
        assert_eq!(iommu.hardware.vfctrl(gid, 0x00), id_map_control(3, 0x0008));
        assert_eq!(iommu.hardware.vfctrl(gid, 0x10), 0x0008 << 16);
        assert_eq!(iommu.hardware.wbinvd_count, 1);
        assert_eq!(iommu.hardware.tlb_flushes, vec![(HOST_DOMAIN, 0)]);
    }

    #[test]
    fn test_bind_device_without_domain() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();
        let host = DeviceId::from_raw(0x0100);

        assert_eq!(
            manager.bind_device(IOMMU_ID, host, gid, 0),
            Err(ViommuError::DomainNotFound { device: host })
        );
        assert_eq!(
            manager.host_device_id(IOMMU_ID, gid, 0),
            Err(ViommuError::DeviceNotBound { gid, guest_device: 0 })
        );
        let iommu = hardware(&manager);
        assert!(!iommu.hardware.device_table_entry(host).viommu_enabled());
        assert_eq!(iommu.hardware.vfctrl(gid, 0x00), id_map_clear(0));
        assert_eq!(iommu.hardware.vfctrl(gid, 0x10), 0);
    }

    #[test]
    fn test_unbind_device() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();
        manager.bind_device(IOMMU_ID, HOST_DEVICE, gid, 3).unwrap();

        assert_eq!(manager.unbind_device(IOMMU_ID, HOST_DEVICE, gid, 3), Ok(()));

        assert_eq!(
            manager.host_device_id(IOMMU_ID, gid, 3),
            Err(ViommuError::DeviceNotBound { gid, guest_device: 3 })
        );
        let iommu = hardware(&manager);
        let dte = iommu.hardware.device_table_entry(HOST_DEVICE);
        assert_eq!(dte, DeviceTableEntry { data: [0x3, 0x42, 0, 0] });
        assert_eq!(iommu.hardware.vfctrl(gid, 0x00), id_map_clear(3));
        assert_eq!(iommu.hardware.vfctrl(gid, 0x10), 0);
        assert_eq!(iommu.hardware.wbinvd_count, 2);
    }

    #[test]
    fn test_bind_and_unbind_domain() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();
        manager.bind_device(IOMMU_ID, HOST_DEVICE, gid, 3).unwrap();

        assert_eq!(manager.bind_domain(IOMMU_ID, gid, 3, 7), Ok(()));
        assert_eq!(manager.host_domain_id(IOMMU_ID, gid, 7), Ok(HOST_DOMAIN));
        assert_eq!(hardware(&manager).hardware.vfctrl(gid, 0x08), id_map_control(7, HOST_DOMAIN));
        let entry = manager.guest(IOMMU_ID, gid, |tables| tables.domain_ids.read_u64(7 << 3));
        assert_eq!(entry, Ok(Some(0x42 << 24 | 1)));

        assert_eq!(manager.unbind_domain(IOMMU_ID, gid, 7), Ok(()));
        assert_eq!(
            manager.host_domain_id(IOMMU_ID, gid, 7),
            Err(ViommuError::DomainNotBound { gid, guest_domain: 7 })
        );
        assert_eq!(hardware(&manager).hardware.vfctrl(gid, 0x08), id_map_clear(7));
    }

    #[test]
    fn test_bind_domain_requires_bound_device() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();

        assert_eq!(
            manager.bind_domain(IOMMU_ID, gid, 3, 7),
            Err(ViommuError::DeviceNotBound { gid, guest_device: 3 })
        );
    }

    #[googletest::test]
    fn test_unknown_gid_and_iommu() {
        let manager = manager();
        let other = DeviceId::from_raw(0x0003);

        assert_that!(
            manager.bind_device(IOMMU_ID, HOST_DEVICE, 9, 0),
            err(eq(ViommuError::GidNotFound { gid: 9 }))
        );
        assert_that!(
            manager.bind_device(other, HOST_DEVICE, 1, 0),
            err(eq(ViommuError::NoDevice { iommu: other }))
        );
        assert_that!(manager.mmio_read(IOMMU_ID, 9, 0x18, 8), err(eq(ViommuError::GidNotFound { gid: 9 })));
        assert_that!(manager.destroy_guest(IOMMU_ID, 9), err(eq(ViommuError::GidNotFound { gid: 9 })));
        assert_that!(manager.dump_mappings(IOMMU_ID, 9), err(anything()));
    }

    #[test]
    fn test_gid_belongs_to_its_iommu() {
        let mut manager = manager();
        let other = DeviceId::from_raw(0x0003);
        manager.init_iommu(FakeIommu { id: other, ..Default::default() }).unwrap();
        let gid = manager.init_guest(IOMMU_ID).unwrap();

        assert_eq!(manager.bind_domain(other, gid, 0, 0), Err(ViommuError::GidNotFound { gid }));
        assert_eq!(manager.destroy_guest(other, gid), Err(ViommuError::GidNotFound { gid }));
        assert_eq!(manager.destroy_guest(IOMMU_ID, gid), Ok(()));
    }

    #[test]
    fn test_destroy_guest() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();
        manager.bind_device(IOMMU_ID, HOST_DEVICE, gid, 3).unwrap();
        manager.dump_mappings(IOMMU_ID, gid).unwrap();

        assert_eq!(manager.destroy_guest(IOMMU_ID, gid), Ok(()));

        assert_eq!(
            hardware(&manager).hardware.mapped.keys().copied().collect::<Vec<_>>(),
            vec![0, 0x40_0000]
        );
        assert_eq!(manager.destroy_guest(IOMMU_ID, gid), Err(ViommuError::GidNotFound { gid }));
        // GIDs aren't reused before the counter wraps.
        assert_eq!(manager.init_guest(IOMMU_ID), Ok(gid + 1));
    }

    #[test]
    fn test_mmio_round_trip() {
        let manager = manager();
        let gid = manager.init_guest(IOMMU_ID).unwrap();

        manager.mmio_write(IOMMU_ID, gid, 0x18, 8, 1 << 12 | 1 << 2).unwrap();
        manager.mmio_write(IOMMU_ID, gid, 0x2008, 4, 0x40).unwrap();

        assert_eq!(manager.mmio_read(IOMMU_ID, gid, 0x18, 8), Ok(1 << 12 | 1 << 2));
        assert_eq!(manager.mmio_read(IOMMU_ID, gid, 0x2008, 4), Ok(0x40));
        assert_eq!(manager.mmio_read(IOMMU_ID, gid, 0x30, 8), Ok(1 << 48 | 1 << 4 | 1 << 1));
        assert_eq!(manager.mmio_read(IOMMU_ID, gid, 0x28, 8), Ok(0));
        assert_eq!(hardware(&manager).hardware.vfctrl(gid, 0x20), 1 << 8);
    }
}
