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


//! Access to the physical IOMMU and the host kernel services around it.

use x86_64::PhysAddr;

use crate::{
    device::DeviceId,
    region::PrivateRegion,
    registers::{
        DeviceTableEntry, ExtendedFeatures, VfRegister, VfctrlRegister, VFCTRL_GID_STRIDE,
        VF_GID_STRIDE,
    },
};

/// Bits of the IOMMU control register that vIOMMU setup turns on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlFeature {
    VirtualCommands,
    Viommu,
}

/// One physical AMD IOMMU.
///
/// Implementations are expected to perform I/O-ordered MMIO accesses; the
/// caller serializes all accesses to a single IOMMU.
pub trait IommuHardware {
    /// Requester ID of the IOMMU itself.
    fn device_id(&self) -> DeviceId;

    fn extended_features(&self) -> ExtendedFeatures;

    /// Config space offset of the vendor-specific capability, if present.
    fn vendor_capability(&mut self) -> Option<u8>;

    fn read_config(&mut self, offset: u8) -> Result<u32, &'static str>;

    /// Makes `size` bytes of MMIO starting at `base` accessible through
    /// [`IommuHardware::read_mmio`] and [`IommuHardware::write_mmio`].
    fn map_mmio(&mut self, base: PhysAddr, size: u64) -> Result<(), &'static str>;

    fn read_mmio(&mut self, address: PhysAddr) -> u64;

    fn write_mmio(&mut self, address: PhysAddr, value: u64);

    fn device_table_entry(&self, device: DeviceId) -> DeviceTableEntry;

    fn set_device_table_entry(&mut self, device: DeviceId, entry: DeviceTableEntry);

    /// Invalidates the cached copy of the device table entry.
    fn flush_device_table_entry(&mut self, device: DeviceId);

    /// Host domain the device is currently attached to.
    fn attached_domain(&self, device: DeviceId) -> Option<u16>;

    fn flush_domain_tlb(&mut self, domain: u16, pasid: u32);

    /// Writes back and invalidates the caches of every CPU.
    fn wbinvd_all_cpus(&mut self);

    /// Creates the domain that translates the IOMMU private address space and
    /// points the IOMMU's own device table entry at it.
    fn create_private_domain(&mut self) -> Result<(), &'static str>;

    fn destroy_private_domain(&mut self);

    /// Marks the memory of `region` as uncacheable and maps it into the
    /// private address space at its IOVA. On failure the memory is left
    /// cacheable and unmapped.
    fn map_private(&mut self, region: &PrivateRegion) -> Result<(), &'static str>;

    /// Removes the mapping of `region`, flushes the IOTLB and restores normal
    /// caching of its memory.
    fn unmap_private(&mut self, region: &PrivateRegion);

    fn enable_feature(&mut self, feature: ControlFeature);
}

impl<T: IommuHardware + ?Sized> IommuHardware for &mut T {
    fn device_id(&self) -> DeviceId {
        (**self).device_id()
    }

    fn extended_features(&self) -> ExtendedFeatures {
        (**self).extended_features()
    }

    fn vendor_capability(&mut self) -> Option<u8> {
        (**self).vendor_capability()
    }

    fn read_config(&mut self, offset: u8) -> Result<u32, &'static str> {
        (**self).read_config(offset)
    }

    fn map_mmio(&mut self, base: PhysAddr, size: u64) -> Result<(), &'static str> {
        (**self).map_mmio(base, size)
    }

    fn read_mmio(&mut self, address: PhysAddr) -> u64 {
        (**self).read_mmio(address)
    }

    fn write_mmio(&mut self, address: PhysAddr, value: u64) {
        (**self).write_mmio(address, value)
    }

    fn device_table_entry(&self, device: DeviceId) -> DeviceTableEntry {
        (**self).device_table_entry(device)
    }

    fn set_device_table_entry(&mut self, device: DeviceId, entry: DeviceTableEntry) {
        (**self).set_device_table_entry(device, entry)
    }

    fn flush_device_table_entry(&mut self, device: DeviceId) {
        (**self).flush_device_table_entry(device)
    }

    fn attached_domain(&self, device: DeviceId) -> Option<u16> {
        (**self).attached_domain(device)
    }

    fn flush_domain_tlb(&mut self, domain: u16, pasid: u32) {
        (**self).flush_domain_tlb(domain, pasid)
    }

    fn wbinvd_all_cpus(&mut self) {
        (**self).wbinvd_all_cpus()
    }

    fn create_private_domain(&mut self) -> Result<(), &'static str> {
        (**self).create_private_domain()
    }

    fn destroy_private_domain(&mut self) {
        (**self).destroy_private_domain()
    }

    fn map_private(&mut self, region: &PrivateRegion) -> Result<(), &'static str> {
        (**self).map_private(region)
    }

    fn unmap_private(&mut self, region: &PrivateRegion) {
        (**self).unmap_private(region)
    }

    fn enable_feature(&mut self, feature: ControlFeature) {
        (**self).enable_feature(feature)
    }
}

/// Base addresses of the VF and VF-control MMIO windows of one IOMMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioWindows {
    pub vf: PhysAddr,
    pub vfctrl: PhysAddr,
}

/// The per-GID slices of the VF and VF-control windows.
pub struct GuestRegisters<'a, H: IommuHardware + ?Sized> {
    hardware: &'a mut H,
    vf: PhysAddr,
    vfctrl: PhysAddr,
}

impl<'a, H: IommuHardware + ?Sized> GuestRegisters<'a, H> {
    pub fn new(hardware: &'a mut H, windows: &MmioWindows, gid: u16) -> Self {
        Self {
            hardware,
            vf: windows.vf + gid as u64 * VF_GID_STRIDE,
            vfctrl: windows.vfctrl + gid as u64 * VFCTRL_GID_STRIDE,
        }
    }

    pub fn read_vf(&mut self, register: VfRegister) -> u64 {
        self.hardware.read_mmio(self.vf + register as u64)
    }

    pub fn write_vf(&mut self, register: VfRegister, value: u64) {
        self.hardware.write_mmio(self.vf + register as u64, value)
    }

    pub fn read_vfctrl(&mut self, register: VfctrlRegister) -> u64 {
        self.hardware.read_mmio(self.vfctrl + register as u64)
    }

    pub fn write_vfctrl(&mut self, register: VfctrlRegister, value: u64) {
        self.hardware.write_mmio(self.vfctrl + register as u64, value)
    }

    /// Read-modify-write of a VF-control register.
    pub fn update_vfctrl(&mut self, register: VfctrlRegister, f: impl FnOnce(u64) -> u64) {
        let value = f(self.read_vfctrl(register));
        self.write_vfctrl(register, value)
    }

    pub fn update_vf(&mut self, register: VfRegister, f: impl FnOnce(u64) -> u64) {
        let value = f(self.read_vf(register));
        self.write_vf(register, value)
    }
}
