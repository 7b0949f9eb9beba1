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


//! In-memory stand-in for an IOMMU.

use std::collections::{BTreeMap, BTreeSet};

use x86_64::PhysAddr;

use crate::{
    device::DeviceId,
    hardware::{ControlFeature, IommuHardware},
    region::PrivateRegion,
    registers::{DeviceTableEntry, ExtendedFeatures},
};

pub const IOMMU_ID: DeviceId = DeviceId::from_raw(0x0002);
pub const VSC_OFFSET: u8 = 0x40;
pub const VF_BAR: u64 = 0xFD00_0000_0000;
pub const VFCTRL_BAR: u64 = 0xFE00_0000_0000;

pub struct FakeIommu {
    pub id: DeviceId,
    pub features: ExtendedFeatures,
    pub vsc: Option<u8>,
    pub config: BTreeMap<u8, u32>,
    pub mmio_windows: Vec<(u64, u64)>,
    pub mmio: BTreeMap<u64, u64>,
    pub mmio_writes: usize,
    pub device_table: BTreeMap<DeviceId, DeviceTableEntry>,
    pub dte_flushes: Vec<DeviceId>,
    pub domains: BTreeMap<DeviceId, u16>,
    pub tlb_flushes: Vec<(u16, u32)>,
    pub wbinvd_count: usize,
    pub private_domain: bool,
    pub fail_private_domain: bool,
    /// IOVA -> size of every mapped private region.
    pub mapped: BTreeMap<u64, usize>,
    pub uncached: BTreeSet<u64>,
    /// Mapping a region at this IOVA fails.
    pub fail_map_at: Option<u64>,
    pub enabled: Vec<ControlFeature>,
}

impl Default for FakeIommu {
    fn default() -> Self {
        let mut config = BTreeMap::new();
        config.insert(VSC_OFFSET + 0x08, (VF_BAR as u32) | 1);
        config.insert(VSC_OFFSET + 0x0C, (VF_BAR >> 32) as u32);
        config.insert(VSC_OFFSET + 0x10, (VFCTRL_BAR as u32) | 1);
        config.insert(VSC_OFFSET + 0x14, (VFCTRL_BAR >> 32) as u32);
        Self {
            id: IOMMU_ID,
            features: ExtendedFeatures::VIOMMU | ExtendedFeatures::GT,
            vsc: Some(VSC_OFFSET),
            config,
            mmio_windows: Vec::new(),
            mmio: BTreeMap::new(),
            mmio_writes: 0,
            device_table: BTreeMap::new(),
            dte_flushes: Vec::new(),
            domains: BTreeMap::new(),
            tlb_flushes: Vec::new(),
            wbinvd_count: 0,
            private_domain: false,
            fail_private_domain: false,
            mapped: BTreeMap::new(),
            uncached: BTreeSet::new(),
            fail_map_at: None,
            enabled: Vec::new(),
        }
    }
}

impl FakeIommu {
    /// Value last written to the VF-control register at `offset` of `gid`.
    pub fn vfctrl(&self, gid: u16, offset: u64) -> u64 {
        self.mmio.get(&(VFCTRL_BAR + gid as u64 * 0x40 + offset)).copied().unwrap_or(0)
    }

    pub fn vf(&self, gid: u16, offset: u64) -> u64 {
        self.mmio.get(&(VF_BAR + gid as u64 * 0x1000 + offset)).copied().unwrap_or(0)
    }

    pub fn set_vfctrl(&mut self, gid: u16, offset: u64, value: u64) {
        self.mmio.insert(VFCTRL_BAR + gid as u64 * 0x40 + offset, value);
    }

    pub fn set_vf(&mut self, gid: u16, offset: u64, value: u64) {
        self.mmio.insert(VF_BAR + gid as u64 * 0x1000 + offset, value);
    }

    /// An IOMMU whose VF and VF-control windows are already mapped.
    pub fn with_windows() -> Self {
        let mut iommu = Self::default();
        iommu.mmio_windows.push((VF_BAR, 0x1000_0000));
        iommu.mmio_windows.push((VFCTRL_BAR, 0x40_0000));
        iommu
    }

    fn in_window(&self, address: u64) -> bool {
        self.mmio_windows.iter().any(|&(base, size)| (base..base + size).contains(&address))
    }
}

impl IommuHardware for FakeIommu {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn extended_features(&self) -> ExtendedFeatures {
        self.features
    }

    fn vendor_capability(&mut self) -> Option<u8> {
        self.vsc
    }

    fn read_config(&mut self, offset: u8) -> Result<u32, &'static str> {
        self.config.get(&offset).copied().ok_or("unexpected config read")
    }

    fn map_mmio(&mut self, base: PhysAddr, size: u64) -> Result<(), &'static str> {
        self.mmio_windows.push((base.as_u64(), size));
        Ok(())
    }

    fn read_mmio(&mut self, address: PhysAddr) -> u64 {
        assert!(self.in_window(address.as_u64()), "read outside of mapped MMIO: {address:?}");
        self.mmio.get(&address.as_u64()).copied().unwrap_or(0)
    }

    fn write_mmio(&mut self, address: PhysAddr, value: u64) {
        assert!(self.in_window(address.as_u64()), "write outside of mapped MMIO: {address:?}");
        self.mmio_writes += 1;
        self.mmio.insert(address.as_u64(), value);
    }

    fn device_table_entry(&self, device: DeviceId) -> DeviceTableEntry {
        self.device_table.get(&device).copied().unwrap_or_default()
    }

    fn set_device_table_entry(&mut self, device: DeviceId, entry: DeviceTableEntry) {
        self.device_table.insert(device, entry);
    }

    fn flush_device_table_entry(&mut self, device: DeviceId) {
        self.dte_flushes.push(device);
    }

    fn attached_domain(&self, device: DeviceId) -> Option<u16> {
        self.domains.get(&device).copied()
    }

    fn flush_domain_tlb(&mut self, domain: u16, pasid: u32) {
        self.tlb_flushes.push((domain, pasid));
    }

    fn wbinvd_all_cpus(&mut self) {
        self.wbinvd_count += 1;
    }

    fn create_private_domain(&mut self) -> Result<(), &'static str> {
        if self.fail_private_domain {
            return Err("no memory for the page table root");
        }
        self.private_domain = true;
        Ok(())
    }

    fn destroy_private_domain(&mut self) {
        self.private_domain = false;
    }

    fn map_private(&mut self, region: &PrivateRegion) -> Result<(), &'static str> {
        assert!(self.private_domain, "mapping without a private domain");
        if self.fail_map_at == Some(region.iova()) {
            return Err("page table allocation failed");
        }
        self.mapped.insert(region.iova(), region.len());
        self.uncached.insert(region.iova());
        Ok(())
    }

    fn unmap_private(&mut self, region: &PrivateRegion) {
        self.mapped.remove(&region.iova());
        self.uncached.remove(&region.iova());
    }

    fn enable_feature(&mut self, feature: ControlFeature) {
        self.enabled.push(feature);
    }
}
