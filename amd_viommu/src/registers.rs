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


//! Register layouts of the physical IOMMU that are touched by vIOMMU setup.

use bitflags::bitflags;
use strum::FromRepr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A contiguous run of bits inside a 64-bit register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitField {
    shift: u32,
    width: u32,
}

impl BitField {
    pub const fn new(shift: u32, width: u32) -> Self {
        assert!(width > 0 && shift + width <= 64);
        Self { shift, width }
    }

    pub const fn bit(shift: u32) -> Self {
        Self::new(shift, 1)
    }

    pub const fn mask(&self) -> u64 {
        (u64::MAX >> (64 - self.width)) << self.shift
    }

    /// Extracts the field from `register`, shifted down to bit 0.
    pub const fn get(&self, register: u64) -> u64 {
        (register & self.mask()) >> self.shift
    }

    /// Returns `register` with the field replaced by `value`. Bits of `value`
    /// that don't fit in the field are dropped.
    pub const fn set(&self, register: u64, value: u64) -> u64 {
        (register & !self.mask()) | ((value << self.shift) & self.mask())
    }
}

bitflags! {
    /// Bits of the IOMMU extended feature register (MMIO offset 0x30).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ExtendedFeatures: u64 {
        /// Peripheral page request support.
        const PPR = 1 << 1;
        /// Guest translation support.
        const GT = 1 << 4;
        /// Guest I/O protection support.
        const GIOSUP = 1 << 48;
        /// IOMMU virtualization support.
        const VIOMMU = 1 << 55;

        const _ = !0;
    }
}

/// Config space offsets of the VF and VF-control BARs, relative to the start
/// of the vendor-specific capability.
pub const VSC_VF_BAR_LOW: u8 = 0x08;
pub const VSC_VF_BAR_HIGH: u8 = 0x0C;
pub const VSC_VFCTRL_BAR_LOW: u8 = 0x10;
pub const VSC_VFCTRL_BAR_HIGH: u8 = 0x14;

/// Bit 0 of a VSC BAR signals that the BAR has been assigned.
pub const VSC_BAR_ENABLE: u64 = 1;

pub const VF_WINDOW_SIZE: u64 = 0x1000_0000;
pub const VF_GID_STRIDE: u64 = 0x1000;
pub const VFCTRL_WINDOW_SIZE: u64 = 0x40_0000;
pub const VFCTRL_GID_STRIDE: u64 = 0x40;

/// Per-GID registers in the VF window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u64)]
pub enum VfRegister {
    CommandHead = 0x00,
    CommandTail = 0x08,
}

/// Per-GID registers in the VF-control window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u64)]
pub enum VfctrlRegister {
    /// Guest device ID to host device ID map control.
    DeviceIdMap = 0x00,
    /// Guest domain ID to host domain ID map control.
    DomainIdMap = 0x08,
    Misc = 0x10,
    CommandControl = 0x20,
    EventControl = 0x28,
    PprControl = 0x30,
}

const ID_MAP_VALID: BitField = BitField::bit(0);
const ID_MAP_HOST_ID: BitField = BitField::new(14, 16);
const ID_MAP_GUEST_ID: BitField = BitField::new(46, 16);
const ID_MAP_COMMIT: BitField = BitField::bit(63);

/// Value for the device or domain ID map control register that maps `guest`
/// to `host`.
pub const fn id_map_control(guest: u16, host: u16) -> u64 {
    let value = ID_MAP_GUEST_ID.set(0, guest as u64);
    let value = ID_MAP_HOST_ID.set(value, host as u64);
    let value = ID_MAP_VALID.set(value, 1);
    ID_MAP_COMMIT.set(value, 1)
}

/// Value for the device or domain ID map control register that removes the
/// mapping of `guest`.
pub const fn id_map_clear(guest: u16) -> u64 {
    ID_MAP_COMMIT.set(ID_MAP_GUEST_ID.set(0, guest as u64), 1)
}

/// Host device ID field of the MISC control register.
pub const MISC_HOST_DEVICE_ID: BitField = BitField::new(16, 16);

/// Host ID stored in an entry of the device or domain ID mapping tables.
pub const MAPPING_HOST_ID: BitField = BitField::new(24, 16);
pub const MAPPING_VALID: BitField = BitField::bit(0);

/// Entry in the IOMMU device table.
///
/// Only the fields that vIOMMU setup reads or writes have accessors.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DeviceTableEntry {
    pub data: [u64; 4],
}
static_assertions::assert_eq_size!(DeviceTableEntry, [u8; 32]);

/// data[0]: guest translation valid.
const DTE_GUEST_VALID: BitField = BitField::bit(55);
/// data[1]: domain ID.
const DTE_DOMAIN_ID: BitField = BitField::new(0, 16);
/// data[3]: vIOMMU fields.
const DTE_VIOMMU_ENABLE: BitField = BitField::bit(15);
const DTE_GUEST_ID: BitField = BitField::new(16, 16);
const DTE_GUEST_DEVICE_ID: BitField = BitField::new(32, 16);

impl DeviceTableEntry {
    pub fn domain_id(&self) -> u16 {
        DTE_DOMAIN_ID.get(self.data[1]) as u16
    }

    pub fn guest_valid(&self) -> bool {
        DTE_GUEST_VALID.get(self.data[0]) != 0
    }

    pub fn viommu_enabled(&self) -> bool {
        DTE_VIOMMU_ENABLE.get(self.data[3]) != 0
    }

    pub fn guest_id(&self) -> u16 {
        DTE_GUEST_ID.get(self.data[3]) as u16
    }

    pub fn guest_device_id(&self) -> u16 {
        DTE_GUEST_DEVICE_ID.get(self.data[3]) as u16
    }

    /// Routes the device through the vIOMMU of `gid` as guest device
    /// `guest_device`.
    pub fn set_viommu(&mut self, gid: u16, guest_device: u16) {
        let vfields = DTE_VIOMMU_ENABLE.set(self.data[3], 1);
        let vfields = DTE_GUEST_ID.set(vfields, gid as u64);
        self.data[3] = DTE_GUEST_DEVICE_ID.set(vfields, guest_device as u64);
        self.data[0] = DTE_GUEST_VALID.set(self.data[0], 1);
    }

    pub fn clear_viommu(&mut self) {
        let vfields = DTE_VIOMMU_ENABLE.set(self.data[3], 0);
        let vfields = DTE_GUEST_ID.set(vfields, 0);
        self.data[3] = DTE_GUEST_DEVICE_ID.set(vfields, 0);
        self.data[0] = DTE_GUEST_VALID.set(self.data[0], 0);
    }
}
