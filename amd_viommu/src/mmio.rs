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


//! Emulation of the guest-visible IOMMU MMIO registers on top of the per-GID
//! VF and VF-control registers.
//!
//! The guest programs what looks like an ordinary AMD IOMMU. The fields it
//! writes are scattered over the command, event and PPR control registers of
//! its VF-control slice, and the command buffer pointers live in its VF slice.
//! Offsets that aren't emulated read as zero and ignore writes.

use strum::FromRepr;

use crate::{
    hardware::{GuestRegisters, IommuHardware},
    registers::{BitField, ExtendedFeatures, VfRegister, VfctrlRegister},
};

/// Guest-visible IOMMU MMIO offsets that are emulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u64)]
pub enum GuestRegister {
    CommandBuffer = 0x08,
    EventBuffer = 0x10,
    Control = 0x18,
    ExtendedFeatures = 0x30,
    PprLog = 0x38,
    PprLogB = 0x1F0,
    EventLogB = 0x1F8,
    CommandHead = 0x2000,
    CommandTail = 0x2008,
}

/// Features advertised to the guest through the extended feature register.
pub const GUEST_FEATURES: ExtendedFeatures = ExtendedFeatures::GIOSUP
    .union(ExtendedFeatures::GT)
    .union(ExtendedFeatures::PPR);

/// Where a bit of the guest control register lives in the VF-control slice.
struct ControlField {
    register: VfctrlRegister,
    guest: BitField,
    physical: BitField,
}

const fn field(register: VfctrlRegister, guest: BitField, physical: BitField) -> ControlField {
    ControlField { register, guest, physical }
}

const CONTROL_FIELDS: [ControlField; 12] = [
    // CmdBufEn
    field(VfctrlRegister::CommandControl, BitField::bit(12), BitField::bit(8)),
    // ComWaitIntEn
    field(VfctrlRegister::CommandControl, BitField::bit(4), BitField::bit(9)),
    // EventLogEn
    field(VfctrlRegister::EventControl, BitField::bit(2), BitField::bit(8)),
    // EventIntEn
    field(VfctrlRegister::EventControl, BitField::bit(3), BitField::bit(9)),
    // DualEventLogEn
    field(VfctrlRegister::EventControl, BitField::new(32, 2), BitField::new(10, 2)),
    // PprLogEn
    field(VfctrlRegister::PprControl, BitField::bit(13), BitField::bit(8)),
    // PprIntEn
    field(VfctrlRegister::PprControl, BitField::bit(14), BitField::bit(9)),
    // PprEn
    field(VfctrlRegister::PprControl, BitField::bit(15), BitField::bit(10)),
    // DualPprLogEn
    field(VfctrlRegister::PprControl, BitField::new(30, 2), BitField::new(11, 2)),
    // PprAutoRspEn
    field(VfctrlRegister::PprControl, BitField::bit(39), BitField::bit(13)),
    // BlkStopMrkEn
    field(VfctrlRegister::PprControl, BitField::bit(41), BitField::bit(14)),
    // PprAutoRspAon
    field(VfctrlRegister::PprControl, BitField::bit(42), BitField::bit(15)),
];

const CONTROL_REGISTERS: [VfctrlRegister; 3] =
    [VfctrlRegister::CommandControl, VfctrlRegister::EventControl, VfctrlRegister::PprControl];

/// Log length in the guest's buffer base registers.
const LOG_LENGTH: BitField = BitField::new(56, 4);
const LOG_LENGTH_A: BitField = BitField::new(0, 4);
const LOG_LENGTH_B: BitField = BitField::new(4, 4);

/// Command buffer head and tail pointers, in the guest and VF registers alike.
const POINTER: BitField = BitField::new(4, 15);

fn log_length(register: GuestRegister) -> Option<(VfctrlRegister, BitField)> {
    match register {
        GuestRegister::CommandBuffer => Some((VfctrlRegister::CommandControl, LOG_LENGTH_A)),
        GuestRegister::EventBuffer => Some((VfctrlRegister::EventControl, LOG_LENGTH_A)),
        GuestRegister::EventLogB => Some((VfctrlRegister::EventControl, LOG_LENGTH_B)),
        GuestRegister::PprLog => Some((VfctrlRegister::PprControl, LOG_LENGTH_A)),
        GuestRegister::PprLogB => Some((VfctrlRegister::PprControl, LOG_LENGTH_B)),
        _ => None,
    }
}

fn pointer(register: GuestRegister) -> Option<VfRegister> {
    match register {
        GuestRegister::CommandHead => Some(VfRegister::CommandHead),
        GuestRegister::CommandTail => Some(VfRegister::CommandTail),
        _ => None,
    }
}

/// Reads the guest-visible register at `offset`.
pub fn read<H: IommuHardware + ?Sized>(registers: &mut GuestRegisters<'_, H>, offset: u64) -> u64 {
    let Some(register) = GuestRegister::from_repr(offset) else {
        return 0;
    };
    if let Some((control, length)) = log_length(register) {
        return LOG_LENGTH.set(0, length.get(registers.read_vfctrl(control)));
    }
    if let Some(vf) = pointer(register) {
        return registers.read_vf(vf) & POINTER.mask();
    }
    match register {
        GuestRegister::Control => CONTROL_REGISTERS.iter().fold(0, |value, &control| {
            let physical = registers.read_vfctrl(control);
            CONTROL_FIELDS
                .iter()
                .filter(|field| field.register == control)
                .fold(value, |value, field| field.guest.set(value, field.physical.get(physical)))
        }),
        GuestRegister::ExtendedFeatures => GUEST_FEATURES.bits(),
        _ => 0,
    }
}

/// Writes `value` to the guest-visible register at `offset`.
pub fn write<H: IommuHardware + ?Sized>(
    registers: &mut GuestRegisters<'_, H>,
    offset: u64,
    value: u64,
) {
    let Some(register) = GuestRegister::from_repr(offset) else {
        return;
    };
    if let Some((control, length)) = log_length(register) {
        registers.update_vfctrl(control, |physical| length.set(physical, LOG_LENGTH.get(value)));
        return;
    }
    if let Some(vf) = pointer(register) {
        registers.update_vf(vf, |physical| POINTER.set(physical, POINTER.get(value)));
        return;
    }
    if register == GuestRegister::Control {
        for control in CONTROL_REGISTERS {
            registers.update_vfctrl(control, |physical| {
                CONTROL_FIELDS
                    .iter()
                    .filter(|field| field.register == control)
                    .fold(physical, |physical, field| {
                        field.physical.set(physical, field.guest.get(value))
                    })
            });
        }
    }
}
