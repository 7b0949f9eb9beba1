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


use core::fmt::Display;

/// PCI requester ID of a device behind the IOMMU, in the bus-device-function
/// format.
///
/// This is the index into the IOMMU device table.
///
/// Basic structure: BBBBBBBBDDDDDFFF
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceId(u16);

impl DeviceId {
    pub const fn new(bus: u8, device: u8, function: u8) -> Option<Self> {
        if device > 0b11111 || function > 0b111 {
            return None;
        }
        Some(Self((bus as u16) << 8 | (device as u16) << 3 | (function as u16)))
    }

    pub const fn from_raw(value: u16) -> Self {
        Self(value)
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0b11111) as u8
    }

    #[inline]
    pub fn function(&self) -> u8 {
        (self.0 & 0b111) as u8
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus(), self.device(), self.function())
    }
}

impl From<u16> for DeviceId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<DeviceId> for u16 {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_id() {
        assert_eq!(DeviceId::new(0, 1, 0), Some(DeviceId::from(0x0008)));
        assert_eq!(DeviceId::new(0xC0, 0x1F, 7), Some(DeviceId::from(0xC0FF)));
        assert_eq!(DeviceId::new(0, 0x20, 0), None);
        assert_eq!(DeviceId::new(0, 0, 8), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceId::from(0x0008).to_string(), "00:01.0");
        assert_eq!(DeviceId::from(0xC0FF).to_string(), "c0:1f.7");
    }
}
