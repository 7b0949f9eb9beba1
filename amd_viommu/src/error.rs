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


use snafu::Snafu;

use crate::device::DeviceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ViommuError {
    #[snafu(display("vIOMMU support is disabled"))]
    Disabled,
    #[snafu(display("no IOMMU with device ID {iommu}"))]
    NoDevice { iommu: DeviceId },
    #[snafu(display("IOMMU {iommu} does not support virtualization"))]
    FeatureNotSupported { iommu: DeviceId },
    #[snafu(display("IOMMU {iommu} has no vendor-specific capability"))]
    CapabilityNotFound { iommu: DeviceId },
    #[snafu(display("BAR at capability offset {offset:#x} is not enabled"))]
    InvalidBar { offset: u8 },
    #[snafu(display("couldn't allocate {size:#x} bytes of private memory"))]
    OutOfMemory { size: usize },
    #[snafu(display("GID {gid} not found"))]
    GidNotFound { gid: u16 },
    #[snafu(display("all guest IDs are in use"))]
    GidExhausted,
    #[snafu(display("guest device {guest_device:#x} of GID {gid} is not bound"))]
    DeviceNotBound { gid: u16, guest_device: u16 },
    #[snafu(display("guest domain {guest_domain:#x} of GID {gid} is not bound"))]
    DomainNotBound { gid: u16, guest_domain: u16 },
    #[snafu(display("device {device} is not attached to a domain"))]
    DomainNotFound { device: DeviceId },
    #[snafu(display("IOMMU operation failed: {message}"))]
    Hardware { message: &'static str },
}
