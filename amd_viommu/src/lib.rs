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


//! Host-side resource management for AMD IOMMU virtualization (vIOMMU).
//!
//! A guest that owns a virtual IOMMU is identified by a 16-bit guest ID
//! (GID). For every GID the physical IOMMU needs a device ID mapping table
//! and a domain ID mapping table in its private address space, plus a set of
//! per-GID control registers in the VF and VF-control MMIO windows. The
//! [`manager::ViommuManager`] owns those resources and the
//! [`mmio`] shim translates the guest's view of the IOMMU MMIO registers to
//! the per-GID physical registers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod gid;
pub mod hardware;
pub mod manager;
pub mod mmio;
pub mod region;
pub mod registers;

#[cfg(test)]
mod testing;

pub use config::ViommuConfig;
pub use device::DeviceId;
pub use error::ViommuError;
pub use manager::ViommuManager;
