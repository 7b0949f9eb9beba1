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


//! Host memory backing the IOMMU private address space.

use alloc::vec::Vec;

use snafu::OptionExt;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{OutOfMemorySnafu, ViommuError};

pub const PAGE_SIZE: usize = 4096;

/// Guest MMIO region, mapped at the bottom of the private address space.
pub const GUEST_MMIO_BASE: u64 = 0;
pub const GUEST_MMIO_SIZE: usize = 0x1_0000;

/// Command buffer dirty status bitmap, one bit per GID.
pub const DIRTY_STATUS_BASE: u64 = 0x40_0000;
pub const DIRTY_STATUS_SIZE: usize = 0x2000;

/// Device ID mapping tables; one table of 16-byte entries per GID.
pub const DEVICE_ID_TABLE_BASE: u64 = 0x10_0000_0000;
pub const DEVICE_ID_TABLE_SIZE: usize = 0x10_0000;
pub const DEVICE_ID_ENTRY_SHIFT: usize = 4;

/// Domain ID mapping tables; one table of 8-byte entries per GID.
pub const DOMAIN_ID_TABLE_BASE: u64 = 0x20_0000_0000;
pub const DOMAIN_ID_TABLE_SIZE: usize = 0x8_0000;
pub const DOMAIN_ID_ENTRY_SHIFT: usize = 3;

/// IOVA of the per-GID table that starts at `base` and spans `size` bytes.
pub const fn per_gid_iova(base: u64, size: usize, gid: u16) -> u64 {
    base + gid as u64 * size as u64
}

#[repr(C, align(4096))]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Page([u8; PAGE_SIZE]);
static_assertions::assert_eq_size!(Page, [u8; PAGE_SIZE]);

/// Zeroed, page-aligned host memory that is mapped into the IOMMU private
/// address space at a fixed IOVA.
pub struct PrivateRegion {
    iova: u64,
    pages: Vec<Page>,
}

impl PrivateRegion {
    /// Allocates `size` bytes (rounded up to whole pages) of zeroed memory.
    ///
    /// Allocation failure is reported instead of aborting.
    pub fn allocate(iova: u64, size: usize) -> Result<Self, ViommuError> {
        let count = size.div_ceil(PAGE_SIZE);
        let mut pages = Vec::new();
        pages.try_reserve_exact(count).ok().context(OutOfMemorySnafu { size })?;
        pages.resize_with(count, Page::new_zeroed);
        Ok(Self { iova, pages })
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Host virtual address of the first byte, for translation to the
    /// physical address the IOMMU page tables need.
    pub fn as_ptr(&self) -> *const u8 {
        self.pages.as_ptr().cast()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.pages.as_bytes()
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.as_bytes().get(offset..offset.checked_add(8)?)?;
        u64::read_from_bytes(bytes).ok()
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Option<()> {
        let end = offset.checked_add(8)?;
        self.pages.as_mut_bytes().get_mut(offset..end)?.copy_from_slice(value.as_bytes());
        Some(())
    }

    /// Clears a single bit of the little-endian quadword at `offset`.
    pub fn clear_bit(&mut self, offset: usize, bit: u32) -> Option<()> {
        if bit >= u64::BITS {
            return None;
        }
        let value = self.read_u64(offset)?;
        self.write_u64(offset, value & !(1 << bit))
    }
}

impl core::fmt::Debug for PrivateRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrivateRegion")
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}
