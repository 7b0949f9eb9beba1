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


/// Runtime switches for vIOMMU support.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViommuConfig {
    /// Whether IOMMU virtualization should be set up at all. Off by default.
    pub enabled: bool,
}

impl ViommuConfig {
    pub const fn enabled() -> Self {
        Self { enabled: true }
    }
}
