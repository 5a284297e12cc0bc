// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-call DMA attributes and the protections derived from them.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Attributes a caller attaches to a single mapping call.
    pub struct DmaAttrs: u32 {
        /// Skip CPU cache maintenance for the buffer.
        const SKIP_CPU_SYNC = 1 << 0;
        /// Treat the buffer as cache-coherent regardless of the device default.
        const FORCE_COHERENT = 1 << 1;
        /// Treat the buffer as non-coherent regardless of the device default.
        const FORCE_NON_COHERENT = 1 << 2;
        /// Strongly ordered: device/MMIO attribute on the IOMMU side, uncached CPU remap.
        const MMIO = 1 << 3;
        /// Permit instruction fetch through the mapping.
        const EXEC_MAPPING = 1 << 4;
        /// Write-combined CPU remap for coherent allocations.
        const WRITE_COMBINE = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// IOMMU-side protection handed to the page-table walker.
    pub struct IommuProt: u32 {
        /// Device may read.
        const READ = 1 << 0;
        /// Device may write.
        const WRITE = 1 << 1;
        /// Cacheable, inner-shareable: coherent with CPU caches.
        const CACHE = 1 << 2;
        /// Instruction fetch forbidden.
        const NOEXEC = 1 << 3;
        /// Device memory attributes.
        const MMIO = 1 << 4;
        /// Guard mapping trailing an allocation.
        const GUARD = 1 << 5;
    }
}

/// Protection used for erratum guard mappings.
pub const GUARD_PROT: IommuProt =
    IommuProt::READ.union(IommuProt::WRITE).union(IommuProt::GUARD);

/// Direction of a DMA transfer relative to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device reads and writes.
    Bidirectional,
    /// Device reads memory.
    ToDevice,
    /// Device writes memory.
    FromDevice,
    /// No access.
    None,
}

impl Direction {
    /// Read/write bits for this direction.
    pub fn prot(self) -> IommuProt {
        match self {
            Direction::Bidirectional => IommuProt::READ | IommuProt::WRITE,
            Direction::ToDevice => IommuProt::READ,
            Direction::FromDevice => IommuProt::WRITE,
            Direction::None => IommuProt::empty(),
        }
    }
}

/// CPU-side page protection for coherent-buffer remaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuProt {
    /// Normal cacheable memory.
    Normal,
    /// Uncached, write-combining.
    WriteCombine,
    /// Strongly ordered, uncached.
    NonCached,
}

/// Resolves effective coherency from per-call attributes and the device default.
pub fn is_coherent(device_default: bool, attrs: DmaAttrs) -> bool {
    if attrs.contains(DmaAttrs::FORCE_COHERENT) {
        true
    } else if attrs.contains(DmaAttrs::FORCE_NON_COHERENT) {
        false
    } else {
        device_default
    }
}

/// IOMMU protection for a streaming or coherent mapping.
pub fn iommu_prot(dir: Direction, attrs: DmaAttrs, coherent: bool) -> IommuProt {
    let mut prot = dir.prot();
    if !attrs.contains(DmaAttrs::EXEC_MAPPING) {
        prot |= IommuProt::NOEXEC;
    }
    if attrs.contains(DmaAttrs::MMIO) {
        prot |= IommuProt::MMIO;
    }
    if coherent {
        prot |= IommuProt::CACHE;
    }
    prot
}

/// IOMMU protection for a physical resource such as an MMIO aperture.
pub fn resource_prot(dir: Direction) -> IommuProt {
    dir.prot() | IommuProt::MMIO
}

/// CPU remap protection for a coherent allocation.
pub fn cpu_prot(attrs: DmaAttrs, coherent: bool) -> CpuProt {
    if attrs.contains(DmaAttrs::MMIO) {
        CpuProt::NonCached
    } else if !coherent || attrs.contains(DmaAttrs::WRITE_COMBINE) {
        CpuProt::WriteCombine
    } else {
        CpuProt::Normal
    }
}
