//! Device specific quirks applied while a passthrough device is realized.

pub mod igd;

use std::sync::Arc;

use igd_pci::mmio::all_ones;
use igd_pci::MmioHandler;

use crate::device::VfioRegionInfo;
use crate::pci::{bar_region_read, QuirkContext, VfioPciConfig, VfioPciDevice};

/// An overlay installed over part of a BAR.
pub struct VfioQuirk {
    pub name: &'static str,
    /// Offset of the overlay within the BAR.
    pub offset: u64,
    pub size: u64,
    pub priority: i32,
    pub handler: Arc<dyn MmioHandler>,
}

impl VfioQuirk {
    pub fn new(
        name: &'static str,
        offset: u64,
        size: u64,
        priority: i32,
        handler: Arc<dyn MmioHandler>,
    ) -> Self {
        Self {
            name,
            offset,
            size,
            priority,
            handler,
        }
    }
}

impl core::fmt::Debug for VfioQuirk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VfioQuirk")
            .field("name", &self.name)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &self.size)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Projects a config register into BAR space.
///
/// Reads return the config register as the guest would see it through config space. The BAR is
/// still read (and the result discarded) in case the hardware cares. Writes are dropped: the
/// config register is the only guest-writable copy.
pub struct ConfigMirrorQuirk {
    name: &'static str,
    config: Arc<VfioPciConfig>,
    bar_region: Option<VfioRegionInfo>,
    /// Offset of the mirror within the BAR.
    offset: u64,
    config_offset: u16,
    width: usize,
}

impl ConfigMirrorQuirk {
    pub fn new(
        name: &'static str,
        config: Arc<VfioPciConfig>,
        bar_region: Option<VfioRegionInfo>,
        offset: u64,
        config_offset: u16,
        width: usize,
    ) -> Self {
        Self {
            name,
            config,
            bar_region,
            offset,
            config_offset,
            width,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config_offset(&self) -> u16 {
        self.config_offset
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl MmioHandler for ConfigMirrorQuirk {
    fn read(&self, offset: u64, size: usize) -> u64 {
        let in_bounds = offset
            .checked_add(size as u64)
            .is_some_and(|end| end <= self.width as u64);
        if !in_bounds {
            return all_ones(size);
        }

        let _ = bar_region_read(
            self.config.device().as_ref(),
            self.bar_region.as_ref(),
            self.offset + offset,
            size,
        );
        // `offset < width <= 8`, so this cannot truncate.
        self.config.read(self.config_offset + offset as u16, size)
    }

    fn write(&self, offset: u64, size: usize, value: u64) {
        tracing::trace!(
            quirk = self.name,
            offset = format_args!("{:#x}", self.offset + offset),
            size,
            value = format_args!("{value:#x}"),
            "ignoring write to config mirror"
        );
    }
}

/// Runs every BAR quirk probe for BAR `nr`.
pub fn setup_bar_quirks(vdev: &mut VfioPciDevice, nr: u32, ctx: &mut QuirkContext<'_>) {
    igd::probe_igd_bar0_quirk(vdev, nr);
    igd::probe_igd_bar4_quirk(vdev, nr, ctx);
}
