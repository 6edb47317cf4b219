//! Passthrough PCI device record.
//!
//! A [`VfioPciDevice`] pairs the physical function behind a [`VfioDevice`] with an emulated config
//! image. Each config bit is served either by the emulated image or by the hardware, as selected
//! by the emulated-bits mask, which lets quirks take over individual registers.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use igd_fw_cfg::FwCfg;
use igd_pci::config::{PciClassCode, PciConfigSpace, PCI_CLASS_DISPLAY_VGA, PCI_CONFIG_SPACE_SIZE};
use igd_pci::mmio::all_ones;
use igd_pci::{MmioRegion, PciBdf, PciBus, PCI_ANY_ID};

use crate::device::{
    read_region_exact, VfioDevice, VfioRegionInfo, VFIO_PCI_BAR0_REGION_INDEX,
    VFIO_PCI_BAR5_REGION_INDEX, VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_ROM_REGION_INDEX,
    VFIO_PCI_VGA_REGION_INDEX,
};
use crate::error::{IgdError, VfioError};
use crate::options::VfioPciOptions;
use crate::quirks::{self, VfioQuirk};

/// Emulated config image of a passthrough device, shared with the quirks that project it.
pub struct VfioPciConfig {
    device: Arc<dyn VfioDevice>,
    region: VfioRegionInfo,
    space: RwLock<PciConfigSpace>,
}

impl VfioPciConfig {
    fn new(device: Arc<dyn VfioDevice>, region: VfioRegionInfo, space: PciConfigSpace) -> Self {
        Self {
            device,
            region,
            space: RwLock::new(space),
        }
    }

    pub fn device(&self) -> &Arc<dyn VfioDevice> {
        &self.device
    }

    /// Read access to the emulated image.
    pub fn space(&self) -> RwLockReadGuard<'_, PciConfigSpace> {
        self.space.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the emulated image. Changes bypass the guest write mask.
    pub fn space_mut(&self) -> RwLockWriteGuard<'_, PciConfigSpace> {
        self.space.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a config register as the guest sees it.
    ///
    /// Emulated bits come from the emulated image, the rest from the device. Accesses that run past
    /// config space or use an odd width read as all ones.
    pub fn read(&self, offset: u16, len: usize) -> u64 {
        if !config_access_ok(offset, len) {
            return all_ones(len);
        }

        let (emu_bits, emu_val) = {
            let space = self.space();
            (space.emulated_mask(offset, len), space.get(offset, len))
        };
        if emu_bits == all_ones(len) {
            return emu_val;
        }

        let phys_val = self.read_physical(offset, len);
        (emu_val & emu_bits) | (phys_val & !emu_bits)
    }

    /// Writes a config register on behalf of the guest.
    ///
    /// The full value goes to the device unless every bit is emulated; the emulated image takes
    /// the bits its write mask allows.
    pub fn write(&self, offset: u16, len: usize, value: u64) {
        if !config_access_ok(offset, len) {
            return;
        }

        let mut space = self.space_mut();
        if space.emulated_mask(offset, len) != all_ones(len) {
            self.write_physical(offset, len, value);
        }

        let wmask = space.write_mask(offset, len);
        let current = space.get(offset, len);
        space.set(offset, len, (current & !wmask) | (value & wmask));
    }

    fn read_physical(&self, offset: u16, len: usize) -> u64 {
        let mut buf = [0u8; 8];
        match read_region_exact(
            self.device.as_ref(),
            &mut buf[..len],
            self.region.offset + u64::from(offset),
        ) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(err) => {
                tracing::warn!(
                    device = self.device.name(),
                    offset = format_args!("{offset:#x}"),
                    len,
                    error = %err,
                    "config read failed"
                );
                all_ones(len)
            }
        }
    }

    fn write_physical(&self, offset: u16, len: usize, value: u64) {
        let bytes = value.to_le_bytes();
        let result = self
            .device
            .write_at(&bytes[..len], self.region.offset + u64::from(offset));
        match result {
            Ok(written) if written == len => {}
            Ok(written) => tracing::warn!(
                device = self.device.name(),
                offset = format_args!("{offset:#x}"),
                len,
                written,
                "short config write"
            ),
            Err(err) => tracing::warn!(
                device = self.device.name(),
                offset = format_args!("{offset:#x}"),
                len,
                error = %err,
                "config write failed"
            ),
        }
    }
}

fn config_access_ok(offset: u16, len: usize) -> bool {
    matches!(len, 1 | 2 | 4 | 8)
        && usize::from(offset)
            .checked_add(len)
            .is_some_and(|end| end <= PCI_CONFIG_SPACE_SIZE)
}

/// One BAR of the passthrough device: its VFIO region (if the device has one) and the MMIO
/// window quirks overlay.
pub struct VfioBar {
    index: u32,
    region: Option<VfioRegionInfo>,
    mmio: MmioRegion,
    quirks: Vec<VfioQuirk>,
}

impl VfioBar {
    fn new(index: u32, region: Option<VfioRegionInfo>) -> Self {
        let size = region.map_or(0, |region| region.size);
        Self {
            index,
            region,
            mmio: MmioRegion::new(format!("bar{index}"), size),
            quirks: Vec::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn region(&self) -> Option<&VfioRegionInfo> {
        self.region.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.mmio.size()
    }

    pub fn mmio(&self) -> &MmioRegion {
        &self.mmio
    }

    /// Installs `quirk` over the BAR. The newest quirk is listed first.
    ///
    /// # Panics
    ///
    /// Panics if the quirk window does not fit inside the BAR.
    pub fn add_quirk(&mut self, quirk: VfioQuirk) {
        self.mmio.add_subregion_overlap(
            quirk.name,
            quirk.offset,
            quirk.size,
            quirk.handler.clone(),
            quirk.priority,
        );
        self.quirks.insert(0, quirk);
    }

    pub fn quirks(&self) -> &[VfioQuirk] {
        &self.quirks
    }
}

/// A legacy VGA window forwarded to the VFIO VGA region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfioVgaRange {
    pub name: &'static str,
    /// Guest address (I/O port or memory) of the window.
    pub base: u64,
    pub size: u64,
    /// Offset of the window within the device file.
    pub fd_offset: u64,
}

pub const VGA_MEM_BASE: u64 = 0xa0000;
pub const VGA_MEM_SIZE: u64 = 0x20000;
pub const VGA_IO_LO_BASE: u64 = 0x3b0;
pub const VGA_IO_LO_SIZE: u64 = 0xc;
pub const VGA_IO_HI_BASE: u64 = 0x3c0;
pub const VGA_IO_HI_SIZE: u64 = 0x20;

/// Smallest VGA region that covers all legacy windows.
const VGA_REGION_MIN_SIZE: u64 = 0xc0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfioVga {
    pub region: VfioRegionInfo,
    pub ranges: [VfioVgaRange; 3],
}

impl VfioVga {
    pub fn range(&self, name: &str) -> Option<&VfioVgaRange> {
        self.ranges.iter().find(|range| range.name == name)
    }
}

/// What the realize path hands to quirks that reach outside the device.
pub struct QuirkContext<'a> {
    pub bus: &'a mut PciBus,
    pub fw_cfg: &'a mut FwCfg,
}

/// A PCI function assigned to the guest through VFIO.
pub struct VfioPciDevice {
    name: String,
    bdf: PciBdf,
    device: Arc<dyn VfioDevice>,
    config: Arc<VfioPciConfig>,
    vendor_id: u16,
    device_id: u16,
    class: PciClassCode,
    bars: Vec<VfioBar>,
    rom: Option<VfioRegionInfo>,
    options: VfioPciOptions,
    hotplugged: bool,
    rom_read_failed: bool,
    vga: Option<VfioVga>,
    igd_opregion: Option<Arc<[u8]>>,
}

impl VfioPciDevice {
    /// Builds the device record for `device`, placed at guest address `bdf`.
    ///
    /// The emulated image starts as a copy of the physical config space with nothing emulated.
    pub fn new(
        device: Arc<dyn VfioDevice>,
        bdf: PciBdf,
        options: VfioPciOptions,
    ) -> Result<Self, VfioError> {
        let config_region = device.region_info(VFIO_PCI_CONFIG_REGION_INDEX)?;
        let mut raw = [0u8; PCI_CONFIG_SPACE_SIZE];
        read_region_exact(device.as_ref(), &mut raw, config_region.offset)?;

        let vendor_id = u16::from_le_bytes([raw[0], raw[1]]);
        let device_id = u16::from_le_bytes([raw[2], raw[3]]);
        let mut space = PciConfigSpace::new(vendor_id, device_id);
        space.set_bytes(0, &raw);
        let class = space.class_code();

        let bars = (VFIO_PCI_BAR0_REGION_INDEX..=VFIO_PCI_BAR5_REGION_INDEX)
            .map(|index| VfioBar::new(index, device.region_info(index).ok()))
            .collect();
        let rom = device.region_info(VFIO_PCI_ROM_REGION_INDEX).ok();

        tracing::debug!(
            device = device.name(),
            %bdf,
            id = format_args!("{vendor_id:04x}:{device_id:04x}"),
            "vfio-pci device attached"
        );

        Ok(Self {
            name: device.name().to_string(),
            bdf,
            config: Arc::new(VfioPciConfig::new(device.clone(), config_region, space)),
            device,
            vendor_id,
            device_id,
            class,
            bars,
            rom,
            options,
            hotplugged: false,
            rom_read_failed: false,
            vga: None,
            igd_opregion: None,
        })
    }

    /// Marks the device as added after machine creation.
    pub fn with_hotplugged(mut self, hotplugged: bool) -> Self {
        self.hotplugged = hotplugged;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn options(&self) -> &VfioPciOptions {
        &self.options
    }

    pub fn hotplugged(&self) -> bool {
        self.hotplugged
    }

    pub fn rom_read_failed(&self) -> bool {
        self.rom_read_failed
    }

    pub(crate) fn set_rom_read_failed(&mut self) {
        self.rom_read_failed = true;
    }

    pub fn vfio_device(&self) -> &Arc<dyn VfioDevice> {
        &self.device
    }

    pub fn config(&self) -> &Arc<VfioPciConfig> {
        &self.config
    }

    pub fn read_config(&self, offset: u16, len: usize) -> u64 {
        self.config.read(offset, len)
    }

    pub fn write_config(&self, offset: u16, len: usize, value: u64) {
        self.config.write(offset, len, value)
    }

    /// Matches vendor and device id; either may be [`PCI_ANY_ID`].
    pub fn pci_is(&self, vendor: u32, device: u32) -> bool {
        (vendor == PCI_ANY_ID || vendor == u32::from(self.vendor_id))
            && (device == PCI_ANY_ID || device == u32::from(self.device_id))
    }

    pub fn is_vga(&self) -> bool {
        self.class.class_device() == PCI_CLASS_DISPLAY_VGA
    }

    pub fn bar(&self, nr: u32) -> Option<&VfioBar> {
        self.bars.get(nr as usize)
    }

    pub fn bar_mut(&mut self, nr: u32) -> Option<&mut VfioBar> {
        self.bars.get_mut(nr as usize)
    }

    pub fn rom_region(&self) -> Option<&VfioRegionInfo> {
        self.rom.as_ref()
    }

    pub fn vga(&self) -> Option<&VfioVga> {
        self.vga.as_ref()
    }

    /// Enables forwarding of the legacy VGA windows.
    pub fn populate_vga(&mut self) -> Result<(), VfioError> {
        let region = self
            .device
            .region_info(VFIO_PCI_VGA_REGION_INDEX)
            .map_err(|_| VfioError::VgaUnavailable)?;
        if region.size < VGA_REGION_MIN_SIZE || !region.readable() {
            return Err(VfioError::VgaUnavailable);
        }

        let window = |name, base, size| VfioVgaRange {
            name,
            base,
            size,
            fd_offset: region.offset + base,
        };
        self.vga = Some(VfioVga {
            region,
            ranges: [
                window("vga-mem", VGA_MEM_BASE, VGA_MEM_SIZE),
                window("vga-io-lo", VGA_IO_LO_BASE, VGA_IO_LO_SIZE),
                window("vga-io-hi", VGA_IO_HI_BASE, VGA_IO_HI_SIZE),
            ],
        });
        tracing::debug!(device = %self.name, "VGA access enabled");
        Ok(())
    }

    pub fn igd_opregion(&self) -> Option<&Arc<[u8]>> {
        self.igd_opregion.as_ref()
    }

    pub(crate) fn set_igd_opregion(&mut self, opregion: Arc<[u8]>) {
        self.igd_opregion = Some(opregion);
    }

    /// Guest read from BAR `nr`. Quirk overlays take precedence over the device.
    pub fn bar_read(&self, nr: u32, offset: u64, size: usize) -> u64 {
        let Some(bar) = self.bar(nr) else {
            return all_ones(size);
        };
        if let Some(value) = bar.mmio.dispatch_read(offset, size) {
            return value;
        }
        bar_region_read(self.device.as_ref(), bar.region.as_ref(), offset, size)
    }

    /// Guest write to BAR `nr`. Quirk overlays take precedence over the device.
    pub fn bar_write(&self, nr: u32, offset: u64, size: usize, value: u64) {
        let Some(bar) = self.bar(nr) else {
            return;
        };
        if bar.mmio.dispatch_write(offset, size, value) {
            return;
        }
        let Some(region) = bar.region else {
            return;
        };
        let bytes = value.to_le_bytes();
        let len = size.min(bytes.len());
        if let Err(err) = self.device.write_at(&bytes[..len], region.offset + offset) {
            tracing::warn!(
                device = %self.name,
                bar = nr,
                offset = format_args!("{offset:#x}"),
                error = %err,
                "BAR write failed"
            );
        }
    }

    /// Installs BAR quirks and, when requested, exposes the OpRegion without legacy mode.
    pub fn realize(&mut self, ctx: &mut QuirkContext<'_>) -> Result<(), IgdError> {
        for nr in VFIO_PCI_BAR0_REGION_INDEX..=VFIO_PCI_BAR5_REGION_INDEX {
            quirks::setup_bar_quirks(self, nr, ctx);
        }

        if self.options.igd_opregion && self.igd_opregion.is_none() {
            quirks::igd::setup_opregion(self, ctx.fw_cfg)?;
        }
        Ok(())
    }
}

/// Reads `size` bytes at `offset` of a BAR region. Anything the device cannot serve reads as all
/// ones.
pub(crate) fn bar_region_read(
    device: &dyn VfioDevice,
    region: Option<&VfioRegionInfo>,
    offset: u64,
    size: usize,
) -> u64 {
    let Some(region) = region else {
        return all_ones(size);
    };
    if !(1..=8).contains(&size) {
        return all_ones(size);
    }
    let mut buf = [0u8; 8];
    match read_region_exact(device, &mut buf[..size], region.offset + offset) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => all_ones(size),
    }
}
