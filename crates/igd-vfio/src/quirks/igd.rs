//! Intel integrated graphics (IGD) assignment.
//!
//! IGD is not a discrete device: its video BIOS and drivers depend on chipset state the VM does not
//! have by default. "Legacy mode" assignment recreates enough of that state for the vBIOS to run:
//! the device must sit at guest address 00:02.0 and have a ROM; the host and LPC bridge identities
//! are copied into the VM; the OpRegion is handed to firmware; and firmware is asked to reserve
//! stolen memory and program BDSM with its base.
//!
//! Everything here is best effort. A legacy-mode prerequisite that is not met is logged and the
//! device is left to run as a plain passthrough device (UPT mode).

use std::any::Any;
use std::error::Error as _;
use std::io;
use std::sync::Arc;

use igd_fw_cfg::FwCfg;
use igd_pci::config::{
    PCI_CLASS_BRIDGE_ISA, PCI_DEVICE_ID, PCI_REVISION_ID, PCI_SUBSYSTEM_ID, PCI_SUBSYSTEM_VENDOR_ID,
    PCI_VENDOR_ID,
};
use igd_pci::{
    PciBdf, PciBus, PciConfigSpace, PciDevice, PciDeviceRegistry, PciDeviceType, PciError,
    PciRegister, PCI_ANY_ID, PCI_VENDOR_ID_INTEL,
};

use super::{ConfigMirrorQuirk, VfioQuirk};
use crate::device::{
    read_region_exact, VfioDevice, VfioRegionInfo, VFIO_PCI_BAR0_REGION_INDEX,
    VFIO_REGION_SUBTYPE_INTEL_IGD_HOST_CFG, VFIO_REGION_SUBTYPE_INTEL_IGD_LPC_CFG,
    VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION, VFIO_REGION_TYPE_PCI_VENDOR_TYPE,
};
use crate::error::IgdError;
use crate::pci::{QuirkContext, VfioPciDevice};

/// IGD graphics generation (6 = SandyBridge ... 12 = Tiger Lake and later).
pub type IgdGeneration = u8;

/// ASL Storage register: guest physical address of the OpRegion copy.
pub const IGD_ASLS: u16 = 0xfc;
/// Graphics control register.
pub const IGD_GMCH: u16 = 0x50;
/// Base of stolen memory.
pub const IGD_BDSM: u16 = 0x5c;
/// Base of stolen memory on gen 11 and later (64 bit).
pub const IGD_BDSM_GEN11: u16 = 0xc0;

pub const IGD_GMCH_GEN6_GMS_SHIFT: u32 = 3;
pub const IGD_GMCH_GEN6_GMS_MASK: u32 = 0x1f;
pub const IGD_GMCH_GEN8_GMS_SHIFT: u32 = 8;
pub const IGD_GMCH_GEN8_GMS_MASK: u32 = 0xff;

/// GMCH bit set when the host firmware disabled legacy VGA decoding.
pub const IGD_GMCH_VGA_DISABLE: u32 = 0x2;

pub const IGD_GGC_MMIO_OFFSET: u64 = 0x10_8040;
pub const IGD_BDSM_MMIO_OFFSET: u64 = 0x10_80c0;

/// Guest addresses legacy mode depends on.
pub const IGD_BDF: PciBdf = PciBdf::new(0, 0x02, 0);
pub const IGD_HOST_BRIDGE_BDF: PciBdf = PciBdf::new(0, 0x00, 0);
pub const IGD_LPC_BRIDGE_BDF: PciBdf = PciBdf::new(0, 0x1f, 0);

pub const IGD_LPC_BRIDGE_TYPE_NAME: &str = "vfio-pci-igd-lpc-bridge";

pub const FW_CFG_IGD_OPREGION: &str = "etc/igd-opregion";
pub const FW_CFG_IGD_BDSM_SIZE: &str = "etc/igd-bdsm-size";

/// Largest `x-igd-gms` value accepted before/after gen 8, in 32MiB units.
const IGD_GMS_OVERRIDE_MAX_GEN6: u32 = 0x10;
const IGD_GMS_OVERRIDE_MAX_GEN8: u32 = 0x40;

const MIB: u64 = 1024 * 1024;

const IGD_MIRROR_PRIORITY: i32 = 1;

/// Maps a device id to its graphics generation.
///
/// Only the high byte of the id is looked at (see `i915_pciids.h`); a match says nothing about
/// whether the device actually works in legacy mode.
pub fn igd_gen(device_id: u16) -> Option<IgdGeneration> {
    // Broxton/Apollo Lake: 0x0a84, 0x1a84, 0x1a85, 0x5a84, 0x5a85. Must win over Haswell's 0x0a00.
    if device_id & 0xffe == 0xa84 {
        return Some(9);
    }

    match device_id & 0xff00 {
        // SandyBridge, IvyBridge
        0x0100 => Some(6),
        // Haswell, Valleyview/Bay Trail
        0x0400 | 0x0a00 | 0x0c00 | 0x0d00 | 0x0f00 => Some(7),
        // Broadwell, Cherryview
        0x1600 | 0x2200 => Some(8),
        // Skylake, Gemini Lake, Kaby Lake, Coffee Lake, Comet Lake
        0x1900 | 0x3100 | 0x5900 | 0x3e00 | 0x9b00 => Some(9),
        // Ice Lake, Elkhart Lake, Jasper Lake
        0x8a00 | 0x4500 | 0x4e00 => Some(11),
        // Tiger Lake, Rocket Lake, Alder Lake, Raptor Lake
        0x9a00 | 0x4c00 | 0x4600 | 0xa700 => Some(12),
        _ => None,
    }
}

/// Stolen memory size, in bytes, encoded by the GMS field of `gmch`.
pub fn igd_stolen_memory_size(gen: IgdGeneration, gmch: u32) -> u64 {
    let gms = if gen < 8 {
        (gmch >> IGD_GMCH_GEN6_GMS_SHIFT) & IGD_GMCH_GEN6_GMS_MASK
    } else {
        (gmch >> IGD_GMCH_GEN8_GMS_SHIFT) & IGD_GMCH_GEN8_GMS_MASK
    };
    let gms = u64::from(gms);

    if gen < 9 || gms < 0xf0 {
        gms * 32 * MIB
    } else {
        (gms - 0xf0 + 1) * 4 * MIB
    }
}

/// Replaces the GMS field of `gmch` with a user supplied size (32MiB units).
pub fn apply_gms_override(gen: IgdGeneration, gmch: u32, gms: u32) -> Result<u32, IgdError> {
    let (shift, mask, max, range) = if gen < 8 {
        (
            IGD_GMCH_GEN6_GMS_SHIFT,
            IGD_GMCH_GEN6_GMS_MASK,
            IGD_GMS_OVERRIDE_MAX_GEN6,
            "0~0x10",
        )
    } else {
        (
            IGD_GMCH_GEN8_GMS_SHIFT,
            IGD_GMCH_GEN8_GMS_MASK,
            IGD_GMS_OVERRIDE_MAX_GEN8,
            "0~0x40",
        )
    };

    if gms > max {
        return Err(IgdError::InvalidParameterValue {
            name: "x-igd-gms",
            range,
        });
    }
    Ok((gmch & !(mask << shift)) | (gms << shift))
}

/// Copies the host OpRegion into a firmware file and arms the ASLS register.
///
/// Firmware is expected to reserve memory for the table, copy `etc/igd-opregion` into it and write
/// the base address to ASLS.
pub fn setup_opregion(vdev: &mut VfioPciDevice, fw_cfg: &mut FwCfg) -> Result<(), IgdError> {
    if vdev.hotplugged() {
        return Err(IgdError::UnsupportedHotplug("IGD OpRegion"));
    }

    let info = vdev
        .vfio_device()
        .dev_region_info(
            VFIO_REGION_TYPE_PCI_VENDOR_TYPE | u32::from(PCI_VENDOR_ID_INTEL),
            VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION,
        )
        .map_err(IgdError::RegionUnavailable)?;

    let len = usize::try_from(info.size).map_err(|_| IgdError::ReadFailed)?;
    let mut opregion = vec![0u8; len];
    if let Err(err) = read_region_exact(vdev.vfio_device().as_ref(), &mut opregion, info.offset) {
        tracing::debug!(device = vdev.name(), error = %err, "OpRegion read failed");
        return Err(IgdError::ReadFailed);
    }

    let opregion: Arc<[u8]> = opregion.into();
    fw_cfg.add_file(FW_CFG_IGD_OPREGION, opregion.clone())?;
    tracing::debug!(device = vdev.name(), size = len, "igd opregion enabled");

    vdev.config()
        .space_mut()
        .set_register(IGD_ASLS, 4, PciRegister::read_write(0));
    vdev.set_igd_opregion(opregion);
    Ok(())
}

/// Registers copied from the physical LPC bridge: (offset, width).
const IGD_LPC_BRIDGE_REGS: &[(u16, usize)] = &[
    (PCI_VENDOR_ID, 2),
    (PCI_DEVICE_ID, 2),
    (PCI_REVISION_ID, 2),
    (PCI_SUBSYSTEM_VENDOR_ID, 2),
    (PCI_SUBSYSTEM_ID, 2),
];

/// Registers copied from the physical host bridge. The VM keeps its own host bridge model, only
/// revision and subsystem values change.
const IGD_HOST_BRIDGE_REGS: &[(u16, usize)] = &[
    (PCI_REVISION_ID, 2),
    (PCI_SUBSYSTEM_VENDOR_ID, 2),
    (PCI_SUBSYSTEM_ID, 2),
];

/// Gives the VM's host bridge and an LPC bridge at 00:1f.0 the identity of the physical ones.
///
/// An LPC bridge already at 00:1f.0 is reused only if it is an [`IgdLpcBridge`] (the user may
/// have created one to control multifunction placement); any other device there is left alone
/// and the setup fails.
pub fn setup_lpc_bridge(vdev: &VfioPciDevice, bus: &mut PciBus) -> Result<(), IgdError> {
    if vdev.hotplugged() {
        return Err(IgdError::UnsupportedHotplug("IGD LPC"));
    }

    if bus.device(IGD_LPC_BRIDGE_BDF).is_some()
        && bus.device_as::<IgdLpcBridge>(IGD_LPC_BRIDGE_BDF).is_none()
    {
        return Err(IgdError::AddressConflict(IGD_LPC_BRIDGE_BDF));
    }

    let device = vdev.vfio_device().as_ref();
    let intel_type = VFIO_REGION_TYPE_PCI_VENDOR_TYPE | u32::from(PCI_VENDOR_ID_INTEL);
    let lpc = device
        .dev_region_info(intel_type, VFIO_REGION_SUBTYPE_INTEL_IGD_LPC_CFG)
        .map_err(|_| IgdError::CapabilityMissing("IGD LPC bridge"))?;
    let host = device
        .dev_region_info(intel_type, VFIO_REGION_SUBTYPE_INTEL_IGD_HOST_CFG)
        .map_err(|_| IgdError::CapabilityMissing("IGD host bridge"))?;

    let lpc_bridge = bus
        .find_or_create_device(IGD_LPC_BRIDGE_BDF, IGD_LPC_BRIDGE_TYPE_NAME)
        .map_err(IgdError::LpcBridgeCreate)?;
    igd_copy(
        device,
        &lpc,
        lpc_bridge.config_mut(),
        IGD_LPC_BRIDGE_REGS,
        "LPC bridge",
    )?;
    tracing::debug!(device = vdev.name(), "igd lpc bridge enabled");

    let host_config = bus
        .device_config_mut(IGD_HOST_BRIDGE_BDF)
        .ok_or(IgdError::HostBridgeMissing)?;
    igd_copy(device, &host, host_config, IGD_HOST_BRIDGE_REGS, "host bridge")?;
    tracing::debug!(device = vdev.name(), "igd host bridge enabled");

    Ok(())
}

/// Copies `regs` from a bridge config region straight into `config`, bypassing write masks.
fn igd_copy(
    device: &dyn VfioDevice,
    info: &VfioRegionInfo,
    config: &mut PciConfigSpace,
    regs: &[(u16, usize)],
    target: &'static str,
) -> Result<(), IgdError> {
    for &(offset, len) in regs {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..len];
        let result = match device.read_at(buf, info.offset + u64::from(offset)) {
            Ok(n) if n == len => Ok(()),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {n} of {len} bytes at {offset:#x}"),
            )),
            Err(err) => Err(err),
        };
        if let Err(source) = result {
            tracing::error!(device = device.name(), error = %source, "IGD copy failed");
            return Err(IgdError::CopyFailed { target, source });
        }
        config.set_bytes(offset, buf);
    }
    Ok(())
}

/// Dummy ISA/LPC bridge the vBIOS expects at 00:1f.0.
///
/// It has no behavior of its own; legacy-mode setup copies the physical bridge's identity into it.
pub struct IgdLpcBridge {
    config: PciConfigSpace,
}

impl IgdLpcBridge {
    fn new() -> Self {
        let mut config = PciConfigSpace::new(0, 0);
        config.set_class_code(
            (PCI_CLASS_BRIDGE_ISA >> 8) as u8,
            PCI_CLASS_BRIDGE_ISA as u8,
            0,
            0,
        );
        Self { config }
    }

    fn create(bdf: PciBdf) -> Result<Box<dyn PciDevice>, PciError> {
        if bdf != IGD_LPC_BRIDGE_BDF {
            return Err(PciError::InvalidAddress {
                type_name: IGD_LPC_BRIDGE_TYPE_NAME,
                expected: IGD_LPC_BRIDGE_BDF,
                actual: bdf,
            });
        }
        Ok(Box::new(Self::new()))
    }
}

impl PciDevice for IgdLpcBridge {
    fn type_name(&self) -> &'static str {
        IGD_LPC_BRIDGE_TYPE_NAME
    }

    fn config(&self) -> &PciConfigSpace {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registers the device models legacy mode may create.
pub fn register_igd_types(registry: &mut PciDeviceRegistry) -> Result<(), PciError> {
    registry.register(PciDeviceType {
        name: IGD_LPC_BRIDGE_TYPE_NAME,
        description: "VFIO dummy ISA/LPC bridge for IGD assignment",
        hotpluggable: false,
        factory: IgdLpcBridge::create,
    })
}

/// Intel VGA device at 00:02.0, probed for the expected BAR.
///
/// The vBIOS and some drivers hard-code the bus address, so nothing else is considered.
fn igd_legacy_candidate(vdev: &VfioPciDevice, nr: u32, expected: u32) -> bool {
    nr == expected
        && vdev.pci_is(u32::from(PCI_VENDOR_ID_INTEL), PCI_ANY_ID)
        && vdev.is_vga()
        && vdev.bdf() == IGD_BDF
}

/// Mirrors GGC and BDSM into BAR0, where the Windows driver reads them.
pub fn probe_igd_bar0_quirk(vdev: &mut VfioPciDevice, nr: u32) {
    if !igd_legacy_candidate(vdev, nr, VFIO_PCI_BAR0_REGION_INDEX) {
        return;
    }
    let Some(gen) = igd_gen(vdev.device_id()) else {
        return;
    };

    let (bdsm_offset, bdsm_width) = if gen < 11 {
        (IGD_BDSM, 4)
    } else {
        (IGD_BDSM_GEN11, 8)
    };

    let config = vdev.config().clone();
    let name = vdev.name().to_string();
    let Some(bar) = vdev.bar_mut(nr) else {
        return;
    };
    if bar.size() < IGD_BDSM_MMIO_OFFSET + bdsm_width as u64 {
        tracing::warn!(
            device = %name,
            size = bar.size(),
            "BAR0 too small for IGD register mirrors"
        );
        return;
    }
    let region = bar.region().copied();

    let ggc = ConfigMirrorQuirk::new(
        "vfio-igd-ggc-quirk",
        config.clone(),
        region,
        IGD_GGC_MMIO_OFFSET,
        IGD_GMCH,
        2,
    );
    bar.add_quirk(VfioQuirk::new(
        ggc.name(),
        IGD_GGC_MMIO_OFFSET,
        2,
        IGD_MIRROR_PRIORITY,
        Arc::new(ggc),
    ));

    let bdsm = ConfigMirrorQuirk::new(
        "vfio-igd-bdsm-quirk",
        config,
        region,
        IGD_BDSM_MMIO_OFFSET,
        bdsm_offset,
        bdsm_width,
    );
    bar.add_quirk(VfioQuirk::new(
        bdsm.name(),
        IGD_BDSM_MMIO_OFFSET,
        bdsm_width as u64,
        IGD_MIRROR_PRIORITY,
        Arc::new(bdsm),
    ));

    tracing::debug!(device = %name, gen, "igd BAR0 mirrors installed");
}

/// Attempts legacy mode when BAR4 is probed. Failures are logged and leave the device in UPT
/// mode.
pub fn probe_igd_bar4_quirk(vdev: &mut VfioPciDevice, nr: u32, ctx: &mut QuirkContext<'_>) {
    if !igd_legacy_candidate(vdev, nr, 4) {
        return;
    }

    match igd_legacy_mode_setup(vdev, ctx) {
        Ok(stolen) => tracing::info!(
            device = vdev.name(),
            stolen_mib = stolen / MIB,
            "IGD device {} legacy mode enabled, stolen memory {} MiB",
            vdev.name(),
            stolen / MIB
        ),
        Err(err) => tracing::error!(
            device = vdev.name(),
            error = %error_chain(&err),
            "IGD legacy mode disabled"
        ),
    }
}

/// Runs the legacy-mode steps in order and returns the stolen memory size requested from firmware.
///
/// Config registers are only touched once every earlier step has succeeded.
pub fn igd_legacy_mode_setup(
    vdev: &mut VfioPciDevice,
    ctx: &mut QuirkContext<'_>,
) -> Result<u64, IgdError> {
    let gen = igd_gen(vdev.device_id()).ok_or(IgdError::UnsupportedGeneration {
        device_id: vdev.device_id(),
    })?;

    // The point of legacy mode is running the vBIOS; without a ROM there is nothing to enable.
    // Only BIOS ROMs show up here, so a UEFI guest needs CSM.
    let has_rom = vdev.rom_region().is_some_and(|rom| rom.size != 0);
    if !has_rom && vdev.options().romfile.is_none() {
        return Err(IgdError::NoRom);
    }

    if vdev.hotplugged() {
        vdev.set_rom_read_failed();
        return Err(IgdError::UnsupportedHotplug("IGD legacy mode (ROM disabled)"));
    }

    let mut gmch = vdev.read_config(IGD_GMCH, 4) as u32;

    if gmch & IGD_GMCH_VGA_DISABLE == 0 && vdev.vga().is_none() {
        vdev.populate_vga().map_err(IgdError::VgaEnableFailed)?;
    }

    setup_opregion(vdev, ctx.fw_cfg)?;
    setup_lpc_bridge(vdev, ctx.bus)?;

    let gms = vdev.options().igd_gms;
    if gms != 0 {
        match apply_gms_override(gen, gmch, gms) {
            Ok(value) => gmch = value,
            Err(err) => tracing::error!(device = vdev.name(), error = %err, "ignoring x-igd-gms"),
        }
    }

    // Firmware reserves a 1MiB aligned region below 4GiB of this size and writes its base to BDSM.
    let stolen = igd_stolen_memory_size(gen, gmch);
    ctx.fw_cfg
        .add_file(FW_CFG_IGD_BDSM_SIZE, stolen.to_le_bytes().to_vec())?;

    let mut config = vdev.config().space_mut();
    config.set_register(IGD_GMCH, 4, PciRegister::read_only(u64::from(gmch)));
    if gen < 11 {
        config.set_register(IGD_BDSM, 4, PciRegister::read_write(0));
    } else {
        config.set_register(IGD_BDSM_GEN11, 8, PciRegister::read_write(0));
    }

    Ok(stolen)
}

/// Formats an error followed by its sources, `outer: inner: ...`.
fn error_chain(err: &IgdError) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
