use std::io;

use igd_fw_cfg::FwCfgError;
use igd_pci::{PciBdf, PciError};
use thiserror::Error;

/// Failures reported by the VFIO device layer.
#[derive(Debug, Error)]
pub enum VfioError {
    #[error("VFIO region {index} is not available")]
    RegionNotFound { index: u32 },

    #[error("VFIO device specific region type {ty:#x} subtype {subtype:#x} is not available")]
    DeviceRegionNotFound { ty: u32, subtype: u32 },

    #[error("short read: wanted {expected} bytes at {offset:#x}, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("VGA region is unavailable or too small")]
    VgaUnavailable,

    #[error("io error")]
    Io(#[from] io::Error),
}

/// Failures of the IGD legacy-mode / OpRegion quirks.
///
/// None of these are fatal to the emulated device: the BAR probes log them and leave legacy mode
/// disabled.
#[derive(Debug, Error)]
pub enum IgdError {
    #[error("{0} is not supported on hotplugged device")]
    UnsupportedHotplug(&'static str),

    #[error("device does not support IGD OpRegion feature")]
    RegionUnavailable(#[source] VfioError),

    #[error("{0} access is not supported by kernel")]
    CapabilityMissing(&'static str),

    #[error("failed to read IGD OpRegion")]
    ReadFailed,

    #[error("cannot create LPC bridge due to existing device at {0}")]
    AddressConflict(PciBdf),

    #[error("failed to create/modify {target} for IGD")]
    CopyFailed {
        target: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("can't find host bridge")]
    HostBridgeMissing,

    #[error("IGD device {device_id:#06x} is unsupported in legacy mode, try SandyBridge or newer")]
    UnsupportedGeneration { device_id: u16 },

    #[error("IGD device has no ROM")]
    NoRom,

    #[error("failed to enable VGA access")]
    VgaEnableFailed(#[source] VfioError),

    #[error("parameter '{name}' expects {range}")]
    InvalidParameterValue {
        name: &'static str,
        range: &'static str,
    },

    #[error("failed to create LPC bridge")]
    LpcBridgeCreate(#[source] PciError),

    #[error("failed to publish fw_cfg file")]
    FirmwareConfig(#[from] FwCfgError),
}
