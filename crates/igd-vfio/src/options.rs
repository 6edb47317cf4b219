use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// User-facing properties of a `vfio-pci` device.
///
/// Property names follow the command-line spelling, so a device can be described in JSON as
/// `{"host": "0000:00:02.0", "x-igd-gms": 2}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VfioPciOptions {
    /// Host address of the assigned device. Informational; the device handle is opened elsewhere.
    pub host: Option<String>,

    /// Boot ROM image to expose instead of the device ROM.
    pub romfile: Option<PathBuf>,

    /// Stolen memory size override in units of 32MiB. Zero keeps the value the host firmware
    /// programmed into GMCH.
    #[serde(rename = "x-igd-gms")]
    pub igd_gms: u32,

    /// Expose the OpRegion to the guest even when legacy mode is not in use.
    #[serde(rename = "x-igd-opregion")]
    pub igd_opregion: bool,
}
