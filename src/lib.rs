#![forbid(unsafe_code)]

//! Intel IGD passthrough over VFIO.
//!
//! The work is split across three crates, re-exported here:
//! - [`pci`]: the PCI bus, config space and MMIO overlay model the quirks operate on,
//! - [`fw_cfg`]: the firmware file table used to hand the OpRegion and stolen memory size to
//!   guest firmware,
//! - [`vfio`]: the passthrough device and the IGD legacy-mode quirks.

pub use igd_fw_cfg as fw_cfg;
pub use igd_pci as pci;
pub use igd_vfio as vfio;

pub use igd_vfio::{IgdError, QuirkContext, VfioPciDevice, VfioPciOptions};
