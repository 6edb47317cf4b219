#![forbid(unsafe_code)]

//! VFIO passthrough of Intel integrated graphics.
//!
//! [`VfioPciDevice`] is the guest-facing record of an assigned PCI function. While it is realized,
//! BAR quirks are probed; for an Intel VGA device at 00:02.0 the IGD quirks in [`quirks::igd`]
//! mirror the graphics control registers into BAR0 and try to enable legacy mode assignment.

pub mod device;
pub mod error;
pub mod options;
pub mod pci;
pub mod quirks;

pub use device::{read_region_exact, VfioDevice, VfioRegionInfo};
#[cfg(unix)]
pub use device::FileVfioDevice;
pub use error::{IgdError, VfioError};
pub use options::VfioPciOptions;
pub use pci::{QuirkContext, VfioBar, VfioPciConfig, VfioPciDevice, VfioVga, VfioVgaRange};
pub use quirks::igd::{
    igd_gen, igd_stolen_memory_size, register_igd_types, IgdGeneration, IgdLpcBridge,
};
pub use quirks::{ConfigMirrorQuirk, VfioQuirk};
