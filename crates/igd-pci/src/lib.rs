#![forbid(unsafe_code)]

//! Minimal PCI device framework used by the IGD passthrough quirks.
//!
//! This is not a PCI subsystem. It models just enough of one for device quirks to work against:
//! - a conventional 256-byte config space with write-mask and emulated-bit images,
//! - a root bus keyed by [`PciBdf`] with a registry of constructible device types, and
//! - MMIO regions that accept higher-priority overlays (used for register mirrors).

pub mod bus;
pub mod config;
pub mod error;
pub mod host_bridge;
pub mod mmio;
pub mod registry;

pub use bus::PciBus;
pub use config::{PciClassCode, PciConfigSpace, PciRegister, PciSubsystemIds, PciVendorDeviceId};
pub use error::PciError;
pub use host_bridge::PciHostBridge;
pub use mmio::{MmioHandler, MmioRegion};
pub use registry::{PciDeviceRegistry, PciDeviceType};

use std::any::Any;
use std::fmt;

pub const PCI_VENDOR_ID_INTEL: u16 = 0x8086;

/// Wildcard for vendor/device matching.
pub const PCI_ANY_ID: u32 = !0;

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// Creates a new BDF.
    ///
    /// The caller is responsible for ensuring the values are within the PCI ranges:
    /// bus < 256, device < 32, function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Returns the 8-bit devfn encoding (`device << 3 | function`).
    pub const fn devfn(self) -> u8 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        (self.device << 3) | self.function
    }

    /// Packs this BDF into a compact `u16` key using the standard PCI config-address bit layout.
    ///
    /// Layout (LSB..MSB):
    /// - bits 0..=2: function (0-7)
    /// - bits 3..=7: device (0-31)
    /// - bits 8..=15: bus (0-255)
    pub const fn pack_u16(self) -> u16 {
        ((self.bus as u16) << 8) | self.devfn() as u16
    }

    /// Unpacks a `u16` produced by [`PciBdf::pack_u16`] back into a [`PciBdf`].
    pub const fn unpack_u16(v: u16) -> Self {
        Self {
            bus: (v >> 8) as u8,
            device: ((v >> 3) & 0x1f) as u8,
            function: (v & 0x7) as u8,
        }
    }
}

impl From<PciBdf> for u16 {
    fn from(value: PciBdf) -> Self {
        value.pack_u16()
    }
}

impl From<u16> for PciBdf {
    fn from(value: u16) -> Self {
        Self::unpack_u16(value)
    }
}

impl core::cmp::Ord for PciBdf {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.bus, self.device, self.function).cmp(&(other.bus, other.device, other.function))
    }
}

impl core::cmp::PartialOrd for PciBdf {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus, self.device, self.function
        )
    }
}

/// A device that can be attached to a [`PciBus`].
///
/// Devices are addressed through the bus and downcast through [`PciDevice::as_any`] when a caller
/// needs to know whether the device at an address is of a specific model.
pub trait PciDevice: Any + Send + Sync {
    /// Registered type name of this device model.
    fn type_name(&self) -> &'static str;

    fn config(&self) -> &PciConfigSpace;
    fn config_mut(&mut self) -> &mut PciConfigSpace;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
