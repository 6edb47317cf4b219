use std::any::Any;

use crate::config::PCI_CLASS_BRIDGE_HOST;
use crate::{PciConfigSpace, PciDevice, PCI_VENDOR_ID_INTEL};

/// Plain host bridge living at 00:00.0.
///
/// Only the identity registers are modelled; passthrough quirks may overwrite revision and
/// subsystem values with those of the physical host bridge.
pub struct PciHostBridge {
    config: PciConfigSpace,
}

impl PciHostBridge {
    pub const TYPE_NAME: &'static str = "pci-host-bridge";

    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut config = PciConfigSpace::new(vendor_id, device_id);
        config.set_class_code(
            (PCI_CLASS_BRIDGE_HOST >> 8) as u8,
            PCI_CLASS_BRIDGE_HOST as u8,
            0,
            0,
        );
        Self { config }
    }

    /// Intel 440FX PMC, the host bridge of the classic PC chipset.
    pub fn i440fx() -> Self {
        Self::new(PCI_VENDOR_ID_INTEL, 0x1237)
    }
}

impl PciDevice for PciHostBridge {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
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
