use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::{PciBdf, PciConfigSpace, PciDevice, PciDeviceRegistry, PciError};

/// Root PCI bus.
///
/// Owns the attached devices and the registry used to create new ones by type name.
#[derive(Default)]
pub struct PciBus {
    devices: BTreeMap<PciBdf, Box<dyn PciDevice>>,
    registry: PciDeviceRegistry,
}

impl PciBus {
    pub fn new(registry: PciDeviceRegistry) -> Self {
        Self {
            devices: BTreeMap::new(),
            registry,
        }
    }

    pub fn registry(&self) -> &PciDeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PciDeviceRegistry {
        &mut self.registry
    }

    pub fn add_device(&mut self, bdf: PciBdf, device: Box<dyn PciDevice>) -> Result<(), PciError> {
        if self.devices.contains_key(&bdf) {
            return Err(PciError::AddressInUse(bdf));
        }
        self.devices.insert(bdf, device);
        Ok(())
    }

    /// Creates a registered device type at `bdf` and attaches it.
    pub fn create_device(
        &mut self,
        bdf: PciBdf,
        type_name: &str,
    ) -> Result<&mut dyn PciDevice, PciError> {
        if self.devices.contains_key(&bdf) {
            return Err(PciError::AddressInUse(bdf));
        }
        let device = self.registry.create(type_name, bdf)?;
        Ok(self.devices.entry(bdf).or_insert(device).as_mut())
    }

    /// Returns the device at `bdf`, creating it from the registry if the address is free.
    ///
    /// An existing device is returned whatever its type; callers that care check it first.
    pub fn find_or_create_device(
        &mut self,
        bdf: PciBdf,
        type_name: &str,
    ) -> Result<&mut dyn PciDevice, PciError> {
        match self.devices.entry(bdf) {
            Entry::Occupied(entry) => Ok(entry.into_mut().as_mut()),
            Entry::Vacant(entry) => {
                let device = self.registry.create(type_name, bdf)?;
                Ok(entry.insert(device).as_mut())
            }
        }
    }

    pub fn remove_device(&mut self, bdf: PciBdf) -> Option<Box<dyn PciDevice>> {
        self.devices.remove(&bdf)
    }

    pub fn device(&self, bdf: PciBdf) -> Option<&dyn PciDevice> {
        let dev = self.devices.get(&bdf)?;
        Some(dev.as_ref())
    }

    pub fn device_mut(&mut self, bdf: PciBdf) -> Option<&mut dyn PciDevice> {
        let dev = self.devices.get_mut(&bdf)?;
        Some(dev.as_mut())
    }

    /// Returns the device at `bdf` if it is an instance of `T`.
    pub fn device_as<T: PciDevice>(&self, bdf: PciBdf) -> Option<&T> {
        self.device(bdf)?.as_any().downcast_ref::<T>()
    }

    pub fn device_config(&self, bdf: PciBdf) -> Option<&PciConfigSpace> {
        self.devices.get(&bdf).map(|dev| dev.config())
    }

    pub fn device_config_mut(&mut self, bdf: PciBdf) -> Option<&mut PciConfigSpace> {
        self.devices.get_mut(&bdf).map(|dev| dev.config_mut())
    }

    pub fn iter_device_addrs(&self) -> impl Iterator<Item = PciBdf> + '_ {
        self.devices.keys().copied()
    }

    pub fn read_config(&self, bdf: PciBdf, offset: u16, size: u8) -> u32 {
        let Some(dev) = self.devices.get(&bdf) else {
            // 0xFFFF_FFFF for non-existent device (common convention).
            return 0xFFFF_FFFF;
        };
        dev.config().read(offset, usize::from(size))
    }

    pub fn write_config(&mut self, bdf: PciBdf, offset: u16, size: u8, value: u32) {
        let Some(dev) = self.devices.get_mut(&bdf) else {
            return;
        };
        dev.config_mut().write(offset, usize::from(size), value);
    }
}
