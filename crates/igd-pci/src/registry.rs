use std::collections::BTreeMap;

use crate::{PciBdf, PciDevice, PciError};

/// Constructor for a registered device type. Receives the address the device is being placed at
/// and may refuse it.
pub type PciDeviceFactory = fn(PciBdf) -> Result<Box<dyn PciDevice>, PciError>;

#[derive(Debug, Clone, Copy)]
pub struct PciDeviceType {
    pub name: &'static str,
    pub description: &'static str,
    pub hotpluggable: bool,
    pub factory: PciDeviceFactory,
}

/// Table of device models that can be created by name.
///
/// A registry is populated once while the machine is being assembled and then handed to the
/// [`crate::PciBus`] that owns it, so lookups never go through process-wide state.
#[derive(Debug, Default, Clone)]
pub struct PciDeviceRegistry {
    types: BTreeMap<&'static str, PciDeviceType>,
}

impl PciDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ty: PciDeviceType) -> Result<(), PciError> {
        if self.types.contains_key(ty.name) {
            return Err(PciError::DuplicateDeviceType(ty.name));
        }
        self.types.insert(ty.name, ty);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&PciDeviceType> {
        self.types.get(name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }

    /// Instantiates `name` for placement at `bdf`.
    pub fn create(&self, name: &str, bdf: PciBdf) -> Result<Box<dyn PciDevice>, PciError> {
        let ty = self
            .lookup(name)
            .ok_or_else(|| PciError::UnknownDeviceType(name.to_string()))?;
        (ty.factory)(bdf)
    }
}
