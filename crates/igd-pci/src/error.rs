use thiserror::Error;

use crate::PciBdf;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PciError {
    #[error("unknown PCI device type `{0}`")]
    UnknownDeviceType(String),

    #[error("PCI device type `{0}` is already registered")]
    DuplicateDeviceType(&'static str),

    #[error("PCI address {0} is already in use")]
    AddressInUse(PciBdf),

    #[error("{type_name} must have address {expected}, not {actual}")]
    InvalidAddress {
        type_name: &'static str,
        expected: PciBdf,
        actual: PciBdf,
    },
}
