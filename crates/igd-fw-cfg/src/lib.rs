#![forbid(unsafe_code)]

//! Firmware configuration ("fw_cfg") file table.
//!
//! Device models publish named blobs here while the machine is being built; guest firmware later
//! walks the file directory and pulls the blobs it understands (e.g. the IGD OpRegion copy and
//! the requested stolen-memory size).

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

/// Maximum file name length including the terminating NUL, as laid out in the directory entry.
pub const FW_CFG_MAX_FILE_PATH: usize = 56;

/// Selector of the first file entry. Selectors below this are fixed legacy items.
pub const FW_CFG_FILE_FIRST: u16 = 0x20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FwCfgError {
    #[error("fw_cfg file `{0}` already exists")]
    DuplicateFile(String),

    #[error("fw_cfg file name `{name}` is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },
}

/// Entry of the guest-visible file directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwCfgFile {
    pub name: String,
    pub size: u32,
    pub select: u16,
}

/// Named blobs exposed to guest firmware.
///
/// Blobs are shared, not copied: the publisher may keep its own handle to the same buffer for as
/// long as it needs it.
#[derive(Debug, Default)]
pub struct FwCfg {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl FwCfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: &str, data: impl Into<Arc<[u8]>>) -> Result<(), FwCfgError> {
        if name.len() >= FW_CFG_MAX_FILE_PATH {
            return Err(FwCfgError::NameTooLong {
                name: name.to_string(),
                max: FW_CFG_MAX_FILE_PATH - 1,
            });
        }
        if self.files.contains_key(name) {
            return Err(FwCfgError::DuplicateFile(name.to_string()));
        }

        let data = data.into();
        tracing::debug!(name, len = data.len(), "fw_cfg file added");
        self.files.insert(name.to_string(), data);
        Ok(())
    }

    pub fn file(&self, name: &str) -> Option<Arc<[u8]>> {
        self.files.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// File directory in selector order. Files are sorted by name, matching what firmware expects
    /// when it binary-searches the directory.
    pub fn directory(&self) -> Vec<FwCfgFile> {
        self.files
            .iter()
            .zip(FW_CFG_FILE_FIRST..)
            .map(|((name, data), select)| FwCfgFile {
                name: name.clone(),
                size: u32::try_from(data.len()).unwrap_or(u32::MAX),
                select,
            })
            .collect()
    }
}
