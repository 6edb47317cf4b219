//! Interface to the kernel VFIO device.
//!
//! Only the calls the passthrough quirks rely on are modelled: region lookups by index or by
//! device-specific type/subtype, and positional reads/writes on the device file.

#[cfg(unix)]
use std::collections::BTreeMap;
use std::io;

use crate::error::VfioError;

pub const VFIO_PCI_BAR0_REGION_INDEX: u32 = 0;
pub const VFIO_PCI_BAR5_REGION_INDEX: u32 = 5;
pub const VFIO_PCI_ROM_REGION_INDEX: u32 = 6;
pub const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
pub const VFIO_PCI_VGA_REGION_INDEX: u32 = 8;

/// Device specific region types are `VFIO_REGION_TYPE_PCI_VENDOR_TYPE | vendor_id`.
pub const VFIO_REGION_TYPE_PCI_VENDOR_TYPE: u32 = 1 << 31;

pub const VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION: u32 = 1;
pub const VFIO_REGION_SUBTYPE_INTEL_IGD_HOST_CFG: u32 = 2;
pub const VFIO_REGION_SUBTYPE_INTEL_IGD_LPC_CFG: u32 = 3;

pub const VFIO_REGION_INFO_FLAG_READ: u32 = 1 << 0;
pub const VFIO_REGION_INFO_FLAG_WRITE: u32 = 1 << 1;
pub const VFIO_REGION_INFO_FLAG_MMAP: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfioRegionInfo {
    pub index: u32,
    pub flags: u32,
    /// Size of the region in bytes.
    pub size: u64,
    /// Offset of the region within the device file.
    pub offset: u64,
}

impl VfioRegionInfo {
    pub const fn new(index: u32, size: u64, offset: u64) -> Self {
        Self {
            index,
            flags: VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
            size,
            offset,
        }
    }

    pub fn readable(&self) -> bool {
        self.flags & VFIO_REGION_INFO_FLAG_READ != 0
    }

    pub fn writable(&self) -> bool {
        self.flags & VFIO_REGION_INFO_FLAG_WRITE != 0
    }
}

/// An opened VFIO device.
///
/// Reads and writes are synchronous and positional; no timeout is applied here, callers get
/// whatever the kernel interface does.
pub trait VfioDevice: Send + Sync {
    /// Name used in diagnostics (usually the host address, e.g. `0000:00:02.0`).
    fn name(&self) -> &str;

    fn region_info(&self, index: u32) -> Result<VfioRegionInfo, VfioError>;

    /// Looks up a device specific region by capability type and subtype.
    fn dev_region_info(&self, ty: u32, subtype: u32) -> Result<VfioRegionInfo, VfioError>;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// [`VfioDevice`] backed by a regular file and a caller supplied region table.
///
/// Useful for replaying region dumps taken from a host (config space, OpRegion, bridge config)
/// without a live VFIO group.
#[cfg(unix)]
pub struct FileVfioDevice {
    name: String,
    file: std::fs::File,
    regions: BTreeMap<u32, VfioRegionInfo>,
    dev_regions: BTreeMap<(u32, u32), VfioRegionInfo>,
}

#[cfg(unix)]
impl FileVfioDevice {
    pub fn new(name: impl Into<String>, file: std::fs::File) -> Self {
        Self {
            name: name.into(),
            file,
            regions: BTreeMap::new(),
            dev_regions: BTreeMap::new(),
        }
    }

    pub fn with_region(mut self, info: VfioRegionInfo) -> Self {
        self.regions.insert(info.index, info);
        self
    }

    pub fn with_dev_region(mut self, ty: u32, subtype: u32, info: VfioRegionInfo) -> Self {
        self.dev_regions.insert((ty, subtype), info);
        self
    }
}

#[cfg(unix)]
impl VfioDevice for FileVfioDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn region_info(&self, index: u32) -> Result<VfioRegionInfo, VfioError> {
        self.regions
            .get(&index)
            .copied()
            .ok_or(VfioError::RegionNotFound { index })
    }

    fn dev_region_info(&self, ty: u32, subtype: u32) -> Result<VfioRegionInfo, VfioError> {
        self.dev_regions
            .get(&(ty, subtype))
            .copied()
            .ok_or(VfioError::DeviceRegionNotFound { ty, subtype })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(&self.file, buf, offset)
    }
}

/// Reads exactly `buf.len()` bytes with a single positional read.
///
/// Region reads are not retried: a short read from a VFIO region means the region is smaller
/// than advertised.
pub fn read_region_exact(
    device: &dyn VfioDevice,
    buf: &mut [u8],
    offset: u64,
) -> Result<(), VfioError> {
    let actual = device.read_at(buf, offset)?;
    if actual != buf.len() {
        return Err(VfioError::ShortRead {
            offset,
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}
