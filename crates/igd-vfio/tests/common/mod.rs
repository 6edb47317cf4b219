#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use igd_fw_cfg::FwCfg;
use igd_pci::{PciBdf, PciBus, PciDeviceRegistry, PciHostBridge};
use igd_vfio::device::{
    VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_ROM_REGION_INDEX, VFIO_PCI_VGA_REGION_INDEX,
    VFIO_REGION_SUBTYPE_INTEL_IGD_HOST_CFG, VFIO_REGION_SUBTYPE_INTEL_IGD_LPC_CFG,
    VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION, VFIO_REGION_TYPE_PCI_VENDOR_TYPE,
};
use igd_vfio::{register_igd_types, VfioDevice, VfioError, VfioRegionInfo};

pub const INTEL_REGION_TYPE: u32 = VFIO_REGION_TYPE_PCI_VENDOR_TYPE | 0x8086;

pub const CONFIG_OFFSET: u64 = 0x0;
pub const LPC_CFG_OFFSET: u64 = 0x1000;
pub const HOST_CFG_OFFSET: u64 = 0x2000;
pub const OPREGION_OFFSET: u64 = 0x3000;
pub const OPREGION_SIZE: u64 = 0x2000;
pub const ROM_OFFSET: u64 = 0x8000;
pub const BACKING_SIZE: usize = 0x1_0000;
pub const BAR0_OFFSET: u64 = 0x100_0000;
pub const BAR0_SIZE: u64 = 16 << 20;
pub const VGA_OFFSET: u64 = 0x1000_0000;

pub const PHYS_BDSM: u32 = 0xdf00_0001;
pub const PHYS_ASLS: u32 = 0xdeea_0000;

pub const LPC_IDS: [(u16, u16); 5] = [
    (0x00, 0x8086),
    (0x02, 0xa305),
    (0x08, 0x0010),
    (0x2c, 0x1028),
    (0x2e, 0x0869),
];
pub const HOST_IDS: [(u16, u16); 5] = [
    (0x00, 0x8086),
    (0x02, 0x3e30),
    (0x08, 0x000d),
    (0x2c, 0x1028),
    (0x2e, 0x0869),
];

/// Guest address legacy mode expects the IGD at.
pub const IGD_BDF: PciBdf = PciBdf::new(0, 2, 0);

/// In-memory IGD with the region layout of a kernel that supports the IGD device specific
/// regions. BAR0 is advertised but not backed, so reads from it come back short.
pub struct FakeIgd {
    name: String,
    regions: BTreeMap<u32, VfioRegionInfo>,
    dev_regions: BTreeMap<(u32, u32), VfioRegionInfo>,
    mem: Mutex<Vec<u8>>,
    reads: AtomicUsize,
}

impl FakeIgd {
    pub fn new(device_id: u16, gmch: u32) -> Self {
        let mut mem = vec![0u8; BACKING_SIZE];

        let cfg = CONFIG_OFFSET as usize;
        put(&mut mem, cfg, &0x8086u16.to_le_bytes());
        put(&mut mem, cfg + 0x02, &device_id.to_le_bytes());
        // Revision 0x02, VGA compatible display controller.
        put(&mut mem, cfg + 0x08, &[0x02, 0x00, 0x00, 0x03]);
        put(&mut mem, cfg + 0x50, &gmch.to_le_bytes());
        put(&mut mem, cfg + 0x5c, &PHYS_BDSM.to_le_bytes());
        put(&mut mem, cfg + 0xc0, &u64::from(PHYS_BDSM).to_le_bytes());
        put(&mut mem, cfg + 0xfc, &PHYS_ASLS.to_le_bytes());

        for (offset, value) in LPC_IDS {
            put(&mut mem, LPC_CFG_OFFSET as usize + usize::from(offset), &value.to_le_bytes());
        }
        for (offset, value) in HOST_IDS {
            put(&mut mem, HOST_CFG_OFFSET as usize + usize::from(offset), &value.to_le_bytes());
        }

        let opregion = OPREGION_OFFSET as usize;
        put(&mut mem, opregion, b"IntelGraphicsMem");
        for i in 16..OPREGION_SIZE as usize {
            mem[opregion + i] = i as u8;
        }

        let mut regions = BTreeMap::new();
        for info in [
            VfioRegionInfo::new(VFIO_PCI_CONFIG_REGION_INDEX, 0x100, CONFIG_OFFSET),
            VfioRegionInfo::new(0, BAR0_SIZE, BAR0_OFFSET),
            VfioRegionInfo::new(VFIO_PCI_ROM_REGION_INDEX, 0x1_0000, ROM_OFFSET),
            VfioRegionInfo::new(VFIO_PCI_VGA_REGION_INDEX, 0xc_0000, VGA_OFFSET),
        ] {
            regions.insert(info.index, info);
        }

        let mut dev_regions = BTreeMap::new();
        dev_regions.insert(
            (INTEL_REGION_TYPE, VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION),
            VfioRegionInfo::new(9, OPREGION_SIZE, OPREGION_OFFSET),
        );
        dev_regions.insert(
            (INTEL_REGION_TYPE, VFIO_REGION_SUBTYPE_INTEL_IGD_HOST_CFG),
            VfioRegionInfo::new(10, 0x100, HOST_CFG_OFFSET),
        );
        dev_regions.insert(
            (INTEL_REGION_TYPE, VFIO_REGION_SUBTYPE_INTEL_IGD_LPC_CFG),
            VfioRegionInfo::new(11, 0x100, LPC_CFG_OFFSET),
        );

        Self {
            name: "0000:00:02.0".to_string(),
            regions,
            dev_regions,
            mem: Mutex::new(mem),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn without_region(mut self, index: u32) -> Self {
        self.regions.remove(&index);
        self
    }

    pub fn without_dev_region(mut self, subtype: u32) -> Self {
        self.dev_regions.remove(&(INTEL_REGION_TYPE, subtype));
        self
    }

    /// Points an IGD device specific region somewhere else in the backing.
    pub fn with_dev_region(mut self, subtype: u32, info: VfioRegionInfo) -> Self {
        self.dev_regions.insert((INTEL_REGION_TYPE, subtype), info);
        self
    }

    /// Advertises a bigger OpRegion than the device can deliver.
    pub fn with_truncated_opregion(mut self) -> Self {
        let info = VfioRegionInfo::new(9, BACKING_SIZE as u64, OPREGION_OFFSET);
        self.dev_regions
            .insert((INTEL_REGION_TYPE, VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION), info);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn config_dword(&self, offset: usize) -> u32 {
        let mem = self.mem.lock().unwrap();
        let at = CONFIG_OFFSET as usize + offset;
        u32::from_le_bytes(mem[at..at + 4].try_into().unwrap())
    }

    pub fn opregion_bytes(&self) -> Vec<u8> {
        let mem = self.mem.lock().unwrap();
        let at = OPREGION_OFFSET as usize;
        mem[at..at + OPREGION_SIZE as usize].to_vec()
    }
}

fn put(mem: &mut [u8], at: usize, bytes: &[u8]) {
    mem[at..at + bytes.len()].copy_from_slice(bytes);
}

impl VfioDevice for FakeIgd {
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
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mem = self.mem.lock().unwrap();
        let start = (offset as usize).min(mem.len());
        let end = start.saturating_add(buf.len()).min(mem.len());
        buf[..end - start].copy_from_slice(&mem[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut mem = self.mem.lock().unwrap();
        let start = (offset as usize).min(mem.len());
        let end = start.saturating_add(buf.len()).min(mem.len());
        mem[start..end].copy_from_slice(&buf[..end - start]);
        Ok(end - start)
    }
}

/// A root bus with an i440FX host bridge at 00:00.0 and the IGD device types registered.
pub fn machine() -> (PciBus, FwCfg) {
    let mut registry = PciDeviceRegistry::new();
    register_igd_types(&mut registry).unwrap();
    let mut bus = PciBus::new(registry);
    bus.add_device(PciBdf::new(0, 0, 0), Box::new(PciHostBridge::i440fx()))
        .unwrap();
    (bus, FwCfg::new())
}

/// Installs a test subscriber so failures show the quirk logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}
