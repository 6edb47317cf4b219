pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_REVISION_ID: u16 = 0x08;
pub const PCI_CLASS_PROG: u16 = 0x09;
pub const PCI_CLASS_DEVICE: u16 = 0x0a;
pub const PCI_CACHE_LINE_SIZE: u16 = 0x0c;
pub const PCI_LATENCY_TIMER: u16 = 0x0d;
pub const PCI_HEADER_TYPE: u16 = 0x0e;
pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x2c;
pub const PCI_SUBSYSTEM_ID: u16 = 0x2e;
pub const PCI_INTERRUPT_LINE: u16 = 0x3c;
pub const PCI_INTERRUPT_PIN: u16 = 0x3d;

/// Base class + subclass, as returned by a 16-bit read at [`PCI_CLASS_DEVICE`].
pub const PCI_CLASS_DISPLAY_VGA: u16 = 0x0300;
pub const PCI_CLASS_BRIDGE_HOST: u16 = 0x0600;
pub const PCI_CLASS_BRIDGE_ISA: u16 = 0x0601;

/// Command register bits a guest may toggle on a conventional device:
/// IO, MEM, bus master, parity, SERR and INTx disable.
const PCI_COMMAND_WMASK: u16 = 0x0547;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciSubsystemIds {
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
}

impl PciClassCode {
    /// Base class and subclass packed the way [`PCI_CLASS_DEVICE`] reads them.
    pub fn class_device(&self) -> u16 {
        (u16::from(self.class) << 8) | u16::from(self.subclass)
    }
}

/// One config-space register: its value together with the guest write mask and the set of bits
/// served from the emulated image.
///
/// Keeping the three images behind a single descriptor means a quirk cannot update a register's
/// value and forget its masks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciRegister {
    pub value: u64,
    /// Bits the guest may change through config writes.
    pub writable: u64,
    /// Bits served from the emulated image instead of the physical device.
    pub emulated: u64,
}

impl PciRegister {
    /// Fully emulated register the guest can read but not change.
    pub const fn read_only(value: u64) -> Self {
        Self {
            value,
            writable: 0,
            emulated: u64::MAX,
        }
    }

    /// Fully emulated register the guest can read and overwrite.
    pub const fn read_write(value: u64) -> Self {
        Self {
            value,
            writable: u64::MAX,
            emulated: u64::MAX,
        }
    }
}

/// PCI configuration space image for a conventional (256-byte) function.
///
/// Three parallel images are kept:
/// - `bytes`: the emulated register values,
/// - `wmask`: which bits a guest config write may change,
/// - `emulated`: which bits are owned by the emulated image. Plain virtual devices ignore this;
///   passthrough devices use it to decide whether a bit comes from the physical device.
#[derive(Clone)]
pub struct PciConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    wmask: [u8; PCI_CONFIG_SPACE_SIZE],
    emulated: [u8; PCI_CONFIG_SPACE_SIZE],
}

impl core::fmt::Debug for PciConfigSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PciConfigSpace")
            .field("id", &self.vendor_device_id())
            .field("class", &self.class_code())
            .finish_non_exhaustive()
    }
}

impl PciConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self {
            bytes: [0; PCI_CONFIG_SPACE_SIZE],
            wmask: [0; PCI_CONFIG_SPACE_SIZE],
            emulated: [0; PCI_CONFIG_SPACE_SIZE],
        };
        cfg.set(PCI_VENDOR_ID, 2, u64::from(vendor_id));
        cfg.set(PCI_DEVICE_ID, 2, u64::from(device_id));

        cfg.set_write_mask(PCI_COMMAND, 2, u64::from(PCI_COMMAND_WMASK));
        cfg.set_write_mask(PCI_CACHE_LINE_SIZE, 1, 0xff);
        cfg.set_write_mask(PCI_LATENCY_TIMER, 1, 0xff);
        cfg.set_write_mask(PCI_INTERRUPT_LINE, 1, 0xff);
        cfg
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: self.get(PCI_VENDOR_ID, 2) as u16,
            device_id: self.get(PCI_DEVICE_ID, 2) as u16,
        }
    }

    pub fn class_code(&self) -> PciClassCode {
        PciClassCode {
            revision_id: self.bytes[0x08],
            prog_if: self.bytes[0x09],
            subclass: self.bytes[0x0a],
            class: self.bytes[0x0b],
        }
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08] = revision_id;
        self.bytes[0x09] = prog_if;
        self.bytes[0x0a] = subclass;
        self.bytes[0x0b] = class;
    }

    pub fn subsystem_ids(&self) -> PciSubsystemIds {
        PciSubsystemIds {
            subsystem_vendor_id: self.get(PCI_SUBSYSTEM_VENDOR_ID, 2) as u16,
            subsystem_id: self.get(PCI_SUBSYSTEM_ID, 2) as u16,
        }
    }

    pub fn set_subsystem_ids(&mut self, ids: PciSubsystemIds) {
        self.set(PCI_SUBSYSTEM_VENDOR_ID, 2, u64::from(ids.subsystem_vendor_id));
        self.set(PCI_SUBSYSTEM_ID, 2, u64::from(ids.subsystem_id));
    }

    pub fn header_type(&self) -> u8 {
        self.bytes[usize::from(PCI_HEADER_TYPE)]
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        self.bytes[usize::from(PCI_HEADER_TYPE)] = header_type;
    }

    pub fn command(&self) -> u16 {
        self.get(PCI_COMMAND, 2) as u16
    }

    pub fn set_command(&mut self, command: u16) {
        self.set(PCI_COMMAND, 2, u64::from(command));
    }

    /// Raw view of the emulated register values.
    pub fn bytes(&self) -> &[u8; PCI_CONFIG_SPACE_SIZE] {
        &self.bytes
    }

    /// Reads `len` bytes of the emulated image as a little-endian value.
    ///
    /// # Panics
    ///
    /// Panics if `len` is not 1, 2, 4 or 8, or if the access runs past the end of config space.
    pub fn get(&self, offset: u16, len: usize) -> u64 {
        let range = Self::range(offset, len);
        load_le(&self.bytes[range])
    }

    /// Stores `value` into the emulated image, bypassing the guest write mask.
    pub fn set(&mut self, offset: u16, len: usize, value: u64) {
        let range = Self::range(offset, len);
        store_le(&mut self.bytes[range], value);
    }

    /// Copies raw bytes into the emulated image, bypassing the guest write mask.
    pub fn set_bytes(&mut self, offset: u16, data: &[u8]) {
        let start = usize::from(offset);
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= PCI_CONFIG_SPACE_SIZE)
            .unwrap_or_else(|| panic!("config write {offset:#x}+{} out of range", data.len()));
        self.bytes[start..end].copy_from_slice(data);
    }

    pub fn write_mask(&self, offset: u16, len: usize) -> u64 {
        let range = Self::range(offset, len);
        load_le(&self.wmask[range])
    }

    pub fn set_write_mask(&mut self, offset: u16, len: usize, mask: u64) {
        let range = Self::range(offset, len);
        store_le(&mut self.wmask[range], mask);
    }

    pub fn emulated_mask(&self, offset: u16, len: usize) -> u64 {
        let range = Self::range(offset, len);
        load_le(&self.emulated[range])
    }

    pub fn set_emulated_mask(&mut self, offset: u16, len: usize, mask: u64) {
        let range = Self::range(offset, len);
        store_le(&mut self.emulated[range], mask);
    }

    pub fn register(&self, offset: u16, len: usize) -> PciRegister {
        PciRegister {
            value: self.get(offset, len),
            writable: self.write_mask(offset, len),
            emulated: self.emulated_mask(offset, len),
        }
    }

    /// Replaces value, write mask and emulated mask of a `len`-byte register in one step.
    pub fn set_register(&mut self, offset: u16, len: usize, reg: PciRegister) {
        self.set(offset, len, reg.value);
        self.set_write_mask(offset, len, reg.writable);
        self.set_emulated_mask(offset, len, reg.emulated);
    }

    /// Guest config read of the emulated image.
    ///
    /// Out-of-range or oddly sized accesses read as zero instead of panicking, since the offset
    /// and size come straight from the guest.
    pub fn read(&self, offset: u16, size: usize) -> u32 {
        if !Self::guest_access_ok(offset, size) {
            return 0;
        }
        self.get(offset, size) as u32
    }

    /// Guest config write, filtered through the write mask.
    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        if !Self::guest_access_ok(offset, size) {
            return;
        }
        let offset = usize::from(offset);
        for i in 0..size {
            let addr = offset + i;
            let mask = self.wmask[addr];
            let byte = (value >> (8 * i)) as u8;
            self.bytes[addr] = (self.bytes[addr] & !mask) | (byte & mask);
        }
    }

    fn guest_access_ok(offset: u16, size: usize) -> bool {
        matches!(size, 1 | 2 | 4)
            && usize::from(offset)
                .checked_add(size)
                .is_some_and(|end| end <= PCI_CONFIG_SPACE_SIZE)
    }

    fn range(offset: u16, len: usize) -> core::ops::Range<usize> {
        assert!(matches!(len, 1 | 2 | 4 | 8), "invalid register width {len}");
        let start = usize::from(offset);
        assert!(
            start + len <= PCI_CONFIG_SPACE_SIZE,
            "register {offset:#x}+{len} out of config space"
        );
        start..start + len
    }
}

fn load_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn store_le(bytes: &mut [u8], value: u64) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> (8 * i)) as u8;
    }
}
