use igd_pci::PciBdf;
use proptest::prelude::*;

#[test]
fn cf8_address_bits_8_to_23_decode_to_the_bdf() {
    // Mechanism #1: enable bit 31, bus 23:16, device 15:11, function 10:8, register 7:2.
    let cases = [
        (0x8000_0050u32, PciBdf::new(0, 0, 0)),
        (0x8000_1050, PciBdf::new(0, 2, 0)),
        (0x8000_f808, PciBdf::new(0, 0x1f, 0)),
        (0x80ff_fffc, PciBdf::new(255, 31, 7)),
    ];

    for (cf8, bdf) in cases {
        let key = (cf8 >> 8) as u16;
        assert_eq!(PciBdf::unpack_u16(key), bdf, "cf8={cf8:#010x}");
        assert_eq!(bdf.pack_u16(), key, "{bdf}");
    }
}

#[test]
fn legacy_igd_and_lpc_addresses_pack_to_well_known_values() {
    assert_eq!(PciBdf::new(0, 2, 0).pack_u16(), 0x0010);
    assert_eq!(PciBdf::new(0, 0x1f, 0).pack_u16(), 0x00f8);
    assert_eq!(u16::from(PciBdf::new(0, 0, 0)), 0);
}

proptest! {
    #[test]
    fn unpack_inverts_pack(bus in any::<u8>(), device in 0u8..32, function in 0u8..8) {
        let bdf = PciBdf::new(bus, device, function);
        prop_assert_eq!(PciBdf::from(bdf.pack_u16()), bdf);
    }
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn pci_bdf_pack_u16_rejects_invalid_device_in_debug() {
    // Valid PCI device numbers are 0-31.
    let _ = PciBdf::new(0, 32, 0).pack_u16();
}
