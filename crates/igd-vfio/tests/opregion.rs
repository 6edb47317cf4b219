mod common;

use std::sync::Arc;

use common::{machine, FakeIgd, IGD_BDF, OPREGION_SIZE, PHYS_ASLS};
use igd_fw_cfg::FwCfg;
use igd_pci::PciRegister;
use igd_vfio::device::VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION;
use igd_vfio::quirks::igd::{setup_opregion, FW_CFG_IGD_OPREGION, IGD_ASLS};
use igd_vfio::{IgdError, QuirkContext, VfioError, VfioPciDevice, VfioPciOptions};

fn device(fake: FakeIgd) -> (Arc<FakeIgd>, VfioPciDevice) {
    let fake = Arc::new(fake);
    let vdev = VfioPciDevice::new(fake.clone(), IGD_BDF, VfioPciOptions::default()).unwrap();
    (fake, vdev)
}

#[test]
fn opregion_is_published_and_asls_armed() {
    let (fake, mut vdev) = device(FakeIgd::new(0x1912, 0));
    let mut fw_cfg = FwCfg::new();

    assert_eq!(vdev.read_config(IGD_ASLS, 4), u64::from(PHYS_ASLS));
    setup_opregion(&mut vdev, &mut fw_cfg).unwrap();

    let published = fw_cfg.file(FW_CFG_IGD_OPREGION).unwrap();
    assert_eq!(published.len(), OPREGION_SIZE as usize);
    assert_eq!(&published[..16], b"IntelGraphicsMem");
    assert_eq!(&published[..], &fake.opregion_bytes()[..]);
    assert!(Arc::ptr_eq(&published, vdev.igd_opregion().unwrap()));

    assert_eq!(
        vdev.config().space().register(IGD_ASLS, 4),
        PciRegister {
            value: 0,
            writable: 0xffff_ffff,
            emulated: 0xffff_ffff,
        }
    );
    assert_eq!(vdev.read_config(IGD_ASLS, 4), 0);

    // Firmware programs ASLS with the address of its copy; the host register is never touched.
    vdev.write_config(IGD_ASLS, 4, 0x7f00_0000);
    assert_eq!(vdev.read_config(IGD_ASLS, 4), 0x7f00_0000);
    assert_eq!(fake.config_dword(0xfc), PHYS_ASLS);
}

#[test]
fn hotplugged_device_is_rejected_before_touching_vfio() {
    let (fake, vdev) = device(FakeIgd::new(0x1912, 0));
    let mut vdev = vdev.with_hotplugged(true);
    let mut fw_cfg = FwCfg::new();
    let reads_before = fake.reads();

    let err = setup_opregion(&mut vdev, &mut fw_cfg).unwrap_err();
    assert!(matches!(err, IgdError::UnsupportedHotplug(_)));
    assert_eq!(
        err.to_string(),
        "IGD OpRegion is not supported on hotplugged device"
    );
    assert_eq!(fake.reads(), reads_before);
    assert!(fw_cfg.is_empty());
    assert!(vdev.igd_opregion().is_none());
}

#[test]
fn missing_opregion_region_is_reported() {
    let (_fake, mut vdev) = device(
        FakeIgd::new(0x1912, 0).without_dev_region(VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION),
    );
    let mut fw_cfg = FwCfg::new();

    let err = setup_opregion(&mut vdev, &mut fw_cfg).unwrap_err();
    assert!(matches!(
        err,
        IgdError::RegionUnavailable(VfioError::DeviceRegionNotFound { subtype: 1, .. })
    ));
    assert!(fw_cfg.is_empty());
    assert_eq!(vdev.read_config(IGD_ASLS, 4), u64::from(PHYS_ASLS));
}

#[test]
fn short_read_discards_the_buffer() {
    let (_fake, mut vdev) = device(FakeIgd::new(0x1912, 0).with_truncated_opregion());
    let mut fw_cfg = FwCfg::new();

    let err = setup_opregion(&mut vdev, &mut fw_cfg).unwrap_err();
    assert!(matches!(err, IgdError::ReadFailed));
    assert!(vdev.igd_opregion().is_none());
    assert!(!fw_cfg.contains(FW_CFG_IGD_OPREGION));
    assert_eq!(vdev.config().space().emulated_mask(IGD_ASLS, 4), 0);
}

#[test]
fn second_opregion_is_a_firmware_config_error() {
    let (_fake, mut vdev) = device(FakeIgd::new(0x1912, 0));
    let mut fw_cfg = FwCfg::new();
    fw_cfg.add_file(FW_CFG_IGD_OPREGION, vec![0u8; 4]).unwrap();

    let err = setup_opregion(&mut vdev, &mut fw_cfg).unwrap_err();
    assert!(matches!(err, IgdError::FirmwareConfig(_)));
    assert!(vdev.igd_opregion().is_none());
    assert_eq!(fw_cfg.file(FW_CFG_IGD_OPREGION).unwrap().len(), 4);
}

#[test]
fn upt_mode_opregion_is_set_up_by_realize() {
    common::init_tracing();

    // Not at 00:02.0, so legacy mode is never attempted.
    let fake = Arc::new(FakeIgd::new(0x9a49, 0));
    let options = VfioPciOptions {
        igd_opregion: true,
        ..VfioPciOptions::default()
    };
    let mut vdev =
        VfioPciDevice::new(fake, igd_pci::PciBdf::new(0, 5, 0), options).unwrap();
    let (mut bus, mut fw_cfg) = machine();

    vdev.realize(&mut QuirkContext {
        bus: &mut bus,
        fw_cfg: &mut fw_cfg,
    })
    .unwrap();

    assert!(vdev.igd_opregion().is_some());
    assert!(fw_cfg.contains(FW_CFG_IGD_OPREGION));
    assert!(!fw_cfg.contains("etc/igd-bdsm-size"));
}

#[test]
fn upt_mode_opregion_failure_fails_realize() {
    let fake = Arc::new(
        FakeIgd::new(0x9a49, 0).without_dev_region(VFIO_REGION_SUBTYPE_INTEL_IGD_OPREGION),
    );
    let options = VfioPciOptions {
        igd_opregion: true,
        ..VfioPciOptions::default()
    };
    let mut vdev =
        VfioPciDevice::new(fake, igd_pci::PciBdf::new(0, 5, 0), options).unwrap();
    let (mut bus, mut fw_cfg) = machine();

    let err = vdev
        .realize(&mut QuirkContext {
            bus: &mut bus,
            fw_cfg: &mut fw_cfg,
        })
        .unwrap_err();
    assert!(matches!(err, IgdError::RegionUnavailable(_)));
}
