use std::io::{Read, Seek, SeekFrom, Write};

use vhdx_body::vhdx::FileAccess;
use vhdx_body::{DiskError, VirtualDisk, VirtualDiskParameters};

const MIB: u64 = 1024 * 1024;

#[test]
fn extended_parameters_round_trip_through_the_facade() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vhdx");
    let requested = VirtualDiskParameters::new(64 * MIB)
        .with("VHDX.BlockSize", "33554432")
        .with("VHDX.PhysicalSectorSize", "4096")
        .with("VHDX.LogicalSectorSize", "4096");

    let disk = VirtualDisk::create_disk("VHDX", "dynamic", &path, &requested).unwrap();
    assert_eq!(disk.parameters(), requested);
    disk.close().unwrap();

    let disk = VirtualDisk::open(&path, "auto", FileAccess::Read).unwrap();
    assert_eq!(disk.format_tag(), "VHDX");
    assert_eq!(disk.get_sector_size(), 4096);
    assert_eq!(disk.parameters(), requested);
}

#[test]
fn defaults_are_reported_in_the_bag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vhdx");
    let disk =
        VirtualDisk::create_disk("vhdx", "dynamic", &path, &VirtualDiskParameters::new(8 * MIB))
            .unwrap();
    let params = disk.parameters();
    assert_eq!(params.extended_parameters["VHDX.BlockSize"], "33554432");
    assert_eq!(params.extended_parameters["VHDX.PhysicalSectorSize"], "4096");
    assert_eq!(params.extended_parameters["VHDX.LogicalSectorSize"], "512");
}

#[test]
fn unparseable_value_names_its_key() {
    let dir = tempfile::tempdir().unwrap();
    let params = VirtualDiskParameters::new(8 * MIB).with("VHDX.BlockSize", "32M");
    let result = VirtualDisk::create_disk("VHDX", "fixed", dir.path().join("d.vhdx"), &params);
    assert_eq!(
        result.err().and_then(|e| e.param_name()),
        Some("VHDX.BlockSize")
    );
}

#[test]
fn raw_disks_are_fixed_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.raw");
    let result = VirtualDisk::create_disk("RAW", "dynamic", &path, &VirtualDiskParameters::new(MIB));
    assert!(matches!(result, Err(DiskError::InvalidArgument("variant"))));

    let mut disk =
        VirtualDisk::create_disk("RAW", "fixed", &path, &VirtualDiskParameters::new(MIB)).unwrap();
    assert_eq!(disk.capacity(), MIB);
    disk.seek(SeekFrom::Start(512)).unwrap();
    disk.write_all(b"raw bytes").unwrap();
    disk.close().unwrap();

    let mut disk = VirtualDisk::open(&path, "auto", FileAccess::Read).unwrap();
    assert_eq!(disk.format_tag(), "RAW");
    disk.seek(SeekFrom::Start(512)).unwrap();
    let mut back = [0u8; 9];
    disk.read_exact(&mut back).unwrap();
    assert_eq!(&back, b"raw bytes");
}

#[test]
fn unknown_open_format_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.raw");
    std::fs::write(&path, [0u8; 512]).unwrap();
    let result = VirtualDisk::open(&path, "qcow2", FileAccess::Read);
    assert!(matches!(result, Err(DiskError::UnsupportedFormat(_))));
}

#[test]
fn invalid_arguments_leave_an_existing_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("precious.vhdx");
    std::fs::write(&path, b"user data that must survive").unwrap();

    let bad_sector = VirtualDiskParameters::new(8 * MIB).with("VHDX.LogicalSectorSize", "1024");
    let result = VirtualDisk::create_disk("VHDX", "dynamic", &path, &bad_sector);
    assert_eq!(result.err().and_then(|e| e.param_name()), Some("logicalSectorSize"));

    let too_big = VirtualDiskParameters::new(1u64 << 50);
    let result = VirtualDisk::create_disk("VHDX", "dynamic", &path, &too_big);
    assert_eq!(result.err().and_then(|e| e.param_name()), Some("capacity"));

    assert_eq!(std::fs::read(&path).unwrap(), b"user data that must survive");
}

#[test]
fn rejected_parameters_do_not_create_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.vhdx");
    let params = VirtualDiskParameters::new(8 * MIB).with("VHDX.PhysicalSectorSize", "2048");
    assert!(VirtualDisk::create_disk("VHDX", "fixed", &path, &params).is_err());
    assert!(!path.exists());
}
