use std::io::Cursor;

use vhdx_body::vhdx::{DiskImageFile, FileAccess, Ownership};
use vhdx_body::DiskError;

const MIB: u64 = 1024 * 1024;

fn dynamic(storage: &mut Cursor<Vec<u8>>) -> DiskImageFile<&mut Cursor<Vec<u8>>> {
    DiskImageFile::initialize_dynamic(
        storage,
        Ownership::None,
        16 * MIB,
        Some(MIB as u32),
        None,
        None,
        None,
    )
    .unwrap()
}

#[test]
fn clean_close_persists_data_and_clears_log_guid() {
    let mut storage = Cursor::new(Vec::new());
    let mut disk = dynamic(&mut storage);
    let before = disk.header().data_write_guid;
    disk.content().write_at(5 * MIB + 17, b"persisted").unwrap();
    assert!(!disk.header().log_guid.is_nil());
    disk.close().unwrap();

    let mut disk = DiskImageFile::open(&mut storage, FileAccess::Read).unwrap();
    assert!(disk.header().log_guid.is_nil());
    assert_ne!(disk.header().data_write_guid, before);
    assert_eq!(disk.info().replayed_log_entries, 0);
    let mut back = [0u8; 9];
    disk.content().read_at(5 * MIB + 17, &mut back).unwrap();
    assert_eq!(&back, b"persisted");
}

#[test]
fn unclosed_session_is_replayed_on_writable_open() {
    let mut storage = Cursor::new(Vec::new());
    let mut disk = dynamic(&mut storage);
    disk.content().write_at(0, b"first").unwrap();
    disk.content().write_at(9 * MIB, b"second").unwrap();
    // Simulate a crash: the session is never closed.
    std::mem::forget(disk);

    assert!(matches!(
        DiskImageFile::open(&mut storage, FileAccess::Read),
        Err(DiskError::ReadOnly(_))
    ));

    let mut disk = DiskImageFile::open(&mut storage, FileAccess::ReadWrite).unwrap();
    assert!(disk.info().replayed_log_entries >= 1);
    assert!(disk.header().log_guid.is_nil());
    assert_eq!(disk.info().allocated_blocks, 2);
    let mut back = [0u8; 6];
    disk.content().read_at(9 * MIB, &mut back).unwrap();
    assert_eq!(&back, b"second");
    disk.close().unwrap();

    let disk = DiskImageFile::open(&mut storage, FileAccess::Read).unwrap();
    assert_eq!(disk.info().replayed_log_entries, 0);
}

#[test]
fn read_only_open_does_not_touch_the_file() {
    let mut storage = Cursor::new(Vec::new());
    let mut disk = dynamic(&mut storage);
    disk.content().write_at(MIB, &[7u8; 512]).unwrap();
    disk.close().unwrap();
    let snapshot = storage.get_ref().clone();

    let mut disk = DiskImageFile::open(&mut storage, FileAccess::Read).unwrap();
    let mut back = [0u8; 512];
    disk.content().read_at(MIB, &mut back).unwrap();
    assert!(matches!(
        disk.content().write_at(0, b"x"),
        Err(DiskError::ReadOnly(_))
    ));
    disk.close().unwrap();
    assert!(storage.get_ref() == &snapshot);
}
