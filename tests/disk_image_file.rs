use std::fs::{File, OpenOptions};
use std::io::Cursor;

use vhdx_body::vhdx::{DiskImageFile, DiskType, FileAccess, Ownership};

const MIB: u64 = 1024 * 1024;

fn create_file(dir: &tempfile::TempDir, name: &str) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.path().join(name))
        .unwrap()
}

#[test]
fn fixed_disk_with_defaults_is_data_start_plus_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let file = create_file(&dir, "fixed.vhdx");
    let disk = DiskImageFile::initialize_fixed(
        file,
        Ownership::Dispose,
        128 * MIB,
        None,
        None,
        None,
        None,
    )
    .unwrap();
    assert_eq!(disk.block_size() as u64, 32 * MIB);
    assert_eq!(disk.logical_sector_size(), 512);
    assert_eq!(disk.physical_sector_size(), 4096);
    assert!(!disk.is_sparse());
    assert_eq!(disk.disk_type(), DiskType::Fixed);
    disk.close().unwrap();

    let len = std::fs::metadata(dir.path().join("fixed.vhdx")).unwrap().len();
    assert_eq!(len, 4 * MIB + 128 * MIB);
}

#[test]
fn dynamic_disk_ends_at_data_start() {
    let mut storage = Cursor::new(Vec::new());
    let disk = DiskImageFile::initialize_dynamic(
        &mut storage,
        Ownership::None,
        128 * MIB,
        None,
        None,
        None,
        None,
    )
    .unwrap();
    assert!(disk.is_sparse());
    assert_eq!(disk.disk_type(), DiskType::Dynamic);
    assert_eq!(disk.info().allocated_blocks, 0);
    assert_eq!(disk.info().total_blocks, 4);
    disk.close().unwrap();
    assert_eq!(storage.get_ref().len() as u64, 4 * MIB);
}

#[test]
fn accepted_block_sizes_are_kept() {
    for block_size in [MIB, 16 * MIB, 32 * MIB] {
        let mut storage = Cursor::new(Vec::new());
        let disk = DiskImageFile::initialize_dynamic(
            &mut storage,
            Ownership::None,
            64 * MIB,
            Some(block_size as u32),
            None,
            None,
            None,
        )
        .unwrap();
        disk.close().unwrap();

        let disk = DiskImageFile::open(&mut storage, FileAccess::Read).unwrap();
        assert_eq!(disk.block_size() as u64, block_size);
        assert_eq!(
            disk.parameters().block_size,
            Some(block_size as u32),
            "block size {block_size}"
        );
    }
}

#[test]
fn sector_size_pairs_survive_reopen() {
    for fixed in [true, false] {
        for (physical, logical) in [(512, 512), (4096, 512), (4096, 4096)] {
            let mut storage = Cursor::new(Vec::new());
            let params = (8 * MIB, Some(MIB as u32), Some(physical), Some(logical));
            let disk = if fixed {
                DiskImageFile::initialize_fixed(
                    &mut storage,
                    Ownership::None,
                    params.0,
                    params.1,
                    params.2,
                    params.3,
                    None,
                )
            } else {
                DiskImageFile::initialize_dynamic(
                    &mut storage,
                    Ownership::None,
                    params.0,
                    params.1,
                    params.2,
                    params.3,
                    None,
                )
            }
            .unwrap();
            disk.close().unwrap();

            let disk = DiskImageFile::open(&mut storage, FileAccess::Read).unwrap();
            assert_eq!(disk.physical_sector_size(), physical);
            assert_eq!(disk.logical_sector_size(), logical);
            assert_eq!(disk.is_sparse(), !fixed);
        }
    }
}

#[test]
fn invalid_sector_sizes_name_the_parameter() {
    for bad in [1024u32, 2048] {
        let err = DiskImageFile::initialize_dynamic(
            Cursor::new(Vec::new()),
            Ownership::Dispose,
            8 * MIB,
            None,
            None,
            Some(bad),
            None,
        )
        .unwrap_err();
        assert_eq!(err.param_name(), Some("logicalSectorSize"));

        let err = DiskImageFile::initialize_fixed(
            Cursor::new(Vec::new()),
            Ownership::Dispose,
            8 * MIB,
            None,
            Some(bad),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err.param_name(), Some("physicalSectorSize"));
    }
}

#[test]
fn fixed_progress_starts_at_zero_and_ends_at_capacity() {
    let mut values = Vec::new();
    let mut sink = |v: u64| values.push(v);
    let disk = DiskImageFile::initialize_fixed(
        Cursor::new(Vec::new()),
        Ownership::Dispose,
        6 * MIB,
        Some(2 * MIB as u32),
        None,
        None,
        Some(&mut sink),
    )
    .unwrap();
    disk.close().unwrap();
    assert_eq!(values.first(), Some(&0));
    assert_eq!(values.last(), Some(&(6 * MIB)));
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn fixed_disk_reads_zero_and_keeps_writes() {
    let mut storage = Cursor::new(Vec::new());
    {
        let mut disk = DiskImageFile::initialize_fixed(
            &mut storage,
            Ownership::None,
            4 * MIB,
            Some(MIB as u32),
            None,
            None,
            None,
        )
        .unwrap();
        let mut content = disk.content();
        let mut buf = vec![0xFFu8; 4096];
        content.read_at(2 * MIB, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        content.write_at(MIB - 3, b"across").unwrap();
        disk.close().unwrap();
    }
    let mut disk = DiskImageFile::open(&mut storage, FileAccess::Read).unwrap();
    let mut back = [0u8; 6];
    disk.content().read_at(MIB - 3, &mut back).unwrap();
    assert_eq!(&back, b"across");
    assert_eq!(disk.info().allocated_blocks, 4);
}

#[test]
fn fixed_disk_keeps_chosen_block_size() {
    for block_size in [MIB, 16 * MIB, 32 * MIB] {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskImageFile::initialize_fixed(
            create_file(&dir, "fixed.vhdx"),
            Ownership::Dispose,
            128 * MIB,
            Some(block_size as u32),
            None,
            None,
            None,
        )
        .unwrap();
        assert!(!disk.content().is_sparse());
        assert_eq!(disk.info().allocated_blocks, 128 * MIB / block_size);
        disk.close().unwrap();

        let path = dir.path().join("fixed.vhdx");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * MIB + 128 * MIB);
        let disk = DiskImageFile::open_path(&path, FileAccess::Read).unwrap();
        assert_eq!(disk.block_size() as u64, block_size, "block size {block_size}");
        assert!(!disk.is_sparse());
    }
}

#[test]
fn capacity_above_64_tib_is_rejected_before_writing() {
    let max = 64 * 1024 * 1024 * MIB;
    for capacity in [max + 512, 1u64 << 50] {
        let mut storage = Cursor::new(Vec::new());
        let err = DiskImageFile::initialize_dynamic(
            &mut storage,
            Ownership::None,
            capacity,
            Some(256 * MIB as u32),
            None,
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err.param_name(), Some("capacity"));
        assert!(storage.get_ref().is_empty());
    }

    let mut storage = Cursor::new(Vec::new());
    let disk = DiskImageFile::initialize_dynamic(
        &mut storage,
        Ownership::None,
        max,
        Some(256 * MIB as u32),
        None,
        None,
        None,
    )
    .unwrap();
    assert_eq!(disk.capacity(), max);
    disk.close().unwrap();
}
