//! One VHDX file: the parsed structures plus the backing storage.
//!
//! A `VhdxFile` is a single layer. Parent resolution and the byte-stream view
//! live in `parent` and `stream`.

use std::path::{Path, PathBuf};

use log::{debug, info};
use uuid::Uuid;

use super::bat::{Bat, BatEntry, BatLayout, PayloadBlockState};
use super::header::{read_file_identifier, write_file_identifier, Header, HeaderPair, CREATOR};
use super::log::{replay, LogWriter, Transaction};
use super::metadata::Metadata;
use super::region::{RegionEntry, RegionTable};
use super::storage::{read_exact_at, write_all_at, write_zeroes_at, FileAccess, Storage};
use super::{align_up, BAT_REGION_GUID, METADATA_REGION_GUID, MIB};
use crate::error::{DiskError, Result};
use crate::progress::{self, ProgressSink};

const LOG_OFFSET: u64 = MIB;
const LOG_LENGTH: u32 = MIB as u32;
const METADATA_OFFSET: u64 = 2 * MIB;
const METADATA_LENGTH: u32 = MIB as u32;
const BAT_OFFSET: u64 = 3 * MIB;

pub(crate) struct VhdxFile<S: Storage> {
    storage: S,
    access: FileAccess,
    path: Option<PathBuf>,
    creator: String,
    headers: HeaderPair,
    regions: RegionTable,
    metadata: Metadata,
    bat: Bat,
    log: Option<LogWriter>,
    data_guid_updated: bool,
    replayed_entries: usize,
}

impl<S: Storage> VhdxFile<S> {
    /// Parses an existing container: identifier, headers, regions, log
    /// replay, metadata and BAT, in that order.
    pub(crate) fn open(mut storage: S, access: FileAccess) -> Result<Self> {
        let creator = read_file_identifier(&mut storage)?;
        let mut headers = HeaderPair::read(&mut storage)?;

        let mut replayed_entries = 0;
        if !headers.current().log_guid.is_nil() {
            if !access.can_write() {
                return Err(DiskError::ReadOnly(
                    "container has a pending log and is opened read-only",
                ));
            }
            replayed_entries = replay(&mut storage, &mut headers)?;
        }

        let regions = RegionTable::read(&mut storage)?;
        let current = headers.current();
        regions.check_log(current.log_offset, current.log_length)?;
        let metadata = Metadata::read(&mut storage, regions.metadata())?;
        let layout = BatLayout::new(
            metadata.disk_size,
            metadata.file_parameters.block_size,
            metadata.logical_sector_size,
            metadata.file_parameters.has_parent,
        );
        let bat = Bat::read(&mut storage, regions.bat(), layout)?;
        debug!(
            "Opened VHDX: capacity={} block_size={} sectors={}/{} creator={:?}",
            metadata.disk_size,
            metadata.file_parameters.block_size,
            metadata.logical_sector_size,
            metadata.physical_sector_size,
            creator
        );

        Ok(Self {
            storage,
            access,
            path: None,
            creator,
            headers,
            regions,
            metadata,
            bat,
            log: None,
            data_guid_updated: false,
            replayed_entries,
        })
    }

    /// Writes a fresh container described by `metadata` into `storage`.
    ///
    /// Fixed containers get a FULLY_PRESENT BAT and a zero-filled data region,
    /// reported block by block to `progress`.
    pub(crate) fn create(
        mut storage: S,
        metadata: Metadata,
        mut progress: Option<&mut dyn ProgressSink>,
    ) -> Result<Self> {
        let capacity = metadata.disk_size;
        let block_size = metadata.file_parameters.block_size as u64;
        let fixed = metadata.file_parameters.leave_blocks_allocated;
        let layout = BatLayout::new(
            capacity,
            metadata.file_parameters.block_size,
            metadata.logical_sector_size,
            metadata.file_parameters.has_parent,
        );
        let bat_length = layout.region_length();
        let bat_region_length =
            u32::try_from(bat_length).map_err(|_| DiskError::InvalidArgument("capacity"))?;
        let data_start = BAT_OFFSET + bat_length;

        progress::report(&mut progress, 0);
        storage.set_len(0)?;
        write_file_identifier(&mut storage)?;
        let headers = HeaderPair::initialize(&mut storage, &Header::new(LOG_OFFSET, LOG_LENGTH))?;

        let regions = RegionTable::new(
            RegionEntry {
                guid: BAT_REGION_GUID,
                file_offset: BAT_OFFSET,
                length: bat_region_length,
                is_required: true,
            },
            RegionEntry {
                guid: METADATA_REGION_GUID,
                file_offset: METADATA_OFFSET,
                length: METADATA_LENGTH,
                is_required: true,
            },
        );
        regions.write(&mut storage)?;
        write_zeroes_at(&mut storage, LOG_OFFSET, LOG_LENGTH as u64)?;
        write_zeroes_at(&mut storage, METADATA_OFFSET, METADATA_LENGTH as u64)?;
        metadata.write(&mut storage, regions.metadata())?;

        let bat = Bat::build(layout, BAT_OFFSET, |block| {
            if fixed {
                BatEntry::payload(
                    PayloadBlockState::FullyPresent,
                    data_start + block * block_size,
                )
            } else {
                BatEntry::default()
            }
        });
        bat.write(&mut storage)?;

        if fixed {
            let mut written = 0;
            while written < capacity {
                let segment = block_size.min(capacity - written);
                write_zeroes_at(&mut storage, data_start + written, segment)?;
                written += segment;
                progress::report(&mut progress, written);
            }
        } else {
            storage.set_len(data_start)?;
            progress::report(&mut progress, capacity);
        }
        storage.sync()?;
        info!(
            "Created {} VHDX: capacity={} block_size={} file_length={}",
            if fixed {
                "fixed"
            } else if metadata.file_parameters.has_parent {
                "differencing"
            } else {
                "dynamic"
            },
            capacity,
            block_size,
            storage.storage_len()?
        );

        Ok(Self {
            storage,
            access: FileAccess::ReadWrite,
            path: None,
            creator: CREATOR.to_string(),
            headers,
            regions,
            metadata,
            bat,
            log: None,
            data_guid_updated: false,
            replayed_entries: 0,
        })
    }

    pub(crate) fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn creator(&self) -> &str {
        &self.creator
    }

    pub(crate) fn access(&self) -> FileAccess {
        self.access
    }

    pub(crate) fn header(&self) -> &Header {
        self.headers.current()
    }

    pub(crate) fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub(crate) fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub(crate) fn bat(&self) -> &Bat {
        &self.bat
    }

    pub(crate) fn bat_mut(&mut self) -> &mut Bat {
        &mut self.bat
    }

    pub(crate) fn layout(&self) -> &BatLayout {
        self.bat.layout()
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.metadata.disk_size
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.metadata.file_parameters.has_parent
    }

    pub(crate) fn is_fixed(&self) -> bool {
        self.metadata.file_parameters.leave_blocks_allocated && !self.has_parent()
    }

    pub(crate) fn replayed_entries(&self) -> usize {
        self.replayed_entries
    }

    pub(crate) fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&mut self.storage, offset, buf)?;
        Ok(())
    }

    pub(crate) fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&mut self.storage, offset, data)?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.storage.sync()?;
        Ok(())
    }

    /// Starts the write session on first use. A new log GUID and file write
    /// GUID are committed together; the data write GUID changes the first
    /// time user data is modified.
    pub(crate) fn begin_write(&mut self, user_data: bool) -> Result<()> {
        if !self.access.can_write() {
            return Err(DiskError::ReadOnly("container is opened read-only"));
        }
        let needs_data_guid = user_data && !self.data_guid_updated;
        if self.log.is_some() && !needs_data_guid {
            return Ok(());
        }

        let mut header = self.headers.current().clone();
        if self.log.is_none() {
            header.file_write_guid = Uuid::new_v4();
            header.log_guid = Uuid::new_v4();
        }
        if needs_data_guid {
            header.data_write_guid = Uuid::new_v4();
            self.data_guid_updated = true;
        }
        self.headers.commit(&mut self.storage, header)?;
        if self.log.is_none() {
            self.log = Some(LogWriter::new(self.headers.current())?);
            debug!("Write session started, log {}", self.headers.current().log_guid);
        }
        Ok(())
    }

    /// Reserves `length` bytes at the 1 MiB-aligned end of the file and
    /// returns their offset. The new space reads as zero.
    pub(crate) fn allocate(&mut self, length: u64) -> Result<u64> {
        let offset = align_up(self.storage.storage_len()?, MIB);
        self.storage.set_len(offset + length)?;
        debug!("Allocated {} bytes at 0x{:x}", length, offset);
        Ok(offset)
    }

    /// Commits `txn` through the log of the current session.
    pub(crate) fn commit(&mut self, txn: Transaction) -> Result<()> {
        self.begin_write(false)?;
        match self.log.as_mut() {
            Some(log) => log.commit(&mut self.storage, txn),
            None => Err(DiskError::format("write session has no log")),
        }
    }

    /// Ends the write session: the header is committed with a nil log GUID.
    /// With `sync_storage` the storage is synced afterwards.
    pub(crate) fn close(&mut self, sync_storage: bool) -> Result<()> {
        if self.log.take().is_some() {
            let mut header = self.headers.current().clone();
            header.log_guid = Uuid::nil();
            self.headers.commit(&mut self.storage, header)?;
            debug!("Write session closed");
        }
        if sync_storage {
            self.storage.sync()?;
        }
        Ok(())
    }

    /// Gives the storage back. The write session must already be closed.
    #[cfg(test)]
    pub(crate) fn into_storage(self) -> S {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhdx::metadata::FileParameters;
    use std::io::Cursor;

    fn metadata(fixed: bool) -> Metadata {
        Metadata {
            file_parameters: FileParameters {
                block_size: 2 * MIB as u32,
                leave_blocks_allocated: fixed,
                has_parent: false,
            },
            disk_size: 8 * MIB,
            page83: Uuid::new_v4(),
            logical_sector_size: 512,
            physical_sector_size: 4096,
            parent_locator: None,
        }
    }

    #[test]
    fn create_then_open_round_trips_structures() {
        let meta = metadata(false);
        let file = VhdxFile::create(Cursor::new(Vec::new()), meta.clone(), None).unwrap();
        assert_eq!(file.storage.get_ref().len() as u64, 4 * MIB);
        let reopened = VhdxFile::open(file.storage, FileAccess::Read).unwrap();
        assert_eq!(reopened.metadata(), &meta);
        assert_eq!(reopened.creator(), "vhdx_body");
        assert_eq!(reopened.bat().allocated_blocks(), 0);
        assert!(reopened.header().log_guid.is_nil());
    }

    #[test]
    fn fixed_create_reports_every_block() {
        let mut seen = Vec::new();
        let mut sink = |v: u64| seen.push(v);
        let file = VhdxFile::create(Cursor::new(Vec::new()), metadata(true), Some(&mut sink)).unwrap();
        assert_eq!(file.storage.get_ref().len() as u64, 4 * MIB + 8 * MIB);
        assert_eq!(seen, vec![0, 2 * MIB, 4 * MIB, 6 * MIB, 8 * MIB]);
        assert_eq!(file.bat().allocated_blocks(), 4);
    }

    #[test]
    fn session_commits_guids_and_close_clears_log_guid() {
        let mut file = VhdxFile::create(Cursor::new(Vec::new()), metadata(false), None).unwrap();
        let before = file.header().clone();
        file.begin_write(true).unwrap();
        let during = file.header().clone();
        assert!(!during.log_guid.is_nil());
        assert_ne!(during.file_write_guid, before.file_write_guid);
        assert_ne!(during.data_write_guid, before.data_write_guid);

        file.close(true).unwrap();
        let reopened = VhdxFile::open(file.storage, FileAccess::Read).unwrap();
        assert!(reopened.header().log_guid.is_nil());
        assert_eq!(reopened.header().data_write_guid, during.data_write_guid);
    }

    #[test]
    fn allocation_is_megabyte_aligned() {
        let mut file = VhdxFile::create(Cursor::new(Vec::new()), metadata(false), None).unwrap();
        file.storage.set_len(4 * MIB + 10).unwrap();
        assert_eq!(file.allocate(2 * MIB).unwrap(), 5 * MIB);
        assert_eq!(file.storage.get_ref().len() as u64, 7 * MIB);
    }

    #[test]
    fn read_only_file_rejects_writes() {
        let file = VhdxFile::create(Cursor::new(Vec::new()), metadata(false), None).unwrap();
        let mut reopened = VhdxFile::open(file.storage, FileAccess::Read).unwrap();
        assert!(matches!(
            reopened.begin_write(true),
            Err(DiskError::ReadOnly(_))
        ));
    }

    #[test]
    fn pending_log_on_read_only_open_is_rejected() {
        let mut file = VhdxFile::create(Cursor::new(Vec::new()), metadata(false), None).unwrap();
        file.begin_write(false).unwrap();
        // Session left open, as after a crash.
        assert!(matches!(
            VhdxFile::open(file.storage.clone(), FileAccess::Read),
            Err(DiskError::ReadOnly(_))
        ));
        let recovered = VhdxFile::open(file.storage, FileAccess::ReadWrite).unwrap();
        assert!(recovered.header().log_guid.is_nil());
    }
}
