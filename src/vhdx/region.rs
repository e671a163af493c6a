//! Region table: the directory of the regions that make up a container.

use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use super::storage::{read_exact_at, write_all_at, Storage};
use super::{
    checksum_with_hole, le_u32, le_u64, put_u32, put_u64, read_guid, seal_checksum, write_guid,
    BAT_REGION_GUID, KIB, METADATA_REGION_GUID, MIB,
};
use crate::error::{DiskError, Result};

const REGION_SIGNATURE: &[u8; 4] = b"regi";
const REGION_TABLE_SIZE: usize = (64 * KIB) as usize;
const REGION_TABLE_OFFSETS: [u64; 2] = [192 * KIB, 256 * KIB];
const REGION_ENTRY_SIZE: usize = 32;
const MAX_REGION_ENTRIES: u32 = 2047;

/// One entry of the region table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionEntry {
    pub guid: Uuid,
    pub file_offset: u64,
    pub length: u32,
    pub is_required: bool,
}

impl RegionEntry {
    fn end(&self) -> u64 {
        self.file_offset + self.length as u64
    }
}

/// Parsed region table.
#[derive(Debug, Clone)]
pub struct RegionTable {
    entries: Vec<RegionEntry>,
}

impl RegionTable {
    pub(crate) fn new(bat: RegionEntry, metadata: RegionEntry) -> Self {
        Self {
            entries: vec![bat, metadata],
        }
    }

    pub fn entries(&self) -> &[RegionEntry] {
        &self.entries
    }

    fn find(&self, guid: &Uuid) -> Option<&RegionEntry> {
        self.entries.iter().find(|e| &e.guid == guid)
    }

    /// The BAT region. Its presence is checked at parse time.
    pub fn bat(&self) -> &RegionEntry {
        self.find(&BAT_REGION_GUID)
            .unwrap_or_else(|| unreachable!("region table validated without a BAT region"))
    }

    /// The metadata region. Its presence is checked at parse time.
    pub fn metadata(&self) -> &RegionEntry {
        self.find(&METADATA_REGION_GUID)
            .unwrap_or_else(|| unreachable!("region table validated without a metadata region"))
    }

    /// Reads the first region table copy that validates.
    pub(crate) fn read<S: Storage + ?Sized>(storage: &mut S) -> Result<Self> {
        let mut last_error = None;
        for (i, offset) in REGION_TABLE_OFFSETS.iter().enumerate() {
            let mut raw = vec![0u8; REGION_TABLE_SIZE];
            if let Err(e) = read_exact_at(storage, *offset, &mut raw) {
                warn!("Region table {} unreadable: {}", i + 1, e);
                last_error = Some(DiskError::format(format!("region table unreadable: {e}")));
                continue;
            }
            match Self::parse(&raw) {
                Ok(table) => {
                    debug!("Region table {} valid ({} entries)", i + 1, table.entries.len());
                    return Ok(table);
                }
                Err(e) => {
                    warn!("Region table {} ignored: {}", i + 1, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DiskError::format("no valid region table")))
    }

    fn parse(raw: &[u8]) -> Result<Self> {
        if &raw[0..4] != REGION_SIGNATURE {
            return Err(DiskError::format("region table signature mismatch"));
        }
        if le_u32(raw, 4) != checksum_with_hole(raw, 4) {
            return Err(DiskError::format("region table checksum mismatch"));
        }
        let count = le_u32(raw, 8);
        if count > MAX_REGION_ENTRIES {
            return Err(DiskError::format(format!(
                "region table declares {count} entries"
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = 16 + i * REGION_ENTRY_SIZE;
            let entry = RegionEntry {
                guid: read_guid(raw, at),
                file_offset: le_u64(raw, at + 16),
                length: le_u32(raw, at + 24),
                is_required: le_u32(raw, at + 28) & 1 == 1,
            };
            let known = entry.guid == BAT_REGION_GUID || entry.guid == METADATA_REGION_GUID;
            if !known {
                if entry.is_required {
                    return Err(DiskError::format(format!(
                        "unknown required region {}",
                        entry.guid
                    )));
                }
                debug!("Ignoring optional region {}", entry.guid);
                continue;
            }
            if entry.file_offset % MIB != 0 || entry.length as u64 % MIB != 0 {
                return Err(DiskError::format(format!(
                    "region {} is not 1 MiB aligned",
                    entry.guid
                )));
            }
            if entry.file_offset < MIB || entry.length == 0 {
                return Err(DiskError::format(format!(
                    "region {} overlaps the header section or is empty",
                    entry.guid
                )));
            }
            if entries.iter().any(|e: &RegionEntry| e.guid == entry.guid) {
                return Err(DiskError::format(format!("duplicate region {}", entry.guid)));
            }
            entries.push(entry);
        }

        let table = Self { entries };
        table.check_overlaps()?;
        if table.find(&BAT_REGION_GUID).is_none() {
            return Err(DiskError::format("BAT region missing"));
        }
        if table.find(&METADATA_REGION_GUID).is_none() {
            return Err(DiskError::format("metadata region missing"));
        }
        Ok(table)
    }

    fn check_overlaps(&self) -> Result<()> {
        for (i, a) in self.entries.iter().enumerate() {
            for b in &self.entries[i + 1..] {
                if a.file_offset < b.end() && b.file_offset < a.end() {
                    return Err(DiskError::format(format!(
                        "regions {} and {} overlap",
                        a.guid, b.guid
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rejects any region that shares bytes with the log at `log_offset`.
    pub(crate) fn check_log(&self, log_offset: u64, log_length: u32) -> Result<()> {
        let log_end = log_offset + log_length as u64;
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.file_offset < log_end && log_offset < e.end())
        {
            return Err(DiskError::format(format!(
                "region {} overlaps the log at {:#x}",
                entry.guid, log_offset
            )));
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; REGION_TABLE_SIZE];
        raw[0..4].copy_from_slice(REGION_SIGNATURE);
        put_u32(&mut raw, 8, self.entries.len() as u32);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = 16 + i * REGION_ENTRY_SIZE;
            write_guid(&mut raw, at, &entry.guid);
            put_u64(&mut raw, at + 16, entry.file_offset);
            put_u32(&mut raw, at + 24, entry.length);
            put_u32(&mut raw, at + 28, entry.is_required as u32);
        }
        seal_checksum(&mut raw, 4);
        raw
    }

    /// Writes both copies of the table.
    pub(crate) fn write<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<()> {
        let raw = self.to_bytes();
        for offset in REGION_TABLE_OFFSETS {
            write_all_at(storage, offset, &raw)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn region(guid: Uuid, offset_mb: u64, length_mb: u32) -> RegionEntry {
        RegionEntry {
            guid,
            file_offset: offset_mb * MIB,
            length: length_mb * MIB as u32,
            is_required: true,
        }
    }

    fn write_raw(table: &RegionTable) -> Cursor<Vec<u8>> {
        let mut storage = Cursor::new(vec![0u8; MIB as usize]);
        table.write(&mut storage).unwrap();
        storage
    }

    #[test]
    fn write_then_read() {
        let table = RegionTable::new(
            region(BAT_REGION_GUID, 3, 1),
            region(METADATA_REGION_GUID, 2, 1),
        );
        let mut storage = write_raw(&table);
        let reread = RegionTable::read(&mut storage).unwrap();
        assert_eq!(reread.bat().file_offset, 3 * MIB);
        assert_eq!(reread.metadata().file_offset, 2 * MIB);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let table = RegionTable::new(
            region(BAT_REGION_GUID, 2, 2),
            region(METADATA_REGION_GUID, 3, 1),
        );
        let mut storage = write_raw(&table);
        assert!(matches!(
            RegionTable::read(&mut storage),
            Err(DiskError::Format(msg)) if msg.contains("overlap")
        ));
    }

    #[test]
    fn region_inside_the_log_is_rejected() {
        let table = RegionTable::new(
            region(BAT_REGION_GUID, 3, 1),
            region(METADATA_REGION_GUID, 1, 1),
        );
        assert!(matches!(
            table.check_log(MIB, MIB as u32),
            Err(DiskError::Format(msg)) if msg.contains("overlaps the log")
        ));
        assert!(table.check_log(5 * MIB, MIB as u32).is_ok());
        assert!(table.check_log(0, 0).is_ok());
    }

    #[test]
    fn unknown_required_region_is_rejected_optional_ignored() {
        let mut table = RegionTable::new(
            region(BAT_REGION_GUID, 3, 1),
            region(METADATA_REGION_GUID, 2, 1),
        );
        let mut optional = region(Uuid::new_v4(), 8, 1);
        optional.is_required = false;
        table.entries.push(optional);
        let mut storage = write_raw(&table);
        assert_eq!(RegionTable::read(&mut storage).unwrap().entries().len(), 2);

        table.entries.push(region(Uuid::new_v4(), 9, 1));
        let mut storage = write_raw(&table);
        assert!(matches!(
            RegionTable::read(&mut storage),
            Err(DiskError::Format(msg)) if msg.contains("unknown required region")
        ));
    }

    #[test]
    fn corrupt_first_copy_falls_back_to_second() {
        let table = RegionTable::new(
            region(BAT_REGION_GUID, 3, 1),
            region(METADATA_REGION_GUID, 2, 1),
        );
        let mut storage = write_raw(&table);
        storage.get_mut()[REGION_TABLE_OFFSETS[0] as usize + 20] ^= 0x55;
        assert!(RegionTable::read(&mut storage).is_ok());
    }
}
