//! Metadata region: typed description of the virtual disk.
//!
//! The region starts with a 64 KiB table of item descriptors; item payloads
//! follow. Only the well-known system items are interpreted. User items are
//! preserved on disk and otherwise ignored.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::region::RegionEntry;
use super::storage::{read_exact_at, write_all_at, Storage};
use super::{
    decode_utf16le, encode_utf16le, le_u16, le_u32, le_u64, put_u16, put_u32, read_guid,
    write_guid, FILE_PARAMETERS_GUID, KIB, LOGICAL_SECTOR_SIZE_GUID, MIB, PAGE_83_DATA_GUID,
    PARENT_LOCATOR_GUID, PHYSICAL_SECTOR_SIZE_GUID, VHDX_PARENT_LOCATOR_TYPE_GUID,
    VIRTUAL_DISK_SIZE_GUID,
};
use crate::error::{DiskError, Result};

const METADATA_SIGNATURE: &[u8; 8] = b"metadata";
const METADATA_TABLE_SIZE: u64 = 64 * KIB;
const METADATA_ENTRY_SIZE: usize = 32;
const MAX_METADATA_ENTRIES: u16 = 2047;

const FLAG_IS_USER: u32 = 0x1;
const FLAG_IS_VIRTUAL_DISK: u32 = 0x2;
const FLAG_IS_REQUIRED: u32 = 0x4;

const FILE_PARAMETERS_LEAVE_BLOCKS_ALLOCATED: u32 = 0x1;
const FILE_PARAMETERS_HAS_PARENT: u32 = 0x2;

pub(crate) const MIN_BLOCK_SIZE: u32 = MIB as u32;
pub(crate) const MAX_BLOCK_SIZE: u32 = 256 * MIB as u32;
pub(crate) const DEFAULT_BLOCK_SIZE: u32 = 32 * MIB as u32;
pub(crate) const DEFAULT_DIFFERENCING_BLOCK_SIZE: u32 = 2 * MIB as u32;
pub(crate) const DEFAULT_LOGICAL_SECTOR_SIZE: u32 = 512;
/// Largest virtual disk, 64 TiB.
pub(crate) const MAX_DISK_SIZE: u64 = 64 * 1024 * 1024 * MIB;
pub(crate) const DEFAULT_PHYSICAL_SECTOR_SIZE: u32 = 4096;

/// Checks a sector size against {512, 4096}, naming `param` on failure.
pub(crate) fn validate_sector_size(value: u32, param: &'static str) -> Result<u32> {
    match value {
        512 | 4096 => Ok(value),
        _ => Err(DiskError::InvalidArgument(param)),
    }
}

/// Picks the block size used for a new container.
///
/// `None` or 0 selects `default`. Sizes outside [1 MiB, 256 MiB] are clamped
/// to the nearest bound; an in-range size that is not a power of two is
/// rejected.
pub(crate) fn resolve_block_size(requested: Option<u32>, default: u32) -> Result<u32> {
    let size = match requested {
        None | Some(0) => return Ok(default),
        Some(size) => size,
    };
    if size < MIN_BLOCK_SIZE {
        warn!("Block size {} below minimum, using {}", size, MIN_BLOCK_SIZE);
        return Ok(MIN_BLOCK_SIZE);
    }
    if size > MAX_BLOCK_SIZE {
        warn!("Block size {} above maximum, using {}", size, MAX_BLOCK_SIZE);
        return Ok(MAX_BLOCK_SIZE);
    }
    if !size.is_power_of_two() {
        return Err(DiskError::InvalidArgument("blockSize"));
    }
    Ok(size)
}

/// Content of the file parameters item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParameters {
    pub block_size: u32,
    /// Set on fixed disks: blocks must not be deallocated.
    pub leave_blocks_allocated: bool,
    /// Set on differencing disks.
    pub has_parent: bool,
}

impl FileParameters {
    fn parse(raw: &[u8]) -> Self {
        let flags = le_u32(raw, 4);
        Self {
            block_size: le_u32(raw, 0),
            leave_blocks_allocated: flags & FILE_PARAMETERS_LEAVE_BLOCKS_ALLOCATED != 0,
            has_parent: flags & FILE_PARAMETERS_HAS_PARENT != 0,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut raw = vec![0u8; 8];
        put_u32(&mut raw, 0, self.block_size);
        let mut flags = 0;
        if self.leave_blocks_allocated {
            flags |= FILE_PARAMETERS_LEAVE_BLOCKS_ALLOCATED;
        }
        if self.has_parent {
            flags |= FILE_PARAMETERS_HAS_PARENT;
        }
        put_u32(&mut raw, 4, flags);
        raw
    }
}

/// Parent locator of a differencing disk: a locator type and ordered
/// key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLocator {
    pub locator_type: Uuid,
    pub entries: Vec<(String, String)>,
}

impl ParentLocator {
    pub const PARENT_LINKAGE: &'static str = "parent_linkage";
    pub const PARENT_LINKAGE2: &'static str = "parent_linkage2";
    pub const RELATIVE_PATH: &'static str = "relative_path";
    pub const VOLUME_PATH: &'static str = "volume_path";
    pub const ABSOLUTE_WIN32_PATH: &'static str = "absolute_win32_path";

    /// Builds a VHDX locator pointing at a parent with `data_write_guid`.
    pub(crate) fn new(
        parent_data_write_guid: &Uuid,
        relative_path: Option<&str>,
        absolute_path: &str,
    ) -> Self {
        let mut entries = vec![(
            Self::PARENT_LINKAGE.to_string(),
            parent_data_write_guid.braced().to_string(),
        )];
        if let Some(relative) = relative_path {
            entries.push((Self::RELATIVE_PATH.to_string(), relative.to_string()));
        }
        entries.push((
            Self::ABSOLUTE_WIN32_PATH.to_string(),
            absolute_path.to_string(),
        ));
        Self {
            locator_type: VHDX_PARENT_LOCATOR_TYPE_GUID,
            entries,
        }
    }

    /// Value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parses a linkage value such as `{c0ffee00-...}`.
    pub(crate) fn linkage(&self, key: &str) -> Option<Uuid> {
        self.get(key).and_then(|v| Uuid::parse_str(v.trim()).ok())
    }

    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 20 {
            return Err(DiskError::format("parent locator too short"));
        }
        let locator_type = read_guid(raw, 0);
        let count = le_u16(raw, 18) as usize;
        if 20 + count * 12 > raw.len() {
            return Err(DiskError::format("parent locator entries truncated"));
        }
        let string_at = |offset: u32, length: u16| -> Result<String> {
            let start = offset as usize;
            let end = start + length as usize;
            if end > raw.len() || length % 2 != 0 {
                return Err(DiskError::format("parent locator string out of bounds"));
            }
            decode_utf16le(&raw[start..end])
                .ok_or_else(|| DiskError::format("parent locator string is not UTF-16"))
        };
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = 20 + i * 12;
            let key = string_at(le_u32(raw, at), le_u16(raw, at + 8))?;
            let value = string_at(le_u32(raw, at + 4), le_u16(raw, at + 10))?;
            entries.push((key, value));
        }
        Ok(Self {
            locator_type,
            entries,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let header_len = 20 + self.entries.len() * 12;
        let mut raw = vec![0u8; header_len];
        write_guid(&mut raw, 0, &self.locator_type);
        put_u16(&mut raw, 18, self.entries.len() as u16);
        for (i, (key, value)) in self.entries.iter().enumerate() {
            let key = encode_utf16le(key);
            let value = encode_utf16le(value);
            let at = 20 + i * 12;
            let key_offset = raw.len() as u32;
            put_u32(&mut raw, at, key_offset);
            put_u16(&mut raw, at + 8, key.len() as u16);
            raw.extend_from_slice(&key);
            let value_offset = raw.len() as u32;
            put_u32(&mut raw, at + 4, value_offset);
            put_u16(&mut raw, at + 10, value.len() as u16);
            raw.extend_from_slice(&value);
        }
        raw
    }
}

/// Typed content of the metadata region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Metadata {
    pub(crate) file_parameters: FileParameters,
    pub(crate) disk_size: u64,
    pub(crate) page83: Uuid,
    pub(crate) logical_sector_size: u32,
    pub(crate) physical_sector_size: u32,
    pub(crate) parent_locator: Option<ParentLocator>,
}

/// Descriptor of one item in the metadata table.
struct ItemEntry {
    item_id: Uuid,
    offset: u32,
    length: u32,
    flags: u32,
}

impl Metadata {
    /// Reads and validates the metadata region.
    pub(crate) fn read<S: Storage + ?Sized>(storage: &mut S, region: &RegionEntry) -> Result<Self> {
        let mut table = vec![0u8; METADATA_TABLE_SIZE as usize];
        read_exact_at(storage, region.file_offset, &mut table)
            .map_err(|e| DiskError::format(format!("metadata table unreadable: {e}")))?;
        if &table[0..8] != METADATA_SIGNATURE {
            return Err(DiskError::format("metadata table signature mismatch"));
        }
        let count = le_u16(&table, 10);
        if count > MAX_METADATA_ENTRIES {
            return Err(DiskError::format(format!(
                "metadata table declares {count} entries"
            )));
        }

        let mut items = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = 32 + i * METADATA_ENTRY_SIZE;
            items.push(ItemEntry {
                item_id: read_guid(&table, at),
                offset: le_u32(&table, at + 16),
                length: le_u32(&table, at + 20),
                flags: le_u32(&table, at + 24),
            });
        }

        let mut read_item = |id: &Uuid| -> Result<Option<Vec<u8>>> {
            let Some(item) = items.iter().find(|i| &i.item_id == id && i.flags & FLAG_IS_USER == 0)
            else {
                return Ok(None);
            };
            if item.length == 0 {
                return Ok(Some(Vec::new()));
            }
            let end = item.offset as u64 + item.length as u64;
            if (item.offset as u64) < METADATA_TABLE_SIZE || end > region.length as u64 {
                return Err(DiskError::format(format!(
                    "metadata item {} lies outside the metadata region",
                    item.item_id
                )));
            }
            let mut raw = vec![0u8; item.length as usize];
            read_exact_at(storage, region.file_offset + item.offset as u64, &mut raw)?;
            Ok(Some(raw))
        };

        let required = |raw: Option<Vec<u8>>, name: &str, min_len: usize| -> Result<Vec<u8>> {
            match raw {
                Some(raw) if raw.len() >= min_len => Ok(raw),
                Some(_) => Err(DiskError::format(format!("metadata item {name} too short"))),
                None => Err(DiskError::format(format!("metadata item {name} missing"))),
            }
        };

        let file_parameters = FileParameters::parse(&required(
            read_item(&FILE_PARAMETERS_GUID)?,
            "FileParameters",
            8,
        )?);
        let disk_size = le_u64(
            &required(read_item(&VIRTUAL_DISK_SIZE_GUID)?, "VirtualDiskSize", 8)?,
            0,
        );
        let logical_sector_size = le_u32(
            &required(read_item(&LOGICAL_SECTOR_SIZE_GUID)?, "LogicalSectorSize", 4)?,
            0,
        );
        let physical_sector_size = le_u32(
            &required(read_item(&PHYSICAL_SECTOR_SIZE_GUID)?, "PhysicalSectorSize", 4)?,
            0,
        );
        let page83 = match read_item(&PAGE_83_DATA_GUID)? {
            Some(raw) if raw.len() >= 16 => read_guid(&raw, 0),
            _ => {
                warn!("Page 83 data item missing, using a nil identifier");
                Uuid::nil()
            }
        };
        let parent_locator = match read_item(&PARENT_LOCATOR_GUID)? {
            Some(raw) => Some(ParentLocator::parse(&raw)?),
            None => None,
        };

        let known = [
            FILE_PARAMETERS_GUID,
            VIRTUAL_DISK_SIZE_GUID,
            PAGE_83_DATA_GUID,
            LOGICAL_SECTOR_SIZE_GUID,
            PHYSICAL_SECTOR_SIZE_GUID,
            PARENT_LOCATOR_GUID,
        ];
        for item in &items {
            let is_user = item.flags & FLAG_IS_USER != 0;
            if !is_user && !known.contains(&item.item_id) {
                if item.flags & FLAG_IS_REQUIRED != 0 {
                    return Err(DiskError::format(format!(
                        "unknown required metadata item {}",
                        item.item_id
                    )));
                }
                debug!("Ignoring optional metadata item {}", item.item_id);
            }
        }

        let metadata = Self {
            file_parameters,
            disk_size,
            page83,
            logical_sector_size,
            physical_sector_size,
            parent_locator,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<()> {
        let block_size = self.file_parameters.block_size;
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(DiskError::format(format!("invalid block size {block_size}")));
        }
        validate_sector_size(self.logical_sector_size, "logicalSectorSize")?;
        validate_sector_size(self.physical_sector_size, "physicalSectorSize")?;
        if self.disk_size == 0
            || self.disk_size > MAX_DISK_SIZE
            || self.disk_size % self.logical_sector_size as u64 != 0
        {
            return Err(DiskError::format(format!(
                "invalid virtual disk size {}",
                self.disk_size
            )));
        }
        if self.file_parameters.has_parent && self.parent_locator.is_none() {
            return Err(DiskError::format("differencing disk without parent locator"));
        }
        Ok(())
    }

    /// Writes the table and all items at the start of `region`.
    pub(crate) fn write<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        region: &RegionEntry,
    ) -> Result<()> {
        let mut items: Vec<(Uuid, u32, Vec<u8>)> = vec![
            (
                FILE_PARAMETERS_GUID,
                FLAG_IS_REQUIRED,
                self.file_parameters.to_bytes(),
            ),
            (
                VIRTUAL_DISK_SIZE_GUID,
                FLAG_IS_VIRTUAL_DISK | FLAG_IS_REQUIRED,
                self.disk_size.to_le_bytes().to_vec(),
            ),
            (
                PAGE_83_DATA_GUID,
                FLAG_IS_VIRTUAL_DISK | FLAG_IS_REQUIRED,
                self.page83.to_bytes_le().to_vec(),
            ),
            (
                LOGICAL_SECTOR_SIZE_GUID,
                FLAG_IS_VIRTUAL_DISK | FLAG_IS_REQUIRED,
                self.logical_sector_size.to_le_bytes().to_vec(),
            ),
            (
                PHYSICAL_SECTOR_SIZE_GUID,
                FLAG_IS_VIRTUAL_DISK | FLAG_IS_REQUIRED,
                self.physical_sector_size.to_le_bytes().to_vec(),
            ),
        ];
        if let Some(locator) = &self.parent_locator {
            items.push((PARENT_LOCATOR_GUID, FLAG_IS_REQUIRED, locator.to_bytes()));
        }

        let mut table = vec![0u8; METADATA_TABLE_SIZE as usize];
        table[0..8].copy_from_slice(METADATA_SIGNATURE);
        put_u16(&mut table, 10, items.len() as u16);
        let mut payload = Vec::new();
        for (i, (id, flags, data)) in items.iter().enumerate() {
            let at = 32 + i * METADATA_ENTRY_SIZE;
            write_guid(&mut table, at, id);
            put_u32(
                &mut table,
                at + 16,
                (METADATA_TABLE_SIZE as usize + payload.len()) as u32,
            );
            put_u32(&mut table, at + 20, data.len() as u32);
            put_u32(&mut table, at + 24, *flags);
            payload.extend_from_slice(data);
        }
        if METADATA_TABLE_SIZE + payload.len() as u64 > region.length as u64 {
            return Err(DiskError::format("metadata does not fit its region"));
        }
        write_all_at(storage, region.file_offset, &table)?;
        write_all_at(
            storage,
            region.file_offset + METADATA_TABLE_SIZE,
            &payload,
        )?;
        Ok(())
    }
}
