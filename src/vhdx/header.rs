//! File type identifier and the two redundant VHDX headers.

use log::{debug, warn};
use uuid::Uuid;

use super::storage::{read_exact_at, write_all_at, Storage};
use super::{
    checksum_with_hole, decode_utf16le, encode_utf16le, le_u16, le_u32, le_u64, put_u16, put_u32,
    put_u64, read_guid, seal_checksum, write_guid, KIB, MIB,
};
use crate::error::{DiskError, Result};

const FILE_SIGNATURE: &[u8; 8] = b"vhdxfile";
const HEADER_SIGNATURE: &[u8; 4] = b"head";

pub(crate) const FILE_IDENTIFIER_SIZE: usize = (64 * KIB) as usize;
pub(crate) const HEADER_SIZE: usize = (4 * KIB) as usize;
/// File offsets of the two header slots.
pub(crate) const HEADER_OFFSETS: [u64; 2] = [64 * KIB, 128 * KIB];

pub(crate) const CREATOR: &str = "vhdx_body";

/// One of the two headers at 64 KiB and 128 KiB.
///
/// The header names the log and carries the write GUIDs. Its
/// `sequence_number` decides which of the two copies is current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub sequence_number: u64,
    /// Changed the first time the file is written in a session.
    pub file_write_guid: Uuid,
    /// Changed the first time user-visible data is written in a session.
    /// Differencing children link to their parent through this value.
    pub data_write_guid: Uuid,
    /// Nil when the log holds nothing to replay.
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl Header {
    pub(crate) fn new(log_offset: u64, log_length: u32) -> Self {
        Self {
            sequence_number: 0,
            file_write_guid: Uuid::new_v4(),
            data_write_guid: Uuid::new_v4(),
            log_guid: Uuid::nil(),
            log_version: 0,
            version: 1,
            log_length,
            log_offset,
        }
    }

    /// Parses and validates a header slot. Returns a description of the
    /// problem when the slot is not usable.
    fn parse(raw: &[u8]) -> std::result::Result<Self, String> {
        if &raw[0..4] != HEADER_SIGNATURE {
            return Err("signature mismatch".into());
        }
        let stored = le_u32(raw, 4);
        let computed = checksum_with_hole(raw, 4);
        if stored != computed {
            return Err(format!(
                "checksum mismatch (stored 0x{stored:08x}, computed 0x{computed:08x})"
            ));
        }
        let header = Self {
            sequence_number: le_u64(raw, 8),
            file_write_guid: read_guid(raw, 16),
            data_write_guid: read_guid(raw, 32),
            log_guid: read_guid(raw, 48),
            log_version: le_u16(raw, 64),
            version: le_u16(raw, 66),
            log_length: le_u32(raw, 68),
            log_offset: le_u64(raw, 72),
        };
        if header.version != 1 {
            return Err(format!("unsupported version {}", header.version));
        }
        if header.log_version != 0 {
            return Err(format!("unsupported log version {}", header.log_version));
        }
        if header.log_length as u64 % MIB != 0 || header.log_offset % MIB != 0 {
            return Err("log location is not 1 MiB aligned".into());
        }
        if header.log_length != 0 && header.log_offset < MIB {
            return Err("log overlaps the header section".into());
        }
        Ok(header)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(HEADER_SIGNATURE);
        put_u64(&mut raw, 8, self.sequence_number);
        write_guid(&mut raw, 16, &self.file_write_guid);
        write_guid(&mut raw, 32, &self.data_write_guid);
        write_guid(&mut raw, 48, &self.log_guid);
        put_u16(&mut raw, 64, self.log_version);
        put_u16(&mut raw, 66, self.version);
        put_u32(&mut raw, 68, self.log_length);
        put_u64(&mut raw, 72, self.log_offset);
        seal_checksum(&mut raw, 4);
        raw
    }
}

/// Writes the 64 KiB file type identifier at offset 0.
pub(crate) fn write_file_identifier<S: Storage + ?Sized>(storage: &mut S) -> Result<()> {
    let mut raw = vec![0u8; FILE_IDENTIFIER_SIZE];
    raw[0..8].copy_from_slice(FILE_SIGNATURE);
    let creator = encode_utf16le(CREATOR);
    raw[8..8 + creator.len()].copy_from_slice(&creator);
    write_all_at(storage, 0, &raw)?;
    Ok(())
}

/// Reads the file type identifier and returns the creator string.
pub(crate) fn read_file_identifier<S: Storage + ?Sized>(storage: &mut S) -> Result<String> {
    let mut raw = [0u8; 8 + 512];
    read_exact_at(storage, 0, &mut raw)
        .map_err(|e| DiskError::format(format!("file identifier unreadable: {e}")))?;
    if &raw[0..8] != FILE_SIGNATURE {
        return Err(DiskError::format("not a VHDX file (identifier signature mismatch)"));
    }
    Ok(decode_utf16le(&raw[8..]).unwrap_or_default())
}

/// The two header slots.
///
/// The current header is recomputed from the sequence numbers on every
/// access, so a commit that dies halfway leaves the previous generation in
/// charge.
#[derive(Debug, Clone)]
pub(crate) struct HeaderPair {
    slots: [Option<Header>; 2],
}

impl HeaderPair {
    /// Reads both header slots. Fails when neither validates.
    pub(crate) fn read<S: Storage + ?Sized>(storage: &mut S) -> Result<Self> {
        let mut slots: [Option<Header>; 2] = [None, None];
        for (i, offset) in HEADER_OFFSETS.iter().enumerate() {
            let mut raw = vec![0u8; HEADER_SIZE];
            if let Err(e) = read_exact_at(storage, *offset, &mut raw) {
                warn!("Header {} at 0x{:x} unreadable: {}", i + 1, offset, e);
                continue;
            }
            match Header::parse(&raw) {
                Ok(header) => {
                    debug!("Header {} valid, sequence {}", i + 1, header.sequence_number);
                    slots[i] = Some(header);
                }
                Err(reason) => warn!("Header {} at 0x{:x} ignored: {}", i + 1, offset, reason),
            }
        }
        if slots.iter().all(Option::is_none) {
            return Err(DiskError::format("no valid VHDX header found"));
        }
        Ok(Self { slots })
    }

    /// Writes `header` into both slots of a fresh container, with sequence
    /// numbers 0 and 1.
    pub(crate) fn initialize<S: Storage + ?Sized>(
        storage: &mut S,
        header: &Header,
    ) -> Result<Self> {
        let mut slots: [Option<Header>; 2] = [None, None];
        for (i, offset) in HEADER_OFFSETS.iter().enumerate() {
            let mut slot = header.clone();
            slot.sequence_number = header.sequence_number + i as u64;
            write_all_at(storage, *offset, &slot.to_bytes())?;
            slots[i] = Some(slot);
        }
        Ok(Self { slots })
    }

    fn active_slot(&self) -> usize {
        match (&self.slots[0], &self.slots[1]) {
            (Some(a), Some(b)) if b.sequence_number > a.sequence_number => 1,
            (Some(_), _) => 0,
            (None, _) => 1,
        }
    }

    /// The header currently in charge.
    pub(crate) fn current(&self) -> &Header {
        // `read`/`initialize` guarantee at least one slot is populated.
        self.slots[self.active_slot()]
            .as_ref()
            .or(self.slots[0].as_ref())
            .unwrap_or_else(|| unreachable!("header pair without a valid slot"))
    }

    /// Commits `header` as the next generation.
    ///
    /// Prior writes are synced first, the header goes to the inactive slot
    /// with the next sequence number, and the storage is synced again. Only
    /// then does the new header become current.
    pub(crate) fn commit<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        mut header: Header,
    ) -> Result<()> {
        let active = self.active_slot();
        let target = 1 - active;
        header.sequence_number = self.current().sequence_number + 1;

        storage.sync()?;
        write_all_at(storage, HEADER_OFFSETS[target], &header.to_bytes())?;
        storage.sync()?;

        debug!(
            "Committed header slot {} with sequence {}",
            target + 1,
            header.sequence_number
        );
        self.slots[target] = Some(header);
        Ok(())
    }
}
