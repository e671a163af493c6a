//! Write-ahead log.
//!
//! Every metadata update (BAT pages, sector bitmap pages) is first written to
//! the circular log as one entry, synced, and only then applied to its final
//! location. On open, entries left behind by an interrupted session are
//! replayed before anything else in the file is trusted.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use uuid::Uuid;

use super::header::{Header, HeaderPair};
use super::storage::{read_exact_at, write_all_at, write_zeroes_at, Storage};
use super::{
    align_up, checksum_with_hole, le_u32, le_u64, put_u32, put_u64, read_guid, seal_checksum,
    write_guid, LOG_SECTOR_SIZE,
};
use crate::error::{DiskError, Result};

const ENTRY_SIGNATURE: &[u8; 4] = b"loge";
const ZERO_SIGNATURE: &[u8; 4] = b"zero";
const DESCRIPTOR_SIGNATURE: &[u8; 4] = b"desc";
const DATA_SIGNATURE: &[u8; 4] = b"data";

const ENTRY_HEADER_SIZE: usize = 64;
const DESCRIPTOR_SIZE: usize = 32;
const SECTOR: usize = LOG_SECTOR_SIZE as usize;

/// One update carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Descriptor {
    /// A full 4 KiB page to write at `file_offset`.
    Data { file_offset: u64, page: Vec<u8> },
    /// `length` zero bytes to write at `file_offset`.
    Zero { file_offset: u64, length: u64 },
}

/// A validated log entry found during the scan.
#[derive(Debug, Clone)]
struct LogEntry {
    offset: u64,
    length: u64,
    tail: u64,
    sequence: u64,
    flushed_file_offset: u64,
    last_file_offset: u64,
    descriptors: Vec<Descriptor>,
}

impl LogEntry {
    /// Parses the entry at `offset` of `log`. `None` marks anything that is
    /// not a complete entry of the session identified by `guid`.
    fn parse(log: &[u8], offset: usize, guid: &Uuid) -> Option<Self> {
        let raw = log.get(offset..offset + SECTOR)?;
        if &raw[0..4] != ENTRY_SIGNATURE {
            return None;
        }
        let length = le_u32(raw, 8) as usize;
        if length < SECTOR || length % SECTOR != 0 || offset + length > log.len() {
            return None;
        }
        let tail = le_u32(raw, 12) as u64;
        if tail as usize >= log.len() || tail % LOG_SECTOR_SIZE != 0 {
            return None;
        }
        if &read_guid(raw, 32) != guid {
            return None;
        }

        let entry = &log[offset..offset + length];
        if le_u32(entry, 4) != checksum_with_hole(entry, 4) {
            return None;
        }

        let sequence = le_u64(entry, 16);
        let count = le_u32(entry, 24) as usize;
        let descriptor_area = align_up(
            (ENTRY_HEADER_SIZE + count * DESCRIPTOR_SIZE) as u64,
            LOG_SECTOR_SIZE,
        ) as usize;
        if descriptor_area > length {
            return None;
        }

        let mut descriptors = Vec::with_capacity(count);
        let mut data_sector = descriptor_area;
        for i in 0..count {
            let d = &entry[ENTRY_HEADER_SIZE + i * DESCRIPTOR_SIZE..][..DESCRIPTOR_SIZE];
            if le_u64(d, 24) != sequence {
                return None;
            }
            let file_offset = le_u64(d, 16);
            if file_offset % LOG_SECTOR_SIZE != 0 {
                return None;
            }
            match &d[0..4] {
                s if s == ZERO_SIGNATURE => {
                    let length = le_u64(d, 8);
                    if length % LOG_SECTOR_SIZE != 0 {
                        return None;
                    }
                    descriptors.push(Descriptor::Zero {
                        file_offset,
                        length,
                    });
                }
                s if s == DESCRIPTOR_SIGNATURE => {
                    let sector = entry.get(data_sector..data_sector + SECTOR)?;
                    data_sector += SECTOR;
                    if &sector[0..4] != DATA_SIGNATURE
                        || le_u32(sector, 4) != (sequence >> 32) as u32
                        || le_u32(sector, SECTOR - 4) != sequence as u32
                    {
                        return None;
                    }
                    let mut page = vec![0u8; SECTOR];
                    page[0..8].copy_from_slice(&d[8..16]);
                    page[8..SECTOR - 4].copy_from_slice(&sector[8..SECTOR - 4]);
                    page[SECTOR - 4..].copy_from_slice(&d[4..8]);
                    descriptors.push(Descriptor::Data { file_offset, page });
                }
                _ => return None,
            }
        }
        if data_sector != length {
            return None;
        }

        Some(Self {
            offset: offset as u64,
            length: length as u64,
            tail,
            sequence,
            flushed_file_offset: le_u64(entry, 48),
            last_file_offset: le_u64(entry, 56),
            descriptors,
        })
    }
}

fn apply<S: Storage + ?Sized>(storage: &mut S, descriptors: &[Descriptor]) -> Result<()> {
    for descriptor in descriptors {
        match descriptor {
            Descriptor::Data { file_offset, page } => {
                write_all_at(storage, *file_offset, page)?;
            }
            Descriptor::Zero {
                file_offset,
                length,
            } => {
                write_zeroes_at(storage, *file_offset, *length)?;
            }
        }
    }
    Ok(())
}

/// Serializes one entry.
fn encode_entry(
    guid: &Uuid,
    sequence: u64,
    tail: u64,
    file_len: u64,
    descriptors: &[Descriptor],
) -> Vec<u8> {
    let descriptor_area = align_up(
        (ENTRY_HEADER_SIZE + descriptors.len() * DESCRIPTOR_SIZE) as u64,
        LOG_SECTOR_SIZE,
    ) as usize;
    let data_count = descriptors
        .iter()
        .filter(|d| matches!(d, Descriptor::Data { .. }))
        .count();
    let length = descriptor_area + data_count * SECTOR;

    let mut raw = vec![0u8; length];
    raw[0..4].copy_from_slice(ENTRY_SIGNATURE);
    put_u32(&mut raw, 8, length as u32);
    put_u32(&mut raw, 12, tail as u32);
    put_u64(&mut raw, 16, sequence);
    put_u32(&mut raw, 24, descriptors.len() as u32);
    write_guid(&mut raw, 32, guid);
    put_u64(&mut raw, 48, file_len);
    put_u64(&mut raw, 56, file_len);

    let mut data_sector = descriptor_area;
    for (i, descriptor) in descriptors.iter().enumerate() {
        let at = ENTRY_HEADER_SIZE + i * DESCRIPTOR_SIZE;
        match descriptor {
            Descriptor::Zero {
                file_offset,
                length,
            } => {
                raw[at..at + 4].copy_from_slice(ZERO_SIGNATURE);
                put_u64(&mut raw, at + 8, *length);
                put_u64(&mut raw, at + 16, *file_offset);
            }
            Descriptor::Data { file_offset, page } => {
                raw[at..at + 4].copy_from_slice(DESCRIPTOR_SIGNATURE);
                raw[at + 4..at + 8].copy_from_slice(&page[SECTOR - 4..]);
                raw[at + 8..at + 16].copy_from_slice(&page[0..8]);
                put_u64(&mut raw, at + 16, *file_offset);

                let sector = &mut raw[data_sector..data_sector + SECTOR];
                sector[0..4].copy_from_slice(DATA_SIGNATURE);
                put_u32(sector, 4, (sequence >> 32) as u32);
                sector[8..SECTOR - 4].copy_from_slice(&page[8..SECTOR - 4]);
                put_u32(sector, SECTOR - 4, sequence as u32);
                data_sector += SECTOR;
            }
        }
        put_u64(&mut raw, at + 24, sequence);
    }
    seal_checksum(&mut raw, 4);
    raw
}

/// A group of updates committed atomically.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    descriptors: Vec<Descriptor>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a 4 KiB page write.
    pub(crate) fn write_page(&mut self, file_offset: u64, page: Vec<u8>) {
        debug_assert_eq!(page.len(), SECTOR);
        self.descriptors.push(Descriptor::Data { file_offset, page });
    }

    pub(crate) fn write_pages(&mut self, pages: Vec<(u64, Vec<u8>)>) {
        for (file_offset, page) in pages {
            self.write_page(file_offset, page);
        }
    }

    /// Adds a zero fill of `length` bytes (a 4 KiB multiple).
    pub(crate) fn zero(&mut self, file_offset: u64, length: u64) {
        self.descriptors.push(Descriptor::Zero {
            file_offset,
            length,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Appends entries to the log of one write session.
#[derive(Debug)]
pub(crate) struct LogWriter {
    log_offset: u64,
    log_length: u64,
    guid: Uuid,
    head: u64,
    sequence: u64,
}

impl LogWriter {
    /// Starts a writer for the session whose log GUID is in `header`.
    pub(crate) fn new(header: &Header) -> Result<Self> {
        if header.log_length == 0 {
            return Err(DiskError::format("container has no log region"));
        }
        Ok(Self {
            log_offset: header.log_offset,
            log_length: header.log_length as u64,
            guid: header.log_guid,
            head: 0,
            sequence: 1,
        })
    }

    /// Writes `txn` to the log and syncs it, without applying it.
    fn write_entry<S: Storage + ?Sized>(&mut self, storage: &mut S, txn: &Transaction) -> Result<()> {
        let file_len = storage.storage_len()?;
        // Each entry is self-contained: every earlier entry has been applied
        // and flushed by the time this one is written.
        let mut offset = self.head;
        let sized = encode_entry(&self.guid, self.sequence, 0, file_len, &txn.descriptors);
        if sized.len() as u64 > self.log_length {
            return Err(DiskError::format(format!(
                "log entry of {} bytes exceeds the {} byte log",
                sized.len(),
                self.log_length
            )));
        }
        if offset + sized.len() as u64 > self.log_length {
            offset = 0;
        }
        let raw = encode_entry(&self.guid, self.sequence, offset, file_len, &txn.descriptors);

        write_all_at(storage, self.log_offset + offset, &raw)?;
        storage.sync()?;
        debug!(
            "Log entry {} written at 0x{:x} ({} descriptors)",
            self.sequence,
            offset,
            txn.descriptors.len()
        );
        self.head = offset + raw.len() as u64;
        self.sequence += 1;
        Ok(())
    }

    /// Commits `txn`: log, sync, apply, sync.
    pub(crate) fn commit<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        txn: Transaction,
    ) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        self.write_entry(storage, &txn)?;
        apply(storage, &txn.descriptors)?;
        storage.sync()?;
        Ok(())
    }
}

/// Finds the entries ending at `head`, walking from its tail. `None` when the
/// walk breaks.
fn sequence_ending_at<'a>(
    entries: &'a BTreeMap<u64, LogEntry>,
    head: &'a LogEntry,
    log_length: u64,
) -> Option<Vec<&'a LogEntry>> {
    let mut chain: Vec<&LogEntry> = Vec::new();
    let mut entry = entries.get(&head.tail)?;
    for _ in 0..entries.len() {
        chain.push(entry);
        if entry.offset == head.offset {
            return (entry.sequence == head.sequence).then_some(chain);
        }
        let expected = entry.sequence + 1;
        let next = entry.offset + entry.length;
        // A writer that could not fit the next entry before the end of the
        // log placed it at offset 0.
        entry = [next, 0]
            .into_iter()
            .filter(|&off| off < log_length)
            .filter_map(|off| entries.get(&off))
            .find(|e| e.sequence == expected)?;
    }
    None
}

/// Replays the log if the current header names one, then clears it.
///
/// Returns the number of entries applied. Corrupt or torn entries are not
/// errors; they end the valid part of the log.
pub(crate) fn replay<S: Storage + ?Sized>(
    storage: &mut S,
    headers: &mut HeaderPair,
) -> Result<usize> {
    let header = headers.current().clone();
    if header.log_guid.is_nil() {
        return Ok(0);
    }
    let log_length = header.log_length as u64;
    let mut log = vec![0u8; log_length as usize];
    read_exact_at(storage, header.log_offset, &mut log)
        .map_err(|e| DiskError::format(format!("log region unreadable: {e}")))?;

    let mut entries = BTreeMap::new();
    for offset in (0..log.len()).step_by(SECTOR) {
        if let Some(entry) = LogEntry::parse(&log, offset, &header.log_guid) {
            entries.insert(entry.offset, entry);
        }
    }
    debug!("Log scan found {} valid entries", entries.len());

    let mut candidates: Vec<&LogEntry> = entries.values().collect();
    candidates.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    let mut chosen = None;
    for head in candidates {
        match sequence_ending_at(&entries, head, log_length) {
            Some(chain) => {
                chosen = Some((head, chain));
                break;
            }
            None => warn!(
                "Discarding log entry {} at 0x{:x}: sequence is incomplete",
                head.sequence, head.offset
            ),
        }
    }

    let mut applied = 0;
    if let Some((head, chain)) = chosen {
        for entry in &chain {
            apply(storage, &entry.descriptors)?;
        }
        applied = chain.len();

        let file_len = storage.storage_len()?;
        if file_len < head.flushed_file_offset {
            return Err(DiskError::format(format!(
                "file is {} bytes, log expects at least {}",
                file_len, head.flushed_file_offset
            )));
        }
        if file_len < head.last_file_offset {
            storage.set_len(head.last_file_offset)?;
        }
        storage.sync()?;
        info!(
            "Replayed {} log entries (sequence {} to {})",
            applied,
            chain[0].sequence,
            head.sequence
        );
    } else {
        debug!("Log names a session but holds no complete entry");
    }

    write_zeroes_at(storage, header.log_offset, log_length)?;
    storage.sync()?;
    let mut cleared = header;
    cleared.log_guid = Uuid::nil();
    headers.commit(storage, cleared)?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhdx::header::write_file_identifier;
    use crate::vhdx::MIB;
    use std::io::Cursor;

    const TARGET: u64 = 3 * MIB;

    fn session() -> (Cursor<Vec<u8>>, HeaderPair, LogWriter) {
        let mut storage = Cursor::new(vec![0u8; 4 * MIB as usize]);
        write_file_identifier(&mut storage).unwrap();
        let mut headers =
            HeaderPair::initialize(&mut storage, &Header::new(MIB, MIB as u32)).unwrap();
        let mut header = headers.current().clone();
        header.log_guid = Uuid::new_v4();
        headers.commit(&mut storage, header).unwrap();
        let writer = LogWriter::new(headers.current()).unwrap();
        (storage, headers, writer)
    }

    fn page(fill: u8) -> Vec<u8> {
        let mut page = vec![fill; SECTOR];
        page[0] = 0xA1;
        page[SECTOR - 1] = 0xB2;
        page
    }

    fn txn(offset: u64, fill: u8) -> Transaction {
        let mut txn = Transaction::new();
        txn.write_page(offset, page(fill));
        txn
    }

    fn at(storage: &Cursor<Vec<u8>>, offset: u64) -> &[u8] {
        &storage.get_ref()[offset as usize..offset as usize + SECTOR]
    }

    #[test]
    fn unapplied_entry_is_replayed_and_log_cleared() {
        let (mut storage, mut headers, mut writer) = session();
        writer.write_entry(&mut storage, &txn(TARGET, 0x11)).unwrap();
        assert_ne!(at(&storage, TARGET), page(0x11).as_slice());

        assert_eq!(replay(&mut storage, &mut headers).unwrap(), 1);
        assert_eq!(at(&storage, TARGET), page(0x11).as_slice());
        assert!(headers.current().log_guid.is_nil());
        let reread = HeaderPair::read(&mut storage).unwrap();
        assert!(reread.current().log_guid.is_nil());
        assert!(storage.get_ref()[MIB as usize..2 * MIB as usize]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn torn_entry_bounds_the_replay() {
        let (mut storage, mut headers, mut writer) = session();
        writer.write_entry(&mut storage, &txn(TARGET, 0x22)).unwrap();
        let second = writer.head;
        writer
            .write_entry(&mut storage, &txn(TARGET + LOG_SECTOR_SIZE, 0x33))
            .unwrap();
        // Corrupt the data sector of the second entry.
        storage.get_mut()[(MIB + second) as usize + SECTOR + 100] ^= 0xFF;

        assert_eq!(replay(&mut storage, &mut headers).unwrap(), 1);
        assert_eq!(at(&storage, TARGET), page(0x22).as_slice());
        assert!(at(&storage, TARGET + LOG_SECTOR_SIZE).iter().all(|&b| b == 0));
    }

    #[test]
    fn replay_is_idempotent() {
        let (mut storage, mut headers, mut writer) = session();
        let mut t = txn(TARGET, 0x44);
        t.zero(TARGET + LOG_SECTOR_SIZE, 2 * LOG_SECTOR_SIZE);
        storage.get_mut()[(TARGET + LOG_SECTOR_SIZE) as usize] = 0x99;
        writer.commit(&mut storage, t).unwrap();
        assert_eq!(storage.get_ref()[(TARGET + LOG_SECTOR_SIZE) as usize], 0);

        let before = storage.get_ref().clone();
        assert_eq!(replay(&mut storage, &mut headers).unwrap(), 1);
        let once = storage.get_ref()[2 * MIB as usize..].to_vec();
        assert_eq!(once, before[2 * MIB as usize..].to_vec());
        assert_eq!(replay(&mut storage, &mut headers).unwrap(), 0);
        assert_eq!(storage.get_ref()[2 * MIB as usize..].to_vec(), once);
    }

    #[test]
    fn entries_of_another_session_are_ignored() {
        let (mut storage, mut headers, mut writer) = session();
        writer.guid = Uuid::new_v4();
        writer.write_entry(&mut storage, &txn(TARGET, 0x55)).unwrap();
        assert_eq!(replay(&mut storage, &mut headers).unwrap(), 0);
        assert!(at(&storage, TARGET).iter().all(|&b| b == 0));
    }

    #[test]
    fn writer_wraps_to_start_of_log() {
        let (mut storage, mut headers, mut writer) = session();
        // Each entry is 8 KiB; 128 of them fill the 1 MiB log exactly.
        for i in 0..130u64 {
            writer
                .commit(&mut storage, txn(TARGET + (i % 4) * LOG_SECTOR_SIZE, i as u8))
                .unwrap();
        }
        assert_eq!(writer.head, 2 * 2 * LOG_SECTOR_SIZE);
        writer.write_entry(&mut storage, &txn(TARGET, 0xEE)).unwrap();
        assert_eq!(replay(&mut storage, &mut headers).unwrap(), 1);
        assert_eq!(at(&storage, TARGET), page(0xEE).as_slice());
    }

    #[test]
    fn log_shorter_than_flushed_offset_is_a_format_error() {
        let (mut storage, mut headers, mut writer) = session();
        writer.write_entry(&mut storage, &txn(TARGET, 0x66)).unwrap();
        Storage::set_len(&mut storage, 3 * MIB + 2 * LOG_SECTOR_SIZE).unwrap();
        assert!(matches!(
            replay(&mut storage, &mut headers),
            Err(DiskError::Format(_))
        ));
    }
}
