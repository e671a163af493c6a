//! Block allocation table.
//!
//! The BAT maps every payload block of the virtual disk to a file offset and
//! a state. Sector-bitmap entries are interleaved with payload entries: after
//! `chunk_ratio` payload entries comes the bitmap entry of that chunk.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::region::RegionEntry;
use super::storage::{read_exact_at, write_all_at, Storage};
use super::{align_up, LOG_SECTOR_SIZE, MIB};
use crate::error::{DiskError, Result};

const STATE_MASK: u64 = 0x7;
const FILE_OFFSET_SHIFT: u32 = 20;
const ENTRY_SIZE: u64 = 8;
const ENTRIES_PER_PAGE: u64 = LOG_SECTOR_SIZE / ENTRY_SIZE;

/// Size of one sector bitmap block.
pub(crate) const SECTOR_BITMAP_BLOCK_SIZE: u64 = MIB;

/// State of a payload block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadBlockState {
    NotPresent = 0,
    Undefined = 1,
    Zero = 2,
    Unmapped = 3,
    FullyPresent = 6,
    PartiallyPresent = 7,
}

impl PayloadBlockState {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::NotPresent),
            1 => Some(Self::Undefined),
            2 => Some(Self::Zero),
            3 => Some(Self::Unmapped),
            6 => Some(Self::FullyPresent),
            7 => Some(Self::PartiallyPresent),
            _ => None,
        }
    }

    /// True when the block has file space behind it.
    pub fn is_allocated(self) -> bool {
        matches!(self, Self::FullyPresent | Self::PartiallyPresent)
    }
}

/// State of a sector bitmap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectorBitmapState {
    NotPresent = 0,
    Present = 6,
}

impl SectorBitmapState {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::NotPresent),
            6 => Some(Self::Present),
            _ => None,
        }
    }
}

/// Raw 64-bit BAT entry: state in bits 0-2, file offset in MiB in bits 20-63.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatEntry(u64);

impl BatEntry {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn payload(state: PayloadBlockState, file_offset: u64) -> Self {
        Self::with_state(state as u8, file_offset)
    }

    pub fn sector_bitmap(state: SectorBitmapState, file_offset: u64) -> Self {
        Self::with_state(state as u8, file_offset)
    }

    fn with_state(state: u8, file_offset: u64) -> Self {
        debug_assert_eq!(file_offset % MIB, 0);
        Self((file_offset / MIB) << FILE_OFFSET_SHIFT | state as u64)
    }

    pub fn state_bits(self) -> u8 {
        (self.0 & STATE_MASK) as u8
    }

    pub fn file_offset_mb(self) -> u64 {
        self.0 >> FILE_OFFSET_SHIFT
    }

    pub fn file_offset(self) -> u64 {
        self.file_offset_mb() * MIB
    }

    /// Payload interpretation. Entries are checked when the BAT is loaded, so
    /// unknown bits only show up on raw values built by callers.
    pub fn payload_state(self) -> PayloadBlockState {
        PayloadBlockState::from_bits(self.state_bits()).unwrap_or(PayloadBlockState::Undefined)
    }

    pub fn bitmap_state(self) -> SectorBitmapState {
        SectorBitmapState::from_bits(self.state_bits()).unwrap_or(SectorBitmapState::NotPresent)
    }
}

/// Geometry of the BAT, derived from the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatLayout {
    pub(crate) block_size: u64,
    pub(crate) logical_sector_size: u64,
    pub(crate) chunk_ratio: u64,
    pub(crate) data_blocks: u64,
    pub(crate) total_entries: u64,
    pub(crate) has_parent: bool,
}

impl BatLayout {
    pub(crate) fn new(
        capacity: u64,
        block_size: u32,
        logical_sector_size: u32,
        has_parent: bool,
    ) -> Self {
        let block_size = block_size as u64;
        let logical_sector_size = logical_sector_size as u64;
        let chunk_ratio = (1u64 << 23) * logical_sector_size / block_size;
        let data_blocks = capacity.div_ceil(block_size);
        let total_entries = if has_parent {
            data_blocks.div_ceil(chunk_ratio) * (chunk_ratio + 1)
        } else {
            data_blocks + data_blocks.saturating_sub(1) / chunk_ratio
        };
        Self {
            block_size,
            logical_sector_size,
            chunk_ratio,
            data_blocks,
            total_entries,
            has_parent,
        }
    }

    /// Size of the BAT region, rounded up to 1 MiB.
    pub(crate) fn region_length(&self) -> u64 {
        align_up((self.total_entries * ENTRY_SIZE).max(1), MIB)
    }

    pub(crate) fn sectors_per_block(&self) -> u64 {
        self.block_size / self.logical_sector_size
    }

    pub(crate) fn payload_index(&self, block: u64) -> u64 {
        block + block / self.chunk_ratio
    }

    pub(crate) fn chunk_of(&self, block: u64) -> u64 {
        block / self.chunk_ratio
    }

    pub(crate) fn bitmap_index(&self, chunk: u64) -> u64 {
        chunk * (self.chunk_ratio + 1) + self.chunk_ratio
    }

    fn is_bitmap_index(&self, index: u64) -> bool {
        (index + 1) % (self.chunk_ratio + 1) == 0
    }

    /// Position of the presence bit for `sector` of `block` inside its
    /// chunk's sector bitmap: byte offset and bit mask.
    pub(crate) fn sector_bit(&self, block: u64, sector: u64) -> (u64, u8) {
        let bit = (block % self.chunk_ratio) * self.sectors_per_block() + sector;
        (bit / 8, 1u8 << (bit % 8))
    }
}

/// A pending `(table index, new entry)` change.
pub(crate) type BatUpdate = (u64, BatEntry);

/// In-memory copy of the BAT region.
#[derive(Debug, Clone)]
pub(crate) struct Bat {
    layout: BatLayout,
    file_offset: u64,
    entries: Vec<BatEntry>,
}

impl Bat {
    /// Builds a BAT whose payload entries come from `payload` and whose
    /// bitmap entries are all NOT_PRESENT.
    pub(crate) fn build(
        layout: BatLayout,
        file_offset: u64,
        mut payload: impl FnMut(u64) -> BatEntry,
    ) -> Self {
        let mut entries = vec![BatEntry::default(); layout.total_entries as usize];
        for block in 0..layout.data_blocks {
            entries[layout.payload_index(block) as usize] = payload(block);
        }
        Self {
            layout,
            file_offset,
            entries,
        }
    }

    /// Loads and checks the BAT from `region`.
    pub(crate) fn read<S: Storage + ?Sized>(
        storage: &mut S,
        region: &RegionEntry,
        layout: BatLayout,
    ) -> Result<Self> {
        let byte_len = layout.total_entries * ENTRY_SIZE;
        if byte_len > region.length as u64 {
            return Err(DiskError::format(format!(
                "BAT region holds {} bytes, {} entries need {}",
                region.length, layout.total_entries, byte_len
            )));
        }
        let mut raw = vec![0u8; byte_len as usize];
        read_exact_at(storage, region.file_offset, &mut raw)?;

        let entries: Vec<BatEntry> = raw
            .chunks_exact(ENTRY_SIZE as usize)
            .map(|c| {
                let mut word = [0u8; 8];
                word.copy_from_slice(c);
                BatEntry(u64::from_le_bytes(word))
            })
            .collect();

        for (index, entry) in entries.iter().enumerate() {
            let index = index as u64;
            let bits = entry.state_bits();
            if layout.is_bitmap_index(index) {
                let Some(state) = SectorBitmapState::from_bits(bits) else {
                    return Err(DiskError::format(format!(
                        "BAT entry {index}: invalid sector bitmap state {bits}"
                    )));
                };
                if state == SectorBitmapState::Present && entry.file_offset_mb() == 0 {
                    return Err(DiskError::format(format!(
                        "BAT entry {index}: present sector bitmap without offset"
                    )));
                }
                continue;
            }
            let Some(state) = PayloadBlockState::from_bits(bits) else {
                return Err(DiskError::format(format!(
                    "BAT entry {index}: invalid payload state {bits}"
                )));
            };
            if state == PayloadBlockState::PartiallyPresent && !layout.has_parent {
                return Err(DiskError::format(format!(
                    "BAT entry {index}: partially present block without parent"
                )));
            }
            if state.is_allocated() && entry.file_offset_mb() == 0 {
                return Err(DiskError::format(format!(
                    "BAT entry {index}: allocated block without offset"
                )));
            }
        }

        Ok(Self {
            layout,
            file_offset: region.file_offset,
            entries,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|e| e.0.to_le_bytes())
            .collect()
    }

    /// Writes the whole table, zero-padded to the region length.
    pub(crate) fn write<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<()> {
        let mut raw = self.to_bytes();
        raw.resize(self.layout.region_length() as usize, 0);
        write_all_at(storage, self.file_offset, &raw)?;
        Ok(())
    }

    pub(crate) fn layout(&self) -> &BatLayout {
        &self.layout
    }

    pub(crate) fn payload(&self, block: u64) -> BatEntry {
        self.entries[self.layout.payload_index(block) as usize]
    }

    pub(crate) fn sector_bitmap(&self, chunk: u64) -> BatEntry {
        self.entries[self.layout.bitmap_index(chunk) as usize]
    }

    pub(crate) fn payload_update(&self, block: u64, entry: BatEntry) -> BatUpdate {
        (self.layout.payload_index(block), entry)
    }

    pub(crate) fn bitmap_update(&self, chunk: u64, entry: BatEntry) -> BatUpdate {
        (self.layout.bitmap_index(chunk), entry)
    }

    /// The 4 KiB pages covering `updates`, as `(file offset, bytes)`, with
    /// the updates applied on top of the in-memory table. The table itself
    /// is left unchanged until [`Bat::apply`].
    pub(crate) fn pages(&self, updates: &[BatUpdate]) -> Vec<(u64, Vec<u8>)> {
        let pages: BTreeSet<u64> = updates
            .iter()
            .map(|(index, _)| index / ENTRIES_PER_PAGE)
            .collect();
        pages
            .into_iter()
            .map(|page| {
                let first = page * ENTRIES_PER_PAGE;
                let last = (first + ENTRIES_PER_PAGE).min(self.entries.len() as u64);
                let mut raw: Vec<u8> = (first..last)
                    .flat_map(|index| {
                        let entry = updates
                            .iter()
                            .rev()
                            .find(|(i, _)| *i == index)
                            .map(|(_, e)| *e)
                            .unwrap_or(self.entries[index as usize]);
                        entry.0.to_le_bytes()
                    })
                    .collect();
                raw.resize(LOG_SECTOR_SIZE as usize, 0);
                (self.file_offset + page * LOG_SECTOR_SIZE, raw)
            })
            .collect()
    }

    /// Makes committed updates visible.
    pub(crate) fn apply(&mut self, updates: &[BatUpdate]) {
        for &(index, entry) in updates {
            self.entries[index as usize] = entry;
        }
    }

    /// Number of payload blocks with file space behind them.
    pub(crate) fn allocated_blocks(&self) -> u64 {
        (0..self.layout.data_blocks)
            .filter(|&b| self.payload(b).payload_state().is_allocated())
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhdx::BAT_REGION_GUID;
    use std::io::Cursor;

    #[test]
    fn entry_bit_layout() {
        let entry = BatEntry::payload(PayloadBlockState::FullyPresent, 5 * MIB);
        assert_eq!(entry.raw(), (5 << 20) | 6);
        assert_eq!(entry.file_offset(), 5 * MIB);
        assert_eq!(entry.payload_state(), PayloadBlockState::FullyPresent);
        assert_eq!(BatEntry::default().payload_state(), PayloadBlockState::NotPresent);
    }

    #[test]
    fn chunk_ratio_and_entry_counts() {
        let layout = BatLayout::new(128 * MIB, 32 * MIB as u32, 512, false);
        assert_eq!(layout.chunk_ratio, 128);
        assert_eq!(layout.data_blocks, 4);
        assert_eq!(layout.total_entries, 4);
        assert_eq!(layout.region_length(), MIB);

        let diff = BatLayout::new(128 * MIB, 32 * MIB as u32, 512, true);
        assert_eq!(diff.total_entries, 129);

        let large = BatLayout::new(MIB, MIB as u32, 4096, false);
        assert_eq!(large.chunk_ratio, 32768);
    }

    #[test]
    fn entries_are_interleaved_with_bitmaps() {
        // 256 MiB blocks with 512-byte sectors: 16 blocks per chunk.
        let layout = BatLayout::new(40 * 256 * MIB, 256 * MIB as u32, 512, false);
        assert_eq!(layout.chunk_ratio, 16);
        assert_eq!(layout.payload_index(15), 15);
        assert_eq!(layout.bitmap_index(0), 16);
        assert_eq!(layout.payload_index(16), 17);
        assert!(layout.is_bitmap_index(33));
        // 40 blocks, two interleaved bitmap entries.
        assert_eq!(layout.total_entries, 42);
    }

    #[test]
    fn sector_bit_is_lsb_first_within_chunk() {
        let layout = BatLayout::new(64 * MIB, 2 * MIB as u32, 512, true);
        // 4096 sectors per block.
        assert_eq!(layout.sector_bit(0, 0), (0, 0x01));
        assert_eq!(layout.sector_bit(0, 9), (1, 0x02));
        assert_eq!(layout.sector_bit(1, 0), (512, 0x01));
    }

    #[test]
    fn read_rejects_invalid_state() {
        let layout = BatLayout::new(128 * MIB, 32 * MIB as u32, 512, false);
        let region = RegionEntry {
            guid: BAT_REGION_GUID,
            file_offset: 0,
            length: MIB as u32,
            is_required: true,
        };
        let mut storage = Cursor::new(vec![0u8; MIB as usize]);
        Bat::build(layout, 0, |_| BatEntry::default())
            .write(&mut storage)
            .unwrap();
        assert!(Bat::read(&mut storage, &region, layout).is_ok());

        storage.get_mut()[8] = 4;
        assert!(matches!(
            Bat::read(&mut storage, &region, layout),
            Err(DiskError::Format(_))
        ));
    }

    #[test]
    fn pages_cover_mutated_entries_once() {
        let layout = BatLayout::new(2048 * MIB, MIB as u32, 512, false);
        let mut bat = Bat::build(layout, 3 * MIB, |_| BatEntry::default());
        let updates = [
            bat.payload_update(1, BatEntry::payload(PayloadBlockState::FullyPresent, 8 * MIB)),
            bat.payload_update(2, BatEntry::payload(PayloadBlockState::FullyPresent, 9 * MIB)),
            bat.payload_update(1500, BatEntry::payload(PayloadBlockState::Zero, 0)),
        ];
        let pages = bat.pages(&updates);
        assert_eq!(bat.allocated_blocks(), 0);
        bat.apply(&updates);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].0, 3 * MIB);
        assert_eq!(pages[0].1.len(), LOG_SECTOR_SIZE as usize);
        assert_eq!(pages[0].1[8], 6);
        let second = 3 * MIB + (layout.payload_index(1500) / ENTRIES_PER_PAGE) * LOG_SECTOR_SIZE;
        assert_eq!(pages[1].0, second);
        assert_eq!(bat.allocated_blocks(), 2);
    }
}
