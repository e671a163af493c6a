//! Block translation: the virtual disk as a random-access byte stream.
//!
//! Requests are split at block boundaries. Each piece is resolved through the
//! BAT state of its block and, for differencing disks, the sector bitmap of
//! its chunk; unresolved pieces fall through to the parent chain.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::trace;

use super::bat::{
    BatEntry, BatUpdate, PayloadBlockState, SectorBitmapState, SECTOR_BITMAP_BLOCK_SIZE,
};
use super::file::VhdxFile;
use super::log::Transaction;
use super::parent::ParentChain;
use super::storage::Storage;
use super::LOG_SECTOR_SIZE;
use crate::error::{checked_range, DiskError, Result};
use crate::progress::{self, ProgressSink};

type Parents = [VhdxFile<Box<dyn Storage>>];

/// Splits `[offset, offset + len)` at block boundaries, yielding
/// `(block, offset within block, piece length, offset within request)`.
fn segments(offset: u64, len: usize, block_size: u64) -> impl Iterator<Item = (u64, u64, usize, usize)> {
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let pos = offset + done as u64;
        let within = pos % block_size;
        let piece = ((block_size - within) as usize).min(len - done);
        let item = (pos / block_size, within, piece, done);
        done += piece;
        Some(item)
    })
}

fn read_parent(parents: &mut Parents, offset: u64, buf: &mut [u8]) -> Result<()> {
    match parents.split_first_mut() {
        Some((parent, rest)) => read_layered(parent, rest, offset, buf),
        None => {
            buf.fill(0);
            Ok(())
        }
    }
}

/// Reads `buf.len()` bytes at virtual `offset` of `layer`, falling through
/// to `parents` where the layer holds no data.
pub(crate) fn read_layered<S: Storage>(
    layer: &mut VhdxFile<S>,
    parents: &mut Parents,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let block_size = layer.layout().block_size;
    for (block, within, len, at) in segments(offset, buf.len(), block_size) {
        let piece = &mut buf[at..at + len];
        let pos = offset + at as u64;
        let entry = layer.bat().payload(block);
        match entry.payload_state() {
            PayloadBlockState::FullyPresent => layer.read_raw(entry.file_offset() + within, piece)?,
            PayloadBlockState::PartiallyPresent => {
                read_partial(layer, parents, block, entry, within, pos, piece)?
            }
            PayloadBlockState::NotPresent if !layer.has_parent() => piece.fill(0),
            PayloadBlockState::NotPresent | PayloadBlockState::Unmapped => {
                read_parent(parents, pos, piece)?
            }
            PayloadBlockState::Undefined | PayloadBlockState::Zero => piece.fill(0),
        }
    }
    Ok(())
}

/// Presence bit of each sector in `[first, first + count)` of `block`.
fn sector_presence<S: Storage>(
    layer: &mut VhdxFile<S>,
    block: u64,
    first: u64,
    count: u64,
) -> Result<Vec<bool>> {
    let layout = *layer.layout();
    let bitmap = layer.bat().sector_bitmap(layout.chunk_of(block));
    if bitmap.bitmap_state() != SectorBitmapState::Present {
        return Ok(vec![false; count as usize]);
    }
    let (first_byte, _) = layout.sector_bit(block, first);
    let (last_byte, _) = layout.sector_bit(block, first + count - 1);
    let mut bits = vec![0u8; (last_byte - first_byte + 1) as usize];
    layer.read_raw(bitmap.file_offset() + first_byte, &mut bits)?;
    Ok((first..first + count)
        .map(|sector| {
            let (byte, mask) = layout.sector_bit(block, sector);
            bits[(byte - first_byte) as usize] & mask != 0
        })
        .collect())
}

fn read_partial<S: Storage>(
    layer: &mut VhdxFile<S>,
    parents: &mut Parents,
    block: u64,
    entry: BatEntry,
    within: u64,
    pos: u64,
    buf: &mut [u8],
) -> Result<()> {
    let sector_size = layer.layout().logical_sector_size;
    let first = within / sector_size;
    let last = (within + buf.len() as u64 - 1) / sector_size;
    let presence = sector_presence(layer, block, first, last - first + 1)?;

    // Walk runs of sectors with the same presence.
    let mut done = 0usize;
    while done < buf.len() {
        let here = within + done as u64;
        let present = presence[(here / sector_size - first) as usize];
        let mut end = (here / sector_size + 1) * sector_size;
        while end < within + buf.len() as u64
            && presence[(end / sector_size - first) as usize] == present
        {
            end += sector_size;
        }
        let run = ((end - here) as usize).min(buf.len() - done);
        let piece = &mut buf[done..done + run];
        if present {
            layer.read_raw(entry.file_offset() + here, piece)?;
        } else {
            read_parent(parents, pos + done as u64, piece)?;
        }
        done += run;
    }
    Ok(())
}

/// Writes `data` at virtual `offset`, allocating blocks as needed. Reports
/// cumulative bytes written after each block-sized piece.
pub(crate) fn write_layered<S: Storage>(
    layer: &mut VhdxFile<S>,
    parents: &mut Parents,
    offset: u64,
    data: &[u8],
    progress: &mut Option<&mut dyn ProgressSink>,
) -> Result<()> {
    layer.begin_write(true)?;
    progress::report(progress, 0);
    let block_size = layer.layout().block_size;
    for (block, within, len, at) in segments(offset, data.len(), block_size) {
        let piece = &data[at..at + len];
        let entry = layer.bat().payload(block);
        match entry.payload_state() {
            PayloadBlockState::FullyPresent => layer.write_raw(entry.file_offset() + within, piece)?,
            _ if !layer.has_parent() => write_unallocated(layer, block, within, piece)?,
            PayloadBlockState::Undefined | PayloadBlockState::Zero => {
                write_unallocated(layer, block, within, piece)?
            }
            _ if within == 0 && len as u64 == block_size => {
                write_whole_block(layer, block, entry, piece)?
            }
            _ => write_partial(layer, parents, block, entry, within, piece)?,
        }
        progress::report(progress, (at + len) as u64);
    }
    Ok(())
}

/// Maps a new block and flips its entry to FULLY_PRESENT through the log.
/// The rest of the block keeps reading as zero.
fn write_unallocated<S: Storage>(
    layer: &mut VhdxFile<S>,
    block: u64,
    within: u64,
    piece: &[u8],
) -> Result<()> {
    if piece.iter().all(|&b| b == 0) {
        trace!("Skipping allocation of block {} for zero write", block);
        return Ok(());
    }
    let block_size = layer.layout().block_size;
    let file_offset = layer.allocate(block_size)?;
    layer.write_raw(file_offset + within, piece)?;
    layer.sync()?;
    let update = layer
        .bat()
        .payload_update(block, BatEntry::payload(PayloadBlockState::FullyPresent, file_offset));
    commit_bat(layer, Transaction::new(), &[update])
}

/// Logs the BAT pages touched by `updates` along with `txn`. The in-memory
/// table only changes once the commit succeeded.
fn commit_bat<S: Storage>(
    layer: &mut VhdxFile<S>,
    mut txn: Transaction,
    updates: &[BatUpdate],
) -> Result<()> {
    txn.write_pages(layer.bat().pages(updates));
    layer.commit(txn)?;
    layer.bat_mut().apply(updates);
    Ok(())
}

fn write_whole_block<S: Storage>(
    layer: &mut VhdxFile<S>,
    block: u64,
    entry: BatEntry,
    piece: &[u8],
) -> Result<()> {
    let file_offset = if entry.payload_state().is_allocated() {
        entry.file_offset()
    } else {
        layer.allocate(piece.len() as u64)?
    };
    layer.write_raw(file_offset, piece)?;
    layer.sync()?;
    let update = layer
        .bat()
        .payload_update(block, BatEntry::payload(PayloadBlockState::FullyPresent, file_offset));
    commit_bat(layer, Transaction::new(), &[update])
}

/// Sub-block write into a differencing disk: the write is widened to sector
/// boundaries from the layered view, then the touched sectors are marked
/// present in the chunk's sector bitmap.
fn write_partial<S: Storage>(
    layer: &mut VhdxFile<S>,
    parents: &mut Parents,
    block: u64,
    entry: BatEntry,
    within: u64,
    piece: &[u8],
) -> Result<()> {
    let layout = *layer.layout();
    let sector_size = layout.logical_sector_size;
    let block_start = block * layout.block_size;
    let start = within / sector_size * sector_size;
    let end = (within + piece.len() as u64).div_ceil(sector_size) * sector_size;

    let mut widened = vec![0u8; (end - start) as usize];
    if start != within || end != within + piece.len() as u64 {
        read_layered(layer, parents, block_start + start, &mut widened)?;
    }
    let skip = (within - start) as usize;
    widened[skip..skip + piece.len()].copy_from_slice(piece);

    let mut txn = Transaction::new();
    let mut updates = Vec::with_capacity(2);

    let chunk = layout.chunk_of(block);
    let mut bitmap = layer.bat().sector_bitmap(chunk);
    if bitmap.bitmap_state() != SectorBitmapState::Present {
        let bitmap_offset = layer.allocate(SECTOR_BITMAP_BLOCK_SIZE)?;
        txn.zero(bitmap_offset, SECTOR_BITMAP_BLOCK_SIZE);
        bitmap = BatEntry::sector_bitmap(SectorBitmapState::Present, bitmap_offset);
        updates.push(layer.bat().bitmap_update(chunk, bitmap));
    }

    let data_offset = if entry.payload_state().is_allocated() {
        entry.file_offset()
    } else {
        layer.allocate(layout.block_size)?
    };
    layer.write_raw(data_offset + start, &widened)?;
    layer.sync()?;

    // Set the presence bits, page by page.
    let first_sector = start / sector_size;
    let last_sector = end / sector_size - 1;
    let (first_byte, _) = layout.sector_bit(block, first_sector);
    let (last_byte, _) = layout.sector_bit(block, last_sector);
    let first_page = first_byte / LOG_SECTOR_SIZE;
    let last_page = last_byte / LOG_SECTOR_SIZE;
    for page_index in first_page..=last_page {
        let page_offset = bitmap.file_offset() + page_index * LOG_SECTOR_SIZE;
        let mut page = vec![0u8; LOG_SECTOR_SIZE as usize];
        layer.read_raw(page_offset, &mut page)?;
        for sector in first_sector..=last_sector {
            let (byte, mask) = layout.sector_bit(block, sector);
            if byte / LOG_SECTOR_SIZE == page_index {
                page[(byte % LOG_SECTOR_SIZE) as usize] |= mask;
            }
        }
        txn.write_page(page_offset, page);
    }

    if entry.payload_state() != PayloadBlockState::PartiallyPresent
        || entry.file_offset() != data_offset
    {
        updates.push(layer.bat().payload_update(
            block,
            BatEntry::payload(PayloadBlockState::PartiallyPresent, data_offset),
        ));
    }
    commit_bat(layer, txn, &updates)
}

/// Cursor over the content of a disk, with `Read`, `Write` and `Seek`.
pub struct ContentStream<'a, S: Storage> {
    file: &'a mut VhdxFile<S>,
    parents: &'a mut ParentChain,
    position: u64,
    progress: Option<&'a mut dyn ProgressSink>,
}

impl<'a, S: Storage> ContentStream<'a, S> {
    pub(crate) fn new(file: &'a mut VhdxFile<S>, parents: &'a mut ParentChain) -> Self {
        Self {
            file,
            parents,
            position: 0,
            progress: None,
        }
    }

    /// Attaches a sink receiving cumulative bytes written by each write call.
    pub fn with_progress(mut self, sink: &'a mut dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Virtual disk capacity in bytes.
    pub fn len(&self) -> u64 {
        self.file.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for dynamic and differencing disks.
    pub fn is_sparse(&self) -> bool {
        !self.file.is_fixed()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len())?;
        read_layered(self.file, self.parents.layers_mut(), offset, buf)
    }

    /// Writes all of `data` at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        checked_range(offset, data.len(), self.len())?;
        write_layered(
            self.file,
            self.parents.layers_mut(),
            offset,
            data,
            &mut self.progress,
        )
    }

    /// Syncs payload and metadata writes to the storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync()
    }

    /// State of the block holding virtual `offset`.
    pub fn block_state(&self, offset: u64) -> Result<PayloadBlockState> {
        checked_range(offset, 1, self.len())?;
        let block = offset / self.file.layout().block_size;
        Ok(self.file.bat().payload(block).payload_state())
    }

    pub fn is_block_allocated(&self, offset: u64) -> Result<bool> {
        Ok(self.block_state(offset)?.is_allocated())
    }
}

impl<S: Storage> Read for ContentStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len().saturating_sub(self.position);
        let len = (buf.len() as u64).min(remaining) as usize;
        if len == 0 {
            return Ok(0);
        }
        self.read_at(self.position, &mut buf[..len])?;
        self.position += len as u64;
        Ok(len)
    }
}

impl<S: Storage> Write for ContentStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let remaining = self.len().saturating_sub(self.position);
        if remaining == 0 {
            return Err(DiskError::OutOfRange {
                offset: self.position,
                len: buf.len() as u64,
                capacity: self.len(),
            }
            .into());
        }
        let len = (buf.len() as u64).min(remaining) as usize;
        self.write_at(self.position, &buf[..len])?;
        self.position += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        ContentStream::flush(self)?;
        Ok(())
    }
}

impl<S: Storage> Seek for ContentStream<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
