//! **VHDX (Hyper-V virtual hard disk v2) container engine**
//!
//! This module reads, writes and creates VHDX containers: fixed, dynamic and
//! differencing disks. A container is made of
//!
//! * a 1 MiB header section (file identifier, two headers, two region tables),
//! * a circular write-ahead log protecting every metadata update,
//! * a metadata region describing the virtual disk,
//! * the block allocation table (BAT) mapping virtual blocks to file offsets,
//! * the payload blocks and, for differencing disks, sector bitmaps.
//!
//! [`DiskImageFile`] is the entry point. It exposes the virtual disk as a
//! random-access byte stream through [`DiskImageFile::content`].
//!
//! Reference: "VHDX Format Specification" v1.00, Microsoft (MS-VHDX).

mod bat;
mod disk;
mod file;
mod header;
mod log;
mod metadata;
mod parent;
mod region;
mod storage;
mod stream;

pub use bat::{BatEntry, PayloadBlockState, SectorBitmapState};
pub use disk::{DiskImageFile, DiskInfo, DiskParameters, DiskType};
pub use header::Header;
pub use metadata::{FileParameters, ParentLocator};
pub use parent::ParentChain;
pub use region::{RegionEntry, RegionTable};
pub use storage::{FileAccess, Ownership, Storage};
pub use stream::ContentStream;

use uuid::Uuid;

pub(crate) const KIB: u64 = 1024;
pub(crate) const MIB: u64 = 1024 * KIB;

/// Unit of every log write and of the BAT pages committed through the log.
pub(crate) const LOG_SECTOR_SIZE: u64 = 4 * KIB;

/// Extended parameter keys understood by the generic disk façade.
pub const EXTENDED_PARAMETER_KEY_BLOCK_SIZE: &str = "VHDX.BlockSize";
pub const EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE: &str = "VHDX.PhysicalSectorSize";
pub const EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE: &str = "VHDX.LogicalSectorSize";

// Well-known GUIDs from MS-VHDX.
pub(crate) const BAT_REGION_GUID: Uuid = Uuid::from_u128(0x2DC27766_F623_4200_9D64_115E9BFD4A08);
pub(crate) const METADATA_REGION_GUID: Uuid =
    Uuid::from_u128(0x8B7CA206_4790_4B9A_B8FE_575F050F886E);
pub(crate) const FILE_PARAMETERS_GUID: Uuid =
    Uuid::from_u128(0xCAA16737_FA36_4D43_B3B6_33F0AA44E76B);
pub(crate) const VIRTUAL_DISK_SIZE_GUID: Uuid =
    Uuid::from_u128(0x2FA54224_CD1B_4876_B211_5DBED83BF4B8);
pub(crate) const PAGE_83_DATA_GUID: Uuid = Uuid::from_u128(0xBECA12AB_B2E6_4523_93EF_C309E000C746);
pub(crate) const LOGICAL_SECTOR_SIZE_GUID: Uuid =
    Uuid::from_u128(0x8141BF1D_A96F_4709_BA47_F233A8FAAB5F);
pub(crate) const PHYSICAL_SECTOR_SIZE_GUID: Uuid =
    Uuid::from_u128(0xCDA348C7_445D_4471_9CC9_E9885251C556);
pub(crate) const PARENT_LOCATOR_GUID: Uuid =
    Uuid::from_u128(0xA8D35F2D_B30B_454D_ABF7_D3D84834AB0C);
pub(crate) const VHDX_PARENT_LOCATOR_TYPE_GUID: Uuid =
    Uuid::from_u128(0xB04AEFB7_D19E_4A81_B789_25B8E9445913);

/// Computes the CRC-32C of `data` as if the 4 bytes at `checksum_offset`
/// were zero.
pub(crate) fn checksum_with_hole(data: &[u8], checksum_offset: usize) -> u32 {
    let crc = crc32c::crc32c(&data[..checksum_offset]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &data[checksum_offset + 4..])
}

/// Stores the checksum of `data` at `checksum_offset`.
pub(crate) fn seal_checksum(data: &mut [u8], checksum_offset: usize) {
    data[checksum_offset..checksum_offset + 4].fill(0);
    let crc = crc32c::crc32c(data);
    data[checksum_offset..checksum_offset + 4].copy_from_slice(&crc.to_le_bytes());
}

pub(crate) fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn read_guid(bytes: &[u8], at: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    Uuid::from_bytes_le(raw)
}

pub(crate) fn write_guid(bytes: &mut [u8], at: usize, guid: &Uuid) {
    bytes[at..at + 16].copy_from_slice(&guid.to_bytes_le());
}

pub(crate) fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Decodes a UTF-16LE string, stopping at the first NUL.
pub(crate) fn decode_utf16le(raw: &[u8]) -> Option<String> {
    let units = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0);
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

pub(crate) fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_uses_mixed_endian_layout() {
        let mut raw = [0u8; 16];
        write_guid(&mut raw, 0, &BAT_REGION_GUID);
        // First field little-endian, last 8 bytes in order.
        assert_eq!(&raw[..4], &[0x66, 0x77, 0xC2, 0x2D]);
        assert_eq!(&raw[8..], &[0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD, 0x4A, 0x08]);
        assert_eq!(read_guid(&raw, 0), BAT_REGION_GUID);
    }

    #[test]
    fn checksum_hole_matches_sealed_checksum() {
        let mut data = vec![7u8; 64];
        seal_checksum(&mut data, 4);
        assert_eq!(checksum_with_hole(&data, 4), le_u32(&data, 4));
        data[10] ^= 1;
        assert_ne!(checksum_with_hole(&data, 4), le_u32(&data, 4));
    }

    #[test]
    fn utf16_round_trip_stops_at_nul() {
        let mut raw = encode_utf16le("parent.vhdx");
        raw.extend_from_slice(&[0, 0, 0x41, 0]);
        assert_eq!(decode_utf16le(&raw).as_deref(), Some("parent.vhdx"));
    }
}
