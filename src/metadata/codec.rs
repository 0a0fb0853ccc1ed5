//! C2: fixed-layout header/entry encode/decode with CRC. Field offsets,
//! widths, endianness, and the CRC polynomial are normative and fixed.

use crate::error::{Error, Result};
use crate::geometry::{ENTRY_BYTES, HEADER_BYTES};
use crate::table::{EntryFlags, RemapEntry};

pub const MAGIC: [u8; 8] = *b"SPRMAP01";
pub const FORMAT_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_CREATED: usize = 16;
const OFF_UPDATED: usize = 24;
const OFF_SEQUENCE: usize = 32;
const OFF_ENTRY_COUNT: usize = 40;
const OFF_ENTRY_CAPACITY: usize = 44;
const OFF_PRIMARY_SIZE: usize = 48;
const OFF_SPARE_SIZE: usize = 56;
const OFF_HEADER_CRC: usize = 64;
const OFF_TABLE_CRC: usize = 68;

/// On-device header fields, decoded from the fixed 4 KiB block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub format_version: u32,
    pub flags: u32,
    pub created_time: u64,
    pub updated_time: u64,
    pub sequence: u64,
    pub entry_count: u32,
    pub entry_capacity: u32,
    pub primary_size_sectors: u64,
    pub spare_size_sectors: u64,
    pub header_crc32: u32,
    pub table_crc32: u32,
}

fn entry_region_len(entry_capacity: u32) -> usize {
    entry_capacity as usize * ENTRY_BYTES as usize
}

/// Encode `entries` (the live table snapshot) plus a fresh header into the
/// on-device byte image, bumping `prior_sequence` by one. Returns
/// `(header_block, entry_block)`, each ready to be written verbatim.
pub fn encode(
    entries: &[RemapEntry],
    prior_sequence: u64,
    entry_capacity: u32,
    primary_size_sectors: u64,
    spare_size_sectors: u64,
    created_time: u64,
    updated_time: u64,
) -> Result<(Vec<u8>, Vec<u8>)> {
    if entries.len() > entry_capacity as usize {
        return Err(Error::NoSpace {
            entry_capacity,
            needed: entries.len() as u64,
            have: entry_capacity as u64,
        });
    }

    let mut entry_block = vec![0u8; entry_region_len(entry_capacity)];
    for (i, e) in entries.iter().enumerate() {
        let off = i * ENTRY_BYTES as usize;
        entry_block[off..off + 8].copy_from_slice(&e.primary_sector.to_le_bytes());
        entry_block[off + 8..off + 16].copy_from_slice(&e.spare_sector.to_le_bytes());
        entry_block[off + 16..off + 20].copy_from_slice(&e.length_sectors.to_le_bytes());
        let flags: u32 = match e.flags {
            EntryFlags::Manual => 0,
            EntryFlags::Auto => 1,
            EntryFlags::Pending => 2,
        };
        entry_block[off + 20..off + 24].copy_from_slice(&flags.to_le_bytes());
    }
    let table_crc32 = crc32fast::hash(&entry_block);

    let mut header = vec![0u8; HEADER_BYTES as usize];
    header[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC);
    header[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&0u32.to_le_bytes());
    header[OFF_CREATED..OFF_CREATED + 8].copy_from_slice(&created_time.to_le_bytes());
    header[OFF_UPDATED..OFF_UPDATED + 8].copy_from_slice(&updated_time.to_le_bytes());
    header[OFF_SEQUENCE..OFF_SEQUENCE + 8].copy_from_slice(&(prior_sequence + 1).to_le_bytes());
    header[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4]
        .copy_from_slice(&(entries.len() as u32).to_le_bytes());
    header[OFF_ENTRY_CAPACITY..OFF_ENTRY_CAPACITY + 4]
        .copy_from_slice(&entry_capacity.to_le_bytes());
    header[OFF_PRIMARY_SIZE..OFF_PRIMARY_SIZE + 8]
        .copy_from_slice(&primary_size_sectors.to_le_bytes());
    header[OFF_SPARE_SIZE..OFF_SPARE_SIZE + 8].copy_from_slice(&spare_size_sectors.to_le_bytes());
    header[OFF_TABLE_CRC..OFF_TABLE_CRC + 4].copy_from_slice(&table_crc32.to_le_bytes());
    // header_crc32 field left zeroed for the CRC computation itself.
    let header_crc32 = crc32fast::hash(&header);
    header[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&header_crc32.to_le_bytes());

    Ok((header, entry_block))
}

/// Decode and validate a `(header, entry_block)` pair read back from disk.
/// Returns the header fields plus the live entries. Validates in order:
/// magic, version, header CRC, entry_count/capacity, then table CRC.
pub fn decode(header_bytes: &[u8], entry_bytes: &[u8]) -> Result<(MetadataHeader, Vec<RemapEntry>)> {
    if header_bytes.len() < HEADER_BYTES as usize {
        return Err(Error::CorruptHeader("header block too short".into()));
    }

    if header_bytes[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
        return Err(Error::BadMagic);
    }

    let format_version = u32::from_le_bytes(header_bytes[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
    if format_version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(format_version));
    }

    let stored_header_crc =
        u32::from_le_bytes(header_bytes[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].try_into().unwrap());
    let mut zeroed = header_bytes[..HEADER_BYTES as usize].to_vec();
    zeroed[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&0u32.to_le_bytes());
    let computed_header_crc = crc32fast::hash(&zeroed);
    if stored_header_crc != computed_header_crc {
        return Err(Error::CorruptHeader("header CRC mismatch".into()));
    }

    let flags = u32::from_le_bytes(header_bytes[OFF_FLAGS..OFF_FLAGS + 4].try_into().unwrap());
    let created_time = u64::from_le_bytes(header_bytes[OFF_CREATED..OFF_CREATED + 8].try_into().unwrap());
    let updated_time = u64::from_le_bytes(header_bytes[OFF_UPDATED..OFF_UPDATED + 8].try_into().unwrap());
    let sequence = u64::from_le_bytes(header_bytes[OFF_SEQUENCE..OFF_SEQUENCE + 8].try_into().unwrap());
    let entry_count =
        u32::from_le_bytes(header_bytes[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4].try_into().unwrap());
    let entry_capacity = u32::from_le_bytes(
        header_bytes[OFF_ENTRY_CAPACITY..OFF_ENTRY_CAPACITY + 4]
            .try_into()
            .unwrap(),
    );
    let primary_size_sectors = u64::from_le_bytes(
        header_bytes[OFF_PRIMARY_SIZE..OFF_PRIMARY_SIZE + 8]
            .try_into()
            .unwrap(),
    );
    let spare_size_sectors = u64::from_le_bytes(
        header_bytes[OFF_SPARE_SIZE..OFF_SPARE_SIZE + 8]
            .try_into()
            .unwrap(),
    );
    let table_crc32 =
        u32::from_le_bytes(header_bytes[OFF_TABLE_CRC..OFF_TABLE_CRC + 4].try_into().unwrap());

    if entry_count > entry_capacity {
        return Err(Error::CorruptHeader(format!(
            "entry_count {entry_count} exceeds entry_capacity {entry_capacity}"
        )));
    }
    let expected_region_len = entry_region_len(entry_capacity);
    if entry_bytes.len() < expected_region_len {
        return Err(Error::CorruptTable("entry region too short".into()));
    }

    let computed_table_crc = crc32fast::hash(&entry_bytes[..expected_region_len]);
    if computed_table_crc != table_crc32 {
        return Err(Error::CorruptTable("entry table CRC mismatch".into()));
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    for i in 0..entry_count as usize {
        let off = i * ENTRY_BYTES as usize;
        let primary_sector = u64::from_le_bytes(entry_bytes[off..off + 8].try_into().unwrap());
        let spare_sector = u64::from_le_bytes(entry_bytes[off + 8..off + 16].try_into().unwrap());
        let length_sectors = u32::from_le_bytes(entry_bytes[off + 16..off + 20].try_into().unwrap());
        let flags_raw = u32::from_le_bytes(entry_bytes[off + 20..off + 24].try_into().unwrap());
        let flags = match flags_raw {
            0 => EntryFlags::Manual,
            1 => EntryFlags::Auto,
            2 => EntryFlags::Pending,
            other => {
                return Err(Error::CorruptTable(format!(
                    "unknown entry flags value {other} at index {i}"
                )))
            }
        };
        entries.push(RemapEntry {
            primary_sector,
            spare_sector,
            length_sectors,
            flags,
        });
    }

    Ok((
        MetadataHeader {
            format_version,
            flags,
            created_time,
            updated_time,
            sequence,
            entry_count,
            entry_capacity,
            primary_size_sectors,
            spare_size_sectors,
            header_crc32: stored_header_crc,
            table_crc32,
        },
        entries,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<RemapEntry> {
        vec![
            RemapEntry {
                primary_sector: 100,
                spare_sector: 5000,
                length_sectors: 1,
                flags: EntryFlags::Manual,
            },
            RemapEntry {
                primary_sector: 200,
                spare_sector: 5001,
                length_sectors: 1,
                flags: EntryFlags::Auto,
            },
        ]
    }

    #[test]
    fn roundtrip_preserves_entry_multiset() {
        let entries = sample_entries();
        let (header, table) = encode(&entries, 0, 64, 20_000_000, 1_000_000, 1000, 1000).unwrap();
        let (decoded_header, decoded_entries) = decode(&header, &table).unwrap();
        assert_eq!(decoded_header.sequence, 1);
        assert_eq!(decoded_header.entry_count, 2);
        assert_eq!(decoded_entries, entries);
    }

    #[test]
    fn bad_magic_detected() {
        let entries = sample_entries();
        let (mut header, table) = encode(&entries, 0, 64, 1, 1, 0, 0).unwrap();
        header[0] = b'X';
        assert!(matches!(decode(&header, &table), Err(Error::BadMagic)));
    }

    #[test]
    fn unsupported_version_detected() {
        let entries = sample_entries();
        let (mut header, table) = encode(&entries, 0, 64, 1, 1, 0, 0).unwrap();
        header[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&99u32.to_le_bytes());
        // Recompute header CRC isn't needed; version check happens first.
        assert!(matches!(
            decode(&header, &table),
            Err(Error::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn header_crc_mismatch_detected() {
        let entries = sample_entries();
        let (mut header, table) = encode(&entries, 0, 64, 1, 1, 0, 0).unwrap();
        header[16] ^= 0xFF; // flip a byte inside created_time
        assert!(matches!(decode(&header, &table), Err(Error::CorruptHeader(_))));
    }

    #[test]
    fn table_crc_mismatch_detected_on_any_byte_tamper() {
        let entries = sample_entries();
        let (header, mut table) = encode(&entries, 0, 64, 1, 1, 0, 0).unwrap();
        table[5] ^= 0x01;
        assert!(matches!(decode(&header, &table), Err(Error::CorruptTable(_))));
    }

    #[test]
    fn sequence_increments_from_prior() {
        let entries = sample_entries();
        let (header, _) = encode(&entries, 41, 64, 1, 1, 0, 0).unwrap();
        let (decoded, _) = decode(&header, &encode(&entries, 41, 64, 1, 1, 0, 0).unwrap().1).unwrap();
        assert_eq!(decoded.sequence, 42);
    }
}
