//! On-media layout definitions for pmextent
//!
//! ```text
//! block 0                 volume header
//! [inode_table, +n)       inode records {log_head, log_tail}, 256 per block
//! [data_start, end)       allocatable: log pages and file data
//! ```
//!
//! A log page is a dense array of 24-byte extent entry slots followed by a
//! page tail holding the next page's block number. Block 0 never holds a log
//! page or file data, so 0 serves as the null block pointer.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

use crate::allocator::BlockRange;
use crate::blockdev::BLOCK_SIZE;

/// Magic number for pmextent volumes
pub const PMEXTENT_MAGIC: &[u8; 8] = b"PMEXTNT\x00";
/// Current on-media format version
pub const FORMAT_VERSION: u32 = 1;

/// Size of one extent entry slot in bytes
pub const ENTRY_SIZE: usize = 24;
/// Entry slots per log page
pub const ENTRIES_PER_PAGE: usize = (BLOCK_SIZE - 16) / ENTRY_SIZE;
/// Byte offset of the page tail inside a log page
pub const LAST_ENTRY: usize = ENTRIES_PER_PAGE * ENTRY_SIZE;

/// Size of one inode record in bytes
pub const INODE_RECORD_SIZE: usize = 16;
/// Inode records per inode-table block
pub const RECORDS_PER_BLOCK: u64 = (BLOCK_SIZE / INODE_RECORD_SIZE) as u64;

const TAG_SHIFT: u32 = 56;
/// Largest block number representable next to the invalid-count tag
pub const MAX_BLOCK: u64 = (1 << TAG_SHIFT) - 1;
/// Byte offset of the tagged block pointer inside an entry slot
pub const ENTRY_BLOCK_OFFSET: usize = 16;

/// Error type for layout encoding and decoding
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Bad magic number")]
    BadMagic,
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("Header checksum mismatch")]
    HeaderChecksum,
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("Entry checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    EntryChecksum { stored: u32, computed: u32 },
    #[error("Entry with zero page count")]
    EmptyEntry,
    #[error("Log pointer {0:#x} is not a slot boundary")]
    BadLogPointer(u64),
}

/// One extent mapping: `page_count` logical pages starting at
/// `logical_offset` live in the physical blocks starting at
/// `physical_block`. A zero `physical_block` marks a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ExtentEntry {
    pub logical_offset: u64,
    pub page_count: u32,
    pub physical_block: u64,
    /// How many later entries have overlapped this one (0 = untouched)
    pub invalid_count: u8,
}

impl ExtentEntry {
    /// Fresh mapping entry
    pub fn new(logical_offset: u64, page_count: u32, physical_block: u64) -> Self {
        Self {
            logical_offset,
            page_count,
            physical_block,
            invalid_count: 0,
        }
    }

    /// Entry that unmaps a logical range
    pub fn hole(logical_offset: u64, page_count: u32) -> Self {
        Self::new(logical_offset, page_count, 0)
    }

    /// Whether this entry unmaps its range
    pub fn is_hole(&self) -> bool {
        self.physical_block == 0
    }

    /// First logical page past the entry
    pub fn logical_end(&self) -> u64 {
        self.logical_offset + self.page_count as u64
    }

    /// Whether the entry maps logical page `offset`
    pub fn covers(&self, offset: u64) -> bool {
        self.logical_offset <= offset && offset < self.logical_end()
    }

    /// Whether the entry's logical range intersects `[start, start + count)`
    pub fn overlaps(&self, start: u64, count: u64) -> bool {
        self.logical_offset < start + count && start < self.logical_end()
    }

    /// Physical block holding logical page `offset`, which must be covered
    pub fn block_for(&self, offset: u64) -> u64 {
        debug_assert!(self.covers(offset));
        self.physical_block + (offset - self.logical_offset)
    }

    /// Physical blocks referenced by the entry, `None` for holes
    pub fn blocks(&self) -> Option<BlockRange> {
        (!self.is_hole()).then(|| BlockRange::from_start(self.physical_block, self.page_count as u64))
    }

    fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.logical_offset.to_le_bytes());
        hasher.update(&self.page_count.to_le_bytes());
        hasher.update(&self.physical_block.to_le_bytes());
        hasher.finalize()
    }

    /// Serialize the entry into a 24-byte slot
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Deserialize and verify an entry slot
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, LayoutError> {
        let logical_offset = reader.read_u64::<LittleEndian>()?;
        let page_count = reader.read_u32::<LittleEndian>()?;
        let stored = reader.read_u32::<LittleEndian>()?;
        let (physical_block, invalid_count) = unpack_tagged_block(reader.read_u64::<LittleEndian>()?);

        let entry = Self {
            logical_offset,
            page_count,
            physical_block,
            invalid_count,
        };
        let computed = entry.checksum();
        if stored != computed {
            return Err(LayoutError::EntryChecksum { stored, computed });
        }
        if page_count == 0 {
            return Err(LayoutError::EmptyEntry);
        }
        Ok(entry)
    }

    /// The encoded slot
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.logical_offset);
        LittleEndian::write_u32(&mut buf[8..12], self.page_count);
        LittleEndian::write_u32(&mut buf[12..16], self.checksum());
        LittleEndian::write_u64(
            &mut buf[ENTRY_BLOCK_OFFSET..],
            pack_tagged_block(self.physical_block, self.invalid_count),
        );
        buf
    }

    /// Decode the slot at the start of `slot`
    pub fn from_bytes(slot: &[u8]) -> Result<Self, LayoutError> {
        Self::read_from(&mut Cursor::new(slot))
    }
}

/// Pack a block number and its invalid-count tag into one pointer word
pub fn pack_tagged_block(block: u64, invalid_count: u8) -> u64 {
    debug_assert!(block <= MAX_BLOCK);
    ((invalid_count as u64) << TAG_SHIFT) | (block & MAX_BLOCK)
}

/// Split a pointer word into block number and invalid-count tag
pub fn unpack_tagged_block(word: u64) -> (u64, u8) {
    (word & MAX_BLOCK, (word >> TAG_SHIFT) as u8)
}

/// Read the `next_page` link of a log page buffer
pub fn read_next_page(page: &[u8]) -> u64 {
    let mut cursor = Cursor::new(&page[LAST_ENTRY..LAST_ENTRY + 8]);
    cursor.read_u64::<LittleEndian>().unwrap_or(0)
}

/// Set the `next_page` link of a log page buffer
pub fn write_next_page(page: &mut [u8], next_page: u64) {
    page[LAST_ENTRY..LAST_ENTRY + 8].copy_from_slice(&next_page.to_le_bytes());
}

/// A slot position inside a log chain.
///
/// `slot == ENTRIES_PER_PAGE` is the page-end position: the page is full
/// and the next slot is the first one of `next_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct LogPosition {
    pub page: u64,
    pub slot: usize,
}

impl LogPosition {
    /// Position of `slot` in `page`
    pub fn new(page: u64, slot: usize) -> Self {
        debug_assert!(slot <= ENTRIES_PER_PAGE);
        Self { page, slot }
    }

    /// Byte offset of the slot inside its page
    pub fn byte_offset(&self) -> usize {
        self.slot * ENTRY_SIZE
    }

    /// Whether this is the page-end position
    pub fn is_page_end(&self) -> bool {
        self.slot == ENTRIES_PER_PAGE
    }

    /// The following slot in the same page
    pub fn next_slot(&self) -> Self {
        Self::new(self.page, self.slot + 1)
    }

    /// Encoded pointer: page byte address plus slot byte offset
    pub fn to_raw(&self) -> u64 {
        self.page * BLOCK_SIZE as u64 + self.byte_offset() as u64
    }

    /// Decode a pointer; 0 means "no position" (empty log).
    pub fn from_raw(raw: u64) -> Result<Option<Self>, LayoutError> {
        if raw == 0 {
            return Ok(None);
        }
        let page = raw / BLOCK_SIZE as u64;
        let offset = (raw % BLOCK_SIZE as u64) as usize;
        if page == 0 || offset % ENTRY_SIZE != 0 || offset > LAST_ENTRY {
            return Err(LayoutError::BadLogPointer(raw));
        }
        Ok(Some(Self::new(page, offset / ENTRY_SIZE)))
    }
}

/// Durable per-inode log state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeRecord {
    /// First page of the chain, 0 when empty
    pub log_head: u64,
    /// Encoded [`LogPosition`] of the next free slot, 0 when empty
    pub log_tail: u64,
}

impl InodeRecord {
    /// Record of an empty log
    pub const EMPTY: InodeRecord = InodeRecord {
        log_head: 0,
        log_tail: 0,
    };

    /// Record for a chain starting at `head` with its next free slot at `tail`
    pub fn new(head: u64, tail: LogPosition) -> Self {
        Self {
            log_head: head,
            log_tail: tail.to_raw(),
        }
    }

    /// Whether the log holds no entries
    pub fn is_empty(&self) -> bool {
        self.log_tail == 0
    }

    /// Decoded tail position
    pub fn tail(&self) -> Result<Option<LogPosition>, LayoutError> {
        LogPosition::from_raw(self.log_tail)
    }

    /// Encode the record
    pub fn to_bytes(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut buf = [0u8; INODE_RECORD_SIZE];
        buf[..8].copy_from_slice(&self.log_head.to_le_bytes());
        buf[8..].copy_from_slice(&self.log_tail.to_le_bytes());
        buf
    }

    /// Decode a record from the start of `buf`
    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            log_head: cursor.read_u64::<LittleEndian>()?,
            log_tail: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Block numbers for the volume's fixed regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Geometry {
    /// Total blocks on the device
    pub block_count: u64,
    /// Number of inode records
    pub inode_count: u64,
    /// First inode-table block (always 1)
    pub inode_table: u64,
    /// Blocks in the inode table
    pub inode_table_blocks: u64,
    /// First allocatable block
    pub data_start: u64,
}

impl Geometry {
    /// Header size on media, checksum included
    const HEADER_LEN: usize = 8 + 4 + 8 * 5 + 4;

    /// Compute the layout for `block_count` blocks and `inode_count` inodes
    pub fn new(block_count: u64, inode_count: u64) -> Result<Self, LayoutError> {
        if inode_count == 0 {
            return Err(LayoutError::InvalidGeometry(
                "at least one inode is required".to_string(),
            ));
        }
        if block_count > MAX_BLOCK {
            return Err(LayoutError::InvalidGeometry(format!(
                "{} blocks exceed the addressable maximum {}",
                block_count, MAX_BLOCK
            )));
        }
        let inode_table = 1;
        let inode_table_blocks = (inode_count + RECORDS_PER_BLOCK - 1) / RECORDS_PER_BLOCK;
        let data_start = inode_table + inode_table_blocks;
        // A data region needs room for at least one log page and one data block
        if block_count < data_start + 2 {
            return Err(LayoutError::InvalidGeometry(format!(
                "{} blocks cannot hold {} inodes and a data region",
                block_count, inode_count
            )));
        }
        Ok(Self {
            block_count,
            inode_count,
            inode_table,
            inode_table_blocks,
            data_start,
        })
    }

    /// Blocks available to the allocator
    pub fn data_region(&self) -> BlockRange {
        BlockRange::new(self.data_start, self.block_count - 1)
    }

    /// Block and byte offset of an inode's record
    pub fn record_location(&self, ino: u64) -> (u64, usize) {
        let block = self.inode_table + ino / RECORDS_PER_BLOCK;
        let offset = (ino % RECORDS_PER_BLOCK) as usize * INODE_RECORD_SIZE;
        (block, offset)
    }

    /// The encoded header, checksum last
    fn header_bytes(&self) -> [u8; Self::HEADER_LEN] {
        let mut buf = [0u8; Self::HEADER_LEN];
        buf[0..8].copy_from_slice(PMEXTENT_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], FORMAT_VERSION);
        let fields = [
            self.block_count,
            self.inode_count,
            self.inode_table,
            self.inode_table_blocks,
            self.data_start,
        ];
        for (i, field) in fields.into_iter().enumerate() {
            LittleEndian::write_u64(&mut buf[12 + i * 8..20 + i * 8], field);
        }
        let body_len = Self::HEADER_LEN - 4;
        let checksum = crc32fast::hash(&buf[..body_len]);
        LittleEndian::write_u32(&mut buf[body_len..], checksum);
        buf
    }

    /// Serialize the volume header
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.header_bytes())
    }

    /// Deserialize and validate a volume header
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, LayoutError> {
        let mut body = [0u8; Self::HEADER_LEN - 4];
        reader.read_exact(&mut body)?;
        let stored = reader.read_u32::<LittleEndian>()?;

        if &body[..8] != PMEXTENT_MAGIC {
            return Err(LayoutError::BadMagic);
        }
        if crc32fast::hash(&body) != stored {
            return Err(LayoutError::HeaderChecksum);
        }

        let mut cursor = Cursor::new(&body[8..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(LayoutError::UnsupportedVersion(version));
        }
        let block_count = cursor.read_u64::<LittleEndian>()?;
        let inode_count = cursor.read_u64::<LittleEndian>()?;
        let geometry = Self::new(block_count, inode_count)?;

        let inode_table = cursor.read_u64::<LittleEndian>()?;
        let inode_table_blocks = cursor.read_u64::<LittleEndian>()?;
        let data_start = cursor.read_u64::<LittleEndian>()?;
        if (inode_table, inode_table_blocks, data_start)
            != (geometry.inode_table, geometry.inode_table_blocks, geometry.data_start)
        {
            return Err(LayoutError::InvalidGeometry(
                "stored regions disagree with the computed layout".to_string(),
            ));
        }
        Ok(geometry)
    }

    /// The header padded to a full block
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..Self::HEADER_LEN].copy_from_slice(&self.header_bytes());
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_geometry() {
        assert_eq!(ENTRIES_PER_PAGE, 170);
        assert_eq!(LAST_ENTRY, 4080);
        assert!(LAST_ENTRY + 8 <= BLOCK_SIZE);
    }

    #[test]
    fn test_invalid_count_packed_in_high_bits() {
        let mut entry = ExtentEntry::new(7, 3, 0x1234);
        entry.invalid_count = 2;
        let bytes = entry.to_bytes();

        let word = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        assert_eq!(word, (2u64 << 56) | 0x1234);
        assert_eq!(ExtentEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_tag_bump_keeps_checksum_valid() {
        let entry = ExtentEntry::new(0, 2, 100);
        let mut bytes = entry.to_bytes();
        bytes[ENTRY_BLOCK_OFFSET..].copy_from_slice(&pack_tagged_block(100, 1).to_le_bytes());

        let decoded = ExtentEntry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.physical_block, 100);
        assert_eq!(decoded.invalid_count, 1);
    }

    #[test]
    fn test_corrupt_entry_detected() {
        let mut bytes = ExtentEntry::new(0, 2, 100).to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ExtentEntry::from_bytes(&bytes),
            Err(LayoutError::EntryChecksum { .. })
        ));

        // An all-zero slot is never a valid entry
        assert!(ExtentEntry::from_bytes(&[0u8; ENTRY_SIZE]).is_err());
    }

    #[test]
    fn test_entry_slot_layout() {
        let mut entry = ExtentEntry::new(0x0102, 7, 0xABCD);
        entry.invalid_count = 3;
        let bytes = entry.to_bytes();

        assert_eq!(LittleEndian::read_u64(&bytes[0..8]), 0x0102);
        assert_eq!(LittleEndian::read_u32(&bytes[8..12]), 7);
        assert_eq!(LittleEndian::read_u32(&bytes[12..16]), entry.checksum());
        assert_eq!(bytes[ENTRY_SIZE - 1], 3);
        assert_eq!(
            unpack_tagged_block(LittleEndian::read_u64(&bytes[ENTRY_BLOCK_OFFSET..])),
            (0xABCD, 3)
        );

        let mut written = Vec::new();
        entry.write_to(&mut written).unwrap();
        assert_eq!(written, bytes);
        assert_eq!(ExtentEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_log_position_encoding() {
        let pos = LogPosition::new(9, 3);
        assert_eq!(pos.to_raw(), 9 * 4096 + 72);
        assert_eq!(LogPosition::from_raw(pos.to_raw()).unwrap(), Some(pos));

        let end = LogPosition::new(9, ENTRIES_PER_PAGE);
        assert!(end.is_page_end());
        assert_eq!(LogPosition::from_raw(end.to_raw()).unwrap(), Some(end));

        assert_eq!(LogPosition::from_raw(0).unwrap(), None);
        assert!(LogPosition::from_raw(9 * 4096 + 5).is_err());
        assert!(LogPosition::from_raw(9 * 4096 + 4088).is_err());
    }

    #[test]
    fn test_geometry_header() {
        let geometry = Geometry::new(1024, 300).unwrap();
        assert_eq!(geometry.inode_table_blocks, 2);
        assert_eq!(geometry.data_start, 3);
        assert_eq!(geometry.data_region(), BlockRange::new(3, 1023));
        assert_eq!(geometry.record_location(257), (2, 16));

        let block = geometry.to_block();
        assert_eq!(&block[..8], PMEXTENT_MAGIC);
        let mut header = Vec::new();
        geometry.write_to(&mut header).unwrap();
        assert_eq!(header.len(), Geometry::HEADER_LEN);
        assert_eq!(&block[..header.len()], &header[..]);
        assert!(block[header.len()..].iter().all(|&b| b == 0));

        let decoded = Geometry::read_from(&mut Cursor::new(&block[..])).unwrap();
        assert_eq!(decoded, geometry);

        let mut damaged = block.clone();
        damaged[20] ^= 1;
        assert!(matches!(
            Geometry::read_from(&mut Cursor::new(&damaged[..])),
            Err(LayoutError::HeaderChecksum)
        ));
        assert!(matches!(
            Geometry::read_from(&mut Cursor::new(&[0u8; 4096][..])),
            Err(LayoutError::BadMagic)
        ));
    }

    #[test]
    fn test_geometry_too_small() {
        assert!(Geometry::new(3, 256).is_err());
        assert!(Geometry::new(100, 0).is_err());
    }
}
