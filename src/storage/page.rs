use crate::errors::DbError;

/// Fixed page size; a build constant, not a per-database setting.
pub const PAGE_SIZE: usize = 4096;
/// Bytes reserved at the front of every page image.
pub const PAGE_HEADER_SIZE: usize = 32;

pub type PageId = u64;

const SLOT_ENTRY_SIZE: usize = 4;

// Header layout, little-endian:
//   0..8   page id
//   8      page type
//   9      flags
//   10..12 slot count
//   12..14 free-space offset (start of the record area)
//   14..16 reserved
//   16..24 lsn
//   24..28 crc32 (computed with this field zeroed)
//   28..32 reserved

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Meta,
    Data,
    Index,
    Free,
    Overflow,
}

impl PageType {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Meta => 0,
            Self::Data => 1,
            Self::Index => 2,
            Self::Free => 3,
            Self::Overflow => 4,
        }
    }

    /// # Errors
    /// Returns `Corruption` for an unknown tag byte.
    pub fn from_u8(tag: u8) -> Result<Self, DbError> {
        Ok(match tag {
            0 => Self::Meta,
            1 => Self::Data,
            2 => Self::Index,
            3 => Self::Free,
            4 => Self::Overflow,
            other => return Err(DbError::Corruption(format!("unknown page type {other}"))),
        })
    }
}

/// One fixed-size page image. Data pages use a slotted layout: the slot
/// directory grows down from the header, records grow up from the tail,
/// and the free space is the gap between them.
#[derive(Clone)]
pub struct Page {
    buf: [u8; PAGE_SIZE],
}

impl Page {
    #[must_use]
    pub fn new(id: PageId, page_type: PageType) -> Self {
        let mut page = Self { buf: [0u8; PAGE_SIZE] };
        page.set_id(id);
        page.set_page_type(page_type);
        page.set_free_space_offset(PAGE_SIZE as u16);
        page
    }

    /// # Errors
    /// Returns `Corruption` when the image fails its checksum.
    pub fn from_bytes(bytes: [u8; PAGE_SIZE]) -> Result<Self, DbError> {
        let page = Self { buf: bytes };
        if !page.verify_checksum() {
            return Err(DbError::Corruption(format!("page {} checksum mismatch", page.id())));
        }
        Ok(page)
    }

    #[must_use]
    pub const fn from_bytes_unchecked(bytes: [u8; PAGE_SIZE]) -> Self {
        Self { buf: bytes }
    }

    #[must_use]
    pub const fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.buf
    }

    #[must_use]
    pub fn id(&self) -> PageId {
        u64::from_le_bytes(self.buf[0..8].try_into().unwrap_or([0; 8]))
    }

    pub fn set_id(&mut self, id: PageId) {
        self.buf[0..8].copy_from_slice(&id.to_le_bytes());
    }

    /// # Errors
    /// Returns `Corruption` for an unknown type tag.
    pub fn page_type(&self) -> Result<PageType, DbError> {
        PageType::from_u8(self.buf[8])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.buf[8] = page_type.as_u8();
    }

    #[must_use]
    pub fn slot_count(&self) -> u16 {
        u16::from_le_bytes([self.buf[10], self.buf[11]])
    }

    fn set_slot_count(&mut self, count: u16) {
        self.buf[10..12].copy_from_slice(&count.to_le_bytes());
    }

    #[must_use]
    pub fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes([self.buf[12], self.buf[13]])
    }

    fn set_free_space_offset(&mut self, offset: u16) {
        self.buf[12..14].copy_from_slice(&offset.to_le_bytes());
    }

    #[must_use]
    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(self.buf[16..24].try_into().unwrap_or([0; 8]))
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.buf[16..24].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Recomputes and stamps the checksum; call before writing out.
    pub fn stamp_checksum(&mut self) {
        self.buf[24..28].copy_from_slice(&[0; 4]);
        let crc = crc32fast::hash(&self.buf);
        self.buf[24..28].copy_from_slice(&crc.to_le_bytes());
    }

    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        let stored = u32::from_le_bytes([self.buf[24], self.buf[25], self.buf[26], self.buf[27]]);
        let mut copy = self.buf;
        copy[24..28].copy_from_slice(&[0; 4]);
        crc32fast::hash(&copy) == stored
    }

    /// Page body after the header, for non-slotted users (free-list
    /// links, B+ tree node payloads).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }

    // --- slotted layout ---

    fn slot(&self, slot: u16) -> Option<(u16, u16)> {
        if slot >= self.slot_count() {
            return None;
        }
        let at = PAGE_HEADER_SIZE + usize::from(slot) * SLOT_ENTRY_SIZE;
        let offset = u16::from_le_bytes([self.buf[at], self.buf[at + 1]]);
        let len = u16::from_le_bytes([self.buf[at + 2], self.buf[at + 3]]);
        Some((offset, len))
    }

    fn set_slot(&mut self, slot: u16, offset: u16, len: u16) {
        let at = PAGE_HEADER_SIZE + usize::from(slot) * SLOT_ENTRY_SIZE;
        self.buf[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        self.buf[at + 2..at + 4].copy_from_slice(&len.to_le_bytes());
    }

    /// Bytes available for one more record plus its slot entry.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let dir_end = PAGE_HEADER_SIZE + usize::from(self.slot_count()) * SLOT_ENTRY_SIZE;
        usize::from(self.free_space_offset()).saturating_sub(dir_end)
    }

    /// Appends a record and returns its slot id, or `None` when the
    /// record plus a slot entry does not fit.
    pub fn insert_record(&mut self, record: &[u8]) -> Option<u16> {
        if record.is_empty() || record.len() + SLOT_ENTRY_SIZE > self.free_space() {
            return None;
        }
        let slot = self.slot_count();
        let offset = usize::from(self.free_space_offset()) - record.len();
        self.buf[offset..offset + record.len()].copy_from_slice(record);
        self.set_slot_count(slot + 1);
        self.set_slot(slot, offset as u16, record.len() as u16);
        self.set_free_space_offset(offset as u16);
        Some(slot)
    }

    /// Returns the record at `slot`, or `None` for a tombstone or an
    /// out-of-range slot.
    #[must_use]
    pub fn read_record(&self, slot: u16) -> Option<&[u8]> {
        let (offset, len) = self.slot(slot)?;
        if len == 0 {
            return None;
        }
        Some(&self.buf[usize::from(offset)..usize::from(offset) + usize::from(len)])
    }

    /// Tombstones a slot. Space is reclaimed by `compact`.
    pub fn delete_record(&mut self, slot: u16) -> bool {
        match self.slot(slot) {
            Some((_, len)) if len > 0 => {
                self.set_slot(slot, 0, 0);
                true
            }
            _ => false,
        }
    }

    /// Overwrites a record in place when the new bytes fit the old slot.
    pub fn update_record_in_place(&mut self, slot: u16, record: &[u8]) -> bool {
        match self.slot(slot) {
            Some((offset, len)) if len > 0 && record.len() <= usize::from(len) => {
                let start = usize::from(offset);
                self.buf[start..start + record.len()].copy_from_slice(record);
                self.set_slot(slot, offset, record.len() as u16);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        (0..self.slot_count()).filter(|s| self.slot(*s).is_some_and(|(_, len)| len == 0)).count()
    }

    /// Repacks live records at the tail. Slot ids are preserved, so
    /// record ids stay stable across compaction.
    pub fn compact(&mut self) {
        let live: Vec<(u16, Vec<u8>)> = (0..self.slot_count())
            .filter_map(|s| self.read_record(s).map(|r| (s, r.to_vec())))
            .collect();
        let mut offset = PAGE_SIZE;
        for (slot, record) in live {
            offset -= record.len();
            self.buf[offset..offset + record.len()].copy_from_slice(&record);
            self.set_slot(slot, offset as u16, record.len() as u16);
        }
        self.set_free_space_offset(offset as u16);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("type", &self.buf[8])
            .field("slots", &self.slot_count())
            .field("lsn", &self.lsn())
            .finish()
    }
}
