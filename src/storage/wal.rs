use super::disk::DiskManager;
use super::page::PAGE_SIZE;
use crate::errors::DbError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One page-level redo record. Framed on disk as
/// `u32 length ‖ bincode body ‖ u32 crc32(body)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: u64,
    pub page_id: u64,
    pub before: Option<serde_bytes::ByteBuf>,
    pub after: serde_bytes::ByteBuf,
}

struct WalInner {
    file: File,
    next_lsn: u64,
}

/// Append-only redo log colocated with the data file. The buffer pool
/// flushes this log before any dirty page reaches the data file.
pub struct Wal {
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens (or creates) the log, positioned for appends.
    /// `start_lsn` seeds the LSN counter; callers pass the maximum of
    /// the header checkpoint LSN and the highest replayed LSN.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn open(path: &Path, start_lsn: u64) -> Result<Self, DbError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self { inner: Mutex::new(WalInner { file, next_lsn: start_lsn + 1 }) })
    }

    /// Appends a redo record and returns its LSN. Durability requires a
    /// following `flush()`.
    /// # Errors
    /// `Io` on filesystem failure, `Encode` if the record fails to
    /// serialize.
    pub fn append(
        &self,
        page_id: u64,
        before: Option<Vec<u8>>,
        after: Vec<u8>,
    ) -> Result<u64, DbError> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let record = WalRecord {
            lsn,
            page_id,
            before: before.map(serde_bytes::ByteBuf::from),
            after: serde_bytes::ByteBuf::from(after),
        };
        let body = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;
        let crc = crc32fast::hash(&body);
        inner.file.write_all(&(body.len() as u32).to_le_bytes())?;
        inner.file.write_all(&body)?;
        inner.file.write_all(&crc.to_le_bytes())?;
        Ok(lsn)
    }

    /// # Errors
    /// `Io` on filesystem failure.
    pub fn flush(&self) -> Result<(), DbError> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    #[must_use]
    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    /// Truncates the log after a checkpoint. The LSN counter keeps
    /// rising.
    /// # Errors
    /// `Io` on filesystem failure.
    pub fn truncate(&self) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Replays the log against the data file: every record whose LSN
    /// exceeds the on-disk page's LSN is reapplied. A torn record (bad
    /// checksum or short frame) terminates replay; the tail after it is
    /// discarded. Returns the highest LSN seen.
    /// # Errors
    /// `Io` on filesystem failure while reading the log or writing
    /// repaired pages.
    pub fn replay(path: &Path, disk: &DiskManager) -> Result<u64, DbError> {
        if !path.exists() {
            return Ok(0);
        }
        let mut file = File::open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let mut offset = 0usize;
        let mut max_lsn = 0u64;
        let mut applied = 0u64;
        while offset + 4 <= raw.len() {
            let len = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap_or([0; 4])) as usize;
            if offset + 4 + len + 4 > raw.len() {
                log::warn!("wal: short frame at offset {offset}, discarding tail");
                break;
            }
            let body = &raw[offset + 4..offset + 4 + len];
            let stored_crc = u32::from_le_bytes(
                raw[offset + 4 + len..offset + 8 + len].try_into().unwrap_or([0; 4]),
            );
            if crc32fast::hash(body) != stored_crc {
                log::warn!("wal: bad checksum at offset {offset}, discarding tail");
                break;
            }
            let (record, _): (WalRecord, usize) =
                bincode::serde::decode_from_slice(body, bincode::config::standard())?;
            offset += 8 + len;
            max_lsn = max_lsn.max(record.lsn);
            if record.after.len() != PAGE_SIZE {
                return Err(DbError::Corruption(format!(
                    "wal record {} carries a {}-byte image",
                    record.lsn,
                    record.after.len()
                )));
            }
            // A torn or missing data page reads as LSN 0 and gets redone.
            let page_lsn = disk
                .read_page_raw(record.page_id)?
                .and_then(|image| super::page::Page::from_bytes(image).ok())
                .map_or(0, |p| p.lsn());
            if record.lsn > page_lsn {
                let mut image = [0u8; PAGE_SIZE];
                image.copy_from_slice(&record.after);
                // Logged images predate checksum stamping; restamp so the
                // repaired page reads back clean.
                let mut page = super::page::Page::from_bytes_unchecked(image);
                page.stamp_checksum();
                disk.write_page_raw(record.page_id, page.bytes())?;
                applied += 1;
            }
        }
        if applied > 0 {
            disk.sync()?;
            log::info!("wal: replayed {applied} record(s), max lsn {max_lsn}");
        }
        Ok(max_lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopResources;
    use crate::storage::page::{Page, PageType};
    use std::sync::Arc;

    #[test]
    fn lsns_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.log"), 0).unwrap();
        let a = wal.append(1, None, vec![0u8; PAGE_SIZE]).unwrap();
        let b = wal.append(1, None, vec![0u8; PAGE_SIZE]).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn replay_redoes_lost_page_writes() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.db");
        let wal_path = dir.path().join("wal.log");

        let disk = DiskManager::open(&data_path, Arc::new(NoopResources)).unwrap();
        let wal = Wal::open(&wal_path, 0).unwrap();
        let id = disk.allocate().unwrap();
        let mut page = Page::new(id, PageType::Data);
        page.insert_record(b"durable");
        let lsn = wal.append(id, None, page.bytes().to_vec()).unwrap();
        page.set_lsn(lsn);
        wal.append(id, None, page.bytes().to_vec()).unwrap();
        wal.flush().unwrap();
        // "Crash" before the data-file write ever happens.
        drop((disk, wal));

        let disk = DiskManager::open(&data_path, Arc::new(NoopResources)).unwrap();
        let max = Wal::replay(&wal_path, &disk).unwrap();
        assert_eq!(max, 2);
        let restored = disk.read_page(id).unwrap();
        assert_eq!(restored.read_record(0), Some(&b"durable"[..]));
    }

    #[test]
    fn torn_record_discards_tail() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.db");
        let wal_path = dir.path().join("wal.log");
        let disk = DiskManager::open(&data_path, Arc::new(NoopResources)).unwrap();
        let id = disk.allocate().unwrap();

        let wal = Wal::open(&wal_path, 0).unwrap();
        let mut good = Page::new(id, PageType::Data);
        good.insert_record(b"kept");
        good.set_lsn(1);
        good.stamp_checksum();
        wal.append(id, None, good.bytes().to_vec()).unwrap();
        wal.append(id, None, vec![1u8; PAGE_SIZE]).unwrap();
        wal.flush().unwrap();
        drop(wal);

        // Corrupt the second record's body.
        let mut raw = std::fs::read(&wal_path).unwrap();
        let last = raw.len() - 20;
        raw[last] ^= 0xff;
        std::fs::write(&wal_path, raw).unwrap();

        let max = Wal::replay(&wal_path, &disk).unwrap();
        assert_eq!(max, 1);
        assert_eq!(disk.read_page(id).unwrap().read_record(0), Some(&b"kept"[..]));
    }
}
