//! Opaque byte payload

use crate::cache::unit::{Cacheable, UnitState};
use crate::error::CacheError;
use crate::storage::backing_file::BackingFile;
use crate::storage::record::{read_record, record_len, write_record, RecordKind};
use crate::types::FileRange;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A growable block of bytes that can be paged out
///
/// Accessors return `Precondition` if the block is not loaded; touch or pin it
/// through the eviction buffer first.
#[derive(Debug)]
pub struct ByteBlock {
    state: UnitState,
    data: RwLock<Option<Vec<u8>>>,
    /// Payload length, kept while the data is paged out
    len: AtomicU64,
}

impl ByteBlock {
    /// New in-memory block; dirty until first saved
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            state: UnitState::new(),
            len: AtomicU64::new(data.len() as u64),
            data: RwLock::new(Some(data)),
        }
    }

    /// Block whose `len` bytes are stored in `range` of the backing file
    pub fn on_disk(range: FileRange, len: u64) -> Self {
        Self {
            state: UnitState::on_disk(range),
            data: RwLock::new(None),
            len: AtomicU64::new(len),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the loaded bytes
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, CacheError> {
        let data = self.data.read();
        let bytes = data.as_deref().ok_or_else(not_loaded)?;
        Ok(f(bytes))
    }

    /// Copy of the loaded bytes
    pub fn to_vec(&self) -> Result<Vec<u8>, CacheError> {
        self.read(<[u8]>::to_vec)
    }

    /// Mutate the loaded bytes in place
    ///
    /// Marks the block changed and returns `f`'s result together with the
    /// change in memory footprint, for `EvictionBuffer::note_size_changed`.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> Result<(R, i64), CacheError> {
        let mut data = self.data.write();
        let bytes = data.as_mut().ok_or_else(not_loaded)?;

        let before = bytes.len() as i64;
        let result = f(&mut *bytes);
        let after = bytes.len() as i64;

        self.len.store(after as u64, Ordering::Release);
        self.state.set_data_changed();
        Ok((result, after - before))
    }
}

fn not_loaded() -> CacheError {
    CacheError::Precondition("byte block is not loaded".to_string())
}

impl Cacheable for ByteBlock {
    fn state(&self) -> &UnitState {
        &self.state
    }

    fn write_to(&self, file: &BackingFile, range: FileRange) -> Result<(), CacheError> {
        let data = self.data.read();
        let bytes = data.as_deref().ok_or_else(not_loaded)?;
        write_record(file, range, RecordKind::Bytes, bytes)
    }

    fn read_from(&self, file: &BackingFile, range: FileRange) -> Result<(), CacheError> {
        let payload = read_record(file, range, RecordKind::Bytes)?;
        self.len.store(payload.len() as u64, Ordering::Release);
        *self.data.write() = Some(payload);
        Ok(())
    }

    fn release_memory(&self) {
        *self.data.write() = None;
    }

    fn total_data_size(&self) -> u64 {
        record_len(self.len())
    }

    fn data_memory_size(&self) -> u64 {
        self.data
            .read()
            .as_ref()
            .map_or(0, |bytes| bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_clear_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("blocks.bin")).unwrap();

        let block = ByteBlock::new(b"hello, backing file".to_vec());
        let range = FileRange::new(0, block.total_data_size());
        block.state().assign_range(range);

        block.save(&file).unwrap();
        assert!(block.was_saved());
        assert!(!block.is_dirty());

        block.clear_data_from_memory().unwrap();
        assert!(!block.is_loaded());
        assert_eq!(block.data_memory_size(), 0);
        assert_eq!(block.total_data_size(), range.length);
        assert!(block.to_vec().is_err());

        block.load(&file).unwrap();
        assert_eq!(block.to_vec().unwrap(), b"hello, backing file");
        assert!(!block.is_dirty());
    }

    #[test]
    fn test_update_reports_delta_and_dirties() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("blocks.bin")).unwrap();

        let block = ByteBlock::new(vec![1, 2, 3]);
        block.state().assign_range(FileRange::new(0, block.total_data_size()));
        block.save(&file).unwrap();

        let (_, delta) = block.update(|bytes| bytes.extend_from_slice(&[4, 5])).unwrap();
        assert_eq!(delta, 2);
        assert_eq!(block.len(), 5);
        assert!(block.is_dirty());
    }

    #[test]
    fn test_clear_dirty_block_rejected() {
        let block = ByteBlock::new(vec![0; 8]);
        assert!(matches!(
            block.clear_data_from_memory(),
            Err(CacheError::Precondition(_))
        ));
        assert!(block.is_loaded());
    }

    #[test]
    fn test_clear_busy_block_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("blocks.bin")).unwrap();
        let block = ByteBlock::new(vec![0; 8]);
        block.state().assign_range(FileRange::new(0, block.total_data_size()));
        block.save(&file).unwrap();

        block.set_busy(true);
        assert!(block.clear_data_from_memory().is_err());
        block.set_busy(false);
        assert!(block.clear_data_from_memory().is_ok());
    }

    #[test]
    fn test_load_from_empty_range_fails() {
        let temp_dir = TempDir::new().unwrap();
        let file = BackingFile::create(temp_dir.path().join("blocks.bin")).unwrap();
        let block = ByteBlock::on_disk(FileRange::new(0, 32), 8);
        assert!(block.load(&file).is_err());
        assert!(!block.is_loaded());
    }
}
