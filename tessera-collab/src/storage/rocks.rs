//! RocksDB-backed snapshot store.
//!
//! Two column families share the 16 page-id bytes as key:
//! - `snapshots`: LZ4 frame of the page's JSON snapshot
//! - `records`: bincode [`PageRecord`]
//!
//! Both are written in one `WriteBatch`, so a page is either fully stored
//! or absent.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SnapshotStore, StoreError};

#[derive(Debug, Clone, Copy)]
enum Column {
    Snapshots,
    Records,
}

impl Column {
    const ALL: [Column; 2] = [Column::Snapshots, Column::Records];

    fn name(self) -> &'static str {
        match self {
            Column::Snapshots => "snapshots",
            Column::Records => "records",
        }
    }

    fn options(self, cache: &Cache) -> Options {
        let mut table = BlockBasedOptions::default();
        table.set_block_cache(cache);
        table.set_bloom_filter(10.0, false);

        let mut opts = Options::default();
        opts.set_block_based_table_factory(&table);
        // Snapshot values are LZ4 frames already.
        opts.set_compression_type(match self {
            Column::Snapshots => DBCompressionType::None,
            Column::Records => DBCompressionType::Lz4,
        });
        opts
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Shared block cache for both column families, in bytes
    pub cache_bytes: usize,
    /// fsync every write
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("tessera_data")
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_bytes: 32 << 20,
            sync_writes: false,
        }
    }

    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            cache_bytes: 1 << 20,
            ..Self::new(path)
        }
    }
}

/// What the store knows about a page besides its snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRecord {
    pub doc_id: Uuid,
    /// Bumped on every write
    pub revision: u64,
    pub raw_len: u64,
    pub stored_len: u64,
    /// Unix seconds
    pub first_saved: u64,
    pub last_saved: u64,
}

impl PageRecord {
    fn to_bytes(self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(record, _)| record)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))
    }
}

/// Durable page snapshots.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open or create the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(4);

        let cache = Cache::new_lru_cache(config.cache_bytes);
        let columns = Column::ALL
            .iter()
            .map(|c| ColumnFamilyDescriptor::new(c.name(), c.options(&cache)));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            columns,
        )?;
        info!("Opened page store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Write a page snapshot and return its updated record.
    pub fn save(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<PageRecord, StoreError> {
        let frame = lz4_flex::compress_prepend_size(snapshot);
        let now = unix_now();
        let record = match self.record(doc_id)? {
            Some(prev) => PageRecord {
                revision: prev.revision + 1,
                raw_len: snapshot.len() as u64,
                stored_len: frame.len() as u64,
                last_saved: now,
                ..prev
            },
            None => PageRecord {
                doc_id,
                revision: 1,
                raw_len: snapshot.len() as u64,
                stored_len: frame.len() as u64,
                first_saved: now,
                last_saved: now,
            },
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.column(Column::Snapshots)?, doc_id.as_bytes(), &frame);
        batch.put_cf(self.column(Column::Records)?, doc_id.as_bytes(), record.to_bytes()?);

        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &opts)?;

        debug!(
            "Saved page {} rev {} ({} -> {} bytes)",
            doc_id, record.revision, record.raw_len, record.stored_len
        );
        Ok(record)
    }

    /// The decompressed snapshot, if the page was ever saved.
    pub fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(frame) = self.db.get_cf(self.column(Column::Snapshots)?, doc_id.as_bytes())? else {
            return Ok(None);
        };
        lz4_flex::decompress_size_prepended(&frame)
            .map(Some)
            .map_err(|e| StoreError::CompressionError(e.to_string()))
    }

    pub fn record(&self, doc_id: Uuid) -> Result<Option<PageRecord>, StoreError> {
        self.db
            .get_cf(self.column(Column::Records)?, doc_id.as_bytes())?
            .map(|bytes| PageRecord::from_bytes(&bytes))
            .transpose()
    }

    pub fn contains(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.record(doc_id)?.is_some())
    }

    /// Every stored page id, in key order.
    pub fn pages(&self) -> Result<Vec<Uuid>, StoreError> {
        self.db
            .iterator_cf(self.column(Column::Records)?, IteratorMode::Start)
            .map(|item| {
                let (key, _) = item?;
                Uuid::from_slice(&key)
                    .map_err(|e| StoreError::DeserializationError(format!("bad page key: {e}")))
            })
            .collect()
    }

    pub fn remove(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for column in Column::ALL {
            batch.delete_cf(self.column(column)?, doc_id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables of both column families.
    pub fn flush(&self) -> Result<(), StoreError> {
        for column in Column::ALL {
            self.db.flush_cf(self.column(column)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn column(&self, column: Column) -> Result<&ColumnFamily, StoreError> {
        self.db.cf_handle(column.name()).ok_or_else(|| {
            StoreError::DatabaseError(format!("missing column family '{}'", column.name()))
        })
    }
}

impl SnapshotStore for DocumentStore {
    fn get(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        self.load(doc_id)
    }

    fn put(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save(doc_id, snapshot).map(drop)
    }

    fn delete(&self, doc_id: Uuid) -> Result<(), StoreError> {
        self.remove(doc_id)
    }

    fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        self.pages()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tessera_core::{BlockKind, Editor, TextStyle};

    use crate::storage::{decode_page, encode_page, StoredPage};

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn page_with(doc_id: Uuid, text: &str) -> Editor {
        let mut editor = Editor::new(doc_id, 1);
        editor.insert_block(0, BlockKind::Heading2).unwrap();
        let block = editor.block_id(0).unwrap();
        editor
            .insert_text(block, 0, text, TextStyle::empty())
            .unwrap();
        editor
    }

    #[test]
    fn test_open_empty() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.pages().unwrap().is_empty());
    }

    #[test]
    fn test_page_snapshot_roundtrip() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let bytes = encode_page(&StoredPage::new(page_with(doc_id, "Minutes").serialize())).unwrap();

        let record = store.save(doc_id, &bytes).unwrap();
        assert_eq!(record.doc_id, doc_id);
        assert_eq!(record.revision, 1);
        assert_eq!(record.raw_len, bytes.len() as u64);

        let loaded = store.load(doc_id).unwrap().unwrap();
        let page = Editor::deserialize(doc_id, decode_page(&loaded).unwrap().snapshot).unwrap();
        assert_eq!(page.text(), "Minutes");
    }

    #[test]
    fn test_missing_page() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        assert_eq!(store.load(doc_id).unwrap(), None);
        assert_eq!(store.record(doc_id).unwrap(), None);
        assert!(!store.contains(doc_id).unwrap());
    }

    #[test]
    fn test_revisions_keep_first_saved() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();

        let first = store.save(doc_id, b"one").unwrap();
        let second = store.save(doc_id, b"two, longer").unwrap();

        assert_eq!(second.revision, 2);
        assert_eq!(second.first_saved, first.first_saved);
        assert_eq!(store.record(doc_id).unwrap(), Some(second));
        assert_eq!(store.load(doc_id).unwrap().as_deref(), Some(&b"two, longer"[..]));
    }

    #[test]
    fn test_long_page_compresses() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let text = "lorem ipsum ".repeat(200);
        let bytes = encode_page(&StoredPage::new(page_with(doc_id, &text).serialize())).unwrap();

        let record = store.save(doc_id, &bytes).unwrap();
        assert!(
            record.stored_len * 4 < record.raw_len,
            "stored {} of {}",
            record.stored_len,
            record.raw_len
        );
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.put(a, b"a").unwrap();
        store.put(b, b"b").unwrap();

        let mut listed = store.list().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);

        store.delete(a).unwrap();
        store.delete(a).unwrap();
        assert!(!store.contains(a).unwrap());
        assert_eq!(store.list().unwrap(), vec![b]);
    }

    #[test]
    fn test_reopen_keeps_pages() {
        let dir = TempDir::new().unwrap();
        let doc_id = Uuid::new_v4();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put(doc_id, b"persisted").unwrap();
            store.flush().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get(doc_id).unwrap().as_deref(), Some(&b"persisted"[..]));
        assert_eq!(store.record(doc_id).unwrap().map(|r| r.revision), Some(1));
    }

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("tessera_data"));
        assert!(!config.sync_writes);
        assert!(StoreConfig::for_testing("x").cache_bytes < config.cache_bytes);
    }
}
