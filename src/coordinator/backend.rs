//! Storage backends for the coordinator document store
//!
//! Supports in-memory, RocksDB, and sled backends. The store above this layer
//! owns encoding and invariants; a backend only moves bytes.

use crate::common::{Error, Result, StoreBackend};
use std::sync::Arc;
use rocksdb::{Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Column family holding one record per in-flight migration
pub const CF_MIGRATION_COORDINATORS: &str = "migrationCoordinators";

/// Trait for key-value storage backends
pub trait DocumentBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Every record, in key order
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Make prior writes durable
    fn flush(&self) -> Result<()>;
}

/// In-memory backend. Shared through an `Arc`, it outlives any coordinator
/// built on top of it, which is how tests model a process restart.
#[derive(Default)]
pub struct MemBackend {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DocumentBackend for MemBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map().get(key).cloned())
    }
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map().remove(key);
        Ok(())
    }
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// RocksDB backend over a single column family
pub struct RocksBackend {
    db: DB,
    cf_name: String,
}

impl RocksBackend {
    /// Open or create the coordinator document store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_cf(path, CF_MIGRATION_COORDINATORS)
    }

    pub fn open_cf(path: impl AsRef<Path>, cf_name: &str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![cf_name])?;
        Ok(Self {
            db,
            cf_name: cf_name.to_string(),
        })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(&self.cf_name).ok_or_else(|| {
            Error::Internal(format!("column family {} missing", self.cf_name))
        })
    }
}

impl DocumentBackend for RocksBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf()?, key)?)
    }
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.put_cf_opt(self.cf()?, key, value, &write_opts)?;
        Ok(())
    }
    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.delete_cf_opt(self.cf()?, key, &write_opts)?;
        Ok(())
    }
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let iter = self.db.iterator_cf(self.cf()?, rocksdb::IteratorMode::Start);
        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            records.push((key.to_vec(), value.to_vec()));
        }
        Ok(records)
    }
    fn flush(&self) -> Result<()> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }
}

/// Open the configured backend. `cf_name` names the RocksDB column family or
/// sled tree.
pub fn open_backend(
    kind: StoreBackend,
    path: &Path,
    cf_name: &str,
) -> Result<Arc<dyn DocumentBackend>> {
    match kind {
        StoreBackend::Memory => Ok(Arc::new(MemBackend::new())),
        StoreBackend::Rocksdb => Ok(Arc::new(RocksBackend::open_cf(path, cf_name)?)),
        #[cfg(feature = "sled-backend")]
        StoreBackend::Sled => Ok(Arc::new(SledBackend::open_tree(path, cf_name)?)),
        #[cfg(not(feature = "sled-backend"))]
        StoreBackend::Sled => Err(Error::InvalidConfig(
            "sled backend requires the sled-backend feature".into(),
        )),
    }
}

/// Sled backend
#[cfg(feature = "sled-backend")]
pub struct SledBackend {
    tree: sled::Tree,
}

#[cfg(feature = "sled-backend")]
impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_tree(path, CF_MIGRATION_COORDINATORS)
    }

    pub fn open_tree(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let db = sled::open(path).map_err(sled_err)?;
        let tree = db.open_tree(name).map_err(sled_err)?;
        Ok(Self { tree })
    }
}

#[cfg(feature = "sled-backend")]
fn sled_err(e: sled::Error) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(feature = "sled-backend")]
impl DocumentBackend for SledBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key).map_err(sled_err)?.map(|v| v.to_vec()))
    }
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value).map_err(sled_err)?;
        self.tree.flush().map_err(sled_err)?;
        Ok(())
    }
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key).map_err(sled_err)?;
        self.tree.flush().map_err(sled_err)?;
        Ok(())
    }
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (k, v) = item.map_err(sled_err)?;
            records.push((k.to_vec(), v.to_vec()));
        }
        Ok(records)
    }
    fn flush(&self) -> Result<()> {
        self.tree.flush().map_err(sled_err)?;
        Ok(())
    }
}
