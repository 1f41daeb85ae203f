//! Container metadata persistence
//!
//! Records are keyed by container ID. [`JsonFileStore`] keeps them in one
//! JSON object on disk, loaded wholesale at open and rewritten wholesale on
//! every mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use vessel_core::{ContainerId, ContainerRecord, Result};

/// Persistent store of container records
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Every stored record
    ///
    /// # Errors
    /// Returns error if the backing storage cannot be read
    fn load_all(&self) -> Result<Vec<ContainerRecord>>;

    /// Insert or replace a record
    ///
    /// # Errors
    /// Returns error if the record cannot be written
    fn save(&self, record: &ContainerRecord) -> Result<()>;

    /// Delete a record; deleting a missing record is not an error
    ///
    /// # Errors
    /// Returns error if the change cannot be written
    fn remove(&self, id: &ContainerId) -> Result<()>;

    /// Record by container ID
    ///
    /// # Errors
    /// Returns error if the backing storage cannot be read
    fn get(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        Ok(self.load_all()?.into_iter().find(|r| &r.id == id))
    }

    /// Record by container name
    ///
    /// # Errors
    /// Returns error if the backing storage cannot be read
    fn find_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        Ok(self.load_all()?.into_iter().find(|r| r.name() == name))
    }
}

/// Store backed by a single JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ContainerRecord>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading any existing records
    ///
    /// A missing or empty file starts an empty store.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = records.len(), "Loaded metadata");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Location of the file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, records: &BTreeMap<String, ContainerRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MetadataStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<ContainerRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().cloned().collect())
    }

    fn save(&self, record: &ContainerRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.id.to_string(), record.clone());
        self.flush(&records)
    }

    fn remove(&self, id: &ContainerId) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.remove(id.as_str()).is_some() {
            self.flush(&records)?;
        }
        Ok(())
    }

    fn get(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(id.as_str()).cloned())
    }
}
