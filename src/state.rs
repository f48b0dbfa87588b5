use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Durable key/value state scoped to one running instance.
pub trait StateStore: Send + Sync {
    fn get_value(&self, key: &str) -> Result<Option<Value>>;
    fn set_value(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// A state key bound to the type stored under it.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub trait StateStoreExt: StateStore {
    fn get<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Result<Option<T>> {
        self.get_as(key.name())
    }

    fn set<T: Serialize>(&self, key: &StateKey<T>, value: &T) -> Result<()> {
        self.set_as(key.name(), value)
    }

    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key)? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_value(key, serde_json::to_value(value)?)
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_value(key)?
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|value| !value.is_empty()))
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// Whole-object JSON file shared between processes. Every read goes to disk
/// and every mutation re-reads the file under an exclusive lock.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
}

/// Exclusive lock on the state's sidecar lock file, released on drop.
struct StateLock(File);

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl FileStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<Map<String, Value>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "state file is corrupt, starting empty");
                Ok(Map::new())
            }
        }
    }

    fn lock(&self) -> Result<StateLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path.with_extension("json.lock"))?;
        FileExt::lock_exclusive(&file).map_err(|err| Error::State {
            path: self.path.clone(),
            message: format!("failed to lock state file: {err}"),
        })?;
        Ok(StateLock(file))
    }

    fn mutate(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        apply(&mut entries);
        let content = serde_json::to_string_pretty(&entries)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, content)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Value>>> {
        self.entries.lock().map_err(|_| Error::State {
            path: PathBuf::from("<memory>"),
            message: "state lock poisoned".to_string(),
        })
    }
}

impl StateStore for MemoryStateStore {
    fn get_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Per-workload status and container markers shared with the tree view.
pub struct WorkloadMarkers<'a> {
    store: &'a dyn StateStore,
}

impl<'a> WorkloadMarkers<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    fn container_key(workload_id: &str) -> String {
        format!("{workload_id}_container")
    }

    fn status_key(workload_id: &str) -> String {
        format!("{workload_id}_status")
    }

    pub fn container(&self, workload_id: &str) -> Result<Option<String>> {
        self.store.get_string(&Self::container_key(workload_id))
    }

    pub fn set_container(&self, workload_id: &str, container: &str) -> Result<()> {
        self.store
            .set_value(&Self::container_key(workload_id), Value::from(container))
    }

    pub fn clear_container(&self, workload_id: &str) -> Result<()> {
        self.store.remove(&Self::container_key(workload_id))
    }

    pub fn status(&self, workload_id: &str) -> Result<Option<String>> {
        self.store.get_string(&Self::status_key(workload_id))
    }

    pub fn set_status(&self, workload_id: &str, status: &str) -> Result<()> {
        self.store
            .set_value(&Self::status_key(workload_id), Value::from(status))
    }

    pub fn clear_status(&self, workload_id: &str) -> Result<()> {
        self.store.remove(&Self::status_key(workload_id))
    }
}
