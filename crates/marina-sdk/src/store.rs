use std::collections::HashMap;
use std::sync::Mutex;

/// Minimal key-value contract consumed by the wallet repository.
///
/// The `marina-store` crate implements this trait on top of SQLite; the SDK
/// ships an in-memory implementation for tests and ephemeral wallets. Errors
/// are reported as strings so that backends do not need to depend on the SDK
/// error type.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetch the values present for `keys`. Missing keys are absent from the map.
    fn get(&self, keys: &[String]) -> Result<HashMap<String, String>, String>;

    /// Insert or overwrite every entry atomically.
    fn set(&self, entries: HashMap<String, String>) -> Result<(), String>;

    /// Delete `keys`. Unknown keys are ignored.
    fn remove(&self, keys: &[String]) -> Result<(), String>;

    /// Remove every entry.
    fn clear(&self) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, keys: &[String]) -> Result<HashMap<String, String>, String> {
        let entries = self.entries.lock().map_err(|e| e.to_string())?;
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn set(&self, new_entries: HashMap<String, String>) -> Result<(), String> {
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        entries.extend(new_entries);
        Ok(())
    }

    fn remove(&self, keys: &[String]) -> Result<(), String> {
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), String> {
        self.entries.lock().map_err(|e| e.to_string())?.clear();
        Ok(())
    }
}
