use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// Flat key-value persistence area.
pub trait KeyValueStore {
    fn get(&mut self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()>;
    fn remove(&mut self, key: &str) -> anyhow::Result<()>;
}

/// Key-value store backed by a single JSON object on disk.
///
/// Reads refresh from disk; writes only touch the keys this instance
/// changed, merged over the current file contents, so two instances
/// sharing a file do not overwrite each other's keys.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let dirty_keys = std::mem::take(&mut self.dirty_keys);
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in dirty_keys {
                match payload.get(&key) {
                    Some(value) => {
                        on_disk.insert(key, value.clone());
                    }
                    None => {
                        on_disk.remove(&key);
                    }
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        let fresh = read_json_object(&self.path).unwrap_or_default();
        self.payload.insert(fresh)
    }

    fn mark_dirty(&mut self, key: &str) {
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&mut self, key: &str) -> Option<Value> {
        self.ensure_loaded().get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        let payload = self.ensure_loaded();
        if payload.get(key) == Some(&value) {
            return Ok(());
        }
        payload.insert(key.to_string(), value);
        self.mark_dirty(key);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        let payload = self.ensure_loaded();
        if payload.remove(key).is_none() {
            return Ok(());
        }
        self.mark_dirty(key);
        self.flush()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    values: BTreeMap<String, Value>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&mut self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};

    #[test]
    fn file_store_basic() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut store = FileKeyValueStore::new(&path);
        assert_eq!(store.get("theme"), None);
        store.set("theme", json!("dark"))?;
        assert_eq!(store.get("theme"), Some(json!("dark")));

        let mut reloaded = FileKeyValueStore::new(&path);
        assert_eq!(reloaded.get("theme"), Some(json!("dark")));
        Ok(())
    }

    #[test]
    fn file_store_get_returns_copy() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = FileKeyValueStore::new(temp.path().join("storage.json"));
        store.set("items", json!([{"value": 1}]))?;

        let mut fetched = store.get("items").unwrap_or_default();
        if let Some(row) = fetched.get_mut(0) {
            row["value"] = json!(99);
        }
        assert_eq!(store.get("items"), Some(json!([{"value": 1}])));
        Ok(())
    }

    #[test]
    fn file_store_merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut store_a = FileKeyValueStore::new(&path);
        let mut store_b = FileKeyValueStore::new(&path);

        store_a.set("a", json!(1))?;
        store_b.set("b", json!(2))?;
        store_a.set("c", json!(3))?;

        let mut reloaded = FileKeyValueStore::new(path);
        assert_eq!(reloaded.get("a"), Some(json!(1)));
        assert_eq!(reloaded.get("b"), Some(json!(2)));
        assert_eq!(reloaded.get("c"), Some(json!(3)));
        Ok(())
    }

    #[test]
    fn file_store_remove_persists() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut store = FileKeyValueStore::new(&path);
        store.set("a", json!(1))?;
        store.set("b", json!(2))?;
        store.remove("a")?;

        let mut reloaded = FileKeyValueStore::new(path);
        assert_eq!(reloaded.get("a"), None);
        assert_eq!(reloaded.get("b"), Some(json!(2)));
        Ok(())
    }

    #[test]
    fn file_store_survives_corrupt_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        std::fs::write(&path, "{not json")?;
        let mut store = FileKeyValueStore::new(&path);
        assert_eq!(store.get("a"), None);
        store.set("a", json!(true))?;
        assert_eq!(store.get("a"), Some(json!(true)));
        Ok(())
    }

    #[test]
    fn memory_store_roundtrip() -> anyhow::Result<()> {
        let mut store = MemoryKeyValueStore::new();
        store.set("k", json!({"x": 1}))?;
        assert_eq!(store.get("k"), Some(json!({"x": 1})));
        store.remove("k")?;
        assert_eq!(store.get("k"), None);
        Ok(())
    }
}
