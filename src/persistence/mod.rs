//! # Persistence Module
//!
//! A small string key/value store that survives restarts. It holds operator
//! settings only (camera server URL, auto-discovery flag); session telemetry
//! is never persisted.
//!
//! Backed by a single TOML file written through on every change. There is
//! no schema versioning: unknown keys are kept, missing keys read as `None`.

use color_eyre::eyre::{eyre, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const CAMERA_URL_KEY: &str = "cameraUrl";
pub const AUTO_DISCOVERY_KEY: &str = "autoDiscovery";

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug)]
pub struct KeyValueStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl KeyValueStore {
    /// Opens the store at `path`, starting empty when the file is missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| eyre!("Failed to read settings file: {}", e))?;
            toml::from_str(&content)
                .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?
        } else {
            debug!("Settings file {} does not exist yet", path.display());
            BTreeMap::new()
        };

        info!(
            "Loaded {} persisted setting(s) from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(crate::config::APP_DIR);
        path.push(SETTINGS_FILE);
        path
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).await.and_then(|value| value.parse().ok())
    }

    /// Memory only changes once the file write succeeded.
    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let value = value.into();
        if entries.get(key) == Some(&value) {
            return Ok(());
        }
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value);
        self.flush(&updated).await?;
        *entries = updated;
        Ok(())
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, value.to_string()).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut updated = entries.clone();
        updated.remove(key);
        self.flush(&updated).await?;
        *entries = updated;
        Ok(())
    }

    // Called with the write lock held so concurrent writers cannot interleave
    // file contents.
    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
        }

        let content = toml::to_string_pretty(entries)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        debug!("Settings written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("nested").join("settings.toml");

        let store = KeyValueStore::open(&path).await.unwrap();
        assert_eq!(store.get(CAMERA_URL_KEY).await, None);
        store
            .set(CAMERA_URL_KEY, "http://10.0.0.7:5000")
            .await
            .unwrap();
        store.set_bool(AUTO_DISCOVERY_KEY, true).await.unwrap();

        let reopened = KeyValueStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get(CAMERA_URL_KEY).await.as_deref(),
            Some("http://10.0.0.7:5000")
        );
        assert_eq!(reopened.get_bool(AUTO_DISCOVERY_KEY).await, Some(true));
    }

    #[tokio::test]
    async fn remove_deletes_from_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.toml");

        let store = KeyValueStore::open(&path).await.unwrap();
        store.set(CAMERA_URL_KEY, "http://a").await.unwrap();
        store.remove(CAMERA_URL_KEY).await.unwrap();

        let reopened = KeyValueStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(CAMERA_URL_KEY).await, None);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let blocked = dir.path().join("blocked");
        let path = blocked.join("settings.toml");
        let store = KeyValueStore::open(&path).await.unwrap();
        // A plain file where the settings directory should go.
        tokio::fs::write(&blocked, "").await.unwrap();

        assert!(store.set(CAMERA_URL_KEY, "http://a").await.is_err());
        assert_eq!(store.get(CAMERA_URL_KEY).await, None);
        assert!(store.set(CAMERA_URL_KEY, "http://a").await.is_err());

        tokio::fs::remove_file(&blocked).await.unwrap();
        store.set(CAMERA_URL_KEY, "http://a").await.unwrap();
        let reopened = KeyValueStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(CAMERA_URL_KEY).await.as_deref(), Some("http://a"));
    }

    #[tokio::test]
    async fn failed_remove_keeps_the_value() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let blocked = dir.path().join("blocked");
        let path = blocked.join("settings.toml");
        let store = KeyValueStore::open(&path).await.unwrap();
        store.set(CAMERA_URL_KEY, "http://a").await.unwrap();

        tokio::fs::remove_dir_all(&blocked).await.unwrap();
        tokio::fs::write(&blocked, "").await.unwrap();

        assert!(store.remove(CAMERA_URL_KEY).await.is_err());
        assert_eq!(store.get(CAMERA_URL_KEY).await.as_deref(), Some("http://a"));
        assert!(store.remove(CAMERA_URL_KEY).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.toml");
        tokio::fs::write(&path, "not = [valid").await.unwrap();
        assert!(KeyValueStore::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn in_memory_store_works_without_files() {
        let store = KeyValueStore::in_memory();
        store.set(AUTO_DISCOVERY_KEY, "false").await.unwrap();
        assert_eq!(store.get_bool(AUTO_DISCOVERY_KEY).await, Some(false));
        assert!(store.path().is_none());

        store.set(AUTO_DISCOVERY_KEY, "maybe").await.unwrap();
        assert_eq!(store.get_bool(AUTO_DISCOVERY_KEY).await, None);
    }
}
