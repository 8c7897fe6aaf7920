//! Collaborator seams of the checker and their local implementations
//!
//! The checker never touches the platform directly. File access, artifact
//! location and the installed component list are injected through the traits
//! below; the result tiers use [`DistributedCache`] and [`ConfigStore`] from
//! the results module.

use crate::results::{ConfigStore, DistributedCache};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Filesystem operations used for reading descriptors and writing signatures
pub trait FileAccess: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_writable(&self, path: &Path) -> bool;
    /// Fails unless `path` is an existing directory
    fn assert_directory_exists(&self, path: &Path) -> io::Result<()>;
}

/// Resolves an artifact identity to its installed directory
pub trait ArtifactLocator: Send + Sync {
    fn app_path(&self, identity: &str) -> Option<PathBuf>;
}

/// The installed components of the platform
pub trait ComponentRegistry: Send + Sync {
    fn all_components(&self) -> Vec<String>;
    /// Whether the component ships with the platform release
    fn is_shipped(&self, identity: &str) -> bool;
}

/// [`FileAccess`] on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileAccess;

impl FileAccess for LocalFileAccess {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        fs::write(path, content)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_writable(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false)
    }

    fn assert_directory_exists(&self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Directory does not exist: {}", path.display()),
        ))
    }
}

/// Finds apps as `<app root>/<identity>` directories carrying `appinfo/`
#[derive(Debug, Clone, Default)]
pub struct AppsDirectoryLocator {
    app_roots: Vec<PathBuf>,
}

impl AppsDirectoryLocator {
    pub fn new(app_roots: Vec<PathBuf>) -> Self {
        AppsDirectoryLocator { app_roots }
    }

    pub fn app_roots(&self) -> &[PathBuf] {
        &self.app_roots
    }

    /// Every app identity found below the app roots, first root wins
    pub fn discover(&self) -> Vec<String> {
        let mut found = BTreeSet::new();
        for root in &self.app_roots {
            let Ok(entries) = fs::read_dir(root) else {
                trace!("App root not readable: {:?}", root);
                continue;
            };
            for entry in entries.flatten() {
                if entry.path().join("appinfo").is_dir() {
                    found.insert(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        found.into_iter().collect()
    }
}

impl ArtifactLocator for AppsDirectoryLocator {
    fn app_path(&self, identity: &str) -> Option<PathBuf> {
        if identity.is_empty() || identity.contains(['/', '\\']) || identity == ".." {
            return None;
        }
        self.app_roots
            .iter()
            .map(|root| root.join(identity))
            .find(|candidate| candidate.join("appinfo").is_dir())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ShippedList {
    #[serde(rename = "shippedApps", default)]
    shipped_apps: Vec<String>,
}

/// Installed apps from the app roots, shipped status from `core/shipped.json`
#[derive(Debug, Clone, Default)]
pub struct ShippedListRegistry {
    locator: AppsDirectoryLocator,
    shipped: BTreeSet<String>,
}

impl ShippedListRegistry {
    pub fn new(locator: AppsDirectoryLocator, shipped: impl IntoIterator<Item = String>) -> Self {
        ShippedListRegistry {
            locator,
            shipped: shipped.into_iter().collect(),
        }
    }

    /// Read `core/shipped.json` below the platform root, merged with `extra`
    ///
    /// A missing list is treated as empty.
    pub fn load(server_root: &Path, locator: AppsDirectoryLocator, extra: &[String]) -> Result<Self> {
        let path = server_root.join("core/shipped.json");
        let mut list = ShippedList::default();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read shipped list: {}", path.display()))?;
            list = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse shipped list: {}", path.display()))?;
        }
        debug!("{} shipped components listed in {:?}", list.shipped_apps.len(), path);
        Ok(Self::new(
            locator,
            list.shipped_apps.into_iter().chain(extra.iter().cloned()),
        ))
    }
}

impl ComponentRegistry for ShippedListRegistry {
    fn all_components(&self) -> Vec<String> {
        self.locator.discover()
    }

    fn is_shipped(&self, identity: &str) -> bool {
        self.shipped.contains(identity)
    }
}

/// Process-local [`DistributedCache`]
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl DistributedCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}

type Namespaces = BTreeMap<String, BTreeMap<String, String>>;

/// In-memory [`ConfigStore`]
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<Namespaces>,
}

impl ConfigStore for MemoryConfigStore {
    fn has_key(&self, namespace: &str, key: &str) -> Result<bool> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(namespace).is_some_and(|ns| ns.contains_key(key)))
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_key(&self, namespace: &str, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ns) = values.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    fn update_value(
        &self,
        namespace: &str,
        key: &str,
        update: &mut dyn FnMut(Option<String>) -> Result<String>,
    ) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let current = values.get(namespace).and_then(|ns| ns.get(key)).cloned();
        let updated = update(current)?;
        values
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), updated);
        Ok(())
    }
}

/// [`ConfigStore`] persisted as one JSON document `{namespace: {key: value}}`
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileConfigStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Namespaces> {
        if !self.path.exists() {
            return Ok(Namespaces::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read result store: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Namespaces::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse result store: {}", self.path.display()))
    }

    fn save(&self, values: &Namespaces) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write result store: {}", self.path.display()))
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn has_key(&self, namespace: &str, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.get(namespace).is_some_and(|ns| ns.contains_key(key)))
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.load()?;
        values
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn delete_key(&self, namespace: &str, key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.load()?;
        let removed = values
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key))
            .is_some();
        if removed {
            self.save(&values)?;
        }
        Ok(())
    }

    fn update_value(
        &self,
        namespace: &str,
        key: &str,
        update: &mut dyn FnMut(Option<String>) -> Result<String>,
    ) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.load()?;
        let current = values.get(namespace).and_then(|ns| ns.get(key)).cloned();
        let updated = update(current)?;
        values
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), updated);
        self.save(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_app(root: &Path, id: &str) {
        fs::create_dir_all(root.join(id).join("appinfo")).unwrap();
    }

    #[test]
    fn test_locator_searches_roots_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let apps = temp_dir.path().join("apps");
        let custom = temp_dir.path().join("custom_apps");
        make_app(&apps, "files");
        make_app(&custom, "files");
        make_app(&custom, "notes");

        let locator = AppsDirectoryLocator::new(vec![apps.clone(), custom.clone()]);
        assert_eq!(locator.app_path("files"), Some(apps.join("files")));
        assert_eq!(locator.app_path("notes"), Some(custom.join("notes")));
        assert_eq!(locator.app_path("missing"), None);
        assert_eq!(locator.app_path("../apps"), None);
        assert_eq!(locator.discover(), vec!["files", "notes"]);
    }

    #[test]
    fn test_locator_ignores_directories_without_appinfo() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("stray")).unwrap();
        let locator = AppsDirectoryLocator::new(vec![temp_dir.path().to_path_buf()]);
        assert!(locator.discover().is_empty());
        assert_eq!(locator.app_path("stray"), None);
    }

    #[test]
    fn test_shipped_registry_reads_shipped_list() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("core")).unwrap();
        fs::write(
            root.join("core/shipped.json"),
            r#"{"shippedApps": ["files", "dashboard"], "alwaysEnabled": ["files"]}"#,
        )
        .unwrap();
        make_app(&root.join("apps"), "files");
        make_app(&root.join("apps"), "notes");

        let locator = AppsDirectoryLocator::new(vec![root.join("apps")]);
        let registry = ShippedListRegistry::load(root, locator, &["notes".to_string()]).unwrap();
        assert!(registry.is_shipped("files"));
        assert!(registry.is_shipped("notes"));
        assert!(!registry.is_shipped("calendar"));
        assert_eq!(registry.all_components(), vec!["files", "notes"]);
    }

    #[test]
    fn test_json_file_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/results.json");

        let store = JsonFileConfigStore::new(&path);
        assert!(!store.has_key("core", "k").unwrap());
        store.set_value("core", "k", "v").unwrap();

        let reopened = JsonFileConfigStore::new(&path);
        assert_eq!(reopened.get_value("core", "k").unwrap().as_deref(), Some("v"));
        reopened.delete_key("core", "k").unwrap();
        assert!(!store.has_key("core", "k").unwrap());
    }

    #[test]
    fn test_json_file_store_update_sees_previous_value() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileConfigStore::new(temp_dir.path().join("results.json"));

        store
            .update_value("core", "k", &mut |current| {
                assert_eq!(current, None);
                Ok("1".to_string())
            })
            .unwrap();
        store
            .update_value("core", "k", &mut |current| {
                Ok(format!("{}2", current.unwrap_or_default()))
            })
            .unwrap();
        assert_eq!(store.get_value("core", "k").unwrap().as_deref(), Some("12"));
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::default();
        assert_eq!(cache.get("k"), None);
        cache.set("k", "v");
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.remove("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_local_file_access_directory_assertion() {
        let temp_dir = TempDir::new().unwrap();
        let access = LocalFileAccess;
        assert!(access.assert_directory_exists(temp_dir.path()).is_ok());
        assert!(access
            .assert_directory_exists(&temp_dir.path().join("nope"))
            .is_err());
        assert!(access.is_writable(temp_dir.path()));
    }
}
