//! Routing table storage
//!
//! The table is loaded from disk once at startup and served from memory.
//! Every mutation is written to a sibling temp file and renamed over the
//! store file before the new table becomes visible to readers, so a reader
//! sees either the old table or the new one, never a mix.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Errors from reading or writing the routing table
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize routing table: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("invalid hostname {0:?}")]
    InvalidHostname(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A route as it is stored on disk, keyed by hostname
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub target: String,
    #[serde(default)]
    pub name: String,
}

/// A resolved hostname-to-backend mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub hostname: String,
    pub target: String,
    #[serde(rename = "name")]
    pub display_name: String,
}

/// Hostname to route mapping. Serializes as `{ "<hostname>": { "target", "name" } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    routes: BTreeMap<String, RouteEntry>,
}

impl RoutingTable {
    /// The table a fresh installation starts with
    pub fn builtin() -> Self {
        let mut table = Self::default();
        for (hostname, target, name) in [
            ("fido.moi.gov.tw", "https://localhost:5000", "FIDO Issuer"),
            ("land.moi.gov.tw", "https://localhost:5001", "Land Issuer"),
            ("zuvi.io", "https://localhost:5002", "Zuvi Issuer"),
        ] {
            table.routes.insert(
                hostname.to_string(),
                RouteEntry {
                    target: target.to_string(),
                    name: name.to_string(),
                },
            );
        }
        table
    }

    pub fn get(&self, hostname: &str) -> Option<Route> {
        self.routes.get(hostname).map(|entry| Route {
            hostname: hostname.to_string(),
            target: entry.target.clone(),
            display_name: entry.name.clone(),
        })
    }

    /// Insert or replace a route. Returns the previous route for the hostname.
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        let previous = self.get(&route.hostname);
        self.routes.insert(
            route.hostname,
            RouteEntry {
                target: route.target,
                name: route.display_name,
            },
        );
        previous
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.routes.contains_key(hostname)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All routes ordered by hostname
    pub fn routes(&self) -> impl Iterator<Item = Route> + '_ {
        self.routes.iter().map(|(hostname, entry)| Route {
            hostname: hostname.clone(),
            target: entry.target.clone(),
            display_name: entry.name.clone(),
        })
    }

    /// Lowercase keys and fill in missing display names
    fn normalized(self) -> Self {
        let mut table = Self::default();
        for (hostname, mut entry) in self.routes {
            let Some(hostname) = normalize_hostname(&hostname) else {
                warn!(hostname, "Dropping routing table entry with invalid hostname");
                continue;
            };
            if entry.name.trim().is_empty() {
                entry.name = hostname.clone();
            }
            table.routes.insert(hostname, entry);
        }
        table
    }
}

/// Trim, strip a `:port` suffix, and lowercase a hostname
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let host = match trimmed.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => trimmed,
    };
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("routes.json"));
    name.push(suffix);
    path.with_file_name(name)
}

async fn read_table(path: &Path) -> Result<Option<RoutingTable>, StoreError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let table: RoutingTable = serde_json::from_slice(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Some(table.normalized()))
}

/// Load the routing table from disk.
///
/// A missing or unparseable file yields the built-in table, which is then
/// persisted. An unparseable file is kept next to the store as `<file>.corrupt`.
/// A file that exists but cannot be read is left untouched and the built-in
/// table is served from memory only. This never fails.
pub async fn load_table(path: &Path) -> RoutingTable {
    match read_table(path).await {
        Ok(Some(table)) => {
            info!(path = %path.display(), route_count = table.len(), "Loaded routing table");
            return table;
        }
        Ok(None) => {
            info!(path = %path.display(), "No routing table found, seeding built-in routes");
        }
        Err(e @ StoreError::Parse { .. }) => {
            let backup = sibling_path(path, ".corrupt");
            warn!(
                error = %e,
                backup = %backup.display(),
                "Routing table is corrupt, falling back to built-in routes"
            );
            if let Err(e) = tokio::fs::rename(path, &backup).await {
                warn!(path = %path.display(), error = %e, "Failed to preserve corrupt routing table");
            }
        }
        Err(e) => {
            warn!(
                error = %e,
                "Routing table is unreadable, serving built-in routes without overwriting it"
            );
            return RoutingTable::builtin();
        }
    }

    let table = RoutingTable::builtin();
    if let Err(e) = save_table(path, &table).await {
        error!(error = %e, "Failed to persist built-in routing table");
    }
    table
}

/// Write the whole table to disk atomically (temp file, fsync, rename)
pub async fn save_table(path: &Path, table: &RoutingTable) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(table).map_err(StoreError::Serialize)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp_path = sibling_path(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    file.write_all(&content)
        .await
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    debug!(path = %path.display(), route_count = table.len(), "Saved routing table");
    Ok(())
}

/// Process-wide routing table with durable, serialized writes
pub struct RoutingStore {
    path: PathBuf,
    /// Last committed table. Readers clone the Arc and never wait on disk I/O.
    current: RwLock<Arc<RoutingTable>>,
    /// Held for the whole read-modify-write-persist cycle of an upsert
    write_lock: Mutex<()>,
}

impl RoutingStore {
    /// Load the table from `path` (seeding it if needed)
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = load_table(&path).await;
        Self::with_table(path, table)
    }

    /// Build a store around an already loaded table
    pub fn with_table(path: impl Into<PathBuf>, table: RoutingTable) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(table)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.current.read().clone()
    }

    pub fn get(&self, hostname: &str) -> Option<Route> {
        self.current.read().get(hostname)
    }

    /// Set the route for `hostname`, persisting before returning.
    ///
    /// `display_name` defaults to the hostname. On error the in-memory table
    /// is left unchanged.
    pub async fn upsert(
        &self,
        hostname: &str,
        target: &str,
        display_name: Option<&str>,
    ) -> Result<Route, StoreError> {
        let hostname =
            normalize_hostname(hostname).ok_or_else(|| StoreError::InvalidHostname(hostname.to_string()))?;
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&hostname)
            .to_string();
        let route = Route {
            target: target.trim().trim_end_matches('/').to_string(),
            hostname,
            display_name,
        };

        let _guard = self.write_lock.lock().await;

        let current = self.snapshot();
        if current.get(&route.hostname).as_ref() == Some(&route) {
            debug!(hostname = %route.hostname, "Route unchanged, skipping write");
            return Ok(route);
        }

        let mut next = (*current).clone();
        let previous = next.insert(route.clone());
        save_table(&self.path, &next).await?;
        *self.current.write() = Arc::new(next);

        info!(
            hostname = %route.hostname,
            target = %route.target,
            name = %route.display_name,
            replaced = previous.is_some(),
            "Route saved"
        );
        Ok(route)
    }

    /// Re-read the store file and replace the in-memory table.
    ///
    /// Unlike startup loading, a missing or corrupt file is an error here and
    /// the current table stays in place.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;

        let table = read_table(&self.path).await?.ok_or_else(|| {
            StoreError::io(&self.path, std::io::Error::from(std::io::ErrorKind::NotFound))
        })?;
        let route_count = table.len();
        *self.current.write() = Arc::new(table);

        info!(path = %self.path.display(), route_count, "Reloaded routing table");
        Ok(route_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("routes.json")
    }

    async fn read_file(path: &Path) -> RoutingTable {
        let content = tokio::fs::read(path).await.unwrap();
        serde_json::from_slice(&content).unwrap()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Land.MOI.gov.tw"), Some("land.moi.gov.tw".to_string()));
        assert_eq!(normalize_hostname(" zuvi.io:8443 "), Some("zuvi.io".to_string()));
        assert_eq!(normalize_hostname(""), None);
        assert_eq!(normalize_hostname(":443"), None);
    }

    #[test]
    fn test_builtin_table() {
        let table = RoutingTable::builtin();
        assert_eq!(table.len(), 3);
        assert!(table.contains("fido.moi.gov.tw"));
        assert!(table.contains("zuvi.io"));
        let land = table.get("land.moi.gov.tw").unwrap();
        assert_eq!(land.target, "https://localhost:5001");
    }

    #[test]
    fn test_storage_format() {
        let json = r#"{"a.example":{"target":"https://localhost:7000","name":"A"}}"#;
        let table: RoutingTable = serde_json::from_str(json).unwrap();
        let route = table.get("a.example").unwrap();
        assert_eq!(route.target, "https://localhost:7000");
        assert_eq!(route.display_name, "A");
        assert_eq!(serde_json::to_string(&table).unwrap(), json);
    }

    #[tokio::test]
    async fn test_missing_file_seeds_builtin_table() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let table = load_table(&path).await;

        assert_eq!(table, RoutingTable::builtin());
        assert_eq!(read_file(&path).await, RoutingTable::builtin());
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_builtin() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let table = load_table(&path).await;

        assert_eq!(table, RoutingTable::builtin());
        assert_eq!(read_file(&path).await, RoutingTable::builtin());
        let backup = tokio::fs::read(dir.path().join("routes.json.corrupt")).await.unwrap();
        assert_eq!(backup, b"{ not json");
    }

    #[tokio::test]
    async fn test_unreadable_store_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        tokio::fs::create_dir(&path).await.unwrap();
        tokio::fs::write(path.join("keep"), b"operator data").await.unwrap();

        let table = load_table(&path).await;

        assert_eq!(table, RoutingTable::builtin());
        assert!(path.is_dir());
        assert_eq!(tokio::fs::read(path.join("keep")).await.unwrap(), b"operator data");
        assert!(!dir.path().join("routes.json.tmp").exists());
        assert!(!dir.path().join("routes.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_load_normalizes_entries() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        tokio::fs::write(&path, br#"{"Issuer.Example":{"target":"https://localhost:7000"}}"#)
            .await
            .unwrap();

        let table = load_table(&path).await;
        let route = table.get("issuer.example").unwrap();
        assert_eq!(route.display_name, "issuer.example");
    }

    #[tokio::test]
    async fn test_save_of_load_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        load_table(&path).await;
        let before = tokio::fs::read(&path).await.unwrap();

        let table = load_table(&path).await;
        save_table(&path, &table).await.unwrap();

        let after = tokio::fs::read(&path).await.unwrap();
        assert_eq!(before, after);
        assert!(!dir.path().join("routes.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_upsert_persists_and_defaults_name() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = RoutingStore::open(&path).await;

        let route = store
            .upsert("New.Example:443", "https://localhost:6000/", None)
            .await
            .unwrap();

        assert_eq!(route.hostname, "new.example");
        assert_eq!(route.target, "https://localhost:6000");
        assert_eq!(route.display_name, "new.example");
        assert_eq!(store.get("new.example"), Some(route.clone()));
        assert_eq!(read_file(&path).await.get("new.example"), Some(route));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_existing() {
        let dir = TempDir::new().unwrap();
        let store = RoutingStore::open(store_path(&dir)).await;

        store
            .upsert("land.moi.gov.tw", "https://localhost:6001", Some("Land v2"))
            .await
            .unwrap();

        let route = store.get("land.moi.gov.tw").unwrap();
        assert_eq!(route.target, "https://localhost:6001");
        assert_eq!(route.display_name, "Land v2");
        assert_eq!(store.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = RoutingStore::open(&path).await;

        store.upsert("a.example", "https://localhost:7000", Some("A")).await.unwrap();
        let table = store.snapshot();
        let file = tokio::fs::read(&path).await.unwrap();

        store.upsert("a.example", "https://localhost:7000", Some("A")).await.unwrap();

        assert_eq!(*store.snapshot(), *table);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), file);
    }

    #[tokio::test]
    async fn test_upsert_rejects_empty_hostname() {
        let dir = TempDir::new().unwrap();
        let store = RoutingStore::open(store_path(&dir)).await;

        let result = store.upsert("  ", "https://localhost:7000", None).await;
        assert!(matches!(result, Err(StoreError::InvalidHostname(_))));
        assert_eq!(*store.snapshot(), RoutingTable::builtin());
    }

    #[tokio::test]
    async fn test_failed_write_is_not_committed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        tokio::fs::write(&blocker, b"").await.unwrap();
        let store = RoutingStore::open(blocker.join("routes.json")).await;

        let result = store.upsert("a.example", "https://localhost:7000", None).await;

        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert!(store.get("a.example").is_none());
        assert_eq!(*store.snapshot(), RoutingTable::builtin());
    }

    #[tokio::test]
    async fn test_reload_picks_up_external_edits() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = RoutingStore::open(&path).await;

        tokio::fs::write(&path, br#"{"edited.example":{"target":"https://localhost:7100","name":"Edited"}}"#)
            .await
            .unwrap();

        assert_eq!(store.reload().await.unwrap(), 1);
        assert_eq!(store.get("edited.example").unwrap().display_name, "Edited");
        assert!(store.get("zuvi.io").is_none());
    }

    #[tokio::test]
    async fn test_reload_keeps_table_on_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = RoutingStore::open(&path).await;

        tokio::fs::write(&path, b"[1, 2").await.unwrap();

        assert!(matches!(store.reload().await, Err(StoreError::Parse { .. })));
        assert_eq!(*store.snapshot(), RoutingTable::builtin());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_different_hostnames() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = Arc::new(RoutingStore::open(&path).await);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .upsert(&format!("host{}.example", i), &format!("https://localhost:{}", 7000 + i), None)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let on_disk = read_file(&path).await;
        assert_eq!(on_disk.len(), 3 + 16);
        assert_eq!(on_disk, *store.snapshot());
        for i in 0..16 {
            assert!(on_disk.contains(&format!("host{}.example", i)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_same_hostname() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let store = Arc::new(RoutingStore::open(&path).await);
        let targets: Vec<String> = (0..16).map(|i| format!("https://localhost:{}", 7000 + i)).collect();

        let reader = {
            let store = Arc::clone(&store);
            let targets = targets.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    if let Some(route) = store.get("race.example") {
                        assert!(targets.contains(&route.target));
                        assert_eq!(route.display_name, "race.example");
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let handles: Vec<_> = targets
            .iter()
            .cloned()
            .map(|target| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.upsert("race.example", &target, None).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        reader.await.unwrap();

        let winner = store.get("race.example").unwrap();
        assert!(targets.contains(&winner.target));
        assert_eq!(read_file(&path).await.get("race.example"), Some(winner));
    }
}
