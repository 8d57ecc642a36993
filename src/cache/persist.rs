//! Persistence backends behind the in-memory store.
//!
//! Backends hold opaque serialized blobs keyed by cache key and preserve
//! each entry's created timestamp. They are written in bulk by `cleanup`
//! and read once by `initialize`; the in-memory view stays authoritative.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use super::blobs::{max_load_age, max_save_age, Blob};
use super::memory::MemoryStore;

pub trait Persister: Send + Sync {
  fn name(&self) -> String;

  /// Read every stored entry. Entries past the load horizon may be
  /// returned; the caller filters.
  fn load(&self) -> Result<Vec<(String, Blob)>>;

  /// Replace-by-key bulk write, atomically per call.
  fn save(&self, entries: &[(String, Blob)]) -> Result<()>;
}

/// The two-tier content cache: hot in-memory map in front of a backend.
pub struct Cache {
  mem: MemoryStore,
  backend: Box<dyn Persister>,
}

impl Cache {
  pub fn new(backend: Box<dyn Persister>) -> Self {
    Self {
      mem: MemoryStore::new(),
      backend,
    }
  }

  pub fn set(&self, key: &str, blob: Blob) {
    self.mem.set(key, blob);
  }

  pub fn get_newer_than(&self, key: &str, t: DateTime<Utc>) -> Option<Blob> {
    self.mem.get_newer_than(key, t)
  }

  pub fn delete_older_than(&self, key: &str, t: DateTime<Utc>) {
    self.mem.delete_older_than(key, t);
  }

  /// Load persisted entries no older than the load horizon. A backend
  /// failure here is fatal to startup; the caller propagates it.
  pub fn initialize(&self) -> Result<usize> {
    let cutoff = Utc::now() - max_load_age();
    let loaded = self.backend.load()?;
    let total = loaded.len();
    let fresh: Vec<(String, Blob)> = loaded
      .into_iter()
      .filter(|(_, blob)| blob.created >= cutoff)
      .collect();
    let kept = self.mem.absorb(fresh);
    info!(
      "loaded {} of {} persisted entries from {}",
      kept,
      total,
      self.backend.name()
    );
    Ok(kept)
  }

  /// Flush every in-memory entry younger than the save horizon to the
  /// backend in a single batch. Errors are returned for the caller to
  /// log; the next cycle retries.
  pub fn cleanup(&self) -> Result<usize> {
    let cutoff = Utc::now() - max_save_age();
    let entries = self.mem.snapshot_newer_than(cutoff);
    self.backend.save(&entries)?;
    info!("persisted {} entries to {}", entries.len(), self.backend.name());
    Ok(entries.len())
  }

  /// Periodic in-memory sweep.
  pub fn evict_expired(&self) -> usize {
    self.mem.evict_expired()
  }

  pub fn backend_name(&self) -> String {
    self.backend.name()
  }

  pub fn len(&self) -> usize {
    self.mem.len()
  }
}

/// Pick a backend from CLI flags or the environment, falling back to disk.
pub fn from_env(backend: Option<&str>, path: Option<&str>) -> Result<Box<dyn Persister>> {
  let env_backend = std::env::var("PERSIST_BACKEND").ok();
  let backend = backend
    .map(String::from)
    .or(env_backend)
    .unwrap_or_else(|| "disk".to_string());

  let env_path = std::env::var("PERSIST_PATH").ok();
  let path = path.map(String::from).or(env_path);

  match backend.as_str() {
    "memory" => Ok(Box::new(MemoryBackend)),
    "disk" => {
      let path = match path {
        Some(p) => PathBuf::from(p),
        None => default_disk_path()?,
      };
      Ok(Box::new(DiskBackend::new(path)))
    }
    "sqlite" => {
      let path = match path {
        Some(p) => PathBuf::from(p),
        None => default_sqlite_path()?,
      };
      Ok(Box::new(SqliteBackend::open(&path)?))
    }
    other => Err(eyre!(
      "unknown persistence backend {:?} (supported: disk, memory, sqlite)",
      other
    )),
  }
}

fn default_disk_path() -> Result<PathBuf> {
  let cache_dir = dirs::cache_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
    .ok_or_else(|| eyre!("could not determine cache directory"))?;
  Ok(cache_dir.join("triage").join("cache.json"))
}

fn default_sqlite_path() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("could not determine data directory"))?;
  Ok(data_dir.join("triage").join("cache.db"))
}

/// Keeps nothing. Used when persistence is disabled: loads are empty and
/// saves are discarded.
pub struct MemoryBackend;

impl Persister for MemoryBackend {
  fn name(&self) -> String {
    "memory".to_string()
  }

  fn load(&self) -> Result<Vec<(String, Blob)>> {
    Ok(Vec::new())
  }

  fn save(&self, _entries: &[(String, Blob)]) -> Result<()> {
    Ok(())
  }
}

/// Single-file JSON blob on local disk, written via rename for atomicity.
pub struct DiskBackend {
  path: PathBuf,
}

impl DiskBackend {
  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }
}

impl Persister for DiskBackend {
  fn name(&self) -> String {
    format!("disk:{}", self.path.display())
  }

  fn load(&self) -> Result<Vec<(String, Blob)>> {
    if !self.path.exists() {
      warn!("{} does not exist yet, starting cold", self.path.display());
      return Ok(Vec::new());
    }
    let contents = std::fs::read(&self.path)
      .map_err(|e| eyre!("failed to read {}: {}", self.path.display(), e))?;
    serde_json::from_slice(&contents)
      .map_err(|e| eyre!("failed to decode {}: {}", self.path.display(), e))
  }

  fn save(&self, entries: &[(String, Blob)]) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("failed to create {}: {}", parent.display(), e))?;
    }
    let data =
      serde_json::to_vec(entries).map_err(|e| eyre!("failed to encode entries: {}", e))?;
    let tmp = self.path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(|e| eyre!("failed to write {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("failed to rename {}: {}", tmp.display(), e))?;
    Ok(())
  }
}

/// SQL-family backend: one table keyed by cache key, batch writes in one
/// transaction.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blob_cache (
    key TEXT PRIMARY KEY,
    created TEXT NOT NULL,
    data BLOB NOT NULL
);
"#;

impl SqliteBackend {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("failed to create {}: {}", parent.display(), e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("failed to open database at {}: {}", path.display(), e))?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("failed to run migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl Persister for SqliteBackend {
  fn name(&self) -> String {
    "sqlite".to_string()
  }

  fn load(&self) -> Result<Vec<(String, Blob)>> {
    let conn = self.conn.lock().map_err(|e| eyre!("lock poisoned: {}", e))?;
    let mut stmt = conn
      .prepare("SELECT key, created, data FROM blob_cache")
      .map_err(|e| eyre!("failed to prepare load query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        let key: String = row.get(0)?;
        let created: String = row.get(1)?;
        let data: Vec<u8> = row.get(2)?;
        Ok((key, created, data))
      })
      .map_err(|e| eyre!("failed to query blobs: {}", e))?;

    let mut entries = Vec::new();
    for row in rows {
      let (key, created_str, data) = row.map_err(|e| eyre!("row error: {}", e))?;
      // A single undecodable entry costs one cache miss, not startup.
      let created = match DateTime::parse_from_rfc3339(&created_str) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
          warn!("skipping {}: bad created time {:?}: {}", key, created_str, e);
          continue;
        }
      };
      let mut blob: Blob = match serde_json::from_slice(&data) {
        Ok(b) => b,
        Err(e) => {
          warn!("skipping {}: undecodable payload: {}", key, e);
          continue;
        }
      };
      blob.created = created;
      entries.push((key, blob));
    }
    Ok(entries)
  }

  fn save(&self, entries: &[(String, Blob)]) -> Result<()> {
    let mut conn = self.conn.lock().map_err(|e| eyre!("lock poisoned: {}", e))?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("failed to begin transaction: {}", e))?;

    for (key, blob) in entries {
      let data =
        serde_json::to_vec(blob).map_err(|e| eyre!("failed to encode {}: {}", key, e))?;
      tx.execute(
        "INSERT OR REPLACE INTO blob_cache (key, created, data) VALUES (?, ?, ?)",
        params![key, blob.created.to_rfc3339(), data],
      )
      .map_err(|e| eyre!("failed to store {}: {}", key, e))?;
    }

    tx.commit().map_err(|e| eyre!("failed to commit: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::blobs::Payload;
  use crate::github::types::Issue;
  use chrono::Duration;

  fn sample_issue(number: i64) -> Issue {
    serde_json::from_value(serde_json::json!({
      "id": number,
      "number": number,
      "title": format!("issue {}", number),
      "html_url": format!("https://github.com/o/p/issues/{}", number),
      "url": format!("https://api.github.com/repos/o/p/issues/{}", number),
      "state": "open",
      "user": {"login": "alice"},
      "created_at": "2026-07-01T00:00:00Z",
      "updated_at": "2026-07-02T00:00:00Z"
    }))
    .unwrap()
  }

  #[test]
  fn cleanup_then_initialize_preserves_recent_entries() {
    let dir = std::env::temp_dir().join(format!("triage-cache-test-{}", std::process::id()));
    let path = dir.join("cache.db");
    let _ = std::fs::remove_file(&path);

    let cache = Cache::new(Box::new(SqliteBackend::open(&path).unwrap()));
    cache.set("o/p/issues/open", Blob::new(Payload::Issues(vec![sample_issue(1)])));
    cache.set(
      "stale",
      Blob {
        created: Utc::now() - Duration::days(3),
        payload: Payload::Issues(vec![]),
      },
    );

    // Entries past the save horizon are skipped on write.
    assert_eq!(cache.cleanup().unwrap(), 1);

    let reloaded = Cache::new(Box::new(SqliteBackend::open(&path).unwrap()));
    assert_eq!(reloaded.initialize().unwrap(), 1);
    let blob = reloaded
      .get_newer_than("o/p/issues/open", Utc::now() - Duration::minutes(1))
      .unwrap();
    match blob.payload {
      Payload::Issues(issues) => assert_eq!(issues[0].number, 1),
      other => panic!("unexpected payload: {:?}", other),
    }

    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn disk_backend_roundtrips() {
    let dir = std::env::temp_dir().join(format!("triage-disk-test-{}", std::process::id()));
    let path = dir.join("cache.json");
    let _ = std::fs::remove_file(&path);

    let backend = DiskBackend::new(path.clone());
    let blob = Blob::new(Payload::Comments(vec![]));
    let created = blob.created;
    backend.save(&[("k".to_string(), blob)]).unwrap();

    let loaded = backend.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].0, "k");
    assert_eq!(loaded[0].1.created, created);

    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn memory_backend_loads_nothing() {
    let cache = Cache::new(Box::new(MemoryBackend));
    cache.set("k", Blob::new(Payload::Reviews(vec![])));
    assert_eq!(cache.cleanup().unwrap(), 1);
    assert_eq!(cache.initialize().unwrap(), 0);
  }

  #[test]
  fn unknown_backend_is_rejected() {
    assert!(from_env(Some("cloudsql"), None).is_err());
  }
}
