//! Hot in-memory store. All operations are non-blocking map accesses;
//! the persistence backend is never consulted after startup.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, trace};

use super::blobs::{max_load_age, Blob};

#[derive(Default)]
pub struct MemoryStore {
  entries: RwLock<HashMap<String, Blob>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Idempotent write. An unstamped blob is stamped with now.
  pub fn set(&self, key: &str, mut blob: Blob) {
    if blob.created == DateTime::UNIX_EPOCH {
      blob.created = Utc::now();
    }
    trace!("storing {} in memory cache", key);
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    entries.insert(key.to_string(), blob);
  }

  /// Returns the entry iff present and created at or after `t`.
  pub fn get_newer_than(&self, key: &str, t: DateTime<Utc>) -> Option<Blob> {
    let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
    let blob = entries.get(key)?;
    if blob.created < t {
      trace!("{} cached at {} is older than {}", key, blob.created, t);
      return None;
    }
    Some(blob.clone())
  }

  /// Remove the entry if the stored copy is older than `t`.
  pub fn delete_older_than(&self, key: &str, t: DateTime<Utc>) {
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    if let Some(blob) = entries.get(key) {
      if blob.created < t {
        entries.remove(key);
      }
    }
  }

  /// Periodic sweep: drop everything past the load horizon.
  pub fn evict_expired(&self) -> usize {
    let cutoff = Utc::now() - max_load_age();
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    let before = entries.len();
    entries.retain(|_, blob| blob.created >= cutoff);
    let evicted = before - entries.len();
    if evicted > 0 {
      debug!("evicted {} cache entries older than {}", evicted, cutoff);
    }
    evicted
  }

  /// Entries created at or after `t`, for bulk persistence.
  pub fn snapshot_newer_than(&self, t: DateTime<Utc>) -> Vec<(String, Blob)> {
    let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
    entries
      .iter()
      .filter(|(_, blob)| blob.created >= t)
      .map(|(k, blob)| (k.clone(), blob.clone()))
      .collect()
  }

  /// Bulk load from a persistence backend at startup.
  pub fn absorb(&self, loaded: Vec<(String, Blob)>) -> usize {
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    let mut count = 0;
    for (key, blob) in loaded {
      entries.insert(key, blob);
      count += 1;
    }
    count
  }

  pub fn len(&self) -> usize {
    self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::blobs::Payload;
  use chrono::Duration;

  fn blob_at(created: DateTime<Utc>) -> Blob {
    Blob {
      created,
      payload: Payload::Issues(vec![]),
    }
  }

  #[test]
  fn set_then_get_newer_than_roundtrips() {
    let store = MemoryStore::new();
    let blob = Blob::new(Payload::Issues(vec![]));
    let created = blob.created;
    store.set("k", blob);

    let got = store
      .get_newer_than("k", created - Duration::milliseconds(1))
      .unwrap();
    assert_eq!(got.created, created);
  }

  #[test]
  fn get_newer_than_respects_bound() {
    let store = MemoryStore::new();
    let created = Utc::now() - Duration::hours(1);
    store.set("k", blob_at(created));

    assert!(store.get_newer_than("k", Utc::now()).is_none());
    let got = store.get_newer_than("k", created).unwrap();
    assert!(got.created >= created);
  }

  #[test]
  fn unstamped_blobs_are_stamped_on_set() {
    let store = MemoryStore::new();
    store.set("k", Blob::unstamped(Payload::Issues(vec![])));
    let got = store.get_newer_than("k", DateTime::UNIX_EPOCH).unwrap();
    assert!(got.created > DateTime::UNIX_EPOCH);
  }

  #[test]
  fn delete_older_than_keeps_fresh_entries() {
    let store = MemoryStore::new();
    let created = Utc::now();
    store.set("k", blob_at(created));

    store.delete_older_than("k", created - Duration::hours(1));
    assert!(store.get_newer_than("k", DateTime::UNIX_EPOCH).is_some());

    store.delete_older_than("k", created + Duration::hours(1));
    assert!(store.get_newer_than("k", DateTime::UNIX_EPOCH).is_none());
  }

  #[test]
  fn evict_expired_drops_only_ancient_entries() {
    let store = MemoryStore::new();
    store.set("old", blob_at(Utc::now() - Duration::days(11)));
    store.set("new", blob_at(Utc::now()));

    assert_eq!(store.evict_expired(), 1);
    assert!(store.get_newer_than("old", DateTime::UNIX_EPOCH).is_none());
    assert!(store.get_newer_than("new", DateTime::UNIX_EPOCH).is_some());
  }
}
