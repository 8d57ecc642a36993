//! Background update scheduler.
//!
//! A single control loop decides which collection to refresh when, driven
//! by reader popularity, result age, and explicit refresh requests.
//! Refreshes run one at a time; the fetch fan-out inside a refresh is the
//! engine's business.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::engine::{Collection, CollectionResult, Engine};

/// Minimum age to flush to avoid bad behavior.
const MIN_FLUSH_AGE: i64 = 5;

/// How often the control loop wakes up.
const LOOP_EVERY_MS: u64 = 250;

/// Cycles that always refresh, so the first page loads land on data.
const WARMUP_CYCLES: usize = 2;

pub struct Updater {
  engine: Arc<Engine>,
  cache: Arc<Cache>,
  collections: Vec<Collection>,
  min_refresh: Duration,
  max_refresh: Duration,
  results: RwLock<HashMap<String, Arc<CollectionResult>>>,
  last_request: Mutex<HashMap<String, DateTime<Utc>>>,
  second_last_request: Mutex<HashMap<String, DateTime<Utc>>>,
  last_persist: Mutex<DateTime<Utc>>,
  persist_in_progress: AtomicBool,
  update_cycles: AtomicUsize,
  start_time: Mutex<DateTime<Utc>>,
  last_run: Mutex<DateTime<Utc>>,
  refresh_lock: tokio::sync::Mutex<()>,
  state: Mutex<String>,
}

impl Updater {
  pub fn new(
    engine: Arc<Engine>,
    cache: Arc<Cache>,
    collections: Vec<Collection>,
    min_refresh: Duration,
    max_refresh: Duration,
  ) -> Arc<Self> {
    Arc::new(Self {
      engine,
      cache,
      collections,
      min_refresh,
      max_refresh,
      results: RwLock::new(HashMap::new()),
      last_request: Mutex::new(HashMap::new()),
      second_last_request: Mutex::new(HashMap::new()),
      last_persist: Mutex::new(DateTime::UNIX_EPOCH),
      persist_in_progress: AtomicBool::new(false),
      update_cycles: AtomicUsize::new(0),
      start_time: Mutex::new(DateTime::UNIX_EPOCH),
      last_run: Mutex::new(DateTime::UNIX_EPOCH),
      refresh_lock: tokio::sync::Mutex::new(()),
      state: Mutex::new("starting".to_string()),
    })
  }

  fn collection(&self, id: &str) -> Result<&Collection> {
    self
      .collections
      .iter()
      .find(|c| c.id == id)
      .ok_or_else(|| eyre!("unknown collection {:?}", id))
  }

  /// Record stats on collection accesses.
  fn record_access(&self, id: &str) {
    let now = Utc::now();
    let mut last = self.last_request.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(prev) = last.get(id).copied() {
      let mut second = self
        .second_last_request
        .lock()
        .unwrap_or_else(|e| e.into_inner());
      second.insert(id.to_string(), prev);
    }
    last.insert(id.to_string(), now);
  }

  fn last_requested(&self, id: &str) -> Option<DateTime<Utc>> {
    let last = self.last_request.lock().unwrap_or_else(|e| e.into_inner());
    last.get(id).copied()
  }

  fn second_last_requested(&self, id: &str) -> DateTime<Utc> {
    let second = self
      .second_last_request
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    second
      .get(id)
      .copied()
      .unwrap_or(*self.start_time.lock().unwrap_or_else(|e| e.into_inner()))
  }

  fn cached_result(&self, id: &str) -> Option<Arc<CollectionResult>> {
    let results = self.results.read().unwrap_or_else(|e| e.into_inner());
    results.get(id).cloned()
  }

  /// Returns the reason a collection needs an update, or None.
  fn should_update(
    &self,
    id: &str,
    used_for_stats: bool,
    force: bool,
    now: DateTime<Utc>,
  ) -> Option<String> {
    // The first cycles run on a pared-down bar for faster initial load.
    let cycles = self.update_cycles.load(Ordering::Relaxed);
    if cycles < WARMUP_CYCLES {
      return Some(format!("cycle count is only {}", cycles));
    }

    let result = match self.cached_result(id) {
      Some(r) => r,
      None => return Some("results are not cached".to_string()),
    };

    let result_age = now - result.created;
    let mut max_refresh = self.max_refresh;
    // Stats-based metrics can wait longer to refresh.
    if used_for_stats {
      max_refresh = max_refresh * 3;
    }

    if result_age > max_refresh {
      return Some(format!(
        "result age {} exceeds max refresh {}",
        result_age, max_refresh
      ));
    }

    if force {
      return Some("force-mode enabled".to_string());
    }

    let last_req = match self.last_requested(id) {
      Some(t) => t,
      None => return None, // never requested by a reader
    };

    if result_age < self.min_refresh {
      return None;
    }

    // Back off based on the average of the last two request intervals:
    // popular collections refresh sooner, neglected ones later.
    let request_age = now - last_req;
    let second_diff = last_req - self.second_last_requested(id);
    let need_age = (request_age + second_diff) / 2 + self.min_refresh;
    if result_age > need_age && !used_for_stats {
      return Some(format!(
        "result age {} too old for popularity (need {})",
        result_age, need_age
      ));
    }

    None
  }

  /// Look up the latest result for a collection, recording the access.
  /// When blocking, a missing result triggers a synchronous refresh.
  pub async fn lookup(&self, id: &str, blocking: bool) -> Option<Arc<CollectionResult>> {
    if self.cached_result(id).is_none() {
      if blocking {
        warn!("{} is not cached, blocking the reader on a refresh", id);
        if let Err(e) = self
          .refresh_collection(id, DateTime::UNIX_EPOCH, true)
          .await
        {
          error!("unable to refresh {}: {}", id, e);
        }
      } else {
        warn!("{} is not cached and the reader is not blocking", id);
      }
    }
    self.record_access(id);
    self.cached_result(id)
  }

  /// Refresh a collection on demand. A collection that has never been
  /// requested falls back to a plain blocking lookup; forced refreshes
  /// are for pages someone is actually watching.
  pub async fn force_refresh(&self, id: &str) -> Option<Arc<CollectionResult>> {
    if self.last_requested(id).is_none() {
      warn!("ignoring refresh request, {} has never been requested", id);
      return self.lookup(id, true).await;
    }

    let start = Utc::now();
    // One second of slack deduplicates double-clicks without pinning an
    // exact timestamp.
    let newer_than = start - Duration::seconds(1);

    info!("forcing {} to refresh with data newer than {}", id, newer_than);
    if let Err(e) = self.refresh_collection(id, newer_than, true).await {
      error!("forced refresh of {} failed: {}", id, e);
    }
    info!("refresh complete for {} after {}", id, Utc::now() - start);
    self.record_access(id);
    self.cached_result(id)
  }

  /// Refresh a single collection if it needs it. Serialized process-wide.
  pub async fn refresh_collection(
    &self,
    id: &str,
    newer_than: DateTime<Utc>,
    force: bool,
  ) -> Result<bool> {
    let _guard = self.refresh_lock.lock().await;

    let collection = self.collection(id)?.clone();
    let reason = match self.should_update(id, collection.used_for_stats, force, Utc::now()) {
      Some(reason) => reason,
      None => return Ok(false),
    };
    info!("reason for updating {:?}: {}", id, reason);

    self.update(&collection, newer_than).await?;
    Ok(true)
  }

  async fn update(&self, collection: &Collection, newer_than: DateTime<Utc>) -> Result<()> {
    let start = Utc::now();
    self.set_state(format!("updating {} to {}", collection.id, newer_than));

    info!(
      ">>> updating {:?} with data newer than {} >>>",
      collection.id, newer_than
    );
    // Hand over the previous snapshot so a failing rule can keep its slot.
    let previous = self.cached_result(&collection.id);
    let result = self
      .engine
      .execute_collection(collection, newer_than, previous.as_deref())
      .await?;
    info!(
      "<<< updated {:?} to {} (oldest input: {}, duration: {}) <<<",
      collection.id,
      result.created,
      result.oldest_input,
      Utc::now() - start
    );

    let mut results = self.results.write().unwrap_or_else(|e| e.into_inner());
    results.insert(collection.id.clone(), Arc::new(result));
    Ok(())
  }

  /// Run one scheduling pass over every collection.
  pub async fn run_once(&self, mut force: bool) -> Result<bool> {
    let start = Utc::now();
    let mut updated = false;

    {
      let mut last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
      if *last_run == DateTime::UNIX_EPOCH {
        *self.start_time.lock().unwrap_or_else(|e| e.into_inner()) = start;
        force = true;
      }
      *last_run = start;
    }

    // All collections share one freshness bound per cycle so rules can
    // reuse each other's fetches.
    let mut newer_than = start - Duration::seconds(2 * MIN_FLUSH_AGE);
    if self.update_cycles.load(Ordering::Relaxed) == 0 {
      info!("no completed cycles yet, accepting stale results");
      newer_than = DateTime::UNIX_EPOCH;
    }

    let ids: Vec<String> = self.collections.iter().map(|c| c.id.clone()).collect();
    let mut failed = Vec::new();
    for id in ids {
      match self.refresh_collection(&id, newer_than, force).await {
        Ok(true) => updated = true,
        Ok(false) => {}
        Err(e) => {
          error!("{} failed to update: {}", id, e);
          failed.push(id);
        }
      }
    }

    if updated {
      let cycles = self.update_cycles.fetch_add(1, Ordering::Relaxed) + 1;
      info!("update cycle #{} took {}", cycles, Utc::now() - start);
    }

    if !failed.is_empty() {
      return Err(eyre!("collections failed: {:?}", failed));
    }
    Ok(updated)
  }

  fn should_persist(&self, updated: bool) -> bool {
    if self.persist_in_progress.load(Ordering::Relaxed) {
      return false;
    }
    if !updated {
      return false;
    }

    // Fuzz the cutoff to spread write load across replicas.
    let max_secs = self.max_refresh.num_seconds().max(1);
    let fuzz = Duration::seconds(rand::thread_rng().gen_range(0..max_secs));
    let cutoff = self.max_refresh + fuzz;

    let last = *self.last_persist.lock().unwrap_or_else(|e| e.into_inner());
    let since_save = Utc::now() - last;
    if since_save > cutoff {
      info!(
        "should persist: new data, and {} since the last save",
        since_save
      );
      return true;
    }
    false
  }

  /// Flush the content cache to the persistence backend. Advisory flag
  /// keeps at most one persist in flight.
  pub async fn persist(&self) -> Result<()> {
    if self
      .persist_in_progress
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Err(eyre!("already persisting"));
    }

    let start = Utc::now();
    info!("*** started to persist ...");

    let cache = Arc::clone(&self.cache);
    let outcome = tokio::task::spawn_blocking(move || cache.cleanup())
      .await
      .map_err(|e| eyre!("persist task panicked: {}", e))
      .and_then(|r| r);

    self.persist_in_progress.store(false, Ordering::SeqCst);
    match outcome {
      Ok(count) => {
        *self.last_persist.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
        info!("*** persist complete: {} entries in {}", count, Utc::now() - start);
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  fn set_state(&self, s: String) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = s;
  }

  pub fn status(&self) -> String {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let cycles = self.update_cycles.load(Ordering::Relaxed);
    let started = *self.start_time.lock().unwrap_or_else(|e| e.into_inner());
    let uptime = if started == DateTime::UNIX_EPOCH {
      Duration::zero()
    } else {
      Utc::now() - started
    };
    if self.persist_in_progress.load(Ordering::Relaxed) {
      return format!("{} - persisting ({} cycles, {} uptime)", state, cycles, uptime);
    }
    format!("{} ({} cycles, {} uptime)", state, cycles, uptime)
  }

  /// The control loop. Runs until the task is dropped.
  pub async fn run_loop(self: Arc<Self>) {
    info!(
      "looping: data will refresh between {} and {} (tick every {}ms)",
      self.min_refresh, self.max_refresh, LOOP_EVERY_MS
    );
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(LOOP_EVERY_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let updated = match self.run_once(false).await {
        Ok(updated) => updated,
        Err(e) => {
          error!("update pass failed: {}", e);
          false
        }
      };
      self.set_state("idle".to_string());

      if self.should_persist(updated) {
        let me = Arc::clone(&self);
        tokio::spawn(async move {
          if let Err(e) = me.persist().await {
            error!("persist failed: {}", e);
          }
        });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryBackend;
  use crate::engine::test_support::test_engine;

  fn empty_collection(id: &str, used_for_stats: bool) -> Collection {
    Collection {
      id: id.to_string(),
      name: id.to_string(),
      rule_ids: Vec::new(),
      used_for_stats,
      hidden: false,
    }
  }

  fn test_updater(collections: Vec<Collection>) -> Arc<Updater> {
    Updater::new(
      Arc::new(test_engine(&[])),
      Arc::new(Cache::new(Box::new(MemoryBackend))),
      collections,
      Duration::seconds(30),
      Duration::minutes(10),
    )
  }

  fn seed_result(u: &Updater, id: &str, created: DateTime<Utc>) {
    let result = CollectionResult {
      id: id.to_string(),
      created,
      oldest_input: created,
      rules: Vec::new(),
    };
    u.results
      .write()
      .unwrap()
      .insert(id.to_string(), Arc::new(result));
  }

  fn seed_requests(u: &Updater, id: &str, last: DateTime<Utc>, second: DateTime<Utc>) {
    u.last_request
      .lock()
      .unwrap()
      .insert(id.to_string(), last);
    u.second_last_request
      .lock()
      .unwrap()
      .insert(id.to_string(), second);
  }

  #[test]
  fn warmup_cycles_always_update() {
    let u = test_updater(vec![empty_collection("c", false)]);
    assert!(u.should_update("c", false, false, Utc::now()).is_some());
  }

  #[test]
  fn missing_result_forces_update() {
    let u = test_updater(vec![empty_collection("c", false)]);
    u.update_cycles.store(5, Ordering::Relaxed);
    assert!(u.should_update("c", false, false, Utc::now()).is_some());
  }

  #[test]
  fn unrequested_collections_are_skipped() {
    let u = test_updater(vec![empty_collection("c", false)]);
    u.update_cycles.store(5, Ordering::Relaxed);
    let now = Utc::now();
    seed_result(&u, "c", now - Duration::minutes(5));
    assert!(u.should_update("c", false, false, now).is_none());
  }

  #[test]
  fn min_refresh_is_respected() {
    let u = test_updater(vec![empty_collection("c", false)]);
    u.update_cycles.store(5, Ordering::Relaxed);
    let now = Utc::now();
    seed_result(&u, "c", now - Duration::seconds(10));
    seed_requests(&u, "c", now, now - Duration::seconds(5));
    assert!(u.should_update("c", false, false, now).is_none());
  }

  #[test]
  fn adaptive_cadence_updates_popular_collections() {
    let u = test_updater(vec![empty_collection("c", false)]);
    u.update_cycles.store(5, Ordering::Relaxed);
    let now = Utc::now();

    // Requested 30s and 90s ago: need-age = (30 + 60)/2 + 30 = 75s.
    seed_requests(
      &u,
      "c",
      now - Duration::seconds(30),
      now - Duration::seconds(90),
    );

    seed_result(&u, "c", now - Duration::seconds(90));
    assert!(u.should_update("c", false, false, now).is_some());

    seed_result(&u, "c", now - Duration::seconds(60));
    assert!(u.should_update("c", false, false, now).is_none());
  }

  #[test]
  fn stats_collections_tolerate_triple_staleness() {
    let u = test_updater(vec![empty_collection("c", true)]);
    u.update_cycles.store(5, Ordering::Relaxed);
    let now = Utc::now();
    seed_requests(&u, "c", now - Duration::seconds(30), now - Duration::seconds(90));

    // Past maxRefresh but within 3x: a stats collection waits.
    seed_result(&u, "c", now - Duration::minutes(15));
    assert!(u.should_update("c", true, false, now).is_none());

    seed_result(&u, "c", now - Duration::minutes(31));
    assert!(u.should_update("c", true, false, now).is_some());
  }

  #[test]
  fn force_gets_a_reason_once_warm() {
    let u = test_updater(vec![empty_collection("c", false)]);
    u.update_cycles.store(5, Ordering::Relaxed);
    let now = Utc::now();
    seed_result(&u, "c", now - Duration::seconds(1));
    assert!(u.should_update("c", false, true, now).is_some());
    assert!(u.should_update("c", false, false, now).is_none());
  }

  #[tokio::test]
  async fn force_refresh_on_cold_collection_falls_back_to_lookup() {
    let u = test_updater(vec![empty_collection("c", false)]);
    let result = u.force_refresh("c").await;
    // Never requested: the forced path degrades to a blocking lookup,
    // which runs a warm-up refresh of the (empty) collection.
    let result = result.expect("lookup should have produced a result");
    assert_eq!(result.id, "c");
    assert!(result.oldest_input <= result.created);
  }

  #[tokio::test]
  async fn lookup_records_access() {
    let u = test_updater(vec![empty_collection("c", false)]);
    assert!(u.last_requested("c").is_none());
    let _ = u.lookup("c", false).await;
    assert!(u.last_requested("c").is_some());
  }

  #[tokio::test]
  async fn run_once_refreshes_every_collection_on_first_pass() {
    let u = test_updater(vec![
      empty_collection("a", false),
      empty_collection("b", false),
    ]);
    let updated = u.run_once(false).await.unwrap();
    assert!(updated);
    assert!(u.cached_result("a").is_some());
    assert!(u.cached_result("b").is_some());
    assert_eq!(u.update_cycles.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn persist_gating() {
    let u = test_updater(vec![empty_collection("c", false)]);
    assert!(!u.should_persist(false));

    // Never persisted and new data: overdue regardless of fuzz.
    assert!(u.should_persist(true));

    *u.last_persist.lock().unwrap() = Utc::now();
    assert!(!u.should_persist(true));

    *u.last_persist.lock().unwrap() = DateTime::UNIX_EPOCH;
    u.persist_in_progress.store(true, Ordering::Relaxed);
    assert!(!u.should_persist(true));
  }

  #[tokio::test]
  async fn persist_is_single_flight() {
    let u = test_updater(vec![empty_collection("c", false)]);
    u.persist_in_progress.store(true, Ordering::SeqCst);
    assert!(u.persist().await.is_err());
  }
}
