//! Cache entry types: a created-at timestamp plus an opaque payload.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::github::types::{Comment, Issue, PullRequest, Review, TimelineEvent};

/// Oldest allowable entry to flush to a persistence backend.
pub fn max_save_age() -> Duration {
  Duration::days(2)
}

/// Oldest allowable entry to load from a persistence backend, and the
/// eviction horizon for the in-memory sweep.
pub fn max_load_age() -> Duration {
  Duration::days(10)
}

/// What a cache entry holds. Tagged so persisted blobs are
/// self-describing; backends never inspect the contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Payload {
  Issues(Vec<Issue>),
  PullRequests(Vec<PullRequest>),
  Comments(Vec<Comment>),
  Timeline(Vec<TimelineEvent>),
  Reviews(Vec<Review>),
}

/// A single cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
  pub created: DateTime<Utc>,
  pub payload: Payload,
}

impl Blob {
  /// A blob stamped with the current time.
  pub fn new(payload: Payload) -> Self {
    Self {
      created: Utc::now(),
      payload,
    }
  }

  /// A blob with an unset timestamp; the store stamps it on `set`.
  pub fn unstamped(payload: Payload) -> Self {
    Self {
      created: DateTime::UNIX_EPOCH,
      payload,
    }
  }
}
