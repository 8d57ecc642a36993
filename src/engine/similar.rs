//! Near-duplicate detection over normalized titles.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::conversation::{Conversation, RelatedItem};

/// Most similar items reported per conversation.
const SIMILAR_CAP: usize = 5;

struct IndexedTitle {
  tokens: BTreeSet<String>,
  related: RelatedItem,
}

/// Title index shared across searches. Similarity is token-set overlap
/// (Jaccard) over lowercased, punctuation-stripped titles.
pub struct SimilarityIndex {
  threshold: f64,
  titles: Mutex<HashMap<String, IndexedTitle>>,
}

impl SimilarityIndex {
  /// A threshold of zero disables the index entirely.
  pub fn new(threshold: f64) -> Self {
    Self {
      threshold,
      titles: Mutex::new(HashMap::new()),
    }
  }

  pub fn enabled(&self) -> bool {
    self.threshold > 0.0
  }

  /// Record a conversation's title and return previously seen items whose
  /// titles overlap past the threshold.
  pub fn observe(&self, co: &Conversation) -> Vec<RelatedItem> {
    if !self.enabled() {
      return Vec::new();
    }

    let tokens = tokenize(&co.title);
    if tokens.is_empty() {
      return Vec::new();
    }

    let mut titles = self.titles.lock().unwrap_or_else(|e| e.into_inner());
    let mut similar: Vec<RelatedItem> = Vec::new();
    for (url, indexed) in titles.iter() {
      if url == &co.url {
        continue;
      }
      if jaccard(&tokens, &indexed.tokens) >= self.threshold {
        similar.push(indexed.related.clone());
        if similar.len() >= SIMILAR_CAP {
          break;
        }
      }
    }

    titles.insert(
      co.url.clone(),
      IndexedTitle {
        tokens,
        related: RelatedItem {
          organization: co.organization.clone(),
          project: co.project.clone(),
          id: co.id,
          seen: co.seen,
        },
      },
    );

    similar
  }
}

fn tokenize(title: &str) -> BTreeSet<String> {
  title
    .to_lowercase()
    .split(|c: char| !c.is_alphanumeric())
    .filter(|t| !t.is_empty())
    .map(String::from)
    .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
  if a.is_empty() && b.is_empty() {
    return 0.0;
  }
  let intersection = a.intersection(b).count();
  let union = a.len() + b.len() - intersection;
  intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::test_support::{issue, test_engine};
  use crate::engine::ItemKind;
  use chrono::Utc;

  fn conversation(number: i64, title: &str) -> Conversation {
    let engine = test_engine(&[]);
    let mut item = issue(number, "alice", "open", Utc::now());
    item.title = title.to_string();
    engine.build_conversation(ItemKind::Issue, &item, &[], Utc::now())
  }

  #[test]
  fn near_identical_titles_are_flagged() {
    let index = SimilarityIndex::new(0.7);
    assert!(index.observe(&conversation(1, "crash when opening settings")).is_empty());

    let similar = index.observe(&conversation(2, "Crash when opening settings!"));
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].id, 1);
  }

  #[test]
  fn unrelated_titles_are_not_flagged() {
    let index = SimilarityIndex::new(0.7);
    index.observe(&conversation(1, "crash when opening settings"));
    assert!(index.observe(&conversation(2, "docs: fix typo in readme")).is_empty());
  }

  #[test]
  fn zero_threshold_disables_index() {
    let index = SimilarityIndex::new(0.0);
    index.observe(&conversation(1, "same title"));
    assert!(index.observe(&conversation(2, "same title")).is_empty());
  }
}
