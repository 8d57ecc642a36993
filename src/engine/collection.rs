//! Rule and collection execution.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};

use super::conversation::Conversation;
use super::filters::Filter;
use super::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
  Issue,
  PullRequest,
  Any,
}

/// A named filter expression plus item-type selector.
#[derive(Clone)]
pub struct Rule {
  pub id: String,
  pub name: String,
  pub kind: RuleKind,
  pub filters: Vec<Filter>,
}

/// A named, ordered group of rules rendered together.
#[derive(Debug, Clone)]
pub struct Collection {
  pub id: String,
  pub name: String,
  pub rule_ids: Vec<String>,
  pub used_for_stats: bool,
  pub hidden: bool,
}

#[derive(Clone)]
pub struct RuleResult {
  pub id: String,
  pub name: String,
  pub items: Vec<Conversation>,
}

/// One evaluation of a collection: per-rule matches plus the freshness
/// bookkeeping readers and the scheduler rely on.
#[derive(Clone)]
pub struct CollectionResult {
  pub id: String,
  pub created: DateTime<Utc>,
  /// Minimum fetch timestamp across every input that fed this result.
  pub oldest_input: DateTime<Utc>,
  pub rules: Vec<RuleResult>,
}

impl Engine {
  pub fn rule(&self, id: &str) -> Result<&Rule> {
    self
      .rules
      .get(id)
      .ok_or_else(|| eyre!("unknown rule {:?}", id))
  }

  /// Evaluate one rule across every configured repository.
  pub async fn execute_rule(
    &self,
    rule: &Rule,
    newer_than: DateTime<Utc>,
    hidden: bool,
  ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
    let mut matches = Vec::new();
    let mut oldest = Utc::now();

    for repo in &self.repos {
      let (org, project) = (repo.organization.as_str(), repo.project.as_str());
      match rule.kind {
        RuleKind::Issue => {
          let (cs, ts) = self
            .search_issues(org, project, &rule.filters, newer_than, hidden)
            .await?;
          oldest = oldest.min(ts);
          matches.extend(cs);
        }
        RuleKind::PullRequest => {
          let (cs, ts) = self
            .search_prs(org, project, &rule.filters, newer_than, hidden)
            .await?;
          oldest = oldest.min(ts);
          matches.extend(cs);
        }
        RuleKind::Any => {
          let (cs, ts) = self
            .search_issues(org, project, &rule.filters, newer_than, hidden)
            .await?;
          oldest = oldest.min(ts);
          matches.extend(cs);

          let (pcs, pts) = self
            .search_prs(org, project, &rule.filters, newer_than, hidden)
            .await?;
          oldest = oldest.min(pts);
          matches.extend(pcs);
        }
      }
    }

    Ok((matches, oldest))
  }

  /// Evaluate every rule in a collection, sequentially and best-effort.
  /// A failing rule keeps its slot from the previous evaluation when one
  /// exists (omitted otherwise); sibling rules still refresh.
  pub async fn execute_collection(
    &self,
    collection: &Collection,
    newer_than: DateTime<Utc>,
    previous: Option<&CollectionResult>,
  ) -> Result<CollectionResult> {
    let created = Utc::now();
    let mut oldest_input = created;
    let mut rules = Vec::with_capacity(collection.rule_ids.len());

    for rule_id in &collection.rule_ids {
      let outcome = match self.rule(rule_id) {
        Ok(rule) => self
          .execute_rule(rule, newer_than, collection.hidden)
          .await
          .map(|(items, oldest)| (rule.id.clone(), rule.name.clone(), items, oldest)),
        Err(e) => Err(e),
      };

      match outcome {
        Ok((id, name, items, oldest)) => {
          oldest_input = oldest_input.min(oldest);
          info!(
            "{}: rule {:?} matched {} conversations",
            collection.id,
            rule_id,
            items.len()
          );
          rules.push(RuleResult { id, name, items });
        }
        Err(e) => {
          error!("{}: rule {:?} failed: {}", collection.id, rule_id, e);
          if let Some(p) = previous {
            if let Some(prior) = p.rules.iter().find(|r| &r.id == rule_id) {
              info!(
                "{}: carrying forward previous result for rule {:?}",
                collection.id, rule_id
              );
              // The carried slot is as old as the evaluation it came from.
              oldest_input = oldest_input.min(p.oldest_input);
              rules.push(prior.clone());
            }
          }
        }
      }
    }

    Ok(CollectionResult {
      id: collection.id.clone(),
      created,
      oldest_input,
      rules,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::test_support::test_engine;
  use chrono::Duration;

  fn collection_with_rules(rule_ids: &[&str]) -> Collection {
    Collection {
      id: "c".to_string(),
      name: "C".to_string(),
      rule_ids: rule_ids.iter().map(|r| r.to_string()).collect(),
      used_for_stats: false,
      hidden: false,
    }
  }

  #[tokio::test]
  async fn empty_collection_produces_consistent_timestamps() {
    let engine = test_engine(&[]);
    let collection = collection_with_rules(&[]);

    let result = engine
      .execute_collection(&collection, DateTime::UNIX_EPOCH, None)
      .await
      .unwrap();
    assert!(result.oldest_input <= result.created);
    assert!(result.rules.is_empty());
  }

  #[tokio::test]
  async fn failed_rule_is_omitted_without_a_previous_result() {
    let engine = test_engine(&[]);
    let collection = collection_with_rules(&["gone"]);

    let result = engine
      .execute_collection(&collection, DateTime::UNIX_EPOCH, None)
      .await
      .unwrap();
    assert!(result.rules.is_empty());
  }

  #[tokio::test]
  async fn failed_rule_keeps_its_previous_slot() {
    let engine = test_engine(&[]);
    let collection = collection_with_rules(&["gone"]);

    let prior_time = Utc::now() - Duration::minutes(10);
    let previous = CollectionResult {
      id: "c".to_string(),
      created: prior_time,
      oldest_input: prior_time,
      rules: vec![RuleResult {
        id: "gone".to_string(),
        name: "Gone".to_string(),
        items: Vec::new(),
      }],
    };

    let result = engine
      .execute_collection(&collection, DateTime::UNIX_EPOCH, Some(&previous))
      .await
      .unwrap();
    assert_eq!(result.rules.len(), 1);
    assert_eq!(result.rules[0].id, "gone");
    // The carried slot drags oldest_input back to its own evaluation.
    assert!(result.oldest_input <= prior_time);
  }
}
