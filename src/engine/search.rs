//! Per-rule search: listing fan-out, filtering pipeline, enrichment
//! dispatch.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::conversation::{Conversation, ItemKind};
use super::filters::{
  filters_need_comments, filters_need_reviews, filters_need_timeline, needs_closed,
  open_by_default, post_events_match, post_fetch_match, pre_fetch_match, Filter,
};
use super::tags;
use super::Engine;
use crate::github::types::Item;

impl Engine {
  /// Search a repository's issues against the rule filters. Returns the
  /// matches and the oldest fetch timestamp among the inputs.
  pub(crate) async fn search_issues(
    &self,
    org: &str,
    project: &str,
    fs: &[Filter],
    newer_than: DateTime<Utc>,
    hidden: bool,
  ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
    let fs = open_by_default(fs);
    debug!("{}/{}: gathering issues newer than {}", org, project, newer_than);

    let mut age = Utc::now();

    // Open and closed listings fetch in parallel; further enrichment
    // stays sequential to be gentle on the rate limit.
    let (open_res, closed_res) = tokio::join!(
      self.cached_issues(org, project, "open", None, newer_than),
      async {
        if !needs_closed(&fs) {
          return Ok((Vec::new(), Utc::now()));
        }
        self
          .cached_issues(
            org,
            project,
            "closed",
            Some(self.max_closed_update_age),
            newer_than,
          )
          .await
      }
    );

    // Listing failures degrade to an empty listing rather than failing
    // the search; the rule still evaluates whatever did arrive.
    let open = match open_res {
      Ok((items, ts)) => {
        age = age.min(ts);
        items
      }
      Err(e) => {
        warn!("{}/{} open issues: {}", org, project, e);
        Vec::new()
      }
    };
    let closed = match closed_res {
      Ok((items, ts)) => {
        if needs_closed(&fs) {
          age = age.min(ts);
        }
        items
      }
      Err(e) => {
        warn!("{}/{} closed issues: {}", org, project, e);
        Vec::new()
      }
    };
    debug!(
      "{}/{}: {} open, {} closed issues",
      org,
      project,
      open.len(),
      closed.len()
    );

    let mut items = Vec::new();
    let mut seen_urls: HashMap<String, bool> = HashMap::new();
    for i in open.into_iter().chain(closed) {
      if !self.debug.is_empty() {
        if self.debug.contains(&i.number) {
          warn!("*** debug issue #{}: {:?}", i.number, i);
        } else {
          continue;
        }
      }
      if seen_urls.contains_key(&i.url) {
        warn!("unusual: already saw #{}", i.number);
        continue;
      }
      seen_urls.insert(i.url.clone(), true);
      items.push(i);
    }

    let mut filtered = Vec::new();
    let total = items.len();
    for i in items {
      if !pre_fetch_match(&i, &i.labels, &fs) {
        continue;
      }

      let mut comments = Vec::new();
      if need_comments(&i, &fs) && i.comments > 0 {
        match self
          .cached_issue_comments(org, project, i.number, i.updated_at)
          .await
        {
          Ok((cs, _)) => comments = cs,
          Err(e) => warn!("#{} comments: {}", i.number, e),
        }
      }

      let mut co = self.build_conversation(ItemKind::Issue, &i, &comments, age);
      co.similar = self.similar.observe(&co);
      if !co.similar.is_empty() {
        co.tags.push(tags::SIMILAR.to_string());
      }

      if !post_fetch_match(&co, &fs) {
        continue;
      }

      if need_timeline(&i, &fs, false, hidden) {
        match self
          .cached_timeline(org, project, i.number, i.updated_at)
          .await
        {
          Ok((timeline, _)) => {
            self.apply_timeline(&mut co, &timeline);
          }
          Err(e) => {
            warn!("#{} timeline: {}", i.number, e);
            continue;
          }
        }
      }

      if !post_events_match(&co, &fs) {
        continue;
      }

      filtered.push(co);
    }

    info!(
      "{} of {} issues in {}/{} matched",
      filtered.len(),
      total,
      org,
      project
    );
    Ok((filtered, age))
  }

  /// Search a repository's pull requests against the rule filters.
  pub(crate) async fn search_prs(
    &self,
    org: &str,
    project: &str,
    fs: &[Filter],
    newer_than: DateTime<Utc>,
    hidden: bool,
  ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
    let fs = open_by_default(fs);
    debug!("{}/{}: gathering PRs newer than {}", org, project, newer_than);

    let mut age = Utc::now();

    let (open_res, closed_res) = tokio::join!(
      self.cached_prs(org, project, "open", None, newer_than),
      async {
        if !needs_closed(&fs) {
          return Ok((Vec::new(), Utc::now()));
        }
        self
          .cached_prs(
            org,
            project,
            "closed",
            Some(self.max_closed_update_age),
            newer_than,
          )
          .await
      }
    );

    let open = match open_res {
      Ok((items, ts)) => {
        age = age.min(ts);
        items
      }
      Err(e) => {
        warn!("{}/{} open PRs: {}", org, project, e);
        Vec::new()
      }
    };
    let closed = match closed_res {
      Ok((items, ts)) => {
        if needs_closed(&fs) {
          age = age.min(ts);
        }
        items
      }
      Err(e) => {
        warn!("{}/{} closed PRs: {}", org, project, e);
        Vec::new()
      }
    };

    let mut prs = Vec::new();
    let mut seen_urls: HashMap<String, bool> = HashMap::new();
    for pr in open.into_iter().chain(closed) {
      if !self.debug.is_empty() {
        if self.debug.contains(&pr.number) {
          warn!("*** debug PR #{}: {:?}", pr.number, pr);
        } else {
          continue;
        }
      }
      if seen_urls.contains_key(&pr.url) {
        continue;
      }
      seen_urls.insert(pr.url.clone(), true);
      prs.push(pr);
    }

    let mut filtered = Vec::new();
    let total = prs.len();
    for pr in prs {
      if !pre_fetch_match(&pr, &pr.labels, &fs) {
        continue;
      }

      let mut comments = Vec::new();
      if need_comments(&pr, &fs) {
        match self
          .cached_pr_comments(org, project, pr.number, pr.updated_at)
          .await
        {
          Ok((cs, _)) => comments = cs,
          Err(e) => warn!("#{} comments: {}", pr.number, e),
        }
      }

      let mut co = self.build_conversation(ItemKind::PullRequest, &pr, &comments, age);
      co.merged = pr.merged_at.is_some();
      co.similar = self.similar.observe(&co);
      if !co.similar.is_empty() {
        co.tags.push(tags::SIMILAR.to_string());
      }

      if !post_fetch_match(&co, &fs) {
        continue;
      }

      let mut latest_commit = None;
      if need_timeline(&pr, &fs, true, hidden) {
        match self
          .cached_timeline(org, project, pr.number, pr.updated_at)
          .await
        {
          Ok((timeline, _)) => {
            latest_commit = self.apply_timeline(&mut co, &timeline);
          }
          Err(e) => {
            warn!("#{} timeline: {}", pr.number, e);
            continue;
          }
        }
      }

      if need_reviews(&pr, &fs, hidden) {
        match self
          .cached_reviews(org, project, pr.number, pr.updated_at)
          .await
        {
          Ok((reviews, _)) => self.apply_reviews(&mut co, &reviews, latest_commit),
          Err(e) => {
            warn!("#{} reviews: {}", pr.number, e);
            continue;
          }
        }
      }

      if !post_events_match(&co, &fs) {
        continue;
      }

      filtered.push(co);
    }

    info!(
      "{} of {} PRs in {}/{} matched",
      filtered.len(),
      total,
      org,
      project
    );
    Ok((filtered, age))
  }
}

/// Whether this item's comments are worth fetching: a filter demands
/// them, or the item is open (tags are useful even unfiltered).
fn need_comments(item: &dyn Item, fs: &[Filter]) -> bool {
  if filters_need_comments(fs) {
    return true;
  }
  item.state() == "open"
}

fn need_timeline(item: &dyn Item, fs: &[Filter], is_pr: bool, hidden: bool) -> bool {
  if item.milestone().is_some() {
    return true;
  }
  if item.state() != "open" {
    return false;
  }
  if item.updated_at() == item.created_at() {
    return false;
  }
  if is_pr {
    return true;
  }
  if filters_need_timeline(fs) {
    return true;
  }
  !hidden
}

fn need_reviews(item: &dyn Item, fs: &[Filter], hidden: bool) -> bool {
  if item.state() != "open" {
    return false;
  }
  if item.updated_at() == item.created_at() {
    return false;
  }
  if hidden {
    return false;
  }
  if filters_need_reviews(fs) {
    return true;
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::filters::FilterSpec;
  use crate::engine::test_support::issue;
  use chrono::Duration;

  fn filter(spec: FilterSpec) -> Filter {
    Filter::compile(&spec).unwrap()
  }

  #[test]
  fn closed_items_never_need_enrichment_beyond_filters() {
    let i = issue(1, "alice", "closed", Utc::now() - Duration::days(2));
    assert!(!need_timeline(&i, &[], false, false));
    assert!(!need_reviews(&i, &[], false));
    assert!(!need_comments(&i, &[]));
  }

  #[test]
  fn open_items_need_comments_by_default() {
    let i = issue(1, "alice", "open", Utc::now() - Duration::days(2));
    assert!(need_comments(&i, &[]));
  }

  #[test]
  fn responded_filter_forces_comment_fetch_even_when_closed() {
    let i = issue(1, "alice", "closed", Utc::now() - Duration::days(2));
    let f = filter(FilterSpec {
      responded: Some("+1d".to_string()),
      ..FilterSpec::default()
    });
    assert!(need_comments(&i, &[f]));
  }

  #[test]
  fn untouched_items_skip_timeline() {
    let created = Utc::now() - Duration::days(1);
    let mut i = issue(1, "alice", "open", created);
    i.updated_at = created;
    assert!(!need_timeline(&i, &[], true, false));
    assert!(!need_reviews(&i, &[], false));
  }

  #[test]
  fn hidden_pages_skip_expensive_enrichment() {
    let i = issue(1, "alice", "open", Utc::now() - Duration::days(2));
    assert!(!need_timeline(&i, &[], false, true));
    assert!(!need_reviews(&i, &[], true));
  }
}
