//! Derived-tag registry.
//!
//! Each tag records which enrichments its derivation depends on; dispatch
//! consults this to decide whether a filter can force a comment, timeline,
//! or review fetch.

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagInfo {
  pub id: &'static str,
  pub needs_comments: bool,
  pub needs_timeline: bool,
  pub needs_reviews: bool,
}

const fn tag(id: &'static str) -> TagInfo {
  TagInfo {
    id,
    needs_comments: false,
    needs_timeline: false,
    needs_reviews: false,
  }
}

const fn comment_tag(id: &'static str) -> TagInfo {
  TagInfo {
    id,
    needs_comments: true,
    needs_timeline: false,
    needs_reviews: false,
  }
}

const fn timeline_tag(id: &'static str) -> TagInfo {
  TagInfo {
    id,
    needs_comments: false,
    needs_timeline: true,
    needs_reviews: false,
  }
}

const fn review_tag(id: &'static str) -> TagInfo {
  TagInfo {
    id,
    needs_comments: false,
    needs_timeline: false,
    needs_reviews: true,
  }
}

pub const ASSIGNED: &str = "assigned";
pub const COMMENTED: &str = "commented";
pub const SEND: &str = "send";
pub const RECV: &str = "recv";
pub const RECV_Q: &str = "recv-q";
pub const OPEN_MILESTONE: &str = "open-milestone";
pub const ASSIGNEE_UPDATED: &str = "assignee-updated";
pub const AUTHOR_LAST: &str = "author-last";
pub const CLOSED: &str = "closed";
pub const SIMILAR: &str = "similar";
pub const NEW_COMMITS: &str = "new-commits";
pub const UNREVIEWED: &str = "unreviewed";
pub const APPROVED: &str = "approved";
pub const CHANGES_REQUESTED: &str = "changes-requested";
pub const MERGED_WITHOUT_REVIEW: &str = "merged-without-review";
pub const DRAFT: &str = "draft";

/// All statically known tags. `role-last:<role>` is derived dynamically
/// and shares the needs of `author-last`.
pub const TAGS: &[TagInfo] = &[
  tag(ASSIGNED),
  comment_tag(COMMENTED),
  comment_tag(SEND),
  comment_tag(RECV),
  comment_tag(RECV_Q),
  tag(OPEN_MILESTONE),
  comment_tag(ASSIGNEE_UPDATED),
  comment_tag(AUTHOR_LAST),
  tag(CLOSED),
  tag(SIMILAR),
  timeline_tag(NEW_COMMITS),
  review_tag(UNREVIEWED),
  review_tag(APPROVED),
  review_tag(CHANGES_REQUESTED),
  review_tag(MERGED_WITHOUT_REVIEW),
  tag(DRAFT),
];

pub fn role_last(role: &str) -> String {
  format!("role-last:{}", role)
}

/// Whether a tag regex could select a tag whose derivation needs comments.
/// Negated filters still need the data to prove the tag's absence, so
/// negation is ignored here.
pub fn regex_needs_comments(re: &Regex) -> bool {
  TAGS.iter().any(|t| t.needs_comments && re.is_match(t.id))
}

pub fn regex_needs_timeline(re: &Regex) -> bool {
  TAGS.iter().any(|t| t.needs_timeline && re.is_match(t.id))
}

pub fn regex_needs_reviews(re: &Regex) -> bool {
  TAGS.iter().any(|t| t.needs_reviews && re.is_match(t.id))
}

/// Whether a tag regex could select an event-derived tag. Filters that
/// can are only decidable after timeline/review enrichment.
pub fn regex_touches_events(re: &Regex) -> bool {
  TAGS
    .iter()
    .any(|t| (t.needs_timeline || t.needs_reviews) && re.is_match(t.id))
}
