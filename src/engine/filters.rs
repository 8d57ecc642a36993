//! The declarative filter language.
//!
//! A filter is a mapping of optional keys that AND together; a rule holds
//! an ordered list of filters that also AND. Regex values are anchored and
//! support a leading `!` for negation. All patterns compile at config load
//! so an invalid expression is a startup failure, never a runtime one.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;

use super::conversation::Conversation;
use super::tags;
use crate::github::types::{Item, Label};

/// Raw, as-deserialized filter entry. Compiled into [`Filter`] at load.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FilterSpec {
  pub title: Option<String>,
  pub tag: Option<String>,
  pub label: Option<String>,
  pub state: Option<String>,
  pub created: Option<String>,
  pub updated: Option<String>,
  pub responded: Option<String>,
  pub prioritized: Option<String>,
  pub commenters: Option<String>,
  pub closed_commenters: Option<String>,
  pub closed_comments: Option<String>,
  pub reactions: Option<String>,
  pub reactions_per_month: Option<String>,
  pub commenters_per_month: Option<String>,
  pub milestone: Option<String>,
  pub assignee: Option<String>,
  pub author: Option<String>,
  pub role: Option<String>,
  pub draft: Option<bool>,
}

/// An anchored regex with optional negation (leading `!`).
#[derive(Debug, Clone)]
pub struct Matcher {
  re: Regex,
  negate: bool,
}

impl Matcher {
  pub fn parse(expr: &str) -> Result<Self> {
    let (pattern, negate) = match expr.strip_prefix('!') {
      Some(rest) => (rest, true),
      None => (expr, false),
    };
    let re = Regex::new(&format!("^(?:{})$", pattern))
      .map_err(|e| eyre!("invalid filter regex {:?}: {}", expr, e))?;
    Ok(Self { re, negate })
  }

  pub fn matches(&self, value: &str) -> bool {
    self.re.is_match(value) != self.negate
  }

  /// Positive-match check against a set, honoring negation: a negated
  /// matcher passes iff no element matches.
  pub fn matches_any<'a, I: IntoIterator<Item = &'a str>>(&self, values: I) -> bool {
    let hit = values.into_iter().any(|v| self.re.is_match(v));
    hit != self.negate
  }

  pub fn regex(&self) -> &Regex {
    &self.re
  }
}

/// A duration window relative to now: `+Nd`/`>Nd` select things older
/// than N, `-Nd`/`<Nd` things newer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
  OlderThan(Duration),
  NewerThan(Duration),
}

impl Window {
  pub fn parse(expr: &str) -> Result<Self> {
    let expr = expr.trim();
    let (older, rest) = match expr.chars().next() {
      Some('+') | Some('>') => (true, &expr[1..]),
      Some('-') | Some('<') => (false, &expr[1..]),
      _ => {
        return Err(eyre!(
          "duration window {:?} must start with +, -, > or <",
          expr
        ))
      }
    };
    let d = parse_duration(rest)?;
    Ok(if older {
      Window::OlderThan(d)
    } else {
      Window::NewerThan(d)
    })
  }

  pub fn matches(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if ts == DateTime::UNIX_EPOCH {
      return false;
    }
    let age = now - ts;
    match self {
      Window::OlderThan(d) => age > *d,
      Window::NewerThan(d) => age < *d,
    }
  }
}

/// Parse a duration like `45s`, `10m`, `3h`, `2d`, `1w`.
pub fn parse_duration(s: &str) -> Result<Duration> {
  let s = s.trim();
  let split = s
    .find(|c: char| !c.is_ascii_digit())
    .ok_or_else(|| eyre!("duration {:?} is missing a unit (s/m/h/d/w)", s))?;
  let (num, unit) = s.split_at(split);
  let n: i64 = num
    .parse()
    .map_err(|e| eyre!("bad duration {:?}: {}", s, e))?;
  match unit {
    "s" => Ok(Duration::seconds(n)),
    "m" => Ok(Duration::minutes(n)),
    "h" => Ok(Duration::hours(n)),
    "d" => Ok(Duration::days(n)),
    "w" => Ok(Duration::weeks(n)),
    _ => Err(eyre!("unknown duration unit {:?} in {:?}", unit, s)),
  }
}

/// A numeric comparison: `>N`, `<N`, or `=N`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumCmp {
  Over(f64),
  Under(f64),
  Exactly(f64),
}

impl NumCmp {
  pub fn parse(expr: &str) -> Result<Self> {
    let expr = expr.trim();
    let (op, rest) = match expr.chars().next() {
      Some('>') => ('>', &expr[1..]),
      Some('<') => ('<', &expr[1..]),
      Some('=') => ('=', &expr[1..]),
      Some(c) if c.is_ascii_digit() => ('=', expr),
      _ => return Err(eyre!("numeric comparison {:?} must start with >, < or =", expr)),
    };
    let n: f64 = rest
      .trim()
      .parse()
      .map_err(|e| eyre!("bad number in {:?}: {}", expr, e))?;
    Ok(match op {
      '>' => NumCmp::Over(n),
      '<' => NumCmp::Under(n),
      _ => NumCmp::Exactly(n),
    })
  }

  pub fn matches(&self, v: f64) -> bool {
    match self {
      NumCmp::Over(n) => v > *n,
      NumCmp::Under(n) => v < *n,
      NumCmp::Exactly(n) => (v - n).abs() < f64::EPSILON,
    }
  }
}

/// A compiled filter entry.
#[derive(Debug, Clone, Default)]
pub struct Filter {
  pub title: Option<Matcher>,
  pub tag: Option<Matcher>,
  pub label: Option<Matcher>,
  pub milestone: Option<Matcher>,
  pub assignee: Option<Matcher>,
  pub author: Option<Matcher>,
  pub role: Option<Matcher>,
  pub state: Option<String>,
  pub created: Option<Window>,
  pub updated: Option<Window>,
  pub responded: Option<Window>,
  pub prioritized: Option<Window>,
  pub commenters: Option<NumCmp>,
  pub closed_commenters: Option<NumCmp>,
  pub closed_comments: Option<NumCmp>,
  pub reactions: Option<NumCmp>,
  pub reactions_per_month: Option<NumCmp>,
  pub commenters_per_month: Option<NumCmp>,
  pub draft: Option<bool>,
}

impl Filter {
  pub fn compile(spec: &FilterSpec) -> Result<Self> {
    let matcher = |s: &Option<String>| -> Result<Option<Matcher>> {
      s.as_deref().map(Matcher::parse).transpose()
    };
    let window = |s: &Option<String>| -> Result<Option<Window>> {
      s.as_deref().map(Window::parse).transpose()
    };
    let num = |s: &Option<String>| -> Result<Option<NumCmp>> {
      s.as_deref().map(NumCmp::parse).transpose()
    };

    if let Some(state) = spec.state.as_deref() {
      if !matches!(state, "open" | "closed" | "all") {
        return Err(eyre!("state must be open, closed or all, got {:?}", state));
      }
    }

    Ok(Self {
      title: matcher(&spec.title)?,
      tag: matcher(&spec.tag)?,
      label: matcher(&spec.label)?,
      milestone: matcher(&spec.milestone)?,
      assignee: matcher(&spec.assignee)?,
      author: matcher(&spec.author)?,
      role: matcher(&spec.role)?,
      state: spec.state.clone(),
      created: window(&spec.created)?,
      updated: window(&spec.updated)?,
      responded: window(&spec.responded)?,
      prioritized: window(&spec.prioritized)?,
      commenters: num(&spec.commenters)?,
      closed_commenters: num(&spec.closed_commenters)?,
      closed_comments: num(&spec.closed_comments)?,
      reactions: num(&spec.reactions)?,
      reactions_per_month: num(&spec.reactions_per_month)?,
      commenters_per_month: num(&spec.commenters_per_month)?,
      draft: spec.draft,
    })
  }

  /// The implicit filter prepended to rules that never mention state.
  pub fn open_state() -> Self {
    Self {
      state: Some("open".to_string()),
      ..Self::default()
    }
  }
}

/// Prepend `state: open` when no filter mentions state.
pub fn open_by_default(fs: &[Filter]) -> Vec<Filter> {
  if fs.iter().any(|f| f.state.is_some()) {
    return fs.to_vec();
  }
  let mut out = Vec::with_capacity(fs.len() + 1);
  out.push(Filter::open_state());
  out.extend(fs.iter().cloned());
  out
}

/// Whether the filters require fetching closed listings at all.
pub fn needs_closed(fs: &[Filter]) -> bool {
  fs.iter().any(|f| {
    f.closed_commenters.is_some()
      || f.closed_comments.is_some()
      || f.state.as_deref().is_some_and(|s| s != "open")
  })
}

/// Phase 1: decidable from the raw item and its labels alone.
pub fn pre_fetch_match(item: &dyn Item, labels: &[Label], fs: &[Filter]) -> bool {
  let now = Utc::now();
  fs.iter().all(|f| {
    if let Some(m) = &f.title {
      if !m.matches(item.title()) {
        return false;
      }
    }
    if let Some(m) = &f.label {
      if !m.matches_any(labels.iter().map(|l| l.name.as_str())) {
        return false;
      }
    }
    if let Some(state) = f.state.as_deref() {
      if state != "all" && item.state() != state {
        return false;
      }
    }
    if let Some(w) = &f.created {
      if !w.matches(item.created_at(), now) {
        return false;
      }
    }
    if let Some(want) = f.draft {
      if item.is_draft() != want {
        return false;
      }
    }
    true
  })
}

/// Phase 2: requires the built conversation, but not timeline/review
/// enrichment. Tag filters that could select an event-derived tag are
/// deferred to phase 3.
pub fn post_fetch_match(co: &Conversation, fs: &[Filter]) -> bool {
  let now = Utc::now();
  fs.iter().all(|f| {
    if let Some(m) = &f.tag {
      if !tags::regex_touches_events(m.regex())
        && !m.matches_any(co.tags.iter().map(String::as_str))
      {
        return false;
      }
    }
    if let Some(m) = &f.milestone {
      let title = co.milestone.as_ref().map(|m| m.title.as_str()).unwrap_or("");
      if !m.matches(title) {
        return false;
      }
    }
    if let Some(m) = &f.assignee {
      if !m.matches_any(co.assignees.iter().map(|u| u.login.as_str())) {
        return false;
      }
    }
    if let Some(m) = &f.author {
      if !m.matches(&co.author.login) {
        return false;
      }
    }
    if let Some(m) = &f.role {
      if !m.matches(&co.last_commenter_role) {
        return false;
      }
    }
    if let Some(w) = &f.updated {
      if !w.matches(co.updated, now) {
        return false;
      }
    }
    if let Some(w) = &f.responded {
      if !w.matches(co.latest_member_response, now) {
        return false;
      }
    }
    if let Some(w) = &f.prioritized {
      let ts = co.prioritized.unwrap_or(DateTime::UNIX_EPOCH);
      if !w.matches(ts, now) {
        return false;
      }
    }
    if let Some(c) = &f.commenters {
      if !c.matches(co.commenters_total as f64) {
        return false;
      }
    }
    if let Some(c) = &f.closed_commenters {
      if !c.matches(co.closed_commenters_total as f64) {
        return false;
      }
    }
    if let Some(c) = &f.closed_comments {
      if !c.matches(co.closed_comments_total as f64) {
        return false;
      }
    }
    if let Some(c) = &f.reactions {
      if !c.matches(co.reactions_total as f64) {
        return false;
      }
    }
    if let Some(c) = &f.reactions_per_month {
      if !c.matches(co.reactions_per_month) {
        return false;
      }
    }
    if let Some(c) = &f.commenters_per_month {
      if !c.matches(co.commenters_per_month) {
        return false;
      }
    }
    true
  })
}

/// Phase 3: tag filters that depend on timeline/review enrichment,
/// evaluated against the full tag set.
pub fn post_events_match(co: &Conversation, fs: &[Filter]) -> bool {
  fs.iter().all(|f| match &f.tag {
    Some(m) if tags::regex_touches_events(m.regex()) => {
      m.matches_any(co.tags.iter().map(String::as_str))
    }
    _ => true,
  })
}

/// Dispatch: whether any filter forces a comment fetch.
pub fn filters_need_comments(fs: &[Filter]) -> bool {
  fs.iter().any(|f| {
    if let Some(m) = &f.tag {
      if tags::regex_needs_comments(m.regex()) {
        return true;
      }
    }
    f.closed_commenters.is_some()
      || f.closed_comments.is_some()
      || f.responded.is_some()
      || f.commenters.is_some()
  })
}

/// Dispatch: whether any filter forces a timeline fetch.
pub fn filters_need_timeline(fs: &[Filter]) -> bool {
  fs.iter().any(|f| {
    if let Some(m) = &f.tag {
      if tags::regex_needs_timeline(m.regex()) {
        return true;
      }
    }
    f.prioritized.is_some()
  })
}

/// Dispatch: whether any filter forces a review fetch.
pub fn filters_need_reviews(fs: &[Filter]) -> bool {
  fs.iter().any(|f| {
    f.tag
      .as_ref()
      .is_some_and(|m| tags::regex_needs_reviews(m.regex()))
  })
}
