//! The rule engine: fetches items, derives tagged conversations, and
//! evaluates collections of filter rules against them.

mod collection;
mod conversation;
mod fetch;
pub mod filters;
mod search;
mod similar;
pub mod tags;

pub use collection::{Collection, CollectionResult, Rule, RuleKind, RuleResult};
pub use conversation::{Conversation, ItemKind, RelatedItem};

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::github::GithubClient;
use similar::SimilarityIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
  pub organization: String,
  pub project: String,
}

/// Everything the engine needs beyond its collaborators. Produced from
/// the configuration file.
pub struct EngineSettings {
  pub repos: Vec<Repo>,
  pub rules: HashMap<String, Rule>,
  pub members: HashSet<String>,
  pub member_roles: HashSet<String>,
  pub max_closed_update_age: Duration,
  pub min_similarity: f64,
  /// When non-empty, searches drop every item not in this set and log
  /// the survivors loudly. For chasing a single misbehaving item.
  pub debug: HashSet<i64>,
}

pub struct Engine {
  pub(crate) client: GithubClient,
  pub(crate) cache: Arc<Cache>,
  pub(crate) repos: Vec<Repo>,
  pub(crate) rules: HashMap<String, Rule>,
  pub(crate) members: HashSet<String>,
  pub(crate) member_roles: HashSet<String>,
  pub(crate) max_closed_update_age: Duration,
  pub(crate) similar: SimilarityIndex,
  pub(crate) ref_mtimes: Mutex<HashMap<String, DateTime<Utc>>>,
  pub(crate) debug: HashSet<i64>,
}

impl Engine {
  pub fn new(client: GithubClient, cache: Arc<Cache>, settings: EngineSettings) -> Self {
    Self {
      client,
      cache,
      repos: settings.repos,
      rules: settings.rules,
      members: settings.members,
      member_roles: settings.member_roles.into_iter().map(|r| r.to_lowercase()).collect(),
      max_closed_update_age: settings.max_closed_update_age,
      similar: SimilarityIndex::new(settings.min_similarity),
      ref_mtimes: Mutex::new(HashMap::new()),
      debug: settings.debug,
    }
  }

  /// The last time anything referenced the given item, if known.
  pub fn mentioned_at(&self, org: &str, project: &str, id: i64) -> Option<DateTime<Utc>> {
    let key = format!("{}/{}/{}", org, project, id);
    let mtimes = self.ref_mtimes.lock().unwrap_or_else(|e| e.into_inner());
    mtimes.get(&key).copied()
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  use super::*;
  use crate::cache::MemoryBackend;
  use crate::github::types::{Comment, Issue, Reactions, User};

  pub fn test_engine(members: &[&str]) -> Engine {
    let settings = EngineSettings {
      repos: Vec::new(),
      rules: HashMap::new(),
      members: members.iter().map(|m| m.to_string()).collect(),
      member_roles: ["owner", "member", "collaborator"]
        .iter()
        .map(|r| r.to_string())
        .collect(),
      max_closed_update_age: Duration::weeks(2),
      min_similarity: 0.0,
      debug: HashSet::new(),
    };
    Engine::new(
      GithubClient::new("").unwrap(),
      Arc::new(Cache::new(Box::new(MemoryBackend))),
      settings,
    )
  }

  pub fn issue(number: i64, author: &str, state: &str, created: DateTime<Utc>) -> Issue {
    Issue {
      id: number,
      number,
      title: format!("issue {}", number),
      body: None,
      html_url: format!("https://github.com/o/p/issues/{}", number),
      url: format!("https://api.github.com/repos/o/p/issues/{}", number),
      state: state.to_string(),
      user: User {
        login: author.to_string(),
      },
      author_association: "none".to_string(),
      labels: Vec::new(),
      assignee: None,
      milestone: None,
      comments: 0,
      created_at: created,
      updated_at: created + Duration::hours(1),
      closed_at: None,
      pull_request: None,
    }
  }

  pub fn comment(author: &str, body: &str, created: DateTime<Utc>) -> Comment {
    Comment {
      user: User {
        login: author.to_string(),
      },
      author_association: if author == "maintainer" {
        "member".to_string()
      } else {
        "none".to_string()
      },
      body: Some(body.to_string()),
      created_at: created,
      updated_at: created,
      reactions: Reactions::default(),
    }
  }
}
