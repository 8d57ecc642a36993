//! Declarative configuration: settings, collections, rules, filters.
//!
//! Everything that can fail is checked at load: filter regexes compile,
//! durations parse, and every rule id referenced by a collection must
//! exist. A bad config never makes it past startup.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::engine::filters::{parse_duration, Filter, FilterSpec};
use crate::engine::{Collection, EngineSettings, Repo, Rule, RuleKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
  settings: SettingsSpec,
  collections: Vec<CollectionSpec>,
  rules: HashMap<String, RuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SettingsSpec {
  name: Option<String>,
  #[serde(default)]
  members: Vec<String>,
  #[serde(default = "default_member_roles")]
  member_roles: Vec<String>,
  repos: Vec<String>,
  min_refresh: Option<String>,
  max_refresh: Option<String>,
  max_closed_update_age: Option<String>,
  #[serde(default)]
  min_similarity: f64,
}

fn default_member_roles() -> Vec<String> {
  vec![
    "owner".to_string(),
    "member".to_string(),
    "collaborator".to_string(),
  ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct CollectionSpec {
  id: String,
  name: String,
  rules: Vec<String>,
  #[serde(default)]
  used_for_stats: bool,
  #[serde(default)]
  hidden: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
  name: Option<String>,
  #[serde(rename = "type", default)]
  kind: Option<String>,
  #[serde(default)]
  filters: Vec<FilterSpec>,
}

/// Fully validated configuration.
pub struct Config {
  pub name: String,
  pub collections: Vec<Collection>,
  pub min_refresh: Duration,
  pub max_refresh: Duration,
  pub engine: EngineSettings,
}

impl Config {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents)
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let file: ConfigFile =
      serde_yaml::from_str(contents).map_err(|e| eyre!("failed to parse config: {}", e))?;

    let repos = file
      .settings
      .repos
      .iter()
      .map(|r| parse_repo(r))
      .collect::<Result<Vec<Repo>>>()?;
    if repos.is_empty() {
      return Err(eyre!("settings.repos must name at least one repository"));
    }

    let mut rules = HashMap::new();
    for (id, spec) in &file.rules {
      let kind = match spec.kind.as_deref() {
        None | Some("") | Some("any") => RuleKind::Any,
        Some("issue") => RuleKind::Issue,
        Some("pull-request") | Some("pull_request") => RuleKind::PullRequest,
        Some(other) => {
          return Err(eyre!(
            "rule {:?}: type must be issue, pull-request or any, got {:?}",
            id,
            other
          ))
        }
      };
      let filters = spec
        .filters
        .iter()
        .map(Filter::compile)
        .collect::<Result<Vec<Filter>>>()
        .map_err(|e| eyre!("rule {:?}: {}", id, e))?;
      rules.insert(
        id.clone(),
        Rule {
          id: id.clone(),
          name: spec.name.clone().unwrap_or_else(|| id.clone()),
          kind,
          filters,
        },
      );
    }

    let mut seen_ids = HashSet::new();
    let mut collections = Vec::with_capacity(file.collections.len());
    for spec in &file.collections {
      if !seen_ids.insert(spec.id.clone()) {
        return Err(eyre!("duplicate collection id {:?}", spec.id));
      }
      for rule_id in &spec.rules {
        if !rules.contains_key(rule_id) {
          return Err(eyre!(
            "collection {:?} references unknown rule {:?}",
            spec.id,
            rule_id
          ));
        }
      }
      collections.push(Collection {
        id: spec.id.clone(),
        name: spec.name.clone(),
        rule_ids: spec.rules.clone(),
        used_for_stats: spec.used_for_stats,
        hidden: spec.hidden,
      });
    }
    if collections.is_empty() {
      return Err(eyre!("config must define at least one collection"));
    }

    let min_refresh = optional_duration(&file.settings.min_refresh, Duration::seconds(30))?;
    let max_refresh = optional_duration(&file.settings.max_refresh, Duration::minutes(10))?;
    if min_refresh > max_refresh {
      return Err(eyre!(
        "min-refresh ({}) must not exceed max-refresh ({})",
        min_refresh,
        max_refresh
      ));
    }
    let max_closed_update_age =
      optional_duration(&file.settings.max_closed_update_age, Duration::weeks(2))?;

    Ok(Self {
      name: file.settings.name.unwrap_or_else(|| "triage".to_string()),
      collections,
      min_refresh,
      max_refresh,
      engine: EngineSettings {
        repos,
        rules,
        members: file.settings.members.into_iter().collect(),
        member_roles: file.settings.member_roles.into_iter().collect(),
        max_closed_update_age,
        min_similarity: file.settings.min_similarity,
        debug: debug_numbers(),
      },
    })
  }
}

fn optional_duration(s: &Option<String>, default: Duration) -> Result<Duration> {
  match s {
    Some(s) => parse_duration(s),
    None => Ok(default),
  }
}

/// Accept `org/project` or a full `https://github.com/org/project` URL.
fn parse_repo(s: &str) -> Result<Repo> {
  let trimmed = s
    .trim()
    .trim_start_matches("https://github.com/")
    .trim_start_matches("http://github.com/")
    .trim_end_matches('/');
  let parts: Vec<&str> = trimmed.split('/').collect();
  match parts.as_slice() {
    [org, project] if !org.is_empty() && !project.is_empty() => Ok(Repo {
      organization: org.to_string(),
      project: project.to_string(),
    }),
    _ => Err(eyre!("repo {:?} is not of the form org/project", s)),
  }
}

/// The upstream API token. Required.
pub fn github_token() -> Result<String> {
  std::env::var("GITHUB_TOKEN")
    .map_err(|_| eyre!("GITHUB_TOKEN is not set; create a token and export it"))
}

/// Comma-separated item numbers to isolate during searches.
fn debug_numbers() -> HashSet<i64> {
  std::env::var("TRIAGE_DEBUG_NUMBERS")
    .ok()
    .map(|v| v.split(',').filter_map(|n| n.trim().parse().ok()).collect())
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
settings:
  name: example
  min-similarity: 0.75
  repos:
    - https://github.com/acme/widgets
  members:
    - maintainer
collections:
  - id: home
    name: Home
    rules:
      - issue-needs-comment
      - needs-review
rules:
  issue-needs-comment:
    name: "Unresponded issues"
    type: issue
    filters:
      - tag: "!commented"
      - tag: "recv"
  needs-review:
    name: "PRs needing review"
    type: pull-request
    filters:
      - title: "!.*(WIP|wip).*"
      - tag: "unreviewed"
"#;

  #[test]
  fn minimal_config_parses() {
    let config = Config::parse(MINIMAL).unwrap();
    assert_eq!(config.name, "example");
    assert_eq!(config.collections.len(), 1);
    assert_eq!(config.collections[0].rule_ids.len(), 2);
    assert_eq!(config.engine.repos[0].organization, "acme");
    assert_eq!(config.engine.repos[0].project, "widgets");
    assert_eq!(config.engine.rules.len(), 2);
    assert_eq!(config.min_refresh, Duration::seconds(30));
    assert_eq!(config.max_refresh, Duration::minutes(10));
  }

  #[test]
  fn unknown_rule_reference_is_fatal() {
    let bad = MINIMAL.replace("- needs-review", "- no-such-rule");
    assert!(Config::parse(&bad).is_err());
  }

  #[test]
  fn invalid_filter_regex_is_fatal() {
    let bad = MINIMAL.replace("\"!commented\"", "\"([unclosed\"");
    assert!(Config::parse(&bad).is_err());
  }

  #[test]
  fn bad_repo_is_rejected() {
    let bad = MINIMAL.replace("https://github.com/acme/widgets", "not-a-repo");
    assert!(Config::parse(&bad).is_err());
  }

  #[test]
  fn durations_are_parsed() {
    let with_refresh = MINIMAL.replace(
      "  name: example",
      "  name: example\n  min-refresh: 10s\n  max-refresh: 5m\n  max-closed-update-age: 7d",
    );
    let config = Config::parse(&with_refresh).unwrap();
    assert_eq!(config.min_refresh, Duration::seconds(10));
    assert_eq!(config.max_refresh, Duration::minutes(5));
    assert_eq!(config.engine.max_closed_update_age, Duration::days(7));
  }
}
