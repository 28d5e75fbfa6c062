//! Structural identities for cached queries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Label prefix of search-result partitions.
pub const SEARCH_PARTITION: &str = "history-search";

/// Identity of one logical paginated query.
///
/// Two keys are equal when resource, parent and the full filter set match.
/// Filters live in a `BTreeMap`, so insertion order never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
  pub resource: String,
  pub parent_id: Option<String>,
  pub filters: BTreeMap<String, String>,
}

impl QueryKey {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      parent_id: None,
      filters: BTreeMap::new(),
    }
  }

  pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
    self.parent_id = Some(parent_id.into());
    self
  }

  pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.filters.insert(name.into(), value.into());
    self
  }

  /// Stable SHA-256 hex digest of the key.
  pub fn cache_hash(&self) -> String {
    let filters = self
      .filters
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    let input = format!(
      "{}:{}:{}",
      self.resource,
      self.parent_id.as_deref().unwrap_or(""),
      filters
    );
    sha256_hex(&input)
  }

  /// Human-readable description for logs.
  pub fn description(&self) -> String {
    let mut out = self.resource.clone();
    if let Some(parent) = &self.parent_id {
      out.push_str(&format!(" of {}", parent));
    }
    if !self.filters.is_empty() {
      let filters: Vec<_> = self
        .filters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
      out.push_str(&format!(" [{}]", filters.join(", ")));
    }
    out
  }
}

/// Identity of one search partition: the browse key plus the trimmed term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey {
  pub key: QueryKey,
  pub term: String,
}

impl SearchKey {
  /// Terms are trimmed and case-folded, so "Nginx" and "nginx " share a
  /// partition.
  pub fn new(key: &QueryKey, term: &str) -> Self {
    Self {
      key: key.clone(),
      term: term.trim().to_lowercase(),
    }
  }

  /// Partition label, `history-search:<hash>`.
  pub fn label(&self) -> String {
    let input = format!("{}:{}", self.key.cache_hash(), self.term);
    format!("{}:{}", SEARCH_PARTITION, sha256_hex(&input))
  }

  /// Label of the tracker all searches within `key` share.
  pub fn tracker_label(key: &QueryKey) -> String {
    format!("{}:{}", SEARCH_PARTITION, key.cache_hash())
  }
}

fn sha256_hex(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
