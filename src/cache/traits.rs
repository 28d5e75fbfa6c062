//! Core traits and types for the caching system.

use async_trait::async_trait;

use super::key::QueryKey;
use crate::error::RawFailure;

/// Trait for entities that can be cached.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Unique identifier for this entity (e.g., history id)
  fn cache_key(&self) -> String;

  /// Entity type name for log context (e.g., "history_record")
  fn entity_type() -> &'static str;
}

/// One page request sent to a [`RecordSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
  pub key: QueryKey,
  pub offset: usize,
  pub limit: usize,
}

/// Records returned by a source for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage<T> {
  pub records: Vec<T>,
  /// Size of the full result set, when the source knows it.
  pub total_count: Option<usize>,
}

impl<T> RawPage<T> {
  pub fn new(records: Vec<T>) -> Self {
    Self {
      records,
      total_count: None,
    }
  }

  pub fn with_total(mut self, total_count: usize) -> Self {
    self.total_count = Some(total_count);
    self
  }
}

/// Remote data source behind the cache.
///
/// Implementations report failures as [`RawFailure`]; classification and
/// retries happen in the cache.
#[async_trait]
pub trait RecordSource<T>: Send + Sync + 'static {
  async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage<T>, RawFailure>;

  async fn search(&self, key: &QueryKey, term: &str, limit: usize)
    -> Result<Vec<T>, RawFailure>;

  async fn batch_get(&self, ids: &[String]) -> Result<Vec<T>, RawFailure>;
}
