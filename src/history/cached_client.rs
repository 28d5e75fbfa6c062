//! Cached history client that wraps a history source with transparent caching.

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{CacheConfig, Invalidation, PaginatedCache, RecordSource};
use crate::config::Config;
use crate::error::{ErrorHandler, StructuredError};
use crate::operation::OperationSnapshot;

use super::client::HttpHistorySource;
use super::types::{HistoryQuery, HistoryRecord};

/// History client with transparent caching support.
///
/// Listings are paginated through a [`PaginatedCache`]; single records are
/// served from any cached listing or search before asking the server.
pub struct CachedHistoryClient<S = HttpHistorySource> {
  cache: PaginatedCache<HistoryRecord, S>,
}

impl<S> Clone for CachedHistoryClient<S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
    }
  }
}

impl CachedHistoryClient<HttpHistorySource> {
  /// Create a client for the configured API.
  pub fn new(config: &Config, handler: Arc<ErrorHandler>) -> Result<Self> {
    let source = HttpHistorySource::new(&config.api)?;
    let cache = PaginatedCache::with_error_handler(source, config.cache_config(), handler);
    Ok(Self { cache })
  }
}

impl<S: RecordSource<HistoryRecord>> CachedHistoryClient<S> {
  pub fn with_source(source: S, config: CacheConfig) -> Self {
    Self {
      cache: PaginatedCache::new(source, config),
    }
  }

  pub fn cache(&self) -> &PaginatedCache<HistoryRecord, S> {
    &self.cache
  }

  /// First page of a listing (cached when fresh), returned with any further
  /// pages already loaded.
  pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, StructuredError> {
    query.validate()?;
    let key = query.into_key();
    self.cache.fetch_page(&key, 0).await?;
    Ok(self.cache.records(&key))
  }

  /// Load the next page. `None` when there is nothing more to load (or it
  /// is already loading).
  pub async fn next_page(
    &self,
    query: &HistoryQuery,
  ) -> Result<Option<Vec<HistoryRecord>>, StructuredError> {
    let key = query.into_key();
    let page = self.cache.fetch_next(&key).await?;
    Ok(page.map(|p| p.records))
  }

  /// Warm the next page in the background.
  pub fn prefetch(&self, query: &HistoryQuery) {
    self.cache.prefetch_next(&query.into_key());
  }

  /// Debounced name search within a listing.
  pub async fn search(
    &self,
    query: &HistoryQuery,
    term: &str,
  ) -> Result<Option<Vec<HistoryRecord>>, StructuredError> {
    self.cache.search(&query.into_key(), term).await
  }

  /// A single record, from cache when possible.
  pub async fn record(&self, history_id: u64) -> Result<Option<HistoryRecord>, StructuredError> {
    let id = history_id.to_string();
    if let Some(cached) = self.cache.find_cached(&id) {
      return Ok(Some(cached));
    }
    let fetched = self.cache.batch_get(&[id]).await?;
    Ok(fetched.into_iter().next())
  }

  /// Several records in the requested order. Only the ones not cached are
  /// fetched, in one batch. Unknown ids are skipped.
  pub async fn records(&self, history_ids: &[u64]) -> Result<Vec<HistoryRecord>, StructuredError> {
    let mut found: HashMap<String, HistoryRecord> = HashMap::new();
    let mut missing = Vec::new();

    for id in history_ids.iter().map(|id| id.to_string()) {
      match self.cache.find_cached(&id) {
        Some(record) => {
          found.insert(id, record);
        }
        None => missing.push(id),
      }
    }

    for record in self.cache.batch_get(&missing).await? {
      found.insert(record.history_id.to_string(), record);
    }

    Ok(
      history_ids
        .iter()
        .filter_map(|id| found.get(&id.to_string()).cloned())
        .collect(),
    )
  }

  /// Drop the listing's cached pages and load the first one again.
  pub async fn refresh(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, StructuredError> {
    let key = query.into_key();
    self.cache.invalidate(&Invalidation::Key(key.clone()));
    self.cache.fetch_page(&key, 0).await?;
    Ok(self.cache.records(&key))
  }

  /// Status of the listing's latest page fetch.
  pub fn snapshot(&self, query: &HistoryQuery) -> OperationSnapshot {
    self.cache.snapshot(&query.into_key())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{PageRequest, QueryKey, RawPage};
  use crate::error::{ErrorKind, RawFailure};
  use crate::history::OperationType;
  use async_trait::async_trait;
  use chrono::{TimeZone, Utc};
  use std::collections::BTreeMap;
  use std::sync::Mutex;

  fn record(id: u64) -> HistoryRecord {
    HistoryRecord {
      history_id: id,
      original_id: 1,
      operation_type: OperationType::Update,
      operation_timestamp: "2024-05-01T10:00:00Z".to_string(),
      name: format!("instance-{}", id),
      model_name: "sdxl".to_string(),
      model_version: None,
      cluster_name: "gpu-a".to_string(),
      image_tag: "v1".to_string(),
      status: None,
      description: None,
      replicas: Some(1),
      extra: BTreeMap::new(),
    }
  }

  #[derive(Default)]
  struct FakeHistory {
    total: u64,
    page_requests: Mutex<Vec<PageRequest>>,
    batches: Mutex<Vec<Vec<String>>>,
  }

  #[async_trait]
  impl RecordSource<HistoryRecord> for FakeHistory {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage<HistoryRecord>, RawFailure> {
      self.page_requests.lock().unwrap().push(request.clone());
      let start = request.offset as u64;
      let end = (start + request.limit as u64).min(self.total);
      Ok(RawPage::new((start..end).map(record).collect()).with_total(self.total as usize))
    }

    async fn search(
      &self,
      _key: &QueryKey,
      _term: &str,
      _limit: usize,
    ) -> Result<Vec<HistoryRecord>, RawFailure> {
      Ok(vec![record(500)])
    }

    async fn batch_get(&self, ids: &[String]) -> Result<Vec<HistoryRecord>, RawFailure> {
      self.batches.lock().unwrap().push(ids.to_vec());
      Ok(
        ids
          .iter()
          .filter_map(|id| id.parse::<u64>().ok())
          .filter(|id| *id < 1000)
          .map(record)
          .collect(),
      )
    }
  }

  fn client(total: u64) -> CachedHistoryClient<FakeHistory> {
    let source = FakeHistory {
      total,
      ..FakeHistory::default()
    };
    CachedHistoryClient::with_source(source, CacheConfig::default())
  }

  #[tokio::test]
  async fn test_history_and_next_page() {
    let client = client(30);
    let query = HistoryQuery::for_instance(7);

    assert_eq!(client.history(&query).await.unwrap().len(), 20);
    let next = client.next_page(&query).await.unwrap().unwrap();
    assert_eq!(next.len(), 10);
    assert!(client.next_page(&query).await.unwrap().is_none());

    // Cached first page, all loaded records returned
    assert_eq!(client.history(&query).await.unwrap().len(), 30);
    assert_eq!(client.cache().source().page_requests.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_invalid_range_is_rejected_before_request() {
    let client = client(30);
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let query = HistoryQuery::new().since(at).until(at);

    let error = client.history(&query).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(client.cache().source().page_requests.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_record_prefers_cache() {
    let client = client(30);
    client.history(&HistoryQuery::new()).await.unwrap();

    assert_eq!(client.record(3).await.unwrap().map(|r| r.history_id), Some(3));
    assert!(client.cache().source().batches.lock().unwrap().is_empty());

    assert_eq!(client.record(900).await.unwrap().map(|r| r.history_id), Some(900));
    assert!(client.record(5000).await.unwrap().is_none());
    assert_eq!(client.cache().source().batches.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_records_fetch_only_missing() {
    let client = client(30);
    client.history(&HistoryQuery::new()).await.unwrap();

    let records = client.records(&[900, 2, 5000, 1]).await.unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.history_id).collect();
    assert_eq!(ids, vec![900, 2, 1]);

    let batches = client.cache().source().batches.lock().unwrap();
    assert_eq!(
      *batches,
      vec![vec!["900".to_string(), "5000".to_string()]]
    );
  }

  #[tokio::test]
  async fn test_refresh_replaces_pages() {
    let client = client(30);
    let query = HistoryQuery::new();

    client.history(&query).await.unwrap();
    client.next_page(&query).await.unwrap();

    let refreshed = client.refresh(&query).await.unwrap();
    assert_eq!(refreshed.len(), 20);
    assert_eq!(client.cache().source().page_requests.lock().unwrap().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_search() {
    let client = client(30);
    let results = client
      .search(&HistoryQuery::new(), "instance")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(results[0].history_id, 500);
    assert_eq!(client.record(500).await.unwrap().map(|r| r.history_id), Some(500));
  }
}
