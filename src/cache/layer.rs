//! Cache layer that orchestrates paging, search and prefetch over a
//! [`RecordSource`].

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::key::{QueryKey, SearchKey};
use super::page::{CacheEntry, CachePage};
use super::traits::{Cacheable, PageRequest, RecordSource};
use crate::error::{ErrorHandler, ErrorKind, Severity, StructuredError};
use crate::operation::{OperationSnapshot, OperationTracker, TrackerConfig};
use crate::retry::RetryOptions;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_PREFETCH_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_SEARCH_MIN_LENGTH: usize = 2;

/// Tracker label shared by all `batch_get` calls.
const BATCH_LABEL: &str = "batch-get";

/// Behaviour settings for a [`PaginatedCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
  pub page_size: usize,
  pub prefetch_enabled: bool,
  /// Quiet period before a prefetch fires.
  pub prefetch_delay: Duration,
  /// Shorter (trimmed) search terms return an empty result immediately.
  pub search_min_length: usize,
  pub search_debounce: Duration,
  pub retry: RetryOptions,
  pub tracker: TrackerConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
      prefetch_enabled: true,
      prefetch_delay: DEFAULT_PREFETCH_DELAY,
      search_min_length: DEFAULT_SEARCH_MIN_LENGTH,
      search_debounce: DEFAULT_SEARCH_DEBOUNCE,
      retry: RetryOptions::default(),
      tracker: TrackerConfig::default(),
    }
  }
}

impl CacheConfig {
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn with_prefetch(mut self, enabled: bool) -> Self {
    self.prefetch_enabled = enabled;
    self
  }

  pub fn with_prefetch_delay(mut self, delay: Duration) -> Self {
    self.prefetch_delay = delay;
    self
  }

  pub fn with_search_min_length(mut self, min_length: usize) -> Self {
    self.search_min_length = min_length;
    self
  }

  pub fn with_search_debounce(mut self, debounce: Duration) -> Self {
    self.search_debounce = debounce;
    self
  }

  pub fn with_retry(mut self, retry: RetryOptions) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
    self.tracker = tracker;
    self
  }
}

/// What to mark stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
  Key(QueryKey),
  All,
}

/// Paginated, invalidatable cache in front of a [`RecordSource`].
///
/// Cloning is cheap and clones share state. Every remote call runs through a
/// per-key [`OperationTracker`], so it is retried and observable.
pub struct PaginatedCache<T, S> {
  shared: Arc<Shared<T, S>>,
}

struct Shared<T, S> {
  source: S,
  config: CacheConfig,
  handler: Option<Arc<ErrorHandler>>,
  state: Mutex<State<T>>,
}

struct State<T> {
  entries: HashMap<QueryKey, Arc<CacheEntry<T>>>,
  /// Bumped per key on invalidate/reset.
  generations: HashMap<QueryKey, u64>,
  /// Bumped on `Invalidation::All`.
  epoch: u64,
  in_flight: HashMap<(QueryKey, usize), usize>,
  searches: HashMap<SearchKey, Arc<Vec<T>>>,
  search_tickets: HashMap<QueryKey, u64>,
  prefetch: HashMap<QueryKey, (u64, JoinHandle<()>)>,
  prefetch_seq: u64,
  trackers: HashMap<String, OperationTracker>,
}

impl<T> Default for State<T> {
  fn default() -> Self {
    Self {
      entries: HashMap::new(),
      generations: HashMap::new(),
      epoch: 0,
      in_flight: HashMap::new(),
      searches: HashMap::new(),
      search_tickets: HashMap::new(),
      prefetch: HashMap::new(),
      prefetch_seq: 0,
      trackers: HashMap::new(),
    }
  }
}

impl<T: Cacheable> State<T> {
  fn token(&self, key: &QueryKey) -> (u64, u64) {
    (self.epoch, self.generations.get(key).copied().unwrap_or(0))
  }

  /// Pages usable for appending. A stale entry counts as empty.
  fn fresh_count(&self, key: &QueryKey) -> usize {
    self
      .entries
      .get(key)
      .filter(|e| !e.is_stale())
      .map(|e| e.page_count())
      .unwrap_or(0)
  }

  fn is_in_flight(&self, key: &QueryKey, page_index: usize) -> bool {
    self.in_flight.contains_key(&(key.clone(), page_index))
  }

  fn enter(&mut self, slot: &(QueryKey, usize)) {
    *self.in_flight.entry(slot.clone()).or_insert(0) += 1;
  }

  fn leave(&mut self, slot: &(QueryKey, usize)) {
    if let Some(count) = self.in_flight.get_mut(slot) {
      *count -= 1;
      if *count == 0 {
        self.in_flight.remove(slot);
      }
    }
  }

  fn is_current_search(&self, key: &QueryKey, ticket: u64) -> bool {
    self.search_tickets.get(key).copied() == Some(ticket)
  }

  fn bump_generation(&mut self, key: &QueryKey) {
    *self.generations.entry(key.clone()).or_insert(0) += 1;
  }

  fn mark_stale(&mut self, key: &QueryKey) {
    if let Some(entry) = self.entries.get_mut(key) {
      if !entry.is_stale() {
        *entry = Arc::new(entry.marked_stale());
      }
    }
  }

  /// Append `page` if it extends the entry without a gap.
  fn commit(&mut self, key: &QueryKey, page_index: usize, page: CachePage<T>) {
    let next = match self.entries.get(key) {
      Some(entry) if !entry.is_stale() => {
        if entry.page_count() != page_index {
          debug!(key = %key.description(), page = page_index, "page already committed");
          return;
        }
        entry.with_page(page)
      }
      _ => {
        if page_index != 0 {
          return;
        }
        CacheEntry::first(page)
      }
    };

    debug!(
      key = %key.description(),
      entity = T::entity_type(),
      page = page_index,
      records = next.len(),
      "committed page"
    );
    self.entries.insert(key.clone(), Arc::new(next));
  }
}

/// Marks a page as in flight until released or dropped.
struct InFlight<'a, T> {
  state: &'a Mutex<State<T>>,
  slot: Option<(QueryKey, usize)>,
}

impl<'a, T: Cacheable> InFlight<'a, T> {
  fn release(&mut self, state: &mut State<T>) {
    if let Some(slot) = self.slot.take() {
      state.leave(&slot);
    }
  }
}

impl<T> Drop for InFlight<'_, T> {
  fn drop(&mut self) {
    if let Some(slot) = self.slot.take() {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      if let Some(count) = state.in_flight.get_mut(&slot) {
        *count -= 1;
        if *count == 0 {
          state.in_flight.remove(&slot);
        }
      }
    }
  }
}

impl<T, S> Clone for PaginatedCache<T, S> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<T: Cacheable, S: RecordSource<T>> PaginatedCache<T, S> {
  pub fn new(source: S, config: CacheConfig) -> Self {
    Self::build(source, config, None)
  }

  /// Cache whose trackers hand terminal errors to `handler`.
  pub fn with_error_handler(source: S, config: CacheConfig, handler: Arc<ErrorHandler>) -> Self {
    Self::build(source, config, Some(handler))
  }

  fn build(source: S, mut config: CacheConfig, handler: Option<Arc<ErrorHandler>>) -> Self {
    config.page_size = config.page_size.max(1);
    Self {
      shared: Arc::new(Shared {
        source,
        config,
        handler,
        state: Mutex::new(State::default()),
      }),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.shared.config
  }

  pub fn source(&self) -> &S {
    &self.shared.source
  }

  fn lock(&self) -> MutexGuard<'_, State<T>> {
    self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn tracker_for(&self, state: &mut State<T>, label: String) -> OperationTracker {
    state
      .trackers
      .entry(label)
      .or_insert_with(|| match &self.shared.handler {
        Some(handler) => {
          OperationTracker::with_error_handler(self.shared.config.tracker, handler.clone())
        }
        None => OperationTracker::new(self.shared.config.tracker),
      })
      .clone()
  }

  /// Fetch page `page_index` of `key`.
  ///
  /// The page is appended only when it directly follows the cached pages.
  /// Asking past the end of the cache is a gap and fails with a Validation
  /// error; asking for a page already cached (and fresh) returns it without
  /// a request. A stale entry counts as empty, and committing page 0 onto it
  /// replaces it.
  pub async fn fetch_page(
    &self,
    key: &QueryKey,
    page_index: usize,
  ) -> Result<CachePage<T>, StructuredError> {
    let page_size = self.shared.config.page_size;

    let (token, tracker, mut slot) = {
      let mut state = self.lock();
      let count = state.fresh_count(key);

      if page_index > count {
        return Err(gap_error(key, page_index, count));
      }
      if page_index < count {
        if let Some(page) = state.entries.get(key).and_then(|e| e.page(page_index)) {
          debug!(key = %key.description(), page = page_index, "cache hit");
          return Ok(page.clone());
        }
      }

      let slot = (key.clone(), page_index);
      state.enter(&slot);
      let tracker = self.tracker_for(&mut state, key.cache_hash());
      let guard = InFlight {
        state: &self.shared.state,
        slot: Some(slot),
      };
      (state.token(key), tracker, guard)
    };

    let request = PageRequest {
      key: key.clone(),
      offset: page_index * page_size,
      limit: page_size,
    };
    debug!(
      key = %key.description(),
      offset = request.offset,
      limit = request.limit,
      "fetching page"
    );

    let source = &self.shared.source;
    let req = &request;
    let result = tracker
      .execute(move || source.fetch_page(req), &self.shared.config.retry)
      .await;

    let mut state = self.lock();
    slot.release(&mut state);
    let page = CachePage::from_raw(result?, request.offset, request.limit);

    if state.token(key) != token {
      debug!(
        key = %key.description(),
        page = page_index,
        "discarding page fetched before invalidation"
      );
      return Ok(page);
    }

    state.commit(key, page_index, page.clone());
    Ok(page)
  }

  /// Fetch the page after the cached ones.
  ///
  /// Returns `Ok(None)` when the last cached page was short or that page is
  /// already being fetched.
  pub async fn fetch_next(&self, key: &QueryKey) -> Result<Option<CachePage<T>>, StructuredError> {
    let next = {
      let state = self.lock();
      let count = state.fresh_count(key);
      let exhausted = count > 0
        && state
          .entries
          .get(key)
          .map(|e| !e.has_more())
          .unwrap_or(false);

      if exhausted {
        return Ok(None);
      }
      if state.is_in_flight(key, count) {
        debug!(key = %key.description(), page = count, "page already in flight");
        return Ok(None);
      }
      count
    };

    self.fetch_page(key, next).await.map(Some)
  }

  /// Schedule `fetch_next` after the prefetch quiet period. Calling again
  /// before it fires restarts the wait. No-op when prefetch is disabled or
  /// there is no runtime.
  pub fn prefetch_next(&self, key: &QueryKey) {
    if !self.shared.config.prefetch_enabled {
      return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };

    let mut state = self.lock();
    state.prefetch_seq += 1;
    let ticket = state.prefetch_seq;

    let cache = self.clone();
    let target = key.clone();
    let delay = self.shared.config.prefetch_delay;

    let handle = runtime.spawn(async move {
      tokio::time::sleep(delay).await;

      {
        let mut state = cache.lock();
        let current = state.prefetch.get(&target).map(|(t, _)| *t) == Some(ticket);
        if !current {
          return;
        }
        state.prefetch.remove(&target);
      }

      match cache.fetch_next(&target).await {
        Ok(Some(page)) => debug!(
          key = %target.description(),
          offset = page.offset,
          records = page.records.len(),
          "prefetched page"
        ),
        Ok(None) => {}
        Err(e) => debug!(key = %target.description(), "prefetch failed: {}", e.message()),
      }
    });

    if let Some((_, previous)) = state.prefetch.insert(key.clone(), (ticket, handle)) {
      previous.abort();
    }
  }

  /// Debounced search within `key`.
  ///
  /// Terms shorter than `search_min_length` (after trimming) yield an empty
  /// result at once. Otherwise the call waits out the debounce; if a newer
  /// search for the same key arrived meanwhile this one returns `Ok(None)`.
  /// Results are kept in a partition of their own, never in the browse entry.
  pub async fn search(&self, key: &QueryKey, term: &str) -> Result<Option<Vec<T>>, StructuredError> {
    let term = term.trim();
    if term.chars().count() < self.shared.config.search_min_length {
      return Ok(Some(Vec::new()));
    }

    let search_key = SearchKey::new(key, term);
    let ticket = {
      let mut state = self.lock();
      let ticket = state.search_tickets.entry(key.clone()).or_insert(0);
      *ticket += 1;
      *ticket
    };

    tokio::time::sleep(self.shared.config.search_debounce).await;

    let (token, tracker) = {
      let mut state = self.lock();
      if !state.is_current_search(key, ticket) {
        return Ok(None);
      }
      if let Some(hit) = state.searches.get(&search_key) {
        debug!(key = %key.description(), term, "search cache hit");
        return Ok(Some(hit.as_ref().clone()));
      }
      let tracker = self.tracker_for(&mut state, SearchKey::tracker_label(key));
      (state.token(key), tracker)
    };

    let source = &self.shared.source;
    let limit = self.shared.config.page_size;
    let records = tracker
      .execute(
        move || source.search(key, term, limit),
        &self.shared.config.retry,
      )
      .await?;

    let mut state = self.lock();
    if !state.is_current_search(key, ticket) {
      return Ok(None);
    }
    if state.token(key) == token {
      debug!(
        partition = %search_key.label(),
        records = records.len(),
        "cached search results"
      );
      state.searches.insert(search_key, Arc::new(records.clone()));
    }
    Ok(Some(records))
  }

  /// Fetch records by id in one source call.
  pub async fn batch_get(&self, ids: &[String]) -> Result<Vec<T>, StructuredError> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let tracker = {
      let mut state = self.lock();
      self.tracker_for(&mut state, BATCH_LABEL.to_string())
    };
    let source = &self.shared.source;
    tracker
      .execute(move || source.batch_get(ids), &self.shared.config.retry)
      .await
  }

  /// Mark entries stale and drop their search partitions. Records stay
  /// readable until replaced. Fetches already in flight are not committed.
  pub fn invalidate(&self, target: &Invalidation) {
    let mut state = self.lock();
    match target {
      Invalidation::Key(key) => {
        state.bump_generation(key);
        state.mark_stale(key);
        state.searches.retain(|sk, _| &sk.key != key);
        debug!(key = %key.description(), "invalidated");
      }
      Invalidation::All => {
        state.epoch += 1;
        let keys: Vec<_> = state.entries.keys().cloned().collect();
        for key in &keys {
          state.mark_stale(key);
        }
        state.searches.clear();
        debug!(entries = keys.len(), "invalidated all");
      }
    }
  }

  /// Look up a record by id in the entry, then in the key's search results.
  pub fn get_by_id(&self, key: &QueryKey, id: &str) -> Option<T> {
    let state = self.lock();
    if let Some(found) = state.entries.get(key).and_then(|e| e.find(id)) {
      return Some(found.clone());
    }
    state
      .searches
      .iter()
      .filter(|(sk, _)| &sk.key == key)
      .flat_map(|(_, records)| records.iter())
      .find(|r| r.cache_key() == id)
      .cloned()
  }

  /// Look up a record by id anywhere in the cache.
  pub fn find_cached(&self, id: &str) -> Option<T> {
    let state = self.lock();
    let from_entries = state.entries.values().find_map(|e| e.find(id).cloned());
    from_entries.or_else(|| {
      state
        .searches
        .values()
        .flat_map(|records| records.iter())
        .find(|r| r.cache_key() == id)
        .cloned()
    })
  }

  /// Flattened records for `key`, stale ones included.
  pub fn records(&self, key: &QueryKey) -> Vec<T> {
    self
      .lock()
      .entries
      .get(key)
      .map(|e| e.flatten())
      .unwrap_or_default()
  }

  pub fn entry(&self, key: &QueryKey) -> Option<Arc<CacheEntry<T>>> {
    self.lock().entries.get(key).cloned()
  }

  /// Status of the latest page fetch for `key`.
  pub fn snapshot(&self, key: &QueryKey) -> OperationSnapshot {
    self
      .lock()
      .trackers
      .get(&key.cache_hash())
      .map(|t| t.snapshot())
      .unwrap_or_default()
  }

  /// The tracker page fetches for `key` run through, for subscribing.
  pub fn tracker(&self, key: &QueryKey) -> OperationTracker {
    let mut state = self.lock();
    self.tracker_for(&mut state, key.cache_hash())
  }

  /// Forget everything about `key`: records, searches, pending prefetch and
  /// tracker state. Results still in flight are ignored.
  pub fn reset(&self, key: &QueryKey) {
    let mut state = self.lock();
    state.entries.remove(key);
    state.bump_generation(key);
    state.searches.retain(|sk, _| &sk.key != key);
    *state.search_tickets.entry(key.clone()).or_insert(0) += 1;
    if let Some((_, handle)) = state.prefetch.remove(key) {
      handle.abort();
    }
    for label in [key.cache_hash(), SearchKey::tracker_label(key)] {
      if let Some(tracker) = state.trackers.get(&label) {
        tracker.reset();
      }
    }
    debug!(key = %key.description(), "reset");
  }
}

fn gap_error(key: &QueryKey, page_index: usize, count: usize) -> StructuredError {
  StructuredError::new(
    ErrorKind::Validation,
    Severity::Medium,
    format!(
      "cannot fetch page {} of {}: only {} page(s) cached",
      page_index,
      key.description(),
      count
    ),
    false,
  )
  .with_details(json!({ "page_index": page_index, "cached_pages": count }))
}

impl<T, S> std::fmt::Debug for PaginatedCache<T, S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PaginatedCache")
      .field("config", &self.shared.config)
      .finish_non_exhaustive()
  }
}
