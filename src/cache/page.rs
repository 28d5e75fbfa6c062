use chrono::{DateTime, Utc};

use super::traits::{Cacheable, RawPage};

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePage<T> {
  pub records: Vec<T>,
  pub total_count: usize,
  pub limit: usize,
  pub offset: usize,
  /// A full page came back, so more may follow.
  pub has_more: bool,
}

impl<T> CachePage<T> {
  pub(crate) fn from_raw(raw: RawPage<T>, offset: usize, limit: usize) -> Self {
    let has_more = raw.records.len() == limit;
    let total_count = raw.total_count.unwrap_or(offset + raw.records.len());
    Self {
      records: raw.records,
      total_count,
      limit,
      offset,
      has_more,
    }
  }
}

/// Stored result set for one key: a gapless prefix of pages.
///
/// Entries are never changed in place; each update builds a new one.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pages: Vec<CachePage<T>>,
  stale: bool,
  fetched_at: DateTime<Utc>,
}

impl<T: Clone> CacheEntry<T> {
  pub(crate) fn first(page: CachePage<T>) -> Self {
    Self {
      pages: vec![page],
      stale: false,
      fetched_at: Utc::now(),
    }
  }

  pub(crate) fn with_page(&self, page: CachePage<T>) -> Self {
    let mut pages = self.pages.clone();
    pages.push(page);
    Self {
      pages,
      stale: false,
      fetched_at: Utc::now(),
    }
  }

  pub(crate) fn marked_stale(&self) -> Self {
    Self {
      stale: true,
      ..self.clone()
    }
  }

  pub fn pages(&self) -> &[CachePage<T>] {
    &self.pages
  }

  pub fn page(&self, index: usize) -> Option<&CachePage<T>> {
    self.pages.get(index)
  }

  pub fn page_count(&self) -> usize {
    self.pages.len()
  }

  pub fn is_stale(&self) -> bool {
    self.stale
  }

  pub fn fetched_at(&self) -> DateTime<Utc> {
    self.fetched_at
  }

  /// Whether the last page was full.
  pub fn has_more(&self) -> bool {
    self.pages.last().map(|p| p.has_more).unwrap_or(true)
  }

  pub fn total_count(&self) -> Option<usize> {
    self.pages.last().map(|p| p.total_count)
  }

  pub fn len(&self) -> usize {
    self.pages.iter().map(|p| p.records.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// All records in page order.
  pub fn flatten(&self) -> Vec<T> {
    self
      .pages
      .iter()
      .flat_map(|p| p.records.iter().cloned())
      .collect()
  }
}

impl<T: Cacheable> CacheEntry<T> {
  pub fn find(&self, id: &str) -> Option<&T> {
    self
      .pages
      .iter()
      .flat_map(|p| p.records.iter())
      .find(|r| r.cache_key() == id)
  }
}
