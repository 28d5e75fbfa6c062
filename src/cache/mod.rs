//! Generic paginated caching layer.
//!
//! This module provides a source-agnostic caching mechanism that:
//! - Keeps each query's results as an ordered, gapless list of pages
//! - Retries and tracks every remote call
//! - Prefetches the next page and debounces searches
//! - Marks entries stale on invalidation while keeping them readable

mod key;
mod layer;
mod page;
mod traits;

pub use key::{QueryKey, SearchKey, SEARCH_PARTITION};
pub use layer::{
  CacheConfig, Invalidation, PaginatedCache, DEFAULT_PAGE_SIZE, DEFAULT_PREFETCH_DELAY,
  DEFAULT_SEARCH_DEBOUNCE, DEFAULT_SEARCH_MIN_LENGTH,
};
pub use page::{CacheEntry, CachePage};
pub use traits::{Cacheable, PageRequest, RawPage, RecordSource};
