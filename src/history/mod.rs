//! Instance history: record types, the HTTP source and the cached client.

mod api_types;
mod cached_client;
mod client;
mod types;

pub use api_types::HistoryListResponse;
pub use cached_client::CachedHistoryClient;
pub use client::HttpHistorySource;
pub use types::{HistoryQuery, HistoryRecord, OperationType, HISTORY_RESOURCE};
