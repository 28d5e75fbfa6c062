//! Resilient, cached access to paginated record APIs.
//!
//! Failures are classified into [`error::StructuredError`]s, retried under a
//! per-kind [`retry::RetryPolicy`], tracked through observable
//! [`operation::OperationTracker`]s and cached page by page in a
//! [`cache::PaginatedCache`]. The [`history`] module wires all of it to the
//! instance history HTTP API.

pub mod cache;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod operation;
pub mod retry;

pub use cache::{Invalidation, PaginatedCache, QueryKey, RecordSource};
pub use error::{ErrorHandler, ErrorKind, RawFailure, Severity, StructuredError};
pub use operation::{OperationSnapshot, OperationState, OperationTracker};
pub use retry::{with_retry, RetryOptions, RetryPolicy};
