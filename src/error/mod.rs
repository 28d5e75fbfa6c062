//! Error classification and reporting.
//!
//! Raw failures ([`RawFailure`]) are turned into [`StructuredError`]s by
//! [`classify`]. The [`ErrorHandler`] decides which of them get escalated.

mod classify;
mod raw;
mod report;
mod types;

pub use classify::{classify, Classify};
pub use raw::{DomainError, RawFailure};
pub use report::{should_report, ErrorHandler, ErrorReporter, TracingReporter};
pub use types::{ErrorCode, ErrorKind, Severity, StructuredError};
