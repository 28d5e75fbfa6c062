//! Error reporting policy and the injectable error handler.

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, error};

use super::classify::Classify;
use super::types::{ErrorKind, Severity, StructuredError};

/// Default number of errors kept for diagnostic views.
const DEFAULT_RECENT_CAPACITY: usize = 50;

/// Destination for errors that need escalation (an external monitor, a log
/// sink, ...).
pub trait ErrorReporter: Send + Sync {
  fn report(&self, error: &StructuredError);
}

/// Reporter that writes escalated errors to the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
  fn report(&self, err: &StructuredError) {
    error!(
      kind = %err.kind(),
      severity = ?err.severity(),
      code = ?err.code(),
      retryable = err.retryable(),
      "{}",
      err.message()
    );
  }
}

/// Whether an error should be escalated to the reporter.
///
/// Critical/High severity always are, as are server and access-control
/// failures regardless of severity.
pub fn should_report(error: &StructuredError) -> bool {
  matches!(error.severity(), Severity::Critical | Severity::High)
    || matches!(
      error.kind(),
      ErrorKind::Server | ErrorKind::Authentication | ErrorKind::Authorization
    )
}

/// Classifies, logs and escalates errors.
///
/// Construct one per application (or per test) and share it via `Arc`;
/// there is no global instance.
pub struct ErrorHandler {
  reporter: Box<dyn ErrorReporter>,
  recent: Mutex<VecDeque<StructuredError>>,
  capacity: usize,
}

impl Default for ErrorHandler {
  fn default() -> Self {
    Self::new(TracingReporter)
  }
}

impl ErrorHandler {
  pub fn new(reporter: impl ErrorReporter + 'static) -> Self {
    Self {
      reporter: Box::new(reporter),
      recent: Mutex::new(VecDeque::with_capacity(DEFAULT_RECENT_CAPACITY)),
      capacity: DEFAULT_RECENT_CAPACITY,
    }
  }

  /// Set how many recent errors are retained.
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  /// Classify a raw failure and record it.
  pub fn handle(&self, raw: impl Classify) -> StructuredError {
    let error = raw.classify();
    self.record(&error);
    error
  }

  /// Record an already-classified error. Escalated errors are left to the
  /// reporter; the rest are logged here.
  pub fn record(&self, err: &StructuredError) {
    let escalate = should_report(err);
    if !escalate {
      debug!(kind = %err.kind(), severity = ?err.severity(), "{}", err.message());
    }

    {
      let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
      if self.capacity > 0 {
        while recent.len() >= self.capacity {
          recent.pop_front();
        }
        recent.push_back(err.clone());
      }
    }

    if escalate {
      self.reporter.report(err);
    }
  }

  /// Recently recorded errors, oldest first.
  pub fn recent(&self) -> Vec<StructuredError> {
    let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
    recent.iter().cloned().collect()
  }

  pub fn clear(&self) {
    let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
    recent.clear();
  }
}

impl std::fmt::Debug for ErrorHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ErrorHandler")
      .field("capacity", &self.capacity)
      .finish_non_exhaustive()
  }
}
