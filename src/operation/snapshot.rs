use serde::Serialize;

use crate::error::StructuredError;

/// Lifecycle state of a tracked operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
  /// Not started, or reset
  #[default]
  Idle,
  /// An attempt is in flight
  Loading,
  /// Waiting out the backoff delay before the next attempt
  Retrying,
  /// Completed successfully
  Success,
  /// Failed for good
  Error,
  /// Abandoned by the owner after the deadline passed
  Timeout,
}

impl OperationState {
  /// In flight, including backoff waits.
  pub fn is_loading(&self) -> bool {
    matches!(self, OperationState::Loading | OperationState::Retrying)
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      OperationState::Success | OperationState::Error | OperationState::Timeout
    )
  }
}

/// Point-in-time view of an operation, cloned out for observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationSnapshot {
  pub state: OperationState,
  /// Attempts made in the current logical operation (1 for the first).
  pub attempt: u32,
  pub elapsed_ms: u64,
  /// Advisory: the deadline passed while still in flight.
  pub is_timed_out: bool,
  pub last_error: Option<StructuredError>,
  /// Caller-reported progress, 0 to 100.
  pub progress: f64,
}

impl OperationSnapshot {
  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state == OperationState::Success
  }

  pub fn is_error(&self) -> bool {
    self.state == OperationState::Error
  }

  pub fn error(&self) -> Option<&StructuredError> {
    self.last_error.as_ref()
  }
}
