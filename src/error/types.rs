//! The classified error record and its taxonomy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Error taxonomy. Every failure lands in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Network,
  Validation,
  Authentication,
  Authorization,
  NotFound,
  Server,
  Client,
  Timeout,
  Unknown,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Network => "network",
      ErrorKind::Validation => "validation",
      ErrorKind::Authentication => "authentication",
      ErrorKind::Authorization => "authorization",
      ErrorKind::NotFound => "not_found",
      ErrorKind::Server => "server",
      ErrorKind::Client => "client",
      ErrorKind::Timeout => "timeout",
      ErrorKind::Unknown => "unknown",
    }
  }

  /// Kinds whose failures are expected to clear up on their own.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      ErrorKind::Network | ErrorKind::Server | ErrorKind::Timeout
    )
  }

  /// Fallback human-facing message when nothing more specific is known.
  pub fn default_user_message(&self) -> &'static str {
    match self {
      ErrorKind::Network => "Unable to reach the server. Check your connection and try again.",
      ErrorKind::Validation => "Some of the submitted data is invalid.",
      ErrorKind::Authentication => "Your session is not authenticated. Please sign in again.",
      ErrorKind::Authorization => "You do not have permission to perform this action.",
      ErrorKind::NotFound => "The requested item could not be found.",
      ErrorKind::Server => "The server encountered an error. Please try again later.",
      ErrorKind::Client => "Something went wrong while processing the request.",
      ErrorKind::Timeout => "The request took too long to complete.",
      ErrorKind::Unknown => "An unexpected error occurred.",
    }
  }

  /// Remediation hints shown next to the user message.
  pub fn default_suggestions(&self) -> &'static [&'static str] {
    match self {
      ErrorKind::Network => &[
        "Check your network connection",
        "Verify the server address is correct",
        "Try again in a few moments",
      ],
      ErrorKind::Validation => &[
        "Review the highlighted fields",
        "Make sure required values are filled in",
      ],
      ErrorKind::Authentication => &["Sign in again", "Check that your credentials are valid"],
      ErrorKind::Authorization => &[
        "Ask an administrator for access",
        "Confirm you are using the right account",
      ],
      ErrorKind::NotFound => &[
        "Refresh the list to see current data",
        "The item may have been deleted",
      ],
      ErrorKind::Server => &[
        "Try again in a few moments",
        "Contact support if the problem persists",
      ],
      ErrorKind::Client => &["Reload and try again"],
      ErrorKind::Timeout => &[
        "Try again",
        "Narrow the query to return fewer results",
      ],
      ErrorKind::Unknown => &["Try again", "Contact support if the problem persists"],
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

/// Status identifier attached to an error, usually a transport status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorCode {
  Status(u16),
  Text(String),
}

impl ErrorCode {
  pub fn status(&self) -> Option<u16> {
    match self {
      ErrorCode::Status(code) => Some(*code),
      ErrorCode::Text(_) => None,
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ErrorCode::Status(code) => write!(f, "{}", code),
      ErrorCode::Text(text) => f.write_str(text),
    }
  }
}

/// A classified failure.
///
/// Built once by the classifier and never modified afterwards; the
/// `with_*` methods consume `self` and are only meant for construction.
/// `retryable` is fixed at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct StructuredError {
  kind: ErrorKind,
  severity: Severity,
  message: String,
  user_message: String,
  code: Option<ErrorCode>,
  retryable: bool,
  timestamp: DateTime<Utc>,
  suggestions: Vec<String>,
  details: Option<Value>,
}

impl StructuredError {
  /// Create an error with the kind's default user message and suggestions.
  pub fn new(
    kind: ErrorKind,
    severity: Severity,
    message: impl Into<String>,
    retryable: bool,
  ) -> Self {
    Self {
      kind,
      severity,
      message: message.into(),
      user_message: kind.default_user_message().to_string(),
      code: None,
      retryable,
      timestamp: Utc::now(),
      suggestions: kind
        .default_suggestions()
        .iter()
        .map(|s| s.to_string())
        .collect(),
      details: None,
    }
  }

  pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
    self.user_message = user_message.into();
    self
  }

  pub fn with_code(mut self, code: ErrorCode) -> Self {
    self.code = Some(code);
    self
  }

  pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.suggestions = suggestions.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_details(mut self, details: Value) -> Self {
    self.details = Some(details);
    self
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  pub fn severity(&self) -> Severity {
    self.severity
  }

  /// Raw diagnostic text. Not meant for end users.
  pub fn message(&self) -> &str {
    &self.message
  }

  pub fn user_message(&self) -> &str {
    &self.user_message
  }

  pub fn code(&self) -> Option<&ErrorCode> {
    self.code.as_ref()
  }

  pub fn retryable(&self) -> bool {
    self.retryable
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }

  pub fn suggestions(&self) -> &[String] {
    &self.suggestions
  }

  pub fn details(&self) -> Option<&Value> {
    self.details.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_uses_kind_defaults() {
    let error = StructuredError::new(ErrorKind::NotFound, Severity::Medium, "missing", false);

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(error.user_message(), ErrorKind::NotFound.default_user_message());
    assert_eq!(
      error.suggestions().len(),
      ErrorKind::NotFound.default_suggestions().len()
    );
    assert!(error.code().is_none());
    assert!(error.details().is_none());
  }

  #[test]
  fn test_display_is_raw_message() {
    let error = StructuredError::new(ErrorKind::Server, Severity::High, "boom: 500", true);
    assert_eq!(error.to_string(), "boom: 500");
  }

  #[test]
  fn test_severity_ordering() {
    assert!(Severity::Critical > Severity::High);
    assert!(Severity::High > Severity::Medium);
    assert!(Severity::Medium > Severity::Low);
  }

  #[test]
  fn test_error_code_status() {
    assert_eq!(ErrorCode::Status(404).status(), Some(404));
    assert_eq!(ErrorCode::Text("E_FAIL".into()).status(), None);
    assert_eq!(ErrorCode::Status(503).to_string(), "503");
  }

  #[test]
  fn test_serializes_kind_snake_case() {
    let error = StructuredError::new(ErrorKind::NotFound, Severity::Medium, "x", false)
      .with_code(ErrorCode::Status(404));
    let json = serde_json::to_value(&error).unwrap();

    assert_eq!(json["kind"], "not_found");
    assert_eq!(json["severity"], "medium");
    assert_eq!(json["code"], 404);
  }
}
