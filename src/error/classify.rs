//! Classification of raw failures into [`StructuredError`]s.
//!
//! `classify` is total: every [`RawFailure`] yields an error, falling back to
//! `Unknown`/`Medium`. The variant order of `RawFailure` mirrors the
//! precedence used when the input is untyped JSON.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use super::raw::{DomainError, RawFailure};
use super::types::{ErrorCode, ErrorKind, Severity, StructuredError};

/// Anything that can be turned into a [`StructuredError`].
///
/// The retry engine accepts operations failing with any `Classify` type.
pub trait Classify {
  fn classify(self) -> StructuredError;
}

impl Classify for RawFailure {
  fn classify(self) -> StructuredError {
    classify(&self)
  }
}

impl Classify for StructuredError {
  fn classify(self) -> StructuredError {
    self
  }
}

impl Classify for reqwest::Error {
  fn classify(self) -> StructuredError {
    classify(&RawFailure::from(self))
  }
}

impl Classify for Value {
  fn classify(self) -> StructuredError {
    classify(&RawFailure::from_value(&self))
  }
}

impl Classify for String {
  fn classify(self) -> StructuredError {
    classify(&RawFailure::Text(self))
  }
}

/// Classify a raw failure. Pure; never fails.
pub fn classify(raw: &RawFailure) -> StructuredError {
  match raw {
    RawFailure::Transport {
      message,
      status: None,
      ..
    } => classify_network(message),
    RawFailure::Transport {
      message,
      status: Some(status),
      body,
    } => classify_status(*status, message, body.as_ref()),
    RawFailure::Domain(domain) => classify_domain(domain),
    RawFailure::Validation { message, field } => {
      let error = StructuredError::new(ErrorKind::Validation, Severity::Medium, message, false)
        .with_user_message(message.clone());
      match field {
        Some(field) => error.with_details(json!({ "field": field })),
        None => error,
      }
    }
    RawFailure::Runtime { message, trace } => {
      let error = StructuredError::new(ErrorKind::Client, Severity::Medium, message, true);
      match trace {
        Some(trace) => error.with_details(json!({ "stack": trace })),
        None => error,
      }
    }
    RawFailure::Text(text) if text.trim().is_empty() => StructuredError::new(
      ErrorKind::Unknown,
      Severity::Medium,
      "Empty error message",
      false,
    ),
    RawFailure::Text(text) => {
      StructuredError::new(ErrorKind::Unknown, Severity::Medium, text, false)
        .with_user_message(text.clone())
    }
    RawFailure::Opaque(value) => {
      let error = StructuredError::new(
        ErrorKind::Unknown,
        Severity::Medium,
        "Unrecognized failure value",
        true,
      );
      if value.is_null() {
        error
      } else {
        error.with_details(value.clone())
      }
    }
  }
}

/// Known transport diagnostics that deserve a more specific explanation.
struct NetworkPattern {
  regex: Regex,
  user_message: &'static str,
  suggestions: &'static [&'static str],
}

impl NetworkPattern {
  fn new(
    pattern: &str,
    user_message: &'static str,
    suggestions: &'static [&'static str],
  ) -> Self {
    Self {
      regex: Regex::new(pattern).expect("Invalid regex pattern"),
      user_message,
      suggestions,
    }
  }
}

fn network_patterns() -> &'static [NetworkPattern] {
  static PATTERNS: OnceLock<Vec<NetworkPattern>> = OnceLock::new();
  PATTERNS.get_or_init(|| {
    vec![
      NetworkPattern::new(
        r"(?i)econnrefused|connection\s+refused",
        "The server refused the connection. It may be down or restarting.",
        &[
          "Check that the server is running",
          "Verify the configured server address and port",
          "Try again in a few moments",
        ],
      ),
      NetworkPattern::new(
        r"(?i)enotfound|getaddrinfo|\bdns\b|name\s+resolution|failed\s+to\s+lookup\s+address",
        "The server address could not be resolved.",
        &[
          "Check the server hostname for typos",
          "Verify your DNS settings or network connection",
        ],
      ),
      NetworkPattern::new(
        r"(?i)certificate|\btls\b|\bssl\b|handshake",
        "A secure connection to the server could not be established.",
        &[
          "Check that the server certificate is valid",
          "Verify the system clock is correct",
          "Contact your administrator about the TLS configuration",
        ],
      ),
      NetworkPattern::new(
        r"(?i)timed?\s*out|timeout|econnaborted|etimedout",
        "The server did not respond in time.",
        &[
          "Try again in a few moments",
          "Check your network connection",
          "Narrow the query to return fewer results",
        ],
      ),
    ]
  })
}

fn classify_network(message: &str) -> StructuredError {
  let error = StructuredError::new(ErrorKind::Network, Severity::High, message, true);

  match network_patterns().iter().find(|p| p.regex.is_match(message)) {
    Some(pattern) => error
      .with_user_message(pattern.user_message)
      .with_suggestions(pattern.suggestions.iter().copied()),
    None => error,
  }
}

/// Status code table. `None` for codes without a dedicated entry.
fn status_entry(status: u16) -> Option<(ErrorKind, Severity, bool)> {
  match status {
    400 | 422 => Some((ErrorKind::Validation, Severity::Medium, false)),
    401 => Some((ErrorKind::Authentication, Severity::High, false)),
    403 => Some((ErrorKind::Authorization, Severity::High, false)),
    404 => Some((ErrorKind::NotFound, Severity::Medium, false)),
    408 => Some((ErrorKind::Timeout, Severity::Medium, true)),
    429 => Some((ErrorKind::Client, Severity::Medium, true)),
    500..=599 => Some((ErrorKind::Server, Severity::High, true)),
    _ => None,
  }
}

/// Pull a human-readable message out of a response body.
///
/// Understands `{"detail": "..."}` and `{"error": {"message": "..."}}`.
fn body_message(body: &Value) -> Option<String> {
  if let Some(detail) = body.get("detail").and_then(Value::as_str) {
    return Some(detail.to_string());
  }
  if let Some(message) = body
    .get("error")
    .and_then(|e| e.get("message"))
    .and_then(Value::as_str)
  {
    return Some(message.to_string());
  }
  body.get("message").and_then(Value::as_str).map(String::from)
}

fn classify_status(status: u16, message: &str, body: Option<&Value>) -> StructuredError {
  let (kind, severity, retryable) =
    status_entry(status).unwrap_or((ErrorKind::Server, Severity::Medium, status >= 500));

  let server_message = body.and_then(body_message);
  let message = match &server_message {
    Some(detail) => format!("{}: {}", message, detail),
    None => message.to_string(),
  };

  let mut error =
    StructuredError::new(kind, severity, message, retryable).with_code(ErrorCode::Status(status));

  if status == 429 {
    error = error
      .with_user_message("Too many requests. Please wait a moment and try again.")
      .with_suggestions(["Wait a few seconds before retrying"]);
  } else if kind == ErrorKind::Validation {
    if let Some(detail) = server_message {
      error = error.with_user_message(detail);
    }
  }

  match body {
    Some(body) if !body.is_null() => error.with_details(body.clone()),
    _ => error,
  }
}

/// Map a backend error discriminator (usually an exception class name).
fn discriminator_kind(discriminator: &str) -> Option<ErrorKind> {
  let lower = discriminator.to_lowercase();
  if lower.contains("notfound") || lower.contains("not_found") {
    Some(ErrorKind::NotFound)
  } else if lower.contains("validation") || lower.contains("conflict") {
    Some(ErrorKind::Validation)
  } else if lower.contains("forbidden") || lower.contains("permission") {
    Some(ErrorKind::Authorization)
  } else if lower.contains("unauthorized") || lower.contains("auth") {
    Some(ErrorKind::Authentication)
  } else if lower.contains("timeout") {
    Some(ErrorKind::Timeout)
  } else if lower.contains("operation") || lower.contains("internalserver") {
    Some(ErrorKind::Server)
  } else {
    None
  }
}

fn classify_domain(domain: &DomainError) -> StructuredError {
  let kind = discriminator_kind(&domain.error)
    .or_else(|| domain.status.and_then(status_entry).map(|(kind, _, _)| kind))
    .unwrap_or(ErrorKind::Unknown);

  let mut error = StructuredError::new(
    kind,
    Severity::Medium,
    format!("{}: {}", domain.error, domain.message),
    kind.is_transient(),
  )
  .with_user_message(domain.message.clone());

  if let Some(status) = domain.status {
    error = error.with_code(ErrorCode::Status(status));
  } else {
    error = error.with_code(ErrorCode::Text(domain.error.clone()));
  }

  match &domain.details {
    Some(details) => error.with_details(details.clone()),
    None => error,
  }
}
