//! Unclassified failure values as they arrive from the transport boundary.

use serde_json::{Map, Value};

/// A failure before classification.
///
/// Typed callers construct a variant directly. Untyped payloads (JSON error
/// objects handed over by a transport) go through [`RawFailure::from_value`],
/// which picks the variant with an ordered chain of predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFailure {
  /// Transport-level failure. `status` is `None` when no response arrived.
  Transport {
    message: String,
    status: Option<u16>,
    body: Option<Value>,
  },
  /// An error the backend already structured for us.
  Domain(DomainError),
  /// A named validation failure raised before anything was sent.
  Validation {
    message: String,
    field: Option<String>,
  },
  /// A generic fault in client logic.
  Runtime {
    message: String,
    trace: Option<String>,
  },
  /// A bare string.
  Text(String),
  /// Anything else, including `null`.
  Opaque(Value),
}

/// Backend error payload: `{ "error": "...", "message": "...", ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainError {
  pub error: String,
  pub message: String,
  pub status: Option<u16>,
  pub details: Option<Value>,
}

impl RawFailure {
  /// Transport failure with no response (connection refused, DNS, ...).
  pub fn transport(message: impl Into<String>) -> Self {
    RawFailure::Transport {
      message: message.into(),
      status: None,
      body: None,
    }
  }

  /// Transport failure carrying a response status and optional JSON body.
  pub fn http_status(status: u16, body: Option<Value>) -> Self {
    RawFailure::Transport {
      message: format!("Request failed with status code {}", status),
      status: Some(status),
      body,
    }
  }

  pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
    RawFailure::Validation {
      message: message.into(),
      field: field.map(String::from),
    }
  }

  pub fn runtime(message: impl Into<String>) -> Self {
    RawFailure::Runtime {
      message: message.into(),
      trace: None,
    }
  }

  /// HTTP status the failure came with, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      RawFailure::Transport { status, .. } => *status,
      RawFailure::Domain(domain) => domain.status,
      _ => None,
    }
  }

  /// Turn an untyped JSON failure into a variant. First matching predicate wins.
  pub fn from_value(value: &Value) -> Self {
    if let Value::String(text) = value {
      return RawFailure::Text(text.clone());
    }

    let Some(obj) = value.as_object() else {
      return RawFailure::Opaque(value.clone());
    };

    as_transport(obj)
      .or_else(|| as_domain(obj))
      .or_else(|| as_validation(obj))
      .or_else(|| as_runtime(obj))
      .unwrap_or_else(|| RawFailure::Opaque(value.clone()))
  }
}

fn str_field<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
  obj.get(name).and_then(Value::as_str)
}

fn status_field(obj: &Map<String, Value>, name: &str) -> Option<u16> {
  obj
    .get(name)
    .and_then(Value::as_u64)
    .and_then(|s| u16::try_from(s).ok())
}

fn as_transport(obj: &Map<String, Value>) -> Option<RawFailure> {
  let flagged = obj.get("isAxiosError").and_then(Value::as_bool) == Some(true);
  let response = obj.get("response").and_then(Value::as_object);

  if !flagged && response.is_none() {
    return None;
  }

  let status = response.and_then(|r| status_field(r, "status"));
  let body = response.and_then(|r| r.get("data")).cloned();
  let message = str_field(obj, "message")
    .map(String::from)
    .or_else(|| status.map(|s| format!("Request failed with status code {}", s)))
    .unwrap_or_else(|| "Network request failed".to_string());

  Some(RawFailure::Transport {
    message,
    status,
    body,
  })
}

fn as_domain(obj: &Map<String, Value>) -> Option<RawFailure> {
  // Flat shape: { error, message, status?, details? }
  if let (Some(error), Some(message)) = (str_field(obj, "error"), str_field(obj, "message")) {
    return Some(RawFailure::Domain(DomainError {
      error: error.to_string(),
      message: message.to_string(),
      status: status_field(obj, "status").or_else(|| status_field(obj, "status_code")),
      details: obj.get("details").filter(|d| !d.is_null()).cloned(),
    }));
  }

  // Envelope shape: { error: { type, message, details?, status_code? } }
  let inner = obj.get("error").and_then(Value::as_object)?;
  let error = str_field(inner, "type")?;
  let message = str_field(inner, "message")?;

  Some(RawFailure::Domain(DomainError {
    error: error.to_string(),
    message: message.to_string(),
    status: status_field(inner, "status_code").or_else(|| status_field(obj, "status")),
    details: inner.get("details").filter(|d| !d.is_null()).cloned(),
  }))
}

fn as_validation(obj: &Map<String, Value>) -> Option<RawFailure> {
  if str_field(obj, "name") != Some("ValidationError") {
    return None;
  }

  Some(RawFailure::Validation {
    message: str_field(obj, "message")
      .unwrap_or("Validation failed")
      .to_string(),
    field: str_field(obj, "field").map(String::from),
  })
}

fn as_runtime(obj: &Map<String, Value>) -> Option<RawFailure> {
  let message = str_field(obj, "message");
  let trace = str_field(obj, "stack");

  if message.is_none() && trace.is_none() {
    return None;
  }

  Some(RawFailure::Runtime {
    message: message.unwrap_or("Unexpected error").to_string(),
    trace: trace.map(String::from),
  })
}

impl From<&Value> for RawFailure {
  fn from(value: &Value) -> Self {
    RawFailure::from_value(value)
  }
}

impl From<Value> for RawFailure {
  fn from(value: Value) -> Self {
    RawFailure::from_value(&value)
  }
}

impl From<String> for RawFailure {
  fn from(text: String) -> Self {
    RawFailure::Text(text)
  }
}

impl From<&str> for RawFailure {
  fn from(text: &str) -> Self {
    RawFailure::Text(text.to_string())
  }
}

impl From<reqwest::Error> for RawFailure {
  fn from(err: reqwest::Error) -> Self {
    // Walk the source chain so the low-level cause ("Connection refused",
    // "operation timed out", ...) is visible to the message patterns.
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
      message.push_str(": ");
      message.push_str(&cause.to_string());
      source = cause.source();
    }
    if err.is_timeout() && !message.to_lowercase().contains("timed out") {
      message.push_str(": request timed out");
    }

    RawFailure::Transport {
      message,
      status: err.status().map(|s| s.as_u16()),
      body: None,
    }
  }
}
