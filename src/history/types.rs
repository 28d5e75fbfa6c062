use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::cache::{Cacheable, QueryKey};
use crate::error::{classify, RawFailure, StructuredError};

/// Resource name of history query keys.
pub const HISTORY_RESOURCE: &str = "instance-history";

/// What happened to the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
  Create,
  Update,
  Delete,
  Rollback,
}

impl OperationType {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationType::Create => "create",
      OperationType::Update => "update",
      OperationType::Delete => "delete",
      OperationType::Rollback => "rollback",
    }
  }
}

impl std::fmt::Display for OperationType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for OperationType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "create" => Ok(OperationType::Create),
      "update" => Ok(OperationType::Update),
      "delete" => Ok(OperationType::Delete),
      "rollback" => Ok(OperationType::Rollback),
      other => Err(format!(
        "unknown operation type {:?} (expected create, update, delete or rollback)",
        other
      )),
    }
  }
}

/// Snapshot of an inference instance taken when it was changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub history_id: u64,
  pub original_id: u64,
  pub operation_type: OperationType,
  /// ISO 8601, with or without offset
  pub operation_timestamp: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub model_name: String,
  pub model_version: Option<String>,
  #[serde(default)]
  pub cluster_name: String,
  #[serde(default)]
  pub image_tag: String,
  pub status: Option<String>,
  #[serde(alias = "desc")]
  pub description: Option<String>,
  pub replicas: Option<u32>,
  // Remaining instance fields (pipeline, resources, env, ...)
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

impl HistoryRecord {
  /// Parsed `operation_timestamp`. Offset-less values are taken as UTC.
  pub fn timestamp(&self) -> Option<DateTime<Utc>> {
    let raw = self.operation_timestamp.as_str();
    DateTime::parse_from_rfc3339(raw)
      .map(|t| t.with_timezone(&Utc))
      .ok()
      .or_else(|| {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
          .ok()
          .map(|t| t.and_utc())
      })
  }
}

impl Cacheable for HistoryRecord {
  fn cache_key(&self) -> String {
    self.history_id.to_string()
  }

  fn entity_type() -> &'static str {
    "history_record"
  }
}

/// Filters for a history listing.
///
/// With `instance_id` set the listing is scoped to one instance; otherwise it
/// spans all instances and `original_id` may narrow it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
  pub instance_id: Option<u64>,
  pub operation_type: Option<OperationType>,
  pub start_date: Option<DateTime<Utc>>,
  pub end_date: Option<DateTime<Utc>>,
  pub original_id: Option<u64>,
}

impl HistoryQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn for_instance(instance_id: u64) -> Self {
    Self {
      instance_id: Some(instance_id),
      ..Self::default()
    }
  }

  pub fn operation(mut self, operation_type: OperationType) -> Self {
    self.operation_type = Some(operation_type);
    self
  }

  pub fn since(mut self, start: DateTime<Utc>) -> Self {
    self.start_date = Some(start);
    self
  }

  pub fn until(mut self, end: DateTime<Utc>) -> Self {
    self.end_date = Some(end);
    self
  }

  pub fn original(mut self, original_id: u64) -> Self {
    self.original_id = Some(original_id);
    self
  }

  /// Reject ranges the server would refuse.
  pub fn validate(&self) -> Result<(), StructuredError> {
    if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
      if end <= start {
        return Err(classify(&RawFailure::validation(
          "end_date must be after start_date",
          Some("end_date"),
        )));
      }
    }
    Ok(())
  }

  /// Cache identity. Filter names double as request parameter names.
  pub fn into_key(&self) -> QueryKey {
    let mut key = QueryKey::new(HISTORY_RESOURCE);
    if let Some(id) = self.instance_id {
      key = key.with_parent(id.to_string());
    }
    if let Some(op) = self.operation_type {
      key = key.with_filter("operation_type", op.as_str());
    }
    if let Some(start) = self.start_date {
      key = key.with_filter("start_date", start.to_rfc3339());
    }
    if let Some(end) = self.end_date {
      key = key.with_filter("end_date", end.to_rfc3339());
    }
    if let Some(original) = self.original_id {
      key = key.with_filter("original_id", original.to_string());
    }
    key
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use chrono::TimeZone;
  use serde_json::json;

  #[test]
  fn test_record_deserialize() {
    let record: HistoryRecord = serde_json::from_value(json!({
      "history_id": 12,
      "original_id": 3,
      "operation_type": "rollback",
      "operation_timestamp": "2024-05-01T10:20:30",
      "name": "sdxl-prod",
      "model_name": "sdxl",
      "cluster_name": "gpu-a",
      "image_tag": "v1.2",
      "desc": "rolled back",
      "replicas": 2,
      "pp": 1,
      "envs": {"A": "1"}
    }))
    .unwrap();

    assert_eq!(record.operation_type, OperationType::Rollback);
    assert_eq!(record.description.as_deref(), Some("rolled back"));
    assert_eq!(record.replicas, Some(2));
    assert_eq!(record.extra.get("pp"), Some(&json!(1)));
    assert_eq!(record.cache_key(), "12");
    assert_eq!(
      record.timestamp(),
      Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 20, 30).unwrap())
    );
  }

  #[test]
  fn test_query_key() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let key = HistoryQuery::for_instance(42)
      .operation(OperationType::Update)
      .since(start)
      .into_key();

    assert_eq!(key.resource, HISTORY_RESOURCE);
    assert_eq!(key.parent_id.as_deref(), Some("42"));
    assert_eq!(key.filters.get("operation_type").map(String::as_str), Some("update"));
    assert!(key.filters.contains_key("start_date"));
    assert!(!key.filters.contains_key("end_date"));

    assert_eq!(HistoryQuery::new().into_key(), QueryKey::new(HISTORY_RESOURCE));
  }

  #[test]
  fn test_validate_date_range() {
    let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    assert!(HistoryQuery::new().since(before).until(start).validate().is_ok());

    let error = HistoryQuery::new()
      .since(start)
      .until(start)
      .validate()
      .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(!error.retryable());
  }
}
