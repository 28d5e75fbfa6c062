//! Serde-deserializable types matching the history API responses.

use serde::Deserialize;

use super::types::HistoryRecord;
use crate::cache::RawPage;

/// `GET /api/history` and `GET /api/instances/{id}/history`
#[derive(Debug, Deserialize)]
pub struct HistoryListResponse {
  #[serde(default)]
  pub total_count: usize,
  #[serde(default)]
  pub history_records: Vec<HistoryRecord>,
  #[serde(default)]
  pub limit: usize,
  #[serde(default)]
  pub offset: usize,
  #[serde(default)]
  pub has_more: bool,
}

impl HistoryListResponse {
  pub fn into_page(self) -> RawPage<HistoryRecord> {
    RawPage::new(self.history_records).with_total(self.total_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_into_page() {
    let response: HistoryListResponse = serde_json::from_value(json!({
      "total_count": 41,
      "history_records": [{
        "history_id": 1,
        "original_id": 9,
        "operation_type": "create",
        "operation_timestamp": "2024-05-01T10:20:30Z",
        "name": "a",
        "model_name": "m",
        "cluster_name": "c",
        "image_tag": "t"
      }],
      "limit": 20,
      "offset": 40,
      "has_more": false
    }))
    .unwrap();

    let page = response.into_page();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.total_count, Some(41));
  }
}
