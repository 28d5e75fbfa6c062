use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Records scanned per search. The listing endpoints cap `limit` at 1000 and
/// have no name filter, so matching happens here.
const SEARCH_WINDOW: usize = 1000;

use crate::cache::{PageRequest, QueryKey, RawPage, RecordSource};
use crate::config::{ApiConfig, Config};
use crate::error::RawFailure;
use crate::history::api_types::HistoryListResponse;
use crate::history::types::HistoryRecord;

/// History API client
#[derive(Clone)]
pub struct HttpHistorySource {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpHistorySource {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let mut base = config.base_url.trim().to_string();
    // Url::join replaces the last segment unless the base ends with a slash
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = Client::builder()
      .user_agent(concat!("resq/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::api_token(),
    })
  }

  pub fn with_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn endpoint(&self, path: &str) -> Result<Url, RawFailure> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| RawFailure::runtime(format!("Invalid endpoint {}: {}", path, e)))
  }

  /// Listing endpoint for a key: per instance when it has a parent.
  fn list_url(&self, key: &QueryKey) -> Result<Url, RawFailure> {
    match &key.parent_id {
      Some(instance_id) => self.endpoint(&format!("api/instances/{}/history", instance_id)),
      None => self.endpoint("api/history"),
    }
  }

  /// GET `url` and decode the JSON body. Non-2xx responses keep their status
  /// and body for classification.
  async fn get_json<T: DeserializeOwned>(
    &self,
    url: Url,
    query: &[(String, String)],
  ) -> Result<T, RawFailure> {
    debug!(url = %url, "GET");

    let mut request = self.client.get(url).query(query);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(RawFailure::from)?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(RawFailure::http_status(status.as_u16(), error_body(text)));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| RawFailure::runtime(format!("Failed to parse response: {}", e)))
  }

  /// Get a single history record by id
  pub async fn get_record(&self, history_id: &str) -> Result<HistoryRecord, RawFailure> {
    let url = self.endpoint(&format!("api/history/{}", history_id))?;
    self.get_json(url, &[]).await
  }

  /// Like [`get_record`](Self::get_record), with a 404 meaning absent.
  async fn find_record(&self, history_id: &str) -> Result<Option<HistoryRecord>, RawFailure> {
    absent_if_not_found(self.get_record(history_id).await)
  }
}

fn absent_if_not_found<T>(result: Result<T, RawFailure>) -> Result<Option<T>, RawFailure> {
  match result {
    Ok(value) => Ok(Some(value)),
    Err(failure) if failure.status() == Some(404) => Ok(None),
    Err(failure) => Err(failure),
  }
}

/// Case-insensitive partial match on the instance name.
fn name_matches(record: &HistoryRecord, needle: &str) -> bool {
  record.name.to_lowercase().contains(needle)
}

fn filter_by_name(records: Vec<HistoryRecord>, term: &str, limit: usize) -> Vec<HistoryRecord> {
  let needle = term.trim().to_lowercase();
  records
    .into_iter()
    .filter(|record| name_matches(record, &needle))
    .take(limit)
    .collect()
}

fn list_params(key: &QueryKey, offset: usize, limit: usize) -> Vec<(String, String)> {
  let mut params: Vec<(String, String)> = key
    .filters
    .iter()
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();
  params.push(("limit".to_string(), limit.to_string()));
  params.push(("offset".to_string(), offset.to_string()));
  params
}

fn error_body(text: String) -> Option<Value> {
  if text.trim().is_empty() {
    return None;
  }
  Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

#[async_trait]
impl RecordSource<HistoryRecord> for HttpHistorySource {
  async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage<HistoryRecord>, RawFailure> {
    let url = self.list_url(&request.key)?;
    let params = list_params(&request.key, request.offset, request.limit);
    let response: HistoryListResponse = self.get_json(url, &params).await?;
    Ok(response.into_page())
  }

  async fn search(
    &self,
    key: &QueryKey,
    term: &str,
    limit: usize,
  ) -> Result<Vec<HistoryRecord>, RawFailure> {
    let url = self.list_url(key)?;
    let params = list_params(key, 0, SEARCH_WINDOW);
    let response: HistoryListResponse = self.get_json(url, &params).await?;
    Ok(filter_by_name(response.history_records, term, limit))
  }

  /// Unknown ids are left out; any other failure fails the batch.
  async fn batch_get(&self, ids: &[String]) -> Result<Vec<HistoryRecord>, RawFailure> {
    let found = try_join_all(ids.iter().map(|id| self.find_record(id))).await?;
    Ok(found.into_iter().flatten().collect())
  }
}
