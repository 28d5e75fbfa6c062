//! Bounded retry with exponential backoff.
//!
//! The policy for a failure is derived from its classification and can be
//! overridden per call through [`RetryOptions`].

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Classify, ErrorKind, StructuredError};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub use_backoff: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 1,
      base_delay: DEFAULT_BASE_DELAY,
      use_backoff: true,
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Derive the policy for a classified error.
  ///
  /// Non-retryable errors always get zero retries.
  pub fn for_error(error: &StructuredError) -> Self {
    if !error.retryable() {
      return Self::none();
    }

    let max_retries = match error.kind() {
      ErrorKind::Network => 3,
      ErrorKind::Timeout | ErrorKind::Server => 2,
      ErrorKind::Validation => 0,
      _ => 1,
    };

    Self {
      max_retries,
      ..Self::default()
    }
  }

  /// Delay before the retry that follows `retries_done` earlier retries.
  pub fn delay_for(&self, retries_done: u32) -> Duration {
    if !self.use_backoff {
      return self.base_delay;
    }
    self
      .base_delay
      .saturating_mul(2u32.saturating_pow(retries_done))
  }
}

/// Per-call overrides layered over the derived [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
  pub max_retries: Option<u32>,
  pub base_delay_ms: Option<u64>,
  pub use_backoff: Option<bool>,
}

impl RetryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn with_base_delay(mut self, delay: Duration) -> Self {
    self.base_delay_ms = Some(delay.as_millis() as u64);
    self
  }

  pub fn with_backoff(mut self, enabled: bool) -> Self {
    self.use_backoff = Some(enabled);
    self
  }

  /// Apply the overrides to a derived policy.
  pub fn apply(&self, policy: RetryPolicy) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries.unwrap_or(policy.max_retries),
      base_delay: self
        .base_delay_ms
        .map(Duration::from_millis)
        .unwrap_or(policy.base_delay),
      use_backoff: self.use_backoff.unwrap_or(policy.use_backoff),
    }
  }
}

/// Run `op`, retrying retryable failures.
///
/// After each failure the error is classified and the policy derived from it
/// (with `options` applied). Non-retryable errors and exhausted budgets
/// return the latest error. Otherwise `on_retry(error, retry_number, delay)`
/// is called and the next attempt starts once `delay` has elapsed.
///
/// With `max_retries = N` and a failure that stays retryable, `op` runs
/// exactly `N + 1` times.
pub async fn with_retry<T, E, F, Fut, R>(
  mut op: F,
  options: &RetryOptions,
  mut on_retry: R,
) -> Result<T, StructuredError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Classify,
  R: FnMut(&StructuredError, u32, Duration),
{
  let mut retries_done = 0u32;

  loop {
    let raw = match op().await {
      Ok(value) => {
        if retries_done > 0 {
          debug!(retries = retries_done, "operation succeeded after retrying");
        }
        return Ok(value);
      }
      Err(raw) => raw,
    };

    let error = raw.classify();
    let policy = options.apply(RetryPolicy::for_error(&error));

    if !error.retryable() || retries_done >= policy.max_retries {
      debug!(
        kind = %error.kind(),
        retries = retries_done,
        retryable = error.retryable(),
        "giving up: {}",
        error.message()
      );
      return Err(error);
    }

    let delay = policy.delay_for(retries_done);
    retries_done += 1;

    warn!(
      kind = %error.kind(),
      retry = retries_done,
      max_retries = policy.max_retries,
      delay_ms = delay.as_millis() as u64,
      "retrying after failure: {}",
      error.message()
    );

    on_retry(&error, retries_done, delay);
    tokio::time::sleep(delay).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{RawFailure, Severity};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn failing_op(
    calls: Arc<AtomicU32>,
    raw: RawFailure,
  ) -> impl FnMut() -> std::future::Ready<Result<(), RawFailure>> {
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      std::future::ready(Err(raw.clone()))
    }
  }

  #[test]
  fn test_policy_for_error_kinds() {
    let network = StructuredError::new(ErrorKind::Network, Severity::High, "x", true);
    let server = StructuredError::new(ErrorKind::Server, Severity::High, "x", true);
    let timeout = StructuredError::new(ErrorKind::Timeout, Severity::Medium, "x", true);
    let client = StructuredError::new(ErrorKind::Client, Severity::Medium, "x", true);
    let validation = StructuredError::new(ErrorKind::Validation, Severity::Medium, "x", false);
    let forced = StructuredError::new(ErrorKind::Validation, Severity::Medium, "x", true);

    assert_eq!(RetryPolicy::for_error(&network).max_retries, 3);
    assert_eq!(RetryPolicy::for_error(&server).max_retries, 2);
    assert_eq!(RetryPolicy::for_error(&timeout).max_retries, 2);
    assert_eq!(RetryPolicy::for_error(&client).max_retries, 1);
    assert_eq!(RetryPolicy::for_error(&validation).max_retries, 0);
    assert_eq!(RetryPolicy::for_error(&forced).max_retries, 0);
  }

  #[test]
  fn test_delay_schedule() {
    let policy = RetryPolicy {
      max_retries: 5,
      base_delay: Duration::from_millis(100),
      use_backoff: true,
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(800));

    let flat = RetryPolicy {
      use_backoff: false,
      ..policy
    };
    assert_eq!(flat.delay_for(3), Duration::from_millis(100));

    // Saturates instead of overflowing
    assert!(policy.delay_for(64) >= policy.delay_for(31));
  }

  #[test]
  fn test_options_override_policy() {
    let derived = RetryPolicy::default();
    let options = RetryOptions::new()
      .with_max_retries(7)
      .with_base_delay(Duration::from_millis(5));

    let applied = options.apply(derived);
    assert_eq!(applied.max_retries, 7);
    assert_eq!(applied.base_delay, Duration::from_millis(5));
    assert!(applied.use_backoff);

    assert_eq!(RetryOptions::default().apply(derived), derived);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_bound_is_n_plus_one() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut delays = Vec::new();

    let result = with_retry(
      failing_op(calls.clone(), RawFailure::transport("ECONNREFUSED")),
      &RetryOptions::default(),
      |_, _, delay| delays.push(delay),
    )
    .await;

    let error = result.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
      delays,
      vec![
        Duration::from_millis(1000),
        Duration::from_millis(2000),
        Duration::from_millis(4000)
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_explicit_max_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let options = RetryOptions::new().with_max_retries(5);

    let _ = with_retry(
      failing_op(calls.clone(), RawFailure::http_status(503, None)),
      &options,
      |_, _, _| {},
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_retryable_runs_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let options = RetryOptions::new().with_max_retries(10);

    let error = with_retry(
      failing_op(calls.clone(), RawFailure::http_status(404, None)),
      &options,
      |_, _, _| panic!("must not retry"),
    )
    .await
    .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_retries_surfaces_first_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let options = RetryOptions::new().with_max_retries(0);

    let _ = with_retry(
      failing_op(calls.clone(), RawFailure::transport("Network Error")),
      &options,
      |_, _, _| {},
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_after_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = with_retry(
      move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
          if n < 4 {
            Err(RawFailure::transport("connection refused"))
          } else {
            Ok(n)
          }
        }
      },
      &RetryOptions::default(),
      |_, _, _| {},
    )
    .await;

    assert_eq!(result.unwrap(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_last_error_wins() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let error = with_retry(
      move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Err::<(), _>(RawFailure::http_status(503, None))
          } else {
            Err(RawFailure::http_status(401, None))
          }
        }
      },
      &RetryOptions::default(),
      |_, _, _| {},
    )
    .await
    .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Authentication);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
