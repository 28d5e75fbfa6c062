//! Observable state machine for one logical async operation.
//!
//! ```ignore
//! let tracker = OperationTracker::new(TrackerConfig::default());
//! let mut updates = tracker.subscribe();
//!
//! let records = tracker
//!     .execute(|| source.fetch_page(&request), &RetryOptions::default())
//!     .await?;
//!
//! // In render
//! match tracker.snapshot().state {
//!     OperationState::Loading | OperationState::Retrying => render_spinner(),
//!     OperationState::Success => render_data(&records),
//!     OperationState::Error => render_error(tracker.snapshot().error()),
//!     _ => {}
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::snapshot::{OperationSnapshot, OperationState};
use crate::error::{Classify, ErrorHandler, StructuredError};
use crate::retry::{with_retry, RetryOptions};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Timing settings for a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
  /// Advisory deadline; crossing it sets `is_timed_out`.
  pub timeout: Duration,
  /// How often `elapsed_ms` is refreshed while in flight.
  pub tick_interval: Duration,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_TIMEOUT,
      tick_interval: DEFAULT_TICK_INTERVAL,
    }
  }
}

impl TrackerConfig {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_tick_interval(mut self, interval: Duration) -> Self {
    self.tick_interval = interval;
    self
  }
}

/// Handle to a tracked operation. Clones share the same state.
///
/// Each call to [`start`](Self::start) (or [`execute`](Self::execute)) begins
/// a new logical operation and bumps an internal generation counter, as does
/// [`reset`](Self::reset). Results belonging to an older generation are
/// dropped without touching the snapshot. The underlying request is not
/// aborted; dropping the future returned by `execute` is what stops it, and
/// puts the tracker back to `Idle`.
#[derive(Clone)]
pub struct OperationTracker {
  inner: Arc<Inner>,
}

struct Inner {
  config: TrackerConfig,
  state: watch::Sender<OperationSnapshot>,
  generation: AtomicU64,
  started_at: Mutex<Option<Instant>>,
  ticker: Mutex<Option<JoinHandle<()>>>,
  handler: Option<Arc<ErrorHandler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl OperationTracker {
  pub fn new(config: TrackerConfig) -> Self {
    Self::build(config, None)
  }

  /// Tracker that hands terminal errors to `handler`.
  pub fn with_error_handler(config: TrackerConfig, handler: Arc<ErrorHandler>) -> Self {
    Self::build(config, Some(handler))
  }

  fn build(config: TrackerConfig, handler: Option<Arc<ErrorHandler>>) -> Self {
    let (state, _) = watch::channel(OperationSnapshot::default());
    Self {
      inner: Arc::new(Inner {
        config,
        state,
        generation: AtomicU64::new(0),
        started_at: Mutex::new(None),
        ticker: Mutex::new(None),
        handler,
      }),
    }
  }

  pub fn config(&self) -> &TrackerConfig {
    &self.inner.config
  }

  /// Current state, cloned.
  pub fn snapshot(&self) -> OperationSnapshot {
    self.inner.state.borrow().clone()
  }

  /// Receiver notified on every state change.
  pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
    self.inner.state.subscribe()
  }

  pub fn generation(&self) -> u64 {
    self.inner.generation.load(Ordering::SeqCst)
  }

  /// Begin a new logical operation: `Loading`, counters cleared, tick
  /// started. Returns the new generation.
  pub fn start(&self) -> u64 {
    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    *lock(&self.inner.started_at) = Some(Instant::now());
    self.inner.state.send_replace(OperationSnapshot {
      state: OperationState::Loading,
      ..OperationSnapshot::default()
    });
    Inner::spawn_ticker(&self.inner, generation);
    generation
  }

  /// Back to `Idle` from any state. Stops the tick and invalidates any
  /// result still in flight.
  pub fn reset(&self) {
    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    self.inner.stop_ticker();
    *lock(&self.inner.started_at) = None;
    self.inner.state.send_replace(OperationSnapshot::default());
  }

  /// Scope-exit hook for owners of the operation. Same as [`reset`](Self::reset).
  pub fn cancel(&self) {
    self.reset();
  }

  /// Record caller-side progress (clamped to 0..=100) while in flight.
  pub fn set_progress(&self, progress: f64) {
    let progress = progress.clamp(0.0, 100.0);
    self.inner.state.send_if_modified(|s| {
      if s.state.is_loading() {
        s.progress = progress;
        true
      } else {
        false
      }
    });
  }

  /// Give up on an in-flight operation whose deadline passed. Moves to the
  /// terminal `Timeout` state; a late result is ignored.
  pub fn mark_timed_out(&self) {
    let mut changed = false;
    let elapsed = self.inner.elapsed();
    self.inner.state.send_if_modified(|s| {
      if s.state.is_loading() {
        s.state = OperationState::Timeout;
        s.is_timed_out = true;
        s.elapsed_ms = elapsed.as_millis() as u64;
        changed = true;
      }
      changed
    });
    if changed {
      self.inner.generation.fetch_add(1, Ordering::SeqCst);
      self.inner.stop_ticker();
    }
  }

  /// Run `op` with retries as a new logical operation, reporting progress
  /// through the snapshot.
  pub async fn execute<T, E, F, Fut>(
    &self,
    mut op: F,
    options: &RetryOptions,
  ) -> Result<T, StructuredError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
  {
    let generation = self.start();
    let inner = &self.inner;
    let mut abandon = Abandon {
      inner,
      generation,
      armed: true,
    };

    let result = with_retry(
      || {
        inner.begin_attempt(generation);
        op()
      },
      options,
      |error, _, _| inner.mark_retrying(generation, error),
    )
    .await;

    abandon.armed = false;
    match &result {
      Ok(_) => inner.finish_success(generation),
      Err(error) => inner.finish_error(generation, error),
    }

    result
  }
}

impl Inner {
  fn is_current(&self, generation: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == generation
  }

  fn elapsed(&self) -> Duration {
    let started_at = *lock(&self.started_at);
    started_at
      .map(|started| started.elapsed())
      .unwrap_or_default()
  }

  /// The caller dropped the operation before it settled. Back to `Idle`
  /// unless a newer operation already took over.
  fn abandon(&self, generation: u64) {
    if self
      .generation
      .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return;
    }
    debug!(generation, "operation dropped before it settled");
    self.stop_ticker();
    *lock(&self.started_at) = None;
    self.state.send_replace(OperationSnapshot::default());
  }

  fn begin_attempt(&self, generation: u64) {
    if !self.is_current(generation) {
      return;
    }
    self.state.send_modify(|s| {
      s.state = OperationState::Loading;
      s.attempt += 1;
    });
  }

  fn mark_retrying(&self, generation: u64, error: &StructuredError) {
    if !self.is_current(generation) {
      return;
    }
    self.state.send_modify(|s| {
      s.state = OperationState::Retrying;
      s.last_error = Some(error.clone());
    });
  }

  fn finish_success(&self, generation: u64) {
    if !self.is_current(generation) {
      debug!(generation, "dropping result of superseded operation");
      return;
    }
    self.stop_ticker();
    let elapsed = self.elapsed();
    self.state.send_modify(|s| {
      s.state = OperationState::Success;
      s.elapsed_ms = elapsed.as_millis() as u64;
      s.progress = 100.0;
    });
  }

  fn finish_error(&self, generation: u64, error: &StructuredError) {
    if !self.is_current(generation) {
      debug!(generation, "dropping error of superseded operation");
      return;
    }
    self.stop_ticker();
    let elapsed = self.elapsed();
    self.state.send_modify(|s| {
      s.state = OperationState::Error;
      s.elapsed_ms = elapsed.as_millis() as u64;
      s.last_error = Some(error.clone());
    });
    if let Some(handler) = &self.handler {
      handler.record(error);
    }
  }

  /// Refresh elapsed time. Returns false once the tick should stop.
  fn tick(&self, generation: u64) -> bool {
    if !self.is_current(generation) {
      return false;
    }

    let elapsed = self.elapsed();
    let timeout = self.config.timeout;
    let mut in_flight = true;

    self.state.send_modify(|s| {
      if !s.state.is_loading() {
        in_flight = false;
        return;
      }
      s.elapsed_ms = elapsed.as_millis() as u64;
      if !s.is_timed_out && elapsed >= timeout {
        s.is_timed_out = true;
        warn!(
          elapsed_ms = s.elapsed_ms,
          timeout_ms = timeout.as_millis() as u64,
          attempt = s.attempt,
          "operation exceeded its deadline"
        );
      }
    });

    in_flight
  }

  fn spawn_ticker(this: &Arc<Self>, generation: u64) {
    // Without a runtime there is nothing to tick on; elapsed time is still
    // recorded when the operation finishes.
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };

    let weak: Weak<Inner> = Arc::downgrade(this);
    let period = this.config.tick_interval.max(Duration::from_millis(1));

    let handle = runtime.spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      interval.tick().await;

      loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        if !inner.tick(generation) {
          break;
        }
      }
    });

    if let Some(previous) = lock(&this.ticker).replace(handle) {
      previous.abort();
    }
  }

  fn stop_ticker(&self) {
    if let Some(handle) = lock(&self.ticker).take() {
      handle.abort();
    }
  }
}

/// Resets the tracker if `execute` is dropped mid-flight.
struct Abandon<'a> {
  inner: &'a Inner,
  generation: u64,
  armed: bool,
}

impl Drop for Abandon<'_> {
  fn drop(&mut self) {
    if self.armed {
      self.inner.abandon(self.generation);
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    let ticker = self
      .ticker
      .get_mut()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(handle) = ticker {
      handle.abort();
    }
  }
}

impl std::fmt::Debug for OperationTracker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OperationTracker")
      .field("snapshot", &*self.inner.state.borrow())
      .field("generation", &self.generation())
      .field("config", &self.inner.config)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorKind, RawFailure};
  use std::sync::atomic::AtomicU32;

  #[tokio::test]
  async fn test_execute_success() {
    let tracker = OperationTracker::new(TrackerConfig::default());
    assert_eq!(tracker.snapshot().state, OperationState::Idle);

    let value = tracker
      .execute(
        || async { Ok::<_, RawFailure>(vec![1, 2, 3]) },
        &RetryOptions::default(),
      )
      .await
      .unwrap();

    let snapshot = tracker.snapshot();
    assert_eq!(value, vec![1, 2, 3]);
    assert_eq!(snapshot.state, OperationState::Success);
    assert_eq!(snapshot.attempt, 1);
    assert_eq!(snapshot.progress, 100.0);
    assert!(snapshot.last_error.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_on_fourth_attempt() {
    let tracker = OperationTracker::new(TrackerConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = tracker
      .execute(
        move || {
          let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
          async move {
            if n <= 3 {
              Err(RawFailure::transport("connect ECONNREFUSED"))
            } else {
              Ok(n)
            }
          }
        },
        &RetryOptions::default(),
      )
      .await;

    let snapshot = tracker.snapshot();
    assert_eq!(result.unwrap(), 4);
    assert_eq!(snapshot.state, OperationState::Success);
    assert_eq!(snapshot.attempt, 4);
    // The last failure stays visible for diagnostics
    assert_eq!(
      snapshot.last_error.map(|e| e.kind()),
      Some(ErrorKind::Network)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_retryable_error_is_terminal() {
    let handler = Arc::new(ErrorHandler::default());
    let tracker = OperationTracker::with_error_handler(TrackerConfig::default(), handler.clone());

    let error = tracker
      .execute(
        || async { Err::<(), _>(RawFailure::http_status(404, None)) },
        &RetryOptions::default(),
      )
      .await
      .unwrap_err();

    let snapshot = tracker.snapshot();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(snapshot.state, OperationState::Error);
    assert_eq!(snapshot.attempt, 1);
    assert_eq!(snapshot.last_error, Some(error));
    assert_eq!(handler.recent().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retrying_state_is_observable() {
    let tracker = OperationTracker::new(TrackerConfig::default());
    let mut updates = tracker.subscribe();

    let collector = tokio::spawn(async move {
      let mut states = Vec::new();
      while updates.changed().await.is_ok() {
        let state = updates.borrow_and_update().state;
        if states.last() != Some(&state) {
          states.push(state);
        }
        if state.is_terminal() {
          break;
        }
      }
      states
    });

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    tracker
      .execute(
        move || {
          let n = counter.fetch_add(1, Ordering::SeqCst);
          async move {
            if n == 0 {
              Err(RawFailure::http_status(503, None))
            } else {
              Ok(())
            }
          }
        },
        &RetryOptions::default(),
      )
      .await
      .unwrap();

    let states = collector.await.unwrap();
    assert!(states.contains(&OperationState::Retrying));
    assert_eq!(states.last(), Some(&OperationState::Success));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_drops_stale_result() {
    let tracker = OperationTracker::new(TrackerConfig::default());
    let worker = tracker.clone();

    let task = tokio::spawn(async move {
      worker
        .execute(
          || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RawFailure>("late")
          },
          &RetryOptions::default(),
        )
        .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(tracker.snapshot().state, OperationState::Loading);

    tracker.reset();
    let result = task.await.unwrap();

    // The caller still gets its value; the snapshot ignores it
    assert_eq!(result.unwrap(), "late");
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.state, OperationState::Idle);
    assert_eq!(snapshot.attempt, 0);
    assert_eq!(snapshot.elapsed_ms, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_advisory() {
    let config = TrackerConfig::default()
      .with_timeout(Duration::from_secs(2))
      .with_tick_interval(Duration::from_secs(1));
    let tracker = OperationTracker::new(config);
    let worker = tracker.clone();

    let task = tokio::spawn(async move {
      worker
        .execute(
          || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RawFailure>(())
          },
          &RetryOptions::default(),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let during = tracker.snapshot();
    assert_eq!(during.state, OperationState::Loading);
    assert!(during.is_timed_out);
    assert!(during.elapsed_ms >= 2000);

    task.await.unwrap().unwrap();
    let after = tracker.snapshot();
    assert_eq!(after.state, OperationState::Success);
    assert!(after.is_timed_out);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mark_timed_out_is_terminal() {
    let tracker = OperationTracker::new(TrackerConfig::default());
    let worker = tracker.clone();

    let task = tokio::spawn(async move {
      worker
        .execute(
          || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RawFailure>(())
          },
          &RetryOptions::default(),
        )
        .await
    });

    tokio::time::sleep(Duration::from_secs(31)).await;
    tracker.mark_timed_out();
    assert_eq!(tracker.snapshot().state, OperationState::Timeout);

    task.await.unwrap().unwrap();
    assert_eq!(tracker.snapshot().state, OperationState::Timeout);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_execute_returns_to_idle() {
    let tracker = OperationTracker::new(TrackerConfig::default());

    let outcome = tokio::time::timeout(
      Duration::from_secs(2),
      tracker.execute(
        || async {
          tokio::time::sleep(Duration::from_secs(60)).await;
          Ok::<_, RawFailure>(())
        },
        &RetryOptions::default(),
      ),
    )
    .await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(tracker.snapshot(), OperationSnapshot::default());
    assert!(lock(&tracker.inner.ticker).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_execute_leaves_newer_operation_alone() {
    let tracker = OperationTracker::new(TrackerConfig::default());
    let worker = tracker.clone();

    let task = tokio::spawn(async move {
      worker
        .execute(
          || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RawFailure>(())
          },
          &RetryOptions::default(),
        )
        .await
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let generation = tracker.start();
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(tracker.generation(), generation);
    assert_eq!(tracker.snapshot().state, OperationState::Loading);
  }

  #[tokio::test]
  async fn test_progress_only_while_loading() {
    let tracker = OperationTracker::new(TrackerConfig::default());

    tracker.set_progress(50.0);
    assert_eq!(tracker.snapshot().progress, 0.0);

    tracker.start();
    tracker.set_progress(150.0);
    assert_eq!(tracker.snapshot().progress, 100.0);
    tracker.set_progress(42.0);
    assert_eq!(tracker.snapshot().progress, 42.0);

    tracker.cancel();
    assert_eq!(tracker.snapshot(), OperationSnapshot::default());
  }
}
