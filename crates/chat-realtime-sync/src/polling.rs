//! # Polling Driver
//!
//! Self-rescheduling pull loop used while push delivery is unavailable.
//!
//! ## Timing
//!
//! ```text
//! start ──interval──▶ tick ──(tick completes)──interval'──▶ tick ──▶ ...
//! ```
//!
//! The next tick is scheduled only after the current one finishes, so ticks
//! never overlap. On success the interval resets to the base; on failure it
//! grows by the configured factor up to the maximum. For the default config
//! three consecutive failures produce intervals of 5000, 7500 and 11250 ms.

use crate::error::SyncResult;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One poll of every relevant conversation.
pub type PollTick = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;

/// Notified after every tick with the driver's updated snapshot.
pub type PollObserver = Arc<dyn Fn(PollSnapshot) + Send + Sync>;

/// Interval policy for the polling loop.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval used at start and after every successful tick.
    pub base_interval: Duration,
    /// Upper bound for the interval after repeated failures.
    pub max_interval: Duration,
    /// Multiplier applied to the interval on each failure.
    pub growth_factor: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(5_000),
            max_interval: Duration::from_millis(20_000),
            growth_factor: 1.5,
        }
    }
}

impl PollingConfig {
    /// Interval to wait after a tick that ran with `current`.
    pub fn next_interval(&self, current: Duration, succeeded: bool) -> Duration {
        if succeeded {
            self.base_interval
        } else {
            // Overflowing or non-finite products clamp to the ceiling.
            Duration::try_from_secs_f64(current.as_secs_f64() * self.growth_factor)
                .map_or(self.max_interval, |grown| grown.min(self.max_interval))
        }
    }
}

/// Point-in-time view of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSnapshot {
    pub running: bool,
    /// Delay until the next scheduled tick.
    pub interval: Duration,
    pub consecutive_failures: u32,
    /// Ticks completed since the driver was created.
    pub ticks: u64,
}

#[derive(Debug)]
struct PollState {
    interval: Duration,
    consecutive_failures: u32,
    ticks: u64,
    task: Option<JoinHandle<()>>,
}

/// Single-timer polling loop around an injected tick.
pub struct PollingDriver {
    config: PollingConfig,
    tick: PollTick,
    observer: Option<PollObserver>,
    state: Arc<Mutex<PollState>>,
}

impl PollingDriver {
    pub fn new(config: PollingConfig, tick: PollTick) -> Self {
        let interval = config.base_interval;
        Self {
            config,
            tick,
            observer: None,
            state: Arc::new(Mutex::new(PollState {
                interval,
                consecutive_failures: 0,
                ticks: 0,
                task: None,
            })),
        }
    }

    /// Observe every completed tick.
    pub fn with_observer(mut self, observer: PollObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Start the loop. No-op (returns false) when already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_polling(&self) -> bool {
        let mut state = lock(&self.state);
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        state.interval = self.config.base_interval;
        state.consecutive_failures = 0;

        let shared = Arc::clone(&self.state);
        let tick = Arc::clone(&self.tick);
        let observer = self.observer.clone();
        let config = self.config.clone();
        info!(
            interval_ms = config.base_interval.as_millis() as u64,
            "Polling started"
        );
        state.task = Some(tokio::spawn(run_loop(config, shared, tick, observer)));
        true
    }

    /// Cancel the pending timer. Idempotent.
    pub fn stop_polling(&self) -> bool {
        let task = lock(&self.state).task.take();
        match task {
            Some(task) => {
                task.abort();
                info!("Polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state)
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn snapshot(&self) -> PollSnapshot {
        let state = lock(&self.state);
        snapshot_of(&state)
    }
}

impl Drop for PollingDriver {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.state).task.take() {
            task.abort();
        }
    }
}

async fn run_loop(
    config: PollingConfig,
    state: Arc<Mutex<PollState>>,
    tick: PollTick,
    observer: Option<PollObserver>,
) {
    loop {
        let interval = lock(&state).interval;
        tokio::time::sleep(interval).await;

        let result = (tick)().await;

        let snapshot = {
            let mut state = lock(&state);
            state.ticks += 1;
            match &result {
                Ok(()) => {
                    if state.consecutive_failures > 0 {
                        info!(
                            failures = state.consecutive_failures,
                            "Polling recovered"
                        );
                    }
                    state.consecutive_failures = 0;
                }
                Err(err) => {
                    state.consecutive_failures += 1;
                    warn!(
                        error = %err,
                        failures = state.consecutive_failures,
                        "Poll failed"
                    );
                }
            }
            state.interval = config.next_interval(interval, result.is_ok());
            debug!(
                next_interval_ms = state.interval.as_millis() as u64,
                "Next poll scheduled"
            );
            snapshot_of(&state)
        };

        if let Some(observer) = &observer {
            observer(snapshot);
        }
    }
}

fn snapshot_of(state: &PollState) -> PollSnapshot {
    PollSnapshot {
        running: state.task.as_ref().is_some_and(|task| !task.is_finished()),
        interval: state.interval,
        consecutive_failures: state.consecutive_failures,
        ticks: state.ticks,
    }
}

fn lock(state: &Mutex<PollState>) -> std::sync::MutexGuard<'_, PollState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Tick that records the (virtual) time of every call and fails the
    /// first `failures` calls.
    fn recording_tick(
        failures: u32,
    ) -> (PollTick, Arc<Mutex<Vec<Duration>>>, Arc<AtomicU32>) {
        let start = Instant::now();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicU32::new(0));
        let tick_calls = Arc::clone(&calls);
        let tick_count = Arc::clone(&count);
        let tick: PollTick = Arc::new(move || -> BoxFuture<'static, SyncResult<()>> {
            let calls = Arc::clone(&tick_calls);
            let count = Arc::clone(&tick_count);
            Box::pin(async move {
                calls.lock().unwrap().push(start.elapsed());
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(SyncError::FetchFailed("503".into()))
                } else {
                    Ok(())
                }
            })
        });
        (tick, calls, count)
    }

    #[test]
    fn test_next_interval_growth_and_cap() {
        let config = PollingConfig::default();
        let mut interval = config.base_interval;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(interval.as_millis());
            interval = config.next_interval(interval, false);
        }
        assert_eq!(seen, vec![5000, 7500, 11250, 16875, 20000]);
        assert_eq!(
            config.next_interval(Duration::from_secs(20), true),
            config.base_interval
        );
    }

    #[test]
    fn test_huge_growth_factor_clamps_to_max() {
        for growth_factor in [1e20, f64::INFINITY, f64::NAN] {
            let config = PollingConfig {
                growth_factor,
                ..PollingConfig::default()
            };
            assert_eq!(
                config.next_interval(Duration::from_secs(5), false),
                config.max_interval,
                "growth factor {growth_factor}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_grow_interval() {
        let (tick, calls, _) = recording_tick(3);
        let driver = PollingDriver::new(PollingConfig::default(), tick);

        assert!(driver.start_polling());
        tokio::time::sleep(Duration::from_millis(23_800)).await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Duration::from_millis(5_000),
                Duration::from_millis(12_500),
                Duration::from_millis(23_750),
            ]
        );
        let snapshot = driver.snapshot();
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.interval, Duration::from_millis(16_875));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_interval() {
        let (tick, _, count) = recording_tick(1);
        let driver = PollingDriver::new(PollingConfig::default(), tick);

        driver.start_polling();
        // 5000 fails, 12500 succeeds, 17500 succeeds
        tokio::time::sleep(Duration::from_millis(17_600)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        let snapshot = driver.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.interval, Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (tick, _, count) = recording_tick(0);
        let driver = PollingDriver::new(PollingConfig::default(), tick);

        assert!(driver.start_polling());
        assert!(!driver.start_polling());
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_tick() {
        let (tick, _, count) = recording_tick(0);
        let driver = PollingDriver::new(PollingConfig::default(), tick);

        driver.start_polling();
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(driver.stop_polling());
        assert!(!driver.stop_polling());
        tokio::time::sleep(Duration::from_millis(10_000)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!driver.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_tick() {
        let (tick, _, _) = recording_tick(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let driver = PollingDriver::new(PollingConfig::default(), tick).with_observer(Arc::new(
            move |snapshot: PollSnapshot| sink.lock().unwrap().push(snapshot.consecutive_failures),
        ));

        driver.start_polling();
        tokio::time::sleep(Duration::from_millis(12_600)).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }
}
