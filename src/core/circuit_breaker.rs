//! Debounced failure alarm.
//!
//! [`RepeatedFailuresOverTimeCircuitBreaker`] arms on the first failure and
//! fires its trigger once if no success is recorded within the configured
//! time to wait:
//! - `Disarmed`: no failures since the last success
//! - `Armed`: failures recorded, timer running
//! - `Triggered`: the timer expired with failures still pending

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Breaker timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Time failures may persist before the trigger fires (default: 120)
    #[serde(default = "default_time_to_wait")]
    pub time_to_wait_seconds: u64,

    /// Delay imposed on every failure (default: 1000)
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_millis: u64,
}

fn default_time_to_wait() -> u64 {
    120
}
fn default_failure_backoff() -> u64 {
    1000
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            time_to_wait_seconds: default_time_to_wait(),
            failure_backoff_millis: default_failure_backoff(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn time_to_wait(&self) -> Duration {
        Duration::from_secs(self.time_to_wait_seconds)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Disarmed,
    Armed,
    Triggered,
}

type TriggerAction = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

struct Armed {
    state: BreakerState,
    timer: Option<JoinHandle<()>>,
    last_error: Option<Arc<anyhow::Error>>,
}

struct Shared {
    name: String,
    failure_count: AtomicU64,
    armed: Mutex<Armed>,
    trigger: TriggerAction,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Armed> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fires a trigger when failures keep occurring for longer than the time
/// to wait
pub struct RepeatedFailuresOverTimeCircuitBreaker {
    shared: Arc<Shared>,
    time_to_wait: Duration,
    failure_backoff: Duration,
}

impl RepeatedFailuresOverTimeCircuitBreaker {
    pub fn new<F>(name: impl Into<String>, settings: &CircuitBreakerSettings, trigger: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                failure_count: AtomicU64::new(0),
                armed: Mutex::new(Armed {
                    state: BreakerState::Disarmed,
                    timer: None,
                    last_error: None,
                }),
                trigger: Box::new(trigger),
            }),
            time_to_wait: settings.time_to_wait(),
            failure_backoff: settings.failure_backoff(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.shared.lock().state
    }

    pub fn failure_count(&self) -> u64 {
        self.shared.failure_count.load(Ordering::SeqCst)
    }

    /// Reset the failure count and disarm
    pub fn success(&self) {
        // The count only changes under the state lock.
        let mut armed = self.shared.lock();
        if self.shared.failure_count.swap(0, Ordering::SeqCst) == 0 {
            return;
        }

        if let Some(timer) = armed.timer.take() {
            timer.abort();
        }
        armed.state = BreakerState::Disarmed;
        armed.last_error = None;
        info!(breaker = %self.shared.name, "The circuit breaker is now disarmed");
    }

    /// Record a failure, arming the breaker on the first one, then wait for
    /// the failure backoff
    pub async fn failure(&self, error: anyhow::Error) {
        {
            let mut armed = self.shared.lock();
            armed.last_error = Some(Arc::new(error));

            if self.shared.failure_count.fetch_add(1, Ordering::SeqCst) == 0 {
                armed.state = BreakerState::Armed;
                armed.timer = Some(self.start_timer());
                warn!(breaker = %self.shared.name, "The circuit breaker is now in the armed state");
            }
        }

        if !self.failure_backoff.is_zero() {
            tokio::time::sleep(self.failure_backoff).await;
        }
    }

    fn start_timer(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let time_to_wait = self.time_to_wait;

        tokio::spawn(async move {
            tokio::time::sleep(time_to_wait).await;

            let last_error = {
                let mut armed = shared.lock();
                if shared.failure_count.load(Ordering::SeqCst) == 0 || armed.state != BreakerState::Armed {
                    return;
                }
                armed.state = BreakerState::Triggered;
                armed.timer = None;
                armed.last_error.clone()
            };

            warn!(breaker = %shared.name, "The circuit breaker will now be triggered");
            let error = last_error.unwrap_or_else(|| Arc::new(anyhow::anyhow!("circuit breaker triggered")));
            (shared.trigger)(&error);
        })
    }
}

impl Drop for RepeatedFailuresOverTimeCircuitBreaker {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(triggered: Arc<AtomicUsize>) -> RepeatedFailuresOverTimeCircuitBreaker {
        let settings = CircuitBreakerSettings {
            time_to_wait_seconds: 10,
            failure_backoff_millis: 0,
        };
        RepeatedFailuresOverTimeCircuitBreaker::new("test", &settings, move |_| {
            triggered.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_once_after_time_to_wait() {
        let triggered = Arc::new(AtomicUsize::new(0));
        let breaker = breaker(triggered.clone());

        breaker.failure(anyhow::anyhow!("boom")).await;
        breaker.failure(anyhow::anyhow!("boom again")).await;
        assert_eq!(breaker.state(), BreakerState::Armed);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(triggered.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Triggered);

        breaker.failure(anyhow::anyhow!("still failing")).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_disarms() {
        let triggered = Arc::new(AtomicUsize::new(0));
        let breaker = breaker(triggered.clone());

        breaker.failure(anyhow::anyhow!("boom")).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        breaker.success();
        assert_eq!(breaker.state(), BreakerState::Disarmed);
        assert_eq!(breaker.failure_count(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(triggered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_success() {
        let triggered = Arc::new(AtomicUsize::new(0));
        let breaker = breaker(triggered.clone());

        breaker.failure(anyhow::anyhow!("first")).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(triggered.load(Ordering::SeqCst), 1);

        breaker.success();
        breaker.failure(anyhow::anyhow!("second")).await;
        assert_eq!(breaker.state(), BreakerState::Armed);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(triggered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_success_and_failure_leave_consistent_state() {
        for _ in 0..500 {
            let breaker = Arc::new(breaker(Arc::new(AtomicUsize::new(0))));
            breaker.failure(anyhow::anyhow!("first")).await;

            let failing = {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.failure(anyhow::anyhow!("second")).await })
            };
            let succeeding = {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.success() })
            };
            failing.await.unwrap();
            succeeding.await.unwrap();

            // Pending failures always leave the breaker armed
            let count = breaker.failure_count();
            let state = breaker.state();
            assert_eq!(count == 0, state == BreakerState::Disarmed, "count={} state={:?}", count, state);
        }
    }
}
