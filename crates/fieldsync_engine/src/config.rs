//! Configuration for the sync engine.

use std::time::Duration;

/// Smallest allowed number of concurrent attachment uploads.
pub const MIN_UPLOAD_CONCURRENCY: usize = 2;
/// Largest allowed number of concurrent attachment uploads.
pub const MAX_UPLOAD_CONCURRENCY: usize = 4;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// User whose records are synced.
    pub user_id: String,
    /// Actor recorded in audit entries for resolutions made by this engine.
    pub actor: String,
    /// Timeout applied to every network request.
    pub request_timeout: Duration,
    /// Concurrent attachment uploads (clamped to 2..=4).
    pub upload_concurrency: usize,
    /// Retry configuration for record pushes and uploads.
    pub retry: RetryConfig,
    /// Interval for periodic automatic sync.
    pub sync_interval: Option<Duration>,
    /// How long connectivity must hold before a reconnect triggers a sync.
    pub stabilization: Duration,
    /// Share of pass progress attributed to the pull phase (0.0..=1.0).
    pub pull_weight: f32,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            actor: user_id.clone(),
            user_id,
            request_timeout: Duration::from_secs(30),
            upload_concurrency: 3,
            retry: RetryConfig::default(),
            sync_interval: None,
            stabilization: Duration::from_secs(2),
            pull_weight: 0.2,
        }
    }

    /// Sets the actor recorded in audit entries.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the upload concurrency, clamped to the supported range.
    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the reconnect stabilization interval.
    pub fn with_stabilization(mut self, stabilization: Duration) -> Self {
        self.stabilization = stabilization;
        self
    }

    /// Sets the share of progress attributed to the pull phase.
    pub fn with_pull_weight(mut self, weight: f32) -> Self {
        self.pull_weight = weight;
        self
    }

    /// Effective upload concurrency.
    pub fn effective_upload_concurrency(&self) -> usize {
        self.upload_concurrency
            .clamp(MIN_UPLOAD_CONCURRENCY, MAX_UPLOAD_CONCURRENCY)
    }

    /// Effective pull weight.
    pub fn effective_pull_weight(&self) -> f32 {
        if self.pull_weight.is_finite() {
            self.pull_weight.clamp(0.0, 1.0)
        } else {
            0.2
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failures after which an entity is marked `error`.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration that retries on every pass with no delay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true once `failures` consecutive failures exhaust the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Calculates the delay before the next attempt after `failures`
    /// consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(failures.saturating_sub(1).min(i32::MAX as u32) as i32);

        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = if base_delay.is_nan() {
            max_secs
        } else {
            base_delay.clamp(0.0, max_secs)
        };

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Cheap pseudo-random value in `[0, 1)` taken from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
