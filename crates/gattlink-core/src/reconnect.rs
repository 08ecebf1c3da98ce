//! Automatic reconnection after an unexpected link drop.
//!
//! [`ReconnectPolicy`] decides whether, and after what delay, a connection
//! attempt follows a link loss. It holds at most one scheduled attempt per
//! connection; the attempt runs on a background task that is cancelled by
//! [`ReconnectPolicy::cancel`], after which the timer never fires.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Options for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Maximum number of consecutive reconnection attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (for exponential backoff).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
    /// Whether to use exponential backoff.
    pub use_exponential_backoff: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            use_exponential_backoff: true,
        }
    }
}

impl ReconnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options with unlimited retry attempts.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Create options with a fixed delay (no backoff, no jitter).
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            jitter: false,
            use_exponential_backoff: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    #[must_use]
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    /// Base delay for a zero-based attempt number, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.initial_delay;
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Delay for an attempt with jitter applied when enabled.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter {
            return base;
        }
        let factor = 1.0 + rand::rng().random::<f64>() * 0.25;
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config("backoff_multiplier must be >= 1.0"));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::invalid_config("initial_delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config("max_delay must be >= initial_delay"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// A scheduled reconnect attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectAttempt {
    /// One-based attempt number since the connection was last ready.
    pub attempt: u32,
    /// Delay between scheduling and firing.
    pub delay: Duration,
    /// Why the link was lost.
    pub cause: String,
    #[serde(skip)]
    pub scheduled_at: Instant,
}

/// Outcome of reporting a link loss to the policy.
#[derive(Debug, Clone)]
pub enum ReconnectDecision {
    /// A new attempt was scheduled.
    Scheduled(ReconnectAttempt),
    /// An attempt is already pending; nothing new was scheduled.
    AlreadyScheduled,
    /// The connection was closed; no attempt is made.
    Closed,
    /// The attempt budget is spent.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Default)]
struct PolicyState {
    scheduled: Option<(ReconnectAttempt, CancellationToken)>,
    attempts: u32,
    closed: bool,
    generation: u64,
}

/// Schedules at most one reconnect attempt at a time.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    options: ReconnectOptions,
    state: Arc<Mutex<PolicyState>>,
}

impl ReconnectPolicy {
    pub fn new(options: ReconnectOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(PolicyState::default())),
        }
    }

    pub fn options(&self) -> &ReconnectOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a link loss and schedule `reconnect` after the configured delay.
    ///
    /// `reconnect` receives the attempt number. It is not called if the
    /// policy is cancelled before the delay elapses.
    pub fn on_link_lost<F, Fut>(&self, cause: impl Into<String>, reconnect: F) -> ReconnectDecision
    where
        F: FnOnce(u32) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cause = cause.into();
        let mut state = self.lock();

        if state.closed {
            debug!(cause = %cause, "Connection closed, not reconnecting");
            return ReconnectDecision::Closed;
        }
        if state.scheduled.is_some() {
            debug!(cause = %cause, "Reconnect already scheduled");
            return ReconnectDecision::AlreadyScheduled;
        }
        if let Some(max) = self.options.max_attempts
            && state.attempts >= max
        {
            warn!(attempts = state.attempts, cause = %cause, "Reconnect attempts exhausted");
            return ReconnectDecision::Exhausted {
                attempts: state.attempts,
            };
        }

        let delay = self.options.jittered_delay_for_attempt(state.attempts);
        state.attempts += 1;
        state.generation = state.generation.wrapping_add(1);

        let attempt = ReconnectAttempt {
            attempt: state.attempts,
            delay,
            cause,
            scheduled_at: Instant::now(),
        };
        let token = CancellationToken::new();
        state.scheduled = Some((attempt.clone(), token.clone()));

        info!(
            attempt = attempt.attempt,
            delay_ms = delay.as_millis() as u64,
            cause = %attempt.cause,
            "Scheduling reconnect"
        );

        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        let number = attempt.attempt;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(attempt = number, "Scheduled reconnect cancelled");
                    return;
                }
                _ = sleep(delay) => {}
            }

            {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if token.is_cancelled() || state.closed || state.generation != generation {
                    return;
                }
                state.scheduled = None;
            }

            reconnect(number).await;
        });

        ReconnectDecision::Scheduled(attempt)
    }

    /// Cancel any scheduled attempt and refuse new ones until [`reopen`](Self::reopen).
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.closed = true;
        if let Some((attempt, token)) = state.scheduled.take() {
            token.cancel();
            debug!(attempt = attempt.attempt, "Cancelled scheduled reconnect");
        }
    }

    /// Accept link-loss reports again after a [`cancel`](Self::cancel).
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.closed = false;
        state.attempts = 0;
    }

    /// Drop a scheduled attempt without closing the policy.
    pub fn abort_scheduled(&self) {
        if let Some((_, token)) = self.lock().scheduled.take() {
            token.cancel();
        }
    }

    /// Reset the attempt counter (the connection became ready).
    pub fn reset(&self) {
        self.lock().attempts = 0;
    }

    pub fn is_scheduled(&self) -> bool {
        self.lock().scheduled.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Attempts made since the connection was last ready.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// The currently scheduled attempt, if any.
    pub fn scheduled(&self) -> Option<ReconnectAttempt> {
        self.lock().scheduled.as_ref().map(|(a, _)| a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_reconnect_options_default() {
        let opts = ReconnectOptions::default();
        assert_eq!(opts.max_attempts, Some(5));
        assert!(opts.use_exponential_backoff);
        assert!(opts.jitter);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_delay_calculation() {
        let opts = ReconnectOptions::new().jitter(false);

        assert_eq!(opts.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(opts.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(opts.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(opts.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let opts = ReconnectOptions::new();
        for attempt in 0..4 {
            let base = opts.delay_for_attempt(attempt);
            let delay = opts.jittered_delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.25) + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_fixed_delay() {
        let opts = ReconnectOptions::fixed_delay(Duration::from_secs(5));
        assert_eq!(opts.jittered_delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(opts.jittered_delay_for_attempt(5), Duration::from_secs(5));
        assert!(opts.validate().is_ok());
    }

    fn counter() -> (Arc<AtomicU32>, impl FnOnce(u32) -> std::future::Ready<()> + Send + 'static) {
        let fired = Arc::new(AtomicU32::new(0));
        let clone = Arc::clone(&fired);
        (fired, move |_| {
            clone.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let policy = ReconnectPolicy::new(ReconnectOptions::fixed_delay(Duration::from_secs(2)));
        let (fired, callback) = counter();

        let decision = policy.on_link_lost("status 19", callback);
        assert!(matches!(decision, ReconnectDecision::Scheduled(ref a) if a.attempt == 1));
        assert!(policy.is_scheduled());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!policy.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_loss_is_idempotent() {
        let policy = ReconnectPolicy::new(ReconnectOptions::fixed_delay(Duration::from_secs(1)));
        let (fired, first) = counter();
        let (_, second) = counter();

        policy.on_link_lost("a", first);
        assert!(matches!(
            policy.on_link_lost("b", second),
            ReconnectDecision::AlreadyScheduled
        ));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let policy = ReconnectPolicy::new(ReconnectOptions::fixed_delay(Duration::from_secs(1)));
        let (fired, callback) = counter();

        policy.on_link_lost("lost", callback);
        policy.cancel();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let (_, again) = counter();
        assert!(matches!(policy.on_link_lost("lost", again), ReconnectDecision::Closed));

        policy.reopen();
        let (_, after) = counter();
        assert!(matches!(policy.on_link_lost("lost", after), ReconnectDecision::Scheduled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_and_reset() {
        let policy = ReconnectPolicy::new(
            ReconnectOptions::fixed_delay(Duration::from_millis(10)).max_attempts(2),
        );

        for _ in 0..2 {
            let (_, callback) = counter();
            assert!(matches!(policy.on_link_lost("x", callback), ReconnectDecision::Scheduled(_)));
            sleep(Duration::from_millis(20)).await;
        }

        let (_, callback) = counter();
        assert!(matches!(
            policy.on_link_lost("x", callback),
            ReconnectDecision::Exhausted { attempts: 2 }
        ));

        policy.reset();
        let (_, callback) = counter();
        assert!(matches!(policy.on_link_lost("x", callback), ReconnectDecision::Scheduled(_)));
    }
}
