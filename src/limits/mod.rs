// src/limits/mod.rs
// Multi-scope rate limiter: six rolling windows per scope plus a burst
// bucket on requests-per-minute, with post-hoc token finalization

mod window;

pub use window::RollingWindow;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{RateLimitConfig, RateLimitSettings, ScopeKey};
use crate::error::RateLimitError;

const RESERVE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(500);

/// A provisional charge awaiting reconciliation against actual usage.
#[derive(Debug, Clone)]
struct Reservation {
    estimated_tokens: i64,
    issued_at: Instant,
}

struct ScopeState {
    config: RateLimitConfig,
    requests: [RollingWindow; 3],
    tokens: [RollingWindow; 3],
    burst: Option<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ScopeState {
    fn new(config: RateLimitConfig) -> Self {
        let burst = match (config.requests_per_minute, config.burst_size) {
            (Some(rpm), burst) if rpm > 0 => {
                let burst = burst.unwrap_or(rpm).min(rpm).max(1);
                let quota = Quota::per_minute(NonZeroU32::new(rpm.min(u32::MAX as u64) as u32).unwrap())
                    .allow_burst(NonZeroU32::new(burst.min(u32::MAX as u64) as u32).unwrap());
                Some(GovRateLimiter::direct(quota))
            }
            _ => None,
        };

        Self {
            config,
            requests: [RollingWindow::minute(), RollingWindow::hour(), RollingWindow::day()],
            tokens: [RollingWindow::minute(), RollingWindow::hour(), RollingWindow::day()],
            burst,
        }
    }

    fn request_limits(&self) -> [Option<u64>; 3] {
        [
            self.config.requests_per_minute,
            self.config.requests_per_hour,
            self.config.requests_per_day,
        ]
    }

    fn token_limits(&self) -> [Option<u64>; 3] {
        [
            self.config.tokens_per_minute,
            self.config.tokens_per_hour,
            self.config.tokens_per_day,
        ]
    }

    /// Check every active window plus the burst bucket; on success the
    /// consumption is recorded and `Ok` is returned. On a miss nothing is
    /// recorded and the earliest retry instant comes back.
    fn try_consume(&mut self, estimated_tokens: i64, now: Instant) -> Result<(), Instant> {
        let mut earliest: Option<Instant> = None;
        let mut track = |result: Result<(), Instant>| {
            if let Err(at) = result {
                earliest = Some(match earliest {
                    Some(current) => current.min(at),
                    None => at,
                });
            }
        };

        let request_limits = self.request_limits();
        for (window, limit) in self.requests.iter_mut().zip(request_limits) {
            if let Some(limit) = limit {
                track(window.admit_at(1, limit, now));
            }
        }
        let token_limits = self.token_limits();
        for (window, limit) in self.tokens.iter_mut().zip(token_limits) {
            if let Some(limit) = limit {
                track(window.admit_at(estimated_tokens, limit, now));
            }
        }

        if let Some(at) = earliest {
            return Err(at);
        }

        if let Some(burst) = &self.burst {
            if let Err(not_until) = burst.check() {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                return Err(now + wait);
            }
        }

        for (window, limit) in self.requests.iter_mut().zip(request_limits) {
            if limit.is_some() {
                window.consume(1, now);
            }
        }
        for (window, limit) in self.tokens.iter_mut().zip(token_limits) {
            if limit.is_some() {
                window.consume(estimated_tokens, now);
            }
        }
        Ok(())
    }

    /// Undo a recorded consumption after a later scope denied.
    fn rollback(&mut self, estimated_tokens: i64, now: Instant) {
        let request_limits = self.request_limits();
        for (window, limit) in self.requests.iter_mut().zip(request_limits) {
            if limit.is_some() {
                window.consume(-1, now);
            }
        }
        let token_limits = self.token_limits();
        for (window, limit) in self.tokens.iter_mut().zip(token_limits) {
            if limit.is_some() {
                window.consume(-estimated_tokens, now);
            }
        }
    }

    fn adjust_tokens(&mut self, delta: i64, now: Instant) {
        let token_limits = self.token_limits();
        for (window, limit) in self.tokens.iter_mut().zip(token_limits) {
            if limit.is_some() {
                window.consume(delta, now);
            }
        }
    }

    fn denied_field(&self) -> Option<&'static str> {
        if self.config.requests_per_minute == Some(0) {
            return Some("requests_per_minute");
        }
        if self.config.requests_per_hour == Some(0) {
            return Some("requests_per_hour");
        }
        if self.config.requests_per_day == Some(0) {
            return Some("requests_per_day");
        }
        if self.config.tokens_per_minute == Some(0) {
            return Some("tokens_per_minute");
        }
        if self.config.tokens_per_hour == Some(0) {
            return Some("tokens_per_hour");
        }
        if self.config.tokens_per_day == Some(0) {
            return Some("tokens_per_day");
        }
        None
    }
}

/// Process-global limiter. One lock per scope key; locks are never held
/// across the admission sleep.
pub struct RateLimiter {
    settings: Arc<RateLimitSettings>,
    scopes: Mutex<HashMap<String, Arc<Mutex<ScopeState>>>>,
    pending: Mutex<HashMap<(String, String), VecDeque<Reservation>>>,
    reserve_timeout: Duration,
}

impl RateLimiter {
    pub fn new(settings: Arc<RateLimitSettings>) -> Self {
        Self {
            settings,
            scopes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            reserve_timeout: RESERVE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &Arc<RateLimitSettings> {
        &self.settings
    }

    /// Reserve one request and `estimated_tokens` tokens across every
    /// applicable scope, most specific first. Sleeps until the earliest
    /// admitting window, bounded by the reserve timeout.
    pub async fn check_and_reserve(
        &self,
        provider: &str,
        model: &str,
        estimated_tokens: i64,
    ) -> Result<(), RateLimitError> {
        let scopes = self.settings.scopes_to_check(provider, model);
        if scopes.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.reserve_timeout;
        loop {
            let now = Instant::now();
            match self.try_reserve_all(&scopes, estimated_tokens, now)? {
                Ok(()) => {
                    self.pending
                        .lock()
                        .entry((provider.to_string(), model.to_string()))
                        .or_default()
                        .push_back(Reservation {
                            estimated_tokens,
                            issued_at: now,
                        });
                    debug!(
                        provider = %provider,
                        model = %model,
                        estimated_tokens,
                        "Rate limit reservation granted"
                    );
                    return Ok(());
                }
                Err(admit_at) => {
                    if admit_at >= deadline {
                        let waited = now.duration_since(deadline - self.reserve_timeout);
                        return Err(RateLimitError::Timeout {
                            scope: format!("{provider}:{model}"),
                            waited_secs: waited.as_secs_f64(),
                        });
                    }
                    let sleep_for = admit_at
                        .saturating_duration_since(now)
                        .min(MAX_SLEEP_SLICE)
                        .max(Duration::from_millis(10));
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }

    /// Reconcile the oldest outstanding reservation for this
    /// provider/model against the provider-reported token count. A
    /// negative delta credits capacity back.
    pub fn finalize_tokens(&self, provider: &str, model: &str, actual_tokens: i64) {
        let reservation = {
            let mut pending = self.pending.lock();
            pending
                .get_mut(&(provider.to_string(), model.to_string()))
                .and_then(|queue| queue.pop_front())
        };

        let Some(reservation) = reservation else {
            debug!(provider = %provider, model = %model, "finalize_tokens without reservation");
            return;
        };

        let delta = actual_tokens - reservation.estimated_tokens;
        if delta == 0 {
            return;
        }

        let now = Instant::now();
        for (key, _) in self.settings.scopes_to_check(provider, model) {
            if let Some(scope) = self.scopes.lock().get(&key.to_string()).cloned() {
                scope.lock().adjust_tokens(delta, now);
            }
        }
        info!(
            provider = %provider,
            model = %model,
            estimated = reservation.estimated_tokens,
            actual = actual_tokens,
            delta,
            age_ms = reservation.issued_at.elapsed().as_millis() as u64,
            "Finalized token reservation"
        );
    }

    /// Drop accumulated usage for a scope (or all scopes).
    pub fn reset_scope(&self, provider: Option<&str>, model: Option<&str>) {
        let mut scopes = self.scopes.lock();
        match (provider, model) {
            (Some(provider), Some(model)) => {
                scopes.remove(
                    &ScopeKey::Model {
                        provider: provider.to_string(),
                        model: model.to_string(),
                    }
                    .to_string(),
                );
            }
            (Some(provider), None) => {
                scopes.remove(&ScopeKey::Provider(provider.to_string()).to_string());
            }
            _ => scopes.clear(),
        }
    }

    /// One pass over every scope: consume in order, rolling back earlier
    /// scopes when a later one denies. The outer `Result` is a hard
    /// denial (a field configured to 0); the inner `Err` is a retry time.
    #[allow(clippy::type_complexity)]
    fn try_reserve_all(
        &self,
        scopes: &[(ScopeKey, RateLimitConfig)],
        estimated_tokens: i64,
        now: Instant,
    ) -> Result<Result<(), Instant>, RateLimitError> {
        let mut reserved: Vec<Arc<Mutex<ScopeState>>> = Vec::with_capacity(scopes.len());

        for (key, config) in scopes {
            let scope = self.scope_state(key, config);
            let mut state = scope.lock();

            if let Some(field) = state.denied_field() {
                drop(state);
                for done in &reserved {
                    done.lock().rollback(estimated_tokens, now);
                }
                return Err(RateLimitError::Denied {
                    scope: key.to_string(),
                    field,
                });
            }

            match state.try_consume(estimated_tokens, now) {
                Ok(()) => {
                    drop(state);
                    reserved.push(scope);
                }
                Err(admit_at) => {
                    drop(state);
                    for done in &reserved {
                        done.lock().rollback(estimated_tokens, now);
                    }
                    return Ok(Err(admit_at));
                }
            }
        }

        Ok(Ok(()))
    }

    fn scope_state(&self, key: &ScopeKey, config: &RateLimitConfig) -> Arc<Mutex<ScopeState>> {
        let mut scopes = self.scopes.lock();
        let entry = scopes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ScopeState::new(config.clone()))));

        // Configuration can change at runtime; rebuild the scope when the
        // effective limits differ, dropping its accumulated usage.
        {
            let state = entry.lock();
            if state.config != *config {
                drop(state);
                warn!(scope = %key, "Rate limit config changed, resetting scope usage");
                *entry = Arc::new(Mutex::new(ScopeState::new(config.clone())));
            }
        }
        entry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(
        provider: &str,
        model: &str,
        config: RateLimitConfig,
    ) -> RateLimiter {
        let settings = Arc::new(RateLimitSettings::new());
        settings
            .set_override(Some(provider), Some(model), config, false)
            .unwrap();
        RateLimiter::new(settings).with_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn unlimited_scopes_always_admit() {
        let limiter = RateLimiter::new(Arc::new(RateLimitSettings::new()));
        limiter
            .check_and_reserve("openrouter", "m", 10_000)
            .await
            .expect("no configured limits means no gate");
    }

    #[tokio::test]
    async fn token_window_blocks_until_timeout() {
        let limiter = limiter_with(
            "p",
            "m",
            RateLimitConfig {
                tokens_per_minute: Some(100),
                ..Default::default()
            },
        );

        limiter.check_and_reserve("p", "m", 80).await.unwrap();
        let err = limiter.check_and_reserve("p", "m", 80).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
    }

    #[tokio::test]
    async fn finalize_credits_back_unused_estimate() {
        let limiter = limiter_with(
            "p",
            "m",
            RateLimitConfig {
                tokens_per_minute: Some(100),
                ..Default::default()
            },
        );

        limiter.check_and_reserve("p", "m", 90).await.unwrap();
        // Actual usage was far below the estimate; the credit frees room
        limiter.finalize_tokens("p", "m", 10);
        limiter
            .check_and_reserve("p", "m", 80)
            .await
            .expect("credited capacity should admit");
    }

    #[tokio::test]
    async fn zero_limit_denies_immediately() {
        let limiter = limiter_with(
            "p",
            "m",
            RateLimitConfig {
                requests_per_minute: Some(0),
                tokens_per_minute: Some(100),
                ..Default::default()
            },
        );

        let err = limiter.check_and_reserve("p", "m", 1).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Denied { .. }));
    }

    #[test]
    fn governor_clock_is_monotonic() {
        // Sanity: the burst bucket's wait_time math relies on this clock
        let clock = DefaultClock::default();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
