//! Rate Governor — client-side admission control for the model service.
//!
//! Tracks consumption per dimension over rolling windows and decides, before a
//! request goes out, whether to send it now or wait for a window to reset.
//! The service's own rate-limit headers refine the local picture when present.
//!
//! One governor is shared (via `Arc`) by every turn talking to the same
//! service; its state sits behind a mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use crate::stream::transport::RateLimitSnapshot;
use crate::stream::types::TokenUsage;

// ─── Config ─────────────────────────────────────────────────────────────────

/// A rate-limited quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateDimension {
    InputTokens,
    OutputTokens,
    TotalTokens,
}

impl RateDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateDimension::InputTokens => "input_tokens",
            RateDimension::OutputTokens => "output_tokens",
            RateDimension::TotalTokens => "total_tokens",
        }
    }

    /// Whether a request's estimated input counts against this dimension.
    fn charges_estimate(&self) -> bool {
        matches!(self, RateDimension::InputTokens | RateDimension::TotalTokens)
    }

    fn consumed_by(&self, usage: &TokenUsage) -> u64 {
        match self {
            RateDimension::InputTokens => usage.input_tokens,
            RateDimension::OutputTokens => usage.output_tokens,
            RateDimension::TotalTokens => usage.total(),
        }
    }
}

impl fmt::Display for RateDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub limit: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

/// Rate governor configuration (`governor:` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Dimensions without an entry are not governed.
    #[serde(default)]
    pub limits: HashMap<RateDimension, WindowLimit>,
    /// Throttle when a request would leave less than this fraction of a limit.
    #[serde(default = "default_threshold_fraction")]
    pub threshold_fraction: f64,
    #[serde(default = "default_backoff_sequence_secs")]
    pub backoff_sequence_secs: Vec<u64>,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_threshold_fraction() -> f64 {
    0.2
}

fn default_backoff_sequence_secs() -> Vec<u64> {
    vec![1, 1, 2, 3, 5, 8, 13, 21, 34]
}

fn default_backoff_cap_secs() -> u64 {
    60
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            threshold_fraction: default_threshold_fraction(),
            backoff_sequence_secs: default_backoff_sequence_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl GovernorConfig {
    pub fn with_limit(mut self, dimension: RateDimension, limit: u64, window_secs: u64) -> Self {
        self.limits.insert(dimension, WindowLimit { limit, window_secs });
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if !(0.0..1.0).contains(&self.threshold_fraction) {
            return Err(AgentError::Config {
                reason: format!(
                    "governor.threshold_fraction must be in [0, 1), got {}",
                    self.threshold_fraction
                ),
            });
        }
        for (dimension, limit) in &self.limits {
            if limit.limit == 0 || limit.window_secs == 0 {
                return Err(AgentError::Config {
                    reason: format!(
                        "governor.limits.{dimension}: limit and window_secs must be positive"
                    ),
                });
            }
        }
        Ok(())
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Decision for a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    WaitUntil(Instant),
}

#[derive(Debug)]
struct RateState {
    limit: u64,
    window: Duration,
    window_start: Instant,
    consumed: u64,
    /// Remaining budget as last reported by the service.
    reported_remaining: Option<u64>,
    /// Window reset as last reported by the service.
    reported_reset: Option<Instant>,
}

impl RateState {
    fn new(limit: &WindowLimit, now: Instant) -> Self {
        Self {
            limit: limit.limit,
            window: Duration::from_secs(limit.window_secs),
            window_start: now,
            consumed: 0,
            reported_remaining: None,
            reported_reset: None,
        }
    }

    fn window_end(&self) -> Instant {
        self.reported_reset
            .unwrap_or(self.window_start + self.window)
    }

    /// Start a fresh window if the current one has expired.
    fn roll(&mut self, now: Instant) {
        if now >= self.window_end() {
            self.window_start = now;
            self.consumed = 0;
            self.reported_remaining = None;
            self.reported_reset = None;
        }
    }

    fn remaining(&self) -> u64 {
        let local = self.limit.saturating_sub(self.consumed);
        self.reported_remaining
            .map_or(local, |reported| reported.min(local))
    }

    fn floor(&self, fraction: f64) -> f64 {
        fraction * self.limit as f64
    }
}

#[derive(Debug)]
struct GovernorState {
    dimensions: HashMap<RateDimension, RateState>,
    /// Throttle decisions since the last `Proceed`.
    consecutive_throttles: u32,
}

// ─── RateGovernor ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RateGovernor {
    threshold_fraction: f64,
    backoff_sequence: Vec<Duration>,
    backoff_cap: Duration,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(config: &GovernorConfig) -> Self {
        let now = Instant::now();
        let dimensions = config
            .limits
            .iter()
            .map(|(dimension, limit)| (*dimension, RateState::new(limit, now)))
            .collect();
        Self {
            threshold_fraction: config.threshold_fraction,
            backoff_sequence: config
                .backoff_sequence_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
            state: Mutex::new(GovernorState {
                dimensions,
                consecutive_throttles: 0,
            }),
        }
    }

    /// A governor that admits everything.
    pub fn unlimited() -> Self {
        Self::new(&GovernorConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        // Every update leaves the state consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Admission ──────────────────────────────────────────────────────

    /// Decide whether a request estimated at `estimated` input tokens may go now.
    pub fn admit(&self, estimated: u64) -> Admission {
        self.admit_at(Instant::now(), estimated)
    }

    pub fn admit_at(&self, now: Instant, estimated: u64) -> Admission {
        let mut state = self.lock();
        let mut reset: Option<Instant> = None;

        for (dimension, rate) in state.dimensions.iter_mut() {
            rate.roll(now);
            let charge = if dimension.charges_estimate() { estimated } else { 0 };
            let remaining = rate.remaining();
            let floor = rate.floor(self.threshold_fraction);
            if (remaining as f64) - (charge as f64) < floor {
                let window_end = rate.window_end();
                tracing::debug!(
                    dimension = %dimension,
                    remaining,
                    estimated = charge,
                    limit = rate.limit,
                    "dimension over admission threshold"
                );
                reset = Some(reset.map_or(window_end, |r| r.max(window_end)));
            }
        }

        let Some(reset) = reset else {
            state.consecutive_throttles = 0;
            return Admission::Proceed;
        };

        state.consecutive_throttles += 1;
        let mut until = reset.max(now);
        if state.consecutive_throttles > 1 {
            let step = self.backoff_delay(state.consecutive_throttles - 2);
            until = until.max(now + step);
        }

        tracing::info!(
            wait_ms = until.saturating_duration_since(now).as_millis() as u64,
            consecutive = state.consecutive_throttles,
            "throttling request"
        );
        Admission::WaitUntil(until)
    }

    /// Fail fast when no window could ever admit the request.
    pub fn check_feasible(&self, estimated: u64) -> Result<(), AgentError> {
        let state = self.lock();
        for (dimension, rate) in &state.dimensions {
            if !dimension.charges_estimate() {
                continue;
            }
            let usable = rate.limit as f64 - rate.floor(self.threshold_fraction);
            if estimated as f64 > usable {
                return Err(AgentError::RateLimitExceeded {
                    dimension: dimension.to_string(),
                    reason: format!(
                        "request needs ~{estimated} tokens but a full window admits at most {}",
                        usable.floor() as u64
                    ),
                });
            }
        }
        Ok(())
    }

    /// Suspend until the request is admitted or `cancel` fires.
    pub async fn wait_for_admission(
        &self,
        estimated: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.check_feasible(estimated)?;
        loop {
            match self.admit(estimated) {
                Admission::Proceed => return Ok(()),
                Admission::WaitUntil(until) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
            }
        }
    }

    /// Delay for the `attempt`-th retry (0-based), bounded by the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let step = self
            .backoff_sequence
            .get(attempt as usize)
            .or(self.backoff_sequence.last())
            .copied()
            .unwrap_or(self.backoff_cap);
        step.min(self.backoff_cap)
    }

    // ─── Accounting ─────────────────────────────────────────────────────

    /// Record what a response actually consumed.
    pub fn record(&self, usage: TokenUsage, resets: &HashMap<RateDimension, Instant>) {
        self.record_at(Instant::now(), usage, resets);
    }

    pub fn record_at(
        &self,
        now: Instant,
        usage: TokenUsage,
        resets: &HashMap<RateDimension, Instant>,
    ) {
        let mut state = self.lock();
        for (dimension, rate) in state.dimensions.iter_mut() {
            rate.roll(now);
            let used = dimension.consumed_by(&usage);
            rate.consumed = rate.consumed.saturating_add(used);
            if let Some(reported) = rate.reported_remaining.as_mut() {
                *reported = reported.saturating_sub(used);
            }
            if let Some(reset) = resets.get(dimension).filter(|reset| **reset > now) {
                rate.reported_reset = Some(*reset);
            }

            let remaining = rate.remaining();
            if (remaining as f64) < rate.floor(self.threshold_fraction) {
                tracing::warn!(
                    dimension = %dimension,
                    remaining,
                    limit = rate.limit,
                    "rate budget below threshold"
                );
            }
        }
    }

    /// Adopt a service-reported remaining budget.
    pub fn observe_remaining(&self, dimension: RateDimension, remaining: u64) {
        let mut state = self.lock();
        match state.dimensions.get_mut(&dimension) {
            Some(rate) => {
                rate.roll(Instant::now());
                rate.reported_remaining = Some(remaining);
            }
            None => tracing::debug!(dimension = %dimension, remaining, "ignoring report for ungoverned dimension"),
        }
    }

    /// Adopt everything the service reported with a response.
    pub fn observe(&self, snapshot: &RateLimitSnapshot) {
        if snapshot.is_empty() {
            return;
        }
        for (dimension, remaining) in &snapshot.remaining {
            self.observe_remaining(*dimension, *remaining);
        }

        let now = Instant::now();
        let wall_now = chrono::Utc::now();
        let resets: HashMap<RateDimension, Instant> = snapshot
            .resets
            .iter()
            .filter_map(|(dimension, at)| {
                let ahead = (*at - wall_now).to_std().ok()?;
                Some((*dimension, now + ahead))
            })
            .collect();
        self.record_at(now, TokenUsage::default(), &resets);
    }

    /// Current remaining budget for `dimension`, if it is governed.
    pub fn remaining(&self, dimension: RateDimension) -> Option<u64> {
        let mut state = self.lock();
        let rate = state.dimensions.get_mut(&dimension)?;
        rate.roll(Instant::now());
        Some(rate.remaining())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
