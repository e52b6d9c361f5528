//! Turning request outcomes into proxy health transitions.

use crate::proxy::ProxyRecord;

use rand::Rng;
use std::time::{Duration, SystemTime};

/// Transport-level failure codes that matter to proxy health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The request timed out.
    Timeout,
    /// The connection was reset or aborted mid-flight.
    ConnectionReset,
    /// Name resolution failed in a way that may succeed on retry.
    DnsRetry,
    /// The connection could not be established.
    Connect,
    /// The call was dropped before it finished.
    Cancelled,
    /// Anything else.
    Other,
}

impl ErrorCode {
    /// Timeouts, resets and DNS hiccups.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::ConnectionReset | ErrorCode::DnsRetry)
    }
}

/// What happened to a call made through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success {
        status: u16,
        elapsed: Duration,
    },
    Failure {
        status: Option<u16>,
        code: Option<ErrorCode>,
        elapsed: Duration,
    },
}

impl ReleaseOutcome {
    /// Failure carrying only a status code.
    pub fn status_failure(status: u16, elapsed: Duration) -> Self {
        ReleaseOutcome::Failure { status: Some(status), code: None, elapsed }
    }

    /// Failure carrying only an error code.
    pub fn code_failure(code: ErrorCode, elapsed: Duration) -> Self {
        ReleaseOutcome::Failure { status: None, code: Some(code), elapsed }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReleaseOutcome::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ReleaseOutcome::Success { status, .. } => Some(*status),
            ReleaseOutcome::Failure { status, .. } => *status,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ReleaseOutcome::Success { .. } => None,
            ReleaseOutcome::Failure { code, .. } => *code,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            ReleaseOutcome::Success { elapsed, .. } | ReleaseOutcome::Failure { elapsed, .. } => *elapsed,
        }
    }
}

/// Failure categories, in the order they are tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// 407: the proxy rejected our credentials.
    AuthRequired,
    /// 429 or 403.
    RateLimited,
    /// Timeout, reset or DNS retry.
    Network,
    /// Any 5xx.
    ServerError,
    Other,
}

/// Bounds for a jittered window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub min: Duration,
    pub max: Duration,
}

impl Window {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// A uniformly random duration in `[min, max]`, or `min` when the window is empty.
    pub fn jitter(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

/// The category of a failure and the window it puts the proxy into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: FailureCategory,
    pub window: Window,
}

/// Thresholds and windows used to update proxy health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive failures after which a proxy is declared dead.
    pub dead_threshold: u32,
    pub dead: Window,
    pub rate_limited: Window,
    pub network: Window,
    pub server_error: Window,
    pub other: Window,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        const MIN: u64 = 60;
        Self {
            dead_threshold: 5,
            dead: Window::new(Duration::from_secs(30 * MIN), Duration::from_secs(60 * MIN)),
            rate_limited: Window::new(Duration::from_secs(2 * MIN), Duration::from_secs(10 * MIN)),
            network: Window::new(Duration::from_secs(30), Duration::from_secs(120)),
            server_error: Window::new(Duration::from_secs(10), Duration::from_secs(60)),
            other: Window::new(Duration::from_secs(5), Duration::from_secs(20)),
        }
    }
}

impl HealthPolicy {
    /// Classify a failure outcome. Successes have no category.
    pub fn classify(&self, outcome: &ReleaseOutcome) -> Option<Classification> {
        let (status, code) = match outcome {
            ReleaseOutcome::Success { .. } => return None,
            ReleaseOutcome::Failure { status, code, .. } => (*status, *code),
        };

        let category = match (status, code) {
            (Some(407), _) => FailureCategory::AuthRequired,
            (Some(429 | 403), _) => FailureCategory::RateLimited,
            (_, Some(code)) if code.is_transient() => FailureCategory::Network,
            (Some(s), _) if s >= 500 => FailureCategory::ServerError,
            _ => FailureCategory::Other,
        };

        Some(Classification { category, window: self.window_for(category) })
    }

    /// The window a category puts a proxy into.
    pub fn window_for(&self, category: FailureCategory) -> Window {
        match category {
            FailureCategory::AuthRequired => self.dead,
            FailureCategory::RateLimited => self.rate_limited,
            FailureCategory::Network => self.network,
            FailureCategory::ServerError => self.server_error,
            FailureCategory::Other => self.other,
        }
    }
}

/// Classify with the default policy.
pub fn classify(outcome: &ReleaseOutcome) -> Option<Classification> {
    HealthPolicy::default().classify(outcome)
}

/// Apply a released outcome to `record`.
///
/// Always drops `in_flight` by one (never below zero). Returns the failure
/// category, if the outcome was a failure.
pub fn apply_outcome(
    record: &mut ProxyRecord,
    outcome: &ReleaseOutcome,
    now: SystemTime,
    policy: &HealthPolicy,
) -> Option<FailureCategory> {
    record.in_flight = record.in_flight.saturating_sub(1);

    let Some(classification) = policy.classify(outcome) else {
        record.fail_streak = 0;
        record.success_count += 1;
        return None;
    };

    let until = now + classification.window.jitter();
    match classification.category {
        FailureCategory::AuthRequired => record.dead_until = until,
        _ => record.cool_down_until = until,
    }

    record.fail_streak += 1;
    if record.fail_streak >= policy.dead_threshold {
        record.dead_until = now + policy.dead.jitter();
    }

    Some(classification.category)
}
