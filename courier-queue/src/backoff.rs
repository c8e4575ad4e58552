//! Retry delay policies.
//!
//! Strategies are chosen when a job is enqueued and stored on its message, so
//! a retry never has to look a policy up by name at runtime. Names are only
//! parsed while enqueue options are built, where an unknown one is rejected.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::QueueRecord;
use crate::{JobError, QueueError};

/// Base delay of the webhook filter strategy
pub const WEBHOOK_FILTER_BASE: Duration = Duration::from_secs(1);

/// Longest delay any built-in strategy produces
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Waiting on a webhook-gated filter: `2^attempts` seconds, capped
    WebhookFilter,

    /// `base * 2^(attempts - 1)`, capped at `max`
    Exponential { base_ms: u64, max_ms: u64 },

    Fixed { delay_ms: u64 },
}

impl BackoffStrategy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WebhookFilter => "webhook_filter",
            Self::Exponential { .. } => "exponential",
            Self::Fixed { .. } => "fixed",
        }
    }

    /// Delay before the next attempt, given the attempts made so far.
    ///
    /// The error and record are part of the contract so content-aware
    /// strategies can be added; the built-in ones only look at the count.
    pub fn delay(&self, attempts_made: u32, _error: &JobError, _record: &QueueRecord) -> Duration {
        match self {
            Self::WebhookFilter => doubling(WEBHOOK_FILTER_BASE, attempts_made, MAX_BACKOFF),
            Self::Exponential { base_ms, max_ms } => doubling(
                Duration::from_millis(*base_ms),
                attempts_made.saturating_sub(1),
                Duration::from_millis(*max_ms),
            ),
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
        }
    }
}

fn doubling(base: Duration, exponent: u32, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackoffStrategy {
    type Err = QueueError;

    /// Parse a strategy name; parameterized strategies get their defaults.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "webhook_filter" | "webhook_filter_backoff" => Ok(Self::WebhookFilter),
            "exponential" => Ok(Self::exponential(Duration::from_secs(1), MAX_BACKOFF)),
            "fixed" => Ok(Self::fixed(Duration::from_secs(1))),
            _ => Err(QueueError::UnknownBackoffStrategy(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobData, QueueMessage};
    use courier_core::ids::{EnvironmentId, JobId, OrganizationId, SubscriberId};
    use proptest::prelude::*;

    fn record() -> QueueRecord {
        QueueRecord::new(QueueMessage::new(
            JobData {
                job_id: JobId::new(),
                environment_id: EnvironmentId::new(),
                organization_id: OrganizationId::new(),
                subscriber_id: SubscriberId::new(),
            },
            "standard",
        ))
    }

    #[test]
    fn webhook_filter_doubles_per_attempt() {
        let strategy = BackoffStrategy::WebhookFilter;
        let error = JobError::retryable("filter pending");
        let record = record();

        assert_eq!(strategy.delay(1, &error, &record), Duration::from_secs(2));
        assert_eq!(strategy.delay(2, &error, &record), Duration::from_secs(4));
        assert_eq!(strategy.delay(3, &error, &record), Duration::from_secs(8));
        assert_eq!(strategy.delay(40, &error, &record), MAX_BACKOFF);
    }

    #[test]
    fn exponential_starts_at_base() {
        let strategy = BackoffStrategy::exponential(Duration::from_millis(500), Duration::from_secs(3));
        let error = JobError::retryable("busy");
        let record = record();

        assert_eq!(strategy.delay(1, &error, &record), Duration::from_millis(500));
        assert_eq!(strategy.delay(3, &error, &record), Duration::from_secs(2));
        assert_eq!(strategy.delay(4, &error, &record), Duration::from_secs(3));
    }

    #[test]
    fn names_parse_and_unknown_names_are_rejected() {
        assert_eq!(
            "webhook-filter".parse::<BackoffStrategy>().unwrap(),
            BackoffStrategy::WebhookFilter
        );
        assert_eq!("fixed".parse::<BackoffStrategy>().unwrap().name(), "fixed");
        assert_eq!(
            "linear".parse::<BackoffStrategy>(),
            Err(QueueError::UnknownBackoffStrategy("linear".into()))
        );
    }

    #[test]
    fn strategy_survives_json() {
        let strategy = BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(10));
        let raw = serde_json::to_string(&strategy).unwrap();
        assert!(raw.contains("\"type\":\"exponential\""));
        assert_eq!(serde_json::from_str::<BackoffStrategy>(&raw).unwrap(), strategy);
    }

    proptest! {
        #[test]
        fn delays_never_exceed_the_cap(attempts in 0u32..200, base_ms in 1u64..10_000, max_ms in 1u64..100_000) {
            let strategy = BackoffStrategy::Exponential { base_ms, max_ms };
            let delay = strategy.delay(attempts, &JobError::retryable("x"), &record());
            prop_assert!(delay <= Duration::from_millis(max_ms));
            prop_assert!(BackoffStrategy::WebhookFilter.delay(attempts, &JobError::retryable("x"), &record()) <= MAX_BACKOFF);
        }
    }
}
