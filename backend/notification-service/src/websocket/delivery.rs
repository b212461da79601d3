/// Reliable delivery bookkeeping
///
/// Each message sent with `requireAck` gets a `PendingAck` on its connection:
///
/// ```text
/// PENDING(n) --ack--------------------> ACKED      (record removed, timer aborted)
/// PENDING(n) --timer, n < max---------> PENDING(n+1) (resend with retryCount = n+1)
/// PENDING(n) --timer, n == max--------> EXHAUSTED  (record removed, error logged)
/// PENDING(n) --connection closed------> dropped
/// ```
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::AbortHandle;

use super::messages::{events, ServerEnvelope};

const FALLBACK_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Wait before the next timer for a record that has been resent `retry_count` times.
    /// The last entry is reused past the end of the schedule.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let idx = retry_count as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(FALLBACK_DELAY)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(10),
            ],
        )
    }
}

/// Which events are pushed with `requireAck = true`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    ack_events: HashSet<String>,
}

impl DeliveryPolicy {
    pub fn new<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ack_events: events.into_iter().map(Into::into).collect(),
        }
    }

    pub fn requires_ack(&self, event: &str) -> bool {
        self.ack_events.contains(event)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::new([
            events::NOTIFICATION,
            events::RESULT_PUBLISHED,
            events::EXAM_AUTO_SUBMITTED,
        ])
    }
}

/// What a fired retry timer should do with its record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Resend { retry_count: u32 },
    Exhausted,
}

/// Result of handling a fired timer, reported for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Resent { retry_count: u32 },
    Exhausted,
    /// Connection gone or closed; the record was discarded
    Dropped,
    /// Already acknowledged
    Resolved,
}

/// One in-flight message awaiting the client's `ack`
#[derive(Debug)]
pub struct PendingAck {
    pub message_id: String,
    pub event: String,
    pub data: Value,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    timer: Option<AbortHandle>,
}

impl PendingAck {
    pub fn new(envelope: &ServerEnvelope) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            event: envelope.event.clone(),
            data: envelope.data.clone(),
            retry_count: 0,
            created_at: Utc::now(),
            timer: None,
        }
    }

    pub(crate) fn set_timer(&mut self, timer: AbortHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Forget the handle of a timer that has already fired
    pub(crate) fn clear_timer(&mut self) {
        self.timer = None;
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Advance the state machine for a fired timer
    pub fn advance(&mut self, policy: &RetryPolicy) -> RetryStep {
        if self.retry_count >= policy.max_retries {
            RetryStep::Exhausted
        } else {
            self.retry_count += 1;
            RetryStep::Resend {
                retry_count: self.retry_count,
            }
        }
    }

    pub fn resend_envelope(&self) -> ServerEnvelope {
        ServerEnvelope::resend(&self.event, &self.data, &self.message_id, self.retry_count)
    }
}
