//! Per-channel delivery attempts.

use crate::rule::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of one (trigger, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    /// Terminal for this cycle.
    Failed { reason: String },
    /// Not delivered by policy (quiet hours, email disabled, no address).
    Skipped { reason: String },
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Failed { .. } => "failed",
            DeliveryState::Skipped { .. } => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DeliveryState::Failed { reason } | DeliveryState::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

/// One delivery attempt record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Database ID (0 when not persisted).
    pub id: i64,
    pub trigger_id: i64,
    pub channel: Channel,
    pub state: DeliveryState,
    /// Send calls made, including the retry.
    pub tries: u8,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn pending(trigger_id: i64, channel: Channel) -> Self {
        Self {
            id: 0,
            trigger_id,
            channel,
            state: DeliveryState::Pending,
            tries: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.state == DeliveryState::Sent
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, DeliveryState::Failed { .. })
    }
}
