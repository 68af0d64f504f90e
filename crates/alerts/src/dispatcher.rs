//! Notification dispatcher.
//!
//! Every channel of a trigger event is attempted independently and in
//! parallel. A transient failure gets exactly one retry on the same channel;
//! nothing a channel does affects its siblings.

use crate::channel::{DeliveryChannel, DeliveryError, Notification, SendOutcome};
use crate::config::EngineConfig;
use crate::db::Database;
use chrono::Utc;
use futures_util::future::join_all;
use sentinel_core::{Channel, DeliveryAttempt, DeliveryState, TriggerEvent, UserProfile};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Routes trigger events to the registered delivery channels.
pub struct Dispatcher {
    db: Database,
    channels: HashMap<Channel, Arc<dyn DeliveryChannel>>,
    delivery_timeout: Duration,
    retry_delay: Duration,
}

impl Dispatcher {
    pub fn new(db: Database, config: &EngineConfig) -> Self {
        Self {
            db,
            channels: HashMap::new(),
            delivery_timeout: config.delivery_timeout,
            retry_delay: config.retry_delay,
        }
    }

    /// Register a channel, replacing any previous one of the same kind.
    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.register(channel);
        self
    }

    pub fn register(&mut self, channel: Arc<dyn DeliveryChannel>) {
        self.channels.insert(channel.kind(), channel);
    }

    pub fn has_channel(&self, kind: Channel) -> bool {
        self.channels.contains_key(&kind)
    }

    /// Deliver one trigger event on every channel it names.
    ///
    /// Returns one attempt per channel, in channel order.
    pub async fn dispatch(&self, event: &TriggerEvent, profile: &UserProfile) -> Vec<DeliveryAttempt> {
        let notification = Notification::new(event.clone(), profile.clone());
        let attempts = join_all(
            event
                .channels
                .iter()
                .map(|channel| self.deliver(*channel, &notification)),
        )
        .await;

        let sent = attempts.iter().filter(|a| a.is_sent()).count();
        info!(
            trigger_id = event.id,
            rule_id = event.rule_id,
            channels = attempts.len(),
            sent = sent,
            "Dispatched trigger"
        );
        attempts
    }

    async fn deliver(&self, kind: Channel, notification: &Notification) -> DeliveryAttempt {
        let trigger_id = notification.event.id;
        let mut attempt = DeliveryAttempt::pending(trigger_id, kind);

        match self.db.begin_delivery(trigger_id, kind).await {
            Ok(id) => attempt.id = id,
            Err(e) => error!(
                trigger_id = trigger_id,
                channel = %kind,
                error = %e,
                "Failed to record pending delivery"
            ),
        }

        attempt.state = match self.channels.get(&kind) {
            Some(channel) => self.attempt_with_retry(channel.as_ref(), notification, &mut attempt.tries).await,
            None => DeliveryState::Failed {
                reason: "channel not configured".to_string(),
            },
        };
        attempt.updated_at = Utc::now();

        if let DeliveryState::Failed { reason } = &attempt.state {
            error!(
                trigger_id = trigger_id,
                channel = %kind,
                tries = attempt.tries,
                error = %reason,
                "Delivery failed"
            );
        }

        if attempt.id > 0 {
            if let Err(e) = self.db.finish_delivery(&attempt).await {
                error!(
                    trigger_id = trigger_id,
                    channel = %kind,
                    error = %e,
                    "Failed to record delivery outcome"
                );
            }
        }
        attempt
    }

    async fn attempt_with_retry(
        &self,
        channel: &dyn DeliveryChannel,
        notification: &Notification,
        tries: &mut u8,
    ) -> DeliveryState {
        *tries += 1;
        let first = self.send_once(channel, notification).await;
        let result = match first {
            Err(e) if e.is_transient() => {
                warn!(
                    trigger_id = notification.event.id,
                    channel = %channel.kind(),
                    error = %e,
                    "Transient delivery failure, retrying once"
                );
                tokio::time::sleep(self.retry_delay).await;
                *tries += 1;
                self.send_once(channel, notification).await
            }
            other => other,
        };

        match result {
            Ok(SendOutcome::Delivered) => DeliveryState::Sent,
            Ok(SendOutcome::Skipped(reason)) => DeliveryState::Skipped { reason },
            Err(e) => DeliveryState::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn send_once(
        &self,
        channel: &dyn DeliveryChannel,
        notification: &Notification,
    ) -> Result<SendOutcome, DeliveryError> {
        match tokio::time::timeout(self.delivery_timeout, channel.send(notification)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        }
    }
}
