//! In-app delivery: writes to the notification queue.

use crate::channel::{DeliveryChannel, DeliveryError, Notification, SendOutcome};
use crate::db::Database;
use async_trait::async_trait;
use sentinel_core::Channel;
use tracing::debug;

pub struct InAppChannel {
    db: Database,
}

impl InAppChannel {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn kind(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, notification: &Notification) -> Result<SendOutcome, DeliveryError> {
        let trigger_id = (notification.event.id > 0).then_some(notification.event.id);
        let id = self
            .db
            .enqueue_notification(
                &notification.event.user_id,
                trigger_id,
                &notification.title,
                &notification.message,
                &notification.data(),
            )
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        debug!(
            notification_id = id,
            user_id = %notification.event.user_id,
            "Queued in-app notification"
        );
        Ok(SendOutcome::Delivered)
    }
}
