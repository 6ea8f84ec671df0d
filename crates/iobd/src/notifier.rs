//! Bundled [`Notifier`] that writes deliveries to the log.

use async_trait::async_trait;
use tracing::info;

use iob_core::{Notification, Notifier, NotifyError};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if notification.message.trim().is_empty() {
            return Err(NotifyError::Rejected("empty message".to_string()));
        }

        let transaction_id = notification
            .transaction_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        for delivery in &notification.deliveries {
            info!(
                kind = ?notification.kind,
                organization_id = %notification.organization_id,
                transaction_id = %transaction_id,
                method = ?delivery.method,
                to = %delivery.to,
                "Notification delivered"
            );
        }

        if notification.deliveries.is_empty() {
            info!(
                kind = ?notification.kind,
                organization_id = %notification.organization_id,
                transaction_id = %transaction_id,
                user_id = ?notification.user_id,
                message = %notification.message,
                "Notification for owner"
            );
        }

        Ok(())
    }
}
