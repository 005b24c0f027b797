//! Default notifier: structured log records on the notification target.
//!
//! A deployment with a real messaging channel swaps in its own
//! [`Notifier`]; the service already logs every notification it dispatches,
//! so this sink only records delivery.

use crate::service::NOTIFICATION_TARGET;
use certflow_core::collaborators::{CollaboratorError, Notification, Notifier};
use std::future::Future;
use std::pin::Pin;

/// [`Notifier`] that writes each notification to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!(
                target: NOTIFICATION_TARGET,
                application_id = %notification.application.id,
                user_id = %notification.application.user_id,
                target_state = %notification.target_state,
                at = %notification.at,
                "Notification delivered"
            );
            Ok(())
        })
    }
}
