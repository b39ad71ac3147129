//! Fire-and-forget delivery of lifecycle events.
//!
//! The tracker publishes one lightweight event per transition (and per
//! price update); delivery to connected clients is someone else's job.
//! Publish failures are logged and never block the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One published lifecycle event.
#[derive(Debug, Clone)]
pub struct Notification {
    pub user_id: String,
    pub event: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget publish contract.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, user_id: &str, event: &str, payload: Value);
}

/// Notifier that writes events to the structured log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, user_id: &str, event: &str, payload: Value) {
        info!(
            target: "lifecycle_event",
            user = %user_id,
            %event,
            payload = %payload,
            "Lifecycle event"
        );
    }
}

/// Notifier that forwards events over an unbounded channel.
///
/// Used by the websocket bridge and by tests that assert on the event
/// stream. A closed receiver downgrades to a log line.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn publish(&self, user_id: &str, event: &str, payload: Value) {
        let notification = Notification {
            user_id: user_id.to_string(),
            event: event.to_string(),
            payload,
            at: Utc::now(),
        };

        if self.tx.send(notification).is_err() {
            warn!(user = %user_id, %event, "Notification receiver dropped, event discarded");
        } else {
            debug!(user = %user_id, %event, "Notification queued");
        }
    }
}
