use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::UserId;

const CHANNEL_CAPACITY: usize = 256;

/// A user-facing message about an appointment transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: UserId,
    pub title: String,
    pub body: String,
    pub appointment: Option<Ulid>,
}

impl Notification {
    pub fn new(recipient: UserId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient,
            title: title.into(),
            body: body.into(),
            appointment: None,
        }
    }

    pub fn about(mut self, appointment: Ulid) -> Self {
        self.appointment = Some(appointment);
        self
    }
}

/// Broadcast hub for notifications, one channel per recipient plus a firehose
/// for dispatchers that forward everything (push, email).
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, recipient: UserId) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Fire-and-forget. No-op if nobody is listening. A recipient channel whose
    /// last subscriber has gone away is dropped here.
    pub fn send(&self, notification: Notification) {
        metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL).increment(1);
        let recipient = notification.recipient;
        let orphaned = match self.channels.get(&recipient) {
            Some(sender) => sender.send(notification.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.channels
                .remove_if(&recipient, |_, sender| sender.receiver_count() == 0);
        }
        let _ = self.all.send(notification);
    }

    /// Drop every recipient channel nobody listens to. Returns how many went.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }
}
