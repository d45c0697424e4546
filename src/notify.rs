use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ReservationCreated,
    ReservationConfirmed,
    ReservationCancelled,
    ReservationRescheduled,
    ReservationCompleted,
    ReservationNoShow,
    PaymentReceived,
    PaymentFailed,
    PaymentRefunded,
    FundsReleased,
}

impl NotificationKind {
    pub fn label(self) -> &'static str {
        match self {
            NotificationKind::ReservationCreated => "reservation_created",
            NotificationKind::ReservationConfirmed => "reservation_confirmed",
            NotificationKind::ReservationCancelled => "reservation_cancelled",
            NotificationKind::ReservationRescheduled => "reservation_rescheduled",
            NotificationKind::ReservationCompleted => "reservation_completed",
            NotificationKind::ReservationNoShow => "reservation_no_show",
            NotificationKind::PaymentReceived => "payment_received",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::PaymentRefunded => "payment_refunded",
            NotificationKind::FundsReleased => "funds_released",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    App,
    Email,
}

/// One message addressed to one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub channel: Channel,
    pub related_id: Option<Ulid>,
    pub metadata: Option<serde_json::Value>,
}

impl Notification {
    pub fn app(user_id: Ulid, kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            user_id,
            kind,
            title: title.into(),
            body: body.into(),
            channel: Channel::App,
            related_id: None,
            metadata: None,
        }
    }

    pub fn related(mut self, id: Ulid) -> Self {
        self.related_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// JSON body sent to LISTEN subscribers.
    pub fn to_payload(&self) -> String {
        serde_json::json!({
            "kind": self.kind.label(),
            "title": self.title,
            "body": self.body,
            "related_id": self.related_id.map(|id| id.to_string()),
            "metadata": self.metadata,
        })
        .to_string()
    }
}

/// Outbound notification sink. Delivery is fire-and-forget: a failed
/// notification never fails the state change that produced it.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);

    /// Live feed of one user's notifications, when the sink supports it.
    fn listen(&self, _user_id: Ulid) -> Option<broadcast::Receiver<Notification>> {
        None
    }
}

/// Per-user broadcast hub. Listeners subscribe by user id; messages for
/// users nobody listens to are logged and dropped.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn remove(&self, user_id: &Ulid) {
        self.channels.remove(user_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for NotifyHub {
    fn notify(&self, notification: Notification) {
        info!(
            user = %notification.user_id,
            kind = notification.kind.label(),
            related = ?notification.related_id,
            "{}",
            notification.title
        );
        metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "kind" => notification.kind.label())
            .increment(1);
        if let Some(sender) = self.channels.get(&notification.user_id) {
            let _ = sender.send(notification);
        }
    }

    fn listen(&self, user_id: Ulid) -> Option<broadcast::Receiver<Notification>> {
        Some(self.subscribe(user_id))
    }
}
