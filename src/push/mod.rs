// Push notifications
//
// Subscriptions are stored by the web client; delivery is relayed through a
// separate push server that holds the VAPID keys.

pub mod sender;
pub mod subscription;

pub use sender::{HttpPushSender, PushSender};
pub use subscription::{valid_subscriptions, NotificationPayload};
