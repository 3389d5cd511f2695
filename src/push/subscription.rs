use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::fines::models::PushSubscriptionRow;

/// Web-push subscription that passed shape validation. `raw` is forwarded to
/// the push server untouched so extra fields such as `expirationTime` survive.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidSubscription {
    pub endpoint: String,
    pub raw: Value,
}

#[derive(Debug, Deserialize)]
struct SubscriptionShape {
    endpoint: Option<String>,
    keys: Option<SubscriptionKeys>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionKeys {
    auth: Option<String>,
    p256dh: Option<String>,
}

/// Notification content sent alongside the subscription
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.is_empty()).unwrap_or(false)
}

/// Accepts a subscription stored either as a JSON object or as a JSON-encoded
/// string. Returns `None` for anything malformed or missing `endpoint`,
/// `keys.auth` or `keys.p256dh`.
pub fn parse_subscription(stored: &Value) -> Option<ValidSubscription> {
    let raw = match stored {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded).ok()?,
        Value::Object(_) => stored.clone(),
        _ => return None,
    };

    let shape: SubscriptionShape = serde_json::from_value(raw.clone()).ok()?;
    let keys = shape.keys?;
    if !non_empty(&shape.endpoint) || !non_empty(&keys.auth) || !non_empty(&keys.p256dh) {
        return None;
    }

    Some(ValidSubscription {
        endpoint: shape.endpoint?,
        raw,
    })
}

/// Parse every row, silently dropping malformed entries
pub fn valid_subscriptions(rows: &[PushSubscriptionRow]) -> Vec<ValidSubscription> {
    rows.iter()
        .filter_map(|row| {
            let parsed = parse_subscription(&row.subscription);
            if parsed.is_none() {
                debug!("Discarding malformed push subscription for {}", row.user_id);
            }
            parsed
        })
        .collect()
}
