pub mod models;

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use self::models::EarnedBadge;
use crate::error::AppResult;
use crate::store::RecordStore;

/// Localized text columns may hold a JSON-encoded string instead of an
/// object. Anything that does not parse is returned as stored.
fn decode_localized(value: Value) -> Value {
    match value {
        Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
            Ok(decoded) if decoded.is_object() => decoded,
            _ => Value::String(encoded),
        },
        other => other,
    }
}

/// Badges a user has earned, in award order
pub async fn earned_badges(store: &dyn RecordStore, user_id: Uuid) -> AppResult<Vec<EarnedBadge>> {
    let awards = store.user_badges(user_id).await?;
    if awards.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = awards.iter().map(|a| a.badge_id).collect();
    let mut badges: HashMap<Uuid, _> = store
        .badges_by_ids(&ids)
        .await?
        .into_iter()
        .map(|b| (b.id, b))
        .collect();

    let earned: Vec<EarnedBadge> = awards
        .into_iter()
        .filter_map(|award| {
            let Some(badge) = badges.remove(&award.badge_id) else {
                warn!("User {} holds unknown badge {}", user_id, award.badge_id);
                return None;
            };
            Some(EarnedBadge {
                id: badge.id,
                name: decode_localized(badge.name),
                description: decode_localized(badge.description),
                icon: badge.icon,
                rarity: badge.rarity,
                xp_reward: badge.xp_reward,
                achieved_at: award.achieved_at,
            })
        })
        .collect();

    debug!("User {} has {} badges", user_id, earned.len());
    Ok(earned)
}
