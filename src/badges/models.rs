use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// `user_badges` row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserBadgeRow {
    pub badge_id: Uuid,
    pub achieved_at: Option<DateTime<Utc>>,
}

/// `badges` row. `name` and `description` hold localized objects, but older
/// rows store them as JSON-encoded strings.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BadgeRow {
    pub id: Uuid,
    pub name: serde_json::Value,
    pub description: serde_json::Value,
    pub icon: Option<String>,
    pub rarity: Option<String>,
    pub xp_reward: Option<i32>,
}

/// Badge earned by a user, as returned to the profile page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EarnedBadge {
    pub id: Uuid,
    pub name: serde_json::Value,
    pub description: serde_json::Value,
    pub icon: Option<String>,
    pub rarity: Option<String>,
    pub xp_reward: Option<i32>,
    pub achieved_at: Option<DateTime<Utc>>,
}
