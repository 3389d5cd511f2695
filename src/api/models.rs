use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::badges::models::EarnedBadge;
use crate::fines::models::ChallengeSummary;

// ========== REQUEST MODELS ==========

/// Ad-hoc reconciliation trigger. An empty challenge list always runs.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub challenges: Vec<ChallengeSummary>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub store_reachable: bool,
    pub instance_id: Uuid,
    pub active_sessions: usize,
    pub passes_in_flight: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionResponse {
    pub user_id: Uuid,
    pub active: bool,
    /// false when the request did not change anything
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct BadgesResponse {
    pub user_id: Uuid,
    pub badges: Vec<EarnedBadge>,
}
