use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// Fine status as stored in `fines.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FineStatus {
    Pending,
}

impl FineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FineStatus::Pending => "pending",
        }
    }
}

/// Fine origin as stored in `fines.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FineType {
    Challenge,
}

impl FineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FineType::Challenge => "challenge",
        }
    }
}

/// A fine that should be created once the challenge winner is known
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChallengeFineCandidate {
    pub id: Uuid,
    pub challenge_id: Uuid,
    /// Whoever the client guessed would be the sender; the winner replaces it
    pub sender_id: Uuid,
    pub sender_name: Option<String>,
    pub recipient_id: Uuid,
    pub recipient_name: Option<String>,
    pub recipient_email: Option<String>,
    pub challenge_title: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChallengeParticipant {
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub completed: bool,
}

/// Columns of `users` the reconciler reads
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub language: Option<String>,
}

/// Persisted fine
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Fine {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_phone: String,
    pub recipient_id: Uuid,
    pub recipient_name: Option<String>,
    pub recipient_email: Option<String>,
    pub reason: String,
    pub amount: Decimal,
    pub status: String,
    pub date: DateTime<Utc>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub fine_type: String,
    pub challenge_id: Option<Uuid>,
}

/// Fine to be inserted; the store assigns the id
#[derive(Debug, Clone, Serialize)]
pub struct NewFine {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_phone: String,
    pub recipient_id: Uuid,
    pub recipient_name: Option<String>,
    pub recipient_email: Option<String>,
    pub reason: String,
    pub amount: Decimal,
    pub status: FineStatus,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub fine_type: FineType,
    pub challenge_id: Uuid,
}

impl NewFine {
    pub fn into_fine(self, id: Uuid) -> Fine {
        Fine {
            id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            sender_phone: self.sender_phone,
            recipient_id: self.recipient_id,
            recipient_name: self.recipient_name,
            recipient_email: self.recipient_email,
            reason: self.reason,
            amount: self.amount,
            status: self.status.as_str().to_string(),
            date: self.date,
            fine_type: self.fine_type.as_str().to_string(),
            challenge_id: Some(self.challenge_id),
        }
    }
}

/// Outcome of a conditional fine insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Fine),
    /// A fine with the same (sender, recipient, challenge, type) already exists
    Duplicate,
}

/// Raw `push_subscriptions` row; `subscription` may be an object or a JSON string
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PushSubscriptionRow {
    pub user_id: Uuid,
    pub subscription: serde_json::Value,
}

/// Minimal challenge view sent by clients to gate ad-hoc triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub id: Option<Uuid>,
    pub status: String,
    pub creator_id: Option<Uuid>,
}

impl ChallengeSummary {
    pub fn is_finished_by(&self, user_id: Uuid) -> bool {
        self.status == "finished" && self.creator_id == Some(user_id)
    }
}

/// Reconciliation state of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateState {
    Pending,
    Resolved,
    Failed,
}

impl CandidateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateState::Pending => "pending",
            CandidateState::Resolved => "resolved",
            CandidateState::Failed => "failed",
        }
    }
}
