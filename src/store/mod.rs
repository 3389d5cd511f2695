// Record store seam
//
// The reconciler only ever talks to the hosted database through this trait.
// `PgRecordStore` is the production backend; `InMemoryStore` mirrors its
// semantics for local runs and tests.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::badges::models::{BadgeRow, UserBadgeRow};
use crate::error::AppResult;
use crate::fines::models::{
    CandidateState, ChallengeFineCandidate, ChallengeParticipant, InsertOutcome, NewFine,
    PushSubscriptionRow, UserProfile,
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unresolved candidates whose `sender_id` is the given user
    async fn pending_candidates(&self, sender_id: Uuid) -> AppResult<Vec<ChallengeFineCandidate>>;

    /// Distinct senders that still have unresolved candidates
    async fn senders_with_pending_candidates(&self) -> AppResult<Vec<Uuid>>;

    /// First completed participant of the challenge other than `excluded_user`
    async fn find_winner(
        &self,
        challenge_id: Uuid,
        excluded_user: Uuid,
    ) -> AppResult<Option<ChallengeParticipant>>;

    async fn user_profile(&self, user_id: Uuid) -> AppResult<Option<UserProfile>>;

    async fn fine_exists(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        challenge_id: Uuid,
    ) -> AppResult<bool>;

    /// Insert unless a fine with the same (sender, recipient, challenge, type) exists
    async fn insert_fine(&self, fine: NewFine) -> AppResult<InsertOutcome>;

    async fn push_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<PushSubscriptionRow>>;

    async fn mark_candidate_resolved(&self, candidate_id: Uuid) -> AppResult<()>;

    /// Bump the attempt counter; returns `Failed` once `max_attempts` is reached.
    /// `max_attempts == 0` disables dead-lettering.
    async fn record_candidate_failure(
        &self,
        candidate_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> AppResult<CandidateState>;

    /// Take (or renew) the per-user reconciliation lease
    async fn try_acquire_lease(&self, user_id: Uuid, holder: Uuid, ttl: Duration)
        -> AppResult<bool>;

    async fn release_lease(&self, user_id: Uuid, holder: Uuid) -> AppResult<()>;

    async fn user_badges(&self, user_id: Uuid) -> AppResult<Vec<UserBadgeRow>>;

    async fn badges_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<BadgeRow>>;

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
