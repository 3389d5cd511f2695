use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::RecordStore;
use crate::badges::models::{BadgeRow, UserBadgeRow};
use crate::error::{AppError, AppResult};
use crate::fines::models::{
    CandidateState, ChallengeFineCandidate, ChallengeParticipant, Fine, InsertOutcome, NewFine,
    PushSubscriptionRow, UserProfile,
};

/// Postgres-backed record store
pub struct PgRecordStore {
    pub pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// The attempt limit as the `INTEGER` the state table stores
pub(crate) fn attempts_limit(max_attempts: u32) -> AppResult<i32> {
    i32::try_from(max_attempts).map_err(|_| {
        AppError::Config(format!(
            "max_candidate_attempts {} exceeds {}",
            max_attempts,
            i32::MAX
        ))
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    // ========== CANDIDATES ==========

    async fn pending_candidates(&self, sender_id: Uuid) -> AppResult<Vec<ChallengeFineCandidate>> {
        let candidates = sqlx::query_as::<_, ChallengeFineCandidate>(
            r#"
            SELECT c.id, c.challenge_id, c.sender_id, c.sender_name, c.recipient_id,
                   c.recipient_name, c.recipient_email, c.challenge_title, c.amount
            FROM challenge_fines_candidates c
            LEFT JOIN challenge_fine_candidate_state s ON s.candidate_id = c.id
            WHERE c.sender_id = $1 AND COALESCE(s.state, 'pending') = 'pending'
            "#,
        )
        .bind(sender_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(candidates)
    }

    async fn senders_with_pending_candidates(&self) -> AppResult<Vec<Uuid>> {
        let senders = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT c.sender_id
            FROM challenge_fines_candidates c
            LEFT JOIN challenge_fine_candidate_state s ON s.candidate_id = c.id
            WHERE COALESCE(s.state, 'pending') = 'pending'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(senders)
    }

    async fn mark_candidate_resolved(&self, candidate_id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO challenge_fine_candidate_state (candidate_id, state, attempts, updated_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (candidate_id) DO UPDATE
            SET state = EXCLUDED.state, updated_at = NOW()
            "#,
        )
        .bind(candidate_id)
        .bind(CandidateState::Resolved.as_str())
        .execute(&self.pool)
        .await?;

        debug!("Candidate {} marked resolved", candidate_id);
        Ok(())
    }

    async fn record_candidate_failure(
        &self,
        candidate_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> AppResult<CandidateState> {
        let max_attempts = attempts_limit(max_attempts)?;
        let state: String = sqlx::query_scalar(
            r#"
            INSERT INTO challenge_fine_candidate_state
                (candidate_id, state, attempts, last_error, updated_at)
            VALUES (
                $1,
                CASE WHEN $3 > 0 AND 1 >= $3 THEN 'failed' ELSE 'pending' END,
                1, $2, NOW()
            )
            ON CONFLICT (candidate_id) DO UPDATE SET
                attempts = challenge_fine_candidate_state.attempts + 1,
                last_error = EXCLUDED.last_error,
                state = CASE
                    WHEN $3 > 0 AND challenge_fine_candidate_state.attempts + 1 >= $3
                        THEN 'failed'
                    ELSE 'pending'
                END,
                updated_at = NOW()
            RETURNING state
            "#,
        )
        .bind(candidate_id)
        .bind(error)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        match state.as_str() {
            "failed" => Ok(CandidateState::Failed),
            "pending" => Ok(CandidateState::Pending),
            other => Err(AppError::Internal(format!(
                "Unexpected candidate state: {}",
                other
            ))),
        }
    }

    // ========== CHALLENGES & USERS ==========

    async fn find_winner(
        &self,
        challenge_id: Uuid,
        excluded_user: Uuid,
    ) -> AppResult<Option<ChallengeParticipant>> {
        let winner = sqlx::query_as::<_, ChallengeParticipant>(
            r#"
            SELECT challenge_id, user_id, completed
            FROM challenge_participants
            WHERE challenge_id = $1 AND completed = TRUE AND user_id <> $2
            LIMIT 1
            "#,
        )
        .bind(challenge_id)
        .bind(excluded_user)
        .fetch_optional(&self.pool)
        .await?;

        Ok(winner)
    }

    async fn user_profile(&self, user_id: Uuid) -> AppResult<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, username, email, phone, language
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    // ========== FINES ==========

    async fn fine_exists(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        challenge_id: Uuid,
    ) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM fines
                WHERE sender_id = $1 AND recipient_id = $2 AND challenge_id = $3
            )
            "#,
        )
        .bind(sender_id)
        .bind(recipient_id)
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_fine(&self, fine: NewFine) -> AppResult<InsertOutcome> {
        let id = Uuid::new_v4();

        // The partial unique index on (sender_id, recipient_id, challenge_id, type)
        // makes concurrent reconcilers collapse onto a single row.
        let inserted = sqlx::query_as::<_, Fine>(
            r#"
            INSERT INTO fines (
                id, sender_id, sender_name, sender_phone, recipient_id,
                recipient_name, recipient_email, reason, amount, status,
                date, type, challenge_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (sender_id, recipient_id, challenge_id, type)
                WHERE challenge_id IS NOT NULL
                DO NOTHING
            RETURNING id, sender_id, sender_name, sender_phone, recipient_id,
                      recipient_name, recipient_email, reason, amount, status,
                      date, type, challenge_id
            "#,
        )
        .bind(id)
        .bind(fine.sender_id)
        .bind(&fine.sender_name)
        .bind(&fine.sender_phone)
        .bind(fine.recipient_id)
        .bind(&fine.recipient_name)
        .bind(&fine.recipient_email)
        .bind(&fine.reason)
        .bind(fine.amount)
        .bind(fine.status.as_str())
        .bind(fine.date)
        .bind(fine.fine_type.as_str())
        .bind(fine.challenge_id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(fine) => {
                info!("💾 Fine {} stored ({} -> {})", fine.id, fine.sender_id, fine.recipient_id);
                Ok(InsertOutcome::Inserted(fine))
            }
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    // ========== PUSH SUBSCRIPTIONS ==========

    async fn push_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<PushSubscriptionRow>> {
        // to_jsonb keeps text columns as JSON strings so both encodings decode
        let rows = sqlx::query_as::<_, PushSubscriptionRow>(
            r#"
            SELECT user_id, to_jsonb(subscription) AS subscription
            FROM push_subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========== LEASES ==========

    async fn try_acquire_lease(
        &self,
        user_id: Uuid,
        holder: Uuid,
        ttl: Duration,
    ) -> AppResult<bool> {
        let acquired = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO reconciler_leases (user_id, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (user_id) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE reconciler_leases.expires_at < NOW()
               OR reconciler_leases.holder = EXCLUDED.holder
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_lease(&self, user_id: Uuid, holder: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM reconciler_leases WHERE user_id = $1 AND holder = $2")
            .bind(user_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========== BADGES ==========

    async fn user_badges(&self, user_id: Uuid) -> AppResult<Vec<UserBadgeRow>> {
        let rows = sqlx::query_as::<_, UserBadgeRow>(
            "SELECT badge_id, achieved_at FROM user_badges WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn badges_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<BadgeRow>> {
        let rows = sqlx::query_as::<_, BadgeRow>(
            r#"
            SELECT id, to_jsonb(name) AS name, to_jsonb(description) AS description,
                   icon, rarity, xp_reward
            FROM badges
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
