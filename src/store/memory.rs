use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::RecordStore;
use crate::badges::models::{BadgeRow, UserBadgeRow};
use crate::error::AppResult;
use crate::fines::models::{
    CandidateState, ChallengeFineCandidate, ChallengeParticipant, Fine, InsertOutcome, NewFine,
    PushSubscriptionRow, UserProfile,
};

/// Store operations that tests can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    PendingCandidates,
    FindWinner,
    UserProfile(Uuid),
    InsertFine,
    PushSubscriptions,
    AcquireLease,
}

#[derive(Debug, Clone)]
struct CandidateStatus {
    state: CandidateState,
    attempts: u32,
    last_error: Option<String>,
}

/// In-process record store with the same semantics as the Postgres backend
pub struct InMemoryStore {
    candidates: RwLock<Vec<ChallengeFineCandidate>>,
    candidate_state: RwLock<HashMap<Uuid, CandidateStatus>>,
    participants: RwLock<Vec<ChallengeParticipant>>,
    users: RwLock<HashMap<Uuid, UserProfile>>,
    fines: RwLock<Vec<Fine>>,
    subscriptions: RwLock<Vec<PushSubscriptionRow>>,
    leases: RwLock<HashMap<Uuid, (Uuid, Instant)>>,
    user_badges: RwLock<HashMap<Uuid, Vec<UserBadgeRow>>>,
    badges: RwLock<Vec<BadgeRow>>,
    #[cfg(test)]
    failing: parking_lot::Mutex<std::collections::HashSet<StoreOp>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            candidates: RwLock::new(Vec::new()),
            candidate_state: RwLock::new(HashMap::new()),
            participants: RwLock::new(Vec::new()),
            users: RwLock::new(HashMap::new()),
            fines: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
            leases: RwLock::new(HashMap::new()),
            user_badges: RwLock::new(HashMap::new()),
            badges: RwLock::new(Vec::new()),
            #[cfg(test)]
            failing: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub async fn add_candidate(&self, candidate: ChallengeFineCandidate) {
        self.candidates.write().await.push(candidate);
    }

    pub async fn add_participant(&self, participant: ChallengeParticipant) {
        self.participants.write().await.push(participant);
    }

    pub async fn upsert_user(&self, profile: UserProfile) {
        self.users.write().await.insert(profile.id, profile);
    }

    pub async fn add_fine(&self, fine: Fine) {
        self.fines.write().await.push(fine);
    }

    pub async fn add_subscription(&self, user_id: Uuid, subscription: serde_json::Value) {
        self.subscriptions.write().await.push(PushSubscriptionRow {
            user_id,
            subscription,
        });
    }

    pub async fn add_badge(&self, badge: BadgeRow) {
        self.badges.write().await.push(badge);
    }

    pub async fn award_badge(
        &self,
        user_id: Uuid,
        badge_id: Uuid,
        achieved_at: Option<DateTime<Utc>>,
    ) {
        self.user_badges
            .write()
            .await
            .entry(user_id)
            .or_default()
            .push(UserBadgeRow {
                badge_id,
                achieved_at,
            });
    }

    #[cfg(test)]
    pub async fn fines(&self) -> Vec<Fine> {
        self.fines.read().await.clone()
    }

    #[cfg(test)]
    pub async fn candidate_attempts(&self, candidate_id: Uuid) -> u32 {
        self.candidate_state
            .read()
            .await
            .get(&candidate_id)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub async fn candidate_last_error(&self, candidate_id: Uuid) -> Option<String> {
        self.candidate_state
            .read()
            .await
            .get(&candidate_id)
            .and_then(|s| s.last_error.clone())
    }

    #[cfg(test)]
    pub fn set_failing(&self, op: StoreOp, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(op);
        } else {
            failing.remove(&op);
        }
    }

    #[cfg(test)]
    fn check_failure(&self, op: StoreOp) -> AppResult<()> {
        if self.failing.lock().contains(&op) {
            return Err(crate::error::AppError::Internal(format!(
                "simulated {:?} failure",
                op
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_failure(&self, _op: StoreOp) -> AppResult<()> {
        Ok(())
    }

    async fn is_pending(&self, candidate_id: Uuid) -> bool {
        self.candidate_state
            .read()
            .await
            .get(&candidate_id)
            .map(|s| s.state == CandidateState::Pending)
            .unwrap_or(true)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixture file for running the service without a database
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemorySeed {
    pub candidates: Vec<ChallengeFineCandidate>,
    pub participants: Vec<ChallengeParticipant>,
    pub users: Vec<UserProfile>,
    pub fines: Vec<Fine>,
    pub push_subscriptions: Vec<PushSubscriptionRow>,
    pub badges: Vec<BadgeRow>,
    pub user_badges: Vec<SeedUserBadge>,
}

#[derive(Debug, Deserialize)]
pub struct SeedUserBadge {
    pub user_id: Uuid,
    pub badge_id: Uuid,
    pub achieved_at: Option<DateTime<Utc>>,
}

impl InMemoryStore {
    pub async fn seeded(seed: MemorySeed) -> Self {
        let store = Self::new();
        for candidate in seed.candidates {
            store.add_candidate(candidate).await;
        }
        for participant in seed.participants {
            store.add_participant(participant).await;
        }
        for user in seed.users {
            store.upsert_user(user).await;
        }
        for fine in seed.fines {
            store.add_fine(fine).await;
        }
        for row in seed.push_subscriptions {
            store.add_subscription(row.user_id, row.subscription).await;
        }
        for badge in seed.badges {
            store.add_badge(badge).await;
        }
        for award in seed.user_badges {
            store
                .award_badge(award.user_id, award.badge_id, award.achieved_at)
                .await;
        }
        info!(
            "🧪 In-memory store seeded: {} candidates, {} users",
            store.candidates.read().await.len(),
            store.users.read().await.len()
        );
        store
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn pending_candidates(&self, sender_id: Uuid) -> AppResult<Vec<ChallengeFineCandidate>> {
        self.check_failure(StoreOp::PendingCandidates)?;
        let candidates = self.candidates.read().await.clone();
        let mut pending = Vec::new();
        for candidate in candidates.into_iter().filter(|c| c.sender_id == sender_id) {
            if self.is_pending(candidate.id).await {
                pending.push(candidate);
            }
        }
        Ok(pending)
    }

    async fn senders_with_pending_candidates(&self) -> AppResult<Vec<Uuid>> {
        let candidates = self.candidates.read().await.clone();
        let mut senders = Vec::new();
        for candidate in candidates {
            if !senders.contains(&candidate.sender_id) && self.is_pending(candidate.id).await {
                senders.push(candidate.sender_id);
            }
        }
        Ok(senders)
    }

    async fn find_winner(
        &self,
        challenge_id: Uuid,
        excluded_user: Uuid,
    ) -> AppResult<Option<ChallengeParticipant>> {
        self.check_failure(StoreOp::FindWinner)?;
        let participants = self.participants.read().await;
        Ok(participants
            .iter()
            .find(|p| p.challenge_id == challenge_id && p.completed && p.user_id != excluded_user)
            .cloned())
    }

    async fn user_profile(&self, user_id: Uuid) -> AppResult<Option<UserProfile>> {
        self.check_failure(StoreOp::UserProfile(user_id))?;
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn fine_exists(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        challenge_id: Uuid,
    ) -> AppResult<bool> {
        let fines = self.fines.read().await;
        Ok(fines.iter().any(|f| {
            f.sender_id == sender_id
                && f.recipient_id == recipient_id
                && f.challenge_id == Some(challenge_id)
        }))
    }

    async fn insert_fine(&self, fine: NewFine) -> AppResult<InsertOutcome> {
        self.check_failure(StoreOp::InsertFine)?;

        // Check and insert under one write lock, like the unique index does
        let mut fines = self.fines.write().await;
        let duplicate = fines.iter().any(|f| {
            f.sender_id == fine.sender_id
                && f.recipient_id == fine.recipient_id
                && f.challenge_id == Some(fine.challenge_id)
                && f.fine_type == fine.fine_type.as_str()
        });
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }

        let stored = fine.into_fine(Uuid::new_v4());
        fines.push(stored.clone());
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn push_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<PushSubscriptionRow>> {
        self.check_failure(StoreOp::PushSubscriptions)?;
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mark_candidate_resolved(&self, candidate_id: Uuid) -> AppResult<()> {
        let mut states = self.candidate_state.write().await;
        let entry = states.entry(candidate_id).or_insert(CandidateStatus {
            state: CandidateState::Pending,
            attempts: 0,
            last_error: None,
        });
        entry.state = CandidateState::Resolved;
        Ok(())
    }

    async fn record_candidate_failure(
        &self,
        candidate_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> AppResult<CandidateState> {
        let mut states = self.candidate_state.write().await;
        let entry = states.entry(candidate_id).or_insert(CandidateStatus {
            state: CandidateState::Pending,
            attempts: 0,
            last_error: None,
        });
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.state = if max_attempts > 0 && entry.attempts >= max_attempts {
            CandidateState::Failed
        } else {
            CandidateState::Pending
        };
        Ok(entry.state)
    }

    async fn try_acquire_lease(
        &self,
        user_id: Uuid,
        holder: Uuid,
        ttl: Duration,
    ) -> AppResult<bool> {
        self.check_failure(StoreOp::AcquireLease)?;
        let mut leases = self.leases.write().await;
        let now = Instant::now();
        match leases.get(&user_id) {
            Some((current, expires_at)) if *current != holder && *expires_at > now => Ok(false),
            _ => {
                leases.insert(user_id, (holder, now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, user_id: Uuid, holder: Uuid) -> AppResult<()> {
        let mut leases = self.leases.write().await;
        if leases.get(&user_id).map(|(h, _)| *h == holder).unwrap_or(false) {
            leases.remove(&user_id);
        }
        Ok(())
    }

    async fn user_badges(&self, user_id: Uuid) -> AppResult<Vec<UserBadgeRow>> {
        Ok(self
            .user_badges
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn badges_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<BadgeRow>> {
        let badges = self.badges.read().await;
        Ok(badges.iter().filter(|b| ids.contains(&b.id)).cloned().collect())
    }
}
