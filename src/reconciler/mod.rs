// Challenge fine reconciliation
//
// Candidates are written by the client when a challenge finishes, before the
// winner is known. Each pass:
// 1. Loads the sender's unresolved candidates
// 2. Finds a completed participant other than the recipient (the winner)
// 3. Inserts the fine with the winner as sender, at most once per
//    (winner, recipient, challenge)
// 4. Pushes a localized notification to every valid recipient subscription
//
// Every failure is logged and contained to the candidate (or subscription)
// that caused it; a pass never returns an error.

pub mod guard;
pub mod scheduler;

pub use scheduler::{ReconcileScheduler, WatchOutcome};

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::guard::InFlightUsers;
use crate::fines::models::{
    CandidateState, ChallengeFineCandidate, ChallengeSummary, Fine, FineStatus, FineType,
    InsertOutcome, NewFine, UserProfile,
};
use crate::locale::{LocaleCatalog, LocaleStrings};
use crate::push::{valid_subscriptions, NotificationPayload, PushSender};
use crate::store::RecordStore;
use crate::templating::{render, TemplateVars};

/// Sender name used when neither the winner profile nor the candidate has one
pub const DEFAULT_SENDER_NAME: &str = "User";

/// Title used in the fine reason when the candidate has none, in every language
pub const DEFAULT_CHALLENGE_TITLE: &str = "Reto";

/// Where the notification sends the recipient
pub const NOTIFICATION_URL: &str = "/history";

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Failed attempts before a candidate is dead-lettered (0 = never)
    pub max_candidate_attempts: u32,
    pub lease_ttl: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            max_candidate_attempts: 1440,
            lease_ttl: Duration::from_secs(300),
        }
    }
}

/// Counters for one pass
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PassReport {
    pub user_id: Uuid,
    pub candidates: usize,
    pub fines_created: usize,
    pub duplicates: usize,
    pub unresolved: usize,
    pub insert_failures: usize,
    pub dead_lettered: usize,
    pub pushes_sent: usize,
    pub push_failures: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A pass for this user is already running in this process
    AlreadyRunning,
    /// Another instance holds the user's lease
    LeaseHeld,
    /// No finished challenge created by the user in the trigger payload
    NotRelevant,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(PassReport),
    Skipped { reason: SkipReason },
    Aborted { error: String },
}

/// Heuristic gate for ad-hoc triggers: an empty list always passes, otherwise
/// at least one challenge must be finished and created by the user.
pub fn should_reconcile(user_id: Uuid, challenges: &[ChallengeSummary]) -> bool {
    challenges.is_empty() || challenges.iter().any(|c| c.is_finished_by(user_id))
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// username, then email, then the candidate's sender name, then the default
pub fn winner_display_name(profile: Option<&UserProfile>, candidate_sender_name: Option<&str>) -> String {
    profile
        .and_then(|p| present(p.username.as_deref()).or(present(p.email.as_deref())))
        .or(present(candidate_sender_name))
        .unwrap_or(DEFAULT_SENDER_NAME)
        .to_string()
}

pub struct FineReconciler {
    store: Arc<dyn RecordStore>,
    push: Arc<dyn PushSender>,
    locales: Arc<LocaleCatalog>,
    settings: ReconcilerSettings,
    /// Lease holder id for this process
    instance_id: Uuid,
    in_flight: InFlightUsers,
}

impl FineReconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        push: Arc<dyn PushSender>,
        locales: Arc<LocaleCatalog>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            push,
            locales,
            settings,
            instance_id: Uuid::new_v4(),
            in_flight: InFlightUsers::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn passes_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run one pass for `user_id` unless one is already running for that
    /// user, here or in another instance.
    pub async fn run_pass(&self, user_id: Uuid) -> PassOutcome {
        let Some(_guard) = self.in_flight.try_enter(user_id) else {
            debug!("Reconciliation already running for {}", user_id);
            return PassOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            };
        };

        match self
            .store
            .try_acquire_lease(user_id, self.instance_id, self.settings.lease_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Lease for {} held by another instance", user_id);
                return PassOutcome::Skipped {
                    reason: SkipReason::LeaseHeld,
                };
            }
            Err(e) => {
                error!("Failed to acquire reconciliation lease for {}: {}", user_id, e);
                return PassOutcome::Aborted {
                    error: e.to_string(),
                };
            }
        }

        let outcome = self.process(user_id).await;

        if let Err(e) = self.store.release_lease(user_id, self.instance_id).await {
            warn!("Failed to release reconciliation lease for {}: {}", user_id, e);
        }

        outcome
    }

    async fn process(&self, user_id: Uuid) -> PassOutcome {
        let candidates = match self.store.pending_candidates(user_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Error loading pending challenge fines for {}: {}", user_id, e);
                return PassOutcome::Aborted {
                    error: e.to_string(),
                };
            }
        };

        let mut report = PassReport {
            user_id,
            candidates: candidates.len(),
            ..Default::default()
        };

        if candidates.is_empty() {
            debug!("No pending challenge fines for {}", user_id);
            return PassOutcome::Completed(report);
        }

        info!("🔄 Reconciling {} challenge fine candidates for {}", candidates.len(), user_id);

        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 && !self.renew_lease(user_id).await {
                warn!(
                    "Lease for {} lost mid-pass, leaving {} candidates for later",
                    user_id,
                    candidates.len() - index
                );
                break;
            }
            self.reconcile_candidate(candidate, &mut report).await;
        }

        info!(
            "✓ Reconciliation for {} done: created={} duplicates={} unresolved={} failed_inserts={} pushes={}/{}",
            user_id,
            report.fines_created,
            report.duplicates,
            report.unresolved,
            report.insert_failures,
            report.pushes_sent,
            report.pushes_sent + report.push_failures,
        );

        PassOutcome::Completed(report)
    }

    async fn reconcile_candidate(&self, candidate: &ChallengeFineCandidate, report: &mut PassReport) {
        // Step 1: winner
        let winner = match self
            .store
            .find_winner(candidate.challenge_id, candidate.recipient_id)
            .await
        {
            Ok(Some(winner)) => winner,
            Ok(None) => {
                warn!("No winner yet for challenge {}", candidate.challenge_id);
                report.unresolved += 1;
                self.record_failure(candidate, "no completed participant", report)
                    .await;
                return;
            }
            // Store errors are transient and do not count toward dead-lettering
            Err(e) => {
                warn!("Winner lookup failed for challenge {}: {}", candidate.challenge_id, e);
                report.unresolved += 1;
                return;
            }
        };

        // Step 2: winner identity
        let winner_profile = self
            .store
            .user_profile(winner.user_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Profile lookup failed for winner {}: {}", winner.user_id, e);
                None
            });
        let sender_name =
            winner_display_name(winner_profile.as_ref(), candidate.sender_name.as_deref());
        let sender_phone = winner_profile
            .as_ref()
            .and_then(|p| present(p.phone.as_deref()))
            .unwrap_or_default()
            .to_string();

        // Step 3: already reconciled?
        match self
            .store
            .fine_exists(winner.user_id, candidate.recipient_id, candidate.challenge_id)
            .await
        {
            Ok(true) => {
                debug!("Fine already exists for challenge {}", candidate.challenge_id);
                report.duplicates += 1;
                self.mark_resolved(candidate).await;
                return;
            }
            Ok(false) => {}
            // The conditional insert still prevents duplicates
            Err(e) => warn!("Existence check failed for challenge {}: {}", candidate.challenge_id, e),
        }

        // Step 4: recipient language and reason
        let recipient_language = self
            .store
            .user_profile(candidate.recipient_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Language lookup failed for {}: {}", candidate.recipient_id, e);
                None
            })
            .and_then(|p| p.language);
        let locale = self.locales.lookup(recipient_language.as_deref());
        let reason = challenge_reason(locale, candidate.challenge_title.as_deref());

        // Step 5: insert with the winner as sender
        let new_fine = NewFine {
            sender_id: winner.user_id,
            sender_name,
            sender_phone,
            recipient_id: candidate.recipient_id,
            recipient_name: candidate.recipient_name.clone(),
            recipient_email: candidate.recipient_email.clone(),
            reason,
            amount: candidate.amount,
            status: FineStatus::Pending,
            date: Utc::now(),
            fine_type: FineType::Challenge,
            challenge_id: candidate.challenge_id,
        };

        let fine = match self.store.insert_fine(new_fine).await {
            Ok(InsertOutcome::Inserted(fine)) => fine,
            Ok(InsertOutcome::Duplicate) => {
                debug!("Concurrent insert won for challenge {}", candidate.challenge_id);
                report.duplicates += 1;
                self.mark_resolved(candidate).await;
                return;
            }
            Err(e) => {
                error!("Error inserting fine for challenge {}: {}", candidate.challenge_id, e);
                report.insert_failures += 1;
                self.record_failure(candidate, &e.to_string(), report).await;
                return;
            }
        };

        report.fines_created += 1;
        info!(
            "⚖️ Fine {} created: {} -> {} ({} CHF)",
            fine.id, fine.sender_name, fine.recipient_id, fine.amount
        );
        self.mark_resolved(candidate).await;

        // Step 6: notify the loser
        self.notify_recipient(&fine, locale, report).await;
    }

    async fn notify_recipient(&self, fine: &Fine, locale: &LocaleStrings, report: &mut PassReport) {
        let notification = fine_notification(locale, fine);

        let rows = match self.store.push_subscriptions(fine.recipient_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to load push subscriptions for {}: {}", fine.recipient_id, e);
                return;
            }
        };

        for subscription in valid_subscriptions(&rows) {
            match self.push.deliver(&subscription.raw, &notification).await {
                Ok(()) => report.pushes_sent += 1,
                Err(e) => {
                    error!("Error sending push to {}: {}", subscription.endpoint, e);
                    report.push_failures += 1;
                }
            }
        }
    }

    /// Extend the lease before the next candidate. False only when another
    /// instance has taken it over; store errors keep the pass going.
    async fn renew_lease(&self, user_id: Uuid) -> bool {
        match self
            .store
            .try_acquire_lease(user_id, self.instance_id, self.settings.lease_ttl)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                warn!("Failed to renew reconciliation lease for {}: {}", user_id, e);
                true
            }
        }
    }

    async fn mark_resolved(&self, candidate: &ChallengeFineCandidate) {
        if let Err(e) = self.store.mark_candidate_resolved(candidate.id).await {
            warn!("Failed to mark candidate {} resolved: {}", candidate.id, e);
        }
    }

    async fn record_failure(&self, candidate: &ChallengeFineCandidate, reason: &str, report: &mut PassReport) {
        match self
            .store
            .record_candidate_failure(candidate.id, reason, self.settings.max_candidate_attempts)
            .await
        {
            Ok(CandidateState::Failed) => {
                report.dead_lettered += 1;
                error!(
                    "☠️ Candidate {} for challenge {} dead-lettered after {} attempts: {}",
                    candidate.id, candidate.challenge_id, self.settings.max_candidate_attempts, reason
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to record attempt for candidate {}: {}", candidate.id, e),
        }
    }
}

/// Localized fine reason for a challenge that was not completed
pub fn challenge_reason(locale: &LocaleStrings, challenge_title: Option<&str>) -> String {
    let title = present(challenge_title).unwrap_or(DEFAULT_CHALLENGE_TITLE);
    // Every `{title}` in the template is replaced, not just the first one
    render(
        &locale.challenge_card.challenge_not_completed,
        &TemplateVars::new().set("title", title),
    )
}

/// Push payload telling the recipient who fined them
pub fn fine_notification(locale: &LocaleStrings, fine: &Fine) -> NotificationPayload {
    let card = &locale.challenge_card;
    let vars = TemplateVars::new()
        .set("sender", &fine.sender_name)
        .set("amount", fine.amount.normalize())
        .set("reason", &fine.reason);

    NotificationPayload {
        title: card.new_fine_received.clone(),
        body: render(&card.fine_received_body, &vars),
        url: NOTIFICATION_URL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppResult, PushError};
    use crate::fines::models::ChallengeParticipant;
    use crate::locale::ChallengeCardStrings;
    use crate::store::memory::StoreOp;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingPush {
        deliveries: Mutex<Vec<(Value, NotificationPayload)>>,
    }

    #[async_trait]
    impl PushSender for RecordingPush {
        async fn deliver(&self, subscription: &Value, notification: &NotificationPayload) -> AppResult<()> {
            if subscription["endpoint"].as_str().unwrap_or_default().contains("broken") {
                return Err(PushError::Transport("push server down".into()).into());
            }
            self.deliveries
                .lock()
                .push((subscription.clone(), notification.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct BlockingPush {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PushSender for BlockingPush {
        async fn deliver(&self, _: &Value, _: &NotificationPayload) -> AppResult<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct SlowPush(Duration);

    #[async_trait]
    impl PushSender for SlowPush {
        async fn deliver(&self, _: &Value, _: &NotificationPayload) -> AppResult<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Ids {
        creator: Uuid,
        winner: Uuid,
        recipient: Uuid,
        challenge: Uuid,
    }

    impl Ids {
        fn new() -> Self {
            Self {
                creator: Uuid::new_v4(),
                winner: Uuid::new_v4(),
                recipient: Uuid::new_v4(),
                challenge: Uuid::new_v4(),
            }
        }
    }

    fn reconciler_with(
        store: Arc<InMemoryStore>,
        push: Arc<dyn PushSender>,
        settings: ReconcilerSettings,
    ) -> FineReconciler {
        let locales = Arc::new(LocaleCatalog::embedded("es").unwrap());
        FineReconciler::new(store, push, locales, settings)
    }

    fn candidate(ids: &Ids, amount: Decimal, title: Option<&str>) -> ChallengeFineCandidate {
        ChallengeFineCandidate {
            id: Uuid::new_v4(),
            challenge_id: ids.challenge,
            sender_id: ids.creator,
            sender_name: Some("Creator".into()),
            recipient_id: ids.recipient,
            recipient_name: Some("Bob".into()),
            recipient_email: Some("bob@x.com".into()),
            challenge_title: title.map(str::to_string),
            amount,
        }
    }

    fn participant(challenge_id: Uuid, user_id: Uuid, completed: bool) -> ChallengeParticipant {
        ChallengeParticipant {
            challenge_id,
            user_id,
            completed,
        }
    }

    fn subscription(endpoint: &str) -> Value {
        json!({
            "endpoint": endpoint,
            "keys": { "auth": "auth-secret", "p256dh": "p256-key" }
        })
    }

    fn profile(id: Uuid) -> UserProfile {
        UserProfile {
            id,
            ..Default::default()
        }
    }

    fn completed(outcome: PassOutcome) -> PassReport {
        match outcome {
            PassOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {:?}", other),
        }
    }

    /// One candidate with a single completed winner and one push subscription
    async fn seeded_store(ids: &Ids) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.add_candidate(candidate(ids, dec!(25), Some("10k steps"))).await;
        store.add_participant(participant(ids.challenge, ids.winner, true)).await;
        store
            .upsert_user(UserProfile {
                username: Some("Alice".into()),
                phone: Some("+41790000000".into()),
                ..profile(ids.winner)
            })
            .await;
        store
            .add_subscription(ids.recipient, subscription("https://push.example.com/bob"))
            .await;
        store
    }

    #[tokio::test]
    async fn test_creates_fine_attributed_to_winner() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        let report = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.fines_created, 1);
        assert_eq!(report.pushes_sent, 1);

        let fines = store.fines().await;
        assert_eq!(fines.len(), 1);
        let fine = &fines[0];
        assert_eq!(fine.sender_id, ids.winner);
        assert_eq!(fine.sender_name, "Alice");
        assert_eq!(fine.sender_phone, "+41790000000");
        assert_eq!(fine.recipient_id, ids.recipient);
        assert_eq!(fine.recipient_name.as_deref(), Some("Bob"));
        assert_eq!(fine.amount, dec!(25));
        assert_eq!(fine.status, "pending");
        assert_eq!(fine.fine_type, "challenge");
        assert_eq!(fine.challenge_id, Some(ids.challenge));
        assert_eq!(fine.reason, "No completó el reto \"10k steps\"");
    }

    #[tokio::test]
    async fn test_notification_content() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        reconciler.run_pass(ids.creator).await;

        let deliveries = push.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        let (subs, notif) = &deliveries[0];
        assert_eq!(subs, &subscription("https://push.example.com/bob"));
        assert_eq!(notif.title, "¡Nueva multa recibida!");
        assert_eq!(
            notif.body,
            "Alice te ha enviado una multa de 25 CHF por \"No completó el reto \"10k steps\"\""
        );
        assert_eq!(notif.url, "/history");
    }

    #[tokio::test]
    async fn test_no_winner_leaves_candidate_for_next_pass() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        let pending = candidate(&ids, dec!(10), None);
        store.add_candidate(pending.clone()).await;
        // The recipient completing does not make them the winner
        store.add_participant(participant(ids.challenge, ids.recipient, true)).await;
        store.add_participant(participant(ids.challenge, ids.winner, false)).await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        let first = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(first.unresolved, 1);
        assert_eq!(first.fines_created, 0);

        let second = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(second.candidates, 1);
        assert_eq!(second.unresolved, 1);

        assert!(store.fines().await.is_empty());
        assert!(push.deliveries.lock().is_empty());
        assert_eq!(store.candidate_attempts(pending.id).await, 2);
    }

    #[tokio::test]
    async fn test_winner_found_once_participant_completes() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        store.add_candidate(candidate(&ids, dec!(10), None)).await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push, ReconcilerSettings::default());

        assert_eq!(completed(reconciler.run_pass(ids.creator).await).unresolved, 1);

        store.add_participant(participant(ids.challenge, ids.winner, true)).await;
        assert_eq!(completed(reconciler.run_pass(ids.creator).await).fines_created, 1);
    }

    #[tokio::test]
    async fn test_existing_fine_is_not_duplicated() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store
            .add_fine(Fine {
                id: Uuid::new_v4(),
                sender_id: ids.winner,
                sender_name: "Alice".into(),
                sender_phone: String::new(),
                recipient_id: ids.recipient,
                recipient_name: Some("Bob".into()),
                recipient_email: None,
                reason: "earlier".into(),
                amount: dec!(25),
                status: "pending".into(),
                date: Utc::now(),
                fine_type: "challenge".into(),
                challenge_id: Some(ids.challenge),
            })
            .await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        let report = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.fines_created, 0);
        assert_eq!(store.fines().await.len(), 1);
        assert!(push.deliveries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        completed(reconciler.run_pass(ids.creator).await);
        let second = completed(reconciler.run_pass(ids.creator).await);

        assert_eq!(second.fines_created, 0);
        assert_eq!(second.pushes_sent, 0);
        assert_eq!(store.fines().await.len(), 1);
        assert_eq!(push.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_recipient_language_selects_template() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store
            .upsert_user(UserProfile {
                language: Some("en".into()),
                ..profile(ids.recipient)
            })
            .await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());
        reconciler.run_pass(ids.creator).await;

        let fines = store.fines().await;
        assert_eq!(fines[0].reason, "Did not complete the challenge \"10k steps\"");
        assert_eq!(push.deliveries.lock()[0].1.title, "New fine received!");
    }

    #[tokio::test]
    async fn test_missing_title_uses_default() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        store.add_candidate(candidate(&ids, dec!(5), None)).await;
        store.add_participant(participant(ids.challenge, ids.winner, true)).await;
        store
            .upsert_user(UserProfile {
                language: Some("en".into()),
                ..profile(ids.recipient)
            })
            .await;

        let reconciler = reconciler_with(
            store.clone(),
            Arc::new(RecordingPush::default()),
            ReconcilerSettings::default(),
        );
        reconciler.run_pass(ids.creator).await;

        assert_eq!(
            store.fines().await[0].reason,
            "Did not complete the challenge \"Reto\""
        );
    }

    #[tokio::test]
    async fn test_sender_name_falls_back_to_candidate_then_default() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        store.add_candidate(candidate(&ids, dec!(5), None)).await;
        store.add_participant(participant(ids.challenge, ids.winner, true)).await;

        let reconciler = reconciler_with(
            store.clone(),
            Arc::new(RecordingPush::default()),
            ReconcilerSettings::default(),
        );
        reconciler.run_pass(ids.creator).await;

        // No winner profile at all: the candidate's sender name is used
        let fine = &store.fines().await[0];
        assert_eq!(fine.sender_name, "Creator");
        assert_eq!(fine.sender_phone, "");
    }

    #[test]
    fn test_winner_display_name_order() {
        let id = Uuid::new_v4();
        let full = UserProfile {
            username: Some("Alice".into()),
            email: Some("alice@x.com".into()),
            ..profile(id)
        };
        let email_only = UserProfile {
            username: Some(String::new()),
            email: Some("alice@x.com".into()),
            ..profile(id)
        };
        let empty = profile(id);

        assert_eq!(winner_display_name(Some(&full), Some("Creator")), "Alice");
        assert_eq!(winner_display_name(Some(&email_only), Some("Creator")), "alice@x.com");
        assert_eq!(winner_display_name(Some(&empty), Some("Creator")), "Creator");
        assert_eq!(winner_display_name(Some(&empty), None), DEFAULT_SENDER_NAME);
        assert_eq!(winner_display_name(None, Some("")), DEFAULT_SENDER_NAME);
    }

    #[tokio::test]
    async fn test_only_well_formed_subscriptions_receive_push() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store
            .add_subscription(
                ids.recipient,
                json!({ "endpoint": "https://push.example.com/old", "keys": { "auth": "a" } }),
            )
            .await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());
        let report = completed(reconciler.run_pass(ids.creator).await);

        assert_eq!(report.pushes_sent, 1);
        assert_eq!(push.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_string_encoded_subscription_is_delivered_as_object() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        store.add_candidate(candidate(&ids, dec!(5), None)).await;
        store.add_participant(participant(ids.challenge, ids.winner, true)).await;
        let encoded = subscription("https://push.example.com/tab").to_string();
        store.add_subscription(ids.recipient, Value::String(encoded)).await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store, push.clone(), ReconcilerSettings::default());
        reconciler.run_pass(ids.creator).await;

        let deliveries = push.deliveries.lock();
        assert_eq!(deliveries[0].0, subscription("https://push.example.com/tab"));
    }

    #[tokio::test]
    async fn test_push_failure_does_not_block_other_deliveries() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store
            .add_subscription(ids.recipient, subscription("https://push.example.com/broken"))
            .await;
        store
            .add_subscription(ids.recipient, subscription("https://push.example.com/phone"))
            .await;

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());
        let report = completed(reconciler.run_pass(ids.creator).await);

        assert_eq!(report.pushes_sent, 2);
        assert_eq!(report.push_failures, 1);
        assert_eq!(report.fines_created, 1);
    }

    #[tokio::test]
    async fn test_insert_failure_is_retried_next_pass() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        store.set_failing(StoreOp::InsertFine, true);
        let failed = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(failed.insert_failures, 1);
        assert!(store.fines().await.is_empty());
        assert!(push.deliveries.lock().is_empty());

        store.set_failing(StoreOp::InsertFine, false);
        let retried = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(retried.fines_created, 1);
        assert_eq!(push.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_candidate_is_dead_lettered() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        let stuck = candidate(&ids, dec!(5), None);
        store.add_candidate(stuck.clone()).await;

        let settings = ReconcilerSettings {
            max_candidate_attempts: 2,
            ..Default::default()
        };
        let reconciler = reconciler_with(store.clone(), Arc::new(RecordingPush::default()), settings);

        assert_eq!(completed(reconciler.run_pass(ids.creator).await).dead_lettered, 0);
        assert_eq!(completed(reconciler.run_pass(ids.creator).await).dead_lettered, 1);

        // Dead-lettered candidates are no longer fetched
        assert_eq!(completed(reconciler.run_pass(ids.creator).await).candidates, 0);
        assert_eq!(
            store.candidate_last_error(stuck.id).await.as_deref(),
            Some("no completed participant")
        );
    }

    #[tokio::test]
    async fn test_reentrant_trigger_is_skipped() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let push = Arc::new(BlockingPush::default());
        let reconciler = Arc::new(reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default()));

        let running = {
            let reconciler = reconciler.clone();
            let user = ids.creator;
            tokio::spawn(async move { reconciler.run_pass(user).await })
        };

        push.entered.notified().await;
        assert_eq!(
            reconciler.run_pass(ids.creator).await,
            PassOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );

        push.release.notify_one();
        let report = completed(running.await.unwrap());
        assert_eq!(report.fines_created, 1);
        assert_eq!(store.fines().await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_instance_respects_lease() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let push = Arc::new(BlockingPush::default());
        let first = Arc::new(reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default()));
        let second = reconciler_with(store.clone(), Arc::new(RecordingPush::default()), ReconcilerSettings::default());
        assert_ne!(first.instance_id(), second.instance_id());

        let running = {
            let first = first.clone();
            let user = ids.creator;
            tokio::spawn(async move { first.run_pass(user).await })
        };

        push.entered.notified().await;
        assert_eq!(
            second.run_pass(ids.creator).await,
            PassOutcome::Skipped {
                reason: SkipReason::LeaseHeld
            }
        );

        push.release.notify_one();
        completed(running.await.unwrap());

        // Lease released: the second instance can run (and finds nothing left)
        assert_eq!(completed(second.run_pass(ids.creator).await).candidates, 0);
        assert_eq!(store.fines().await.len(), 1);
    }

    #[test]
    fn test_trigger_gate() {
        let user = Uuid::new_v4();
        let finished_by_user = ChallengeSummary {
            id: None,
            status: "finished".into(),
            creator_id: Some(user),
        };
        let finished_by_other = ChallengeSummary {
            creator_id: Some(Uuid::new_v4()),
            ..finished_by_user.clone()
        };
        let active_by_user = ChallengeSummary {
            status: "active".into(),
            ..finished_by_user.clone()
        };

        assert!(should_reconcile(user, &[]));
        assert!(should_reconcile(user, &[active_by_user.clone(), finished_by_user]));
        assert!(!should_reconcile(user, &[finished_by_other, active_by_user]));
    }

    #[test]
    fn test_amount_is_rendered_without_trailing_zeros() {
        let catalog = LocaleCatalog::embedded("es").unwrap();
        let fine = NewFine {
            sender_id: Uuid::new_v4(),
            sender_name: "Alice".into(),
            sender_phone: String::new(),
            recipient_id: Uuid::new_v4(),
            recipient_name: None,
            recipient_email: None,
            reason: "late".into(),
            amount: dec!(12.50),
            status: FineStatus::Pending,
            date: Utc::now(),
            fine_type: FineType::Challenge,
            challenge_id: Uuid::new_v4(),
        }
        .into_fine(Uuid::new_v4());

        let notification = fine_notification(catalog.lookup(Some("en")), &fine);
        assert_eq!(notification.body, "Alice sent you a fine of 12.5 CHF for \"late\"");
    }
    #[test]
    fn test_default_title_is_the_same_in_every_language() {
        let catalog = LocaleCatalog::embedded("es").unwrap();
        for code in catalog.languages() {
            let reason = challenge_reason(catalog.lookup(Some(code)), None);
            assert!(reason.contains(DEFAULT_CHALLENGE_TITLE), "{}: {}", code, reason);
        }
        assert_eq!(
            challenge_reason(catalog.lookup(Some("de")), Some("")),
            "Challenge \"Reto\" nicht abgeschlossen"
        );
    }

    #[test]
    fn test_reason_replaces_every_title_token() {
        let locale = LocaleStrings {
            challenge_card: ChallengeCardStrings {
                challenge_not_completed: "{title}: \"{title}\" not done".into(),
                new_fine_received: String::new(),
                fine_received_body: String::new(),
            },
        };
        assert_eq!(
            challenge_reason(&locale, Some("Plank")),
            "Plank: \"Plank\" not done"
        );
    }

    #[tokio::test]
    async fn test_candidate_fetch_failure_aborts_pass() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let reconciler = reconciler_with(
            store.clone(),
            Arc::new(RecordingPush::default()),
            ReconcilerSettings::default(),
        );

        store.set_failing(StoreOp::PendingCandidates, true);
        assert!(matches!(
            reconciler.run_pass(ids.creator).await,
            PassOutcome::Aborted { .. }
        ));

        // The lease was released, so another instance is not locked out
        store.set_failing(StoreOp::PendingCandidates, false);
        let other = reconciler_with(
            store.clone(),
            Arc::new(RecordingPush::default()),
            ReconcilerSettings::default(),
        );
        assert_eq!(completed(other.run_pass(ids.creator).await).fines_created, 1);
    }

    #[tokio::test]
    async fn test_lease_store_failure_aborts_pass() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store.set_failing(StoreOp::AcquireLease, true);

        let reconciler = reconciler_with(
            store.clone(),
            Arc::new(RecordingPush::default()),
            ReconcilerSettings::default(),
        );
        assert!(matches!(
            reconciler.run_pass(ids.creator).await,
            PassOutcome::Aborted { .. }
        ));
        assert!(store.fines().await.is_empty());
    }

    #[tokio::test]
    async fn test_winner_profile_failure_uses_candidate_name() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store
            .upsert_user(UserProfile {
                language: Some("en".into()),
                ..profile(ids.recipient)
            })
            .await;
        store.set_failing(StoreOp::UserProfile(ids.winner), true);

        let reconciler = reconciler_with(
            store.clone(),
            Arc::new(RecordingPush::default()),
            ReconcilerSettings::default(),
        );
        reconciler.run_pass(ids.creator).await;

        let fine = &store.fines().await[0];
        assert_eq!(fine.sender_id, ids.winner);
        assert_eq!(fine.sender_name, "Creator");
        assert_eq!(fine.sender_phone, "");
        assert_eq!(fine.reason, "Did not complete the challenge \"10k steps\"");
    }

    #[tokio::test]
    async fn test_recipient_profile_failure_uses_fallback_language() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store
            .upsert_user(UserProfile {
                language: Some("en".into()),
                ..profile(ids.recipient)
            })
            .await;
        store.set_failing(StoreOp::UserProfile(ids.recipient), true);

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());
        reconciler.run_pass(ids.creator).await;

        let fine = &store.fines().await[0];
        assert_eq!(fine.sender_name, "Alice");
        assert_eq!(fine.reason, "No completó el reto \"10k steps\"");
        assert_eq!(push.deliveries.lock()[0].1.title, "¡Nueva multa recibida!");
    }

    #[tokio::test]
    async fn test_subscription_lookup_failure_keeps_fine() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        store.set_failing(StoreOp::PushSubscriptions, true);

        let push = Arc::new(RecordingPush::default());
        let reconciler = reconciler_with(store.clone(), push.clone(), ReconcilerSettings::default());

        let report = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(report.fines_created, 1);
        assert_eq!(report.pushes_sent, 0);
        assert_eq!(report.push_failures, 0);
        assert!(push.deliveries.lock().is_empty());

        // The fine exists, so the candidate is not picked up again
        store.set_failing(StoreOp::PushSubscriptions, false);
        assert_eq!(completed(reconciler.run_pass(ids.creator).await).candidates, 0);
        assert_eq!(store.fines().await.len(), 1);
    }

    #[tokio::test]
    async fn test_winner_lookup_error_is_not_an_attempt() {
        let ids = Ids::new();
        let store = seeded_store(&ids).await;
        let pending = store.pending_candidates(ids.creator).await.unwrap()[0].clone();
        store.set_failing(StoreOp::FindWinner, true);

        let settings = ReconcilerSettings {
            max_candidate_attempts: 1,
            ..Default::default()
        };
        let reconciler = reconciler_with(store.clone(), Arc::new(RecordingPush::default()), settings);

        let failed = completed(reconciler.run_pass(ids.creator).await);
        assert_eq!(failed.unresolved, 1);
        assert_eq!(failed.dead_lettered, 0);
        assert_eq!(store.candidate_attempts(pending.id).await, 0);

        store.set_failing(StoreOp::FindWinner, false);
        assert_eq!(completed(reconciler.run_pass(ids.creator).await).fines_created, 1);
    }

    #[tokio::test]
    async fn test_long_pass_keeps_its_lease() {
        let ids = Ids::new();
        let store = Arc::new(InMemoryStore::new());
        store.add_participant(participant(ids.challenge, ids.winner, true)).await;
        for n in 0..4 {
            let recipient = Uuid::new_v4();
            store
                .add_candidate(ChallengeFineCandidate {
                    recipient_id: recipient,
                    ..candidate(&ids, dec!(5), None)
                })
                .await;
            store
                .add_subscription(recipient, subscription(&format!("https://push.example.com/{}", n)))
                .await;
        }

        // Each candidate outlasts part of the TTL; the whole pass outlasts all of it
        let settings = ReconcilerSettings {
            lease_ttl: Duration::from_millis(150),
            ..Default::default()
        };
        let first = Arc::new(reconciler_with(
            store.clone(),
            Arc::new(SlowPush(Duration::from_millis(100))),
            settings.clone(),
        ));
        let second = reconciler_with(store.clone(), Arc::new(RecordingPush::default()), settings);

        let running = {
            let first = first.clone();
            let user = ids.creator;
            tokio::spawn(async move { first.run_pass(user).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            second.run_pass(ids.creator).await,
            PassOutcome::Skipped {
                reason: SkipReason::LeaseHeld
            }
        );

        let report = completed(running.await.unwrap());
        assert_eq!(report.fines_created, 4);
    }
}
