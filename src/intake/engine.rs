//! In-memory session engine over the persistent store.
//!
//! The store is authoritative; the engine keeps two caches on top of it: the
//! active sessions map and the pending-pair set. Both are written through on
//! every mutation and rebuilt from the store by [`SessionEngine::rehydrate`]
//! at startup. All mutations for a given user are serialized through a
//! per-user async lock so interleaved replies, cancels, and sweeps cannot
//! corrupt a session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::intake::session::{AnswerProgress, Session};
use crate::intake::types::{Application, GuildId, RoleType, UserId};
use crate::store::{SqliteStore, StoreError};

/// Why a new session could not be started.
#[derive(Debug)]
pub enum StartError {
    AlreadyPending,
    Store(StoreError),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyPending => write!(f, "a pending application already exists"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StartError {}

impl From<StoreError> for StartError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicatePending => Self::AlreadyPending,
            other => Self::Store(other),
        }
    }
}

/// Result of feeding one direct-message reply into the workflow.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The user has no active session; the reply is ignored.
    NoActiveSession,
    /// The answer was recorded; ask the next question.
    Advanced { question: &'static str },
    /// The final answer arrived and the application is now completed.
    Completed { application: Application },
    /// The user sent the cancel keyword.
    Cancelled,
}

pub struct SessionEngine {
    store: Arc<SqliteStore>,
    sessions: RwLock<HashMap<UserId, Session>>,
    pending: RwLock<HashSet<(UserId, GuildId)>>,
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl SessionEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashSet::new()),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user).or_default().clone()
    }

    /// Drop the user's lock-map entry once nothing holds or awaits it, so
    /// the map does not grow by one entry per user ever seen. A waiter holds
    /// its own clone of the `Arc`, which keeps the entry alive.
    async fn prune_user_lock(&self, user: UserId) {
        let mut locks = self.user_locks.lock().await;
        if locks.get(&user).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&user);
        }
    }

    /// Rebuild the session and pending caches from the store.
    ///
    /// Call once at startup, before serving traffic. Interrupted sessions
    /// resume at their persisted question index.
    pub async fn rehydrate(&self) -> Result<(), StoreError> {
        let persisted = self.store.load_sessions().await?;
        let pairs = self.store.pending_pairs().await?;

        info!(
            "Rehydrated {} active session(s) and {} pending application(s)",
            persisted.len(),
            pairs.len()
        );

        let mut sessions = self.sessions.write().await;
        sessions.clear();
        for session in persisted {
            sessions.insert(session.user_id, session);
        }

        let mut pending = self.pending.write().await;
        pending.clear();
        pending.extend(pairs);

        Ok(())
    }

    /// Begin a new application session.
    ///
    /// Creates the pending application row and the session row, then
    /// populates the caches. The store's unique index is the final arbiter
    /// of the single-pending invariant; the cache check just saves a write.
    pub async fn start(
        &self,
        user: UserId,
        guild: GuildId,
        role_type: RoleType,
    ) -> Result<Session, StartError> {
        let lock = self.user_lock(user).await;
        let guard = lock.lock().await;
        let result = self.start_locked(user, guild, role_type).await;
        drop(guard);
        drop(lock);
        self.prune_user_lock(user).await;
        result
    }

    async fn start_locked(
        &self,
        user: UserId,
        guild: GuildId,
        role_type: RoleType,
    ) -> Result<Session, StartError> {
        if self.pending.read().await.contains(&(user, guild)) {
            return Err(StartError::AlreadyPending);
        }

        // One transaction writes both the pending row and the session row,
        // so a failure cannot strand a pending application whose replies
        // have no session to route to.
        let session = Session::new(user, guild, role_type, Utc::now());
        self.store.start_application(&session).await?;

        self.sessions.write().await.insert(user, session.clone());
        self.pending.write().await.insert((user, guild));

        info!(
            "Started {} application session for user {} in guild {}",
            role_type, user, guild
        );
        Ok(session)
    }

    /// Feed one direct-message reply into the user's session.
    pub async fn submit_answer(
        &self,
        user: UserId,
        text: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        let lock = self.user_lock(user).await;
        let guard = lock.lock().await;
        let result = self.submit_answer_locked(user, text).await;
        drop(guard);
        drop(lock);
        self.prune_user_lock(user).await;
        result
    }

    async fn submit_answer_locked(
        &self,
        user: UserId,
        text: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        let Some(mut session) = self.sessions.read().await.get(&user).cloned() else {
            debug!("Ignoring direct message from user {} with no active session", user);
            return Ok(SubmitOutcome::NoActiveSession);
        };
        let guild = session.guild_id;

        if Session::is_cancel(text) {
            self.cancel_locked(&session).await?;
            return Ok(SubmitOutcome::Cancelled);
        }

        match session.record_answer(text) {
            AnswerProgress::Advanced { next_question } => {
                // Persist before answering so a crash never loses a recorded
                // answer the user was told was accepted.
                self.store.upsert_session(&session).await?;
                self.sessions.write().await.insert(user, session);
                Ok(SubmitOutcome::Advanced {
                    question: next_question,
                })
            }
            AnswerProgress::AllAnswered => {
                match self
                    .store
                    .complete_application(user, guild, &session.answers)
                    .await?
                {
                    Some(application) => {
                        self.sessions.write().await.remove(&user);
                        self.pending.write().await.remove(&(user, guild));
                        info!(
                            "User {} completed their {} application in guild {}",
                            user, application.role_type, guild
                        );
                        Ok(SubmitOutcome::Completed { application })
                    }
                    None => {
                        // The pending row vanished underneath us (expired by
                        // the sweeper on another node, say). Drop the stale
                        // cache entry and treat the reply as sessionless.
                        self.sessions.write().await.remove(&user);
                        self.pending.write().await.remove(&(user, guild));
                        self.store.delete_session(user).await?;
                        Ok(SubmitOutcome::NoActiveSession)
                    }
                }
            }
        }
    }

    /// Cancel the user's active session, if any. Returns whether one was
    /// cancelled.
    pub async fn cancel(&self, user: UserId) -> Result<bool, StoreError> {
        let lock = self.user_lock(user).await;
        let guard = lock.lock().await;
        let result = match self.sessions.read().await.get(&user).cloned() {
            Some(session) => self.cancel_locked(&session).await.map(|()| true),
            None => Ok(false),
        };
        drop(guard);
        drop(lock);
        self.prune_user_lock(user).await;
        result
    }

    // Caller must hold the user's lock.
    async fn cancel_locked(&self, session: &Session) -> Result<(), StoreError> {
        let user = session.user_id;
        let guild = session.guild_id;
        self.store
            .cancel_application(user, guild, &session.answers)
            .await?;
        self.sessions.write().await.remove(&user);
        self.pending.write().await.remove(&(user, guild));
        info!("User {} cancelled their application in guild {}", user, guild);
        Ok(())
    }

    /// The user's active session, if any.
    pub async fn active_session(&self, user: UserId) -> Option<Session> {
        self.sessions.read().await.get(&user).cloned()
    }

    /// Drop a (user, guild) pair from the pending cache.
    ///
    /// Idempotent; the decision handler calls this after approve/deny even
    /// though completion already cleared it.
    pub async fn clear_pending(&self, user: UserId, guild: GuildId) {
        self.pending.write().await.remove(&(user, guild));
    }

    /// Expire every pending application submitted before the cutoff.
    ///
    /// Takes each user's lock before expiring so a reply completing the
    /// application mid-sweep cannot race; the store's conditional UPDATE is
    /// the second line of defense. Returns the pairs actually expired.
    pub async fn expire_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(UserId, GuildId)>, StoreError> {
        let stale = self.store.stale_pending_applications(cutoff).await?;
        let mut expired = Vec::new();

        for (id, user, guild) in stale {
            let lock = self.user_lock(user).await;
            let guard = lock.lock().await;
            let result = self.store.expire_application(id, user).await;
            if let Ok(true) = result {
                self.sessions.write().await.remove(&user);
                self.pending.write().await.remove(&(user, guild));
                info!(
                    "Expired stale application {} for user {} in guild {}",
                    id, user, guild
                );
                expired.push((user, guild));
            }
            drop(guard);
            drop(lock);
            self.prune_user_lock(user).await;
            result?;
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> UserId {
        UserId(7)
    }

    fn guild() -> GuildId {
        GuildId(70)
    }

    async fn engine() -> SessionEngine {
        SessionEngine::new(Arc::new(SqliteStore::new_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_start_rejects_second_pending() {
        let engine = engine().await;
        engine.start(user(), guild(), RoleType::Developer).await.unwrap();

        let err = engine
            .start(user(), guild(), RoleType::Advertiser)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::AlreadyPending));
    }

    #[tokio::test]
    async fn test_start_rejects_pending_even_with_cold_cache() {
        // The cache check can miss (fresh process); the store's unique index
        // must still hold the invariant.
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let first = SessionEngine::new(store.clone());
        first.start(user(), guild(), RoleType::Developer).await.unwrap();

        let second = SessionEngine::new(store);
        let err = second
            .start(user(), guild(), RoleType::Developer)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::AlreadyPending));
    }

    #[tokio::test]
    async fn test_rejected_start_leaves_no_session_row() {
        // The pending insert and the session write share one transaction,
        // so a rejected start must not leave either row behind.
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        let engine = SessionEngine::new(store.clone());
        let err = engine
            .start(user(), guild(), RoleType::Developer)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::AlreadyPending));
        assert!(store.get_session(user()).await.unwrap().is_none());
        assert!(engine.active_session(user()).await.is_none());
    }

    #[tokio::test]
    async fn test_user_lock_map_does_not_accumulate() {
        let engine = engine().await;

        for n in 0..10 {
            let user = UserId(n);
            engine.start(user, guild(), RoleType::Advertiser).await.unwrap();
            for answer in ["Yes", "A thing", "Weekly"] {
                engine.submit_answer(user, answer).await.unwrap();
            }
        }
        // Sessionless replies must not pin an entry either
        engine.submit_answer(UserId(99), "hello").await.unwrap();

        assert!(engine.user_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_answer_sequence_completes() {
        let engine = engine().await;
        let session = engine.start(user(), guild(), RoleType::Advertiser).await.unwrap();
        assert_eq!(session.current_question, 0);

        let outcome = engine.submit_answer(user(), "Yes").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Advanced { .. }));

        let outcome = engine.submit_answer(user(), "My plugin").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Advanced { .. }));

        let outcome = engine.submit_answer(user(), "Monthly").await.unwrap();
        let SubmitOutcome::Completed { application } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(application.answers.len(), 3);
        assert_eq!(application.answers.get(&2).map(String::as_str), Some("Monthly"));

        assert!(engine.active_session(user()).await.is_none());
    }

    #[tokio::test]
    async fn test_reply_without_session_is_ignored() {
        let engine = engine().await;
        let outcome = engine.submit_answer(user(), "hello?").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::NoActiveSession));
    }

    #[tokio::test]
    async fn test_cancel_clears_session_and_pending() {
        let engine = engine().await;
        engine.start(user(), guild(), RoleType::Developer).await.unwrap();
        engine.submit_answer(user(), "Rust and Python").await.unwrap();

        let outcome = engine.submit_answer(user(), "  CANCEL  ").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Cancelled));
        assert!(engine.active_session(user()).await.is_none());

        // Free to reapply (subject to rate limiting upstream)
        engine.start(user(), guild(), RoleType::Developer).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_without_keyword() {
        let engine = engine().await;
        assert!(!engine.cancel(user()).await.unwrap());

        engine.start(user(), guild(), RoleType::Developer).await.unwrap();
        assert!(engine.cancel(user()).await.unwrap());
        assert!(engine.active_session(user()).await.is_none());
    }

    #[tokio::test]
    async fn test_rehydrate_restores_mid_session_state() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let first = SessionEngine::new(store.clone());
        first.start(user(), guild(), RoleType::Developer).await.unwrap();
        first.submit_answer(user(), "Rust").await.unwrap();
        first.submit_answer(user(), "github.com/me/proj").await.unwrap();

        // Simulated restart
        let second = SessionEngine::new(store);
        second.rehydrate().await.unwrap();

        let session = second.active_session(user()).await.expect("session should survive");
        assert_eq!(session.current_question, 2);
        assert_eq!(session.answers.len(), 2);

        // And the remaining questions still complete the application
        second.submit_answer(user(), "Five years").await.unwrap();
        let outcome = second.submit_answer(user(), "I like the community").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_expire_stale_only_touches_old_pending() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let engine = SessionEngine::new(store.clone());
        let now = Utc::now();

        engine.start(UserId(1), guild(), RoleType::Developer).await.unwrap();
        engine.start(UserId(2), guild(), RoleType::Developer).await.unwrap();

        let stale_id = store
            .stale_pending_applications(now + Duration::hours(1))
            .await
            .unwrap()
            .iter()
            .find(|(_, u, _)| *u == UserId(1))
            .map(|(id, _, _)| *id)
            .unwrap();
        store
            .set_submitted_at(stale_id, now - Duration::minutes(61))
            .await
            .unwrap();

        let expired = engine.expire_stale(now - Duration::hours(1)).await.unwrap();
        assert_eq!(expired, vec![(UserId(1), guild())]);

        assert!(engine.active_session(UserId(1)).await.is_none());
        assert!(engine.active_session(UserId(2)).await.is_some());

        // The expired user can apply again
        engine.start(UserId(1), guild(), RoleType::Developer).await.unwrap();
    }
}
