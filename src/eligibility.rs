//! Pre-flight checks run before a session may start.
//!
//! Checks run in a fixed order (role parse, rate limit, account age, pending
//! check) and the first failure wins, so a user sees one denial reason at a
//! time. An attempt is charged against the rate limit only when the gate
//! allows the application through.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::IntakePolicy;
use crate::intake::types::{GuildId, RoleType, UserId};
use crate::platform::Member;
use crate::store::{SqliteStore, StoreError};

/// Why an application attempt was turned away.
#[derive(Debug, PartialEq, Eq)]
pub enum Denied {
    UnknownRoleType { supplied: String },
    RateLimited,
    AccountTooYoung { required_days: i64 },
    AlreadyPending,
}

impl std::fmt::Display for Denied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRoleType { supplied } => {
                write!(f, "unknown role type {supplied:?}")
            }
            Self::RateLimited => write!(f, "too many recent application attempts"),
            Self::AccountTooYoung { required_days } => {
                write!(f, "account must be at least {required_days} days old")
            }
            Self::AlreadyPending => write!(f, "an application is already in progress"),
        }
    }
}

#[derive(Debug)]
pub enum GateOutcome {
    Allow(RoleType),
    Deny(Denied),
}

pub struct EligibilityGate {
    store: Arc<SqliteStore>,
    policy: IntakePolicy,
}

impl EligibilityGate {
    pub fn new(store: Arc<SqliteStore>, policy: IntakePolicy) -> Self {
        Self { store, policy }
    }

    /// Run every check for one attempt. Denials are normal outcomes, not
    /// errors; `Err` means the store itself failed.
    pub async fn check(
        &self,
        user: UserId,
        guild: GuildId,
        role_type_raw: &str,
        member: &Member,
    ) -> Result<GateOutcome, StoreError> {
        let role_type: RoleType = match role_type_raw.parse() {
            Ok(rt) => rt,
            Err(e) => {
                info!("Denied application from user {}: {}", user, e);
                return Ok(GateOutcome::Deny(Denied::UnknownRoleType {
                    supplied: role_type_raw.trim().to_string(),
                }));
            }
        };

        let now = Utc::now();

        let cutoff = now - self.policy.attempt_window;
        let attempts = self.store.attempts_in_window(user, cutoff).await?;
        if attempts >= self.policy.max_attempts {
            info!(
                "Denied application from user {}: {} attempts in window (max {})",
                user, attempts, self.policy.max_attempts
            );
            return Ok(GateOutcome::Deny(Denied::RateLimited));
        }

        let account_age = now - member.account_created_at;
        if account_age < self.policy.min_account_age {
            info!(
                "Denied application from user {}: account is {} day(s) old (minimum {})",
                user,
                account_age.num_days(),
                self.policy.min_account_age.num_days()
            );
            return Ok(GateOutcome::Deny(Denied::AccountTooYoung {
                required_days: self.policy.min_account_age.num_days(),
            }));
        }

        if self.store.has_pending_application(user, guild).await? {
            info!(
                "Denied application from user {} in guild {}: already pending",
                user, guild
            );
            return Ok(GateOutcome::Deny(Denied::AlreadyPending));
        }

        // Only successful attempts are charged; a denial does not burn one of
        // the user's tries.
        self.store.record_attempt(user, now).await?;
        Ok(GateOutcome::Allow(role_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn member_aged(days: i64) -> Member {
        Member {
            user_id: UserId(1),
            account_created_at: Utc::now() - Duration::days(days),
            is_administrator: false,
            role_names: Vec::new(),
        }
    }

    fn gate() -> EligibilityGate {
        EligibilityGate::new(
            Arc::new(SqliteStore::new_in_memory().unwrap()),
            IntakePolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_allows_eligible_member() {
        let gate = gate();
        let outcome = gate
            .check(UserId(1), GuildId(1), "developer", &member_aged(30))
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Allow(RoleType::Developer)));
    }

    #[tokio::test]
    async fn test_denies_unknown_role_type() {
        let gate = gate();
        let outcome = gate
            .check(UserId(1), GuildId(1), "wizard", &member_aged(30))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GateOutcome::Deny(Denied::UnknownRoleType { .. })
        ));
    }

    #[tokio::test]
    async fn test_denies_young_account() {
        let gate = gate();
        let outcome = gate
            .check(UserId(1), GuildId(1), "developer", &member_aged(3))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GateOutcome::Deny(Denied::AccountTooYoung { required_days: 7 })
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_denies_fourth_attempt() {
        let gate = gate();
        for _ in 0..3 {
            let outcome = gate
                .check(UserId(1), GuildId(1), "developer", &member_aged(30))
                .await
                .unwrap();
            assert!(matches!(outcome, GateOutcome::Allow(_)));
            // Eligible attempts that never become pending (dropped DM, say)
            // still count against the limit.
            gate.store
                .cancel_application(UserId(1), GuildId(1), &Default::default())
                .await
                .unwrap();
        }

        let outcome = gate
            .check(UserId(1), GuildId(1), "developer", &member_aged(30))
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Deny(Denied::RateLimited)));
    }

    #[tokio::test]
    async fn test_denied_attempts_are_not_charged() {
        let gate = gate();
        // Burn nothing with denials
        for _ in 0..10 {
            gate.check(UserId(1), GuildId(1), "wizard", &member_aged(30))
                .await
                .unwrap();
        }
        let outcome = gate
            .check(UserId(1), GuildId(1), "developer", &member_aged(30))
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Allow(_)));
    }

    #[tokio::test]
    async fn test_denies_when_pending_exists_in_store() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        store
            .create_pending_application(UserId(1), GuildId(1), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        let gate = EligibilityGate::new(store, IntakePolicy::default());
        let outcome = gate
            .check(UserId(1), GuildId(1), "developer", &member_aged(30))
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Deny(Denied::AlreadyPending)));
    }
}
