//! Approving and denying completed applications.
//!
//! Every decision is checkpointed so a failure partway leaves a retryable
//! state: role grant happens before the status flip, so a grant failure
//! leaves the application completed and the decision retryable, and an
//! undeliverable notification DM never rolls the decision back.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::dispatch::is_moderator;
use crate::intake::engine::SessionEngine;
use crate::intake::types::{Application, GuildId, RoleType, UserId};
use crate::platform::{dm_with_timeout, ChatPlatform, Member};
use crate::store::{SqliteStore, StoreError};

#[derive(Debug)]
pub enum DecisionError {
    NotAuthorized,
    NoApplication,
    NoRoleMapping { role_type: RoleType },
    RoleGrantFailed { detail: String },
    Store(StoreError),
}

impl std::fmt::Display for DecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthorized => write!(f, "only moderators may decide applications"),
            Self::NoApplication => write!(f, "no completed application awaiting decision"),
            Self::NoRoleMapping { role_type } => {
                write!(f, "no role is mapped for the {role_type} role type")
            }
            Self::RoleGrantFailed { detail } => write!(f, "granting the role failed: {detail}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DecisionError {}

impl From<StoreError> for DecisionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// A decision that went through, with the application it applied to.
#[derive(Debug)]
pub struct DecisionOutcome {
    pub application: Application,
}

pub struct DecisionHandler {
    store: Arc<SqliteStore>,
    platform: Arc<dyn ChatPlatform>,
    engine: Arc<SessionEngine>,
}

impl DecisionHandler {
    pub fn new(
        store: Arc<SqliteStore>,
        platform: Arc<dyn ChatPlatform>,
        engine: Arc<SessionEngine>,
    ) -> Self {
        Self {
            store,
            platform,
            engine,
        }
    }

    async fn completed_application(
        &self,
        moderator: &Member,
        applicant: UserId,
        guild: GuildId,
    ) -> Result<Application, DecisionError> {
        if !is_moderator(moderator) {
            return Err(DecisionError::NotAuthorized);
        }
        self.store
            .completed_application(applicant, guild)
            .await?
            .ok_or(DecisionError::NoApplication)
    }

    /// Approve the applicant's completed application: grant the mapped role,
    /// mark the application approved, and notify the applicant.
    ///
    /// A missing role mapping or a failed grant leaves the application
    /// completed, so the decision can be retried after the guild is fixed.
    pub async fn approve(
        &self,
        moderator: &Member,
        applicant: UserId,
        guild: GuildId,
    ) -> Result<DecisionOutcome, DecisionError> {
        let application = self.completed_application(moderator, applicant, guild).await?;

        let role = self
            .store
            .role_mapping(guild, application.role_type)
            .await?
            .ok_or(DecisionError::NoRoleMapping {
                role_type: application.role_type,
            })?;

        let grant = tokio::time::timeout(
            crate::platform::EXTERNAL_CALL_TIMEOUT,
            self.platform.grant_role(guild, applicant, role),
        )
        .await;
        match grant {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(DecisionError::RoleGrantFailed {
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DecisionError::RoleGrantFailed {
                    detail: "role grant timed out".to_string(),
                })
            }
        }

        let transitioned = self
            .store
            .approve_application(application.id, applicant, application.role_type, Utc::now())
            .await?;
        if !transitioned {
            // Raced another decision after the grant; the role is already
            // correct, so just report no application.
            return Err(DecisionError::NoApplication);
        }

        self.engine.clear_pending(applicant, guild).await;

        info!(
            "Approved application {} for user {} by moderator {}",
            application.id, applicant, moderator.user_id
        );

        let message = format!(
            "Your {} application has been approved. Welcome!",
            application.role_type.display_name()
        );
        if let Err(e) = dm_with_timeout(self.platform.as_ref(), applicant, &message).await {
            warn!(
                "Could not notify user {} of their approval: {}",
                applicant, e
            );
        }

        Ok(DecisionOutcome { application })
    }

    /// Deny the applicant's completed application and notify them, with the
    /// moderator's reason if one was given.
    pub async fn deny(
        &self,
        moderator: &Member,
        applicant: UserId,
        guild: GuildId,
        reason: Option<&str>,
    ) -> Result<DecisionOutcome, DecisionError> {
        let application = self.completed_application(moderator, applicant, guild).await?;

        let transitioned = self.store.deny_application(application.id).await?;
        if !transitioned {
            return Err(DecisionError::NoApplication);
        }

        self.engine.clear_pending(applicant, guild).await;

        info!(
            "Denied application {} for user {} by moderator {}",
            application.id, applicant, moderator.user_id
        );

        let message = match reason {
            Some(reason) => format!(
                "Your {} application has been denied. Reason: {reason}",
                application.role_type.display_name()
            ),
            None => format!(
                "Your {} application has been denied.",
                application.role_type.display_name()
            ),
        };
        if let Err(e) = dm_with_timeout(self.platform.as_ref(), applicant, &message).await {
            warn!("Could not notify user {} of the denial: {}", applicant, e);
        }

        Ok(DecisionOutcome { application })
    }

    /// Role types this user has been approved for, most recent last.
    pub async fn approved_role_types(
        &self,
        user: UserId,
    ) -> Result<Vec<(RoleType, chrono::DateTime<Utc>)>, StoreError> {
        self.store.approved_role_types(user).await
    }
}
