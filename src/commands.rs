//! The user-facing command surface.
//!
//! Each handler returns the text to show the invoking user. Unexpected
//! failures (store down, platform API errors) are logged with context here at
//! the boundary and collapsed into a generic failure message; the caller
//! never sees internals.

use std::sync::Arc;

use tracing::{error, warn};

use crate::config::IntakePolicy;
use crate::decision::{DecisionError, DecisionHandler};
use crate::dispatch::{is_moderator, ReviewDispatcher};
use crate::eligibility::{Denied, EligibilityGate, GateOutcome};
use crate::intake::engine::{SessionEngine, StartError, SubmitOutcome};
use crate::intake::types::{ChannelId, GuildId, RoleId, RoleType, UserId};
use crate::platform::{dm_with_timeout, ChatPlatform, Member};
use crate::store::SqliteStore;

const GENERIC_FAILURE: &str = "Something went wrong. Please try again later.";
const DM_UNREACHABLE: &str =
    "I couldn't send you a direct message. Please enable DMs from server members and reply \
     to continue your application, or send `cancel` to abandon it.";

pub struct IntakeService {
    store: Arc<SqliteStore>,
    platform: Arc<dyn ChatPlatform>,
    engine: Arc<SessionEngine>,
    gate: EligibilityGate,
    dispatcher: ReviewDispatcher,
    decisions: DecisionHandler,
}

impl IntakeService {
    pub fn new(store: Arc<SqliteStore>, platform: Arc<dyn ChatPlatform>, policy: IntakePolicy) -> Self {
        let engine = Arc::new(SessionEngine::new(store.clone()));
        Self {
            gate: EligibilityGate::new(store.clone(), policy),
            dispatcher: ReviewDispatcher::new(store.clone(), platform.clone()),
            decisions: DecisionHandler::new(store.clone(), platform.clone(), engine.clone()),
            store,
            engine,
            platform,
        }
    }

    /// The engine, for rehydration at startup and the sweeper task.
    pub fn engine(&self) -> Arc<SessionEngine> {
        self.engine.clone()
    }

    async fn guild_member(&self, guild: GuildId, user: UserId) -> Result<Option<Member>, String> {
        match self.platform.member(guild, user).await {
            Ok(member) => Ok(member),
            Err(e) => {
                error!("Could not fetch member {} in guild {}: {:#}", user, guild, e);
                Err(GENERIC_FAILURE.to_string())
            }
        }
    }

    /// `!apply <role_type>` — run the eligibility gate, start a session, and
    /// open the DM conversation with the first question.
    pub async fn apply(&self, user: UserId, guild: GuildId, role_type_raw: &str) -> String {
        let member = match self.guild_member(guild, user).await {
            Ok(Some(member)) => member,
            Ok(None) => return "You must be a member of this server to apply.".to_string(),
            Err(msg) => return msg,
        };

        let role_type = match self.gate.check(user, guild, role_type_raw, &member).await {
            Ok(GateOutcome::Allow(role_type)) => role_type,
            Ok(GateOutcome::Deny(denied)) => return Self::denial_message(&denied),
            Err(e) => {
                error!("Eligibility check failed for user {}: {}", user, e);
                return GENERIC_FAILURE.to_string();
            }
        };

        let session = match self.engine.start(user, guild, role_type).await {
            Ok(session) => session,
            Err(StartError::AlreadyPending) => {
                return Self::denial_message(&Denied::AlreadyPending)
            }
            Err(StartError::Store(e)) => {
                error!("Could not start session for user {}: {}", user, e);
                return GENERIC_FAILURE.to_string();
            }
        };

        let Some(first_question) = session.current_question_text() else {
            error!("Role type {} has no questions configured", role_type);
            return GENERIC_FAILURE.to_string();
        };

        let intro = format!(
            "Let's start your {} application. Answer each question in a reply; send `cancel` \
             at any time to abandon it.\n\n**1.** {}",
            role_type.display_name(),
            first_question
        );
        if let Err(e) = dm_with_timeout(self.platform.as_ref(), user, &intro).await {
            // State stays put: the session is persisted and the user can
            // still answer once their DMs accept messages.
            warn!("Could not open DM conversation with user {}: {}", user, e);
            return DM_UNREACHABLE.to_string();
        }

        "Check your direct messages to complete your application.".to_string()
    }

    /// A direct-message reply from a user, fed into their session (if any).
    pub async fn handle_direct_reply(&self, user: UserId, text: &str) {
        let outcome = match self.engine.submit_answer(user, text).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Could not record answer from user {}: {}", user, e);
                let _ = dm_with_timeout(self.platform.as_ref(), user, GENERIC_FAILURE).await;
                return;
            }
        };

        match outcome {
            SubmitOutcome::NoActiveSession => {}
            SubmitOutcome::Advanced { question } => {
                let session = self.engine.active_session(user).await;
                let number = session.map(|s| s.current_question + 1).unwrap_or(0);
                let prompt = format!("**{number}.** {question}");
                if let Err(e) = dm_with_timeout(self.platform.as_ref(), user, &prompt).await {
                    warn!("Could not send next question to user {}: {}", user, e);
                }
            }
            SubmitOutcome::Completed { application } => {
                if let Err(e) = self.dispatcher.dispatch(&application).await {
                    // The application is safely completed; dispatch can be
                    // repeated by a moderator looking it up.
                    error!(
                        "Could not dispatch application {} for review: {:#}",
                        application.id, e
                    );
                }
                let confirmation = format!(
                    "Thanks! Your {} application is complete and has been sent for review. \
                     You'll hear back once a moderator has made a decision.",
                    application.role_type.display_name()
                );
                if let Err(e) = dm_with_timeout(self.platform.as_ref(), user, &confirmation).await {
                    warn!("Could not confirm completion to user {}: {}", user, e);
                }
            }
            SubmitOutcome::Cancelled => {
                let message = "Your application has been cancelled. You can apply again later.";
                if let Err(e) = dm_with_timeout(self.platform.as_ref(), user, message).await {
                    warn!("Could not confirm cancellation to user {}: {}", user, e);
                }
            }
        }
    }

    /// `!accept <user>` — approve the user's completed application.
    pub async fn accept_application(
        &self,
        moderator: &Member,
        applicant: UserId,
        guild: GuildId,
    ) -> String {
        match self.decisions.approve(moderator, applicant, guild).await {
            Ok(outcome) => format!(
                "Approved the {} application from <@{}>.",
                outcome.application.role_type.display_name(),
                applicant
            ),
            Err(e) => Self::decision_message(e, applicant),
        }
    }

    /// `!deny <user> [reason]` — deny the user's completed application.
    pub async fn deny_application(
        &self,
        moderator: &Member,
        applicant: UserId,
        guild: GuildId,
        reason: Option<&str>,
    ) -> String {
        match self.decisions.deny(moderator, applicant, guild, reason).await {
            Ok(outcome) => format!(
                "Denied the {} application from <@{}>.",
                outcome.application.role_type.display_name(),
                applicant
            ),
            Err(e) => Self::decision_message(e, applicant),
        }
    }

    /// `!applications_setup <channel>` — set the review channel for a guild.
    pub async fn applications_setup(
        &self,
        admin: &Member,
        guild: GuildId,
        channel: ChannelId,
    ) -> String {
        if !is_moderator(admin) {
            return "Only moderators can configure the application channel.".to_string();
        }
        match self.store.set_application_channel(guild, channel).await {
            Ok(()) => format!("Applications will now be posted to <#{channel}>."),
            Err(e) => {
                error!("Could not set application channel for guild {}: {}", guild, e);
                GENERIC_FAILURE.to_string()
            }
        }
    }

    /// `!setup_role <role_type> <role>` — map a role type to the guild role
    /// granted on approval.
    pub async fn setup_role(
        &self,
        admin: &Member,
        guild: GuildId,
        role_type_raw: &str,
        role: RoleId,
    ) -> String {
        if !is_moderator(admin) {
            return "Only moderators can configure role mappings.".to_string();
        }
        let role_type: RoleType = match role_type_raw.parse() {
            Ok(rt) => rt,
            Err(e) => return e.to_string(),
        };
        match self.store.set_role_mapping(guild, role_type, role).await {
            Ok(()) => format!(
                "Approved {} applications will now receive <@&{}>.",
                role_type.display_name(),
                role
            ),
            Err(e) => {
                error!("Could not set role mapping for guild {}: {}", guild, e);
                GENERIC_FAILURE.to_string()
            }
        }
    }

    fn denial_message(denied: &Denied) -> String {
        match denied {
            Denied::UnknownRoleType { supplied } => {
                let known = RoleType::ALL
                    .iter()
                    .map(|rt| rt.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Unknown role type {supplied:?}. Available role types: {known}.")
            }
            Denied::RateLimited => {
                "You've hit the application attempt limit. Please try again later.".to_string()
            }
            Denied::AccountTooYoung { required_days } => format!(
                "Your account must be at least {required_days} days old to apply."
            ),
            Denied::AlreadyPending => {
                "You already have an application in progress. Finish it in your DMs or send \
                 `cancel` there to abandon it."
                    .to_string()
            }
        }
    }

    fn decision_message(error: DecisionError, applicant: UserId) -> String {
        match error {
            DecisionError::NotAuthorized => {
                "Only moderators can decide applications.".to_string()
            }
            DecisionError::NoApplication => format!(
                "<@{applicant}> has no completed application awaiting a decision."
            ),
            DecisionError::NoRoleMapping { role_type } => format!(
                "No role is mapped for the {} role type. Run the role setup command, then \
                 retry this decision.",
                role_type.display_name()
            ),
            DecisionError::RoleGrantFailed { detail } => {
                error!("Role grant failed: {}", detail);
                "Granting the role failed; the application is still awaiting a decision. \
                 Please retry."
                    .to_string()
            }
            DecisionError::Store(e) => {
                error!("Decision failed: {}", e);
                GENERIC_FAILURE.to_string()
            }
        }
    }
}
