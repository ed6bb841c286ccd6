//! Collaborator contract for the chat-platform layer.
//!
//! The intake workflow never talks to Discord directly. Everything it needs
//! from the platform — DM delivery, channel posts, role grants, member
//! metadata — goes through the [`ChatPlatform`] trait, so the engine can be
//! driven by a real gateway client in production and by an in-memory fake in
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::intake::types::{ChannelId, GuildId, RoleId, UserId};

/// Upper bound on any single outbound platform call.
///
/// DM sends and role grants must not stall the per-user session lock, so
/// callers wrap them in [`dm_with_timeout`] / [`tokio::time::timeout`].
pub const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// A direct message could not be delivered.
///
/// Covers the recipient blocking DMs as well as transport errors. Per the
/// error-handling contract, delivery failure never rolls back intake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable(pub String);

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recipient unreachable: {}", self.0)
    }
}

impl std::error::Error for Unreachable {}

/// Guild membership metadata needed for eligibility and authorization checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: UserId,
    /// When the account was created (not when it joined the guild).
    pub account_created_at: DateTime<Utc>,
    /// Whether the member holds the administrator permission.
    pub is_administrator: bool,
    /// Names of the roles the member currently holds.
    pub role_names: Vec<String>,
}

/// A role defined in a guild, used to resolve the moderator audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRole {
    pub id: RoleId,
    pub name: String,
}

/// The message-send/role-grant primitives the intake workflow depends on.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Send a direct message to a user.
    async fn send_direct_message(&self, user: UserId, content: &str) -> Result<(), Unreachable>;

    /// Post a message to a guild channel.
    async fn send_to_channel(&self, channel: ChannelId, content: &str) -> anyhow::Result<()>;

    /// Grant a role to a guild member.
    async fn grant_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()>;

    /// Revoke a role from a guild member.
    async fn revoke_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()>;

    /// Fetch membership metadata, or `None` if the user is not in the guild.
    async fn member(&self, guild: GuildId, user: UserId) -> anyhow::Result<Option<Member>>;

    /// List the roles defined in a guild.
    async fn guild_roles(&self, guild: GuildId) -> anyhow::Result<Vec<GuildRole>>;
}

/// Send a DM with the standard external-call timeout applied.
pub async fn dm_with_timeout(
    platform: &dyn ChatPlatform,
    user: UserId,
    content: &str,
) -> Result<(), Unreachable> {
    match tokio::time::timeout(
        EXTERNAL_CALL_TIMEOUT,
        platform.send_direct_message(user, content),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Unreachable("direct message timed out".to_string())),
    }
}
