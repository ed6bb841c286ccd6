//! Core types for the application intake workflow.
//!
//! Following the principle of "make illegal states unrepresentable", role
//! types are a closed enum (each with a fixed question list) and application
//! status is an enum rather than free-form strings. Newtypes keep the various
//! snowflake-style IDs from being mixed up.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Newtype for a platform user ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a guild (server) ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a channel ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for an external role ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a durable application row ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplicationId(pub i64);

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The roles a user can apply for.
///
/// Each role type carries a fixed, ordered question list. The list length
/// bounds `current_question` in a [`crate::intake::session::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleType {
    Developer,
    Advertiser,
}

impl RoleType {
    /// All configured role types, in display order.
    pub const ALL: [RoleType; 2] = [RoleType::Developer, RoleType::Advertiser];

    /// Stable identifier used in storage and command arguments.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::Advertiser => "advertiser",
        }
    }

    /// Human-facing name used in DM prompts and review records.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Developer => "Developer",
            Self::Advertiser => "Advertiser",
        }
    }

    /// The ordered question list for this role type.
    pub fn questions(&self) -> &'static [&'static str] {
        match self {
            Self::Developer => &[
                "What programming languages are you most comfortable with?",
                "Link a project or repository you are proud of.",
                "How long have you been writing software?",
                "Why do you want the developer role?",
            ],
            Self::Advertiser => &[
                "Are you the owner of the product or service you want to advertise?",
                "What will you be advertising?",
                "How often do you plan to post?",
            ],
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a role type string is not one of the configured values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRoleType {
    pub supplied: String,
}

impl fmt::Display for UnknownRoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role type: {}", self.supplied)
    }
}

impl std::error::Error for UnknownRoleType {}

impl FromStr for RoleType {
    type Err = UnknownRoleType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "developer" => Ok(Self::Developer),
            "advertiser" => Ok(Self::Advertiser),
            _ => Err(UnknownRoleType {
                supplied: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of an [`Application`].
///
/// `Pending` is the only non-terminal status. Rows are never deleted; a
/// terminal status records the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStatus {
    Pending,
    Completed,
    Approved,
    Denied,
    Cancelled,
    Expired,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered answers keyed by question index.
pub type Answers = BTreeMap<u32, String>;

/// The durable record of one intake attempt and its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: ApplicationId,
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub role_type: RoleType,
    pub answers: Answers,
    pub status: ApplicationStatus,
    pub submitted_at: DateTime<Utc>,
}
