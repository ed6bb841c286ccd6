//! A multi-step role application workflow for chat guilds.
//!
//! Members apply for a role type, answer a fixed question list over direct
//! messages, and their completed application is posted to a review channel
//! where moderators approve or deny it. Sessions and applications are
//! persisted in SQLite, so an interrupted conversation survives a restart,
//! and a background sweeper expires applications left unanswered too long.

pub mod commands;
pub mod config;
pub mod decision;
pub mod dispatch;
pub mod eligibility;
pub mod intake;
pub mod platform;
pub mod store;
pub mod sweeper;

pub use commands::IntakeService;
pub use config::{Config, IntakePolicy};
pub use intake::engine::{SessionEngine, StartError, SubmitOutcome};
pub use intake::session::{Session, CANCEL_KEYWORD};
pub use intake::types::{
    Application, ApplicationId, ApplicationStatus, ChannelId, GuildId, RoleId, RoleType, UserId,
};
pub use platform::{ChatPlatform, GuildRole, Member};
pub use store::{SqliteStore, StoreError};
