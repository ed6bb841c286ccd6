//! Posting completed applications to the guild's review channel.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::intake::types::Application;
use crate::platform::{ChatPlatform, Member};
use crate::store::SqliteStore;

/// Role-name fragments that mark a guild role as a reviewer audience.
pub const MODERATOR_ROLE_KEYWORDS: [&str; 3] = ["mod", "admin", "staff"];

/// Whether a member may review applications or run setup commands.
///
/// Administrators always qualify; otherwise any role whose name contains a
/// keyword (case-insensitive) does.
pub fn is_moderator(member: &Member) -> bool {
    if member.is_administrator {
        return true;
    }
    member.role_names.iter().any(|name| {
        let lowered = name.to_lowercase();
        MODERATOR_ROLE_KEYWORDS
            .iter()
            .any(|kw| lowered.contains(kw))
    })
}

pub struct ReviewDispatcher {
    store: Arc<SqliteStore>,
    platform: Arc<dyn ChatPlatform>,
}

impl ReviewDispatcher {
    pub fn new(store: Arc<SqliteStore>, platform: Arc<dyn ChatPlatform>) -> Self {
        Self { store, platform }
    }

    /// Post a completed application to the guild's configured review channel,
    /// mentioning any reviewer roles found in the guild.
    ///
    /// A guild with no configured channel is not an error: the application
    /// stays completed and reviewable once a channel is set up.
    pub async fn dispatch(&self, application: &Application) -> Result<()> {
        let Some(channel) = self
            .store
            .application_channel(application.guild_id)
            .await
            .context("looking up review channel")?
        else {
            info!(
                "No review channel configured for guild {}; application {} awaits setup",
                application.guild_id, application.id
            );
            return Ok(());
        };

        let record = self.render(application).await?;
        self.platform
            .send_to_channel(channel, &record)
            .await
            .with_context(|| {
                format!(
                    "posting application {} to channel {}",
                    application.id, channel
                )
            })?;

        info!(
            "Dispatched application {} for review in channel {}",
            application.id, channel
        );
        Ok(())
    }

    async fn render(&self, application: &Application) -> Result<String> {
        let mut record = String::new();
        let _ = writeln!(
            record,
            "**New {} application** from <@{}>",
            application.role_type.display_name(),
            application.user_id
        );
        let _ = writeln!(
            record,
            "Submitted at {}",
            application.submitted_at.format("%Y-%m-%d %H:%M UTC")
        );
        let _ = writeln!(record);

        for (index, question) in application.role_type.questions().iter().enumerate() {
            let answer = application
                .answers
                .get(&(index as u32))
                .map(String::as_str)
                .unwrap_or("(no answer)");
            let _ = writeln!(record, "**{}.** {}", index + 1, question);
            let _ = writeln!(record, "> {answer}");
        }

        let mentions = self.reviewer_mentions(application).await?;
        if !mentions.is_empty() {
            let _ = writeln!(record);
            let _ = write!(record, "{}", mentions.join(" "));
        }

        Ok(record)
    }

    async fn reviewer_mentions(&self, application: &Application) -> Result<Vec<String>> {
        let roles = self
            .platform
            .guild_roles(application.guild_id)
            .await
            .context("listing guild roles for reviewer mentions")?;

        Ok(roles
            .iter()
            .filter(|role| {
                let lowered = role.name.to_lowercase();
                MODERATOR_ROLE_KEYWORDS
                    .iter()
                    .any(|kw| lowered.contains(kw))
            })
            .map(|role| format!("<@&{}>", role.id))
            .collect())
    }
}
