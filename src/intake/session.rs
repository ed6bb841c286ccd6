//! In-progress intake session state and its pure transitions.
//!
//! A [`Session`] mirrors one user's progress through a role's question list.
//! It is owned exclusively by the [`crate::intake::engine::SessionEngine`];
//! this module holds only the data and the pure answer/cancel logic so it can
//! be tested without a store or platform.

use chrono::{DateTime, Utc};

use super::types::{Answers, GuildId, RoleType, UserId};

/// Keyword that cancels an in-progress application, compared
/// case-insensitively after trimming.
pub const CANCEL_KEYWORD: &str = "cancel";

/// Outcome of recording one non-cancel answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerProgress {
    /// The answer was recorded and there are more questions to ask.
    Advanced { next_question: &'static str },
    /// The answer was recorded and every question is now answered.
    AllAnswered,
}

/// One user's in-progress intake, persisted alongside the pending application.
///
/// Invariant: `current_question` only ever increases, by exactly one per
/// recorded answer, and never exceeds the role's question count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub role_type: RoleType,
    pub current_question: u32,
    pub answers: Answers,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: UserId,
        guild_id: GuildId,
        role_type: RoleType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            guild_id,
            role_type,
            current_question: 0,
            answers: Answers::new(),
            created_at,
        }
    }

    /// Number of questions in this session's role question list.
    pub fn question_count(&self) -> u32 {
        self.role_type.questions().len() as u32
    }

    /// Text of the question currently awaiting an answer, or `None` if all
    /// questions are answered.
    pub fn current_question_text(&self) -> Option<&'static str> {
        self.role_type
            .questions()
            .get(self.current_question as usize)
            .copied()
    }

    /// Whether the given reply is the cancel keyword.
    pub fn is_cancel(text: &str) -> bool {
        text.trim().eq_ignore_ascii_case(CANCEL_KEYWORD)
    }

    /// Record an answer for the current question and advance.
    ///
    /// If the session is somehow already past the last question the answer is
    /// dropped and `AllAnswered` is returned, preserving the index bound.
    pub fn record_answer(&mut self, text: &str) -> AnswerProgress {
        let count = self.question_count();
        if self.current_question >= count {
            return AnswerProgress::AllAnswered;
        }

        self.answers
            .insert(self.current_question, text.to_string());
        self.current_question += 1;

        match self.current_question_text() {
            Some(next_question) => AnswerProgress::Advanced { next_question },
            None => AnswerProgress::AllAnswered,
        }
    }
}
