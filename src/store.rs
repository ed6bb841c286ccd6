//! SQLite persistence for the intake workflow.
//!
//! The store is the source of truth; the engine's in-memory indexes are
//! caches rebuilt from here at startup. Synchronous rusqlite operations run
//! inside `tokio::task::spawn_blocking` so they never block the async
//! runtime, with the connection behind an `Arc<Mutex<..>>` because
//! `rusqlite::Connection` is not `Sync`.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::intake::session::Session;
use crate::intake::types::{
    Answers, Application, ApplicationId, ApplicationStatus, ChannelId, GuildId, RoleId, RoleType,
    UserId,
};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Errors from the persistence layer.
///
/// `Storage` covers the database being unavailable or an operation failing;
/// callers surface it as a generic retryable failure. `Corruption` means a
/// row could not be decoded. `DuplicatePending` is the unique-index guard on
/// the single-pending-application invariant firing.
#[derive(Debug)]
pub enum StoreError {
    Storage { op: &'static str, detail: String },
    Corruption { what: String },
    DuplicatePending,
}

impl StoreError {
    pub fn storage(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Storage {
            op,
            detail: detail.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage { op, detail } => write!(f, "storage error during {op}: {detail}"),
            Self::Corruption { what } => write!(f, "corrupt stored data: {what}"),
            Self::DuplicatePending => write!(f, "a pending application already exists"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Format a timestamp for storage.
///
/// Fixed-width UTC RFC 3339 so stored values compare lexicographically.
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn encode_answers(answers: &Answers) -> Result<String, StoreError> {
    serde_json::to_string(answers).map_err(|e| StoreError::storage("encode answers", e.to_string()))
}

fn decode_answers(json: &str) -> Result<Answers, StoreError> {
    serde_json::from_str(json).map_err(|_| StoreError::corruption("answers JSON"))
}

fn decode_role_type(s: &str) -> Result<RoleType, StoreError> {
    s.parse()
        .map_err(|_| StoreError::corruption(format!("role type {s:?}")))
}

/// SQLite-backed store for applications, sessions, rate limits, and the
/// admin-configured channel/role tables.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::storage(
                        "create database directory",
                        format!("{}: {e}", parent.display()),
                    )
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // WAL survives crashes better and lets the sweeper read while a
        // request handler writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| StoreError::storage("set busy_timeout", e.to_string()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::storage("open in-memory database", e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| StoreError::storage("read user_version", e.to_string()))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::storage(
                "init schema",
                format!(
                    "database schema version {current_version} is newer than supported \
                     version {SCHEMA_VERSION}; upgrade the application"
                ),
            ));
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| StoreError::storage("set user_version", e.to_string()))?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                guild_id INTEGER NOT NULL,
                role_type TEXT NOT NULL,
                answers_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN (
                    'pending', 'completed', 'approved', 'denied', 'cancelled', 'expired'
                )),
                submitted_at TEXT NOT NULL
            );

            -- At most one pending application per (user, guild).
            CREATE UNIQUE INDEX IF NOT EXISTS idx_applications_pending
            ON applications(user_id, guild_id) WHERE status = 'pending';

            CREATE TABLE IF NOT EXISTS application_sessions (
                user_id INTEGER PRIMARY KEY,
                guild_id INTEGER NOT NULL,
                role_type TEXT NOT NULL,
                current_question INTEGER NOT NULL,
                answers_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS application_rate_limits (
                user_id INTEGER NOT NULL,
                attempt_time TEXT NOT NULL,
                PRIMARY KEY (user_id, attempt_time)
            );

            CREATE TABLE IF NOT EXISTS application_channels (
                guild_id INTEGER PRIMARY KEY,
                channel_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS role_mappings (
                guild_id INTEGER NOT NULL,
                role_type TEXT NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (guild_id, role_type)
            );

            CREATE TABLE IF NOT EXISTS approved_roles (
                user_id INTEGER NOT NULL,
                role_type TEXT NOT NULL,
                approved_at TEXT NOT NULL,
                PRIMARY KEY (user_id, role_type)
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create initial schema (v0 -> v1)", e.to_string()))
    }

    // =========================================================================
    // Applications
    // =========================================================================

    /// Insert a new pending application.
    ///
    /// Returns `DuplicatePending` if the partial unique index rejects a
    /// second pending row for this user and guild.
    pub async fn create_pending_application(
        &self,
        user: UserId,
        guild: GuildId,
        role_type: RoleType,
        submitted_at: DateTime<Utc>,
    ) -> Result<ApplicationId, StoreError> {
        let conn = self.conn.clone();
        let ts = fmt_ts(submitted_at);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO applications (user_id, guild_id, role_type, answers_json, status, submitted_at)
                 VALUES (?1, ?2, ?3, '{}', 'pending', ?4)",
                params![user.0 as i64, guild.0 as i64, role_type.as_str(), ts],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::DuplicatePending
                }
                other => StoreError::storage("create pending application", other.to_string()),
            })?;
            Ok(ApplicationId(conn.last_insert_rowid()))
        })
        .await
        .map_err(|e| StoreError::storage("create pending application", e.to_string()))?
    }

    /// Atomically insert the pending application row and the session row for
    /// a newly started form.
    ///
    /// Both rows land or neither does, so a failure partway can never leave
    /// a pending application whose replies have no session to route to.
    /// Returns `DuplicatePending` if the partial unique index rejects a
    /// second pending row for this user and guild.
    pub async fn start_application(&self, session: &Session) -> Result<ApplicationId, StoreError> {
        let conn = self.conn.clone();
        let user = session.user_id;
        let guild = session.guild_id;
        let role_type = session.role_type;
        let current_question = session.current_question;
        let created_at = fmt_ts(session.created_at);
        let answers_json = encode_answers(&session.answers)?;

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("start application", e.to_string()))?;

            tx.execute(
                "INSERT INTO applications (user_id, guild_id, role_type, answers_json, status, submitted_at)
                 VALUES (?1, ?2, ?3, '{}', 'pending', ?4)",
                params![user.0 as i64, guild.0 as i64, role_type.as_str(), created_at],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::DuplicatePending
                }
                other => StoreError::storage("start application", other.to_string()),
            })?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO application_sessions
                     (user_id, guild_id, role_type, current_question, answers_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id) DO UPDATE SET
                     guild_id = excluded.guild_id,
                     role_type = excluded.role_type,
                     current_question = excluded.current_question,
                     answers_json = excluded.answers_json,
                     created_at = excluded.created_at",
                params![
                    user.0 as i64,
                    guild.0 as i64,
                    role_type.as_str(),
                    current_question,
                    answers_json,
                    created_at
                ],
            )
            .map_err(|e| StoreError::storage("start application", e.to_string()))?;

            tx.commit()
                .map_err(|e| StoreError::storage("start application", e.to_string()))?;

            Ok(ApplicationId(id))
        })
        .await
        .map_err(|e| StoreError::storage("start application", e.to_string()))?
    }

    /// Whether a pending application exists for this user in this guild.
    ///
    /// This is the authoritative check; the engine's pending cache is only an
    /// accelerator.
    pub async fn has_pending_application(
        &self,
        user: UserId,
        guild: GuildId,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM applications
                     WHERE user_id = ?1 AND guild_id = ?2 AND status = 'pending'",
                    params![user.0 as i64, guild.0 as i64],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("check pending application", e.to_string()))?;
            Ok(count > 0)
        })
        .await
        .map_err(|e| StoreError::storage("check pending application", e.to_string()))?
    }

    /// All (user, guild) pairs with a pending application, for cache rebuild.
    pub async fn pending_pairs(&self) -> Result<Vec<(UserId, GuildId)>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, guild_id FROM applications WHERE status = 'pending'",
                )
                .map_err(|e| StoreError::storage("list pending applications", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        UserId(row.get::<_, i64>(0)? as u64),
                        GuildId(row.get::<_, i64>(1)? as u64),
                    ))
                })
                .map_err(|e| StoreError::storage("list pending applications", e.to_string()))?;

            let mut pairs = Vec::new();
            for row in rows {
                pairs.push(
                    row.map_err(|e| {
                        StoreError::storage("list pending applications", e.to_string())
                    })?,
                );
            }
            Ok(pairs)
        })
        .await
        .map_err(|e| StoreError::storage("list pending applications", e.to_string()))?
    }

    /// Atomically mark the user's pending application completed with its
    /// final answers and delete the session row.
    ///
    /// Returns the completed [`Application`], or `None` if no pending row
    /// existed (e.g. the sweeper expired it first).
    pub async fn complete_application(
        &self,
        user: UserId,
        guild: GuildId,
        answers: &Answers,
    ) -> Result<Option<Application>, StoreError> {
        let conn = self.conn.clone();
        let answers = answers.clone();
        let answers_json = encode_answers(&answers)?;

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("complete application", e.to_string()))?;

            let row: Option<(i64, String, String)> = tx
                .query_row(
                    "SELECT id, role_type, submitted_at FROM applications
                     WHERE user_id = ?1 AND guild_id = ?2 AND status = 'pending'",
                    params![user.0 as i64, guild.0 as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(|e| StoreError::storage("complete application", e.to_string()))?;

            let Some((id, role_type, submitted_at)) = row else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE applications SET status = 'completed', answers_json = ?2 WHERE id = ?1",
                params![id, answers_json],
            )
            .map_err(|e| StoreError::storage("complete application", e.to_string()))?;

            tx.execute(
                "DELETE FROM application_sessions WHERE user_id = ?1",
                params![user.0 as i64],
            )
            .map_err(|e| StoreError::storage("complete application", e.to_string()))?;

            tx.commit()
                .map_err(|e| StoreError::storage("complete application", e.to_string()))?;

            Ok(Some(Application {
                id: ApplicationId(id),
                user_id: user,
                guild_id: guild,
                role_type: decode_role_type(&role_type)?,
                answers,
                status: ApplicationStatus::Completed,
                submitted_at: parse_ts(&submitted_at)
                    .map_err(|_| StoreError::corruption("submitted_at timestamp"))?,
            }))
        })
        .await
        .map_err(|e| StoreError::storage("complete application", e.to_string()))?
    }

    /// Atomically mark the user's pending application cancelled (keeping the
    /// answers collected so far) and delete the session row.
    ///
    /// Returns whether a pending row was cancelled.
    pub async fn cancel_application(
        &self,
        user: UserId,
        guild: GuildId,
        answers: &Answers,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let answers_json = encode_answers(answers)?;

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("cancel application", e.to_string()))?;

            let changed = tx
                .execute(
                    "UPDATE applications SET status = 'cancelled', answers_json = ?3
                     WHERE user_id = ?1 AND guild_id = ?2 AND status = 'pending'",
                    params![user.0 as i64, guild.0 as i64, answers_json],
                )
                .map_err(|e| StoreError::storage("cancel application", e.to_string()))?;

            tx.execute(
                "DELETE FROM application_sessions WHERE user_id = ?1",
                params![user.0 as i64],
            )
            .map_err(|e| StoreError::storage("cancel application", e.to_string()))?;

            tx.commit()
                .map_err(|e| StoreError::storage("cancel application", e.to_string()))?;

            Ok(changed > 0)
        })
        .await
        .map_err(|e| StoreError::storage("cancel application", e.to_string()))?
    }

    /// The user's completed (awaiting decision) application in this guild.
    pub async fn completed_application(
        &self,
        user: UserId,
        guild: GuildId,
    ) -> Result<Option<Application>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let row: Option<(i64, String, String, String)> = conn
                .query_row(
                    "SELECT id, role_type, answers_json, submitted_at FROM applications
                     WHERE user_id = ?1 AND guild_id = ?2 AND status = 'completed'
                     ORDER BY id DESC LIMIT 1",
                    params![user.0 as i64, guild.0 as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(|e| StoreError::storage("get completed application", e.to_string()))?;

            match row {
                Some((id, role_type, answers_json, submitted_at)) => Ok(Some(Application {
                    id: ApplicationId(id),
                    user_id: user,
                    guild_id: guild,
                    role_type: decode_role_type(&role_type)?,
                    answers: decode_answers(&answers_json)?,
                    status: ApplicationStatus::Completed,
                    submitted_at: parse_ts(&submitted_at)
                        .map_err(|_| StoreError::corruption("submitted_at timestamp"))?,
                })),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::storage("get completed application", e.to_string()))?
    }

    /// Status of a single application row (test and diagnostic access).
    pub async fn application_status(
        &self,
        id: ApplicationId,
    ) -> Result<Option<ApplicationStatus>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM applications WHERE id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("get application status", e.to_string()))?;

            match status {
                Some(s) => ApplicationStatus::parse(&s)
                    .map(Some)
                    .ok_or_else(|| StoreError::corruption(format!("status {s:?}"))),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::storage("get application status", e.to_string()))?
    }

    /// Atomically mark a completed application approved and record the
    /// approved-role association.
    ///
    /// Conditional on `status = 'completed'` so a concurrent decision cannot
    /// double-apply. Returns whether the row transitioned.
    pub async fn approve_application(
        &self,
        id: ApplicationId,
        user: UserId,
        role_type: RoleType,
        approved_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let ts = fmt_ts(approved_at);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("approve application", e.to_string()))?;

            let changed = tx
                .execute(
                    "UPDATE applications SET status = 'approved'
                     WHERE id = ?1 AND status = 'completed'",
                    params![id.0],
                )
                .map_err(|e| StoreError::storage("approve application", e.to_string()))?;

            if changed > 0 {
                tx.execute(
                    "INSERT INTO approved_roles (user_id, role_type, approved_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_id, role_type) DO UPDATE SET
                         approved_at = excluded.approved_at",
                    params![user.0 as i64, role_type.as_str(), ts],
                )
                .map_err(|e| StoreError::storage("approve application", e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| StoreError::storage("approve application", e.to_string()))?;

            Ok(changed > 0)
        })
        .await
        .map_err(|e| StoreError::storage("approve application", e.to_string()))?
    }

    /// Mark a completed application denied. Returns whether the row
    /// transitioned.
    pub async fn deny_application(&self, id: ApplicationId) -> Result<bool, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let changed = conn
                .execute(
                    "UPDATE applications SET status = 'denied'
                     WHERE id = ?1 AND status = 'completed'",
                    params![id.0],
                )
                .map_err(|e| StoreError::storage("deny application", e.to_string()))?;
            Ok(changed > 0)
        })
        .await
        .map_err(|e| StoreError::storage("deny application", e.to_string()))?
    }

    /// Pending applications submitted before the cutoff, for the sweeper.
    ///
    /// Rows whose `submitted_at` fails to parse are logged and skipped rather
    /// than failing the whole sweep.
    pub async fn stale_pending_applications(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(ApplicationId, UserId, GuildId)>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, guild_id, submitted_at FROM applications
                     WHERE status = 'pending'",
                )
                .map_err(|e| StoreError::storage("list stale applications", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| StoreError::storage("list stale applications", e.to_string()))?;

            let mut stale = Vec::new();
            for row in rows {
                let (id, user_id, guild_id, submitted_at) = row
                    .map_err(|e| StoreError::storage("list stale applications", e.to_string()))?;
                match parse_ts(&submitted_at) {
                    Ok(ts) if ts < cutoff => stale.push((
                        ApplicationId(id),
                        UserId(user_id as u64),
                        GuildId(guild_id as u64),
                    )),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            "Skipping application {} with unparseable submitted_at {:?}: {}",
                            id, submitted_at, e
                        );
                    }
                }
            }
            Ok(stale)
        })
        .await
        .map_err(|e| StoreError::storage("list stale applications", e.to_string()))?
    }

    /// Atomically expire a pending application and delete its session row.
    ///
    /// Conditional on `status = 'pending'` so an application approved or
    /// completed mid-sweep is never resurrected as expired.
    pub async fn expire_application(
        &self,
        id: ApplicationId,
        user: UserId,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("mutex poisoned");
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("expire application", e.to_string()))?;

            let changed = tx
                .execute(
                    "UPDATE applications SET status = 'expired'
                     WHERE id = ?1 AND status = 'pending'",
                    params![id.0],
                )
                .map_err(|e| StoreError::storage("expire application", e.to_string()))?;

            if changed > 0 {
                tx.execute(
                    "DELETE FROM application_sessions WHERE user_id = ?1",
                    params![user.0 as i64],
                )
                .map_err(|e| StoreError::storage("expire application", e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| StoreError::storage("expire application", e.to_string()))?;

            Ok(changed > 0)
        })
        .await
        .map_err(|e| StoreError::storage("expire application", e.to_string()))?
    }

    /// Overwrite an application's submitted_at (test access, for expiry
    /// scenarios that need a row in the past).
    #[doc(hidden)]
    pub async fn set_submitted_at(
        &self,
        id: ApplicationId,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let ts = fmt_ts(submitted_at);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE applications SET submitted_at = ?2 WHERE id = ?1",
                params![id.0, ts],
            )
            .map_err(|e| StoreError::storage("set submitted_at", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set submitted_at", e.to_string()))?
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Insert or update a session row.
    pub async fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let user = session.user_id;
        let guild = session.guild_id;
        let role_type = session.role_type;
        let current_question = session.current_question;
        let created_at = fmt_ts(session.created_at);
        let answers_json = encode_answers(&session.answers)?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO application_sessions
                     (user_id, guild_id, role_type, current_question, answers_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id) DO UPDATE SET
                     guild_id = excluded.guild_id,
                     role_type = excluded.role_type,
                     current_question = excluded.current_question,
                     answers_json = excluded.answers_json,
                     created_at = excluded.created_at",
                params![
                    user.0 as i64,
                    guild.0 as i64,
                    role_type.as_str(),
                    current_question,
                    answers_json,
                    created_at
                ],
            )
            .map_err(|e| StoreError::storage("upsert session", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("upsert session", e.to_string()))?
    }

    /// The user's session row, if one exists.
    pub async fn get_session(&self, user: UserId) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let row: Option<(i64, String, u32, String, String)> = conn
                .query_row(
                    "SELECT guild_id, role_type, current_question, answers_json, created_at
                     FROM application_sessions WHERE user_id = ?1",
                    params![user.0 as i64],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| StoreError::storage("get session", e.to_string()))?;

            match row {
                Some((guild_id, role_type, current_question, answers_json, created_at)) => {
                    Ok(Some(Session {
                        user_id: user,
                        guild_id: GuildId(guild_id as u64),
                        role_type: decode_role_type(&role_type)?,
                        current_question,
                        answers: decode_answers(&answers_json)?,
                        created_at: parse_ts(&created_at)
                            .map_err(|_| StoreError::corruption("session created_at"))?,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::storage("get session", e.to_string()))?
    }

    /// All persisted sessions, for cache rebuild at startup.
    pub async fn load_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, guild_id, role_type, current_question, answers_json, created_at
                     FROM application_sessions",
                )
                .map_err(|e| StoreError::storage("load sessions", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|e| StoreError::storage("load sessions", e.to_string()))?;

            let mut sessions = Vec::new();
            for row in rows {
                let (user_id, guild_id, role_type, current_question, answers_json, created_at) =
                    row.map_err(|e| StoreError::storage("load sessions", e.to_string()))?;
                sessions.push(Session {
                    user_id: UserId(user_id as u64),
                    guild_id: GuildId(guild_id as u64),
                    role_type: decode_role_type(&role_type)?,
                    current_question,
                    answers: decode_answers(&answers_json)?,
                    created_at: parse_ts(&created_at)
                        .map_err(|_| StoreError::corruption("session created_at"))?,
                });
            }
            Ok(sessions)
        })
        .await
        .map_err(|e| StoreError::storage("load sessions", e.to_string()))?
    }

    /// Delete a session row. Returns whether one existed.
    pub async fn delete_session(&self, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let changed = conn
                .execute(
                    "DELETE FROM application_sessions WHERE user_id = ?1",
                    params![user.0 as i64],
                )
                .map_err(|e| StoreError::storage("delete session", e.to_string()))?;
            Ok(changed > 0)
        })
        .await
        .map_err(|e| StoreError::storage("delete session", e.to_string()))?
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    /// Append an attempt to the rate-limit log.
    pub async fn record_attempt(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let ts = fmt_ts(at);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO application_rate_limits (user_id, attempt_time)
                 VALUES (?1, ?2)",
                params![user.0 as i64, ts],
            )
            .map_err(|e| StoreError::storage("record attempt", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("record attempt", e.to_string()))?
    }

    /// Count the user's attempts at or after the window cutoff.
    ///
    /// Attempts older than the cutoff are purged lazily here; the log is
    /// otherwise append-only.
    pub async fn attempts_in_window(
        &self,
        user: UserId,
        cutoff: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let conn = self.conn.clone();
        let cutoff = fmt_ts(cutoff);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");

            conn.execute(
                "DELETE FROM application_rate_limits WHERE user_id = ?1 AND attempt_time < ?2",
                params![user.0 as i64, cutoff],
            )
            .map_err(|e| StoreError::storage("purge attempts", e.to_string()))?;

            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM application_rate_limits WHERE user_id = ?1",
                    params![user.0 as i64],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("count attempts", e.to_string()))?;
            Ok(count as u32)
        })
        .await
        .map_err(|e| StoreError::storage("count attempts", e.to_string()))?
    }

    // =========================================================================
    // Admin configuration
    // =========================================================================

    /// Set the review-record destination channel for a guild.
    pub async fn set_application_channel(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO application_channels (guild_id, channel_id) VALUES (?1, ?2)
                 ON CONFLICT (guild_id) DO UPDATE SET channel_id = excluded.channel_id",
                params![guild.0 as i64, channel.0 as i64],
            )
            .map_err(|e| StoreError::storage("set application channel", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set application channel", e.to_string()))?
    }

    /// The configured review-record channel for a guild, if any.
    pub async fn application_channel(
        &self,
        guild: GuildId,
    ) -> Result<Option<ChannelId>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let channel: Option<i64> = conn
                .query_row(
                    "SELECT channel_id FROM application_channels WHERE guild_id = ?1",
                    params![guild.0 as i64],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("get application channel", e.to_string()))?;
            Ok(channel.map(|id| ChannelId(id as u64)))
        })
        .await
        .map_err(|e| StoreError::storage("get application channel", e.to_string()))?
    }

    /// Map a role type to the external role granted on approval.
    pub async fn set_role_mapping(
        &self,
        guild: GuildId,
        role_type: RoleType,
        role: RoleId,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO role_mappings (guild_id, role_type, role_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT (guild_id, role_type) DO UPDATE SET role_id = excluded.role_id",
                params![guild.0 as i64, role_type.as_str(), role.0 as i64],
            )
            .map_err(|e| StoreError::storage("set role mapping", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set role mapping", e.to_string()))?
    }

    /// The external role mapped to a role type in a guild, if configured.
    pub async fn role_mapping(
        &self,
        guild: GuildId,
        role_type: RoleType,
    ) -> Result<Option<RoleId>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let role: Option<i64> = conn
                .query_row(
                    "SELECT role_id FROM role_mappings WHERE guild_id = ?1 AND role_type = ?2",
                    params![guild.0 as i64, role_type.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("get role mapping", e.to_string()))?;
            Ok(role.map(|id| RoleId(id as u64)))
        })
        .await
        .map_err(|e| StoreError::storage("get role mapping", e.to_string()))?
    }

    /// Role types this user has been approved for, with approval times.
    pub async fn approved_role_types(
        &self,
        user: UserId,
    ) -> Result<Vec<(RoleType, DateTime<Utc>)>, StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT role_type, approved_at FROM approved_roles
                     WHERE user_id = ?1 ORDER BY approved_at",
                )
                .map_err(|e| StoreError::storage("list approved roles", e.to_string()))?;

            let rows = stmt
                .query_map(params![user.0 as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| StoreError::storage("list approved roles", e.to_string()))?;

            let mut approved = Vec::new();
            for row in rows {
                let (role_type, approved_at) =
                    row.map_err(|e| StoreError::storage("list approved roles", e.to_string()))?;
                approved.push((
                    decode_role_type(&role_type)?,
                    parse_ts(&approved_at)
                        .map_err(|_| StoreError::corruption("approved_at timestamp"))?,
                ));
            }
            Ok(approved)
        })
        .await
        .map_err(|e| StoreError::storage("list approved roles", e.to_string()))?
    }

    /// Corrupt a pending row's timestamp (test access, for the sweeper's
    /// malformed-timestamp path).
    #[doc(hidden)]
    pub async fn corrupt_submitted_at(&self, id: ApplicationId) -> Result<(), StoreError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE applications SET submitted_at = 'not-a-timestamp' WHERE id = ?1",
                params![id.0],
            )
            .map_err(|e| StoreError::storage("corrupt submitted_at", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("corrupt submitted_at", e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> UserId {
        UserId(100)
    }

    fn guild() -> GuildId {
        GuildId(900)
    }

    #[tokio::test]
    async fn test_new_in_memory_initializes_schema() {
        let store = SqliteStore::new_in_memory().expect("should create in-memory db");
        let pairs = store.pending_pairs().await.expect("should list");
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_create_pending_then_has_pending() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(!store.has_pending_application(user(), guild()).await.unwrap());

        store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        assert!(store.has_pending_application(user(), guild()).await.unwrap());
        assert_eq!(store.pending_pairs().await.unwrap(), vec![(user(), guild())]);
    }

    #[tokio::test]
    async fn test_second_pending_is_rejected_by_unique_index() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        let err = store
            .create_pending_application(user(), guild(), RoleType::Advertiser, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePending));
    }

    #[tokio::test]
    async fn test_pending_in_different_guilds_is_allowed() {
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .create_pending_application(user(), GuildId(1), RoleType::Developer, Utc::now())
            .await
            .unwrap();
        store
            .create_pending_application(user(), GuildId(2), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        assert_eq!(store.pending_pairs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_start_application_writes_both_rows() {
        let store = SqliteStore::new_in_memory().unwrap();
        let session = Session::new(user(), guild(), RoleType::Developer, Utc::now());

        store.start_application(&session).await.unwrap();

        assert!(store.has_pending_application(user(), guild()).await.unwrap());
        assert_eq!(store.get_session(user()).await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_start_application_rolls_back_on_duplicate_pending() {
        // If the application insert is rejected, the session insert must not
        // survive either: a pending row with no session would swallow every
        // reply from the applicant until the sweeper cleared it.
        let store = SqliteStore::new_in_memory().unwrap();
        store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        let session = Session::new(user(), guild(), RoleType::Advertiser, Utc::now());
        let err = store.start_application(&session).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePending));
        assert!(store.get_session(user()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut session = Session::new(user(), guild(), RoleType::Advertiser, Utc::now());
        session.record_answer("Yes, I own it");

        store.upsert_session(&session).await.unwrap();
        let loaded = store.get_session(user()).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        let all = store.load_sessions().await.unwrap();
        assert_eq!(all, vec![session]);

        assert!(store.delete_session(user()).await.unwrap());
        assert!(store.get_session(user()).await.unwrap().is_none());
        assert!(!store.delete_session(user()).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_application_updates_row_and_deletes_session() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Advertiser, Utc::now())
            .await
            .unwrap();

        let mut session = Session::new(user(), guild(), RoleType::Advertiser, Utc::now());
        for answer in ["Yes", "My indie game", "Weekly"] {
            session.record_answer(answer);
        }
        store.upsert_session(&session).await.unwrap();

        let app = store
            .complete_application(user(), guild(), &session.answers)
            .await
            .unwrap()
            .expect("pending row should exist");

        assert_eq!(app.id, id);
        assert_eq!(app.status, ApplicationStatus::Completed);
        assert_eq!(app.answers.len(), 3);
        assert!(store.get_session(user()).await.unwrap().is_none());
        assert!(!store.has_pending_application(user(), guild()).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_without_pending_returns_none() {
        let store = SqliteStore::new_in_memory().unwrap();
        let result = store
            .complete_application(user(), guild(), &Answers::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_application_keeps_partial_answers() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        let mut answers = Answers::new();
        answers.insert(0, "Rust".to_string());
        assert!(store.cancel_application(user(), guild(), &answers).await.unwrap());

        assert_eq!(
            store.application_status(id).await.unwrap(),
            Some(ApplicationStatus::Cancelled)
        );
        assert!(!store.has_pending_application(user(), guild()).await.unwrap());

        // Cancelling again is a no-op
        assert!(!store.cancel_application(user(), guild(), &answers).await.unwrap());
    }

    #[tokio::test]
    async fn test_approve_transitions_completed_only() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        // Still pending: approval must refuse
        assert!(!store
            .approve_application(id, user(), RoleType::Developer, Utc::now())
            .await
            .unwrap());

        store
            .complete_application(user(), guild(), &Answers::new())
            .await
            .unwrap();

        assert!(store
            .approve_application(id, user(), RoleType::Developer, Utc::now())
            .await
            .unwrap());
        assert_eq!(
            store.application_status(id).await.unwrap(),
            Some(ApplicationStatus::Approved)
        );

        let approved = store.approved_role_types(user()).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].0, RoleType::Developer);

        // Approving a second time is a no-op and must not duplicate the
        // association
        assert!(!store
            .approve_application(id, user(), RoleType::Developer, Utc::now())
            .await
            .unwrap());
        assert_eq!(store.approved_role_types(user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deny_transitions_completed_only() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();
        assert!(!store.deny_application(id).await.unwrap());

        store
            .complete_application(user(), guild(), &Answers::new())
            .await
            .unwrap();
        assert!(store.deny_application(id).await.unwrap());
        assert_eq!(
            store.application_status(id).await.unwrap(),
            Some(ApplicationStatus::Denied)
        );
    }

    #[tokio::test]
    async fn test_stale_pending_respects_cutoff() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();

        let old = store
            .create_pending_application(UserId(1), guild(), RoleType::Developer, now)
            .await
            .unwrap();
        store
            .set_submitted_at(old, now - Duration::minutes(61))
            .await
            .unwrap();

        let fresh = store
            .create_pending_application(UserId(2), guild(), RoleType::Developer, now)
            .await
            .unwrap();
        store
            .set_submitted_at(fresh, now - Duration::minutes(59))
            .await
            .unwrap();

        let stale = store
            .stale_pending_applications(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, old);
        assert_eq!(stale[0].1, UserId(1));
    }

    #[tokio::test]
    async fn test_stale_pending_skips_malformed_timestamps() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();
        store.corrupt_submitted_at(id).await.unwrap();

        let stale = store
            .stale_pending_applications(Utc::now() + Duration::hours(24))
            .await
            .unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_expire_application_is_conditional_on_pending() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();

        // Completed first: the sweeper must not resurrect it as expired
        store
            .complete_application(user(), guild(), &Answers::new())
            .await
            .unwrap();
        assert!(!store.expire_application(id, user()).await.unwrap());
        assert_eq!(
            store.application_status(id).await.unwrap(),
            Some(ApplicationStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_expire_application_deletes_session() {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = store
            .create_pending_application(user(), guild(), RoleType::Developer, Utc::now())
            .await
            .unwrap();
        let session = Session::new(user(), guild(), RoleType::Developer, Utc::now());
        store.upsert_session(&session).await.unwrap();

        assert!(store.expire_application(id, user()).await.unwrap());
        assert_eq!(
            store.application_status(id).await.unwrap(),
            Some(ApplicationStatus::Expired)
        );
        assert!(store.get_session(user()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();

        store.record_attempt(user(), now - Duration::minutes(90)).await.unwrap();
        store.record_attempt(user(), now - Duration::minutes(30)).await.unwrap();
        store.record_attempt(user(), now - Duration::minutes(10)).await.unwrap();

        let cutoff = now - Duration::hours(1);
        assert_eq!(store.attempts_in_window(user(), cutoff).await.unwrap(), 2);

        // The out-of-window attempt was purged lazily
        assert_eq!(store.attempts_in_window(user(), cutoff).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_application_channel_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(store.application_channel(guild()).await.unwrap().is_none());

        store.set_application_channel(guild(), ChannelId(5)).await.unwrap();
        assert_eq!(
            store.application_channel(guild()).await.unwrap(),
            Some(ChannelId(5))
        );

        store.set_application_channel(guild(), ChannelId(6)).await.unwrap();
        assert_eq!(
            store.application_channel(guild()).await.unwrap(),
            Some(ChannelId(6))
        );
    }

    #[tokio::test]
    async fn test_role_mapping_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(store
            .role_mapping(guild(), RoleType::Developer)
            .await
            .unwrap()
            .is_none());

        store
            .set_role_mapping(guild(), RoleType::Developer, RoleId(42))
            .await
            .unwrap();
        assert_eq!(
            store.role_mapping(guild(), RoleType::Developer).await.unwrap(),
            Some(RoleId(42))
        );
        assert!(store
            .role_mapping(guild(), RoleType::Advertiser)
            .await
            .unwrap()
            .is_none());
    }
}
