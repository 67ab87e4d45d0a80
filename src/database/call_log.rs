//! Call Log Database
//!
//! SQLite-Datenbank für beendete Anrufe.
//! Speichert nur, was zur Zuordnung einer Bewertung nötig ist.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::call_engine::{CallRole, CallSummary, EndReason, MediaKind};
use crate::signaling::SessionId;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Failed to encode column: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Call was never connected: {0}")]
    NotConnected(String),

    #[error("Rating must be between 1 and 5 stars, got {0}")]
    InvalidStars(u8),

    #[error("Partner does not match call: {0}")]
    PartnerMismatch(String),
}

// ============================================================================
// RECORDS
// ============================================================================

/// Bewertung eines beendeten Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRating {
    pub call_id: SessionId,
    pub partner_id: String,
    pub stars: u8,
    pub comment: Option<String>,
    pub duration_seconds: u64,
}

/// Gespeicherter Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: SessionId,
    pub partner_id: String,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub duration_seconds: u64,
    pub was_connected: bool,
    pub reason: EndReason,
    pub ended_at: DateTime<Utc>,
    pub stars: Option<u8>,
    pub comment: Option<String>,
}

// ============================================================================
// DATABASE
// ============================================================================

/// Anrufprotokoll (Thread-safe durch Mutex)
pub struct CallLog {
    conn: Mutex<Connection>,
}

impl CallLog {
    /// Öffnet oder erstellt die Datenbank im App-Verzeichnis
    pub fn open() -> Result<Self, DatabaseError> {
        let db_path = Self::get_database_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call log at {:?}", db_path);
        Self::with_connection(Connection::open(&db_path)?)
    }

    /// In-Memory Datenbank
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn get_database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs =
            directories::ProjectDirs::from("com", "pulse", "pulse-call").ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                call_id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                role TEXT NOT NULL,
                media_kind TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                was_connected INTEGER NOT NULL,
                reason TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                stars INTEGER,
                comment TEXT
            )
            "#,
            [],
        )?;
        Ok(())
    }

    /// Speichert einen beendeten Anruf
    pub fn record(&self, summary: &CallSummary) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO calls (call_id, partner_id, role, media_kind, duration_seconds,
                               was_connected, reason, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(call_id) DO NOTHING
            "#,
            params![
                summary.call_id.as_str(),
                summary.partner_id,
                serde_json::to_string(&summary.role)?,
                serde_json::to_string(&summary.media_kind)?,
                summary.duration_seconds as i64,
                summary.was_connected,
                serde_json::to_string(&summary.reason)?,
                summary.ended_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!("Recorded call {} with {}", summary.call_id, summary.partner_id);
        Ok(())
    }

    /// Holt einen Anruf anhand der ID
    pub fn get(&self, call_id: &SessionId) -> Result<Option<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        Self::get_inner(&conn, call_id)
    }

    fn get_inner(conn: &Connection, call_id: &SessionId) -> Result<Option<CallRecord>, DatabaseError> {
        let row = conn
            .query_row(
                r#"
                SELECT partner_id, role, media_kind, duration_seconds, was_connected,
                       reason, ended_at, stars, comment
                FROM calls
                WHERE call_id = ?1
                "#,
                params![call_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<u8>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((partner_id, role, media_kind, duration, was_connected, reason, ended_at, stars, comment)) =
            row
        else {
            return Ok(None);
        };

        let ended_at = DateTime::parse_from_rfc3339(&ended_at)
            .map_err(|e| DatabaseError::Corrupt(format!("ended_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(CallRecord {
            call_id: call_id.clone(),
            partner_id,
            role: serde_json::from_str(&role)?,
            media_kind: serde_json::from_str(&media_kind)?,
            duration_seconds: u64::try_from(duration)
                .map_err(|_| DatabaseError::Corrupt(format!("duration: {}", duration)))?,
            was_connected,
            reason: serde_json::from_str(&reason)?,
            ended_at,
            stars,
            comment,
        }))
    }

    /// Speichert eine Bewertung für einen verbundenen Anruf
    pub fn submit_rating(&self, rating: &CallRating) -> Result<(), DatabaseError> {
        if !(1..=5).contains(&rating.stars) {
            return Err(DatabaseError::InvalidStars(rating.stars));
        }

        let conn = self.conn.lock();
        let record = Self::get_inner(&conn, &rating.call_id)?
            .ok_or_else(|| DatabaseError::CallNotFound(rating.call_id.to_string()))?;

        if record.partner_id != rating.partner_id {
            return Err(DatabaseError::PartnerMismatch(rating.partner_id.clone()));
        }
        if !record.was_connected {
            return Err(DatabaseError::NotConnected(rating.call_id.to_string()));
        }

        conn.execute(
            "UPDATE calls SET stars = ?1, comment = ?2 WHERE call_id = ?3",
            params![rating.stars, rating.comment, rating.call_id.as_str()],
        )?;

        tracing::info!(
            "Rated call {} with {} stars ({}s)",
            rating.call_id,
            rating.stars,
            rating.duration_seconds
        );
        Ok(())
    }
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog").finish_non_exhaustive()
    }
}
