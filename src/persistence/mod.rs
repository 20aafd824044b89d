//! SQLite persistence for checkpoints, the transition archive and risk events.
//!
//! Payloads are stored as JSON next to a few indexed columns, so a row
//! deserializes back into exactly the in-memory value that was written.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::policy::Checkpoint;
use crate::replay::Transition;
use crate::risk::RiskEvent;
use crate::state::FEATURE_VERSION;

/// Indexed metadata of a stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub version: u64,
    pub training_step: u64,
    pub feature_version: u32,
    pub groups_version: u32,
    pub created_at: DateTime<Utc>,
    pub payload_bytes: usize,
}

/// SQLite-based persistence manager, shareable across tasks.
pub struct PersistenceManager {
    conn: Mutex<Connection>,
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl PersistenceManager {
    /// Open (or create) the database and its schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let manager = Self {
            conn: Mutex::new(conn),
        };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", path);
        Ok(manager)
    }

    /// In-memory database (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        let manager = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        manager.init_schema()?;
        Ok(manager)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            -- Parameter checkpoints
            CREATE TABLE IF NOT EXISTS checkpoints (
                version INTEGER PRIMARY KEY,
                training_step INTEGER NOT NULL,
                feature_version INTEGER NOT NULL,
                groups_version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            -- Completed transitions
            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                feature_version INTEGER NOT NULL,
                groups_version INTEGER NOT NULL DEFAULT 0,
                reward REAL NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_version ON transitions(feature_version);

            -- Supervisor and learner events
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_events_timestamp ON risk_events(timestamp);
            "#,
        )?;
        self.migrate_transitions()?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Archives written before transitions carried a group table version
    /// get the column with version 0, which never matches a live table.
    fn migrate_transitions(&self) -> Result<()> {
        let conn = self.conn.lock();
        let has_column = conn
            .prepare("SELECT 1 FROM pragma_table_info('transitions') WHERE name = 'groups_version'")?
            .exists([])?;
        if !has_column {
            conn.execute(
                "ALTER TABLE transitions ADD COLUMN groups_version INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
            info!("Added groups_version to the transition archive");
        }
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transitions_layout ON transitions(feature_version, groups_version)",
            [],
        )?;
        Ok(())
    }

    /// Store a checkpoint; an existing row with the same version is replaced.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload = serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
        self.conn.lock().execute(
            r#"
            INSERT OR REPLACE INTO checkpoints
                (version, training_step, feature_version, groups_version, created_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                checkpoint.version as i64,
                checkpoint.training_step as i64,
                checkpoint.feature_version,
                checkpoint.groups_version,
                checkpoint.created_at.to_rfc3339(),
                payload,
            ],
        )?;

        info!(
            version = checkpoint.version,
            step = checkpoint.training_step,
            bytes = payload.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Highest-version checkpoint, if any.
    pub fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let payload: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload FROM checkpoints ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).context("Failed to deserialize checkpoint"))
            .transpose()
    }

    /// Most recent checkpoints first.
    pub fn list_checkpoints(&self, limit: usize) -> Result<Vec<CheckpointSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT version, training_step, feature_version, groups_version, created_at, LENGTH(payload)
            FROM checkpoints
            ORDER BY version DESC
            LIMIT ?1
            "#,
        )?;

        let summaries: Vec<CheckpointSummary> = stmt
            .query_map([limit as i64], |row| {
                Ok(CheckpointSummary {
                    version: row.get::<_, i64>(0)? as u64,
                    training_step: row.get::<_, i64>(1)? as u64,
                    feature_version: row.get(2)?,
                    groups_version: row.get(3)?,
                    created_at: parse_time(&row.get::<_, String>(4)?),
                    payload_bytes: row.get::<_, i64>(5)? as usize,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(summaries)
    }

    /// Keep only the newest `keep` checkpoints.
    pub fn prune_checkpoints(&self, keep: usize) -> Result<usize> {
        let removed = self.conn.lock().execute(
            r#"
            DELETE FROM checkpoints WHERE version NOT IN (
                SELECT version FROM checkpoints ORDER BY version DESC LIMIT ?1
            )
            "#,
            [keep as i64],
        )?;
        if removed > 0 {
            debug!(removed, keep, "Pruned old checkpoints");
        }
        Ok(removed)
    }

    /// Append completed transitions in one transaction.
    pub fn archive_transitions(&self, transitions: &[Transition]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO transitions (recorded_at, feature_version, groups_version, reward, payload)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for t in transitions {
                let payload = serde_json::to_string(t).context("Failed to serialize transition")?;
                stmt.execute(params![
                    t.recorded_at.to_rfc3339(),
                    t.feature_version,
                    t.groups_version,
                    t.reward,
                    payload
                ])?;
            }
        }
        tx.commit()?;

        debug!(count = transitions.len(), "Archived transitions");
        Ok(transitions.len())
    }

    /// Up to `limit` most recent archived transitions for the current
    /// feature layout and group table `groups_version`, oldest first.
    pub fn load_transitions(&self, limit: usize, groups_version: u32) -> Result<Vec<Transition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT payload FROM (
                SELECT id, payload FROM transitions
                WHERE feature_version = ?1 AND groups_version = ?2
                ORDER BY id DESC
                LIMIT ?3
            ) ORDER BY id ASC
            "#,
        )?;

        let mut skipped = 0usize;
        let transitions: Vec<Transition> = stmt
            .query_map(params![FEATURE_VERSION, groups_version, limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .filter_map(|row| {
                let decoded = row.map_err(anyhow::Error::from).and_then(|payload| {
                    serde_json::from_str::<Transition>(&payload).map_err(anyhow::Error::from)
                });
                match decoded {
                    Ok(t) => Some(t),
                    Err(e) => {
                        debug!("Unreadable archived transition: {:#}", e);
                        skipped += 1;
                        None
                    }
                }
            })
            .collect();

        if skipped > 0 {
            warn!(skipped, "Skipped unreadable archived transitions");
        }
        Ok(transitions)
    }

    pub fn transition_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM transitions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn record_risk_event(&self, event: &RiskEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("Failed to serialize risk event")?;
        self.conn.lock().execute(
            r#"
            INSERT INTO risk_events (event_id, timestamp, kind, severity, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.kind_label(),
                event.severity.as_str(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Most recent risk events first.
    pub fn recent_risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM risk_events ORDER BY id DESC LIMIT ?1",
        )?;

        let events: Vec<RiskEvent> = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|payload| serde_json::from_str(&payload).ok())
            .collect();

        Ok(events)
    }
}
