use std::path::{Path, PathBuf};
use std::thread;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::errors::RcaError;
use crate::logging::append_run_log;
use crate::types::FailureCategory;

type StoreResult<T> = Result<T, RcaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Tracking,
    Pending,
    Promoted,
}

impl SignatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tracking => "tracking",
            Self::Pending => "pending",
            Self::Promoted => "promoted",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "tracking" => Some(Self::Tracking),
            "pending" => Some(Self::Pending),
            "promoted" => Some(Self::Promoted),
            _ => None,
        }
    }
}

/// Recurrence state of one residual signature across analysis runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub signature: String,
    pub category: FailureCategory,
    pub excerpt: Option<String>,
    pub run_count: u64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub status: SignatureStatus,
    pub pattern_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub signature: String,
    pub analysis_id: String,
    pub category: FailureCategory,
    pub excerpt: Option<String>,
    pub seen_at: i64,
}

#[derive(Debug)]
enum StoreCmd {
    RecordSighting {
        sighting: Sighting,
        reply: oneshot::Sender<StoreResult<SignatureRecord>>,
    },
    SetStatus {
        signature: String,
        status: SignatureStatus,
        pattern_id: Option<String>,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Get {
        signature: String,
        reply: oneshot::Sender<StoreResult<Option<SignatureRecord>>>,
    },
    ListByStatus {
        status: SignatureStatus,
        reply: oneshot::Sender<StoreResult<Vec<SignatureRecord>>>,
    },
}

/// SQLite-backed recurrence counts. One thread owns the connection; callers
/// talk to it over a command channel and block on the reply.
pub struct RecurrenceStore {
    cmd_tx: Option<mpsc::Sender<StoreCmd>>,
    worker_join: Option<thread::JoinHandle<()>>,
    db_path: Option<PathBuf>,
}

impl Drop for RecurrenceStore {
    fn drop(&mut self) {
        drop(self.cmd_tx.take());
        if let Some(handle) = self.worker_join.take() {
            let _ = handle.join();
        }
    }
}

impl RecurrenceStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "recurrence_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| RcaError::Database(e.to_string()))?;
            }
        }
        if path.exists() {
            let meta = std::fs::metadata(&path).map_err(|e| RcaError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(RcaError::Database(format!(
                    "recurrence database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let conn = Connection::open(&path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(db_err)?;
        Self::start(conn, Some(path))
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::start(conn, None)
    }

    fn start(mut conn: Connection, db_path: Option<PathBuf>) -> StoreResult<Self> {
        run_migrations(&mut conn)?;
        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        let worker_join = thread::Builder::new()
            .name("rootcause-recurrence".to_string())
            .spawn(move || {
                while let Some(cmd) = cmd_rx.blocking_recv() {
                    match cmd {
                        StoreCmd::RecordSighting { sighting, reply } => {
                            let _ = reply.send(record_sighting(&mut conn, &sighting));
                        }
                        StoreCmd::SetStatus {
                            signature,
                            status,
                            pattern_id,
                            reply,
                        } => {
                            let _ = reply.send(set_status(
                                &conn,
                                &signature,
                                status,
                                pattern_id.as_deref(),
                            ));
                        }
                        StoreCmd::Get { signature, reply } => {
                            let _ = reply.send(fetch_signature(&conn, &signature));
                        }
                        StoreCmd::ListByStatus { status, reply } => {
                            let _ = reply.send(list_by_status(&conn, status));
                        }
                    }
                }
            })
            .map_err(|e| RcaError::Database(e.to_string()))?;

        Ok(Self {
            cmd_tx: Some(cmd_tx),
            worker_join: Some(worker_join),
            db_path,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> StoreCmd,
    ) -> StoreResult<T> {
        let sender = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| RcaError::Database("store is closed".to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .blocking_send(build(reply_tx))
            .map_err(|e| RcaError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| RcaError::Database(e.to_string()))?
    }

    /// Counts a signature once per analysis run; repeated sightings within
    /// the same run leave the count unchanged.
    pub fn record_sighting(&self, sighting: Sighting) -> StoreResult<SignatureRecord> {
        let signature = sighting.signature.clone();
        let record = self.request(|reply| StoreCmd::RecordSighting { sighting, reply })?;
        append_run_log(
            "debug",
            "recurrence_store.sighting",
            json!({ "signature": signature, "run_count": record.run_count }),
        );
        Ok(record)
    }

    pub fn mark_pending(&self, signature: &str) -> StoreResult<bool> {
        self.request(|reply| StoreCmd::SetStatus {
            signature: signature.to_string(),
            status: SignatureStatus::Pending,
            pattern_id: None,
            reply,
        })
    }

    pub fn mark_promoted(&self, signature: &str, pattern_id: &str) -> StoreResult<bool> {
        self.request(|reply| StoreCmd::SetStatus {
            signature: signature.to_string(),
            status: SignatureStatus::Promoted,
            pattern_id: Some(pattern_id.to_string()),
            reply,
        })
    }

    pub fn get(&self, signature: &str) -> StoreResult<Option<SignatureRecord>> {
        self.request(|reply| StoreCmd::Get {
            signature: signature.to_string(),
            reply,
        })
    }

    pub fn list_by_status(&self, status: SignatureStatus) -> StoreResult<Vec<SignatureRecord>> {
        self.request(|reply| StoreCmd::ListByStatus { status, reply })
    }
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_recurrence.sql"))];

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, strftime('%s','now'))",
            params![version],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "recurrence_store.migration.applied",
            json!({ "version": version }),
        );
    }
    Ok(())
}

fn record_sighting(conn: &mut Connection, sighting: &Sighting) -> StoreResult<SignatureRecord> {
    let tx = conn.transaction().map_err(db_err)?;
    let inserted = tx
        .execute(
            "INSERT OR IGNORE INTO signature_sightings (signature, analysis_id, seen_at)
             VALUES (?1, ?2, ?3)",
            params![sighting.signature, sighting.analysis_id, sighting.seen_at],
        )
        .map_err(db_err)?;
    tx.execute(
        "INSERT INTO signatures (signature, category, excerpt, run_count, first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(signature) DO UPDATE SET
            category = excluded.category,
            excerpt = COALESCE(excluded.excerpt, signatures.excerpt),
            run_count = signatures.run_count + ?4,
            last_seen_at = MAX(signatures.last_seen_at, excluded.last_seen_at)",
        params![
            sighting.signature,
            sighting.category.as_str(),
            sighting.excerpt,
            inserted as i64,
            sighting.seen_at,
        ],
    )
    .map_err(db_err)?;
    let record = fetch_signature(&tx, &sighting.signature)?
        .ok_or_else(|| RcaError::Database("row missing after sighting".to_string()))?;
    tx.commit().map_err(db_err)?;
    Ok(record)
}

fn set_status(
    conn: &Connection,
    signature: &str,
    status: SignatureStatus,
    pattern_id: Option<&str>,
) -> StoreResult<bool> {
    // Promotion is final.
    let changed = conn
        .execute(
            "UPDATE signatures
             SET status = ?2, pattern_id = COALESCE(?3, pattern_id)
             WHERE signature = ?1 AND status != 'promoted'",
            params![signature, status.as_str(), pattern_id],
        )
        .map_err(db_err)?;
    Ok(changed == 1)
}

fn fetch_signature(conn: &Connection, signature: &str) -> StoreResult<Option<SignatureRecord>> {
    conn.query_row(
        "SELECT signature, category, excerpt, run_count, first_seen_at, last_seen_at, status, pattern_id
         FROM signatures WHERE signature = ?1",
        [signature],
        map_signature,
    )
    .optional()
    .map_err(db_err)
}

fn list_by_status(conn: &Connection, status: SignatureStatus) -> StoreResult<Vec<SignatureRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT signature, category, excerpt, run_count, first_seen_at, last_seen_at, status, pattern_id
             FROM signatures WHERE status = ?1 ORDER BY signature",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([status.as_str()], map_signature)
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}

fn map_signature(row: &Row<'_>) -> rusqlite::Result<SignatureRecord> {
    let category: String = row.get(1)?;
    let status: String = row.get(6)?;
    let run_count: i64 = row.get(3)?;
    Ok(SignatureRecord {
        signature: row.get(0)?,
        category: FailureCategory::parse(&category).unwrap_or_default(),
        excerpt: row.get(2)?,
        run_count: run_count.max(0) as u64,
        first_seen_at: row.get(4)?,
        last_seen_at: row.get(5)?,
        status: SignatureStatus::from_db(&status).unwrap_or(SignatureStatus::Tracking),
        pattern_id: row.get(7)?,
    })
}

fn db_err(error: rusqlite::Error) -> RcaError {
    RcaError::Database(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::{RecurrenceStore, SignatureStatus, Sighting};
    use crate::types::FailureCategory;
    use tempfile::TempDir;

    fn sighting(signature: &str, analysis_id: &str, seen_at: i64) -> Sighting {
        Sighting {
            signature: signature.to_string(),
            analysis_id: analysis_id.to_string(),
            category: FailureCategory::Logic,
            excerpt: Some("assertionerror: expected 3 got".to_string()),
            seen_at,
        }
    }

    #[test]
    fn sightings_count_once_per_run() {
        let store = RecurrenceStore::in_memory().expect("store");
        store.record_sighting(sighting("residual:a", "run-1", 10)).expect("first");
        let again = store.record_sighting(sighting("residual:a", "run-1", 11)).expect("dup");
        assert_eq!(again.run_count, 1);
        let second = store.record_sighting(sighting("residual:a", "run-2", 20)).expect("second");
        assert_eq!(second.run_count, 2);
        assert_eq!(second.first_seen_at, 10);
        assert_eq!(second.last_seen_at, 20);
        assert_eq!(second.status, SignatureStatus::Tracking);
    }

    #[test]
    fn promotion_is_final() {
        let store = RecurrenceStore::in_memory().expect("store");
        store.record_sighting(sighting("residual:b", "run-1", 1)).expect("sighting");
        assert!(store.mark_pending("residual:b").expect("pending"));
        assert_eq!(
            store.list_by_status(SignatureStatus::Pending).expect("list").len(),
            1
        );
        assert!(store.mark_promoted("residual:b", "learned-1").expect("promote"));
        assert!(!store.mark_pending("residual:b").expect("no demotion"));
        let record = store.get("residual:b").expect("get").expect("present");
        assert_eq!(record.status, SignatureStatus::Promoted);
        assert_eq!(record.pattern_id.as_deref(), Some("learned-1"));
    }

    #[test]
    fn counts_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state").join("recurrence.sqlite");
        {
            let store = RecurrenceStore::open(&path).expect("open");
            store.record_sighting(sighting("residual:c", "run-1", 1)).expect("one");
            store.record_sighting(sighting("residual:c", "run-2", 2)).expect("two");
        }
        let reopened = RecurrenceStore::open(&path).expect("reopen");
        let record = reopened.get("residual:c").expect("get").expect("present");
        assert_eq!(record.run_count, 2);
        assert_eq!(record.excerpt.as_deref(), Some("assertionerror: expected 3 got"));
    }

    #[test]
    fn zero_byte_database_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("empty.sqlite");
        std::fs::write(&path, b"").expect("touch");
        assert!(RecurrenceStore::open(&path).is_err());
    }
}
