//! Translation log with async batch writing.
//! Entries go through a channel and are written to SQLite in batches every
//! 300ms, so a translation run never waits on log I/O.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::content::PostId;
use crate::storage::{now_unix, Database, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Translate,
    Delete,
    Trash,
    Unlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Partial,
    Error,
}

macro_rules! str_enum {
    ($ty:ident, $field:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(StoreError::Invalid { field: $field, reason: other.to_string() }),
                }
            }
        }
    };
}

str_enum!(LogAction, "log action", {
    Translate => "translate",
    Delete => "delete",
    Trash => "trash",
    Unlink => "unlink",
});

str_enum!(LogStatus, "log status", {
    Success => "success",
    Partial => "partial",
    Error => "error",
});

/// One row of the translation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub post_id: PostId,
    pub target_language: Option<String>,
    pub action: LogAction,
    pub status: LogStatus,
    pub message: String,
    pub api_calls_count: u32,
    pub processing_time_ms: u64,
    pub created_at: i64,
}

impl LogEntry {
    pub fn new(
        post_id: PostId,
        action: LogAction,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            post_id,
            target_language: None,
            action,
            status,
            message: message.into(),
            api_calls_count: 0,
            processing_time_ms: 0,
            created_at: now_unix(),
        }
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.target_language = Some(lang.into());
        self
    }

    pub fn cost(mut self, api_calls: u32, elapsed: Duration) -> Self {
        self.api_calls_count = api_calls;
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }
}

enum LogCommand {
    Entry(LogEntry),
    /// Write everything buffered so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

pub struct TranslationLog {
    tx: mpsc::UnboundedSender<LogCommand>,
    read_conn: Mutex<Connection>,
}

const SELECT_ENTRY: &str = "SELECT post_id, target_language, action, status, message,
        api_calls_count, processing_time_ms, created_at
     FROM translation_logs";

impl TranslationLog {
    /// Open the log table and spawn the batch writer. Needs a Tokio runtime.
    pub fn open(db: &Database) -> StoreResult<Arc<Self>> {
        let read_conn = db.connect()?;
        read_conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                target_language TEXT,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                api_calls_count INTEGER NOT NULL DEFAULT 0,
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_post ON translation_logs(post_id);
            CREATE INDEX IF NOT EXISTS idx_logs_created ON translation_logs(created_at);",
        )?;
        let write_conn = db.connect()?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(rx, write_conn));
        info!("translation log opened with batch writer");

        Ok(Arc::new(Self {
            tx,
            read_conn: Mutex::new(read_conn),
        }))
    }

    /// Queue an entry for the batch writer. Never blocks.
    pub fn record(&self, entry: LogEntry) {
        if self.tx.send(LogCommand::Entry(entry)).is_err() {
            warn!("translation log writer has stopped, entry dropped");
        }
    }

    /// Wait until everything recorded so far has been written. Returns
    /// false if the writer is gone or the batch could not be committed.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(ack)).is_err() {
            return false;
        }
        done.await.is_ok()
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<(LogEntry, String, String)> {
        Ok((
            LogEntry {
                post_id: row.get(0)?,
                target_language: row.get(1)?,
                action: LogAction::Translate,
                status: LogStatus::Success,
                message: row.get(4)?,
                api_calls_count: row.get(5)?,
                processing_time_ms: row.get::<_, i64>(6)? as u64,
                created_at: row.get(7)?,
            },
            row.get(2)?,
            row.get(3)?,
        ))
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<LogEntry>> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} {filter}"))?;
        let rows = stmt.query_map(args, Self::row_to_entry)?;
        let entries: StoreResult<Vec<LogEntry>> = rows
            .map(|r| {
                let (mut entry, action, status) = r?;
                entry.action = action.parse()?;
                entry.status = status.parse()?;
                Ok(entry)
            })
            .collect();
        entries
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> StoreResult<Vec<LogEntry>> {
        self.query("ORDER BY created_at DESC, id DESC LIMIT ?1", &[&(limit as i64)])
    }

    pub fn for_post(&self, post_id: PostId, limit: usize) -> StoreResult<Vec<LogEntry>> {
        self.query(
            "WHERE post_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            &[&post_id, &(limit as i64)],
        )
    }

    pub fn cleanup_older_than_days(&self, days: u32) -> StoreResult<usize> {
        let cutoff = now_unix() - i64::from(days) * 86_400;
        let removed = self
            .read_conn
            .lock()
            .execute("DELETE FROM translation_logs WHERE created_at < ?1", params![cutoff])?;
        if removed > 0 {
            info!(removed, days, "translation log cleanup");
        }
        Ok(removed)
    }
}

async fn flush_loop(mut rx: mpsc::UnboundedReceiver<LogCommand>, conn: Connection) {
    let flush_interval = Duration::from_millis(300);
    let mut buffer: Vec<LogEntry> = Vec::with_capacity(32);
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            cmd = rx.recv() => match cmd {
                Some(LogCommand::Entry(entry)) => buffer.push(entry),
                Some(LogCommand::Flush(ack)) => waiters.push(ack),
                None => {
                    if !buffer.is_empty() {
                        flush_batch(&conn, &buffer);
                    }
                    info!("translation log writer exiting (channel closed)");
                    return;
                }
            }
        }

        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                LogCommand::Entry(entry) => buffer.push(entry),
                LogCommand::Flush(ack) => waiters.push(ack),
            }
        }

        let committed = buffer.is_empty() || flush_batch(&conn, &buffer);
        buffer.clear();
        if committed {
            for ack in waiters.drain(..) {
                let _ = ack.send(());
            }
        } else {
            // dropping the senders tells flush() the batch did not land
            waiters.clear();
        }
    }
}

/// Write a batch in one transaction. A row that fails is skipped and the
/// rest are kept. Returns false when the transaction itself failed.
fn flush_batch(conn: &Connection, entries: &[LogEntry]) -> bool {
    let start = std::time::Instant::now();
    match write_batch(conn, entries) {
        Ok(written) => {
            debug!(
                written,
                skipped = entries.len() - written,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "translation log batch flushed"
            );
            true
        }
        Err(e) => {
            warn!(error = %e, count = entries.len(), "translation log batch failed");
            let _ = conn.execute_batch("ROLLBACK");
            false
        }
    }
}

fn write_batch(conn: &Connection, entries: &[LogEntry]) -> rusqlite::Result<usize> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    let mut written = 0;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO translation_logs
             (post_id, target_language, action, status, message,
              api_calls_count, processing_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for entry in entries {
            let result = stmt.execute(params![
                entry.post_id,
                entry.target_language,
                entry.action.as_str(),
                entry.status.as_str(),
                entry.message,
                entry.api_calls_count,
                entry.processing_time_ms as i64,
                entry.created_at,
            ]);
            match result {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(error = %e, post_id = entry.post_id, "translation log insert failed")
                }
            }
        }
    }
    conn.execute_batch("COMMIT")?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flush_makes_entries_visible() {
        let log = TranslationLog::open(&Database::memory()).unwrap();
        log.record(
            LogEntry::new(1, LogAction::Translate, LogStatus::Success, "ok")
                .language("fr")
                .cost(3, Duration::from_millis(250)),
        );
        log.record(LogEntry::new(2, LogAction::Delete, LogStatus::Success, "deleted"));
        log.flush().await;

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        let first = log.for_post(1, 10).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].target_language.as_deref(), Some("fr"));
        assert_eq!(first[0].api_calls_count, 3);
        assert_eq!(first[0].processing_time_ms, 250);
        assert_eq!(first[0].action, LogAction::Translate);
    }

    #[tokio::test]
    async fn test_rejected_row_does_not_drop_the_batch() {
        let db = Database::memory();
        let log = TranslationLog::open(&db).unwrap();
        db.connect()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_bad_rows BEFORE INSERT ON translation_logs
                 WHEN NEW.message = 'bad' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        log.record(LogEntry::new(1, LogAction::Translate, LogStatus::Success, "ok"));
        log.record(LogEntry::new(2, LogAction::Translate, LogStatus::Error, "bad"));
        log.record(LogEntry::new(3, LogAction::Unlink, LogStatus::Success, "ok"));
        assert!(log.flush().await);

        let mut posts: Vec<PostId> = log.recent(10).unwrap().iter().map(|e| e.post_id).collect();
        posts.sort();
        assert_eq!(posts, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_entries() {
        let log = TranslationLog::open(&Database::memory()).unwrap();
        let mut old = LogEntry::new(1, LogAction::Unlink, LogStatus::Success, "");
        old.created_at = now_unix() - 40 * 86_400;
        log.record(old);
        log.record(LogEntry::new(1, LogAction::Translate, LogStatus::Error, "boom"));
        log.flush().await;

        assert_eq!(log.cleanup_older_than_days(30).unwrap(), 1);
        let left = log.for_post(1, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, LogStatus::Error);
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!("trash".parse::<LogAction>().unwrap(), LogAction::Trash);
        assert_eq!(LogStatus::Partial.to_string(), "partial");
        assert!("nope".parse::<LogStatus>().is_err());
    }
}
