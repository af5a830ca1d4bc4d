//! Persistent priority queue of translation jobs.
//!
//! Items pop in priority order (9 first), then by scheduled time. An item
//! scheduled in the future is never claimed early, and a paused queue hands
//! out nothing. Finished items stay for audit until cleared.

pub mod worker;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::content::PostId;
use crate::storage::{now_unix, Database, StoreError, StoreResult};

pub use worker::QueueWorker;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    /// Returns whether moving from `self` to `next` is valid.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::Pending, QueueStatus::Processing)
                | (QueueStatus::Processing, QueueStatus::Completed)
                | (QueueStatus::Processing, QueueStatus::Failed)
                // automatic retry or stale recovery
                | (QueueStatus::Processing, QueueStatus::Pending)
                | (QueueStatus::Failed, QueueStatus::Pending) // manual retry
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => QueueStatus::Pending,
            "processing" => QueueStatus::Processing,
            "completed" => QueueStatus::Completed,
            "failed" => QueueStatus::Failed,
            other => {
                return Err(StoreError::Invalid {
                    field: "queue status",
                    reason: other.to_string(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub post_id: PostId,
    pub target_languages: BTreeSet<String>,
    pub priority: u8,
    pub status: QueueStatus,
    /// Unix seconds; not claimable before this.
    pub scheduled_time: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parameters for adding a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub post_id: PostId,
    pub target_languages: BTreeSet<String>,
    pub priority: u8,
    /// Defaults to now.
    #[serde(default)]
    pub scheduled_time: Option<i64>,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

pub struct QueueStore {
    conn: Mutex<Connection>,
    /// Base delay before an automatic retry; doubles per attempt.
    retry_delay_secs: i64,
}

const SELECT_ITEM: &str = "SELECT id, post_id, target_languages, priority, status, scheduled_time,
        attempts, max_attempts, error_message, created_at, updated_at
     FROM translation_queue";

impl QueueStore {
    pub fn open(db: &Database, retry_delay_secs: u64) -> StoreResult<Self> {
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                target_languages TEXT NOT NULL,
                priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 9),
                status TEXT NOT NULL,
                scheduled_time INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_pick
                ON translation_queue(status, priority DESC, scheduled_time);
            CREATE TABLE IF NOT EXISTS queue_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry_delay_secs: retry_delay_secs as i64,
        })
    }

    fn row_to_item(row: &Row<'_>) -> rusqlite::Result<(QueueItem, String, String)> {
        Ok((
            QueueItem {
                id: row.get(0)?,
                post_id: row.get(1)?,
                target_languages: BTreeSet::new(),
                priority: row.get(3)?,
                status: QueueStatus::Pending,
                scheduled_time: row.get(5)?,
                attempts: row.get(6)?,
                max_attempts: row.get(7)?,
                error_message: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
            },
            row.get(2)?,
            row.get(4)?,
        ))
    }

    fn decode((mut item, langs, status): (QueueItem, String, String)) -> StoreResult<QueueItem> {
        item.target_languages = serde_json::from_str(&langs)?;
        item.status = status.parse()?;
        Ok(item)
    }

    fn get_locked(conn: &Connection, id: i64) -> StoreResult<Option<QueueItem>> {
        let row = conn
            .query_row(&format!("{SELECT_ITEM} WHERE id = ?1"), params![id], Self::row_to_item)
            .optional()?;
        row.map(Self::decode).transpose()
    }

    fn require_locked(conn: &Connection, id: i64) -> StoreResult<QueueItem> {
        Self::get_locked(conn, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "queue item",
            id: id.to_string(),
        })
    }

    fn check_transition(item: &QueueItem, next: QueueStatus) -> StoreResult<()> {
        if item.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::Invalid {
                field: "queue transition",
                reason: format!("item {}: {} -> {}", item.id, item.status, next),
            })
        }
    }

    /// Add a job. A pending job for the same post absorbs the request:
    /// languages are merged, the higher priority and earlier schedule win.
    pub fn enqueue(&self, request: &EnqueueRequest) -> StoreResult<QueueItem> {
        self.enqueue_at(request, now_unix())
    }

    pub fn enqueue_at(&self, request: &EnqueueRequest, now: i64) -> StoreResult<QueueItem> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
            return Err(StoreError::Invalid {
                field: "priority",
                reason: format!("{} is outside {MIN_PRIORITY}..={MAX_PRIORITY}", request.priority),
            });
        }
        if request.target_languages.is_empty() {
            return Err(StoreError::Invalid {
                field: "target_languages",
                reason: "at least one language is required".into(),
            });
        }
        if request.max_attempts == 0 {
            return Err(StoreError::Invalid {
                field: "max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        let scheduled = request.scheduled_time.unwrap_or(now);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                &format!(
                    "{SELECT_ITEM} WHERE post_id = ?1 AND status = 'pending' ORDER BY id LIMIT 1"
                ),
                params![request.post_id],
                Self::row_to_item,
            )
            .optional()?
            .map(Self::decode)
            .transpose()?;

        let id = match existing {
            Some(item) => {
                let mut langs = item.target_languages.clone();
                langs.extend(request.target_languages.iter().cloned());
                tx.execute(
                    "UPDATE translation_queue SET target_languages = ?1, priority = ?2,
                         scheduled_time = ?3, max_attempts = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        serde_json::to_string(&langs)?,
                        item.priority.max(request.priority),
                        item.scheduled_time.min(scheduled),
                        item.max_attempts.max(request.max_attempts),
                        now,
                        item.id,
                    ],
                )?;
                debug!(
                    item_id = item.id,
                    post_id = request.post_id,
                    "merged into pending queue item"
                );
                item.id
            }
            None => {
                tx.execute(
                    "INSERT INTO translation_queue
                     (post_id, target_languages, priority, status, scheduled_time,
                      attempts, max_attempts, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?6)",
                    params![
                        request.post_id,
                        serde_json::to_string(&request.target_languages)?,
                        request.priority,
                        scheduled,
                        request.max_attempts,
                        now,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };
        let item = Self::require_locked(&tx, id)?;
        tx.commit()?;
        info!(
            item_id = item.id,
            post_id = item.post_id,
            priority = item.priority,
            languages = item.target_languages.len(),
            "queue item enqueued"
        );
        Ok(item)
    }

    /// Claim the next eligible item (pending, due, highest priority first).
    pub fn claim_next(&self) -> StoreResult<Option<QueueItem>> {
        self.claim_next_at(now_unix())
    }

    pub fn claim_next_at(&self, now: i64) -> StoreResult<Option<QueueItem>> {
        let mut conn = self.conn.lock();
        if Self::paused_locked(&conn)? {
            return Ok(None);
        }
        let tx = conn.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM translation_queue
                 WHERE status = 'pending' AND scheduled_time <= ?1
                 ORDER BY priority DESC, scheduled_time ASC, id ASC
                 LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE translation_queue SET status = 'processing', updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        let item = Self::require_locked(&tx, id)?;
        tx.commit()?;
        debug!(item_id = id, post_id = item.post_id, "queue item claimed");
        Ok(Some(item))
    }

    pub fn complete(&self, id: i64) -> StoreResult<QueueItem> {
        let conn = self.conn.lock();
        let item = Self::require_locked(&conn, id)?;
        Self::check_transition(&item, QueueStatus::Completed)?;
        conn.execute(
            "UPDATE translation_queue SET status = 'completed', error_message = NULL,
                 updated_at = ?1
             WHERE id = ?2",
            params![now_unix(), id],
        )?;
        Self::require_locked(&conn, id)
    }

    /// Record a failed run. The attempt counter goes up; while attempts remain
    /// the item is rescheduled with exponential delay, otherwise (or when
    /// `retryable` is false) it becomes `failed`.
    pub fn fail(&self, id: i64, error: &str, retryable: bool) -> StoreResult<QueueItem> {
        self.fail_at(id, error, retryable, now_unix())
    }

    pub fn fail_at(
        &self,
        id: i64,
        error: &str,
        retryable: bool,
        now: i64,
    ) -> StoreResult<QueueItem> {
        let conn = self.conn.lock();
        let item = Self::require_locked(&conn, id)?;
        Self::check_transition(&item, QueueStatus::Failed)?;

        let attempts = (item.attempts + 1).min(item.max_attempts);
        if retryable && attempts < item.max_attempts {
            let delay = self.retry_delay_secs.saturating_mul(1i64 << (attempts - 1).min(20));
            conn.execute(
                "UPDATE translation_queue SET status = 'pending', attempts = ?1, error_message = ?2,
                     scheduled_time = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![attempts, error, now.saturating_add(delay), now, id],
            )?;
            warn!(
                item_id = id,
                attempts,
                max_attempts = item.max_attempts,
                delay_secs = delay,
                error,
                "queue item rescheduled"
            );
        } else {
            conn.execute(
                "UPDATE translation_queue SET status = 'failed', attempts = ?1, error_message = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![attempts, error, now, id],
            )?;
            warn!(item_id = id, attempts, error, "queue item failed permanently");
        }
        Self::require_locked(&conn, id)
    }

    /// Manually requeue a failed item with a fresh attempt budget.
    pub fn retry(&self, id: i64) -> StoreResult<QueueItem> {
        let conn = self.conn.lock();
        let item = Self::require_locked(&conn, id)?;
        if item.status != QueueStatus::Failed {
            return Err(StoreError::Invalid {
                field: "queue transition",
                reason: format!("item {id} is {}, only failed items can be retried", item.status),
            });
        }
        let now = now_unix();
        conn.execute(
            "UPDATE translation_queue SET status = 'pending', attempts = 0, error_message = NULL,
                 scheduled_time = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, id],
        )?;
        info!(item_id = id, "queue item retried");
        Self::require_locked(&conn, id)
    }

    /// Put items a crashed worker left in `processing` back to `pending`.
    pub fn recover_stale(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE translation_queue SET status = 'pending', updated_at = ?1
             WHERE status = 'processing'",
            params![now_unix()],
        )?;
        if changed > 0 {
            warn!(recovered = changed, "stale processing items returned to pending");
        }
        Ok(changed)
    }

    /// Remove finished items. `None` clears both completed and failed.
    pub fn clear(&self, status: Option<QueueStatus>) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let removed = match status {
            Some(s) if s.is_final() => conn.execute(
                "DELETE FROM translation_queue WHERE status = ?1",
                params![s.as_str()],
            )?,
            Some(s) => {
                return Err(StoreError::Invalid {
                    field: "status",
                    reason: format!("cannot clear {s} items"),
                })
            }
            None => conn.execute(
                "DELETE FROM translation_queue WHERE status IN ('completed', 'failed')",
                [],
            )?,
        };
        info!(removed, "queue cleared");
        Ok(removed)
    }

    pub fn get(&self, id: i64) -> StoreResult<Option<QueueItem>> {
        Self::get_locked(&self.conn.lock(), id)
    }

    /// Items in pick order (priority desc, schedule asc).
    pub fn list(&self, status: Option<QueueStatus>, limit: usize) -> StoreResult<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let order = "ORDER BY priority DESC, scheduled_time ASC, id ASC LIMIT";
        let mut stmt;
        let rows = match status {
            Some(s) => {
                stmt = conn.prepare(&format!("{SELECT_ITEM} WHERE status = ?1 {order} ?2"))?;
                stmt.query_map(params![s.as_str(), limit as i64], Self::row_to_item)?
            }
            None => {
                stmt = conn.prepare(&format!("{SELECT_ITEM} {order} ?1"))?;
                stmt.query_map(params![limit as i64], Self::row_to_item)?
            }
        };
        let items: StoreResult<Vec<QueueItem>> = rows.map(|r| Self::decode(r?)).collect();
        items
    }

    pub fn stats(&self) -> StoreResult<QueueStats> {
        let conn = self.conn.lock();
        let mut stats = QueueStats {
            paused: Self::paused_locked(&conn)?,
            ..QueueStats::default()
        };
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM translation_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            match status.parse::<QueueStatus>()? {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Completed => stats.completed = count,
                QueueStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    pub fn pause(&self) -> StoreResult<()> {
        self.set_paused(true)
    }

    pub fn resume(&self) -> StoreResult<()> {
        self.set_paused(false)
    }

    pub fn is_paused(&self) -> StoreResult<bool> {
        Self::paused_locked(&self.conn.lock())
    }

    fn set_paused(&self, paused: bool) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO queue_settings (key, value) VALUES ('paused', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![if paused { "1" } else { "0" }],
        )?;
        info!(paused, "queue pause flag set");
        Ok(())
    }

    fn paused_locked(conn: &Connection) -> StoreResult<bool> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM queue_settings WHERE key = 'paused'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> QueueStore {
        QueueStore::open(&Database::memory(), 60).unwrap()
    }

    fn request(post_id: PostId, priority: u8, langs: &[&str]) -> EnqueueRequest {
        EnqueueRequest {
            post_id,
            target_languages: langs.iter().map(|s| s.to_string()).collect(),
            priority,
            scheduled_time: None,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_priority_then_schedule_order() {
        let q = store();
        let now = 1_000;
        q.enqueue_at(&request(1, 5, &["fr"]), now).unwrap();
        let earlier = EnqueueRequest {
            scheduled_time: Some(now - 50),
            ..request(2, 5, &["fr"])
        };
        q.enqueue_at(&earlier, now).unwrap();
        q.enqueue_at(&request(3, 9, &["fr"]), now).unwrap();

        let order: Vec<PostId> = std::iter::from_fn(|| q.claim_next_at(now).unwrap())
            .map(|item| item.post_id)
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_future_items_not_claimed_early() {
        let q = store();
        let later = EnqueueRequest {
            scheduled_time: Some(2_000),
            ..request(1, 9, &["fr"])
        };
        q.enqueue_at(&later, 1_000).unwrap();
        assert!(q.claim_next_at(1_999).unwrap().is_none());
        let item = q.claim_next_at(2_000).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
    }

    #[test]
    fn test_pause_gates_dequeue() {
        let q = store();
        q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        q.pause().unwrap();
        assert!(q.is_paused().unwrap());
        assert!(q.claim_next_at(10).unwrap().is_none());
        q.resume().unwrap();
        assert!(q.claim_next_at(10).unwrap().is_some());
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let q = store();
        let item = q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        let mut now = 0;
        for round in 1..=3 {
            let claimed = q.claim_next_at(now).unwrap().expect("item due");
            let after = q.fail_at(claimed.id, "boom", true, now).unwrap();
            assert!(after.attempts <= after.max_attempts);
            assert_eq!(after.attempts, round);
            if round < 3 {
                assert_eq!(after.status, QueueStatus::Pending);
                // 60s, then 120s
                assert_eq!(after.scheduled_time, now + 60 * (1 << (round - 1)));
                now = after.scheduled_time;
            } else {
                assert_eq!(after.status, QueueStatus::Failed);
                assert_eq!(after.error_message.as_deref(), Some("boom"));
            }
        }
        assert!(q.claim_next_at(i64::MAX).unwrap().is_none());
        assert_eq!(q.get(item.id).unwrap().unwrap().attempts, 3);
    }

    #[test]
    fn test_non_retryable_failure_is_final() {
        let q = store();
        q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        let claimed = q.claim_next_at(0).unwrap().unwrap();
        let after = q.fail_at(claimed.id, "post not found", false, 0).unwrap();
        assert_eq!(after.status, QueueStatus::Failed);
        assert_eq!(after.attempts, 1);
    }

    #[test]
    fn test_manual_retry_only_from_failed() {
        let q = store();
        let item = q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        assert!(q.retry(item.id).is_err());
        let claimed = q.claim_next_at(0).unwrap().unwrap();
        q.fail_at(claimed.id, "x", false, 0).unwrap();
        let retried = q.retry(item.id).unwrap();
        assert_eq!(retried.status, QueueStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(retried.error_message.is_none());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let q = store();
        let item = q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        assert!(q.complete(item.id).is_err(), "pending cannot complete");
        q.claim_next_at(0).unwrap();
        q.complete(item.id).unwrap();
        assert!(q.fail(item.id, "late", true).is_err(), "completed cannot fail");
        assert!(QueueStatus::Failed.can_transition_to(QueueStatus::Pending));
        assert!(!QueueStatus::Completed.can_transition_to(QueueStatus::Processing));
    }

    #[test]
    fn test_enqueue_merges_pending_item_for_same_post() {
        let q = store();
        let first = q.enqueue_at(&request(1, 3, &["fr"]), 100).unwrap();
        let again = EnqueueRequest {
            scheduled_time: Some(50),
            ..request(1, 7, &["de", "fr"])
        };
        let merged = q.enqueue_at(&again, 100).unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.priority, 7);
        assert_eq!(merged.scheduled_time, 50);
        assert_eq!(merged.target_languages.len(), 2);
        assert_eq!(q.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_enqueue_validation() {
        let q = store();
        assert!(q.enqueue(&request(1, 0, &["fr"])).is_err());
        assert!(q.enqueue(&request(1, 10, &["fr"])).is_err());
        assert!(q.enqueue(&request(1, 5, &[])).is_err());
    }

    #[test]
    fn test_clear_keeps_active_items() {
        let q = store();
        let a = q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        q.enqueue_at(&request(2, 5, &["fr"]), 0).unwrap();
        q.claim_next_at(0).unwrap();
        q.complete(a.id).unwrap();

        assert!(q.clear(Some(QueueStatus::Pending)).is_err());
        assert_eq!(q.clear(None).unwrap(), 1);
        let stats = q.stats().unwrap();
        assert_eq!((stats.pending, stats.completed), (1, 0));
    }

    #[test]
    fn test_recover_stale_processing() {
        let q = store();
        q.enqueue_at(&request(1, 5, &["fr"]), 0).unwrap();
        q.claim_next_at(0).unwrap();
        assert_eq!(q.recover_stale().unwrap(), 1);
        assert_eq!(q.list(Some(QueueStatus::Pending), 10).unwrap().len(), 1);
    }
}
