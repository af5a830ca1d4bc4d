//! Source↔translation relationships.
//! One row per (source_post_id, target_language), enforced by a UNIQUE index;
//! writes are upserts. Deleting either endpoint only flags the row.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::content::PostId;
use crate::storage::{now_unix, Database, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Pending,
    Completed,
    Error,
    SourceDeleted,
    TranslationDeleted,
}

impl RelationshipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Completed => "completed",
            RelationshipStatus::Error => "error",
            RelationshipStatus::SourceDeleted => "source_deleted",
            RelationshipStatus::TranslationDeleted => "translation_deleted",
        }
    }

    /// Both endpoints still exist.
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            RelationshipStatus::SourceDeleted | RelationshipStatus::TranslationDeleted
        )
    }
}

impl fmt::Display for RelationshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => RelationshipStatus::Pending,
            "completed" => RelationshipStatus::Completed,
            "error" => RelationshipStatus::Error,
            "source_deleted" => RelationshipStatus::SourceDeleted,
            "translation_deleted" => RelationshipStatus::TranslationDeleted,
            other => {
                return Err(StoreError::Invalid {
                    field: "relationship status",
                    reason: other.to_string(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_post_id: PostId,
    pub translated_post_id: PostId,
    pub source_language: String,
    pub target_language: String,
    pub status: RelationshipStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct RelationshipStore {
    conn: Mutex<Connection>,
}

const SELECT_RELATIONSHIP: &str = "SELECT source_post_id, translated_post_id, source_language,
        target_language, status, created_at, updated_at
     FROM translation_relationships";

impl RelationshipStore {
    pub fn open(db: &Database) -> StoreResult<Self> {
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_post_id INTEGER NOT NULL,
                translated_post_id INTEGER NOT NULL,
                source_language TEXT NOT NULL,
                target_language TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(source_post_id, target_language)
            );
            CREATE INDEX IF NOT EXISTS idx_relationships_translated
                ON translation_relationships(translated_post_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<(Relationship, String)> {
        Ok((
            Relationship {
                source_post_id: row.get(0)?,
                translated_post_id: row.get(1)?,
                source_language: row.get(2)?,
                target_language: row.get(3)?,
                status: RelationshipStatus::Pending,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            },
            row.get(4)?,
        ))
    }

    fn with_status((mut rel, status): (Relationship, String)) -> StoreResult<Relationship> {
        rel.status = status.parse()?;
        Ok(rel)
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<Relationship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_RELATIONSHIP} {filter}"))?;
        let rows = stmt.query_map(args, Self::row_to_relationship)?;
        let rels: StoreResult<Vec<Relationship>> = rows.map(|r| Self::with_status(r?)).collect();
        rels
    }

    /// Insert or replace the relationship for (source, target language).
    /// `created_at` survives replacement.
    pub fn upsert(
        &self,
        source_post_id: PostId,
        translated_post_id: PostId,
        source_language: &str,
        target_language: &str,
        status: RelationshipStatus,
    ) -> StoreResult<Relationship> {
        if source_post_id == translated_post_id {
            return Err(StoreError::Invalid {
                field: "relationship",
                reason: "a post cannot be its own translation".into(),
            });
        }
        let now = now_unix();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO translation_relationships
                 (source_post_id, translated_post_id, source_language, target_language,
                  status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(source_post_id, target_language) DO UPDATE SET
                    translated_post_id = excluded.translated_post_id,
                    source_language = excluded.source_language,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                params![
                    source_post_id,
                    translated_post_id,
                    source_language,
                    target_language,
                    status.as_str(),
                    now,
                ],
            )?;
        }
        debug!(
            source_post_id,
            translated_post_id,
            target_language,
            %status,
            "relationship upserted"
        );
        self.get(source_post_id, target_language)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "relationship",
                id: format!("{source_post_id}/{target_language}"),
            })
    }

    pub fn get(
        &self,
        source_post_id: PostId,
        target_language: &str,
    ) -> StoreResult<Option<Relationship>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "{SELECT_RELATIONSHIP} WHERE source_post_id = ?1 AND target_language = ?2"
                ),
                params![source_post_id, target_language],
                Self::row_to_relationship,
            )
            .optional()?;
        row.map(Self::with_status).transpose()
    }

    /// All translations of a source post, ordered by language.
    pub fn translations_of(&self, source_post_id: PostId) -> StoreResult<Vec<Relationship>> {
        self.query(
            "WHERE source_post_id = ?1 ORDER BY target_language",
            &[&source_post_id],
        )
    }

    /// The relationship pointing at a translated post, if any.
    pub fn source_of(&self, translated_post_id: PostId) -> StoreResult<Option<Relationship>> {
        Ok(self
            .query("WHERE translated_post_id = ?1 LIMIT 1", &[&translated_post_id])?
            .into_iter()
            .next())
    }

    pub fn list(
        &self,
        status: Option<RelationshipStatus>,
        limit: usize,
    ) -> StoreResult<Vec<Relationship>> {
        let limit = limit as i64;
        match status {
            Some(s) => self.query(
                "WHERE status = ?1 ORDER BY updated_at DESC, id DESC LIMIT ?2",
                &[&s.as_str(), &limit],
            ),
            None => self.query("ORDER BY updated_at DESC, id DESC LIMIT ?1", &[&limit]),
        }
    }

    pub fn mark_source_deleted(&self, post_id: PostId) -> StoreResult<usize> {
        self.mark(post_id, "source_post_id", RelationshipStatus::SourceDeleted)
    }

    pub fn mark_translation_deleted(&self, post_id: PostId) -> StoreResult<usize> {
        self.mark(post_id, "translated_post_id", RelationshipStatus::TranslationDeleted)
    }

    fn mark(
        &self,
        post_id: PostId,
        column: &'static str,
        status: RelationshipStatus,
    ) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE translation_relationships SET status = ?1, updated_at = ?2
                 WHERE {column} = ?3"
            ),
            params![status.as_str(), now_unix(), post_id],
        )?;
        if changed > 0 {
            info!(post_id, %status, changed, "relationships flagged");
        }
        Ok(changed)
    }

    /// Explicitly remove a relationship. Returns false if none existed.
    pub fn unlink(&self, source_post_id: PostId, target_language: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM translation_relationships
             WHERE source_post_id = ?1 AND target_language = ?2",
            params![source_post_id, target_language],
        )?;
        Ok(removed > 0)
    }
}
