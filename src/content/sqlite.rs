//! SQLite-backed post store standing in for the host's post tables.
//! Terms are stored as a JSON column; they are always read and written with
//! the post.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{NewPost, Post, PostId, PostStore, Term};
use crate::storage::{now_unix, Database, StoreError, StoreResult};

pub struct SqlitePostStore {
    conn: Mutex<Connection>,
}

impl SqlitePostStore {
    pub fn open(db: &Database) -> StoreResult<Self> {
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_type TEXT NOT NULL DEFAULT 'post',
                status TEXT NOT NULL DEFAULT 'publish',
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                excerpt TEXT NOT NULL DEFAULT '',
                language TEXT,
                terms TEXT NOT NULL DEFAULT '[]',
                modified_at INTEGER NOT NULL
            );",
        )?;
        info!(db = ?db, "post store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_post(row: &Row<'_>) -> rusqlite::Result<(Post, String)> {
        Ok((
            Post {
                id: row.get(0)?,
                post_type: row.get(1)?,
                status: row.get(2)?,
                title: row.get(3)?,
                content: row.get(4)?,
                excerpt: row.get(5)?,
                language: row.get(6)?,
                terms: Vec::new(),
            },
            row.get(7)?,
        ))
    }

    fn with_terms((mut post, terms_json): (Post, String)) -> StoreResult<Post> {
        post.terms = serde_json::from_str::<Vec<Term>>(&terms_json)?;
        Ok(post)
    }
}

const SELECT_POST: &str = "SELECT id, post_type, status, title, content, excerpt, language, terms
     FROM posts";

impl PostStore for SqlitePostStore {
    fn get_post(&self, id: PostId) -> StoreResult<Option<Post>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_POST} WHERE id = ?1"),
                params![id],
                Self::row_to_post,
            )
            .optional()?;
        row.map(Self::with_terms).transpose()
    }

    fn insert_post(&self, post: &NewPost) -> StoreResult<PostId> {
        let terms = serde_json::to_string(&post.terms)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO posts
             (post_type, status, title, content, excerpt, language, terms, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                post.post_type,
                post.status,
                post.title,
                post.content,
                post.excerpt,
                post.language,
                terms,
                now_unix(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(post_id = id, "post inserted");
        Ok(id)
    }

    fn update_post(&self, id: PostId, post: &NewPost) -> StoreResult<()> {
        let terms = serde_json::to_string(&post.terms)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET post_type = ?1, status = ?2, title = ?3, content = ?4,
                 excerpt = ?5, language = ?6, terms = ?7, modified_at = ?8
             WHERE id = ?9",
            params![
                post.post_type,
                post.status,
                post.title,
                post.content,
                post.excerpt,
                post.language,
                terms,
                now_unix(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "post",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn delete_post(&self, id: PostId) -> StoreResult<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM posts WHERE id = ?1", params![id])? > 0)
    }

    fn trash_post(&self, id: PostId) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE posts SET status = 'trash', modified_at = ?1 WHERE id = ?2",
            params![now_unix(), id],
        )?;
        Ok(changed > 0)
    }

    fn list_posts(&self, limit: usize) -> StoreResult<Vec<Post>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_POST} ORDER BY id LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_post)?;
        let posts: StoreResult<Vec<Post>> = rows.map(|r| Self::with_terms(r?)).collect();
        posts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqlitePostStore {
        SqlitePostStore::open(&Database::memory()).unwrap()
    }

    #[test]
    fn test_insert_and_get_with_terms() {
        let store = store();
        let mut post = NewPost::new("Hello", "<p>World</p>");
        post.terms = vec![Term::new("category", "News")];
        post.language = Some("en".into());
        let id = store.insert_post(&post).unwrap();

        let loaded = store.get_post(id).unwrap().unwrap();
        assert_eq!(loaded.title, "Hello");
        assert_eq!(loaded.terms, vec![Term::new("category", "News")]);
        assert_eq!(loaded.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_update_missing_post_is_not_found() {
        let store = store();
        let err = store.update_post(42, &NewPost::new("x", "")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_trash_keeps_row() {
        let store = store();
        let id = store.insert_post(&NewPost::new("a", "b")).unwrap();
        assert!(store.trash_post(id).unwrap());
        assert_eq!(store.get_post(id).unwrap().unwrap().status, "trash");
        assert!(store.delete_post(id).unwrap());
        assert!(store.get_post(id).unwrap().is_none());
    }
}
