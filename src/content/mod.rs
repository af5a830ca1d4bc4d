//! Post model and the content-store boundary.
//! The host CMS owns posts; the engine only sees them through `PostStore`.

pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::storage::StoreResult;

pub use sqlite::SqlitePostStore;

pub type PostId = i64;

/// A taxonomy term attached to a post (category, tag, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub taxonomy: String,
    pub name: String,
}

impl Term {
    pub fn new(taxonomy: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            taxonomy: taxonomy.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub post_type: String,
    pub status: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub language: Option<String>,
    pub terms: Vec<Term>,
}

/// Fields for inserting or overwriting a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    #[serde(default = "default_post_type")]
    pub post_type: String,
    #[serde(default = "default_status")]
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub terms: Vec<Term>,
}

fn default_post_type() -> String {
    "post".into()
}

fn default_status() -> String {
    "publish".into()
}

impl NewPost {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            post_type: default_post_type(),
            status: default_status(),
            title: title.into(),
            content: content.into(),
            excerpt: String::new(),
            language: None,
            terms: Vec::new(),
        }
    }
}

impl From<Post> for NewPost {
    fn from(post: Post) -> Self {
        Self {
            post_type: post.post_type,
            status: post.status,
            title: post.title,
            content: post.content,
            excerpt: post.excerpt,
            language: post.language,
            terms: post.terms,
        }
    }
}

/// Content store adapter (the host's get_post / insert_post / update_post).
pub trait PostStore: Send + Sync {
    fn get_post(&self, id: PostId) -> StoreResult<Option<Post>>;
    fn insert_post(&self, post: &NewPost) -> StoreResult<PostId>;
    fn update_post(&self, id: PostId, post: &NewPost) -> StoreResult<()>;
    fn delete_post(&self, id: PostId) -> StoreResult<bool>;
    /// Move to trash (status = "trash"); the row stays.
    fn trash_post(&self, id: PostId) -> StoreResult<bool>;
    fn list_posts(&self, limit: usize) -> StoreResult<Vec<Post>>;
}
