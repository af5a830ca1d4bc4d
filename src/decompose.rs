//! Splits a post into translatable units and splices translations back.
//!
//! Content is cut along block delimiters (`<!-- wp:name {..} -->`,
//! `<!-- /wp:name -->`, `<!-- wp:name /-->`). Delimiters, inter-block
//! whitespace and tag-only stretches are structural and pass through
//! verbatim; every other stretch is a block unit. Content without any
//! delimiter is treated as classic content and split on blank lines.
//!
//! Concatenating the skeleton with the original unit texts reproduces the
//! source byte for byte, so a unit that translates to itself leaves the
//! markup untouched.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::content::{NewPost, Post, Term};

static BLOCK_DELIMITER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--\s+/?wp:[a-z][a-z0-9_-]*(?:/[a-z][a-z0-9_-]*)?(?:\s+\{.*?\})?\s+/?-->")
        .expect("block delimiter pattern")
});

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n[ \t]*\r?\n\s*").expect("paragraph break pattern"));

static TAG_OR_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^>]*>|&(?:[a-zA-Z]+|#[0-9]+|#x[0-9a-fA-F]+);").expect("tag pattern")
});

/// Identity of one translatable piece of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum UnitKey {
    Title,
    Excerpt,
    Block(usize),
    Term(usize),
}

impl UnitKey {
    /// Short description handed to the model as context.
    pub fn describe(&self) -> &'static str {
        match self {
            UnitKey::Title => "post title (plain text)",
            UnitKey::Excerpt => "post excerpt",
            UnitKey::Block(_) => "HTML content block",
            UnitKey::Term(_) => "taxonomy term name (short label)",
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKey::Title => write!(f, "title"),
            UnitKey::Excerpt => write!(f, "excerpt"),
            UnitKey::Block(i) => write!(f, "block:{i}"),
            UnitKey::Term(i) => write!(f, "term:{i}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub key: UnitKey,
    pub text: String,
}

/// One piece of the content skeleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Structural markup copied verbatim.
    Markup(String),
    /// Placeholder for block unit `n`.
    Block(usize),
}

/// A post broken into ordered units plus the skeleton needed to rebuild it.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub units: Vec<Unit>,
    skeleton: Vec<Piece>,
    blocks: Vec<String>,
}

impl Decomposition {
    pub fn skeleton(&self) -> &[Piece] {
        &self.skeleton
    }

    pub fn unit(&self, key: UnitKey) -> Option<&Unit> {
        self.units.iter().find(|u| u.key == key)
    }

    /// Rebuild content from the skeleton. Blocks without a translation keep
    /// their source text.
    pub fn rebuild_content(&self, translated: &HashMap<UnitKey, String>) -> String {
        let mut out = String::new();
        for piece in &self.skeleton {
            match piece {
                Piece::Markup(m) => out.push_str(m),
                Piece::Block(i) => match translated.get(&UnitKey::Block(*i)) {
                    Some(t) => out.push_str(t),
                    None => out.push_str(&self.blocks[*i]),
                },
            }
        }
        out
    }

    /// Build the translated post. Status and language are left as in the
    /// source; the caller sets them.
    pub fn reassemble(&self, source: &Post, translated: &HashMap<UnitKey, String>) -> NewPost {
        let pick = |key: UnitKey, original: &str| {
            translated
                .get(&key)
                .cloned()
                .unwrap_or_else(|| original.to_string())
        };

        let terms = source
            .terms
            .iter()
            .enumerate()
            .map(|(i, term)| Term {
                taxonomy: term.taxonomy.clone(),
                name: pick(UnitKey::Term(i), &term.name),
            })
            .collect();

        NewPost {
            post_type: source.post_type.clone(),
            status: source.status.clone(),
            title: pick(UnitKey::Title, &source.title),
            content: self.rebuild_content(translated),
            excerpt: pick(UnitKey::Excerpt, &source.excerpt),
            language: source.language.clone(),
            terms,
        }
    }
}

/// Decompose a post: title, excerpt, content blocks, then term names.
pub fn decompose(post: &Post) -> Decomposition {
    let mut units = Vec::new();

    if has_visible_text(&post.title) {
        units.push(Unit {
            key: UnitKey::Title,
            text: post.title.clone(),
        });
    }
    if has_visible_text(&post.excerpt) {
        units.push(Unit {
            key: UnitKey::Excerpt,
            text: post.excerpt.clone(),
        });
    }

    let (skeleton, blocks) = split_content(&post.content);
    units.extend(blocks.iter().enumerate().map(|(i, text)| Unit {
        key: UnitKey::Block(i),
        text: text.clone(),
    }));

    units.extend(
        post.terms
            .iter()
            .enumerate()
            .filter(|(_, term)| has_visible_text(&term.name))
            .map(|(i, term)| Unit {
                key: UnitKey::Term(i),
                text: term.name.clone(),
            }),
    );

    Decomposition {
        units,
        skeleton,
        blocks,
    }
}

/// Split content into a skeleton and the block texts it refers to.
pub fn split_content(content: &str) -> (Vec<Piece>, Vec<String>) {
    let mut builder = SkeletonBuilder::default();

    if BLOCK_DELIMITER.is_match(content) {
        let mut cursor = 0;
        for m in BLOCK_DELIMITER.find_iter(content) {
            builder.gap(&content[cursor..m.start()]);
            builder.markup(m.as_str());
            cursor = m.end();
        }
        builder.gap(&content[cursor..]);
    } else {
        let mut cursor = 0;
        for m in PARAGRAPH_BREAK.find_iter(content) {
            builder.gap(&content[cursor..m.start()]);
            builder.markup(m.as_str());
            cursor = m.end();
        }
        builder.gap(&content[cursor..]);
    }

    (builder.skeleton, builder.blocks)
}

#[derive(Default)]
struct SkeletonBuilder {
    skeleton: Vec<Piece>,
    blocks: Vec<String>,
}

impl SkeletonBuilder {
    fn markup(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(Piece::Markup(last)) = self.skeleton.last_mut() {
            last.push_str(s);
        } else {
            self.skeleton.push(Piece::Markup(s.to_string()));
        }
    }

    /// A stretch between delimiters: a unit if it has visible text, markup otherwise.
    /// Surrounding whitespace stays structural.
    fn gap(&mut self, s: &str) {
        if !has_visible_text(s) {
            self.markup(s);
            return;
        }
        let trimmed_start = s.trim_start();
        let leading = &s[..s.len() - trimmed_start.len()];
        let core = trimmed_start.trim_end();
        let trailing = &trimmed_start[core.len()..];

        self.markup(leading);
        self.skeleton.push(Piece::Block(self.blocks.len()));
        self.blocks.push(core.to_string());
        self.markup(trailing);
    }
}

/// True if anything but tags, entities and whitespace remains.
pub fn has_visible_text(s: &str) -> bool {
    TAG_OR_ENTITY
        .replace_all(s, "")
        .chars()
        .any(|c| c.is_alphanumeric())
}
