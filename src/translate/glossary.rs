//! Glossary loading and matching.
//! Loads fixed term pairs from JSON and returns the entries relevant to one
//! unit and target language, for injection into the prompt.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::GlossaryEntry;

/// On-disk glossary file format.
#[derive(Debug, Deserialize)]
struct GlossaryFile {
    version: u32,
    entries: Vec<GlossaryEntry>,
}

#[derive(Error, Debug)]
pub enum GlossaryError {
    #[error("glossary IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("glossary parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Loaded glossary; the version feeds the cache key so edits invalidate
/// cached translations.
#[derive(Debug, Default)]
pub struct Glossary {
    version: u32,
    entries: Vec<GlossaryEntry>,
}

impl Glossary {
    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, GlossaryError> {
        let file: GlossaryFile = serde_json::from_str(json)?;
        Ok(Self {
            version: file.version,
            entries: file.entries,
        })
    }

    /// Empty glossary (fallback when no file is configured or it fails to load).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose `source` term appears in `text` (case-insensitive) and
    /// that apply to `target_lang`.
    pub fn match_entries(&self, text: &str, target_lang: &str) -> Vec<GlossaryEntry> {
        let text_lower = text.to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.lang.as_deref().map_or(true, |l| l.eq_ignore_ascii_case(target_lang)))
            .filter(|e| text_lower.contains(&e.source.to_lowercase()))
            .cloned()
            .collect()
    }
}
