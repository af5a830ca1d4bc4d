//! Translation orchestration.
//!
//! A run takes one source post and a set of target languages:
//! decompose → per unit (protect → cache/glossary → throttle → call → retry)
//! → reassemble → save → relationship → log. Units fail independently; a
//! failed unit keeps its source text in the saved post and the language is
//! recorded as `error` so it can be resumed later under the same progress id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::content::{Post, PostId, PostStore};
use crate::decompose::{decompose, Decomposition, Unit, UnitKey};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::progress::{ProgressTracker, RunStatus, StepStatus, TakeRunError};
use crate::relationship::{RelationshipStatus, RelationshipStore};
use crate::storage::StoreError;
use crate::throttle::Throttle;
use crate::translate::cache::TranslationCache;
use crate::translate::glossary::Glossary;
use crate::translate::normalize::{detect_language, protect};
use crate::translate::{TranslateError, TranslateRequest, Translator};
use crate::translation_log::{LogAction, LogEntry, LogStatus, TranslationLog};

/// Used when the post carries no language, none is configured, and
/// detection is not confident.
pub const FALLBACK_SOURCE_LANGUAGE: &str = "en";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("post {0} not found")]
    PostNotFound(PostId),

    #[error("no target languages given")]
    NoLanguages,

    #[error("unknown progress id {0}")]
    UnknownProgress(String),

    #[error("run {0} is still in progress")]
    RunInProgress(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageStatus {
    Completed,
    /// Saved, but some units kept their source text.
    Partial,
    Failed,
    /// Target equals the source language.
    Skipped,
    /// Not reached before cancellation.
    Pending,
}

/// Per-language unit outcomes, kept between a run and its resumes.
#[derive(Debug, Clone, Default)]
pub struct LanguageRun {
    pub translated: HashMap<UnitKey, String>,
    pub failed: BTreeMap<UnitKey, String>,
    pub translated_post_id: Option<PostId>,
    pub api_calls: u32,
    pub skipped: bool,
    /// Save or relationship failure.
    pub error: Option<String>,
}

impl LanguageRun {
    fn is_done(&self, decomposition: &Decomposition) -> bool {
        self.skipped
            || (self.translated_post_id.is_some()
                && self.error.is_none()
                && decomposition
                    .units
                    .iter()
                    .all(|u| self.translated.contains_key(&u.key)))
    }

    pub fn status(&self) -> LanguageStatus {
        if self.skipped {
            return LanguageStatus::Skipped;
        }
        if self.translated_post_id.is_none() || self.error.is_some() {
            return if self.failed.is_empty() && self.error.is_none() {
                LanguageStatus::Pending
            } else {
                LanguageStatus::Failed
            };
        }
        match (self.failed.is_empty(), self.translated.is_empty()) {
            (true, _) => LanguageStatus::Completed,
            (false, true) => LanguageStatus::Failed,
            (false, false) => LanguageStatus::Partial,
        }
    }
}

/// Everything a resume needs: the source snapshot and per-language outcomes.
#[derive(Debug, Clone)]
pub struct RunState {
    pub post: Post,
    pub source_language: String,
    pub decomposition: Decomposition,
    pub languages: BTreeMap<String, LanguageRun>,
    pub cancelled: bool,
}

impl RunState {
    pub fn run_status(&self) -> RunStatus {
        if self.cancelled {
            return RunStatus::Cancelled;
        }
        let statuses: Vec<LanguageStatus> = self
            .languages
            .values()
            .map(LanguageRun::status)
            .filter(|s| *s != LanguageStatus::Skipped)
            .collect();
        if statuses.iter().all(|s| *s == LanguageStatus::Completed) {
            RunStatus::Completed
        } else if statuses.iter().all(|s| *s == LanguageStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    pub fn outcome(&self, progress_id: &str) -> TranslationOutcome {
        let total = self.decomposition.units.len();
        TranslationOutcome {
            progress_id: progress_id.to_string(),
            post_id: self.post.id,
            source_language: self.source_language.clone(),
            status: self.run_status(),
            languages: self
                .languages
                .iter()
                .map(|(lang, run)| LanguageOutcome {
                    language: lang.clone(),
                    status: run.status(),
                    translated_post_id: run.translated_post_id,
                    units_total: total,
                    units_failed: run.failed.len(),
                    api_calls: run.api_calls,
                    errors: run
                        .failed
                        .iter()
                        .map(|(key, e)| format!("{key}: {e}"))
                        .chain(run.error.iter().cloned())
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguageOutcome {
    pub language: String,
    pub status: LanguageStatus,
    pub translated_post_id: Option<PostId>,
    pub units_total: usize,
    pub units_failed: usize,
    pub api_calls: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslationOutcome {
    pub progress_id: String,
    pub post_id: PostId,
    pub source_language: String,
    pub status: RunStatus,
    pub languages: Vec<LanguageOutcome>,
}

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub posts: Arc<dyn PostStore>,
    pub translator: Arc<dyn Translator>,
    pub throttle: Arc<Throttle>,
    pub cache: Arc<TranslationCache>,
    pub glossary: Arc<Glossary>,
    pub relationships: Arc<RelationshipStore>,
    pub log: Arc<TranslationLog>,
    pub progress: Arc<ProgressTracker>,
    pub metrics: Arc<MetricsRegistry>,
    pub retry: RetryConfig,
    /// Status for new, fully translated posts.
    pub publish_status: String,
    pub source_language: Option<String>,
}

pub struct TranslationEngine {
    posts: Arc<dyn PostStore>,
    translator: Arc<dyn Translator>,
    throttle: Arc<Throttle>,
    cache: Arc<TranslationCache>,
    glossary: Arc<Glossary>,
    relationships: Arc<RelationshipStore>,
    log: Arc<TranslationLog>,
    progress: Arc<ProgressTracker>,
    metrics: Arc<MetricsRegistry>,
    retry: RetryConfig,
    publish_status: String,
    source_language: Option<String>,
}

impl TranslationEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            posts: parts.posts,
            translator: parts.translator,
            throttle: parts.throttle,
            cache: parts.cache,
            glossary: parts.glossary,
            relationships: parts.relationships,
            log: parts.log,
            progress: parts.progress,
            metrics: parts.metrics,
            retry: parts.retry,
            publish_status: parts.publish_status,
            source_language: parts.source_language,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn relationships(&self) -> &Arc<RelationshipStore> {
        &self.relationships
    }

    pub fn log(&self) -> &Arc<TranslationLog> {
        &self.log
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn posts(&self) -> &Arc<dyn PostStore> {
        &self.posts
    }

    fn prepare(
        &self,
        post_id: PostId,
        languages: &[String],
    ) -> Result<(Post, Vec<String>), EngineError> {
        let mut langs: Vec<String> = Vec::with_capacity(languages.len());
        for lang in languages {
            let lang = lang.trim().to_lowercase();
            if !lang.is_empty() && !langs.contains(&lang) {
                langs.push(lang);
            }
        }
        if langs.is_empty() {
            return Err(EngineError::NoLanguages);
        }
        let post = self
            .posts
            .get_post(post_id)?
            .ok_or(EngineError::PostNotFound(post_id))?;
        Ok((post, langs))
    }

    /// Translate a post into `languages` and wait for the outcome.
    pub async fn translate_post(
        &self,
        post_id: PostId,
        languages: &[String],
    ) -> Result<TranslationOutcome, EngineError> {
        let (post, languages) = self.prepare(post_id, languages)?;
        let (progress_id, cancel) = self.progress.start(post_id);
        let state = self.new_run(&progress_id, post, &languages);
        Ok(self.execute(&progress_id, &cancel, state).await)
    }

    /// Start a run in the background and return its progress id.
    pub fn spawn_translation(
        self: &Arc<Self>,
        post_id: PostId,
        languages: &[String],
    ) -> Result<String, EngineError> {
        let (post, languages) = self.prepare(post_id, languages)?;
        let (progress_id, cancel) = self.progress.start(post_id);
        let state = self.new_run(&progress_id, post, &languages);

        let engine = Arc::clone(self);
        let id = progress_id.clone();
        tokio::spawn(async move {
            engine.execute(&id, &cancel, state).await;
        });
        Ok(progress_id)
    }

    /// Re-run only what did not succeed last time, under the same progress id.
    /// A run with nothing left to do returns its outcome untouched.
    pub async fn resume(&self, progress_id: &str) -> Result<TranslationOutcome, EngineError> {
        match self.begin_resume(progress_id)? {
            Resume::Noop(outcome) => Ok(outcome),
            Resume::Run(state, cancel) => Ok(self.execute(progress_id, &cancel, state).await),
        }
    }

    /// Background variant of [`resume`](Self::resume). Returns whether any
    /// work was started.
    pub fn spawn_resume(self: &Arc<Self>, progress_id: &str) -> Result<bool, EngineError> {
        match self.begin_resume(progress_id)? {
            Resume::Noop(_) => Ok(false),
            Resume::Run(state, cancel) => {
                let engine = Arc::clone(self);
                let id = progress_id.to_string();
                tokio::spawn(async move {
                    engine.execute(&id, &cancel, state).await;
                });
                Ok(true)
            }
        }
    }

    fn begin_resume(&self, progress_id: &str) -> Result<Resume, EngineError> {
        let state = self.progress.take_run(progress_id).map_err(|e| match e {
            TakeRunError::Unknown => EngineError::UnknownProgress(progress_id.to_string()),
            TakeRunError::InFlight => EngineError::RunInProgress(progress_id.to_string()),
        })?;

        let all_done = state
            .languages
            .values()
            .all(|run| run.is_done(&state.decomposition));
        if all_done && !state.cancelled {
            let outcome = state.outcome(progress_id);
            self.progress.store_run(progress_id, state);
            debug!(progress_id, "resume: nothing left to do");
            return Ok(Resume::Noop(outcome));
        }

        let Some(cancel) = self.progress.reopen(progress_id) else {
            self.progress.store_run(progress_id, state);
            return Err(EngineError::RunInProgress(progress_id.to_string()));
        };
        info!(progress_id, post_id = state.post.id, "resuming translation run");
        let mut state = state;
        state.cancelled = false;
        Ok(Resume::Run(state, cancel))
    }

    fn new_run(&self, progress_id: &str, post: Post, languages: &[String]) -> RunState {
        self.progress
            .emit(progress_id, "decompose", StepStatus::Processing, "");
        let decomposition = decompose(&post);
        self.progress.emit(
            progress_id,
            "decompose",
            StepStatus::Completed,
            format!("{} units", decomposition.units.len()),
        );

        let source_language = self.resolve_source_language(&post);
        let languages = languages
            .iter()
            .map(|lang| {
                let run = LanguageRun {
                    skipped: *lang == source_language,
                    ..LanguageRun::default()
                };
                (lang.clone(), run)
            })
            .collect();

        RunState {
            post,
            source_language,
            decomposition,
            languages,
            cancelled: false,
        }
    }

    fn resolve_source_language(&self, post: &Post) -> String {
        let declared = post
            .language
            .as_deref()
            .or(self.source_language.as_deref())
            .map(|lang| lang.trim().to_lowercase())
            .filter(|lang| !lang.is_empty());
        declared
            .or_else(|| detect_language(&format!("{}\n{}", post.title, post.content)))
            .unwrap_or_else(|| FALLBACK_SOURCE_LANGUAGE.to_string())
    }

    /// Drive every unfinished language, then park the state for resume.
    async fn execute(
        &self,
        progress_id: &str,
        cancel: &CancellationToken,
        mut state: RunState,
    ) -> TranslationOutcome {
        let span = self.metrics.span(metric_names::POST_TRANSLATE);
        let post_id = state.post.id;
        info!(progress_id, post_id, languages = state.languages.len(), "translation run started");

        let RunState {
            post,
            source_language,
            decomposition,
            languages,
            cancelled,
        } = &mut state;
        let (post, decomposition, source_language) =
            (&*post, &*decomposition, source_language.as_str());

        for (lang, run) in languages.iter_mut() {
            if run.skipped {
                self.progress.emit(
                    progress_id,
                    format!("translate:{lang}"),
                    StepStatus::Completed,
                    "same as source language, skipped",
                );
                continue;
            }
            if run.is_done(decomposition) {
                continue;
            }
            let ctx = LanguageContext {
                progress_id,
                cancel,
                post,
                decomposition,
                source_language,
                lang,
            };
            if self.run_language(&ctx, run).await.is_err() {
                *cancelled = true;
                break;
            }
        }

        let outcome = state.outcome(progress_id);
        let status = outcome.status;
        self.progress.emit(
            progress_id,
            "done",
            step_status_for(status),
            format!("{status:?}").to_lowercase(),
        );
        self.progress.store_run(progress_id, state);
        self.progress.finish(progress_id, status);

        let elapsed_us = span.finish();
        info!(
            progress_id,
            post_id,
            status = ?status,
            elapsed_ms = (elapsed_us / 1000.0) as u64,
            "translation run finished"
        );
        outcome
    }

    /// Translate pending units for one language, then save. `Err` means the
    /// run was cancelled.
    async fn run_language(
        &self,
        ctx: &LanguageContext<'_>,
        run: &mut LanguageRun,
    ) -> Result<(), TranslateError> {
        let started = Instant::now();
        let pending: Vec<&Unit> = ctx
            .decomposition
            .units
            .iter()
            .filter(|u| !run.translated.contains_key(&u.key))
            .collect();
        debug!(lang = ctx.lang, pending = pending.len(), "translating language");

        let mut api_calls = 0u32;
        let mut cancelled = false;
        for unit in pending {
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let step = format!("translate:{}:{}", ctx.lang, unit.key);
            self.progress
                .emit(ctx.progress_id, step.as_str(), StepStatus::Processing, "");
            match self.translate_unit(ctx, unit, &mut api_calls).await {
                Ok(text) => {
                    run.failed.remove(&unit.key);
                    run.translated.insert(unit.key, text);
                    self.progress
                        .emit(ctx.progress_id, step, StepStatus::Completed, "");
                }
                Err(TranslateError::Cancelled) => {
                    self.progress
                        .emit(ctx.progress_id, step, StepStatus::Failed, "cancelled");
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        lang = ctx.lang,
                        unit = %unit.key,
                        error = %e,
                        "unit failed, keeping source text"
                    );
                    self.metrics.increment(metric_names::UNITS_FAILED, 1);
                    self.progress
                        .emit(ctx.progress_id, step, StepStatus::Failed, e.to_string());
                    run.failed.insert(unit.key, e.to_string());
                }
            }
        }
        run.api_calls += api_calls;
        if cancelled {
            return Err(TranslateError::Cancelled);
        }

        run.error = None;
        if let Err(e) = self.save_language(ctx, run) {
            error!(lang = ctx.lang, post_id = ctx.post.id, error = %e, "saving translation failed");
            run.error = Some(e.to_string());
        }

        let status = run.status();
        let (log_status, message) = match status {
            LanguageStatus::Completed => (LogStatus::Success, "translated".to_string()),
            LanguageStatus::Partial => (
                LogStatus::Partial,
                format!(
                    "{} of {} units kept source text",
                    run.failed.len(),
                    ctx.decomposition.units.len()
                ),
            ),
            _ => (
                LogStatus::Error,
                run.error
                    .clone()
                    .unwrap_or_else(|| format!("{} units failed", run.failed.len())),
            ),
        };
        self.log.record(
            LogEntry::new(ctx.post.id, LogAction::Translate, log_status, message)
                .language(ctx.lang)
                .cost(api_calls, started.elapsed()),
        );
        Ok(())
    }

    fn save_language(
        &self,
        ctx: &LanguageContext<'_>,
        run: &mut LanguageRun,
    ) -> Result<(), StoreError> {
        let save_step = format!("save:{}", ctx.lang);
        self.progress
            .emit(ctx.progress_id, save_step.as_str(), StepStatus::Processing, "");
        let complete = run.failed.is_empty();

        let mut translated = ctx.decomposition.reassemble(ctx.post, &run.translated);
        translated.language = Some(ctx.lang.to_string());

        let known = match run.translated_post_id {
            Some(id) => Some(id),
            None => self
                .relationships
                .get(ctx.post.id, ctx.lang)?
                .filter(|rel| rel.status != RelationshipStatus::TranslationDeleted)
                .map(|rel| rel.translated_post_id),
        };
        let existing = match known {
            Some(id) => self.posts.get_post(id)?,
            None => None,
        };

        let translated_post_id = match existing {
            Some(current) => {
                translated.status = if complete && current.status == "draft" {
                    self.publish_status.clone()
                } else {
                    current.status
                };
                self.posts.update_post(current.id, &translated)?;
                current.id
            }
            None => {
                translated.status = if complete {
                    self.publish_status.clone()
                } else {
                    "draft".to_string()
                };
                self.posts.insert_post(&translated)?
            }
        };
        run.translated_post_id = Some(translated_post_id);
        self.progress.emit(
            ctx.progress_id,
            save_step,
            StepStatus::Completed,
            format!("post {translated_post_id}"),
        );

        let rel_step = format!("relationship:{}", ctx.lang);
        let rel_status = if complete {
            RelationshipStatus::Completed
        } else {
            RelationshipStatus::Error
        };
        self.relationships.upsert(
            ctx.post.id,
            translated_post_id,
            ctx.source_language,
            ctx.lang,
            rel_status,
        )?;
        self.progress
            .emit(ctx.progress_id, rel_step, StepStatus::Completed, rel_status.as_str());
        Ok(())
    }

    /// One unit into one language, with cache, throttle and retries.
    async fn translate_unit(
        &self,
        ctx: &LanguageContext<'_>,
        unit: &Unit,
        api_calls: &mut u32,
    ) -> Result<String, TranslateError> {
        let span = self.metrics.span(metric_names::UNIT_TRANSLATE);
        let result = self.translate_unit_inner(ctx, unit, api_calls).await;
        span.finish();
        result
    }

    async fn translate_unit_inner(
        &self,
        ctx: &LanguageContext<'_>,
        unit: &Unit,
        api_calls: &mut u32,
    ) -> Result<String, TranslateError> {
        let protected = protect(&unit.text);
        let key = TranslationCache::compute_key(
            self.translator.model(),
            Some(ctx.source_language),
            ctx.lang,
            self.glossary.version(),
            &protected.text,
        );
        if let Some(hit) = self.cache.get(&key) {
            self.metrics.increment(metric_names::CACHE_HITS, 1);
            return protected.restore(&hit);
        }

        let request = TranslateRequest {
            text: protected.text.clone(),
            source_lang: Some(ctx.source_language.to_string()),
            target_lang: ctx.lang.to_string(),
            context: unit.key.describe(),
            glossary_entries: self.glossary.match_entries(&unit.text, ctx.lang),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let waited = self.throttle.acquire(ctx.cancel).await?;
            self.metrics
                .record(metric_names::THROTTLE_WAIT, waited.as_micros() as f64);

            *api_calls += 1;
            self.metrics.increment(metric_names::API_CALLS, 1);
            let call = self.metrics.span(metric_names::API_CALL);
            let result = tokio::select! {
                r = self.translator.translate(&request) => r,
                _ = ctx.cancel.cancelled() => Err(TranslateError::Cancelled),
            };
            call.finish();

            let err = match result {
                Ok(response) => {
                    self.metrics
                        .increment(metric_names::TOKENS_USED, u64::from(response.tokens_used));
                    match protected.restore(&response.translated_text) {
                        Ok(restored) => {
                            self.cache.insert(key, response.translated_text);
                            return Ok(restored);
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if matches!(err, TranslateError::Cancelled) {
                return Err(err);
            }
            self.metrics.increment(metric_names::API_ERRORS, 1);
            if !err.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt, err.retry_after());
            warn!(
                lang = ctx.lang,
                unit = %unit.key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "unit translation failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(TranslateError::Cancelled),
            }
        }
    }

    /// Hook for a permanently deleted post. Returns flagged relationships.
    pub fn on_post_deleted(&self, post_id: PostId) -> Result<usize, EngineError> {
        self.flag_relationships(post_id, LogAction::Delete)
    }

    /// Hook for a trashed post.
    pub fn on_post_trashed(&self, post_id: PostId) -> Result<usize, EngineError> {
        self.flag_relationships(post_id, LogAction::Trash)
    }

    fn flag_relationships(&self, post_id: PostId, action: LogAction) -> Result<usize, EngineError> {
        let changed = self.relationships.mark_source_deleted(post_id)?
            + self.relationships.mark_translation_deleted(post_id)?;
        self.log.record(LogEntry::new(
            post_id,
            action,
            LogStatus::Success,
            format!("{changed} relationships flagged"),
        ));
        Ok(changed)
    }

    /// Delete a post from the store and run the deletion hook.
    pub fn delete_post(&self, post_id: PostId) -> Result<usize, EngineError> {
        if !self.posts.delete_post(post_id)? {
            return Err(EngineError::PostNotFound(post_id));
        }
        self.on_post_deleted(post_id)
    }

    pub fn trash_post(&self, post_id: PostId) -> Result<usize, EngineError> {
        if !self.posts.trash_post(post_id)? {
            return Err(EngineError::PostNotFound(post_id));
        }
        self.on_post_trashed(post_id)
    }

    /// Remove the link between a source and its translation in `lang`.
    /// Both posts stay.
    pub fn unlink(&self, source_post_id: PostId, lang: &str) -> Result<bool, EngineError> {
        let lang = lang.trim().to_lowercase();
        let removed = self.relationships.unlink(source_post_id, &lang)?;
        if removed {
            let entry = LogEntry::new(
                source_post_id,
                LogAction::Unlink,
                LogStatus::Success,
                "relationship removed",
            );
            self.log.record(entry.language(lang));
        }
        Ok(removed)
    }
}

enum Resume {
    Noop(TranslationOutcome),
    Run(RunState, CancellationToken),
}

struct LanguageContext<'a> {
    progress_id: &'a str,
    cancel: &'a CancellationToken,
    post: &'a Post,
    decomposition: &'a Decomposition,
    source_language: &'a str,
    lang: &'a str,
}

fn step_status_for(status: RunStatus) -> StepStatus {
    match status {
        RunStatus::Completed => StepStatus::Completed,
        _ => StepStatus::Failed,
    }
}
