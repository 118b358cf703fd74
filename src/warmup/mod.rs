//! Warmup: precompute clips for a prompt catalog ahead of need.
//! Tasks run strictly one at a time, each preceded by an idle yield.

pub mod catalog;

pub use catalog::{
    lang_matches, CatalogError, CatalogSection, PromptCatalog, PromptSelection, WarmupTask,
    EXCLUDED_PHRASES,
};

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::ClipCache;
use crate::descriptor::{SynthesisDescriptor, DEFAULT_LANG};
use crate::key::derive_key;
use crate::metrics::metric_names;
use crate::synth::{Pacer, SynthesisError, Synthesizer};

/// How a warmup run is performed.
#[derive(Debug, Clone)]
pub struct WarmupOptions {
    pub lang: String,
    /// Used for a kind only when `lang` has no prompts of that kind.
    pub fallback_lang: Option<String>,
    /// Voice, model, format and other fields applied to every task.
    pub template: SynthesisDescriptor,
    pub cancel: CancellationToken,
    /// Minimum spacing between synthesizer calls.
    pub min_interval: Duration,
}

impl Default for WarmupOptions {
    fn default() -> Self {
        Self {
            lang: DEFAULT_LANG.to_string(),
            fallback_lang: None,
            template: SynthesisDescriptor::default(),
            cancel: CancellationToken::new(),
            min_interval: Duration::ZERO,
        }
    }
}

impl WarmupOptions {
    pub fn new(lang: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, lang: impl Into<String>) -> Self {
        self.fallback_lang = Some(lang.into());
        self
    }

    pub fn with_template(mut self, template: SynthesisDescriptor) -> Self {
        self.template = template;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub aborted: bool,
    pub rate_limited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Already in the cache; the synthesizer was not called.
    Cached,
    Synthesized,
    Skipped,
    Failed,
}

/// Emitted after every task that ran to an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupProgress {
    pub completed: usize,
    pub total: usize,
    pub text: String,
    pub outcome: TaskOutcome,
}

/// Expand `selection` against `catalog` and synthesize every prompt not yet cached.
///
/// "Unavailable" counts as skipped and the run continues; "rate limited" stops the
/// run with `rate_limited` and `aborted` set; any other failure counts as an error.
/// Cancellation is checked before each task and also interrupts an in-flight call.
pub async fn precompute<F>(
    cache: &ClipCache,
    synthesizer: &dyn Synthesizer,
    selection: &PromptSelection,
    catalog: &PromptCatalog,
    options: &WarmupOptions,
    progress: F,
) -> WarmupReport
where
    F: FnMut(WarmupProgress),
{
    let run_id = Uuid::new_v4();
    let span = info_span!("warmup", %run_id, lang = %options.lang);
    run(cache, synthesizer, selection, catalog, options, progress)
        .instrument(span)
        .await
}

async fn run<F>(
    cache: &ClipCache,
    synthesizer: &dyn Synthesizer,
    selection: &PromptSelection,
    catalog: &PromptCatalog,
    options: &WarmupOptions,
    mut progress: F,
) -> WarmupReport
where
    F: FnMut(WarmupProgress),
{
    let tasks = catalog.expand(selection, &options.lang, options.fallback_lang.as_deref());
    let mut report = WarmupReport {
        total: tasks.len(),
        ..WarmupReport::default()
    };
    let pacer = Pacer::new(options.min_interval);
    let scheduler = cache.idle_scheduler();
    info!(total = report.total, "warmup started");

    for (index, task) in tasks.iter().enumerate() {
        scheduler.yield_now().await;
        if options.cancel.is_cancelled() {
            report.aborted = true;
            break;
        }

        let descriptor = options
            .template
            .clone()
            .with_text(task.text.as_str())
            .with_lang(task.lang.as_str());

        let outcome = if cache.has(&derive_key(&descriptor)).await {
            TaskOutcome::Cached
        } else {
            let span = cache.metrics().span(metric_names::WARMUP_TASK);
            let result = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => Err(SynthesisError::Cancelled),
                result = async {
                    pacer.wait().await;
                    synthesizer.synthesize(&descriptor).await
                } => result,
            };
            span.finish();

            match result {
                Ok(payload) => match cache.put(&descriptor, payload).await {
                    Ok(_) => TaskOutcome::Synthesized,
                    Err(e) => {
                        warn!(error = %e, text = %task.text, "storing warmup clip failed");
                        TaskOutcome::Failed
                    }
                },
                Err(SynthesisError::Unavailable) => TaskOutcome::Skipped,
                Err(SynthesisError::RateLimited { retry_after_ms }) => {
                    warn!(retry_after_ms, completed = index, "warmup rate limited, aborting run");
                    report.rate_limited = true;
                    report.aborted = true;
                    break;
                }
                Err(SynthesisError::Cancelled) => {
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, text = %task.text, "warmup synthesis failed");
                    TaskOutcome::Failed
                }
            }
        };

        match outcome {
            TaskOutcome::Cached | TaskOutcome::Synthesized => report.processed += 1,
            TaskOutcome::Skipped => report.skipped += 1,
            TaskOutcome::Failed => report.errors += 1,
        }
        debug!(text = %task.text, kind = %task.kind, ?outcome, "warmup task done");
        progress(WarmupProgress {
            completed: index + 1,
            total: report.total,
            text: task.text.clone(),
            outcome,
        });
    }

    info!(
        processed = report.processed,
        skipped = report.skipped,
        errors = report.errors,
        aborted = report.aborted,
        rate_limited = report.rate_limited,
        "warmup finished"
    );
    report
}
