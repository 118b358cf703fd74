use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use voxcache::warmup::{CatalogSection, TaskOutcome, WarmupProgress};
use voxcache::{
    precompute, ClipCache, ManualClock, MemoryStorage, PromptCatalog, PromptSelection,
    QueuedScheduler, SynthesisDescriptor, SynthesisError, Synthesizer, WarmupOptions,
    WarmupRuns,
};

/// Replies from a script by call number (1-based); unscripted calls succeed.
#[derive(Default)]
struct ScriptedSynth {
    script: Vec<(usize, SynthesisError)>,
    calls: Mutex<Vec<String>>,
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl ScriptedSynth {
    fn failing(script: Vec<(usize, SynthesisError)>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynth {
    async fn synthesize(&self, descriptor: &SynthesisDescriptor) -> Result<Vec<u8>, SynthesisError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(descriptor.text.clone());
            calls.len()
        };
        if let Some((n, token)) = &self.cancel_on_call {
            if *n == call {
                token.cancel();
            }
        }
        match self.script.iter().find(|(n, _)| *n == call) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(descriptor.text.as_bytes().to_vec()),
        }
    }
}

struct HangingSynth;

#[async_trait]
impl Synthesizer for HangingSynth {
    async fn synthesize(&self, _: &SynthesisDescriptor) -> Result<Vec<u8>, SynthesisError> {
        std::future::pending().await
    }
}

async fn new_cache() -> ClipCache {
    ClipCache::builder(Arc::new(MemoryStorage::new()))
        .clock(Arc::new(ManualClock::new(0)))
        .scheduler(Arc::new(QueuedScheduler::new()))
        .build()
        .await
        .unwrap()
}

fn ten_prompts() -> PromptCatalog {
    let prompts: Vec<String> = (1..=10).map(|i| format!("Prompt number {i}")).collect();
    let refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    PromptCatalog::new(vec![CatalogSection::new("drill", "en-US", &refs)])
}

fn options() -> WarmupOptions {
    WarmupOptions::new("en-US").with_template(SynthesisDescriptor::default().with_voice("nova"))
}

#[tokio::test]
async fn rate_limit_aborts_remaining_run() {
    let cache = new_cache().await;
    let synth = ScriptedSynth::failing(vec![(3, SynthesisError::RateLimited { retry_after_ms: 1_000 })]);

    let report = precompute(&cache, &synth, &PromptSelection::all(), &ten_prompts(), &options(), |_| {}).await;

    assert_eq!(report.total, 10);
    assert_eq!(report.processed, 2);
    assert!(report.rate_limited);
    assert!(report.aborted);
    assert_eq!(synth.calls().len(), 3);
    assert_eq!(cache.list_metadata().await.unwrap().len(), 2);
}

#[tokio::test]
async fn unavailable_skips_and_other_errors_count() {
    let cache = new_cache().await;
    let synth = ScriptedSynth::failing(vec![
        (2, SynthesisError::Unavailable),
        (5, SynthesisError::Failed("bad voice".into())),
        (6, SynthesisError::Unavailable),
    ]);

    let mut progress: Vec<WarmupProgress> = Vec::new();
    let report = precompute(&cache, &synth, &PromptSelection::all(), &ten_prompts(), &options(), |p| {
        progress.push(p)
    })
    .await;

    assert_eq!(report.processed, 7);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.errors, 1);
    assert!(!report.aborted);
    assert!(!report.rate_limited);
    assert_eq!(progress.len(), 10);
    assert_eq!(progress[1].outcome, TaskOutcome::Skipped);
    assert_eq!(progress[4].outcome, TaskOutcome::Failed);
    assert_eq!(progress[9].completed, 10);
}

#[tokio::test]
async fn cached_prompts_skip_the_synthesizer() {
    let cache = new_cache().await;
    let template = options().template;
    cache
        .put(&template.clone().with_text("Prompt number 1").with_lang("en-US"), vec![1])
        .await
        .unwrap();

    let synth = ScriptedSynth::default();
    let report = precompute(&cache, &synth, &PromptSelection::all(), &ten_prompts(), &options(), |_| {}).await;
    assert_eq!(report.processed, 10);
    assert_eq!(synth.calls().len(), 9);
    assert!(!synth.calls().contains(&"Prompt number 1".to_string()));

    // A second run finds everything cached.
    let again = precompute(&cache, &synth, &PromptSelection::all(), &ten_prompts(), &options(), |_| {}).await;
    assert_eq!(again.processed, 10);
    assert_eq!(synth.calls().len(), 9);
}

#[tokio::test]
async fn cancellation_is_checked_before_each_task() {
    let cache = new_cache().await;
    let token = CancellationToken::new();
    let synth = ScriptedSynth {
        cancel_on_call: Some((2, token.clone())),
        ..ScriptedSynth::default()
    };

    let opts = options().with_cancel(token);
    let report = precompute(&cache, &synth, &PromptSelection::all(), &ten_prompts(), &opts, |_| {}).await;

    assert!(report.aborted);
    assert!(!report.rate_limited);
    assert_eq!(report.processed, 2);
    assert_eq!(synth.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_in_flight_call() {
    let cache = new_cache().await;
    let runs = WarmupRuns::new();
    let run = runs.begin();
    let opts = options().with_cancel(run.token().clone());

    let canceller = tokio::spawn({
        let token = run.token().clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        }
    });
    let report = precompute(&cache, &HangingSynth, &PromptSelection::all(), &ten_prompts(), &opts, |_| {}).await;
    canceller.await.unwrap();

    assert!(report.aborted);
    assert_eq!((report.processed, report.errors), (0, 0));
}

#[tokio::test]
async fn new_run_cancels_previous() {
    let cache = new_cache().await;
    let runs = WarmupRuns::new();
    let stale = runs.begin();
    let _current = runs.begin();

    let synth = ScriptedSynth::default();
    let opts = options().with_cancel(stale.token().clone());
    let report = precompute(&cache, &synth, &PromptSelection::all(), &ten_prompts(), &opts, |_| {}).await;
    assert!(report.aborted);
    assert_eq!(report.processed, 0);
    assert!(synth.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn min_interval_paces_calls() {
    let cache = new_cache().await;
    let synth = ScriptedSynth::default();
    let opts = options().with_min_interval(Duration::from_millis(100));
    let catalog = PromptCatalog::new(vec![CatalogSection::new("drill", "en", &["One", "Two", "Three"])]);

    let start = tokio::time::Instant::now();
    let report = precompute(&cache, &synth, &PromptSelection::all(), &catalog, &opts, |_| {}).await;
    assert_eq!(report.processed, 3);
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn excluded_phrases_and_foreign_prompts_are_not_warmed() {
    let cache = new_cache().await;
    let catalog = PromptCatalog::new(vec![
        CatalogSection::new("ui", "en", &["Tap to start", "Next", "Ready?"]),
        CatalogSection::new("ui", "de", &["Weiter"]),
        CatalogSection::counting("counting", "es", 1, 3),
    ]);
    let synth = ScriptedSynth::default();

    let report = precompute(&cache, &synth, &PromptSelection::all(), &catalog, &options(), |_| {}).await;
    assert_eq!(report.total, 1);
    assert_eq!(synth.calls(), vec!["Ready?".to_string()]);

    let with_fallback = options().with_fallback("es");
    let report = precompute(&cache, &synth, &PromptSelection::all(), &catalog, &with_fallback, |_| {}).await;
    // "Ready?" is already cached; counting falls back to Spanish numerals.
    assert_eq!(report.total, 4);
    assert_eq!(report.processed, 4);
    assert_eq!(synth.calls().len(), 4);
}

#[tokio::test]
async fn expired_clips_are_synthesized_again() {
    let clock = Arc::new(ManualClock::new(0));
    let cache = ClipCache::builder(Arc::new(MemoryStorage::new()))
        .clock(clock.clone())
        .scheduler(Arc::new(QueuedScheduler::new()))
        .build()
        .await
        .unwrap();
    let catalog = PromptCatalog::new(vec![CatalogSection::new("drill", "en", &["One"])]);
    let synth = ScriptedSynth::default();

    precompute(&cache, &synth, &PromptSelection::all(), &catalog, &options(), |_| {}).await;
    assert_eq!(synth.calls().len(), 1);

    clock.advance_ms(cache.limits().ttl_ms() + 1);
    let mut outcomes = Vec::new();
    let report = precompute(&cache, &synth, &PromptSelection::all(), &catalog, &options(), |p| {
        outcomes.push(p.outcome)
    })
    .await;

    assert_eq!(report.processed, 1);
    assert_eq!(outcomes, vec![TaskOutcome::Synthesized]);
    assert_eq!(synth.calls().len(), 2);
    let descriptor = options().template.with_text("One").with_lang("en-US");
    assert!(cache.lookup(&descriptor).await.is_some());
}
