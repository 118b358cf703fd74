//! voxcache: content-addressed cache for synthesized speech clips.
//! Store, summary, eviction, archive export/import and a warmup runner that fills the
//! cache ahead of need.

pub mod archive;
pub mod cache;
pub mod cancellation;
pub mod clock;
pub mod descriptor;
pub mod error;
pub mod eviction;
pub mod idle;
pub mod key;
pub mod limits;
pub mod metrics;
pub mod store;
pub mod summary;
pub mod synth;
pub mod warmup;

pub use archive::{
    export_archive, import_archive, import_archive_with_limits, ArchiveError, ArchiveLimits,
    ExportReport, ImportReport,
};
pub use cache::{CacheBuilder, ClipCache};
pub use cancellation::{RunHandle, WarmupRuns};
pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::{AudioFormat, DescriptorMeta, SynthesisDescriptor};
pub use error::CacheError;
pub use eviction::PruneReport;
pub use idle::{BackgroundScheduler, IdleScheduler, ImmediateScheduler, QueuedScheduler};
pub use key::{derive_key, CacheKey};
pub use limits::{CacheConfig, CacheLimits, CacheLimitsOverrides};
pub use metrics::MetricsRegistry;
pub use store::{ClipMeta, ClipRecord, ClipStorage, MemoryStorage, NullStorage, SqliteStorage};
pub use summary::CacheSummary;
pub use synth::{SynthesisError, Synthesizer};
pub use warmup::{precompute, PromptCatalog, PromptSelection, WarmupOptions, WarmupReport};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `voxcache=info`. Does nothing if a subscriber is already set.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxcache=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
