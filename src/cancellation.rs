//! Warmup run control: CancellationToken + generation counter.
//! Starting a run cancels whatever run came before it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Issues one token per warmup run. Each `begin` advances the generation and cancels
/// every token handed out earlier.
pub struct WarmupRuns {
    current_token: RwLock<CancellationToken>,
    generation: AtomicU64,
}

impl WarmupRuns {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Cancel the previous run and return a child token for the new one.
    pub fn begin(&self) -> RunHandle {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let root = CancellationToken::new();
        let token = root.child_token();
        *token_guard = root;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RunHandle { token, generation }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cancel the current run without starting a new one.
    pub fn cancel_all(&self) {
        self.current_token.read().cancel();
    }

    pub fn is_current(&self, handle: &RunHandle) -> bool {
        self.current_generation() == handle.generation
    }
}

impl Default for WarmupRuns {
    fn default() -> Self {
        Self::new()
    }
}

/// Token and generation for one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    token: CancellationToken,
    generation: u64,
}

impl RunHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
