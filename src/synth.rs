//! Speech synthesis boundary. The provider is external; the cache never retries it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::descriptor::SynthesisDescriptor;

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, descriptor: &SynthesisDescriptor) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("synthesis service unavailable")]
    Unavailable,
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("synthesis failed: {0}")]
    Failed(String),
    #[error("synthesis cancelled")]
    Cancelled,
}

/// Spaces out calls so that at most one starts per `min_interval`.
pub struct Pacer {
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval,
        }
    }

    /// Wait until the next call is allowed.
    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_calls() {
        let pacer = Pacer::new(Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
