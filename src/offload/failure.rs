//! Classification and containment of placement/eviction failures.

use crate::utils::MemoryProbe;

/// How a failed placement or eviction is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Allocation failed; reclaim memory and let the next invocation retry
    OutOfMemory,
    /// Known harmless allocator quirk; ignored
    Benign,
    /// Anything else; logged with the submodule name
    Unclassified,
}

/// Message-pattern classifier for errors raised inside the hooks.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    benign_patterns: Vec<String>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new(vec!["bitsandbytes".to_string()])
    }
}

impl FailurePolicy {
    pub fn new(benign_patterns: Vec<String>) -> Self {
        Self {
            benign_patterns: benign_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn classify(&self, error: &crate::OffloadError) -> FailureKind {
        let message = error.to_string().to_lowercase();
        if message.contains("out of memory") {
            FailureKind::OutOfMemory
        } else if self.benign_patterns.iter().any(|p| message.contains(p.as_str())) {
            FailureKind::Benign
        } else {
            FailureKind::Unclassified
        }
    }

    /// Contain a failure: reclaim, ignore or log. Never propagates.
    pub fn handle(
        &self,
        error: &crate::OffloadError,
        op: &str,
        module: &str,
        probe: &MemoryProbe,
    ) -> FailureKind {
        let kind = self.classify(error);
        match kind {
            FailureKind::OutOfMemory => {
                tracing::warn!("Offload: type=balanced op={} module={} out of memory", op, module);
                probe.force_reclaim("oom");
            }
            FailureKind::Benign => {
                tracing::trace!("Offload: type=balanced op={} module={} ignored: {}", op, module, error);
            }
            FailureKind::Unclassified => {
                tracing::error!("Offload: type=balanced op={} module={} {}", op, module, error);
            }
        }
        kind
    }
}
