//! Balanced offload: sizing, device maps, placement/eviction and orchestration.
//!
//! This module provides:
//! - `SizeCache`: memoized submodule sizes over an injectable format table
//! - `DeviceMapBuilder`: splits oversized submodules across accelerator, host and disk
//! - `OffloadManager` + `BalancedOffloadHook`: placement before and eviction after each invocation
//! - `FailurePolicy`: containment of allocation failures inside the hooks
//! - `OffloadSession`: applies the configured mode to whole pipelines

mod device_map;
mod failure;
mod manager;
mod session;
mod size_cache;

pub use device_map::{DeviceMap, DeviceMapBuilder, MapTarget, MemoryBounds};
pub use failure::{FailureKind, FailurePolicy};
pub use manager::{BalancedOffloadHook, OffloadManager};
pub use session::{ApplyOutcome, ApplyReport, OffloadSession, SkipReason};
pub use size_cache::{FormatTable, NumericFormat, SizeCache, SizeEntry};
