//! Accelerator backends: memory counters, synchronization and transfers.
//!
//! This module provides:
//! - `Backend`: the device-level contract the offload manager consumes
//! - `CandleBackend`: real tensors moved with candle
//! - `SimulatedBackend`: a capacity-limited accelerator without real memory

mod candle;
mod simulated;

pub use self::candle::CandleBackend;
pub use simulated::SimulatedBackend;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::Parameter;
use crate::utils::Location;

/// Device-level operations used by the offload manager.
pub trait Backend: Send + Sync {
    /// Short device type, e.g. `cuda`
    fn name(&self) -> &str;

    /// Index of the accelerator in use
    fn accelerator_index(&self) -> usize {
        0
    }

    /// Whether device maps may address the accelerator by bare index
    fn plain_device_indices(&self) -> bool {
        true
    }

    /// Wait for outstanding transfers and compute to retire
    fn synchronize(&self) -> crate::Result<()>;

    /// Release cached-but-free memory; `full` also runs the expensive pass
    fn collect(&self, full: bool);

    fn accelerator_used(&self) -> u64;

    fn accelerator_total(&self) -> u64;

    fn host_used(&self) -> u64;

    fn host_total(&self) -> u64;

    /// Move one parameter to `to`.
    ///
    /// `path` is the parameter's dotted path inside its submodule and
    /// `bytes` its footprint; `spill_dir` is required for moves to disk.
    fn transfer(
        &self,
        path: &str,
        parameter: &mut Parameter,
        to: Location,
        bytes: u64,
        spill_dir: Option<&Path>,
    ) -> crate::Result<()>;
}

/// Byte counters per memory domain for backends without native counters.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accelerator: AtomicU64,
    host: AtomicU64,
    disk: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, location: Location) -> &AtomicU64 {
        match location {
            Location::Accelerator => &self.accelerator,
            Location::Host => &self.host,
            Location::Disk => &self.disk,
        }
    }

    /// Bytes currently accounted to a domain
    pub fn bytes(&self, location: Location) -> u64 {
        self.counter(location).load(Ordering::SeqCst)
    }

    pub fn add(&self, location: Location, bytes: u64) {
        self.counter(location).fetch_add(bytes, Ordering::SeqCst);
    }

    /// Subtract, saturating at zero
    pub fn remove(&self, location: Location, bytes: u64) {
        let _ = self
            .counter(location)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
    }

    pub fn record_move(&self, from: Location, to: Location, bytes: u64) {
        if from == to {
            return;
        }
        self.remove(from, bytes);
        self.add(to, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_moves() {
        let ledger = MemoryLedger::new();
        ledger.add(Location::Host, 100);
        ledger.record_move(Location::Host, Location::Accelerator, 60);
        assert_eq!(ledger.bytes(Location::Host), 40);
        assert_eq!(ledger.bytes(Location::Accelerator), 60);

        ledger.record_move(Location::Accelerator, Location::Disk, 100);
        assert_eq!(ledger.bytes(Location::Accelerator), 0);
        assert_eq!(ledger.bytes(Location::Disk), 100);
    }
}
