//! Capacity-limited accelerator that only keeps books.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Backend, MemoryLedger};
use crate::pipeline::Parameter;
use crate::utils::{Location, format_bytes};

/// Simulated accelerator for planning, the CLI `simulate` command and tests.
///
/// Transfers only update parameter locations and the ledger. Moving past
/// accelerator capacity fails with an out-of-memory allocation error.
#[derive(Debug)]
pub struct SimulatedBackend {
    accelerator_total: u64,
    host_total: u64,
    device_type: String,
    plain_indices: bool,
    ledger: MemoryLedger,
    pending_failure: Mutex<Option<String>>,
    syncs: AtomicUsize,
    full_collects: AtomicUsize,
    transfers: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new(accelerator_total: u64, host_total: u64) -> Self {
        Self {
            accelerator_total,
            host_total,
            device_type: "cuda".to_string(),
            plain_indices: true,
            ledger: MemoryLedger::new(),
            pending_failure: Mutex::new(None),
            syncs: AtomicUsize::new(0),
            full_collects: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
        }
    }

    /// Pretend to be a backend with the given device type
    pub fn with_device_type(mut self, device_type: impl Into<String>, plain_indices: bool) -> Self {
        self.device_type = device_type.into();
        self.plain_indices = plain_indices;
        self
    }

    /// Make the next transfer fail with `message`
    pub fn fail_next_transfer(&self, message: impl Into<String>) {
        *self.pending_failure.lock() = Some(message.into());
    }

    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn full_collect_count(&self) -> usize {
        self.full_collects.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }
}

impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        &self.device_type
    }

    fn plain_device_indices(&self) -> bool {
        self.plain_indices
    }

    fn synchronize(&self) -> crate::Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn collect(&self, full: bool) {
        if full {
            self.full_collects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn accelerator_used(&self) -> u64 {
        self.ledger.bytes(Location::Accelerator)
    }

    fn accelerator_total(&self) -> u64 {
        self.accelerator_total
    }

    fn host_used(&self) -> u64 {
        self.ledger.bytes(Location::Host)
    }

    fn host_total(&self) -> u64 {
        self.host_total
    }

    fn transfer(
        &self,
        path: &str,
        parameter: &mut Parameter,
        to: Location,
        bytes: u64,
        _spill_dir: Option<&Path>,
    ) -> crate::Result<()> {
        let from = parameter.location();
        if from == to {
            return Ok(());
        }
        if let Some(message) = self.pending_failure.lock().take() {
            return Err(crate::OffloadError::Transfer {
                param: path.to_string(),
                reason: message,
            });
        }
        if to == Location::Accelerator {
            let used = self.ledger.bytes(Location::Accelerator);
            if used + bytes > self.accelerator_total {
                return Err(crate::OffloadError::Allocation(format!(
                    "out of memory: tried to allocate {} for {} with {} free",
                    format_bytes(bytes),
                    path,
                    format_bytes(self.accelerator_total.saturating_sub(used))
                )));
            }
        }

        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.ledger.record_move(from, to, bytes);
        parameter.relocate(to, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::NumericFormat;

    fn param(bytes: usize) -> Parameter {
        Parameter::meta("w", vec![bytes], NumericFormat::Dtype(candle_core::DType::U8))
    }

    #[test]
    fn test_transfer_updates_ledger() {
        let backend = SimulatedBackend::new(100, 1000);
        let mut p = param(60);
        backend.transfer("w", &mut p, Location::Accelerator, 60, None).unwrap();
        assert_eq!(p.location(), Location::Accelerator);
        assert_eq!(backend.accelerator_used(), 60);

        backend.transfer("w", &mut p, Location::Host, 60, None).unwrap();
        assert_eq!(backend.accelerator_used(), 0);
        assert_eq!(backend.transfer_count(), 2);
    }

    #[test]
    fn test_over_capacity_is_out_of_memory() {
        let backend = SimulatedBackend::new(100, 1000);
        let mut p = param(160);
        let err = backend.transfer("w", &mut p, Location::Accelerator, 160, None).unwrap_err();
        assert!(err.to_string().contains("out of memory"));
        assert_eq!(p.location(), Location::Host);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let backend = SimulatedBackend::new(100, 1000);
        backend.fail_next_transfer("bitsandbytes: unsupported device");
        let mut p = param(10);
        assert!(backend.transfer("w", &mut p, Location::Accelerator, 10, None).is_err());
        assert!(backend.transfer("w", &mut p, Location::Accelerator, 10, None).is_ok());
    }
}
