//! Memory measurement and reclamation.

use std::sync::Arc;

use crate::backend::Backend;

/// Occupancy snapshot of both memory domains (bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReading {
    pub accelerator_used: u64,
    pub accelerator_total: u64,
    pub host_used: u64,
    pub host_total: u64,
}

impl MemoryReading {
    /// Accelerator occupancy as a fraction of capacity
    pub fn accelerator_fraction(&self) -> f64 {
        if self.accelerator_total == 0 {
            return 0.0;
        }
        self.accelerator_used as f64 / self.accelerator_total as f64
    }
}

/// Reads occupancy counters after draining outstanding device work.
///
/// Every reading is preceded by a synchronization point; otherwise the
/// counters race with in-flight transfers and compute.
#[derive(Clone)]
pub struct MemoryProbe {
    backend: Arc<dyn Backend>,
}

impl MemoryProbe {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Synchronize, collect, then read the counters.
    ///
    /// `fast` skips the full collection pass; it is what the hooks use on
    /// every invocation.
    pub fn measure(&self, fast: bool) -> MemoryReading {
        if let Err(e) = self.backend.synchronize() {
            tracing::warn!("Offload: synchronize before measure failed: {}", e);
        }
        self.backend.collect(!fast);
        self.read()
    }

    /// Full collection plus allocator trim, used after allocation failures.
    pub fn force_reclaim(&self, reason: &str) -> MemoryReading {
        if let Err(e) = self.backend.synchronize() {
            tracing::warn!("Offload: synchronize before reclaim failed: {}", e);
        }
        self.backend.collect(true);
        clean_memory();
        let reading = self.read();
        tracing::debug!(
            "Offload: reclaim reason={} accelerator={} host={}",
            reason,
            format_bytes(reading.accelerator_used),
            format_bytes(reading.host_used)
        );
        reading
    }

    fn read(&self) -> MemoryReading {
        MemoryReading {
            accelerator_used: self.backend.accelerator_used(),
            accelerator_total: self.backend.accelerator_total(),
            host_used: self.backend.host_used(),
            host_total: self.backend.host_total(),
        }
    }
}

impl std::fmt::Debug for MemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProbe")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Return freed heap pages to the OS.
pub fn clean_memory() {
    #[cfg(target_os = "linux")]
    {
        unsafe extern "C" {
            fn malloc_trim(pad: usize) -> i32;
        }
        unsafe {
            malloc_trim(0);
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_measure_synchronizes_first() {
        let backend = Arc::new(SimulatedBackend::new(1 << 30, 4 << 30));
        let probe = MemoryProbe::new(backend.clone());

        let reading = probe.measure(true);
        assert_eq!(backend.sync_count(), 1);
        assert_eq!(backend.full_collect_count(), 0);
        assert_eq!(reading.accelerator_total, 1 << 30);

        probe.measure(false);
        assert_eq!(backend.sync_count(), 2);
        assert_eq!(backend.full_collect_count(), 1);
    }

    #[test]
    fn test_force_reclaim_runs_full_collection() {
        let backend = Arc::new(SimulatedBackend::new(1 << 30, 4 << 30));
        let probe = MemoryProbe::new(backend.clone());
        probe.force_reclaim("test");
        assert_eq!(backend.full_collect_count(), 1);
    }

    #[test]
    fn test_fraction_of_empty_device() {
        assert_eq!(MemoryReading::default().accelerator_fraction(), 0.0);
    }
}
