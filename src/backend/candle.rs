//! Backend moving real candle tensors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use super::{Backend, MemoryLedger};
use crate::pipeline::{Parameter, Storage};
use crate::utils::{Location, clean_memory, device_type};

/// Moves tensors between a candle accelerator device and the CPU.
pub struct CandleBackend {
    device: Device,
    cpu: Device,
    index: usize,
    accelerator_total: u64,
    host: Mutex<System>,
    ledger: MemoryLedger,
}

impl CandleBackend {
    /// Create a backend for `device`.
    ///
    /// `accelerator_total` overrides the device capacity; it is required when
    /// the device cannot report its own memory.
    pub fn new(device: Device, index: usize, accelerator_total: Option<u64>) -> crate::Result<Self> {
        let accelerator_total = match accelerator_total {
            Some(total) => total,
            None => device_memory(&device).map(|(_, total)| total).ok_or_else(|| {
                crate::OffloadError::Config(format!(
                    "accelerator memory of {} device is unknown, set accelerator_memory_bytes",
                    device_type(&device)
                ))
            })?,
        };

        let host = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );

        tracing::info!(
            "Offload backend: device={}:{} accelerator={}",
            device_type(&device),
            index,
            crate::utils::format_bytes(accelerator_total)
        );

        Ok(Self {
            device,
            cpu: Device::Cpu,
            index,
            accelerator_total,
            host: Mutex::new(host),
            ledger: MemoryLedger::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn device_for(&self, location: Location) -> &Device {
        match location {
            Location::Accelerator => &self.device,
            Location::Host | Location::Disk => &self.cpu,
        }
    }

    fn spill(&self, path: &str, parameter: &Parameter, tensor: &Tensor, dir: &Path) -> crate::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(format!("{}.safetensors", path));
        let tensors = HashMap::from([(parameter.name().to_string(), tensor.to_device(&self.cpu)?)]);
        candle_core::safetensors::save(&tensors, &file)?;
        tracing::trace!("Offload: spilled {} to {:?}", path, file);
        Ok(file)
    }

    fn restore(&self, path: &str, parameter: &Parameter, file: &Path, to: Location) -> crate::Result<Tensor> {
        let mut tensors = candle_core::safetensors::load(file, self.device_for(to))?;
        let tensor = tensors.remove(parameter.name()).ok_or_else(|| crate::OffloadError::Transfer {
            param: path.to_string(),
            reason: format!("spill file {:?} does not contain the tensor", file),
        })?;
        if let Err(e) = std::fs::remove_file(file) {
            tracing::debug!("Offload: could not remove spill file {:?}: {}", file, e);
        }
        Ok(tensor)
    }
}

impl Backend for CandleBackend {
    fn name(&self) -> &str {
        device_type(&self.device)
    }

    fn accelerator_index(&self) -> usize {
        self.index
    }

    fn synchronize(&self) -> crate::Result<()> {
        self.device.synchronize()?;
        Ok(())
    }

    fn collect(&self, full: bool) {
        // Dropped candle tensors are freed immediately; only the host heap
        // keeps pages around.
        if full {
            clean_memory();
        }
    }

    fn accelerator_used(&self) -> u64 {
        match device_memory(&self.device) {
            Some((free, total)) => total.saturating_sub(free),
            None => self.ledger.bytes(Location::Accelerator),
        }
    }

    fn accelerator_total(&self) -> u64 {
        self.accelerator_total
    }

    fn host_used(&self) -> u64 {
        let mut host = self.host.lock();
        host.refresh_memory();
        host.used_memory()
    }

    fn host_total(&self) -> u64 {
        self.host.lock().total_memory()
    }

    fn transfer(
        &self,
        path: &str,
        parameter: &mut Parameter,
        to: Location,
        bytes: u64,
        spill_dir: Option<&Path>,
    ) -> crate::Result<()> {
        let from = parameter.location();
        if from == to {
            return Ok(());
        }

        let storage = match (parameter.storage(), to) {
            (Storage::Meta, _) => None,
            (Storage::Tensor(tensor), Location::Disk) => {
                let dir = spill_dir.ok_or_else(|| crate::OffloadError::Transfer {
                    param: path.to_string(),
                    reason: "no scratch directory for disk spill".to_string(),
                })?;
                Some(Storage::Spilled(self.spill(path, parameter, tensor, dir)?))
            }
            (Storage::Tensor(tensor), _) => Some(Storage::Tensor(tensor.to_device(self.device_for(to))?)),
            (Storage::Spilled(_), Location::Disk) => None,
            (Storage::Spilled(file), _) => {
                let file = file.clone();
                Some(Storage::Tensor(self.restore(path, parameter, &file, to)?))
            }
        };

        self.ledger.record_move(from, to, bytes);
        parameter.relocate(to, storage);
        Ok(())
    }
}

/// Free and total accelerator memory as reported by the driver
#[cfg(feature = "cuda")]
fn device_memory(device: &Device) -> Option<(u64, u64)> {
    if !matches!(device, Device::Cuda(_)) {
        return None;
    }
    match candle_core::cuda_backend::cudarc::driver::result::mem_get_info() {
        Ok((free, total)) => Some((free as u64, total as u64)),
        Err(e) => {
            tracing::debug!("Offload: CUDA memory query failed: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn device_memory(_device: &Device) -> Option<(u64, u64)> {
    None
}
