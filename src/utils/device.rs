//! Device selection and residency types.

use candle_core::Device;

/// Memory domain a single parameter lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Fast, capacity-limited accelerator memory
    Accelerator,
    /// Host memory
    Host,
    /// Spilled to the scratch directory
    Disk,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Location::Accelerator => "accelerator",
            Location::Host => "host",
            Location::Disk => "disk",
        };
        f.write_str(name)
    }
}

/// Residency of a whole submodule, derived from its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Every parameter is on the accelerator
    Accelerator,
    /// No parameter is on the accelerator
    Host,
    /// Parameters spread over accelerator and host/disk by a device map
    Split,
}

impl Residency {
    /// Derive residency from the locations of all parameters
    pub fn from_locations(locations: impl IntoIterator<Item = Location>) -> Self {
        let mut on_accelerator = false;
        let mut off_accelerator = false;
        for location in locations {
            match location {
                Location::Accelerator => on_accelerator = true,
                Location::Host | Location::Disk => off_accelerator = true,
            }
        }
        match (on_accelerator, off_accelerator) {
            (true, false) => Residency::Accelerator,
            (true, true) => Residency::Split,
            _ => Residency::Host,
        }
    }
}

/// Get the best available device (CUDA > Metal > CPU)
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    #[cfg(feature = "cuda")]
    {
        let id = device_id.unwrap_or(0);
        match Device::new_cuda(id) {
            Ok(device) => {
                tracing::info!("Using CUDA device {}", id);
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("CUDA not available: {}", e);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(device_id.unwrap_or(0)) {
            Ok(device) => {
                tracing::info!("Using Metal device");
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("Metal not available: {}", e);
            }
        }
    }

    let _ = device_id;
    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Short backend name of a candle device
pub fn device_type(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Fully-qualified device string, e.g. `cuda:0` or `privateuseone:1`
pub fn qualified_device(device_type: &str, index: usize) -> String {
    format!("{}:{}", device_type, index)
}

/// Check if a device is CPU
pub fn is_cpu(device: &Device) -> bool {
    matches!(device, Device::Cpu)
}
