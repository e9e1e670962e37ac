//! Utility modules for devices and memory.

mod device;
mod memory;

pub use device::{Location, Residency, device_type, get_device, is_cpu, qualified_device};
pub use memory::{MemoryProbe, MemoryReading, clean_memory, format_bytes};
