//! Configuration module for offload settings.

mod offload_config;

pub use offload_config::{OffloadConfig, OffloadMode, Watermarks};
