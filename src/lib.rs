//! # rs-offload
//!
//! Balanced offloading for generative pipelines whose combined weights do not
//! fit in accelerator memory.
//!
//! ## Core Concept
//!
//! A pipeline is a set of large submodules (text encoders, a diffusion
//! backbone, a decoder). Only the submodule that is running needs to live on
//! the accelerator. The balanced offload manager:
//! - **Places** a submodule on the accelerator right before it runs, splitting
//!   it across accelerator and host with a device map when it is too large
//! - **Evicts** submodules back to host memory after a run once accelerator
//!   occupancy passes the low watermark
//! - **Contains failures**: out-of-memory and allocator errors inside the hooks
//!   degrade placement instead of aborting the pipeline
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rs_offload::{ModelPipeline, OffloadConfig, OffloadMode, OffloadSession, SimulatedBackend, Submodule};
//!
//! let backend = Arc::new(SimulatedBackend::new(24 << 30, 64 << 30));
//! let config = OffloadConfig { offload_mode: OffloadMode::Balanced, ..Default::default() };
//! let mut session = OffloadSession::new(config, backend);
//!
//! let pipeline = ModelPipeline::new("StableDiffusionXLPipeline")
//!     .with_checkpoint("sdxl-base")
//!     .with_module("unet", Submodule::placeholder("unet", "UNet2DConditionModel", 5 << 30, 16));
//!
//! session.apply(&pipeline, &[]);
//! pipeline.invoke("unet", |unet| unet.residency())?;
//! ```

pub mod backend;
pub mod config;
pub mod offload;
pub mod pipeline;
pub mod utils;

// Re-exports for convenience
pub use backend::{Backend, CandleBackend, MemoryLedger, SimulatedBackend};
pub use config::{OffloadConfig, OffloadMode, Watermarks};
pub use offload::{
    ApplyOutcome, ApplyReport, BalancedOffloadHook, DeviceMap, DeviceMapBuilder, FailureKind,
    FailurePolicy, FormatTable, MapTarget, MemoryBounds, NumericFormat, OffloadManager,
    OffloadSession, SizeCache, SizeEntry, SkipReason,
};
pub use pipeline::{
    ModelPipeline, ModuleHook, ModuleNode, Parameter, Pipeline, SharedSubmodule, Storage,
    Submodule, SubmoduleId,
};
pub use utils::{Location, MemoryProbe, MemoryReading, Residency};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum OffloadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Transfer failed for {param}: {reason}")]
    Transfer { param: String, reason: String },

    #[error("Device map error: {0}")]
    DeviceMap(String),

    #[error("Unknown numeric format: {0}")]
    UnknownFormat(String),

    #[error("Weights loading failed: {0}")]
    WeightsLoad(String),

    #[error("Unknown submodule: {0}")]
    UnknownModule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OffloadError>;
