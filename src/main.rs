//! rs-offload CLI - plan and simulate balanced offloading
//!
//! Inspect how submodules would be split across accelerator and host memory,
//! and replay pipeline invocation orders against a simulated accelerator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use rs_offload::{
    Backend, CandleBackend, DeviceMapBuilder, FormatTable, MemoryBounds, ModelPipeline,
    OffloadConfig, OffloadMode, OffloadSession, SimulatedBackend, Submodule, Watermarks,
    pipeline::weights::load_submodule,
    utils::{device_type, format_bytes, get_device, is_cpu},
};

const GB: f64 = (1u64 << 30) as f64;

#[derive(Parser)]
#[command(name = "rs-offload")]
#[command(author, version, about = "Balanced accelerator/host offloading", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show size and device map of one weights file
    Plan {
        /// Path to a .safetensors file
        #[arg(short, long)]
        weights: PathBuf,

        /// Accelerator memory in GB
        #[arg(long)]
        accelerator_gb: f64,

        /// Host memory in GB
        #[arg(long)]
        host_gb: f64,

        /// High watermark (accelerator budget fraction)
        #[arg(long, default_value = "0.7")]
        high: f64,

        /// Host watermark (host budget fraction)
        #[arg(long, default_value = "0.75")]
        host: f64,
    },

    /// Replay a pipeline description against a simulated accelerator
    Simulate {
        /// Pipeline description (JSON)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Offload settings (JSON)
        #[arg(short, long, env = "RS_OFFLOAD_CONFIG")]
        config: Option<PathBuf>,

        /// Accelerator memory in GB
        #[arg(long)]
        accelerator_gb: f64,

        /// Host memory in GB
        #[arg(long, default_value = "64")]
        host_gb: f64,

        /// Override the configured offload mode
        #[arg(long, value_enum)]
        mode: Option<Mode>,
    },

    /// Show the resolved configuration and the detected device
    Info {
        /// Offload settings (JSON)
        #[arg(short, long, env = "RS_OFFLOAD_CONFIG")]
        config: Option<PathBuf>,

        /// GPU device ID (auto-detect if not specified)
        #[arg(long)]
        device: Option<usize>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Mode {
    None,
    Model,
    Sequential,
    Balanced,
}

impl From<Mode> for OffloadMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::None => OffloadMode::None,
            Mode::Model => OffloadMode::Model,
            Mode::Sequential => OffloadMode::Sequential,
            Mode::Balanced => OffloadMode::Balanced,
        }
    }
}

/// Pipeline description consumed by `simulate`
#[derive(Debug, Deserialize)]
struct PipelineDescription {
    class_name: String,
    #[serde(default)]
    checkpoint: Option<String>,
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    modules: Vec<ModuleDescription>,
    #[serde(default)]
    stages: Vec<PipelineDescription>,
    /// Submodule names in call order
    #[serde(default)]
    invocations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModuleDescription {
    name: String,
    #[serde(default = "default_module_class")]
    class_name: String,
    size_gb: f64,
    #[serde(default = "default_layers")]
    layers: usize,
}

fn default_module_class() -> String {
    "Module".to_string()
}

fn default_layers() -> usize {
    8
}

impl PipelineDescription {
    fn build(&self) -> ModelPipeline {
        let mut pipeline = ModelPipeline::new(&self.class_name);
        if let Some(checkpoint) = &self.checkpoint {
            pipeline = pipeline.with_checkpoint(checkpoint);
        }
        if let Some(family) = &self.family {
            pipeline = pipeline.with_family(family);
        }
        for module in &self.modules {
            let bytes = (module.size_gb * GB) as u64;
            pipeline = pipeline.with_module(
                &module.name,
                Submodule::placeholder(&module.name, &module.class_name, bytes, module.layers),
            );
        }
        for stage in &self.stages {
            pipeline = pipeline.with_stage(stage.build());
        }
        pipeline
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_offload=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            weights,
            accelerator_gb,
            host_gb,
            high,
            host,
        } => {
            plan(&weights, accelerator_gb, host_gb, high, host)?;
        }

        Commands::Simulate {
            pipeline,
            config,
            accelerator_gb,
            host_gb,
            mode,
        } => {
            simulate(&pipeline, config.as_deref(), accelerator_gb, host_gb, mode)?;
        }

        Commands::Info { config, device } => {
            show_info(config.as_deref(), device)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OffloadConfig> {
    Ok(match path {
        Some(path) => OffloadConfig::from_file(path)?,
        None => OffloadConfig::default(),
    })
}

fn plan(weights: &Path, accelerator_gb: f64, host_gb: f64, high: f64, host: f64) -> anyhow::Result<()> {
    let name = weights
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "module".to_string());
    let module = load_submodule(&name, "Module", weights, true)?;

    let config = OffloadConfig {
        high_watermark: high,
        host_watermark: host,
        ..Default::default()
    };
    let watermarks = Watermarks::validate(&config);
    let bounds = MemoryBounds {
        accelerator: (accelerator_gb * GB * watermarks.high) as u64,
        host: (host_gb * GB * watermarks.host) as u64,
    };

    let formats = FormatTable::default();
    let size = formats.module_size(&module)?;

    println!("Submodule: {}", name);
    println!("Parameters: {}", size.params);
    println!("Size: {}", format_bytes(size.bytes));
    println!("Accelerator budget: {}", format_bytes(bounds.accelerator));
    println!("Host budget: {}", format_bytes(bounds.host));

    match DeviceMapBuilder::new(&formats).build(&module, bounds)? {
        None => println!("\nFits on the accelerator whole, no device map needed"),
        Some(map) => {
            println!("\nDevice map ({} entries)", map.len());
            println!("==========");
            for (path, target) in map.entries() {
                println!("{:<48} {}", path, target);
            }
            println!("\nAccelerator: {}", format_bytes(map.accelerator_bytes()));
            println!("Host: {}", format_bytes(map.host_bytes()));
            if map.shortfall_bytes() > 0 {
                println!("Disk (shortfall): {}", format_bytes(map.shortfall_bytes()));
            }
        }
    }

    Ok(())
}

fn simulate(
    pipeline_path: &Path,
    config_path: Option<&Path>,
    accelerator_gb: f64,
    host_gb: f64,
    mode: Option<Mode>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(mode) = mode {
        config = config.with_mode(mode.into());
    }

    let description: PipelineDescription = serde_json::from_str(&std::fs::read_to_string(pipeline_path)?)?;
    let pipeline = description.build();

    let backend = Arc::new(SimulatedBackend::new(
        (accelerator_gb * GB) as u64,
        (host_gb * GB) as u64,
    ));
    let mut session = OffloadSession::new(config, backend.clone());

    let outcome = session.configure(&pipeline);
    match outcome.report() {
        Some(report) => println!(
            "Offload applied: modules={} size={} cached={}",
            report.modules,
            format_bytes(report.total_bytes),
            report.cached
        ),
        None => println!("Offload not applied: {:?}", outcome),
    }

    println!("\n{:<4} {:<32} {:<12} {:>14}", "step", "module", "residency", "accelerator");
    for (step, name) in description.invocations.iter().enumerate() {
        let residency = pipeline.invoke(name, |module| module.residency())?;
        println!(
            "{:<4} {:<32} {:<12} {:>14}",
            step + 1,
            name,
            format!("{:?}", residency),
            format_bytes(backend.accelerator_used())
        );
    }

    println!("\nTransfers: {}", backend.transfer_count());
    Ok(())
}

fn show_info(config_path: Option<&Path>, device_id: Option<usize>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (watermarks, corrections) = Watermarks::resolve(&config);

    println!("Offload Configuration");
    println!("=====================");
    println!("{}", serde_json::to_string_pretty(&config)?);

    println!("\nResolved watermarks");
    println!("===================");
    println!("Low: {}", watermarks.low);
    println!("High: {}", watermarks.high);
    println!("Host: {}", watermarks.host);
    for correction in &corrections {
        println!("Corrected: {}", correction);
    }

    let device = get_device(device_id)?;
    println!("\nDevice: {}", device_type(&device));
    if is_cpu(&device) {
        println!("No accelerator detected");
        return Ok(());
    }

    let backend = CandleBackend::new(device, device_id.unwrap_or(0), config.accelerator_memory_bytes)?;
    println!("Accelerator memory: {}", format_bytes(backend.accelerator_total()));
    println!(
        "Accelerator budget: {}",
        format_bytes((backend.accelerator_total() as f64 * watermarks.high) as u64)
    );
    println!("Host memory: {}", format_bytes(backend.host_total()));
    Ok(())
}
