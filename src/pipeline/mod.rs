//! Pipelines and the submodules they are built from.
//!
//! This module provides:
//! - `Pipeline`: the contract the offload manager consumes
//! - `ModelPipeline`: a concrete named tree of submodules and nested stages
//! - `Submodule`: a unit of computation with a parameter tree and a hook slot
//! - `weights`: building submodules from safetensors files

mod submodule;
pub mod weights;

pub use submodule::{
    LAYER_NAME_TAG, ModuleHook, ModuleNode, Parameter, PlacementCache, Storage, Submodule,
    SubmoduleId,
};

pub(crate) use submodule::join_path;

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared handle to a submodule.
///
/// Pipelines and the offload manager both hold these; the lock is taken for
/// the duration of an invocation so the manager never relocates a submodule
/// that is still running.
pub type SharedSubmodule = Arc<Mutex<Submodule>>;

/// A pipeline as seen by the offload manager.
pub trait Pipeline {
    /// Class name, matched against the excluded pipeline types
    fn class_name(&self) -> &str;

    /// Name of the loaded checkpoint, if known
    fn checkpoint(&self) -> Option<&str>;

    /// Model family key (e.g. `sdxl`, `hidream`) used by allow-lists
    fn model_family(&self) -> Option<&str> {
        None
    }

    /// Directly owned submodules in declaration order
    fn submodules(&self) -> Vec<(String, SharedSubmodule)>;

    /// Nested stages (prior/decoder pipelines and the like)
    fn nested_pipelines(&self) -> Vec<&dyn Pipeline> {
        Vec::new()
    }

    /// Checkpoint identity, falling back to the class name
    fn identity(&self) -> String {
        self.checkpoint()
            .map(str::to_string)
            .unwrap_or_else(|| self.class_name().to_string())
    }
}

/// Concrete pipeline: named submodules plus nested stages.
#[derive(Debug, Default)]
pub struct ModelPipeline {
    class_name: String,
    checkpoint: Option<String>,
    family: Option<String>,
    modules: Vec<(String, SharedSubmodule)>,
    stages: Vec<ModelPipeline>,
}

impl ModelPipeline {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Default::default()
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_module(mut self, name: impl Into<String>, module: Submodule) -> Self {
        self.add_module(name, module);
        self
    }

    pub fn with_stage(mut self, stage: ModelPipeline) -> Self {
        self.stages.push(stage);
        self
    }

    /// Add or replace a submodule, returning its shared handle
    pub fn add_module(&mut self, name: impl Into<String>, module: Submodule) -> SharedSubmodule {
        let name = name.into();
        let handle = module.into_shared();
        match self.modules.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = handle.clone(),
            None => self.modules.push((name, handle.clone())),
        }
        handle
    }

    /// Look up a submodule by name in this pipeline or any nested stage
    pub fn module(&self, name: &str) -> Option<SharedSubmodule> {
        self.modules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.clone())
            .or_else(|| self.stages.iter().find_map(|s| s.module(name)))
    }

    pub fn stages(&self) -> &[ModelPipeline] {
        &self.stages
    }

    /// Invoke a submodule through its hooks.
    pub fn invoke<T>(&self, name: &str, f: impl FnOnce(&Submodule) -> T) -> crate::Result<T> {
        let handle = self
            .module(name)
            .ok_or_else(|| crate::OffloadError::UnknownModule(name.to_string()))?;
        let mut module = handle.lock();
        Ok(module.forward(f))
    }
}

impl Pipeline for ModelPipeline {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    fn model_family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    fn submodules(&self) -> Vec<(String, SharedSubmodule)> {
        self.modules.clone()
    }

    fn nested_pipelines(&self) -> Vec<&dyn Pipeline> {
        self.stages.iter().map(|s| s as &dyn Pipeline).collect()
    }
}
