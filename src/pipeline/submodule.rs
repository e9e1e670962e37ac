//! Submodules, their parameter trees and the hook interface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{Device, Tensor};

use crate::offload::{DeviceMap, MemoryBounds, NumericFormat};
use crate::utils::{Location, Residency};

/// Tag carrying the logical layer name used by weight adapters.
pub const LAYER_NAME_TAG: &str = "layer_name";

static NEXT_SUBMODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a submodule instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmoduleId(u64);

impl SubmoduleId {
    fn next() -> Self {
        Self(NEXT_SUBMODULE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Backing storage of a parameter
#[derive(Debug, Clone)]
pub enum Storage {
    /// Shape and format only; moves update the location alone
    Meta,
    /// Materialized candle tensor
    Tensor(Tensor),
    /// Tensor written to a scratch file
    Spilled(PathBuf),
}

/// A single weight or buffer tensor of a submodule.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    shape: Vec<usize>,
    format: NumericFormat,
    location: Location,
    storage: Storage,
}

impl Parameter {
    /// Parameter with no data, resident on host
    pub fn meta(name: impl Into<String>, shape: Vec<usize>, format: NumericFormat) -> Self {
        Self {
            name: name.into(),
            shape,
            format,
            location: Location::Host,
            storage: Storage::Meta,
        }
    }

    /// Wrap a candle tensor; location follows the tensor's device
    pub fn from_tensor(name: impl Into<String>, tensor: Tensor) -> Self {
        let location = match tensor.device() {
            Device::Cpu => Location::Host,
            _ => Location::Accelerator,
        };
        Self {
            name: name.into(),
            shape: tensor.dims().to_vec(),
            format: NumericFormat::Dtype(tensor.dtype()),
            location,
            storage: Storage::Tensor(tensor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn format(&self) -> &NumericFormat {
        &self.format
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of elements (1 for scalars)
    pub fn element_count(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    /// Record a completed move. Only backends call this.
    pub(crate) fn relocate(&mut self, location: Location, storage: Option<Storage>) {
        self.location = location;
        if let Some(storage) = storage {
            self.storage = storage;
        }
    }
}

/// A node in a submodule's parameter tree.
#[derive(Debug, Clone, Default)]
pub struct ModuleNode {
    name: String,
    parameters: Vec<Parameter>,
    children: Vec<ModuleNode>,
}

impl ModuleNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_child(mut self, child: ModuleNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn children(&self) -> &[ModuleNode] {
        &self.children
    }

    /// Insert a parameter under a dotted path, creating intermediate nodes.
    ///
    /// `"blocks.0.attn.weight"` lands as parameter `weight` of node
    /// `blocks/0/attn`.
    pub fn insert(&mut self, path: &str, mut parameter: Parameter) {
        match path.split_once('.') {
            None => {
                parameter.name = path.to_string();
                self.parameters.push(parameter);
            }
            Some((head, rest)) => {
                let index = match self.children.iter().position(|c| c.name == head) {
                    Some(index) => index,
                    None => {
                        self.children.push(ModuleNode::new(head));
                        self.children.len() - 1
                    }
                };
                self.children[index].insert(rest, parameter);
            }
        }
    }

    /// Visit every parameter depth-first with its dotted path.
    ///
    /// Parameters of a node come before its children.
    pub fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        for parameter in &self.parameters {
            f(&join_path(prefix, &parameter.name), parameter);
        }
        for child in &self.children {
            child.visit(&join_path(prefix, &child.name), f);
        }
    }

    /// Mutable visit in the same order as [`ModuleNode::visit`].
    pub fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, &mut Parameter) -> crate::Result<()>,
    ) -> crate::Result<()> {
        for parameter in &mut self.parameters {
            let path = join_path(prefix, &parameter.name);
            f(&path, parameter)?;
        }
        for child in &mut self.children {
            let path = join_path(prefix, &child.name);
            child.visit_mut(&path, f)?;
        }
        Ok(())
    }

    /// Total number of parameters in this subtree
    pub fn parameter_count(&self) -> usize {
        self.parameters.len() + self.children.iter().map(|c| c.parameter_count()).sum::<usize>()
    }
}

/// Join two dotted path segments
pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Callbacks fired around every invocation of a hooked submodule.
///
/// Implementations must contain their own failures: a hook never aborts the
/// computation it wraps.
pub trait ModuleHook: Send + Sync {
    /// Runs immediately before the submodule executes
    fn pre_forward(&self, module: &mut Submodule);

    /// Runs after the submodule has produced its output
    fn post_forward(&self, module: &mut Submodule);

    /// Runs when the hook is removed; clears hook-scoped state
    fn detach(&self, module: &mut Submodule);
}

/// Device map computed for a submodule, bound to the budgets it was built for.
#[derive(Debug, Clone)]
pub struct PlacementCache {
    pub bounds: MemoryBounds,
    /// `None` when the whole submodule fits
    pub map: Option<DeviceMap>,
}

/// A named unit of computation with its own weights.
pub struct Submodule {
    id: SubmoduleId,
    name: String,
    class_name: String,
    root: ModuleNode,
    execution_device: Option<Location>,
    hook: Option<Arc<dyn ModuleHook>>,
    placement: Option<PlacementCache>,
    tags: BTreeMap<String, String>,
    offload_dir: Option<PathBuf>,
    forced_eviction: bool,
}

impl Submodule {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>, root: ModuleNode) -> Self {
        Self {
            id: SubmoduleId::next(),
            name: name.into(),
            class_name: class_name.into(),
            root,
            execution_device: None,
            hook: None,
            placement: None,
            tags: BTreeMap::new(),
            offload_dir: None,
            forced_eviction: false,
        }
    }

    /// Shape-only submodule of `total_bytes` spread over `layers` u8 blocks.
    ///
    /// Used for planning and simulation where no real weights are loaded.
    pub fn placeholder(
        name: impl Into<String>,
        class_name: impl Into<String>,
        total_bytes: u64,
        layers: usize,
    ) -> Self {
        let layers = layers.max(1);
        let per_layer = total_bytes / layers as u64;
        let remainder = total_bytes - per_layer * layers as u64;
        let mut blocks = ModuleNode::new("blocks");
        for i in 0..layers {
            let bytes = if i + 1 == layers { per_layer + remainder } else { per_layer };
            let weight = Parameter::meta(
                "weight",
                vec![bytes as usize],
                NumericFormat::Dtype(candle_core::DType::U8),
            );
            blocks = blocks.with_child(ModuleNode::new(i.to_string()).with_parameter(weight));
        }
        let name = name.into();
        Self::new(name.clone(), class_name, ModuleNode::new(name).with_child(blocks))
    }

    /// Wrap into the shared handle pipelines hold
    pub fn into_shared(self) -> super::SharedSubmodule {
        Arc::new(parking_lot::Mutex::new(self))
    }

    pub fn id(&self) -> SubmoduleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn root(&self) -> &ModuleNode {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut ModuleNode {
        &mut self.root
    }

    /// Current residency derived from parameter locations
    pub fn residency(&self) -> Residency {
        let mut locations = Vec::with_capacity(self.root.parameter_count());
        self.root.visit("", &mut |_, p| locations.push(p.location()));
        Residency::from_locations(locations)
    }

    /// Location of every parameter keyed by dotted path
    pub fn locations(&self) -> Vec<(String, Location)> {
        let mut locations = Vec::new();
        self.root.visit("", &mut |path, p| locations.push((path.to_string(), p.location())));
        locations
    }

    /// Device outputs land on, regardless of where weights live
    pub fn execution_device(&self) -> Option<Location> {
        self.execution_device
    }

    pub fn set_execution_device(&mut self, device: Location) {
        self.execution_device = Some(device);
    }

    /// Attach a hook, detaching any previous one first. Hooks never stack.
    pub fn attach_hook(&mut self, hook: Arc<dyn ModuleHook>) {
        self.remove_hook();
        self.hook = Some(hook);
    }

    /// Remove the attached hook, returning whether one was present
    pub fn remove_hook(&mut self) -> bool {
        match self.hook.take() {
            Some(hook) => {
                hook.detach(self);
                true
            }
            None => false,
        }
    }

    pub fn is_hooked(&self) -> bool {
        self.hook.is_some()
    }

    /// Run a computation wrapped by the attached hook.
    pub fn forward<T>(&mut self, f: impl FnOnce(&Submodule) -> T) -> T {
        let hook = self.hook.clone();
        if let Some(hook) = &hook {
            hook.pre_forward(self);
        }
        let output = f(self);
        if let Some(hook) = &hook {
            hook.post_forward(self);
        }
        output
    }

    pub fn placement(&self) -> Option<&PlacementCache> {
        self.placement.as_ref()
    }

    pub fn set_placement(&mut self, placement: PlacementCache) {
        self.placement = Some(placement);
    }

    pub fn take_placement(&mut self) -> Option<PlacementCache> {
        self.placement.take()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn clear_tags(&mut self) {
        self.tags.clear();
    }

    /// Logical layer name used by weight adapters
    pub fn layer_name(&self) -> Option<&str> {
        self.tag(LAYER_NAME_TAG)
    }

    pub fn set_layer_name(&mut self, layer_name: impl Into<String>) {
        self.set_tag(LAYER_NAME_TAG, layer_name);
    }

    pub fn offload_dir(&self) -> Option<&Path> {
        self.offload_dir.as_deref()
    }

    pub fn set_offload_dir(&mut self, dir: Option<PathBuf>) {
        self.offload_dir = dir;
    }

    /// Whether this submodule is evicted right after its own invocation
    pub fn forced_eviction(&self) -> bool {
        self.forced_eviction
    }

    pub fn set_forced_eviction(&mut self, forced: bool) {
        self.forced_eviction = forced;
    }
}

impl std::fmt::Debug for Submodule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submodule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .field("num_parameters", &self.root.parameter_count())
            .field("residency", &self.residency())
            .field("hooked", &self.is_hooked())
            .finish()
    }
}
