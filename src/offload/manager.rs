//! The balanced offload manager and the hook it attaches to submodules.
//!
//! Placement runs right before a submodule executes and moves its weights
//! onto the accelerator, splitting them with a device map when they exceed
//! the accelerator budget. Eviction runs right after and moves submodules
//! back to host until occupancy is at or below the low watermark.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::config::{OffloadConfig, Watermarks};
use crate::offload::{
    DeviceMap, DeviceMapBuilder, FailurePolicy, FormatTable, MapTarget, MemoryBounds, SizeCache,
    SizeEntry,
};
use crate::pipeline::{ModuleHook, PlacementCache, SharedSubmodule, Submodule, SubmoduleId};
use crate::utils::{Location, MemoryProbe, Residency, format_bytes, qualified_device};

struct Registered {
    id: SubmoduleId,
    name: String,
    handle: Weak<Mutex<Submodule>>,
}

/// Offload state for one checkpoint and one set of watermarks.
///
/// Owned by an [`OffloadSession`](crate::offload::OffloadSession); a manager
/// built later for the same session supersedes this one and its hooks stop
/// acting.
pub struct OffloadManager {
    checkpoint: String,
    watermarks: Watermarks,
    budgets: MemoryBounds,
    accelerator_total: u64,
    backend: Arc<dyn Backend>,
    probe: MemoryProbe,
    sizes: SizeCache,
    failures: FailurePolicy,
    /// Hooked submodules, least recently invoked first
    registry: Mutex<Vec<Registered>>,
    generation: u64,
    live: Arc<AtomicU64>,
}

impl OffloadManager {
    /// Build a manager and make it the live one for `live`.
    pub fn new(
        checkpoint: impl Into<String>,
        config: &OffloadConfig,
        backend: Arc<dyn Backend>,
        formats: FormatTable,
        live: Arc<AtomicU64>,
    ) -> Self {
        let checkpoint = checkpoint.into();
        let watermarks = Watermarks::validate(config);
        let accelerator_total = config
            .accelerator_memory_bytes
            .unwrap_or_else(|| backend.accelerator_total());
        let host_total = config.host_memory_bytes.unwrap_or_else(|| backend.host_total());
        watermarks.check_budget(accelerator_total);

        let budgets = MemoryBounds {
            accelerator: (accelerator_total as f64 * watermarks.high) as u64,
            host: (host_total as f64 * watermarks.host) as u64,
        };
        let generation = live.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::info!(
            "Offload: type=balanced op=init checkpoint={} watermark=low:{}/high:{}/host:{} accelerator={} host={} generation={}",
            checkpoint,
            watermarks.low,
            watermarks.high,
            watermarks.host,
            format_bytes(budgets.accelerator),
            format_bytes(budgets.host),
            generation
        );

        Self {
            checkpoint,
            watermarks,
            budgets,
            accelerator_total,
            probe: MemoryProbe::new(backend.clone()),
            backend,
            sizes: SizeCache::new(formats),
            failures: FailurePolicy::new(config.benign_error_patterns.clone()),
            registry: Mutex::new(Vec::new()),
            generation,
            live,
        }
    }

    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// Accelerator and host byte budgets placement works within
    pub fn budgets(&self) -> MemoryBounds {
        self.budgets
    }

    pub fn accelerator_total(&self) -> u64 {
        self.accelerator_total
    }

    pub fn sizes(&self) -> &SizeCache {
        &self.sizes
    }

    pub fn probe(&self) -> &MemoryProbe {
        &self.probe
    }

    pub fn failures(&self) -> &FailurePolicy {
        &self.failures
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether no newer manager has been built for the same session
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.generation
    }

    /// Whether this manager is still valid for a checkpoint and watermarks
    pub fn matches(&self, checkpoint: &str, watermarks: &Watermarks) -> bool {
        self.checkpoint == checkpoint && self.watermarks.same_accelerator_marks(watermarks)
    }

    pub fn size_of(&self, name: &str, module: &Submodule) -> SizeEntry {
        self.sizes.size_of(name, module)
    }

    /// Occupancy fraction above the low watermark
    pub fn above_low(&self, accelerator_used: u64) -> bool {
        if self.accelerator_total == 0 {
            return false;
        }
        accelerator_used as f64 / self.accelerator_total as f64 > self.watermarks.low
    }

    /// Track a hooked submodule for eviction, most recently invoked.
    pub fn register(&self, name: &str, id: SubmoduleId, handle: &SharedSubmodule) {
        self.register_at(name, id, handle, None);
    }

    /// Track a hooked submodule at `position` in the eviction order, or last.
    ///
    /// An already registered submodule keeps its position.
    pub fn register_at(
        &self,
        name: &str,
        id: SubmoduleId,
        handle: &SharedSubmodule,
        position: Option<usize>,
    ) {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.iter_mut().find(|r| r.id == id) {
            entry.name = name.to_string();
            entry.handle = Arc::downgrade(handle);
            return;
        }
        let entry = Registered {
            id,
            name: name.to_string(),
            handle: Arc::downgrade(handle),
        };
        match position {
            Some(position) => {
                let position = position.min(registry.len());
                registry.insert(position, entry);
            }
            None => registry.push(entry),
        }
    }

    pub fn unregister(&self, id: SubmoduleId) {
        self.registry.lock().retain(|r| r.id != id);
    }

    /// Index in the eviction order, least recently invoked first
    pub fn position(&self, id: SubmoduleId) -> Option<usize> {
        self.registry.lock().iter().position(|r| r.id == id)
    }

    /// Forget submodules that were dropped without being unhooked.
    pub fn prune(&self) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|r| r.handle.strong_count() > 0);
        before - registry.len()
    }

    /// Registered names, least recently invoked first
    pub fn registered(&self) -> Vec<String> {
        self.registry.lock().iter().map(|r| r.name.clone()).collect()
    }

    fn touch(&self, id: SubmoduleId) {
        let mut registry = self.registry.lock();
        if let Some(position) = registry.iter().position(|r| r.id == id) {
            let entry = registry.remove(position);
            registry.push(entry);
        }
    }

    fn registered_name(&self, id: SubmoduleId) -> Option<String> {
        self.registry.lock().iter().find(|r| r.id == id).map(|r| r.name.clone())
    }

    /// Move a submodule onto the accelerator for its next invocation.
    ///
    /// Reuses the cached device map while it was built for the current
    /// budgets. Parameters beyond the accelerator budget go to host or to
    /// the submodule's offload directory.
    pub fn place(&self, module: &mut Submodule) -> crate::Result<()> {
        self.touch(module.id());
        module.set_execution_device(Location::Accelerator);

        let cached = module
            .placement()
            .filter(|placement| placement.bounds == self.budgets)
            .cloned();
        if module.residency() == Residency::Accelerator {
            return Ok(());
        }
        if let Some(PlacementCache { map: Some(map), .. }) = &cached {
            if is_realized(module, map) {
                return Ok(());
            }
        }

        let map = match cached {
            Some(placement) => placement.map,
            None => {
                let mut map = DeviceMapBuilder::new(self.sizes.formats())
                    .with_accelerator_index(self.backend.accelerator_index())
                    .build(module, self.budgets)?;
                if !self.backend.plain_device_indices() {
                    if let Some(map) = map.as_mut() {
                        map.qualify(self.backend.name());
                    }
                }
                map
            }
        };
        module.set_placement(PlacementCache {
            bounds: self.budgets,
            map: map.clone(),
        });

        let before = self.probe.measure(true);
        let spill_dir = module.offload_dir().map(Path::to_path_buf);
        let formats = self.sizes.formats();
        let backend = &self.backend;
        module.root_mut().visit_mut("", &mut |path, parameter| {
            let to = map
                .as_ref()
                .and_then(|m| m.target_for(path))
                .map(MapTarget::location)
                .unwrap_or(Location::Accelerator);
            let bytes = formats.byte_size(parameter.format(), parameter.element_count())?;
            backend.transfer(path, parameter, to, bytes, spill_dir.as_deref())
        })?;

        tracing::debug!(
            "Offload: type=balanced op=pre module={} device={} split={} accelerator={}->{}",
            module.name(),
            self.placement_device(map.as_ref()),
            map.as_ref().map(DeviceMap::len).unwrap_or(0),
            format_bytes(before.accelerator_used),
            format_bytes(self.backend.accelerator_used())
        );
        Ok(())
    }

    /// Device a submodule is placed on, with the spill targets of a split
    /// map appended, e.g. `cuda:0+cpu+disk`.
    pub fn placement_device(&self, map: Option<&DeviceMap>) -> String {
        let mut device = qualified_device(self.backend.name(), self.backend.accelerator_index());
        if let Some(map) = map {
            if map.host_bytes() > 0 {
                device.push_str("+cpu");
            }
            if map.shortfall_bytes() > 0 {
                device.push_str("+disk");
            }
        }
        device
    }

    /// Evict submodules after `module` finished, down to the low watermark.
    ///
    /// Candidates are tried least recently invoked first and `module` itself
    /// last, unless it is flagged for forced eviction. Submodules locked by
    /// another caller are in use and skipped. Failures are contained.
    pub fn evict_after(&self, module: &mut Submodule) {
        let pruned = self.prune();
        if pruned > 0 {
            tracing::trace!("Offload: type=balanced op=post pruned={}", pruned);
        }
        let reading = self.probe.measure(true);
        let mut used = reading.accelerator_used;
        if !self.above_low(used) {
            tracing::trace!(
                "Offload: type=balanced op=post module={} accelerator={} below low watermark",
                module.name(),
                format_bytes(used)
            );
            return;
        }

        let others: Vec<(String, Weak<Mutex<Submodule>>)> = self
            .registry
            .lock()
            .iter()
            .filter(|r| r.id != module.id())
            .map(|r| (r.name.clone(), r.handle.clone()))
            .collect();
        let own_name = self
            .registered_name(module.id())
            .unwrap_or_else(|| module.name().to_string());

        if module.forced_eviction() {
            used = self.evict_one(module, &own_name, used);
        }
        for (name, handle) in others {
            if !self.above_low(used) {
                break;
            }
            let Some(handle) = handle.upgrade() else {
                continue;
            };
            let Some(mut other) = handle.try_lock() else {
                tracing::trace!("Offload: type=balanced op=post module={} in use, skipped", name);
                continue;
            };
            used = self.evict_one(&mut other, &name, used);
        }
        if !module.forced_eviction() && self.above_low(used) {
            used = self.evict_one(module, &own_name, used);
        }

        tracing::debug!(
            "Offload: type=balanced op=post module={} accelerator={}->{}",
            module.name(),
            format_bytes(reading.accelerator_used),
            format_bytes(used)
        );
    }

    fn evict_one(&self, module: &mut Submodule, name: &str, used: u64) -> u64 {
        match self.move_to_host(module) {
            Ok(freed) => {
                if freed > 0 {
                    tracing::debug!(
                        "Offload: type=balanced op=evict module={} freed={}",
                        name,
                        format_bytes(freed)
                    );
                }
                used.saturating_sub(freed)
            }
            Err(e) => {
                self.failures.handle(&e, "evict", name, &self.probe);
                used
            }
        }
    }

    /// Move every accelerator-resident parameter to host, returning freed bytes.
    pub fn move_to_host(&self, module: &mut Submodule) -> crate::Result<u64> {
        if module.residency() == Residency::Host {
            return Ok(0);
        }
        let formats = self.sizes.formats();
        let backend = &self.backend;
        let mut freed = 0u64;
        module.root_mut().visit_mut("", &mut |path, parameter| {
            if parameter.location() != Location::Accelerator {
                return Ok(());
            }
            let bytes = formats.byte_size(parameter.format(), parameter.element_count())?;
            backend.transfer(path, parameter, Location::Host, bytes, None)?;
            freed += bytes;
            Ok(())
        })?;
        Ok(freed)
    }
}

/// Every parameter already sits where the map sends it
fn is_realized(module: &Submodule, map: &DeviceMap) -> bool {
    let mut realized = true;
    module.root().visit("", &mut |path, parameter| {
        let target = map.target_for(path).map(MapTarget::location).unwrap_or(Location::Accelerator);
        if parameter.location() != target {
            realized = false;
        }
    });
    realized
}

impl std::fmt::Debug for OffloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadManager")
            .field("checkpoint", &self.checkpoint)
            .field("watermarks", &self.watermarks)
            .field("budgets", &self.budgets)
            .field("backend", &self.backend.name())
            .field("modules", &self.registry.lock().len())
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Placement and eviction hook of one manager.
#[derive(Debug, Clone)]
pub struct BalancedOffloadHook {
    manager: Arc<OffloadManager>,
}

impl BalancedOffloadHook {
    pub fn new(manager: Arc<OffloadManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<OffloadManager> {
        &self.manager
    }
}

impl ModuleHook for BalancedOffloadHook {
    fn pre_forward(&self, module: &mut Submodule) {
        if !self.manager.is_live() {
            return;
        }
        if let Err(e) = self.manager.place(module) {
            self.manager
                .failures()
                .handle(&e, "pre", module.name(), self.manager.probe());
        }
    }

    fn post_forward(&self, module: &mut Submodule) {
        if !self.manager.is_live() {
            return;
        }
        self.manager.evict_after(module);
    }

    fn detach(&self, module: &mut Submodule) {
        self.manager.unregister(module.id());
        module.clear_tags();
        module.set_offload_dir(None);
        module.set_forced_eviction(false);
        module.take_placement();
    }
}
