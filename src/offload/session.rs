//! Orchestration: attaching the balanced offload hooks to a whole pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::config::{OffloadConfig, OffloadMode, Watermarks};
use crate::offload::{BalancedOffloadHook, FormatTable, OffloadManager};
use crate::pipeline::{ModuleHook, Pipeline, SharedSubmodule};
use crate::utils::{Location, Residency, format_bytes};

/// Model families large enough that running without offload is risky
const LARGE_MODEL_FAMILIES: &[&str] = &[
    "stablecascade",
    "sd3",
    "flux",
    "hidream",
    "hunyuandit",
    "auraflow",
    "omnigen",
    "omnigen2",
    "cogview4",
    "cosmos",
    "chroma",
];

/// (model family, submodule name prefix) evicted right after each invocation
const FORCED_EVICTION: &[(&str, &str)] = &[("hidream", "text_encoder")];

/// Why `apply` left a pipeline alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Offload mode is not `balanced`
    Mode(OffloadMode),
    /// Pipeline type is in `excluded_pipeline_types`
    ExcludedPipeline(String),
    /// Offload was disabled; carries the number of hooks removed
    Disabled(usize),
}

/// Summary of one `apply` call
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// The live manager was reused
    pub cached: bool,
    /// Submodules hooked
    pub modules: usize,
    /// Combined size of the hooked submodules
    pub total_bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Skipped(SkipReason),
    Applied(ApplyReport),
}

impl ApplyOutcome {
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            ApplyOutcome::Applied(report) => Some(report),
            ApplyOutcome::Skipped(_) => None,
        }
    }
}

struct Entry {
    key: String,
    name: String,
    family: Option<String>,
    handle: SharedSubmodule,
}

/// Owner of the single live offload manager of an inference session.
pub struct OffloadSession {
    config: OffloadConfig,
    backend: Arc<dyn Backend>,
    formats: FormatTable,
    manager: Option<Arc<OffloadManager>>,
    live: Arc<AtomicU64>,
}

impl OffloadSession {
    pub fn new(config: OffloadConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            formats: FormatTable::default(),
            manager: None,
            live: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Use a custom numeric format table for managers built from now on
    pub fn with_formats(mut self, formats: FormatTable) -> Self {
        self.formats = formats;
        self
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Replace the settings snapshot; takes effect on the next `apply`
    pub fn set_config(&mut self, config: OffloadConfig) {
        self.config = config;
    }

    /// The live manager, if any
    pub fn manager(&self) -> Option<&Arc<OffloadManager>> {
        self.manager.as_ref()
    }

    /// Apply the configured offload mode to a pipeline.
    pub fn configure(&mut self, pipeline: &dyn Pipeline) -> ApplyOutcome {
        match self.config.offload_mode {
            OffloadMode::None => {
                if let Some(family) = pipeline.model_family() {
                    if is_large_family(family) {
                        tracing::warn!(
                            "Offload: type=none family={} large model without offload may run out of memory",
                            family
                        );
                    }
                }
                ApplyOutcome::Skipped(SkipReason::Disabled(self.disable(pipeline)))
            }
            OffloadMode::Balanced => self.apply(pipeline, &[]),
            mode => {
                tracing::debug!(
                    "Offload: type={} class={} handled by the pipeline",
                    mode,
                    pipeline.class_name()
                );
                ApplyOutcome::Skipped(SkipReason::Mode(mode))
            }
        }
    }

    /// Attach balanced offload hooks to every submodule of a pipeline.
    ///
    /// Reuses the live manager while checkpoint and watermarks are unchanged,
    /// but always re-attaches hooks. Submodules whose name starts with `_` or
    /// appears in `exclude` are left alone.
    pub fn apply(&mut self, pipeline: &dyn Pipeline, exclude: &[&str]) -> ApplyOutcome {
        if self.config.offload_mode != OffloadMode::Balanced {
            return ApplyOutcome::Skipped(SkipReason::Mode(self.config.offload_mode));
        }
        if self.config.is_excluded(pipeline.class_name()) {
            tracing::debug!(
                "Offload: type=balanced op=skip class={} excluded",
                pipeline.class_name()
            );
            return ApplyOutcome::Skipped(SkipReason::ExcludedPipeline(pipeline.class_name().to_string()));
        }

        let started = Instant::now();
        let checkpoint = pipeline.identity();
        let (watermarks, _) = Watermarks::resolve(&self.config);
        let (manager, cached) = match &self.manager {
            Some(manager) if manager.is_live() && manager.matches(&checkpoint, &watermarks) => {
                (manager.clone(), true)
            }
            _ => {
                let manager = Arc::new(OffloadManager::new(
                    checkpoint.clone(),
                    &self.config,
                    self.backend.clone(),
                    self.formats.clone(),
                    self.live.clone(),
                ));
                self.manager = Some(manager.clone());
                (manager, false)
            }
        };
        let hook: Arc<dyn ModuleHook> = Arc::new(BalancedOffloadHook::new(manager.clone()));
        manager.prune();

        let mut entries = Vec::new();
        collect_entries(pipeline, "", None, exclude, &mut entries);
        let mut sized: Vec<_> = entries
            .into_iter()
            .map(|entry| {
                let size = manager.size_of(&entry.key, &entry.handle.lock());
                (entry, size)
            })
            .collect();
        sized.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes));

        let mut used = manager.probe().measure(true).accelerator_used;
        for (entry, size) in &sized {
            let mut module = entry.handle.lock();

            if manager.above_low(used) && module.residency() != Residency::Host {
                match manager.move_to_host(&mut module) {
                    Ok(freed) => used = used.saturating_sub(freed),
                    Err(e) => {
                        manager.failures().handle(&e, "apply", &entry.key, manager.probe());
                    }
                }
            }

            let layer_name = module.layer_name().map(str::to_string);
            let placement = module.placement().cloned();
            let position = manager.position(module.id());
            module.attach_hook(hook.clone());
            if let Some(layer_name) = layer_name {
                module.set_layer_name(layer_name);
            }
            if let Some(placement) = placement {
                module.set_placement(placement);
            }
            module.set_offload_dir(Some(
                self.config.offload_scratch_directory.join(&checkpoint).join(&entry.key),
            ));
            module.set_forced_eviction(
                self.config.forced_eviction && is_forced(entry.family.as_deref(), &entry.name),
            );
            module.set_execution_device(Location::Accelerator);
            manager.register_at(&entry.key, module.id(), &entry.handle, position);

            tracing::trace!(
                "Offload: type=balanced op=hook module={} size={} params={}",
                entry.key,
                format_bytes(size.bytes),
                size.params
            );
        }

        let total_bytes = sized.iter().map(|(_, size)| size.bytes).sum();
        let elapsed = started.elapsed();
        if !cached {
            manager.probe().force_reclaim("offload");
            tracing::info!(
                "Offload: type=balanced op=apply class={} modules={} size={} time={:.2}",
                pipeline.class_name(),
                sized.len(),
                format_bytes(total_bytes),
                elapsed.as_secs_f64()
            );
        }

        ApplyOutcome::Applied(ApplyReport {
            cached,
            modules: sized.len(),
            total_bytes,
            elapsed,
        })
    }

    /// Remove offload hooks from every submodule, keeping `layer_name`.
    ///
    /// The live manager is dropped and its hooks go inert.
    pub fn disable(&mut self, pipeline: &dyn Pipeline) -> usize {
        let mut entries = Vec::new();
        collect_entries(pipeline, "", None, &[], &mut entries);

        let mut removed = 0;
        for entry in &entries {
            let mut module = entry.handle.lock();
            let layer_name = module.layer_name().map(str::to_string);
            if module.remove_hook() {
                removed += 1;
            }
            if let Some(layer_name) = layer_name {
                module.set_layer_name(layer_name);
            }
        }

        if self.manager.take().is_some() {
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        tracing::debug!(
            "Offload: type=none class={} hooks removed={}",
            pipeline.class_name(),
            removed
        );
        removed
    }
}

impl std::fmt::Debug for OffloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadSession")
            .field("mode", &self.config.offload_mode)
            .field("backend", &self.backend.name())
            .field("manager", &self.manager)
            .finish()
    }
}

/// Submodules of a pipeline and its nested stages.
///
/// Keys of nested submodules are prefixed with their stage class so that
/// equally named submodules of different stages stay apart.
fn collect_entries(
    pipeline: &dyn Pipeline,
    prefix: &str,
    family: Option<&str>,
    exclude: &[&str],
    out: &mut Vec<Entry>,
) {
    let family = pipeline.model_family().or(family);
    for (name, handle) in pipeline.submodules() {
        if name.starts_with('_') || exclude.contains(&name.as_str()) {
            continue;
        }
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        out.push(Entry {
            key,
            name,
            family: family.map(str::to_string),
            handle,
        });
    }
    for nested in pipeline.nested_pipelines() {
        let nested_prefix = if prefix.is_empty() {
            nested.class_name().to_string()
        } else {
            format!("{}.{}", prefix, nested.class_name())
        };
        collect_entries(nested, &nested_prefix, family, exclude, out);
    }
}

fn is_large_family(family: &str) -> bool {
    let family = family.to_lowercase();
    LARGE_MODEL_FAMILIES.contains(&family.as_str()) || family.contains("video")
}

fn is_forced(family: Option<&str>, name: &str) -> bool {
    family.is_some_and(|family| {
        FORCED_EVICTION
            .iter()
            .any(|(f, prefix)| family.eq_ignore_ascii_case(f) && name.starts_with(prefix))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::offload::MapTarget;
    use crate::pipeline::{ModelPipeline, Submodule};
    use rand::prelude::*;

    const GB: u64 = 1 << 30;

    fn backend() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(10 * GB, 64 * GB))
    }

    fn session(backend: Arc<SimulatedBackend>, low: f64, high: f64) -> OffloadSession {
        let config = OffloadConfig::default()
            .with_mode(OffloadMode::Balanced)
            .with_watermarks(low, high);
        OffloadSession::new(config, backend)
    }

    fn scenario_pipeline() -> ModelPipeline {
        ModelPipeline::new("StableDiffusionXLPipeline")
            .with_checkpoint("sdxl-base")
            .with_module("a", Submodule::placeholder("a", "CLIPTextModel", 3 * GB, 6))
            .with_module("b", Submodule::placeholder("b", "CLIPTextModelWithProjection", 2 * GB, 6))
            .with_module("c", Submodule::placeholder("c", "UNet2DConditionModel", 6 * GB, 6))
    }

    #[test]
    fn test_end_to_end_scenario() {
        let backend = backend();
        let pipeline = scenario_pipeline();
        let mut session = session(backend.clone(), 0.4, 0.5);

        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert!(!report.cached);
        assert_eq!(report.modules, 3);
        assert_eq!(report.total_bytes, 11 * GB);

        let inside = pipeline.invoke("a", |m| m.residency()).unwrap();
        assert_eq!(inside, Residency::Accelerator);
        assert_eq!(backend.accelerator_used(), 3 * GB);

        let inside = pipeline.invoke("b", |m| m.residency()).unwrap();
        assert_eq!(inside, Residency::Accelerator);
        assert_eq!(pipeline.module("a").unwrap().lock().residency(), Residency::Host);
        assert_eq!(backend.accelerator_used(), 2 * GB);

        let (residency, on_accelerator) = pipeline
            .invoke("c", |m| {
                let map = m.placement().and_then(|p| p.map.clone()).unwrap();
                assert_eq!(map.host_bytes(), GB);
                assert_eq!(map.shortfall_bytes(), 0);
                (m.residency(), map.accelerator_bytes())
            })
            .unwrap();
        assert_eq!(residency, Residency::Split);
        assert!(on_accelerator <= 5 * GB);
        assert_eq!(on_accelerator, 5 * GB);

        let c = pipeline.module("c").unwrap();
        assert_eq!(c.lock().execution_device(), Some(Location::Accelerator));
        assert_eq!(backend.accelerator_used(), 0);
    }

    #[test]
    fn test_apply_twice_reuses_manager() {
        let backend = backend();
        let pipeline = scenario_pipeline();
        let mut session = session(backend.clone(), 0.4, 0.5);

        session.apply(&pipeline, &[]);
        let first = session.manager().unwrap().clone();
        assert_eq!(first.sizes().computations(), 3);
        let collects = backend.full_collect_count();

        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert!(report.cached);
        assert!(Arc::ptr_eq(&first, session.manager().unwrap()));
        assert_eq!(first.sizes().computations(), 3);
        assert_eq!(backend.full_collect_count(), collects);
        for name in ["a", "b", "c"] {
            assert!(pipeline.module(name).unwrap().lock().is_hooked());
        }
    }

    #[test]
    fn test_stripped_hooks_are_restored_on_reuse() {
        let pipeline = scenario_pipeline();
        let mut session = session(backend(), 0.4, 0.5);
        session.apply(&pipeline, &[]);

        pipeline.module("b").unwrap().lock().remove_hook();
        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert!(report.cached);
        assert!(pipeline.module("b").unwrap().lock().is_hooked());
    }

    #[test]
    fn test_watermark_change_supersedes_manager() {
        let backend = backend();
        let pipeline = scenario_pipeline();
        let mut session = session(backend.clone(), 0.4, 0.5);
        session.apply(&pipeline, &[]);
        let old = session.manager().unwrap().clone();

        session.set_config(session.config().clone().with_watermarks(0.3, 0.6));
        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert!(!report.cached);
        assert!(!old.is_live());
        assert!(session.manager().unwrap().is_live());
        assert_eq!(session.manager().unwrap().budgets().accelerator, 6 * GB);
    }

    #[test]
    fn test_reapply_keeps_eviction_order() {
        let backend = backend();
        let pipeline = ModelPipeline::new("StableDiffusionPipeline")
            .with_checkpoint("sd15")
            .with_module("x", Submodule::placeholder("x", "CLIPTextModel", GB, 4))
            .with_module("y", Submodule::placeholder("y", "AutoencoderKL", 2 * GB, 4))
            .with_module("w", Submodule::placeholder("w", "CLIPVisionModel", GB, 4));
        let mut session = session(backend.clone(), 0.35, 0.9);
        session.apply(&pipeline, &[]);

        pipeline.invoke("x", |_| ()).unwrap();
        pipeline.invoke("y", |_| ()).unwrap();
        let manager = session.manager().unwrap().clone();
        assert_eq!(manager.registered(), vec!["w", "x", "y"]);

        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert!(report.cached);
        assert_eq!(manager.registered(), vec!["w", "x", "y"]);

        pipeline.invoke("w", |_| ()).unwrap();
        assert_eq!(pipeline.module("x").unwrap().lock().residency(), Residency::Host);
        assert_eq!(pipeline.module("y").unwrap().lock().residency(), Residency::Accelerator);
        assert_eq!(pipeline.module("w").unwrap().lock().residency(), Residency::Accelerator);
        assert_eq!(backend.accelerator_used(), 3 * GB);
    }

    #[test]
    fn test_device_map_rebuilt_for_new_budgets() {
        let backend = backend();
        let pipeline = ModelPipeline::new("StableDiffusion3Pipeline")
            .with_checkpoint("sd3")
            .with_module("c", Submodule::placeholder("c", "SD3Transformer2DModel", 8 * GB, 8));
        let mut session = session(backend.clone(), 0.4, 0.5);
        session.apply(&pipeline, &[]);

        let map = pipeline
            .invoke("c", |m| m.placement().and_then(|p| p.map.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(map.bounds().accelerator, 5 * GB);
        assert_eq!(map.accelerator_bytes(), 5 * GB);
        let kept = pipeline.module("c").unwrap().lock().placement().cloned().unwrap();
        assert_eq!(kept.bounds.accelerator, 5 * GB);

        session.set_config(session.config().clone().with_watermarks(0.4, 0.6));
        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert!(!report.cached);

        let map = pipeline
            .invoke("c", |m| m.placement().and_then(|p| p.map.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(map.bounds().accelerator, 6 * GB);
        assert_eq!(map.accelerator_bytes(), 6 * GB);
        assert_eq!(map.host_bytes(), 2 * GB);
    }

    #[test]
    fn test_checkpoint_change_supersedes_manager() {
        let backend = backend();
        let mut session = session(backend, 0.4, 0.5);
        session.apply(&scenario_pipeline(), &[]);
        let old = session.manager().unwrap().clone();

        let other = ModelPipeline::new("FluxPipeline")
            .with_checkpoint("flux-dev")
            .with_module("transformer", Submodule::placeholder("transformer", "FluxTransformer2DModel", GB, 4));
        session.apply(&other, &[]);
        assert!(!old.is_live());
        assert_eq!(session.manager().unwrap().checkpoint(), "flux-dev");
    }

    #[test]
    fn test_invalid_low_watermark_is_clamped() {
        let pipeline = scenario_pipeline();
        let mut session = session(backend(), 1.5, 0.5);
        assert!(session.apply(&pipeline, &[]).report().is_some());

        let watermarks = session.manager().unwrap().watermarks();
        assert!(watermarks.low > 0.0 && watermarks.low <= 1.0);
        assert!(watermarks.low <= watermarks.high);
    }

    #[test]
    fn test_excluded_pipeline_type_is_skipped() {
        let pipeline = ModelPipeline::new("CogView4Pipeline")
            .with_checkpoint("cogview4")
            .with_module("transformer", Submodule::placeholder("transformer", "CogView4Transformer2DModel", GB, 4));
        let mut session = session(backend(), 0.4, 0.5);

        let outcome = session.apply(&pipeline, &[]);
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::ExcludedPipeline(_))));
        assert!(!pipeline.module("transformer").unwrap().lock().is_hooked());
        assert!(session.manager().is_none());
    }

    #[test]
    fn test_excluded_and_private_names_are_left_alone() {
        let pipeline = scenario_pipeline()
            .with_module("_guidance", Submodule::placeholder("_guidance", "Guider", GB, 1))
            .with_module("vae", Submodule::placeholder("vae", "AutoencoderKL", GB, 2));
        let mut session = session(backend(), 0.4, 0.5);

        let report = session.apply(&pipeline, &["vae"]).report().cloned().unwrap();
        assert_eq!(report.modules, 3);
        assert!(!pipeline.module("_guidance").unwrap().lock().is_hooked());
        assert!(!pipeline.module("vae").unwrap().lock().is_hooked());
    }

    #[test]
    fn test_non_balanced_mode_is_skipped() {
        let pipeline = scenario_pipeline();
        let config = OffloadConfig::default().with_mode(OffloadMode::Model);
        let mut session = OffloadSession::new(config, backend());

        let outcome = session.configure(&pipeline);
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::Mode(OffloadMode::Model))));
        assert!(!pipeline.module("a").unwrap().lock().is_hooked());
    }

    #[test]
    fn test_layer_name_survives_reattach() {
        let pipeline = scenario_pipeline();
        pipeline.module("a").unwrap().lock().set_layer_name("te1");
        let mut session = session(backend(), 0.4, 0.5);

        session.apply(&pipeline, &[]);
        assert_eq!(pipeline.module("a").unwrap().lock().layer_name(), Some("te1"));

        session.set_config(session.config().clone().with_watermarks(0.3, 0.5));
        session.apply(&pipeline, &[]);
        assert_eq!(pipeline.module("a").unwrap().lock().layer_name(), Some("te1"));
    }

    #[test]
    fn test_mode_none_disables_and_keeps_layer_name() {
        let pipeline = scenario_pipeline();
        pipeline.module("c").unwrap().lock().set_layer_name("unet");
        let mut session = session(backend(), 0.4, 0.5);
        session.apply(&pipeline, &[]);
        let old = session.manager().unwrap().clone();

        session.set_config(session.config().clone().with_mode(OffloadMode::None));
        let outcome = session.configure(&pipeline);
        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::Disabled(3))));
        assert!(session.manager().is_none());
        assert!(!old.is_live());

        let c = pipeline.module("c").unwrap();
        let c = c.lock();
        assert!(!c.is_hooked());
        assert_eq!(c.layer_name(), Some("unet"));
    }

    #[test]
    fn test_nested_stages_are_hooked() {
        let pipeline = ModelPipeline::new("StableCascadeCombinedPipeline")
            .with_checkpoint("cascade")
            .with_stage(
                ModelPipeline::new("StableCascadePriorPipeline")
                    .with_module("prior", Submodule::placeholder("prior", "StableCascadeUNet", 2 * GB, 4))
                    .with_module("text_encoder", Submodule::placeholder("text_encoder", "CLIPTextModel", GB, 2)),
            )
            .with_stage(
                ModelPipeline::new("StableCascadeDecoderPipeline")
                    .with_module("decoder", Submodule::placeholder("decoder", "StableCascadeUNet", 3 * GB, 4))
                    .with_module("text_encoder", Submodule::placeholder("text_encoder", "CLIPTextModel", GB, 2)),
            );
        let mut session = session(backend(), 0.4, 0.5);

        let report = session.apply(&pipeline, &[]).report().cloned().unwrap();
        assert_eq!(report.modules, 4);
        assert_eq!(report.total_bytes, 7 * GB);
        for stage in pipeline.stages() {
            for (_, module) in stage.submodules() {
                assert!(module.lock().is_hooked());
            }
        }
        let mut registered = session.manager().unwrap().registered();
        registered.sort();
        assert_eq!(
            registered,
            vec![
                "StableCascadeDecoderPipeline.decoder",
                "StableCascadeDecoderPipeline.text_encoder",
                "StableCascadePriorPipeline.prior",
                "StableCascadePriorPipeline.text_encoder",
            ]
        );
    }

    #[test]
    fn test_forced_eviction_flag_and_offload_dir() {
        let pipeline = ModelPipeline::new("HiDreamImagePipeline")
            .with_checkpoint("hidream-i1")
            .with_family("hidream")
            .with_module("text_encoder_3", Submodule::placeholder("text_encoder_3", "T5EncoderModel", GB, 2))
            .with_module("transformer", Submodule::placeholder("transformer", "HiDreamImageTransformer2DModel", GB, 2));
        let mut session = session(backend(), 0.4, 0.5);
        session.apply(&pipeline, &[]);

        let te = pipeline.module("text_encoder_3").unwrap();
        let te = te.lock();
        assert!(te.forced_eviction());
        assert_eq!(
            te.offload_dir(),
            Some(std::path::Path::new("cache/offload/hidream-i1/text_encoder_3"))
        );
        assert!(!pipeline.module("transformer").unwrap().lock().forced_eviction());
    }

    #[test]
    fn test_apply_time_eviction() {
        let backend = backend();
        let pipeline = scenario_pipeline();
        let mut session = session(backend.clone(), 0.4, 0.5);
        session.apply(&pipeline, &[]);
        pipeline.invoke("b", |_| ()).unwrap();
        assert_eq!(backend.accelerator_used(), 2 * GB);

        // a manager with a lower threshold finds b above it and moves it out
        session.set_config(session.config().clone().with_watermarks(0.1, 0.5));
        session.apply(&pipeline, &[]);
        assert_eq!(backend.accelerator_used(), 0);
        assert_eq!(pipeline.module("b").unwrap().lock().residency(), Residency::Host);
    }

    #[test]
    fn test_out_of_memory_is_contained() {
        let backend = backend();
        let pipeline = scenario_pipeline();
        let mut session = session(backend.clone(), 0.4, 0.5);
        session.apply(&pipeline, &[]);

        let collects = backend.full_collect_count();
        backend.fail_next_transfer("CUDA out of memory. Tried to allocate 512 MiB");
        assert!(pipeline.invoke("a", |_| ()).is_ok());
        assert_eq!(backend.full_collect_count(), collects + 1);

        // the next invocation retries placement
        let residency = pipeline.invoke("a", |m| m.residency()).unwrap();
        assert_eq!(residency, Residency::Accelerator);
    }

    #[test]
    fn test_benign_failure_is_ignored() {
        let backend = backend();
        let pipeline = scenario_pipeline();
        let mut session = session(backend.clone(), 0.4, 0.5);
        session.apply(&pipeline, &[]);

        let collects = backend.full_collect_count();
        backend.fail_next_transfer("bitsandbytes: params cannot be moved");
        assert!(pipeline.invoke("b", |_| ()).is_ok());
        assert_eq!(backend.full_collect_count(), collects);
    }

    #[test]
    fn test_qualified_device_strings() {
        let backend = Arc::new(SimulatedBackend::new(10 * GB, 64 * GB).with_device_type("privateuseone", false));
        let pipeline = scenario_pipeline();
        let mut session = session(backend, 0.4, 0.5);
        session.apply(&pipeline, &[]);

        let first = pipeline
            .invoke("c", |m| m.placement().and_then(|p| p.map.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(
            first.target_for("blocks.0.weight"),
            Some(&MapTarget::Qualified("privateuseone:0".to_string()))
        );
    }

    #[test]
    fn test_large_family_detection() {
        assert!(is_large_family("flux"));
        assert!(is_large_family("HiDream"));
        assert!(is_large_family("wanvideo"));
        assert!(!is_large_family("sdxl"));
        assert!(is_forced(Some("hidream"), "text_encoder_2"));
        assert!(!is_forced(Some("sdxl"), "text_encoder"));
        assert!(!is_forced(None, "text_encoder"));
    }

    #[test]
    fn test_random_invocations_stay_within_capacity() {
        const MB: u64 = 1 << 20;
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..50 {
            let capacity = rng.random_range(64..512u64) * MB;
            let backend = Arc::new(SimulatedBackend::new(capacity, 16 * capacity));
            let low = rng.random_range(1..10u32) as f64 / 10.0;
            let high = rng.random_range(1..10u32) as f64 / 10.0;
            let mut session = session(backend.clone(), low, high);

            let count = rng.random_range(2..6usize);
            let mut pipeline = ModelPipeline::new("RandomPipeline").with_checkpoint("random");
            let mut sizes = Vec::new();
            for i in 0..count {
                let size = rng.random_range(1..capacity / MB) * MB;
                let name = format!("m{}", i);
                pipeline.add_module(name.clone(), Submodule::placeholder(name, "Block", size, 4));
                sizes.push(size);
            }
            session.apply(&pipeline, &[]);
            let low = session.manager().unwrap().watermarks().low;
            let largest = sizes.iter().copied().max().unwrap_or(0);

            for _ in 0..20 {
                let name = format!("m{}", rng.random_range(0..count));
                let during = pipeline.invoke(&name, |_| backend.accelerator_used()).unwrap();
                let after = backend.accelerator_used();
                assert!(during <= capacity);
                assert!(during <= (low * capacity as f64).ceil() as u64 + largest);
                assert!(after as f64 / capacity as f64 <= low, "occupancy {} above low {}", after, low);
            }
        }
    }
}
