//! Per-parameter device maps for submodules larger than the accelerator budget.

use std::collections::HashMap;

use crate::offload::FormatTable;
use crate::pipeline::{ModuleNode, Submodule, join_path};
use crate::utils::{Location, format_bytes, qualified_device};

/// Maximum bytes a device map may put in each memory domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBounds {
    pub accelerator: u64,
    pub host: u64,
}

/// Where a map entry sends its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapTarget {
    /// Accelerator by plain index
    Accelerator(usize),
    /// Accelerator by fully-qualified device string
    Qualified(String),
    Host,
    Disk,
}

impl MapTarget {
    pub fn location(&self) -> Location {
        match self {
            MapTarget::Accelerator(_) | MapTarget::Qualified(_) => Location::Accelerator,
            MapTarget::Host => Location::Host,
            MapTarget::Disk => Location::Disk,
        }
    }
}

impl std::fmt::Display for MapTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapTarget::Accelerator(index) => write!(f, "{}", index),
            MapTarget::Qualified(device) => f.write_str(device),
            MapTarget::Host => f.write_str("cpu"),
            MapTarget::Disk => f.write_str("disk"),
        }
    }
}

/// Assignment of a submodule's parameters to memory domains.
///
/// Entries are keyed by dotted path; a subtree whose parameters all share a
/// target is stored as one entry for the subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMap {
    entries: Vec<(String, MapTarget)>,
    bounds: MemoryBounds,
    accelerator_bytes: u64,
    host_bytes: u64,
    disk_bytes: u64,
}

impl DeviceMap {
    pub fn entries(&self) -> &[(String, MapTarget)] {
        &self.entries
    }

    /// Budgets this map was built for
    pub fn bounds(&self) -> MemoryBounds {
        self.bounds
    }

    pub fn accelerator_bytes(&self) -> u64 {
        self.accelerator_bytes
    }

    pub fn host_bytes(&self) -> u64 {
        self.host_bytes
    }

    /// Bytes that fit in neither budget and were sent to disk
    pub fn shortfall_bytes(&self) -> u64 {
        self.disk_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target of a parameter path, by longest matching dotted prefix
    pub fn target_for(&self, path: &str) -> Option<&MapTarget> {
        self.entries
            .iter()
            .filter(|(key, _)| {
                key.is_empty()
                    || path == key
                    || (path.starts_with(key.as_str()) && path.as_bytes().get(key.len()) == Some(&b'.'))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, target)| target)
    }

    /// Rewrite plain accelerator indices into `type:index` strings.
    ///
    /// Needed on backends whose device identifiers are not small integers.
    pub fn qualify(&mut self, device_type: &str) {
        for (_, target) in &mut self.entries {
            if let MapTarget::Accelerator(index) = target {
                *target = MapTarget::Qualified(qualified_device(device_type, *index));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Accelerator,
    Host,
    Disk,
}

enum Uniformity {
    Empty,
    Uniform(MapTarget),
    Mixed,
}

/// Greedy packer producing device maps.
pub struct DeviceMapBuilder<'a> {
    formats: &'a FormatTable,
    accelerator_index: usize,
}

impl<'a> DeviceMapBuilder<'a> {
    pub fn new(formats: &'a FormatTable) -> Self {
        Self {
            formats,
            accelerator_index: 0,
        }
    }

    pub fn with_accelerator_index(mut self, index: usize) -> Self {
        self.accelerator_index = index;
        self
    }

    /// Build a device map, or `None` when the submodule fits whole.
    ///
    /// Parameters are visited depth-first in declaration order. A single
    /// cursor moves accelerator -> host -> disk and never goes back, so
    /// consecutive layers stay on the same device. Whatever fits in neither
    /// budget goes to disk and is reported as a shortfall.
    pub fn build(&self, module: &Submodule, bounds: MemoryBounds) -> crate::Result<Option<DeviceMap>> {
        let size = self.formats.module_size(module)?;
        if size.bytes <= bounds.accelerator {
            return Ok(None);
        }

        let mut leaves = Vec::new();
        let mut failure = None;
        module.root().visit("", &mut |path, parameter| {
            match self.formats.byte_size(parameter.format(), parameter.element_count()) {
                Ok(bytes) => leaves.push((path.to_string(), bytes)),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        let mut tier = Tier::Accelerator;
        let (mut accelerator_bytes, mut host_bytes, mut disk_bytes) = (0u64, 0u64, 0u64);
        let mut assigned: HashMap<String, MapTarget> = HashMap::with_capacity(leaves.len());

        for (path, bytes) in leaves {
            loop {
                match tier {
                    Tier::Accelerator if accelerator_bytes + bytes <= bounds.accelerator => {
                        accelerator_bytes += bytes;
                        assigned.insert(path, MapTarget::Accelerator(self.accelerator_index));
                        break;
                    }
                    Tier::Accelerator => tier = Tier::Host,
                    Tier::Host if host_bytes + bytes <= bounds.host => {
                        host_bytes += bytes;
                        assigned.insert(path, MapTarget::Host);
                        break;
                    }
                    Tier::Host => tier = Tier::Disk,
                    Tier::Disk => {
                        disk_bytes += bytes;
                        assigned.insert(path, MapTarget::Disk);
                        break;
                    }
                }
            }
        }

        if disk_bytes > 0 {
            tracing::warn!(
                "Offload: type=balanced op=map module={} shortfall={} accelerator={} host={}",
                module.name(),
                format_bytes(disk_bytes),
                format_bytes(bounds.accelerator),
                format_bytes(bounds.host)
            );
        }

        let mut entries = Vec::new();
        emit_entries(module.root(), "", &assigned, &mut entries);

        tracing::debug!(
            "Offload: type=balanced op=map module={} entries={} accelerator={} host={}",
            module.name(),
            entries.len(),
            format_bytes(accelerator_bytes),
            format_bytes(host_bytes)
        );

        Ok(Some(DeviceMap {
            entries,
            bounds,
            accelerator_bytes,
            host_bytes,
            disk_bytes,
        }))
    }
}

fn uniformity(node: &ModuleNode, prefix: &str, assigned: &HashMap<String, MapTarget>) -> Uniformity {
    let mut found: Option<&MapTarget> = None;
    for parameter in node.parameters() {
        let target = &assigned[&join_path(prefix, parameter.name())];
        match found {
            Some(existing) if existing != target => return Uniformity::Mixed,
            _ => found = Some(target),
        }
    }
    let mut result = match found {
        Some(target) => Uniformity::Uniform(target.clone()),
        None => Uniformity::Empty,
    };
    for child in node.children() {
        let child_state = uniformity(child, &join_path(prefix, child.name()), assigned);
        result = match (result, child_state) {
            (Uniformity::Mixed, _) | (_, Uniformity::Mixed) => return Uniformity::Mixed,
            (state, Uniformity::Empty) => state,
            (Uniformity::Empty, state) => state,
            (Uniformity::Uniform(a), Uniformity::Uniform(b)) if a == b => Uniformity::Uniform(a),
            _ => return Uniformity::Mixed,
        };
    }
    result
}

fn emit_entries(
    node: &ModuleNode,
    prefix: &str,
    assigned: &HashMap<String, MapTarget>,
    out: &mut Vec<(String, MapTarget)>,
) {
    if !prefix.is_empty() {
        match uniformity(node, prefix, assigned) {
            Uniformity::Empty => return,
            Uniformity::Uniform(target) => {
                out.push((prefix.to_string(), target));
                return;
            }
            Uniformity::Mixed => {}
        }
    }
    for parameter in node.parameters() {
        let path = join_path(prefix, parameter.name());
        let target = assigned[&path].clone();
        out.push((path, target));
    }
    for child in node.children() {
        emit_entries(child, &join_path(prefix, child.name()), assigned, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offload::NumericFormat;
    use crate::pipeline::Parameter;
    use rand::prelude::*;

    const GB: u64 = 1 << 30;

    #[test]
    fn test_fits_whole_returns_none() {
        let formats = FormatTable::default();
        let module = Submodule::placeholder("a", "A", 3 * GB, 6);
        let bounds = MemoryBounds { accelerator: 5 * GB, host: 16 * GB };
        assert!(DeviceMapBuilder::new(&formats).build(&module, bounds).unwrap().is_none());
    }

    #[test]
    fn test_split_respects_budgets() {
        let formats = FormatTable::default();
        let module = Submodule::placeholder("c", "C", 6 * GB, 6);
        let bounds = MemoryBounds { accelerator: 5 * GB, host: 16 * GB };
        let map = DeviceMapBuilder::new(&formats).build(&module, bounds).unwrap().unwrap();

        assert_eq!(map.accelerator_bytes(), 5 * GB);
        assert_eq!(map.host_bytes(), GB);
        assert_eq!(map.shortfall_bytes(), 0);
        assert_eq!(map.target_for("blocks.0.weight"), Some(&MapTarget::Accelerator(0)));
        assert_eq!(map.target_for("blocks.5.weight"), Some(&MapTarget::Host));
    }

    #[test]
    fn test_shortfall_goes_to_disk() {
        let formats = FormatTable::default();
        let module = Submodule::placeholder("c", "C", 10 * GB, 10);
        let bounds = MemoryBounds { accelerator: 4 * GB, host: 3 * GB };
        let map = DeviceMapBuilder::new(&formats).build(&module, bounds).unwrap().unwrap();

        assert_eq!(map.accelerator_bytes(), 4 * GB);
        assert_eq!(map.host_bytes(), 3 * GB);
        assert_eq!(map.shortfall_bytes(), 3 * GB);
        assert_eq!(map.target_for("blocks.9.weight"), Some(&MapTarget::Disk));
    }

    #[test]
    fn test_compaction_collapses_uniform_subtrees() {
        let formats = FormatTable::default();
        let f32 = NumericFormat::Dtype(candle_core::DType::F32);
        let mut root = ModuleNode::new("unet");
        for block in 0..3 {
            for param in ["weight", "bias"] {
                root.insert(
                    &format!("blocks.{}.{}", block, param),
                    Parameter::meta("", vec![256], f32.clone()),
                );
            }
        }
        let module = Submodule::new("unet", "UNet", root);
        // each block is 2 KB; accelerator holds exactly two blocks
        let bounds = MemoryBounds { accelerator: 4096, host: 1 << 20 };
        let map = DeviceMapBuilder::new(&formats).build(&module, bounds).unwrap().unwrap();

        assert_eq!(
            map.entries(),
            &[
                ("blocks.0".to_string(), MapTarget::Accelerator(0)),
                ("blocks.1".to_string(), MapTarget::Accelerator(0)),
                ("blocks.2".to_string(), MapTarget::Host),
            ]
        );
    }

    #[test]
    fn test_target_for_respects_segment_boundaries() {
        let formats = FormatTable::default();
        let module = Submodule::placeholder("t", "T", 12 * GB, 12);
        let bounds = MemoryBounds { accelerator: 2 * GB, host: 64 * GB };
        let map = DeviceMapBuilder::new(&formats).build(&module, bounds).unwrap().unwrap();

        assert_eq!(map.target_for("blocks.1.weight"), Some(&MapTarget::Accelerator(0)));
        assert_eq!(map.target_for("blocks.10.weight"), Some(&MapTarget::Host));
        assert_eq!(map.target_for("missing.weight"), None);
    }

    #[test]
    fn test_qualify_rewrites_indices() {
        let formats = FormatTable::default();
        let module = Submodule::placeholder("c", "C", 6 * GB, 6);
        let bounds = MemoryBounds { accelerator: 5 * GB, host: 16 * GB };
        let mut map = DeviceMapBuilder::new(&formats)
            .with_accelerator_index(1)
            .build(&module, bounds)
            .unwrap()
            .unwrap();
        map.qualify("privateuseone");

        assert_eq!(
            map.target_for("blocks.0.weight"),
            Some(&MapTarget::Qualified("privateuseone:1".to_string()))
        );
        assert_eq!(map.target_for("blocks.5.weight"), Some(&MapTarget::Host));
        assert_eq!(map.target_for("blocks.0.weight").unwrap().location(), Location::Accelerator);
    }

    #[test]
    fn test_unknown_format_is_an_error() {
        let formats = FormatTable::default();
        let mut root = ModuleNode::new("m");
        root.insert("w", Parameter::meta("", vec![8], NumericFormat::Other("q3".to_string())));
        let module = Submodule::new("m", "M", root);
        let bounds = MemoryBounds { accelerator: 1, host: 1 };
        assert!(DeviceMapBuilder::new(&formats).build(&module, bounds).is_err());
    }

    #[test]
    fn test_random_budgets_property() {
        let formats = FormatTable::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let layers = rng.random_range(1..24usize);
            let total = rng.random_range(1..64u64) * (1 << 20);
            let module = Submodule::placeholder("m", "M", total, layers);
            let bounds = MemoryBounds {
                accelerator: rng.random_range(0..80u64) * (1 << 20),
                host: rng.random_range(0..80u64) * (1 << 20),
            };

            let map = DeviceMapBuilder::new(&formats).build(&module, bounds).unwrap();
            match map {
                None => assert!(total <= bounds.accelerator),
                Some(map) => {
                    assert!(total > bounds.accelerator);
                    assert!(map.accelerator_bytes() <= bounds.accelerator);
                    assert!(map.host_bytes() <= bounds.host);
                    assert_eq!(map.accelerator_bytes() + map.host_bytes() + map.shortfall_bytes(), total);
                    module.root().visit("", &mut |path, _| {
                        assert!(map.target_for(path).is_some(), "unmapped {}", path);
                    });
                }
            }
        }
    }
}
