//! Byte-width table and per-submodule size memoization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::DType;
use parking_lot::RwLock;

use crate::pipeline::Submodule;

/// Numeric format of a parameter's elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumericFormat {
    /// Any format candle holds natively
    Dtype(DType),
    Int8,
    Int16,
    Int32,
    Bool,
    Float8E4M3,
    Float8E4M3Fnuz,
    Float8E5M2,
    Float8E5M2Fnuz,
    /// 4-bit NormalFloat
    Nf4,
    Int4,
    Fp4,
    /// Format known only by name; needs a registered width
    Other(String),
}

impl NumericFormat {
    /// Stable lowercase name, also the key of the override table
    pub fn key(&self) -> String {
        match self {
            NumericFormat::Dtype(dtype) => dtype.as_str().to_string(),
            NumericFormat::Int8 => "i8".to_string(),
            NumericFormat::Int16 => "i16".to_string(),
            NumericFormat::Int32 => "i32".to_string(),
            NumericFormat::Bool => "bool".to_string(),
            NumericFormat::Float8E4M3 => "f8e4m3".to_string(),
            NumericFormat::Float8E4M3Fnuz => "f8e4m3fnuz".to_string(),
            NumericFormat::Float8E5M2 => "f8e5m2".to_string(),
            NumericFormat::Float8E5M2Fnuz => "f8e5m2fnuz".to_string(),
            NumericFormat::Nf4 => "nf4".to_string(),
            NumericFormat::Int4 => "int4".to_string(),
            NumericFormat::Fp4 => "fp4".to_string(),
            NumericFormat::Other(name) => name.to_lowercase(),
        }
    }

    /// Width in bits from the generic dtype-size table.
    ///
    /// Narrow and quantized formats have no generic width and rely on the
    /// override table.
    pub fn generic_bits(&self) -> Option<u32> {
        match self {
            NumericFormat::Dtype(dtype) => Some(dtype.size_in_bytes() as u32 * 8),
            NumericFormat::Int8 | NumericFormat::Bool => Some(8),
            NumericFormat::Int16 => Some(16),
            NumericFormat::Int32 => Some(32),
            _ => None,
        }
    }

    /// Parse a format name such as `f16`, `bfloat16` or `nf4`
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "f32" | "float32" | "float" => NumericFormat::Dtype(DType::F32),
            "f16" | "float16" | "half" => NumericFormat::Dtype(DType::F16),
            "bf16" | "bfloat16" => NumericFormat::Dtype(DType::BF16),
            "f64" | "float64" | "double" => NumericFormat::Dtype(DType::F64),
            "u8" | "uint8" => NumericFormat::Dtype(DType::U8),
            "u32" | "uint32" => NumericFormat::Dtype(DType::U32),
            "i64" | "int64" => NumericFormat::Dtype(DType::I64),
            "i8" | "int8" => NumericFormat::Int8,
            "i16" | "int16" => NumericFormat::Int16,
            "i32" | "int32" => NumericFormat::Int32,
            "bool" => NumericFormat::Bool,
            "f8e4m3" | "float8_e4m3fn" => NumericFormat::Float8E4M3,
            "f8e4m3fnuz" | "float8_e4m3fnuz" => NumericFormat::Float8E4M3Fnuz,
            "f8e5m2" | "float8_e5m2" => NumericFormat::Float8E5M2,
            "f8e5m2fnuz" | "float8_e5m2fnuz" => NumericFormat::Float8E5M2Fnuz,
            "nf4" => NumericFormat::Nf4,
            "int4" => NumericFormat::Int4,
            "fp4" => NumericFormat::Fp4,
            other => NumericFormat::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for NumericFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Element width table: generic widths plus registered overrides.
#[derive(Debug, Clone)]
pub struct FormatTable {
    overrides: HashMap<String, u32>,
}

impl Default for FormatTable {
    fn default() -> Self {
        let mut table = Self { overrides: HashMap::new() };
        for fp8 in [
            NumericFormat::Float8E4M3,
            NumericFormat::Float8E4M3Fnuz,
            NumericFormat::Float8E5M2,
            NumericFormat::Float8E5M2Fnuz,
        ] {
            table.register(&fp8, 8);
        }
        for four_bit in [NumericFormat::Nf4, NumericFormat::Int4, NumericFormat::Fp4] {
            table.register(&four_bit, 4);
        }
        table
    }
}

impl FormatTable {
    /// Register (or replace) the width of a format in bits
    pub fn register(&mut self, format: &NumericFormat, bits: u32) {
        self.overrides.insert(format.key(), bits);
    }

    /// Builder form of [`FormatTable::register`]
    pub fn with(mut self, format: &NumericFormat, bits: u32) -> Self {
        self.register(format, bits);
        self
    }

    /// Width in bits; overrides win over generic widths
    pub fn bits(&self, format: &NumericFormat) -> crate::Result<u32> {
        self.overrides
            .get(&format.key())
            .copied()
            .or_else(|| format.generic_bits())
            .ok_or_else(|| crate::OffloadError::UnknownFormat(format.key()))
    }

    /// Bytes occupied by `elements` values, rounded up to whole bytes
    pub fn byte_size(&self, format: &NumericFormat, elements: u64) -> crate::Result<u64> {
        let bits = self.bits(format)? as u64;
        Ok((elements * bits).div_ceil(8))
    }

    /// Total bytes and parameter count of a submodule
    pub fn module_size(&self, module: &Submodule) -> crate::Result<SizeEntry> {
        let mut entry = SizeEntry::default();
        let mut failure = None;
        module.root().visit("", &mut |path, parameter| {
            if failure.is_some() {
                return;
            }
            match self.byte_size(parameter.format(), parameter.element_count()) {
                Ok(bytes) => {
                    entry.bytes += bytes;
                    entry.params += parameter.element_count();
                }
                Err(_) => failure = Some(format!("{} (parameter {})", parameter.format(), path)),
            }
        });
        match failure {
            Some(reason) => Err(crate::OffloadError::UnknownFormat(reason)),
            None => Ok(entry),
        }
    }
}

/// Memoized footprint of one submodule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeEntry {
    pub bytes: u64,
    pub params: u64,
}

/// Size and parameter-count cache keyed by submodule name.
///
/// Entries are filled on first request and never evicted for the lifetime
/// of the owning manager.
#[derive(Debug, Default)]
pub struct SizeCache {
    formats: FormatTable,
    entries: RwLock<HashMap<String, SizeEntry>>,
    computations: AtomicUsize,
}

impl SizeCache {
    pub fn new(formats: FormatTable) -> Self {
        Self {
            formats,
            entries: RwLock::new(HashMap::new()),
            computations: AtomicUsize::new(0),
        }
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    /// Cached size of a submodule, computing it on first request.
    ///
    /// A submodule that cannot be sized is cached as zero bytes.
    pub fn size_of(&self, name: &str, module: &Submodule) -> SizeEntry {
        if let Some(entry) = self.get(name) {
            return entry;
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let entry = match self.formats.module_size(module) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!("Offload: type=balanced op=calc module={} {}", name, e);
                SizeEntry::default()
            }
        };
        self.entries.write().entry(name.to_string()).or_insert(entry);
        entry
    }

    pub fn get(&self, name: &str) -> Option<SizeEntry> {
        self.entries.read().get(name).copied()
    }

    /// Number of cached submodules
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sum of all cached sizes
    pub fn total_bytes(&self) -> u64 {
        self.entries.read().values().map(|e| e.bytes).sum()
    }

    /// How many times a size was actually computed
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}
