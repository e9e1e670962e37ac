//! Build submodules from safetensors weight files.

use std::path::Path;

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;

use super::{ModuleNode, Parameter, Submodule};
use crate::offload::NumericFormat;

/// Load a submodule from a `.safetensors` file.
///
/// With `lazy` set only the header is used: parameters carry shape and
/// format but no data, which is all planning needs. Otherwise every tensor
/// is materialized on the CPU.
pub fn load_submodule(
    name: &str,
    class_name: &str,
    path: impl AsRef<Path>,
    lazy: bool,
) -> crate::Result<Submodule> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(crate::OffloadError::WeightsLoad(format!(
            "Weights file not found: {:?}",
            path
        )));
    }

    tracing::debug!("Loading weights file: {:?} lazy={}", path, lazy);

    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };

    let safetensors = SafeTensors::deserialize(&mmap)
        .map_err(|e| crate::OffloadError::WeightsLoad(e.to_string()))?;

    let mut names: Vec<String> = safetensors.names().into_iter().cloned().collect();
    names.sort();

    let mut root = ModuleNode::new(name);
    for tensor_name in names {
        let view = safetensors
            .tensor(&tensor_name)
            .map_err(|e| crate::OffloadError::WeightsLoad(e.to_string()))?;
        let parameter = if lazy {
            Parameter::meta("", view.shape().to_vec(), convert_safetensor_dtype(view.dtype()))
        } else {
            let dtype = candle_dtype(view.dtype())?;
            let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?;
            Parameter::from_tensor("", tensor)
        };
        root.insert(&tensor_name, parameter);
    }

    tracing::debug!("Loaded {} parameters for {}", root.parameter_count(), name);
    Ok(Submodule::new(name, class_name, root))
}

/// Convert safetensor dtype to a numeric format
pub fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> NumericFormat {
    use candle_core::DType;

    match dtype {
        safetensors::Dtype::F16 => NumericFormat::Dtype(DType::F16),
        safetensors::Dtype::BF16 => NumericFormat::Dtype(DType::BF16),
        safetensors::Dtype::F32 => NumericFormat::Dtype(DType::F32),
        safetensors::Dtype::F64 => NumericFormat::Dtype(DType::F64),
        safetensors::Dtype::I64 => NumericFormat::Dtype(DType::I64),
        safetensors::Dtype::U8 => NumericFormat::Dtype(DType::U8),
        safetensors::Dtype::U32 => NumericFormat::Dtype(DType::U32),
        safetensors::Dtype::I8 => NumericFormat::Int8,
        safetensors::Dtype::I16 => NumericFormat::Int16,
        safetensors::Dtype::I32 => NumericFormat::Int32,
        safetensors::Dtype::BOOL => NumericFormat::Bool,
        safetensors::Dtype::F8_E4M3 => NumericFormat::Float8E4M3,
        safetensors::Dtype::F8_E5M2 => NumericFormat::Float8E5M2,
        other => NumericFormat::Other(format!("{:?}", other).to_lowercase()),
    }
}

/// Candle dtype for eager loading; formats candle cannot hold are rejected
fn candle_dtype(dtype: safetensors::Dtype) -> crate::Result<candle_core::DType> {
    match convert_safetensor_dtype(dtype) {
        NumericFormat::Dtype(dtype) => Ok(dtype),
        other => Err(crate::OffloadError::WeightsLoad(format!(
            "Cannot materialize {} tensors, load lazily instead",
            other
        ))),
    }
}
