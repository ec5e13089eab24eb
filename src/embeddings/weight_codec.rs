//! Embedding checkpoint files
//!
//! The file extension picks a codec from a closed registry:
//! `.safetensors` files hold a safetensors archive with a single `emb_params`
//! tensor, every other extension holds a JSON record mapping `emb_params` to
//! `{dtype, shape, data}` with the raw little-endian bytes. Legacy files that
//! nest the tensors under `string_to_param` load too, as do PyTorch zip
//! archives written by other trainers.

use candle_core::{DType, Device, Tensor};
use log::{debug, info};
use safetensors::tensor::TensorView;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::{InversionError, Result};

/// Key of the learned rows in every checkpoint
pub const EMBEDDING_KEY: &str = "emb_params";
/// Sub-mapping used by web UI embedding files
pub const LEGACY_PARAM_KEY: &str = "string_to_param";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

type EncodeFn = fn(&[(&str, &Tensor)]) -> Result<Vec<u8>>;
type DecodeFn = fn(&Path, &[u8]) -> Result<Tensor>;

/// Encoder/decoder pair registered for one file convention
struct Codec {
    encode: EncodeFn,
    decode: DecodeFn,
}

const SAFETENSORS_CODEC: Codec = Codec {
    encode: encode_safetensors,
    decode: decode_safetensors,
};

const RECORD_CODEC: Codec = Codec {
    encode: encode_record,
    decode: decode_record,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    SafeTensors,
    Record,
}

impl WeightFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => WeightFormat::SafeTensors,
            _ => WeightFormat::Record,
        }
    }

    fn codec(self) -> &'static Codec {
        match self {
            WeightFormat::SafeTensors => &SAFETENSORS_CODEC,
            WeightFormat::Record => &RECORD_CODEC,
        }
    }
}

/// Write `[K, D]` rows under `emb_params`, cast to `dtype` when given
pub fn save_weights(path: &Path, embeddings: &Tensor, dtype: Option<DType>) -> Result<()> {
    let tensor = match dtype {
        Some(dtype) => embeddings.to_dtype(dtype)?,
        None => embeddings.clone(),
    };
    let tensor = tensor.to_device(&Device::Cpu)?;

    let format = WeightFormat::from_path(path);
    let bytes = (format.codec().encode)(&[(EMBEDDING_KEY, &tensor)])?;
    atomic_write(path, &bytes)?;

    info!(
        "Saved {:?} embeddings ({:?}) to {}",
        tensor.dims(),
        tensor.dtype(),
        path.display()
    );
    Ok(())
}

/// Read the learned rows back as a `[K, D]` tensor on the CPU
pub fn load_weights(path: &Path) -> Result<Tensor> {
    if !path.is_file() {
        return Err(InversionError::WeightFileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;

    let format = WeightFormat::from_path(path);
    let tensor = (format.codec().decode)(path, &bytes)?;

    let tensor = match tensor.rank() {
        1 => tensor.unsqueeze(0)?,
        2 => tensor,
        rank => {
            return Err(invalid(
                path,
                format!("expected a rank 1 or 2 tensor, found rank {}", rank),
            ))
        }
    };
    debug!("Loaded {:?} embeddings from {}", tensor.dims(), path.display());
    Ok(tensor)
}

/// Safetensors archive of several named tensors, used for training state
pub(crate) fn save_named_tensors(path: &Path, tensors: &[(&str, &Tensor)]) -> Result<()> {
    let bytes = encode_safetensors(tensors)?;
    atomic_write(path, &bytes)
}

/// Temp file in the target directory, then rename over the target
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("weights");
    let tmp_name = format!(".{}.tmp.{}", name, std::process::id());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> InversionError {
    InversionError::InvalidWeightFile {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match tensor.dtype() {
        DType::F32 => bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec(),
        DType::F16 => bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
        DType::BF16 => bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
        other => return Err(InversionError::UnsupportedDtype(other)),
    };
    Ok(bytes)
}

fn safetensors_dtype(dtype: DType) -> Result<safetensors::Dtype> {
    match dtype {
        DType::F32 => Ok(safetensors::Dtype::F32),
        DType::F16 => Ok(safetensors::Dtype::F16),
        DType::BF16 => Ok(safetensors::Dtype::BF16),
        other => Err(InversionError::UnsupportedDtype(other)),
    }
}

fn encode_safetensors(tensors: &[(&str, &Tensor)]) -> Result<Vec<u8>> {
    // Collect the bytes first, the views borrow them
    let mut tensor_data = Vec::with_capacity(tensors.len());
    for (_, tensor) in tensors {
        tensor_data.push(tensor_bytes(tensor)?);
    }

    let mut views = HashMap::new();
    for ((name, tensor), data) in tensors.iter().zip(&tensor_data) {
        views.insert(
            name.to_string(),
            TensorView::new(safetensors_dtype(tensor.dtype())?, tensor.dims().to_vec(), data)?,
        );
    }

    Ok(safetensors::serialize(&views, &None)?)
}

fn decode_safetensors(path: &Path, bytes: &[u8]) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load_buffer(bytes, &Device::Cpu)
        .map_err(|e| invalid(path, e.to_string()))?;

    if let Some(tensor) = tensors.remove(EMBEDDING_KEY) {
        return Ok(tensor);
    }
    let mut keys: Vec<String> = tensors.keys().cloned().collect();
    keys.sort();
    keys.first()
        .and_then(|k| tensors.remove(k))
        .ok_or_else(|| invalid(path, "archive contains no tensors"))
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorRecord {
    dtype: String,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorRecord {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            dtype: tensor.dtype().as_str().to_string(),
            shape: tensor.dims().to_vec(),
            data: tensor_bytes(tensor)?,
        })
    }

    fn to_tensor(&self, path: &Path) -> Result<Tensor> {
        let dtype = match self.dtype.as_str() {
            "f32" => DType::F32,
            "f16" => DType::F16,
            "bf16" => DType::BF16,
            other => return Err(invalid(path, format!("unsupported dtype {:?}", other))),
        };
        let expected = self.shape.iter().product::<usize>() * dtype.size_in_bytes();
        if self.data.len() != expected {
            return Err(invalid(
                path,
                format!(
                    "shape {:?} needs {} bytes, record has {}",
                    self.shape,
                    expected,
                    self.data.len()
                ),
            ));
        }
        Ok(Tensor::from_raw_buffer(
            &self.data,
            dtype,
            &self.shape,
            &Device::Cpu,
        )?)
    }
}

fn encode_record(tensors: &[(&str, &Tensor)]) -> Result<Vec<u8>> {
    let mut map = serde_json::Map::new();
    for (name, tensor) in tensors {
        map.insert(
            name.to_string(),
            serde_json::to_value(TensorRecord::from_tensor(tensor)?)?,
        );
    }
    Ok(serde_json::to_vec(&serde_json::Value::Object(map))?)
}

fn decode_record(path: &Path, bytes: &[u8]) -> Result<Tensor> {
    if bytes.starts_with(ZIP_MAGIC) {
        return decode_torch_archive(path);
    }

    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| invalid(path, e.to_string()))?;
    let serde_json::Value::Object(mut map) = value else {
        return Err(invalid(path, "weight file is not a mapping"));
    };

    if let Some(nested) = map.remove(LEGACY_PARAM_KEY) {
        let serde_json::Value::Object(nested) = nested else {
            return Err(invalid(path, format!("{} is not a mapping", LEGACY_PARAM_KEY)));
        };
        map = nested;
    }

    let first = match map.remove(EMBEDDING_KEY) {
        Some(value) => value,
        None => map
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .ok_or_else(|| invalid(path, "weight file is empty"))?,
    };
    let record: TensorRecord = serde_json::from_value(first)
        .map_err(|_| invalid(path, "weight file does not contain a tensor"))?;
    record.to_tensor(path)
}

/// PyTorch zip archives, read-only
fn decode_torch_archive(path: &Path) -> Result<Tensor> {
    // Web UI files nest the rows under `string_to_param`, plain state dicts do not
    let mut tensors = match candle_core::pickle::read_all_with_key(path, Some(LEGACY_PARAM_KEY)) {
        Ok(tensors) if !tensors.is_empty() => tensors,
        _ => candle_core::pickle::read_all_with_key(path, None)
            .map_err(|e| invalid(path, e.to_string()))?,
    };

    let index = tensors
        .iter()
        .position(|(name, _)| name == EMBEDDING_KEY)
        .unwrap_or(0);
    if tensors.is_empty() {
        return Err(invalid(path, "archive contains no tensors"));
    }
    let (_, tensor) = tensors.swap_remove(index);
    Ok(tensor.to_dtype(match tensor.dtype() {
        DType::F64 => DType::F32,
        other => other,
    })?)
}
