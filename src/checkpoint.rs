use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, DType, Device};
use candle_nn::{VarBuilder, VarMap};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokenizers::Tokenizer;

use crate::{
    config::LearnerError,
    model::{MaskedLmModel, ModelConfig, ModelType},
};

pub const MODEL_FILENAME: &str = "model.safetensors";
pub const CONFIG_FILENAME: &str = "config.json";
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedModelManifest {
    pub model_type: String,
    pub created_unix_timestamp: u64,
    pub files: Vec<FileRecord>,
}

/// Persists model weights, model config, and tokenizer artifacts to `dir`,
/// creating it if absent. Repeated calls overwrite in place.
pub fn save_pretrained(
    dir: &Path,
    config: &ModelConfig,
    varmap: &VarMap,
    tokenizer: &Tokenizer,
) -> Result<(), LearnerError> {
    fs::create_dir_all(dir).map_err(|err| {
        LearnerError::runtime(format!(
            "failed to create model directory {}: {err}",
            dir.display()
        ))
    })?;

    let model_path = dir.join(MODEL_FILENAME);
    varmap.save(&model_path).map_err(|err| {
        LearnerError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            model_path.display()
        ))
    })?;

    let config_path = dir.join(CONFIG_FILENAME);
    write_json(&config_path, config)?;

    let tokenizer_path = dir.join(TOKENIZER_FILENAME);
    tokenizer.save(&tokenizer_path, true).map_err(|err| {
        LearnerError::runtime(format!(
            "failed to save tokenizer to {}: {err}",
            tokenizer_path.display()
        ))
    })?;

    let manifest = SavedModelManifest {
        model_type: config.model_type.to_string(),
        created_unix_timestamp: unix_timestamp(),
        files: vec![
            file_record(&model_path)?,
            file_record(&config_path)?,
            file_record(&tokenizer_path)?,
        ],
    };
    write_json(&dir.join(MANIFEST_FILENAME), &manifest)?;

    Ok(())
}

/// Loads a checkpoint directory into a fresh model: reads `config.json`,
/// assembles the model over a new `VarMap`, then overwrites every variable
/// from `model.safetensors`. The returned map backs both the optimizer and
/// later saves.
pub fn load_pretrained(
    dir: &Path,
    model_type: ModelType,
    device: &Device,
    dtype: DType,
) -> Result<(ModelConfig, MaskedLmModel, VarMap), LearnerError> {
    let config_path = dir.join(CONFIG_FILENAME);
    let mut config: ModelConfig = read_json(&config_path)?;
    // The caller's registry tag selects the family, as when picking the
    // model class for a checkpoint path.
    config.model_type = model_type;
    config
        .validate()
        .map_err(|err| LearnerError::initialization(err.to_string()))?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let model = MaskedLmModel::new(config.clone(), vb)
        .map_err(|err| LearnerError::initialization(err.to_string()))?;

    apply_model_weights(&varmap, &dir.join(MODEL_FILENAME), device)?;

    Ok((config, model, varmap))
}

/// Overwrites every variable in `varmap` with the tensor of the same name
/// from a safetensors file, converting dtype where the run precision
/// differs from the stored weights.
pub fn apply_model_weights(
    varmap: &VarMap,
    weights_path: &Path,
    device: &Device,
) -> Result<(), LearnerError> {
    if !weights_path.is_file() {
        return Err(LearnerError::runtime(format!(
            "model weights not found at {}",
            weights_path.display()
        )));
    }
    let tensors = load_safetensors(weights_path, device)
        .map_err(|err| LearnerError::runtime(err.to_string()))?;
    let mut by_name: std::collections::HashMap<_, _> = tensors.into_iter().collect();

    let guard = varmap
        .data()
        .lock()
        .map_err(|_| LearnerError::runtime("parameter registry lock poisoned"))?;
    for (name, var) in guard.iter() {
        let tensor = by_name.remove(name).ok_or_else(|| {
            LearnerError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor
                .to_dtype(desired_dtype)
                .map_err(|err| LearnerError::runtime(err.to_string()))?
        };
        var.set(&tensor)
            .map_err(|err| LearnerError::runtime(err.to_string()))?;
    }
    drop(guard);

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(LearnerError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, LearnerError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            LearnerError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            LearnerError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, LearnerError> {
    let mut file = File::open(path).map_err(|err| {
        LearnerError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            LearnerError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LearnerError> {
    let mut file = File::create(path).map_err(|err| {
        LearnerError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| LearnerError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        LearnerError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| LearnerError::runtime(format!("failed to write {}: {err}", path.display())))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LearnerError> {
    let file = File::open(path).map_err(|err| {
        LearnerError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        LearnerError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = SavedModelManifest {
            model_type: "bert".to_string(),
            created_unix_timestamp: 1,
            files: vec![FileRecord {
                filename: MODEL_FILENAME.to_string(),
                sha256: "00".to_string(),
                bytes: 42,
            }],
        };
        let raw = serde_json::to_string(&manifest).unwrap();
        let parsed: SavedModelManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.model_type, "bert");
        assert_eq!(parsed.files[0].bytes, 42);
    }
}
