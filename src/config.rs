use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Construction-time settings for a learner. These are fixed for the
/// lifetime of the learner; per-`fit` parameters live in [`FitConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearnerOptions {
    pub precision: Precision,
    pub data_parallel: bool,
    pub warmup_steps: usize,
    pub grad_accumulation_steps: usize,
    pub max_grad_norm: f64,
    pub adam_epsilon: f64,
    pub weight_decay: f64,
    pub logging_steps: usize,
    pub max_steps: Option<usize>,
    pub seed: u64,
    pub enable_stdout: bool,
    pub tensorboard: bool,
}

impl Default for LearnerOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Mixed,
            data_parallel: true,
            warmup_steps: 0,
            grad_accumulation_steps: 1,
            max_grad_norm: 1.0,
            adam_epsilon: 1e-8,
            weight_decay: 0.0,
            logging_steps: 100,
            max_steps: None,
            seed: 42,
            enable_stdout: true,
            tensorboard: true,
        }
    }
}

/// Immutable parameters for one `fit` invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub validate: bool,
    pub schedule: ScheduleType,
    pub optimizer: OptimizerType,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 5e-5,
            validate: true,
            schedule: ScheduleType::WarmupCosine,
            optimizer: OptimizerType::Lamb,
        }
    }
}

impl FitConfig {
    pub fn new(epochs: usize, learning_rate: f64) -> Self {
        Self {
            epochs,
            learning_rate,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    WarmupConstant,
    WarmupLinear,
    WarmupCosine,
    WarmupCosineHardRestarts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Lamb,
    #[serde(rename = "adamw")]
    AdamW,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Mixed
    }
}

impl Precision {
    /// Reduced-precision modes need loss scaling; full precision does not.
    pub fn requires_scaling(self) -> bool {
        !matches!(self, Precision::Fp32)
    }
}

/// File-based configuration for the `finetune` binary. Relative paths are
/// resolved against the directory containing the config file.
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    pub pretrained_path: PathBuf,
    pub output_dir: PathBuf,
    pub tokenizer_json: PathBuf,
    pub train_files: Vec<PathBuf>,
    #[serde(default)]
    pub validation_files: Vec<PathBuf>,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_val_batch_size")]
    pub val_batch_size: usize,
    #[serde(default = "default_mask_probability")]
    pub mask_probability: f32,
    #[serde(default)]
    pub options: LearnerOptions,
    #[serde(default)]
    pub fit: FitConfig,
}

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LearnerError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: RunConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(LearnerError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LearnerError> {
        let mut errors = Vec::new();

        if self.pretrained_path.as_os_str().is_empty() {
            errors.push("pretrained_path must not be empty".to_string());
        }
        if self.output_dir.as_os_str().is_empty() {
            errors.push("output_dir must not be empty".to_string());
        }
        if self.train_files.is_empty() {
            errors.push("train_files must not be empty".to_string());
        }
        if self.sequence_length == 0 {
            errors.push("sequence_length must be greater than 0".to_string());
        }
        if self.train_batch_size == 0 {
            errors.push("train_batch_size must be greater than 0".to_string());
        }
        if self.val_batch_size == 0 {
            errors.push("val_batch_size must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.mask_probability) {
            errors.push("mask_probability must be in [0, 1)".to_string());
        }
        if self.options.grad_accumulation_steps == 0 {
            errors.push("options.grad_accumulation_steps must be greater than 0".to_string());
        }
        if self.options.max_grad_norm <= 0.0 {
            errors.push("options.max_grad_norm must be greater than 0".to_string());
        }
        if let Some(0) = self.options.max_steps {
            errors.push("options.max_steps must be greater than 0 when set".to_string());
        }
        if self.fit.epochs == 0 {
            errors.push("fit.epochs must be greater than 0".to_string());
        }
        if self.fit.learning_rate <= 0.0 {
            errors.push("fit.learning_rate must be greater than 0".to_string());
        }
        if self.fit.validate && self.validation_files.is_empty() {
            errors.push("validation_files must not be empty when fit.validate is set".to_string());
        }

        if !errors.is_empty() {
            return Err(LearnerError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.pretrained_path, base);
        absolutize_in_place(&mut self.output_dir, base);
        absolutize_in_place(&mut self.tokenizer_json, base);
        for path in self
            .train_files
            .iter_mut()
            .chain(self.validation_files.iter_mut())
        {
            absolutize_in_place(path, base);
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_model_type() -> String {
    "bert".to_string()
}

fn default_sequence_length() -> usize {
    128
}

fn default_train_batch_size() -> usize {
    8
}

fn default_val_batch_size() -> usize {
    16
}

fn default_mask_probability() -> f32 {
    0.15
}

#[derive(Debug)]
pub enum LearnerError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl LearnerError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for LearnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearnerError::Io(err) => write!(f, "i/o failure: {}", err),
            LearnerError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            LearnerError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            LearnerError::Initialization(msg) => {
                write!(f, "learner initialization failed: {}", msg)
            }
            LearnerError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for LearnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LearnerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LearnerError {
    fn from(value: std::io::Error) -> Self {
        LearnerError::Io(value)
    }
}

impl From<toml::de::Error> for LearnerError {
    fn from(value: toml::de::Error) -> Self {
        LearnerError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for LearnerError {
    fn from(value: serde_json::Error) -> Self {
        LearnerError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            pretrained_path = "pretrained/bert-base"
            output_dir = "out"
            tokenizer_json = "pretrained/bert-base/tokenizer.json"
            train_files = ["data/train.txt"]
            validation_files = ["data/valid.txt"]

            [options]
            grad_accumulation_steps = 4
            logging_steps = 50

            [fit]
            epochs = 2
            learning_rate = 3e-5
            optimizer = "adamw"
            schedule = "warmup_linear"
        "#;
        let config: RunConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.model_type, "bert");
        assert_eq!(config.sequence_length, 128);
        assert_eq!(config.options.grad_accumulation_steps, 4);
        assert_eq!(config.options.logging_steps, 50);
        assert_eq!(config.fit.epochs, 2);
        assert_eq!(config.fit.optimizer, OptimizerType::AdamW);
        assert_eq!(config.fit.schedule, ScheduleType::WarmupLinear);
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_all_errors() {
        let raw = r#"
            pretrained_path = "p"
            output_dir = "o"
            tokenizer_json = "t.json"
            train_files = []
            sequence_length = 0
            mask_probability = 1.5
        "#;
        let config: RunConfig = toml::from_str(raw).unwrap();
        let err = config.validate().unwrap_err();
        match err {
            LearnerError::Validation(messages) => {
                assert!(messages.len() >= 3, "expected several messages: {messages:?}");
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn fit_defaults_match_entry_point() {
        let fit = FitConfig::default();
        assert_eq!(fit.schedule, ScheduleType::WarmupCosine);
        assert_eq!(fit.optimizer, OptimizerType::Lamb);
        assert!(fit.validate);
    }
}
