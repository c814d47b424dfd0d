use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{config::LearnerError, metrics::MetricsReport};

/// External experiment-tracking sink. Channel names are fixed by the
/// learner; a run without a tracker installs [`NoopSink`].
pub trait ExperimentSink: Send + Sync {
    fn record_scalar(&self, channel: &str, step: usize, value: f64);
}

/// Sink that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ExperimentSink for NoopSink {
    fn record_scalar(&self, _channel: &str, _step: usize, _value: f64) {}
}

pub const BATCH_LOSS_CHANNEL: &str = "fine_tune/batch_loss";
pub const TRAIN_LOSS_CHANNEL: &str = "fine_tune/train_loss";
pub const LEARNING_RATE_CHANNEL: &str = "fine_tune/learning_rate";
pub const EVAL_LOSS_CHANNEL: &str = "fine_tune/eval_loss";
pub const EVAL_METRIC_PREFIX: &str = "fine_tune/eval_";

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, LearnerError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(dir)?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn stdout_enabled(&self) -> bool {
        self.settings.enable_stdout
    }

    pub fn info(&self, message: impl AsRef<str>) {
        if self.settings.enable_stdout {
            println!("{}", message.as_ref());
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        if self.settings.enable_stdout {
            eprintln!("{}", message.as_ref());
        }
    }

    pub fn log_fit_start(
        &self,
        examples: usize,
        epochs: usize,
        effective_batch: usize,
        accumulation: usize,
        total_steps: usize,
    ) {
        self.info("***** running training *****");
        self.info(format!("  num examples = {}", examples));
        self.info(format!("  num epochs = {}", epochs));
        self.info(format!(
            "  total train batch size (w. accumulation) = {}",
            effective_batch
        ));
        self.info(format!("  gradient accumulation steps = {}", accumulation));
        self.info(format!("  total optimization steps = {}", total_steps));
    }

    /// Windowed training telemetry emitted at logging boundaries.
    pub fn log_training_window(&mut self, step: usize, lr: f64, window_loss: f64) {
        self.info(format!("lr after step {}: {}", step, lr));
        self.info(format!("train_loss after step {}: {}", step, window_loss));
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            let _ = writer.write_scalar("lr", step, lr);
            let _ = writer.write_scalar("loss", step, window_loss);
        }
    }

    pub fn log_evaluation(&mut self, step: usize, report: &MetricsReport) {
        for (name, value) in report {
            self.info(format!("eval_{} after step {}: {}", name, step, value));
            if let Some(writer) = self.tensorboard.as_mut() {
                let _ = writer.write_scalar(&format!("eval_{name}"), step as i64, *value);
            }
        }
    }

    /// End-of-epoch summary; goes to stdout only, matching the cadence of
    /// the event log which is keyed by optimizer step.
    pub fn log_epoch(
        &self,
        epoch: usize,
        lr: f64,
        epoch_loss: f64,
        report: Option<&MetricsReport>,
    ) {
        if let Some(report) = report {
            for (name, value) in report {
                self.info(format!("eval_{} after epoch {}: {}", name, epoch, value));
            }
        }
        self.info(format!("lr after epoch {}: {}", epoch, lr));
        self.info(format!("train_loss after epoch {}: {}", epoch, epoch_loss));
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Minimal TensorBoard event-file writer: length-delimited protobuf records
/// framed with masked crc32 checksums.
struct TensorBoardWriter {
    writer: BufWriter<File>,
}

impl TensorBoardWriter {
    fn create(dir: &Path) -> Result<Self, LearnerError> {
        fs::create_dir_all(dir).map_err(|err| {
            LearnerError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            LearnerError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), LearnerError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![SummaryValue {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };

        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            LearnerError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                LearnerError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), LearnerError> {
        self.writer.flush().map_err(|err| {
            LearnerError::runtime(format!("failed to flush tensorboard file: {err}"))
        })
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "7")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_file_is_created_and_framed() {
        let tmp = std::env::temp_dir().join(format!(
            "bert-finetune-tb-test-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&tmp);

        let mut logger = Logger::new(LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(tmp.clone()),
        })
        .unwrap();
        logger.log_training_window(10, 1e-4, 2.5);
        logger.flush();

        let entries: Vec<_> = fs::read_dir(&tmp).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(entries.len(), 1);
        let contents = fs::read(entries[0].path()).unwrap();
        // Two scalar records, each framed as len(8) + crc(4) + payload + crc(4).
        assert!(contents.len() > 2 * 16);
        let payload_len = u64::from_le_bytes(contents[..8].try_into().unwrap()) as usize;
        assert!(payload_len > 0 && payload_len < contents.len());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn noop_sink_accepts_records() {
        let sink = NoopSink;
        sink.record_scalar(BATCH_LOSS_CHANNEL, 1, 0.5);
    }
}
