use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint,
    config::{FitConfig, LearnerError, LearnerOptions, Precision},
    data::{LmDataBunch, MaskedBatch},
    logging::{
        ExperimentSink, Logger, LoggingSettings, NoopSink, BATCH_LOSS_CHANNEL, EVAL_LOSS_CHANNEL,
        EVAL_METRIC_PREFIX, LEARNING_RATE_CHANNEL, TRAIN_LOSS_CHANNEL,
    },
    loss::MaskedCrossEntropy,
    metrics::{EvaluationAccumulator, Metric, MetricsReport},
    model::{detect_replicas, DataParallel, ModelConfig},
    optimizer::{
        contains_non_finite, reduced_precision_supported, GradientScaler, LearnerOptimizer,
        OptimizerConfig,
    },
    scheduler::build_scheduler,
};

const MODEL_OUT_DIR: &str = "model_out";
const TENSORBOARD_DIR: &str = "tensorboard";

/// Mutable run counters, separate from the immutable configuration that
/// drives a `fit` call. `global_step` only advances at accumulation
/// boundaries; loss totals accumulate the per-micro-batch (divided) losses.
#[derive(Debug, Default)]
struct Progress {
    global_step: usize,
    epoch_step: usize,
    tr_loss: f64,
    logging_loss: f64,
}

/// Summary returned by [`LmLearner::fit`].
#[derive(Debug, Clone, Copy)]
pub struct FitOutcome {
    pub total_steps: usize,
    pub mean_loss: f64,
}

/// Fine-tuning learner for masked-language-model checkpoints. Owns the
/// model, data bunch, precision scaling state, and run counters; the
/// optimizer and schedule are created per `fit` invocation.
pub struct LmLearner {
    data: LmDataBunch,
    model: DataParallel,
    model_config: ModelConfig,
    varmap: VarMap,
    named_parameters: Vec<(String, Var)>,
    parameter_tensors: Vec<Tensor>,
    device: Device,
    precision: Precision,
    scaler: GradientScaler,
    options: LearnerOptions,
    output_dir: PathBuf,
    loss: MaskedCrossEntropy,
    logger: Logger,
    sink: Arc<dyn ExperimentSink>,
    metrics: Vec<Metric>,
    progress: Progress,
    rng: StdRng,
}

impl LmLearner {
    /// Builds a learner around a pretrained checkpoint directory. The data
    /// bunch supplies the model-type tag, tokenizer, and masking transform;
    /// `options` carries the training-mode flags.
    pub fn from_pretrained(
        data: LmDataBunch,
        pretrained_path: impl AsRef<Path>,
        output_dir: impl Into<PathBuf>,
        metrics: Vec<Metric>,
        device: Device,
        options: LearnerOptions,
        sink: Option<Arc<dyn ExperimentSink>>,
    ) -> Result<Self, LearnerError> {
        let output_dir = output_dir.into();

        let logger = Logger::new(LoggingSettings {
            enable_stdout: options.enable_stdout,
            tensorboard_dir: options
                .tensorboard
                .then(|| output_dir.join(TENSORBOARD_DIR)),
        })?;

        let mut precision = options.precision;
        if precision.requires_scaling() && !reduced_precision_supported(&device) {
            logger.debug("reduced precision unavailable on this runtime; training in fp32");
            precision = Precision::Fp32;
        }
        let dtype = precision_to_dtype(precision);

        let (model_config, model, varmap) = checkpoint::load_pretrained(
            pretrained_path.as_ref(),
            data.model_type(),
            &device,
            dtype,
        )?;

        let mut named_parameters: Vec<(String, Var)> = {
            let guard = varmap
                .data()
                .lock()
                .map_err(|_| LearnerError::runtime("parameter registry lock poisoned"))?;
            guard
                .iter()
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect()
        };
        named_parameters.sort_by(|a, b| a.0.cmp(&b.0));
        if named_parameters.is_empty() {
            return Err(LearnerError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let parameter_tensors = named_parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();

        let replicas = if options.data_parallel {
            detect_replicas(&device)
        } else {
            1
        };
        let model = DataParallel::wrap(model, replicas);

        let scaler = GradientScaler::new(precision);
        let rng = StdRng::seed_from_u64(options.seed);
        let sink = sink.unwrap_or_else(|| Arc::new(NoopSink));

        Ok(Self {
            data,
            model,
            model_config,
            varmap,
            named_parameters,
            parameter_tensors,
            device,
            precision,
            scaler,
            options,
            output_dir,
            loss: MaskedCrossEntropy::new(),
            logger,
            sink,
            metrics,
            progress: Progress::default(),
            rng,
        })
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn mixed_precision(&self) -> bool {
        self.scaler.is_enabled()
    }

    pub fn global_step(&self) -> usize {
        self.progress.global_step
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn replicas(&self) -> usize {
        self.model.replicas()
    }

    /// Named parameters in deterministic (sorted) order.
    pub fn named_parameters(&self) -> &[(String, Var)] {
        &self.named_parameters
    }

    /// Runs the full fine-tuning loop and returns the optimizer step count
    /// plus the mean (accumulation-divided) training loss.
    pub fn fit(&mut self, fit: &FitConfig) -> Result<FitOutcome, LearnerError> {
        if fit.epochs == 0 {
            return Err(LearnerError::initialization("fit requires epochs > 0"));
        }

        let accumulation = self.options.grad_accumulation_steps.max(1);
        let batches_per_epoch = self.data.train_batches();
        if batches_per_epoch == 0 {
            return Err(LearnerError::initialization(
                "training set yields no full batches",
            ));
        }
        let steps_per_epoch = batches_per_epoch / accumulation;

        // Total optimizer steps are fixed ahead of the loop and handed to
        // the schedule; with a max-steps override the final partial epoch
        // still runs to completion.
        let (t_total, epochs) = match self.options.max_steps {
            Some(max_steps) => (max_steps, max_steps / steps_per_epoch.max(1) + 1),
            None => (steps_per_epoch * fit.epochs, fit.epochs),
        };

        let optimizer_config =
            OptimizerConfig::from_options(fit.optimizer, fit.learning_rate, &self.options)?;
        let mut optimizer = LearnerOptimizer::new(&self.named_parameters, optimizer_config)?;
        let mut scheduler = build_scheduler(
            fit.schedule,
            fit.learning_rate,
            self.options.warmup_steps,
            t_total,
        )?;

        self.logger.log_fit_start(
            self.data.train_examples(),
            epochs,
            self.data.train_batch_size() * accumulation,
            accumulation,
            t_total,
        );

        self.progress = Progress::default();
        let mut accumulated: Option<GradStore> = None;

        for epoch in 0..epochs {
            self.progress.epoch_step = 0;
            let mut epoch_loss = 0.0f64;
            let order = self
                .data
                .train_order(self.options.seed.wrapping_add(epoch as u64));

            for step in 0..batches_per_epoch {
                let batch = self.data.train_batch(&order, step)?;
                let loss = self.training_step(&batch, accumulation, &mut accumulated)?;
                self.progress.tr_loss += loss;
                epoch_loss += loss;

                drop(batch);
                reclaim_device_memory(&self.device);

                if (step + 1) % accumulation != 0 {
                    continue;
                }
                let Some(mut grads) = accumulated.take() else {
                    continue;
                };

                self.clip_gradients(&mut grads, self.options.max_grad_norm)?;

                let mut found_inf = false;
                if self.scaler.is_enabled() {
                    found_inf = self.unscale_gradients(&mut grads)?;
                    self.scaler.update(found_inf);
                }

                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
                // A non-finite window skips the parameter update but still
                // advances the schedule and counters.
                if !found_inf {
                    optimizer.step(&mut grads)?;
                }
                drop(grads);

                self.progress.global_step += 1;
                self.progress.epoch_step += 1;

                let logging_steps = self.options.logging_steps;
                if logging_steps > 0 && self.progress.global_step % logging_steps == 0 {
                    if fit.validate {
                        let report = self.validate()?;
                        self.logger.log_evaluation(self.progress.global_step, &report);
                    }

                    let window_loss = (self.progress.tr_loss - self.progress.logging_loss)
                        / logging_steps as f64;
                    self.logger
                        .log_training_window(self.progress.global_step, lr, window_loss);
                    self.sink
                        .record_scalar(LEARNING_RATE_CHANNEL, self.progress.global_step, lr);
                    self.sink.record_scalar(
                        TRAIN_LOSS_CHANNEL,
                        self.progress.global_step,
                        window_loss,
                    );
                    self.progress.logging_loss = self.progress.tr_loss;
                }
            }

            if self.progress.epoch_step == 0 {
                return Err(LearnerError::runtime(
                    "epoch completed zero optimizer steps; gradient accumulation exceeds the per-epoch batch count",
                ));
            }

            let report = if fit.validate {
                Some(self.validate()?)
            } else {
                None
            };
            let epoch_average = epoch_loss / self.progress.epoch_step as f64;
            self.logger.log_epoch(
                epoch + 1,
                scheduler.learning_rate(),
                epoch_average,
                report.as_ref(),
            );
        }

        self.logger.flush();

        if self.progress.global_step == 0 {
            return Err(LearnerError::runtime(
                "training produced no optimizer steps",
            ));
        }
        Ok(FitOutcome {
            total_steps: self.progress.global_step,
            mean_loss: self.progress.tr_loss / self.progress.global_step as f64,
        })
    }

    /// One forward/backward pass over a raw batch: applies the masking
    /// transform, moves tensors to the compute device, averages across
    /// replicas, divides by the accumulation factor, and accumulates
    /// gradients. Never steps the optimizer.
    fn training_step(
        &mut self,
        batch: &Tensor,
        accumulation: usize,
        accumulated: &mut Option<GradStore>,
    ) -> Result<f64, LearnerError> {
        let MaskedBatch { inputs, labels } = self.data.mask_tokens(batch, &mut self.rng)?;
        let inputs = inputs.to_device(&self.device).map_err(to_runtime_error)?;
        let labels = labels.to_device(&self.device).map_err(to_runtime_error)?;

        let loss = self.replica_averaged_loss(&inputs, &labels, true)?;
        let loss_value = scalar_f64(&loss)?;
        self.sink
            .record_scalar(BATCH_LOSS_CHANNEL, self.progress.global_step, loss_value);

        let loss = if accumulation > 1 {
            loss.affine(1.0 / accumulation as f64, 0.0)
                .map_err(to_runtime_error)?
        } else {
            loss
        };

        let scaled = self.scaler.scale(&loss)?;
        let micro_grads = scaled.backward().map_err(to_runtime_error)?;
        match accumulated.as_mut() {
            Some(existing) => self.merge_gradient_store(existing, micro_grads)?,
            None => *accumulated = Some(micro_grads),
        }

        drop(inputs);
        drop(labels);
        reclaim_device_memory(&self.device);

        Ok(loss_value / accumulation as f64)
    }

    fn replica_averaged_loss(
        &self,
        inputs: &Tensor,
        labels: &Tensor,
        training: bool,
    ) -> Result<Tensor, LearnerError> {
        match &self.model {
            DataParallel::Single(model) => {
                let logits = model.forward(inputs, training).map_err(to_runtime_error)?;
                Ok(self.loss.compute(&logits, labels)?.loss)
            }
            DataParallel::Replicated { model, replicas } => {
                let (batch_size, _) = inputs.dims2().map_err(to_runtime_error)?;
                let mut losses = Vec::new();
                for (start, len) in shard_ranges(batch_size, *replicas) {
                    let shard_inputs = inputs.narrow(0, start, len).map_err(to_runtime_error)?;
                    let shard_labels = labels.narrow(0, start, len).map_err(to_runtime_error)?;
                    let logits = model
                        .forward(&shard_inputs, training)
                        .map_err(to_runtime_error)?;
                    losses.push(self.loss.compute(&logits, &shard_labels)?.loss);
                }
                match losses.len() {
                    0 => Err(LearnerError::runtime("batch produced no replica shards")),
                    1 => Ok(losses.remove(0)),
                    _ => Tensor::stack(&losses, 0)
                        .and_then(|stacked| stacked.mean_all())
                        .map_err(to_runtime_error),
                }
            }
        }
    }

    /// No-gradient pass over the held-out set. The raw batch doubles as its
    /// own label; the masking transform is not applied here. Counters are
    /// untouched (`&self`), so back-to-back calls return identical results.
    pub fn validate(&self) -> Result<MetricsReport, LearnerError> {
        self.logger.info("running evaluation");

        let model = self.model.underlying_model();
        let mut accumulator = EvaluationAccumulator::new();

        for index in 0..self.data.val_batches() {
            let batch = self.data.val_batch(index)?;
            let batch = batch.to_device(&self.device).map_err(to_runtime_error)?;
            let labels = batch.to_dtype(DType::I64).map_err(to_runtime_error)?;

            let logits = model.forward(&batch, false).map_err(to_runtime_error)?;
            let output = self.loss.compute(&logits, &labels)?;

            let mut metric_values = Vec::with_capacity(self.metrics.len());
            for metric in &self.metrics {
                metric_values.push((
                    metric.name().to_string(),
                    metric.compute(&logits, &labels)?,
                ));
            }
            accumulator.update(f64::from(output.metrics.average_loss()), &metric_values);

            drop(logits);
            drop(labels);
            drop(batch);
            reclaim_device_memory(&self.device);
        }

        let report = accumulator
            .finalize()
            .ok_or_else(|| LearnerError::runtime("validation produced no batches"))?;

        if let Some(loss) = report.get("loss") {
            self.sink
                .record_scalar(EVAL_LOSS_CHANNEL, self.progress.global_step, *loss);
        }
        for (name, value) in &report {
            if name != "loss" {
                self.sink.record_scalar(
                    &format!("{EVAL_METRIC_PREFIX}{name}"),
                    self.progress.global_step,
                    *value,
                );
            }
        }

        Ok(report)
    }

    /// Persists the model and tokenizer, defaulting to `model_out` under
    /// the output root. Any replica wrapping is unwrapped first; repeated
    /// saves overwrite.
    pub fn save_model(&self, path: Option<&Path>) -> Result<PathBuf, LearnerError> {
        let target = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir.join(MODEL_OUT_DIR));

        let model = self.model.underlying_model();
        checkpoint::save_pretrained(&target, model.config(), &self.varmap, self.data.tokenizer())?;
        Ok(target)
    }

    fn merge_gradient_store(
        &self,
        accumulated: &mut GradStore,
        mut incoming: GradStore,
    ) -> Result<(), LearnerError> {
        for tensor in &self.parameter_tensors {
            if let Some(grad) = incoming.remove(tensor) {
                let combined = if let Some(existing) = accumulated.remove(tensor) {
                    existing.add(&grad).map_err(to_runtime_error)?
                } else {
                    grad
                };
                accumulated.insert(tensor, combined);
            }
        }
        Ok(())
    }

    fn unscale_gradients(&self, grads: &mut GradStore) -> Result<bool, LearnerError> {
        let mut found_inf = false;
        for tensor in &self.parameter_tensors {
            if let Some(grad) = grads.remove(tensor) {
                let unscaled = self.scaler.unscale(&grad)?;
                if !found_inf && contains_non_finite(&unscaled)? {
                    found_inf = true;
                }
                grads.insert(tensor, unscaled);
            }
        }
        Ok(found_inf)
    }

    fn clip_gradients(&self, grads: &mut GradStore, max_norm: f64) -> Result<(), LearnerError> {
        let mut sum_squares = 0.0f64;
        for tensor in &self.parameter_tensors {
            if let Some(grad) = grads.get(tensor) {
                let sq = grad
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?
                    .sqr()
                    .map_err(to_runtime_error)?
                    .sum_all()
                    .map_err(to_runtime_error)?
                    .to_vec0::<f32>()
                    .map_err(to_runtime_error)? as f64;
                sum_squares += sq;
            }
        }

        let total_norm = sum_squares.sqrt();
        if total_norm > max_norm {
            let clip_coef = max_norm / (total_norm + 1e-6);
            for tensor in &self.parameter_tensors {
                if let Some(grad) = grads.remove(tensor) {
                    let clipped = grad.affine(clip_coef, 0.0).map_err(to_runtime_error)?;
                    grads.insert(tensor, clipped);
                }
            }
        }

        Ok(())
    }
}

fn shard_ranges(batch_size: usize, replicas: usize) -> Vec<(usize, usize)> {
    let replicas = replicas.max(1).min(batch_size.max(1));
    let base = batch_size / replicas;
    let remainder = batch_size % replicas;
    let mut ranges = Vec::with_capacity(replicas);
    let mut start = 0;
    for index in 0..replicas {
        let len = base + usize::from(index < remainder);
        if len == 0 {
            continue;
        }
        ranges.push((start, len));
        start += len;
    }
    ranges
}

/// Batch tensors are dropped by ownership before this runs; synchronizing
/// the accelerator is the remaining lever for returning memory promptly.
fn reclaim_device_memory(device: &Device) {
    if !device.is_cpu() {
        let _ = device.synchronize();
    }
}

fn scalar_f64(tensor: &Tensor) -> Result<f64, LearnerError> {
    let value = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(f64::from(value))
}

fn precision_to_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 => DType::F32,
        Precision::Fp16 | Precision::Mixed => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

fn to_runtime_error(err: candle_core::Error) -> LearnerError {
    LearnerError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_cover_the_batch_without_overlap() {
        let ranges = shard_ranges(10, 4);
        assert_eq!(ranges.len(), 4);
        let mut covered = 0;
        let mut expected_start = 0;
        for (start, len) in ranges {
            assert_eq!(start, expected_start);
            expected_start += len;
            covered += len;
        }
        assert_eq!(covered, 10);
    }

    #[test]
    fn shards_never_exceed_batch_rows() {
        let ranges = shard_ranges(2, 8);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges, vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn single_shard_for_single_replica() {
        assert_eq!(shard_ranges(6, 1), vec![(0, 6)]);
    }
}
