use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};

use crate::config::LearnerError;

/// Name-to-scalar mapping returned by evaluation. Always contains `loss`
/// and `perplexity`.
pub type MetricsReport = BTreeMap<String, f64>;

/// A named metric evaluated per validation batch on `(logits, labels)` and
/// averaged over the validation pass.
pub struct Metric {
    name: String,
    compute: MetricFn,
}

type MetricFn = Box<dyn Fn(&Tensor, &Tensor) -> Result<f64, LearnerError> + Send + Sync>;

impl Metric {
    pub fn new(
        name: impl Into<String>,
        compute: impl Fn(&Tensor, &Tensor) -> Result<f64, LearnerError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            compute: Box::new(compute),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<f64, LearnerError> {
        (self.compute)(logits, labels)
    }
}

/// Fraction of live label positions where the argmax prediction recovers
/// the label.
pub fn masked_accuracy() -> Metric {
    Metric::new("masked_accuracy", |logits, labels| {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(LearnerError::runtime(
                "masked_accuracy expects logits with at least two dimensions",
            ));
        }
        let vocab_size = dims[dims.len() - 1];
        let token_count: usize = dims[..dims.len() - 1].iter().product();

        let predictions = logits
            .reshape((token_count, vocab_size))
            .map_err(to_runtime_error)?
            .argmax(D::Minus1)
            .map_err(to_runtime_error)?
            .to_dtype(DType::I64)
            .map_err(to_runtime_error)?;
        let labels = labels
            .reshape((token_count,))
            .map_err(to_runtime_error)?
            .to_dtype(DType::I64)
            .map_err(to_runtime_error)?;

        let valid = labels
            .ge(0i64)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let live = valid
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)? as f64;
        if live == 0.0 {
            return Ok(0.0);
        }

        let hits = predictions
            .eq(&labels)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let hits = (&hits * &valid).map_err(to_runtime_error)?;
        let correct = hits
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)? as f64;

        Ok(correct / live)
    })
}

/// Running mean of validation loss and per-metric scores over a pass.
#[derive(Debug, Default)]
pub struct EvaluationAccumulator {
    loss_sum: f64,
    batches: usize,
    metric_sums: BTreeMap<String, f64>,
}

impl EvaluationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: f64, metric_values: &[(String, f64)]) {
        self.loss_sum += loss;
        self.batches += 1;
        for (name, value) in metric_values {
            *self.metric_sums.entry(name.clone()).or_insert(0.0) += value;
        }
    }

    /// Produces the final report, or `None` when no batches were seen.
    /// `perplexity` is exactly `exp` of the mean loss.
    pub fn finalize(self) -> Option<MetricsReport> {
        if self.batches == 0 {
            return None;
        }
        let mean_loss = self.loss_sum / self.batches as f64;
        let mut report = MetricsReport::new();
        report.insert("loss".to_string(), mean_loss);
        report.insert("perplexity".to_string(), mean_loss.exp());
        for (name, sum) in self.metric_sums {
            report.insert(name, sum / self.batches as f64);
        }
        Some(report)
    }
}

fn to_runtime_error(err: candle_core::Error) -> LearnerError {
    LearnerError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn accumulator_reports_exact_perplexity() {
        let mut acc = EvaluationAccumulator::new();
        acc.update(1.0, &[]);
        acc.update(3.0, &[]);
        let report = acc.finalize().unwrap();
        assert_eq!(report["loss"], 2.0);
        assert_eq!(report["perplexity"], 2.0f64.exp());
    }

    #[test]
    fn accumulator_averages_custom_metrics() {
        let mut acc = EvaluationAccumulator::new();
        acc.update(0.5, &[("masked_accuracy".to_string(), 0.25)]);
        acc.update(0.5, &[("masked_accuracy".to_string(), 0.75)]);
        let report = acc.finalize().unwrap();
        assert_eq!(report["masked_accuracy"], 0.5);
        assert!(report.contains_key("loss"));
        assert!(report.contains_key("perplexity"));
    }

    #[test]
    fn empty_pass_yields_no_report() {
        assert!(EvaluationAccumulator::new().finalize().is_none());
    }

    #[test]
    fn masked_accuracy_counts_only_live_positions() {
        let device = Device::Cpu;
        // Position 0 predicts token 1 (correct), position 1 predicts token 0
        // against label 2 (wrong), position 2 is ignored.
        let raw = vec![
            0.0f32, 5.0, 0.0, //
            5.0, 0.0, 0.0, //
            5.0, 0.0, 0.0,
        ];
        let logits = Tensor::from_slice(&raw, (1, 3, 3), &device).unwrap();
        let labels = Tensor::from_slice(&[1i64, 2, -100], (1, 3), &device).unwrap();
        let metric = masked_accuracy();
        let value = metric.compute(&logits, &labels).unwrap();
        assert!((value - 0.5).abs() < 1e-9);
    }
}
