use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::config::LearnerError;

/// Label value marking positions that carry no training signal.
pub const IGNORE_INDEX: i64 = -100;

/// Cross entropy over token logits where labels below zero are ignored.
///
/// The masking transform emits [`IGNORE_INDEX`] for every position it left
/// alone, so the loss is averaged over selected positions only. Validation
/// batches carry their own ids as labels, in which case every position is
/// live.
#[derive(Debug, Clone, Default)]
pub struct MaskedCrossEntropy;

impl MaskedCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, LearnerError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(LearnerError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = *dims
            .last()
            .ok_or_else(|| LearnerError::runtime("logits tensor missing vocabulary dimension"))?;
        if vocab_size == 0 {
            return Err(LearnerError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if labels.dims() != token_dims {
            return Err(LearnerError::runtime(
                "label tensor must match logits batch/sequence dimensions",
            ));
        }

        let token_count: usize = token_dims.iter().copied().product();
        if token_count == 0 {
            return Err(LearnerError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .reshape((token_count, vocab_size))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let labels_flat = labels
            .to_device(device)
            .map_err(to_runtime_error)?
            .reshape((token_count,))
            .map_err(to_runtime_error)?
            .to_dtype(DType::I64)
            .map_err(to_runtime_error)?;

        let valid_mask = labels_flat
            .ge(0i64)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        let total_tokens_scalar = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?;
        let total_tokens = total_tokens_scalar.round() as usize;
        if total_tokens == 0 {
            return Err(LearnerError::runtime(
                "no live target tokens remain after masking",
            ));
        }

        // Ignored positions keep a gatherable index; the mask zeroes them out.
        let zeros = labels_flat.zeros_like().map_err(to_runtime_error)?;
        let safe_labels = labels_flat
            .maximum(&zeros)
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?;

        let target_indices = safe_labels.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        let weighted_loss = (&nll * &valid_mask).map_err(to_runtime_error)?;
        let loss_sum = weighted_loss.sum_all().map_err(to_runtime_error)?;
        let average_loss = loss_sum
            .affine(1f64 / total_tokens as f64, 0.0)
            .map_err(to_runtime_error)?;

        let average_loss_value = average_loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        let predictions = logits_flat.argmax(D::Minus1).map_err(to_runtime_error)?;
        let correct = predictions
            .eq(&safe_labels)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let correct = (&correct * &valid_mask).map_err(to_runtime_error)?;
        let correct_tokens = correct
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss: average_loss,
            metrics: LossMetrics {
                average_loss: average_loss_value,
                total_tokens,
                correct_tokens,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
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
    fn uniform_logits_yield_log_vocab() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap();
        let labels = Tensor::from_slice(&[1i64, 2, 3, 4], (1, 4), &device).unwrap();

        let output = MaskedCrossEntropy::new().compute(&logits, &labels).unwrap();
        let expected = (8f32).ln();
        assert!((output.metrics.average_loss() - expected).abs() < 1e-5);
        assert_eq!(output.metrics.total_tokens(), 4);
    }

    #[test]
    fn ignored_positions_do_not_contribute() {
        let device = Device::Cpu;
        // Strongly peaked logits on token 2 for every position.
        let mut raw = vec![0f32; 2 * 4];
        for position in 0..2 {
            raw[position * 4 + 2] = 10.0;
        }
        let logits = Tensor::from_slice(&raw, (1, 2, 4), &device).unwrap();
        let labels = Tensor::from_slice(&[2i64, IGNORE_INDEX], (1, 2), &device).unwrap();

        let output = MaskedCrossEntropy::new().compute(&logits, &labels).unwrap();
        assert_eq!(output.metrics.total_tokens(), 1);
        assert_eq!(output.metrics.correct_tokens(), 1);
        assert!(output.metrics.average_loss() < 0.01);
    }

    #[test]
    fn all_ignored_is_an_error() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels =
            Tensor::from_slice(&[IGNORE_INDEX, IGNORE_INDEX], (1, 2), &device).unwrap();
        assert!(MaskedCrossEntropy::new().compute(&logits, &labels).is_err());
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::from_slice(&[0i64, 1], (1, 2), &device).unwrap();
        assert!(MaskedCrossEntropy::new().compute(&logits, &labels).is_err());
    }
}
