use candle_core::{backprop::GradStore, DType, Tensor, Var};

pub mod scaler;

pub use scaler::{contains_non_finite, reduced_precision_supported, GradientScaler};

use crate::config::{LearnerError, LearnerOptions, OptimizerType};

const EPS: f64 = 1e-12;

/// Hyperparameters shared by both update rules; the algorithm tag picks
/// between the plain decoupled-weight-decay update and the layer-wise
/// trust-ratio variant.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    pub algorithm: OptimizerType,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    pub fn from_options(
        algorithm: OptimizerType,
        learning_rate: f64,
        options: &LearnerOptions,
    ) -> Result<Self, LearnerError> {
        if learning_rate <= 0.0 {
            return Err(LearnerError::initialization(
                "optimizer requires learning rate > 0",
            ));
        }
        if options.weight_decay < 0.0 {
            return Err(LearnerError::initialization(
                "optimizer weight decay must be >= 0",
            ));
        }
        Ok(Self {
            algorithm,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: options.adam_epsilon,
            weight_decay: options.weight_decay,
        })
    }
}

/// Optimizer over the learner's named parameters. Moments are kept in fp32;
/// reduced-precision parameters additionally keep an fp32 master copy that
/// receives the update before being cast back.
#[derive(Debug)]
pub struct LearnerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

/// Parameter name suffixes exempt from weight decay, as is conventional for
/// transformer fine-tuning.
const WEIGHT_DECAY_EXCLUDE: [&str; 2] = ["bias", "layer_norm.weight"];

impl LearnerOptimizer {
    pub fn new(
        named_parameters: &[(String, Var)],
        config: OptimizerConfig,
    ) -> Result<Self, LearnerError> {
        if named_parameters.is_empty() {
            return Err(LearnerError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(LearnerError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let apply_weight_decay = !WEIGHT_DECAY_EXCLUDE
                .iter()
                .any(|pattern| name.ends_with(pattern));

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                param: var.clone(),
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Applies one update from the accumulated gradients. Gradients for the
    /// tracked parameters are consumed from the store.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), LearnerError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((idx, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for (idx, grad) in processed {
            let slot = &mut self.params[idx];

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq.affine(1.0 - cfg.beta2, 0.0).map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let adam_step = m_hat.div(&denom).map_err(to_runtime_error)?;

            let base = if let Some(master) = slot.master.as_ref() {
                master.as_tensor().clone()
            } else {
                slot.param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?
            };

            let weight_decay = if slot.apply_weight_decay {
                cfg.weight_decay
            } else {
                0.0
            };

            let next = match cfg.algorithm {
                OptimizerType::AdamW => {
                    let decayed = if weight_decay != 0.0 {
                        base.affine(1.0 - cfg.learning_rate * weight_decay, 0.0)
                            .map_err(to_runtime_error)?
                    } else {
                        base
                    };
                    let update = adam_step
                        .affine(cfg.learning_rate, 0.0)
                        .map_err(to_runtime_error)?;
                    decayed.sub(&update).map_err(to_runtime_error)?
                }
                OptimizerType::Lamb => {
                    let raw_update = if weight_decay != 0.0 {
                        let decay_term =
                            base.affine(weight_decay, 0.0).map_err(to_runtime_error)?;
                        adam_step.add(&decay_term).map_err(to_runtime_error)?
                    } else {
                        adam_step
                    };
                    let weight_norm = tensor_l2_norm(&base)?;
                    let update_norm = tensor_l2_norm(&raw_update)?;
                    let trust_ratio = if weight_norm > 0.0 && update_norm > 0.0 {
                        weight_norm / update_norm
                    } else {
                        1.0
                    };
                    let update = raw_update
                        .affine(cfg.learning_rate * trust_ratio, 0.0)
                        .map_err(to_runtime_error)?;
                    base.sub(&update).map_err(to_runtime_error)?
                }
            };

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, LearnerError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn to_runtime_error(err: candle_core::Error) -> LearnerError {
    LearnerError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_setup() -> (Vec<(String, Var)>, GradStore) {
        let device = Device::Cpu;
        let var = Var::from_tensor(
            &Tensor::from_slice(&[2.0f32, -3.0], (2,), &device).unwrap(),
        )
        .unwrap();
        // loss = sum(w^2), gradient = 2w
        let loss = var
            .as_tensor()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        (vec![("encoder.weight".to_string(), var)], grads)
    }

    fn values(params: &[(String, Var)]) -> Vec<f32> {
        params[0].1.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn adamw_step_moves_against_gradient() {
        let (params, mut grads) = quadratic_setup();
        let before = values(&params);
        let config = OptimizerConfig {
            algorithm: OptimizerType::AdamW,
            learning_rate: 1e-1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let mut optimizer = LearnerOptimizer::new(&params, config).unwrap();
        optimizer.step(&mut grads).unwrap();
        let after = values(&params);
        assert!(after[0] < before[0]);
        assert!(after[1] > before[1]);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn lamb_step_moves_against_gradient() {
        let (params, mut grads) = quadratic_setup();
        let before = values(&params);
        let config = OptimizerConfig {
            algorithm: OptimizerType::Lamb,
            learning_rate: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        };
        let mut optimizer = LearnerOptimizer::new(&params, config).unwrap();
        optimizer.step(&mut grads).unwrap();
        let after = values(&params);
        assert!(after[0] < before[0]);
        assert!(after[1] > before[1]);
    }

    #[test]
    fn missing_gradients_leave_parameters_untouched() {
        let (params, _) = quadratic_setup();
        let (_, mut unrelated_grads) = quadratic_setup();
        let before = values(&params);
        let config = OptimizerConfig {
            algorithm: OptimizerType::AdamW,
            learning_rate: 1e-1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let mut optimizer = LearnerOptimizer::new(&params, config).unwrap();
        optimizer.step(&mut unrelated_grads).unwrap();
        assert_eq!(values(&params), before);
        assert_eq!(optimizer.steps_taken(), 0);
    }

    #[test]
    fn rejects_empty_parameter_list() {
        let config = OptimizerConfig {
            algorithm: OptimizerType::AdamW,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        assert!(LearnerOptimizer::new(&[], config).is_err());
    }
}
