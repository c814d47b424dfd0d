use std::f64::consts::PI;

use crate::config::{LearnerError, ScheduleType};

/// Step-based learning-rate schedule. `step` returns the rate to apply for
/// the optimizer step being taken and advances the internal counter.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Builds the schedule selected for a `fit` run. `total_steps` is the
/// optimizer step count computed ahead of the loop; the schedule tolerates
/// being stepped past it (a max-steps override can overshoot by up to one
/// epoch) by clamping decay progress.
pub fn build_scheduler(
    schedule: ScheduleType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> Result<Box<dyn LRScheduler>, LearnerError> {
    if base_lr <= 0.0 {
        return Err(LearnerError::initialization(
            "scheduler requires base learning rate > 0",
        ));
    }
    if total_steps == 0 {
        return Err(LearnerError::initialization(
            "scheduler requires total_steps greater than zero",
        ));
    }
    let warmup_steps = warmup_steps.min(total_steps);

    let scheduler: Box<dyn LRScheduler> = match schedule {
        ScheduleType::WarmupConstant => {
            Box::new(WarmupConstant::new(base_lr, warmup_steps))
        }
        ScheduleType::WarmupLinear => {
            Box::new(WarmupLinear::new(base_lr, warmup_steps, total_steps))
        }
        ScheduleType::WarmupCosine => Box::new(WarmupCosine::new(
            base_lr,
            warmup_steps,
            total_steps,
            1.0,
            false,
        )),
        ScheduleType::WarmupCosineHardRestarts => Box::new(WarmupCosine::new(
            base_lr,
            warmup_steps,
            total_steps,
            1.0,
            true,
        )),
    };
    Ok(scheduler)
}

fn warmup_lr(base_lr: f64, step: usize, warmup_steps: usize) -> Option<f64> {
    if warmup_steps > 0 && step < warmup_steps {
        let progress = (step + 1) as f64 / warmup_steps as f64;
        Some(base_lr * progress)
    } else {
        None
    }
}

fn decay_progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let denom = total_steps.saturating_sub(warmup_steps).max(1) as f64;
    let effective = step.saturating_sub(warmup_steps) as f64;
    (effective / denom).clamp(0.0, 1.0)
}

struct WarmupConstant {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupConstant {
    fn new(base_lr: f64, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            step: 0,
            current_lr: 0.0,
        }
    }
}

impl LRScheduler for WarmupConstant {
    fn step(&mut self) -> f64 {
        let lr = warmup_lr(self.base_lr, self.step, self.warmup_steps).unwrap_or(self.base_lr);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

struct WarmupLinear {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupLinear {
    fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps: total_steps.max(1),
            step: 0,
            current_lr: 0.0,
        }
    }
}

impl LRScheduler for WarmupLinear {
    fn step(&mut self) -> f64 {
        let lr = warmup_lr(self.base_lr, self.step, self.warmup_steps).unwrap_or_else(|| {
            let progress = decay_progress(self.step, self.warmup_steps, self.total_steps);
            self.base_lr * (1.0 - progress)
        });
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

struct WarmupCosine {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    cycles: f64,
    hard_restarts: bool,
    step: usize,
    current_lr: f64,
}

impl WarmupCosine {
    fn new(
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
        cycles: f64,
        hard_restarts: bool,
    ) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps: total_steps.max(1),
            cycles: if cycles <= 0.0 { 1.0 } else { cycles },
            hard_restarts,
            step: 0,
            current_lr: 0.0,
        }
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if let Some(lr) = warmup_lr(self.base_lr, step, self.warmup_steps) {
            return lr;
        }
        let progress = decay_progress(step, self.warmup_steps, self.total_steps);
        let cosine = if self.hard_restarts {
            if progress >= 1.0 {
                0.0
            } else {
                // Each cycle restarts from the peak rate.
                let cycle_progress = (self.cycles * progress).fract();
                0.5 * (1.0 + f64::cos(PI * cycle_progress))
            }
        } else {
            0.5 * (1.0 + f64::cos(PI * progress))
        };
        (self.base_lr * cosine).max(0.0)
    }
}

impl LRScheduler for WarmupCosine {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
