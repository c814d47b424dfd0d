pub mod checkpoint;
pub mod config;
pub mod data;
pub mod learner;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;

pub use config::{
    FitConfig, LearnerError, LearnerOptions, OptimizerType, Precision, RunConfig, ScheduleType,
};
pub use data::{LmDataBunch, MaskedBatch};
pub use learner::{FitOutcome, LmLearner};
pub use logging::{ExperimentSink, NoopSink};
pub use loss::{MaskedCrossEntropy, IGNORE_INDEX};
pub use metrics::{masked_accuracy, Metric, MetricsReport};
pub use model::{DataParallel, MaskedLmModel, ModelConfig, ModelType};
pub use optimizer::{GradientScaler, LearnerOptimizer};
pub use scheduler::{build_scheduler, LRScheduler};
