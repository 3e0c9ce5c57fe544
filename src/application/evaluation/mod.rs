pub mod conditions;
pub mod evaluator;
pub mod filters;
pub mod scheduler;
pub mod sizing;
pub mod sltp;

pub use evaluator::{EvaluationOutcome, StrategyEvaluator};
pub use scheduler::{EvaluationScheduler, default_concurrency};
