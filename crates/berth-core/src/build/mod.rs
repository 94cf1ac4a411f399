//! Build stage graphs and their cached execution.

pub mod executor;
pub mod stage;

pub use executor::{
    BuildGraphExecutor, BuildPlan, BuildReport, ExecutorConfig, StageOutcome, StageStatus,
};
pub use stage::BuildStage;
