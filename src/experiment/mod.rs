//! Experiment driver.
//!
//! Runs every prompt of an attack corpus through the full defense stack a
//! number of times, under either the isolated or the coordinated
//! configuration, and writes a summary report next to the trace database.

mod corpus;
mod runner;

pub use corpus::*;
pub use runner::*;

/// Experiment name recorded in request metadata and summaries.
pub const EXPERIMENT_NAME: &str = "exp5_coordination";

/// The two configurations compared by the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExperimentArm {
    /// Layers run independently.
    Isolated,
    /// Layers share a coordination context.
    Coordinated,
}

impl ExperimentArm {
    pub fn coordination_enabled(&self) -> bool {
        matches!(self, ExperimentArm::Coordinated)
    }

    /// Experiment id traces are filed under (e.g. `exp5_isolated`).
    pub fn experiment_id(&self) -> String {
        format!("exp5_{}", self)
    }

    /// File name of the summary report.
    pub fn summary_file_name(&self) -> String {
        format!("exp5_{}_summary.json", self)
    }
}

impl std::fmt::Display for ExperimentArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentArm::Isolated => write!(f, "isolated"),
            ExperimentArm::Coordinated => write!(f, "coordinated"),
        }
    }
}
