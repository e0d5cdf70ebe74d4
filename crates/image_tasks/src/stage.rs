use serde::{Deserialize, Serialize};
use std::fmt;

/// The stage a dataset, transform or loader is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningStage {
    Training,
    Validating,
    Testing,
    Predicting,
}

impl RunningStage {
    pub const ALL: [RunningStage; 4] = [
        RunningStage::Training,
        RunningStage::Validating,
        RunningStage::Testing,
        RunningStage::Predicting,
    ];

    /// Short name used in logs, CLI output and state dicts.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunningStage::Training => "train",
            RunningStage::Validating => "val",
            RunningStage::Testing => "test",
            RunningStage::Predicting => "predict",
        }
    }
}

impl fmt::Display for RunningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunningStage::Training => "training",
            RunningStage::Validating => "validation",
            RunningStage::Testing => "test",
            RunningStage::Predicting => "predict",
        })
    }
}
