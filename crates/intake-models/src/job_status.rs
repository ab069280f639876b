//! Processing stages of a single received envelope.

use serde::{Deserialize, Serialize};

/// Where an in-flight envelope is in its lifecycle.
///
/// Success path: `Received -> FetchingArtifact -> Analyzing -> Acknowledged`.
/// A failure moves to `Failed` (left for redelivery) or `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    #[default]
    Received,
    FetchingArtifact,
    Analyzing,
    Acknowledged,
    Failed,
    DeadLettered,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Received => "received",
            ProcessingStage::FetchingArtifact => "fetching_artifact",
            ProcessingStage::Analyzing => "analyzing",
            ProcessingStage::Acknowledged => "acknowledged",
            ProcessingStage::Failed => "failed",
            ProcessingStage::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(ProcessingStage::default(), ProcessingStage::Received);
        assert_eq!(ProcessingStage::FetchingArtifact.to_string(), "fetching_artifact");
        assert_eq!(
            serde_json::to_value(ProcessingStage::DeadLettered).unwrap(),
            "dead_lettered"
        );
    }
}
