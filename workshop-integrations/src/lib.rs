pub mod ids;

use serde::{Deserialize, Serialize};

/// Lifecycle of one package inside an update batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PackageState {
    Queued,
    Downloading,
    Installing,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl PackageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PackageState::Completed | PackageState::Failed { .. } | PackageState::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            PackageState::Queued => "queued",
            PackageState::Downloading => "downloading",
            PackageState::Installing => "installing",
            PackageState::Completed => "completed",
            PackageState::Failed { .. } => "failed",
            PackageState::Cancelled => "cancelled",
        }
    }
}

/// Payload handed to UI consumers for every state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub mod_id: String,
    #[serde(flatten)]
    pub state: PackageState,
}

impl StateEvent {
    pub fn new(mod_id: impl Into<String>, state: PackageState) -> Self {
        Self {
            mod_id: mod_id.into(),
            state,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
