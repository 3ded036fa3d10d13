//! The container lifecycle state machine.
//!
//! Monotone: `Born -> Active -> Stopped -> Destroyed`, with
//! `Active -> Destroyed` also allowed. `Destroyed` is terminal. A
//! proper enum rather than a bare string so invalid states are
//! unrepresentable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Born,
    Active,
    Stopped,
    Destroyed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Born => "born",
            ContainerState::Active => "active",
            ContainerState::Stopped => "stopped",
            ContainerState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
