//! Agent state catalog.

use ai_fsm::StateId;
use serde::{Deserialize, Serialize};

/// Behavioral mode of the agent.
///
/// `Off`, `Manual` and `Auto` are roots; every automated mode is a child of
/// `Auto` and inherits its transitions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Off,
    Manual,
    Auto,
    Idle,
    Moving,
    Following,
    Combat,
    Looting,
    Resting,
    Healing,
    Emergency,
    Escaping,
    Dead,
    Talking,
    Shopping,
    Storing,
}

impl AgentState {
    pub const ALL: [AgentState; 16] = [
        AgentState::Off,
        AgentState::Manual,
        AgentState::Auto,
        AgentState::Idle,
        AgentState::Moving,
        AgentState::Following,
        AgentState::Combat,
        AgentState::Looting,
        AgentState::Resting,
        AgentState::Healing,
        AgentState::Emergency,
        AgentState::Escaping,
        AgentState::Dead,
        AgentState::Talking,
        AgentState::Shopping,
        AgentState::Storing,
    ];

    /// Parse a state from its snake_case name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl StateId for AgentState {
    fn name(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Idle => "idle",
            Self::Moving => "moving",
            Self::Following => "following",
            Self::Combat => "combat",
            Self::Looting => "looting",
            Self::Resting => "resting",
            Self::Healing => "healing",
            Self::Emergency => "emergency",
            Self::Escaping => "escaping",
            Self::Dead => "dead",
            Self::Talking => "talking",
            Self::Shopping => "shopping",
            Self::Storing => "storing",
        }
    }

    fn parent(self) -> Option<Self> {
        match self {
            Self::Off | Self::Manual | Self::Auto => None,
            _ => Some(Self::Auto),
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared priority scale for transitions, tasks and actions.
pub mod priority {
    pub const EMERGENCY: i32 = 100;
    pub const HIGH: i32 = 80;
    pub const NORMAL: i32 = 50;
    pub const LOW: i32 = 20;
    pub const IDLE: i32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automated_modes_live_under_auto() {
        assert!(AgentState::Combat.is_within(AgentState::Auto));
        assert!(!AgentState::Manual.is_within(AgentState::Auto));
        assert_eq!(AgentState::Dead.ancestors(), vec![AgentState::Auto]);
    }

    #[test]
    fn names_round_trip() {
        for state in AgentState::ALL {
            assert_eq!(AgentState::from_name(state.name()), Some(state));
        }
        assert_eq!(AgentState::from_name("nope"), None);
    }
}
