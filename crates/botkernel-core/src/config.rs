//! Agent configuration loading and management.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::state::AgentState;

/// Main agent configuration, loaded from .botkernel/config.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Config version
    pub version: Option<String>,

    /// Tick cadence
    pub tick: TickConfig,

    /// Action queue limits and retry backoff
    pub queue: QueueConfig,

    /// Task manager defaults
    pub tasks: TasksConfig,

    /// State machine settings
    pub state_machine: StateMachineConfig,

    /// Toggles consumed by the default transition table
    pub behavior: BehaviorConfig,

    /// Event log location
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    100
}

/// Action queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Max pending actions before overflow eviction kicks in
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Ticks a dispatched action may wait for its reply before the attempt
    /// counts as failed (0 = wait forever)
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_ticks: u64,

    /// Terminal actions kept for inspection
    #[serde(default = "default_action_history")]
    pub history: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            default_max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            execution_timeout_ticks: default_execution_timeout(),
            history: default_action_history(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    3
}
fn default_execution_timeout() -> u64 {
    300
}
fn default_action_history() -> usize {
    50
}

/// Exponential retry backoff, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_ticks: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,

    #[serde(default = "default_backoff_max")]
    pub max_ticks: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ticks: default_backoff_base(),
            multiplier: default_backoff_multiplier(),
            max_ticks: default_backoff_max(),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempts` (1-based).
    pub fn delay(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        self.base_ticks.saturating_mul(factor).min(self.max_ticks)
    }
}

fn default_backoff_base() -> u64 {
    1
}
fn default_backoff_multiplier() -> u32 {
    2
}
fn default_backoff_max() -> u64 {
    50
}

/// Task manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Timeout applied to tasks that do not set one (`None` = no deadline)
    #[serde(default)]
    pub default_timeout_ticks: Option<u64>,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Root tasks allowed in `running` at once
    #[serde(default = "default_max_running_roots")]
    pub max_running_roots: usize,

    /// Finished root trees kept before pruning
    #[serde(default = "default_task_history")]
    pub history: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_timeout_ticks: None,
            default_max_retries: default_max_retries(),
            max_running_roots: default_max_running_roots(),
            history: default_task_history(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_max_running_roots() -> usize {
    5
}
fn default_task_history() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineConfig {
    #[serde(default)]
    pub initial: AgentState,

    #[serde(default = "default_state_history")]
    pub history: usize,

    /// Install the built-in transition table
    #[serde(default = "default_true")]
    pub default_behaviors: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            initial: AgentState::default(),
            history: default_state_history(),
            default_behaviors: true,
        }
    }
}

fn default_state_history() -> usize {
    100
}
fn default_true() -> bool {
    true
}

/// Behavior toggles, named after the classic bot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_true")]
    pub attack_auto: bool,

    /// Cells within which a monster is considered in reach
    #[serde(default = "default_attack_distance")]
    pub attack_distance: f32,

    #[serde(default = "default_true")]
    pub auto_loot: bool,

    #[serde(default = "default_true")]
    pub sit_auto: bool,

    #[serde(default = "default_true")]
    pub heal_auto: bool,

    #[serde(default)]
    pub teleport_auto: bool,

    /// HP percent below which the agent enters emergency
    #[serde(default = "default_emergency_hp")]
    pub emergency_hp_percent: f32,

    /// HP percent required to leave healing
    #[serde(default = "default_healed_hp")]
    pub healed_hp_percent: f32,

    /// SP percent required to leave healing
    #[serde(default = "default_healed_sp")]
    pub healed_sp_percent: f32,

    /// No monster may be this close before healing starts
    #[serde(default = "default_safe_distance")]
    pub safe_distance: f32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            attack_auto: true,
            attack_distance: default_attack_distance(),
            auto_loot: true,
            sit_auto: true,
            heal_auto: true,
            teleport_auto: false,
            emergency_hp_percent: default_emergency_hp(),
            healed_hp_percent: default_healed_hp(),
            healed_sp_percent: default_healed_sp(),
            safe_distance: default_safe_distance(),
        }
    }
}

fn default_attack_distance() -> f32 {
    1.5
}
fn default_emergency_hp() -> f32 {
    20.0
}
fn default_healed_hp() -> f32 {
    80.0
}
fn default_healed_sp() -> f32 {
    50.0
}
fn default_safe_distance() -> f32 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// JSONL event log (relative to project root)
    #[serde(default = "default_events_path")]
    pub path: PathBuf,

    /// Scheduler events kept in memory for `recent_events`
    #[serde(default = "default_recent_events")]
    pub recent: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            path: default_events_path(),
            recent: default_recent_events(),
        }
    }
}

fn default_events_path() -> PathBuf {
    PathBuf::from(".botkernel/events.jsonl")
}
fn default_recent_events() -> usize {
    64
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from project root (looks for .botkernel/config.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".botkernel/config.yaml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.events.path = project_root.join(&self.events.path);
    }
}
