//! Event types for operation progress reporting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An [`Event`] stamped with identity, order and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    /// Position of the event in its emitter's stream
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    /// Stamp `event` now, with sequence zero.
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Everything the engine and executors report about a running operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A plan was created for a new operation
    #[serde(rename = "plan.created")]
    PlanCreated { operation_id: Uuid, phases: usize },

    /// Overall plan state changed
    #[serde(rename = "plan.state_changed")]
    PlanStateChanged {
        operation_id: Uuid,
        from_state: String,
        to_state: String,
    },

    /// The engine started a phase
    #[serde(rename = "phase.started")]
    PhaseStarted {
        operation_id: Uuid,
        phase: String,
        server: Option<String>,
    },

    /// A phase completed successfully
    #[serde(rename = "phase.completed")]
    PhaseCompleted { operation_id: Uuid, phase: String },

    /// A phase failed
    #[serde(rename = "phase.failed")]
    PhaseFailed {
        operation_id: Uuid,
        phase: String,
        server: Option<String>,
        error: String,
    },

    /// A phase was rolled back
    #[serde(rename = "phase.rolled_back")]
    PhaseRolledBack { operation_id: Uuid, phase: String },

    /// Human-readable step inside a phase
    #[serde(rename = "progress.step")]
    Progress {
        operation_id: Uuid,
        phase: Option<String>,
        message: String,
    },

    /// Line of output from a long-running sub-step, e.g. an app hook
    #[serde(rename = "progress.log")]
    Log {
        operation_id: Uuid,
        phase: Option<String>,
        line: String,
    },

    /// Failure outside any particular phase, e.g. a lost database write
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Operation the event belongs to; `None` for process-wide errors.
    pub fn operation_id(&self) -> Option<Uuid> {
        match self {
            Event::PlanCreated { operation_id, .. } => Some(*operation_id),
            Event::PlanStateChanged { operation_id, .. } => Some(*operation_id),
            Event::PhaseStarted { operation_id, .. } => Some(*operation_id),
            Event::PhaseCompleted { operation_id, .. } => Some(*operation_id),
            Event::PhaseFailed { operation_id, .. } => Some(*operation_id),
            Event::PhaseRolledBack { operation_id, .. } => Some(*operation_id),
            Event::Progress { operation_id, .. } => Some(*operation_id),
            Event::Log { operation_id, .. } => Some(*operation_id),
            Event::Error { .. } => None,
        }
    }

    pub fn phase(&self) -> Option<&str> {
        match self {
            Event::PhaseStarted { phase, .. }
            | Event::PhaseCompleted { phase, .. }
            | Event::PhaseFailed { phase, .. }
            | Event::PhaseRolledBack { phase, .. } => Some(phase),
            Event::Progress { phase, .. } | Event::Log { phase, .. } => phase.as_deref(),
            _ => None,
        }
    }
}
