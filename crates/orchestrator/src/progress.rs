//! Progress reporting for running operations.
//!
//! Every notification is logged through `tracing` and published on the
//! [`EventBus`]. Publishing never waits for subscribers, so a slow terminal or
//! UI can lose events but never stalls a phase.

use events::{Event, EventBus};
use installer_core::PlanState;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ProgressReporter {
    bus: EventBus,
    operation_id: Uuid,
    phase: Option<String>,
}

impl ProgressReporter {
    pub fn new(bus: EventBus, operation_id: Uuid) -> Self {
        Self {
            bus,
            operation_id,
            phase: None,
        }
    }

    /// Reporter whose step notifications are attributed to `phase`.
    pub fn for_phase(&self, phase: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            operation_id: self.operation_id,
            phase: Some(phase.into()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    /// Announce the next human readable step.
    pub fn next_step(&self, message: impl Into<String>) {
        let message = message.into();
        info!(
            operation = %self.operation_id,
            phase = self.phase.as_deref().unwrap_or("-"),
            "{message}"
        );
        self.bus.emit(Event::Progress {
            operation_id: self.operation_id,
            phase: self.phase.clone(),
            message,
        });
    }

    /// Forward one line of streamed output.
    pub fn log_line(&self, line: impl Into<String>) {
        self.bus.emit(Event::Log {
            operation_id: self.operation_id,
            phase: self.phase.clone(),
            line: line.into(),
        });
    }

    pub fn plan_created(&self, phases: usize) {
        self.bus.emit(Event::PlanCreated {
            operation_id: self.operation_id,
            phases,
        });
    }

    pub fn plan_state_changed(&self, from: PlanState, to: PlanState) {
        info!(operation = %self.operation_id, %from, %to, "Plan state changed");
        self.bus.emit(Event::PlanStateChanged {
            operation_id: self.operation_id,
            from_state: from.to_string(),
            to_state: to.to_string(),
        });
    }

    pub fn phase_started(&self, phase: &str, server: Option<String>) {
        info!(operation = %self.operation_id, phase, server = server.as_deref().unwrap_or("-"), "Phase started");
        self.bus.emit(Event::PhaseStarted {
            operation_id: self.operation_id,
            phase: phase.to_string(),
            server,
        });
    }

    pub fn phase_completed(&self, phase: &str) {
        info!(operation = %self.operation_id, phase, "Phase completed");
        self.bus.emit(Event::PhaseCompleted {
            operation_id: self.operation_id,
            phase: phase.to_string(),
        });
    }

    pub fn phase_failed(&self, phase: &str, server: Option<String>, error: &str) {
        warn!(operation = %self.operation_id, phase, error, "Phase failed");
        self.bus.emit(Event::PhaseFailed {
            operation_id: self.operation_id,
            phase: phase.to_string(),
            server,
            error: error.to_string(),
        });
    }

    pub fn phase_rolled_back(&self, phase: &str) {
        info!(operation = %self.operation_id, phase, "Phase rolled back");
        self.bus.emit(Event::PhaseRolledBack {
            operation_id: self.operation_id,
            phase: phase.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_step_is_attributed_to_phase() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        let reporter = ProgressReporter::new(bus, id).for_phase("/wait");
        reporter.next_step("Waiting for the planet to start");

        let envelope = rx.recv().await.unwrap();
        assert_eq!(
            envelope.event,
            Event::Progress {
                operation_id: id,
                phase: Some("/wait".to_string()),
                message: "Waiting for the planet to start".to_string(),
            }
        );
    }

    #[test]
    fn test_reporting_without_subscribers_does_not_fail() {
        let reporter = ProgressReporter::new(EventBus::with_capacity(1), Uuid::nil());
        for i in 0..10 {
            reporter.next_step(format!("step {i}"));
        }
        assert_eq!(reporter.bus().event_count(), 10);
    }
}
