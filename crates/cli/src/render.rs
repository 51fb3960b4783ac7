//! Terminal output: plan tables and live operation progress.

use console::style;
use events::{Event, EventBus, EventEnvelope};
use indicatif::{ProgressBar, ProgressStyle};
use installer_core::{Plan, PhaseState};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const NONE: &str = "-";

/// Phases of `plan` as an aligned table.
pub fn plan_table(plan: &Plan) -> String {
    let header = ["Phase", "Description", "State", "Server", "Requires", "Updated"];
    let rows: Vec<[String; 6]> = plan
        .phases()
        .iter()
        .map(|phase| {
            let updated = if phase.state == PhaseState::Unstarted {
                NONE.to_string()
            } else {
                phase.updated_at.format("%a %b %e %H:%M UTC").to_string()
            };
            [
                phase.id.clone(),
                phase.description.clone(),
                phase.state.to_string(),
                phase.server().map_or_else(|| NONE.to_string(), ToString::to_string),
                if phase.requires.is_empty() {
                    NONE.to_string()
                } else {
                    phase.requires.join(",")
                },
                updated,
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[String]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };
    push_row(&header.map(String::from));
    push_row(&widths.map(|width| "-".repeat(width)));
    for row in &rows {
        push_row(row);
    }
    out
}

/// One line for events worth a line of output.
pub fn event_line(event: &Event) -> Option<String> {
    match event {
        Event::PhaseStarted { phase, server, .. } => Some(match server {
            Some(server) => format!("Executing {phase} on {server}"),
            None => format!("Executing {phase}"),
        }),
        Event::PhaseCompleted { phase, .. } => Some(format!("{} {phase}", style("✓").green())),
        Event::PhaseFailed { phase, error, .. } => {
            Some(format!("{} {phase}: {error}", style("✗").red()))
        }
        Event::PhaseRolledBack { phase, .. } => {
            Some(format!("{} {phase} rolled back", style("↺").yellow()))
        }
        _ => None,
    }
}

/// Renders events of the bus until [`ProgressView::finish`] is called.
pub struct ProgressView {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressView {
    /// `spinner` adds a live status line fed by progress events.
    pub fn start(bus: &EventBus, spinner: bool) -> Self {
        let bar = spinner.then(|| {
            let bar = ProgressBar::new_spinner();
            if let Ok(template) = ProgressStyle::default_spinner().template("{spinner} {msg} [{elapsed}]") {
                bar.set_style(template);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        let stop = CancellationToken::new();
        let task = tokio::spawn(render(bus.subscribe(), bar, stop.clone()));
        Self { stop, task }
    }

    /// Print the events still queued and stop.
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "Progress display failed");
        }
    }
}

fn show(bar: Option<&ProgressBar>, event: &Event) {
    if let (Some(bar), Event::Progress { message, .. }) = (bar, event) {
        bar.set_message(message.clone());
        return;
    }
    let Some(line) = event_line(event) else {
        return;
    };
    match bar {
        Some(bar) => {
            if let Event::PhaseStarted { .. } = event {
                bar.set_message(line);
            } else {
                bar.println(line);
            }
        }
        None => println!("{line}"),
    }
}

async fn render(
    mut events: broadcast::Receiver<EventEnvelope>,
    bar: Option<ProgressBar>,
    stop: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            received = events.recv() => received,
            _ = stop.cancelled() => break,
        };
        match received {
            Ok(envelope) => show(bar.as_ref(), &envelope.event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress display fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    while let Ok(envelope) = events.try_recv() {
        show(bar.as_ref(), &envelope.event);
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installer_core::{ClusterRole, OperationKey, OperationKind, Phase, PhaseKind, Server};
    use uuid::Uuid;

    #[test]
    fn test_plan_table() {
        let master = Server::new("node-1", "10.0.0.1", "master", ClusterRole::Master);
        let plan = Plan::new(
            OperationKey::new("prod"),
            OperationKind::Install,
            vec![master.clone()],
            vec![
                Phase::new("/wait", "Wait for the control plane", PhaseKind::Wait).with_data(
                    installer_core::PhaseData::for_server(master),
                ),
                Phase::new("/app", "Install the application", PhaseKind::App).requires(["/wait"]),
            ],
        )
        .unwrap();

        let table = plan_table(&plan);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Phase"));
        assert!(lines[2].contains("node-1(10.0.0.1)"));
        assert!(lines[3].contains("/wait"));
        assert!(lines[3].ends_with(NONE));
        // columns line up
        assert_eq!(lines[2].find("Wait"), lines[0].find("Description"));
    }

    #[test]
    fn test_event_lines() {
        let operation_id = Uuid::new_v4();
        let started = Event::PhaseStarted {
            operation_id,
            phase: "/wait".into(),
            server: Some("node-1(10.0.0.1)".into()),
        };
        assert_eq!(
            event_line(&started).unwrap(),
            "Executing /wait on node-1(10.0.0.1)"
        );

        let failed = Event::PhaseFailed {
            operation_id,
            phase: "/wait".into(),
            server: None,
            error: "control plane is not running yet".into(),
        };
        assert!(event_line(&failed)
            .unwrap()
            .ends_with("/wait: control plane is not running yet"));

        let log = Event::Log {
            operation_id,
            phase: Some("/app".into()),
            line: "hook output".into(),
        };
        assert!(event_line(&log).is_none());
    }

    #[tokio::test]
    async fn test_view_drains_queued_events() {
        let bus = EventBus::new();
        let view = ProgressView::start(&bus, false);
        bus.emit(Event::PhaseCompleted {
            operation_id: Uuid::new_v4(),
            phase: "/wait".into(),
        });
        view.finish().await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
