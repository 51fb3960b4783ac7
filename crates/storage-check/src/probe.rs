use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Running,
    Failed,
}

/// Result of one check dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Probe {
    pub checker: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub status: ProbeStatus,
}

impl Probe {
    pub fn running(checker: impl Into<String>) -> Self {
        Self {
            checker: checker.into(),
            detail: String::new(),
            status: ProbeStatus::Running,
        }
    }

    pub fn failed(checker: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            checker: checker.into(),
            detail: detail.into(),
            status: ProbeStatus::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ProbeStatus::Failed
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            ProbeStatus::Running => write!(f, "{}: ok", self.checker),
            ProbeStatus::Failed => write!(f, "{}: {}", self.checker, self.detail),
        }
    }
}

/// Sink for probe results.
pub trait Reporter: Send {
    fn add(&mut self, probe: Probe);
}

impl Reporter for Vec<Probe> {
    fn add(&mut self, probe: Probe) {
        self.push(probe);
    }
}

/// Format a byte count with binary units, e.g. `50.0 GiB`.
pub fn human_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    const TIB: u64 = 1024 * 1024 * 1024 * 1024;

    let (value, unit) = if bytes >= TIB {
        (bytes as f64 / TIB as f64, "TiB")
    } else if bytes >= GIB {
        (bytes as f64 / GIB as f64, "GiB")
    } else if bytes >= MIB {
        (bytes as f64 / MIB as f64, "MiB")
    } else if bytes >= KIB {
        (bytes as f64 / KIB as f64, "KiB")
    } else {
        return format!("{bytes} B");
    };

    format!("{value:.1} {unit}")
}
