// src/engine/job.rs - Scan job state and result accumulation
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::parser::ParseEvent;
use crate::options::ScanOptions;
use crate::target::Target;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle. Queued and Running are the only non-terminal states; no
/// state is re-entered once left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResult {
    pub port: u16,
    pub protocol: String,
    pub state: PortState,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
}

/// Accumulated results for one discovered host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResult {
    pub host: String,
    pub status: HostStatus,
    pub ports: Vec<PortResult>,
}

impl HostResult {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Unknown,
            ports: Vec::new(),
        }
    }

    /// Merge a port record. Later records for the same (port, protocol)
    /// replace the earlier one in place.
    pub fn merge_port(&mut self, port: PortResult) {
        if let Some(existing) = self
            .ports
            .iter_mut()
            .find(|p| p.port == port.port && p.protocol == port.protocol)
        {
            *existing = port;
        } else {
            self.ports.push(port);
        }
    }
}

/// One invocation of the scanning tool against one target with a fixed
/// option set. Owned and mutated exclusively by the scan manager's worker;
/// consumers only ever see published clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub target: Target,
    pub options: ScanOptions,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<HostResult>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl ScanJob {
    pub fn new(target: Target, options: ScanOptions) -> Self {
        Self {
            id: JobId::new(),
            target,
            options,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            results: Vec::new(),
            exit_code: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Apply a terminal state. First transition wins; a second request
    /// against an already-terminal job is a no-op.
    pub fn mark_terminal(&mut self, state: JobState) -> bool {
        debug_assert!(state.is_terminal());
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Fold a parser event into the result set. Returns the updated host
    /// snapshot when the event changed host-level data.
    pub fn apply_parse_event(&mut self, event: &ParseEvent) -> Option<HostResult> {
        match event {
            ParseEvent::HostBegin { host } => {
                Some(self.host_entry(host).clone())
            }
            ParseEvent::HostStatus { host, status } => {
                let entry = self.host_entry(host);
                entry.status = *status;
                Some(entry.clone())
            }
            ParseEvent::Port { host, port } => {
                let entry = self.host_entry(host);
                entry.merge_port(port.clone());
                Some(entry.clone())
            }
            ParseEvent::Progress { .. } | ParseEvent::UnparsedLine { .. } => None,
        }
    }

    /// Host entry in first-seen order, created on demand.
    fn host_entry(&mut self, host: &str) -> &mut HostResult {
        let index = match self.results.iter().position(|h| h.host == host) {
            Some(index) => index,
            None => {
                self.results.push(HostResult::new(host));
                self.results.len() - 1
            }
        };
        &mut self.results[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ScanJob {
        ScanJob::new(Target::new("10.0.0.1"), crate::options::ScanOptions::default())
    }

    fn open_port(port: u16, service: &str) -> PortResult {
        PortResult {
            port,
            protocol: "tcp".to_string(),
            state: PortState::Open,
            service_name: Some(service.to_string()),
            service_version: None,
        }
    }

    #[test]
    fn terminal_transition_is_first_wins() {
        let mut job = job();
        job.mark_running();
        assert!(job.mark_terminal(JobState::Cancelled));
        assert!(!job.mark_terminal(JobState::Completed));
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[test]
    fn later_port_records_replace_in_place() {
        let mut host = HostResult::new("10.0.0.1");
        host.merge_port(open_port(22, "ssh"));
        host.merge_port(open_port(80, "http"));
        let mut refined = open_port(22, "ssh");
        refined.service_version = Some("OpenSSH 9.6".to_string());
        host.merge_port(refined);

        assert_eq!(host.ports.len(), 2);
        assert_eq!(host.ports[0].port, 22);
        assert_eq!(host.ports[0].service_version.as_deref(), Some("OpenSSH 9.6"));
        assert_eq!(host.ports[1].port, 80);
    }

    #[test]
    fn host_entries_keep_first_seen_order() {
        let mut job = job();
        for host in ["10.0.0.2", "10.0.0.1", "10.0.0.2"] {
            job.apply_parse_event(&ParseEvent::HostBegin { host: host.to_string() });
        }
        let hosts: Vec<&str> = job.results.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.1"]);
    }

    #[test]
    fn progress_events_do_not_touch_results() {
        let mut job = job();
        assert!(job.apply_parse_event(&ParseEvent::Progress { percent: 50 }).is_none());
        assert!(job.results.is_empty());
    }
}
