// src/engine/parser.rs - Incremental scanner output parsing
//
// The scan tool's human-oriented output interleaves host and port records
// across lines, so this is a small state machine rather than a per-line
// mapper. It holds no reference to the process or the job; feed it lines,
// collect events.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::engine::job::{HostStatus, PortResult, PortState};

/// Longest line the parser will look at. Anything longer is truncated and
/// reported as a diagnostic instead of failing the parse.
pub const MAX_LINE_LEN: usize = 4096;

static HOST_REPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Nmap scan report for (\S+)(?: \(([^)]+)\))?$").unwrap()
});

static PORT_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,5})/(tcp|udp|sctp)\s+([a-z|]+)\s*(\S+)?\s*(.*)$").unwrap()
});

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"About ([\d.]+)% done").unwrap()
});

/// Recognized lines that carry nothing the result model tracks.
const NOISE_PREFIXES: &[&str] = &[
    "Starting Nmap",
    "Initiating ",
    "Completed ",
    "Discovered open port",
    "MAC Address:",
    "Service detection performed",
    "Service Info:",
    "Read data files",
    "Nmap done",
    "Not shown:",
    "Stats:",
    "Warning:",
    "NSE:",
    "Scanning ",
    "Ping Scan",
    "Parallel DNS",
    "Host script results:",
    "Running:",
    "OS details:",
    "OS CPE:",
    "Aggressive OS guesses",
    "Network Distance:",
    "Other addresses",
    "rDNS record",
    "Uptime guess",
    "TCP Sequence",
    "IP ID Sequence",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Idle,
    InHostBlock,
    InPortTable,
}

/// One typed record pulled out of the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseEvent {
    HostBegin { host: String },
    HostStatus { host: String, status: HostStatus },
    Port { host: String, port: PortResult },
    Progress { percent: u8 },
    /// Malformed or unrecognized line. Non-fatal by design; the tool's
    /// output is best-effort, not a strict contract.
    UnparsedLine { line: String, truncated: bool },
}

/// Streaming parser for the scan tool's verbose output.
pub struct OutputParser {
    state: ParserState,
    current_host: Option<String>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Idle,
            current_host: None,
        }
    }

    /// Consume one output line, yielding zero or more events.
    pub fn feed(&mut self, line: &str) -> Vec<ParseEvent> {
        if line.len() > MAX_LINE_LEN {
            let mut cut = MAX_LINE_LEN;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            return vec![ParseEvent::UnparsedLine {
                line: line[..cut].to_string(),
                truncated: true,
            }];
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            // Blank line closes a port table; the host block itself ends at
            // the next report header.
            if self.state == ParserState::InPortTable {
                self.state = ParserState::InHostBlock;
            }
            return Vec::new();
        }

        // Progress lines can appear in any state.
        if let Some(caps) = PROGRESS_RE.captures(trimmed) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return vec![ParseEvent::Progress {
                    percent: value.clamp(0.0, 100.0) as u8,
                }];
            }
        }

        // A new host report header resets the block, whatever came before.
        if let Some(caps) = HOST_REPORT_RE.captures(trimmed) {
            let host = caps
                .get(2)
                .or_else(|| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            self.current_host = Some(host.clone());
            self.state = ParserState::InHostBlock;
            return vec![ParseEvent::HostBegin { host }];
        }

        match self.state {
            ParserState::Idle => self.unrecognized(trimmed),
            ParserState::InHostBlock => self.feed_host_block(trimmed),
            ParserState::InPortTable => self.feed_port_table(trimmed),
        }
    }

    fn feed_host_block(&mut self, line: &str) -> Vec<ParseEvent> {
        if line.starts_with("Host is up") {
            return vec![self.host_status(HostStatus::Up)];
        }
        if line.starts_with("Host seems down") || line.starts_with("Host is down") {
            return vec![self.host_status(HostStatus::Down)];
        }
        if Self::is_port_table_header(line) {
            self.state = ParserState::InPortTable;
            return Vec::new();
        }
        // Script detail lines belong to the surrounding block.
        if line.starts_with('|') {
            return Vec::new();
        }
        self.unrecognized(line)
    }

    fn feed_port_table(&mut self, line: &str) -> Vec<ParseEvent> {
        if let Some(caps) = PORT_LINE_RE.captures(line) {
            if let (Ok(port), Some(state)) = (caps[1].parse::<u16>(), Self::port_state(&caps[3])) {
                let service_name = caps.get(4).map(|m| m.as_str().to_string());
                let version = caps.get(5).map(|m| m.as_str().trim()).filter(|v| !v.is_empty());
                return vec![ParseEvent::Port {
                    host: self.current_host.clone().unwrap_or_default(),
                    port: PortResult {
                        port,
                        protocol: caps[2].to_string(),
                        state,
                        service_name,
                        service_version: version.map(str::to_string),
                    },
                }];
            }
        }
        if line.starts_with('|') || Self::is_port_table_header(line) {
            return Vec::new();
        }
        self.unrecognized(line)
    }

    fn host_status(&self, status: HostStatus) -> ParseEvent {
        ParseEvent::HostStatus {
            host: self.current_host.clone().unwrap_or_default(),
            status,
        }
    }

    fn unrecognized(&self, line: &str) -> Vec<ParseEvent> {
        if NOISE_PREFIXES.iter().any(|p| line.starts_with(p)) {
            return Vec::new();
        }
        vec![ParseEvent::UnparsedLine {
            line: line.to_string(),
            truncated: false,
        }]
    }

    fn is_port_table_header(line: &str) -> bool {
        line.starts_with("PORT") && line.contains("STATE") && line.contains("SERVICE")
    }

    fn port_state(raw: &str) -> Option<PortState> {
        match raw {
            "open" => Some(PortState::Open),
            "closed" => Some(PortState::Closed),
            s if s.contains("filtered") => Some(PortState::Filtered),
            _ => None,
        }
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}
