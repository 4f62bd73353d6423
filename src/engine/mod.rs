// src/engine/mod.rs - Scan execution engine
pub mod events;
pub mod job;
pub mod manager;
pub mod parser;
pub mod runner;

pub use events::{EventBus, ScanEvent, Subscription};
pub use job::{HostResult, HostStatus, JobId, JobState, PortResult, PortState, ScanJob};
pub use manager::ScanManager;
pub use parser::{OutputParser, ParseEvent};
pub use runner::{NmapRunner, ProcessHandle, ProcessRunner};
