// src/lib.rs - Scan orchestration core
//
// Resolves target specs, runs the external scanner under a bounded worker
// pool, parses its streaming output into typed results, and broadcasts job
// lifecycle events.
pub mod config;
pub mod engine;
pub mod error;
pub mod options;
pub mod target;

pub use config::Config;
pub use engine::{
    HostResult, HostStatus, JobId, JobState, PortResult, PortState, ScanEvent, ScanJob,
    ScanManager, Subscription,
};
pub use error::{ScanError, ScanResult};
pub use options::{ScanOptions, ScanType, TimingProfile};
pub use target::{Target, TargetResolver};
