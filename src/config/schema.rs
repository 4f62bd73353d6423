// src/config/schema.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub runner: RunnerConfig,
    pub resolver: ResolverConfig,
}

/// Scan manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Concurrent scan workers. 0 derives from CPU count, capped at 8.
    pub workers: usize,
    pub subscriber_buffer: usize,
    pub retention_secs: u64,
}

/// Process runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub binary: String,
    pub timeout_secs: u64,
    pub grace_secs: u64,
}

/// Target resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub max_targets: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            subscriber_buffer: 256,
            retention_secs: 600,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary: "nmap".to_string(),
            timeout_secs: 600,
            grace_secs: 5,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_targets: 4096,
        }
    }
}

impl ManagerConfig {
    /// Effective worker count after resolving the CPU-derived default.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().clamp(1, 8)
        } else {
            self.workers
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}
