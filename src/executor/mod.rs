//! External executor invocation.
//!
//! An executor is an opaque program that reads one JSON payload on stdin and
//! writes one JSON object on stdout. This module covers everything between a
//! stage deciding to call one and the stage receiving a parsed result:
//!
//! - [`ExecutorSettings`]: resolved commands, retry, timeout and rate-limit policy
//! - [`Scheduler`]: the per-process call counter that gates the rate limit
//! - [`ExecutorRunner`]: spawns the process with retries and a timeout
//! - [`parse_cli_envelope`]: turns executor stdout into a result object

mod envelope;
mod runner;
mod scheduler;

pub use envelope::{Envelope, EnvelopeStatus, ParsedEnvelope, parse_cli_envelope};
pub use runner::{ExecutorRunner, Invoker};
pub use scheduler::Scheduler;

use serde::Serialize;
use std::time::Duration;

use crate::role::Role;

/// Resolved executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorSettings {
    pub architect_cmd: Option<String>,
    pub builder_cmd: Option<String>,
    /// Maximum attempts per invocation.
    pub max_retries: u32,
    /// Fixed sleep between attempts.
    pub retry_sleep_secs: u64,
    pub timeout_secs: u64,
    pub rate_limit_secs: u64,
    pub simulate: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            architect_cmd: None,
            builder_cmd: None,
            max_retries: 2,
            retry_sleep_secs: 20,
            timeout_secs: 300,
            rate_limit_secs: 0,
            simulate: false,
        }
    }
}

impl ExecutorSettings {
    /// Settings that never spawn anything.
    pub fn simulated() -> Self {
        Self {
            simulate: true,
            ..Self::default()
        }
    }

    pub fn command_for(&self, role: Role) -> Option<&str> {
        match role {
            Role::Architect => self.architect_cmd.as_deref(),
            Role::Builder => self.builder_cmd.as_deref(),
        }
    }

    /// Environment variable an operator sets to configure `role`.
    pub fn env_var_for(role: Role) -> &'static str {
        match role {
            Role::Architect => "ARCHITECT_CMD",
            Role::Builder => "BUILDER_CMD",
        }
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_secs(self.retry_sleep_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_for_role() {
        let settings = ExecutorSettings {
            architect_cmd: Some("arch".into()),
            ..ExecutorSettings::default()
        };
        assert_eq!(settings.command_for(Role::Architect), Some("arch"));
        assert_eq!(settings.command_for(Role::Builder), None);
    }

    #[test]
    fn test_durations() {
        let settings = ExecutorSettings::default();
        assert_eq!(settings.timeout(), Duration::from_secs(300));
        assert_eq!(settings.retry_sleep(), Duration::from_secs(20));
        assert!(settings.rate_limit().is_zero());
    }

    #[test]
    fn test_simulated_keeps_defaults() {
        let settings = ExecutorSettings::simulated();
        assert!(settings.simulate);
        assert_eq!(settings.max_retries, 2);
    }
}
