use std::env;
use std::time::Duration;

use crate::session::{BusyPolicy, SessionSettings};

/// Config holds all application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub busy_policy: BusyPolicy,
    pub connect_timeout_secs: u64,
    pub stage_timeout_secs: u64,
    pub commit_timeout_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub ssh_default_port: u16,
    pub instances_file: Option<String>,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    /// A `.env` file in the working directory is read first when present.
    pub fn load() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        let busy_policy = get_env("SESSION_BUSY_POLICY", "reject")
            .parse()
            .unwrap_or_else(|e| {
                tracing::warn!("{}, falling back to reject", e);
                BusyPolicy::Reject
            });

        Self {
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8080"),
            busy_policy,
            connect_timeout_secs: get_env("CONNECT_TIMEOUT_SECS", "10").parse().unwrap_or(10),
            stage_timeout_secs: get_env("STAGE_TIMEOUT_SECS", "15").parse().unwrap_or(15),
            commit_timeout_secs: get_env("COMMIT_TIMEOUT_SECS", "60").parse().unwrap_or(60),
            session_idle_timeout_secs: get_env("SESSION_IDLE_TIMEOUT_SECS", "300")
                .parse()
                .unwrap_or(300),
            ssh_default_port: get_env("SSH_DEFAULT_PORT", "22").parse().unwrap_or(22),
            instances_file: env::var("INSTANCES_FILE").ok().filter(|p| !p.is_empty()),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            busy_policy: self.busy_policy,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            commit_timeout: Duration::from_secs(self.commit_timeout_secs),
            idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
