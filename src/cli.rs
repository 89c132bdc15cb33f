//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::{
    GridConfig, Secret, DEFAULT_HEALTH_CHECK_INTERVAL_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_RETRY_INTERVAL_SECS,
};

#[derive(Parser, Debug)]
#[command(name = "browsergrid")]
#[command(about = "Schedule browser sessions onto a fleet of nodes")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Load environment variables from this file before starting
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Address to bind the distributor on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port to bind the distributor on
    #[arg(long, default_value_t = 4444)]
    pub port: u16,

    /// Seconds a new-session request may wait before timing out
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub session_request_timeout: u64,

    /// Seconds between retries of a request that found no capacity
    #[arg(long, default_value_t = DEFAULT_RETRY_INTERVAL_SECS)]
    pub session_retry_interval: u64,

    /// Seconds between node health checks
    #[arg(long, default_value_t = DEFAULT_HEALTH_CHECK_INTERVAL_SECS)]
    pub health_check_interval: u64,

    /// Secret nodes must present at registration.
    /// Falls back to GRID_REGISTRATION_SECRET, then to no secret.
    #[arg(long)]
    pub registration_secret: Option<String>,
}

impl Args {
    pub fn to_config(&self) -> GridConfig {
        let secret = self
            .registration_secret
            .clone()
            .or_else(|| std::env::var("GRID_REGISTRATION_SECRET").ok())
            .unwrap_or_default();

        GridConfig::new()
            .with_request_timeout(Duration::from_secs(self.session_request_timeout))
            .with_retry_interval(Duration::from_secs(self.session_retry_interval))
            .with_health_check_interval(Duration::from_secs(self.health_check_interval))
            .with_registration_secret(Secret::new(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["browsergrid"]);

        assert_eq!(args.port, 4444);
        assert_eq!(args.bind_addr, "0.0.0.0");
        assert_eq!(args.verbose, 0);

        let config = args.to_config();
        assert_eq!(config.request_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "browsergrid",
            "-vv",
            "--port",
            "5555",
            "--session-request-timeout",
            "30",
            "--registration-secret",
            "cheddar",
        ]);

        assert_eq!(args.verbose, 2);
        assert_eq!(args.port, 5555);

        let config = args.to_config();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.registration_secret.matches(&Secret::new("cheddar")));
    }
}
