use ringballot::{MixnetConfig, SchedulerConfig, SecurityMode};
use std::env::var;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be a valid {1}, got {2:?}")]
    Invalid(&'static str, &'static str, String),

    #[error("{0}")]
    Unsupported(String),
}

/// Settings for a local run, read from `RINGBALLOT_*` environment variables and overridden by
/// command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub mixnet: MixnetConfig,
    pub scheduler: SchedulerConfig,
    pub paillier_bits: usize,
    pub rsa_bits: usize,
    pub security_mode: SecurityMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mixnet: MixnetConfig {
                min_batch_size: 4,
                max_wait_ms: 2_000,
                tick_interval_ms: 250,
            },
            scheduler: SchedulerConfig {
                drain_interval_ms: 500,
                sync_interval_ms: 1_000,
                ..SchedulerConfig::default()
            },
            paillier_bits: 1024,
            rsa_bits: 2048,
            security_mode: SecurityMode::Production,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(v) = parse_var("RINGBALLOT_MIN_BATCH_SIZE", "integer")? {
            config.mixnet.min_batch_size = v;
        }
        if let Some(v) = parse_var("RINGBALLOT_MAX_WAIT_MS", "integer")? {
            config.mixnet.max_wait_ms = v;
        }
        if let Some(v) = parse_var("RINGBALLOT_TICK_INTERVAL_MS", "integer")? {
            config.mixnet.tick_interval_ms = v;
        }
        if let Some(v) = parse_var("RINGBALLOT_DRAIN_INTERVAL_MS", "integer")? {
            config.scheduler.drain_interval_ms = v;
        }
        if let Some(v) = parse_var("RINGBALLOT_SYNC_INTERVAL_MS", "integer")? {
            config.scheduler.sync_interval_ms = v;
        }
        if let Some(v) = parse_var("RINGBALLOT_PAILLIER_BITS", "integer")? {
            config.paillier_bits = v;
        }
        if let Some(v) = parse_var("RINGBALLOT_RSA_BITS", "integer")? {
            config.rsa_bits = v;
        }
        if let Some(insecure) = parse_var::<bool>("RINGBALLOT_INSECURE_TEST_MODE", "boolean")? {
            if insecure {
                config.security_mode = SecurityMode::InsecureTestMode;
            }
        }

        config.check()?;
        Ok(config)
    }

    /// Environment first, then flags on top
    pub fn load(matches: &clap::ArgMatches) -> Result<Self, ConfigError> {
        let mut config = Config::from_env()?;
        config.apply_matches(matches)?;
        Ok(config)
    }

    /// Apply flags given on the command line
    pub fn apply_matches(&mut self, matches: &clap::ArgMatches) -> Result<(), ConfigError> {
        if let Some(v) = parse_flag(matches, "min-batch-size")? {
            self.mixnet.min_batch_size = v;
        }
        if let Some(v) = parse_flag(matches, "max-wait-ms")? {
            self.mixnet.max_wait_ms = v;
        }
        if let Some(v) = parse_flag(matches, "drain-interval-ms")? {
            self.scheduler.drain_interval_ms = v;
        }
        if let Some(v) = parse_flag(matches, "paillier-bits")? {
            self.paillier_bits = v;
        }
        if matches.is_present("insecure-test-mode") {
            self.security_mode = SecurityMode::InsecureTestMode;
        }
        self.check()
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.mixnet.min_batch_size == 0 {
            return Err(ConfigError::Unsupported(
                "min batch size must be at least 1".to_owned(),
            ));
        }
        if self.mixnet.tick_interval_ms == 0
            || self.scheduler.drain_interval_ms == 0
            || self.scheduler.sync_interval_ms == 0
        {
            return Err(ConfigError::Unsupported(
                "scheduler intervals must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &'static str, kind: &'static str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, kind, val)),
        Err(_e) => Ok(None),
    }
}

fn parse_flag<T: FromStr>(
    matches: &clap::ArgMatches,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match matches.value_of(name) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, "integer", val.to_owned())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.check().unwrap();
        assert_eq!(config.security_mode, SecurityMode::Production);
    }

    #[test]
    fn test_flags_override() {
        let app = clap::App::new("test")
            .arg(clap::Arg::with_name("min-batch-size").long("min-batch-size").takes_value(true))
            .arg(clap::Arg::with_name("insecure-test-mode").long("insecure-test-mode"));

        let matches = app
            .clone()
            .get_matches_from(vec!["test", "--min-batch-size", "7", "--insecure-test-mode"]);
        let mut config = Config::default();
        config.apply_matches(&matches).unwrap();
        assert_eq!(config.mixnet.min_batch_size, 7);
        assert_eq!(config.security_mode, SecurityMode::InsecureTestMode);

        let matches = app.get_matches_from(vec!["test", "--min-batch-size", "0"]);
        let mut config = Config::default();
        assert!(config.apply_matches(&matches).is_err());
    }
}
