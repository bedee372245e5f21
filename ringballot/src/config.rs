use std::time::Duration;

/// Whether pre-vetted, publicly known parameters may be used in place of freshly generated ones.
///
/// `InsecureTestMode` exists for tests and demos only. It is never the default and every use
/// is logged as a warning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Production,
    InsecureTestMode,
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::Production
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MixnetConfig {
    /// Release as soon as this many ballots are buffered
    pub min_batch_size: usize,

    /// Force a release once the oldest buffered ballot is this old
    pub max_wait_ms: u64,

    /// How often the batcher checks for a forced release
    pub tick_interval_ms: u64,
}

impl Default for MixnetConfig {
    fn default() -> Self {
        MixnetConfig {
            min_batch_size: 10,
            max_wait_ms: 60_000,
            tick_interval_ms: 1_000,
        }
    }
}

impl MixnetConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    pub drain_interval_ms: u64,
    pub sync_interval_ms: u64,

    /// Ballots older than this when drained are rejected
    pub max_ballot_age_ms: u64,

    /// Tolerance for ballots stamped slightly in the future
    pub max_clock_skew_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            drain_interval_ms: 5_000,
            sync_interval_ms: 30_000,
            max_ballot_age_ms: 24 * 60 * 60 * 1000,
            max_clock_skew_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}
