//! Sync-core configuration with builder pattern
//!
//! Mirrors the shape of the old resilience configuration: typed fields,
//! a `Default` impl with sane production values, named presets, and a
//! chained-setter builder.

use chrono::Duration as ChronoDuration;
use std::time::Duration;

/// Global configuration for a sync-core instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of school workers running concurrently per district.
    pub max_concurrent_schools: usize,
    /// Page size when fetching events for an incremental sync.
    pub incremental_event_page_size: usize,
    /// Emit a progress snapshot at least every N records processed.
    pub progress_report_every: usize,
    /// Attempts still `InProgress` after this long are eligible for the
    /// optional startup recovery scan.
    pub stale_attempt_threshold: ChronoDuration,
    /// Hard wall-clock timeout enforced at the top of a single school sync.
    pub per_attempt_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_schools: 5,
            incremental_event_page_size: 1000,
            progress_report_every: 10,
            stale_attempt_threshold: ChronoDuration::hours(1),
            per_attempt_timeout: None,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Halved concurrency, for constrained or shared deployments.
    pub fn conservative() -> Self {
        Self {
            max_concurrent_schools: 2,
            incremental_event_page_size: 500,
            progress_report_every: 10,
            stale_attempt_threshold: ChronoDuration::hours(1),
            per_attempt_timeout: Some(Duration::from_secs(600)),
        }
    }

    /// Single-school, single-worker config for debugging a specific run.
    pub fn disabled() -> Self {
        Self {
            max_concurrent_schools: 1,
            incremental_event_page_size: 1000,
            progress_report_every: 10,
            stale_attempt_threshold: ChronoDuration::hours(1),
            per_attempt_timeout: None,
        }
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn max_concurrent_schools(mut self, n: usize) -> Self {
        self.config.max_concurrent_schools = n;
        self
    }

    pub fn incremental_event_page_size(mut self, n: usize) -> Self {
        self.config.incremental_event_page_size = n;
        self
    }

    pub fn progress_report_every(mut self, n: usize) -> Self {
        self.config.progress_report_every = n;
        self
    }

    pub fn stale_attempt_threshold(mut self, d: ChronoDuration) -> Self {
        self.config.stale_attempt_threshold = d;
        self
    }

    pub fn per_attempt_timeout(mut self, d: Option<Duration>) -> Self {
        self.config.per_attempt_timeout = d;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.max_concurrent_schools, 5);
        assert_eq!(cfg.incremental_event_page_size, 1000);
        assert_eq!(cfg.progress_report_every, 10);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = SyncConfig::builder().max_concurrent_schools(8).build();
        assert_eq!(cfg.max_concurrent_schools, 8);
        assert_eq!(cfg.incremental_event_page_size, 1000);
    }

    #[test]
    fn conservative_halves_concurrency() {
        let cfg = SyncConfig::conservative();
        assert_eq!(cfg.max_concurrent_schools, 2);
        assert!(cfg.per_attempt_timeout.is_some());
    }
}
