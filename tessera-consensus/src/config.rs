//! Consensus configuration.
//!
//! An immutable options value threaded through construction. There are no
//! global tunables; every knob is a field here with a documented effect.

use std::time::Duration;

/// Configuration for one tablet's consensus instance.
#[derive(Debug, Clone)]
pub struct ConsensusOptions {
    /// Timeout for `UpdateConsensus` and `RunLeaderElection` RPCs.
    pub consensus_rpc_timeout: Duration,
    /// Base interval: heartbeat period, and the unit the election timeout
    /// is derived from.
    pub raft_heartbeat_interval: Duration,
    /// Election timeout = heartbeat interval × this multiplier.
    pub leader_failure_max_missed_heartbeat_periods: f64,
    /// Mean interval between failure-monitor samples.
    pub leader_failure_monitor_check_mean: Duration,
    /// Standard deviation of the failure-monitor sampling interval.
    pub leader_failure_monitor_check_stddev: Duration,
    /// Cap on the randomized exponential election back-off.
    pub leader_failure_exp_backoff_max_delta: Duration,
    /// Master switch for leader failure detection.
    pub enable_leader_failure_detection: bool,
    /// Enables automatic eviction of failed followers.
    pub evict_failed_followers: bool,
    /// After a stepdown, elections are withheld for
    /// election timeout × this multiplier.
    pub after_stepdown_delay_election_multiplier: u32,
    /// Wall-clock leader lease window.
    pub leader_lease_duration: Duration,
    /// Hybrid-time leader lease window.
    pub ht_lease_duration: Duration,
    /// Cool-off before accepting another stepdown to a protégé that just
    /// lost its election.
    pub min_leader_stepdown_retry_interval: Duration,
    /// Maximum number of operations batched into one `ReplicateBatch`.
    pub max_group_replicate_batch_size: usize,
    /// Capacity of the per-tablet prepare queue.
    pub prepare_queue_max_size: usize,
    /// A follower unresponsive for longer than this is considered failed.
    pub follower_unavailable_considered_failed: Duration,
    /// Byte cap on a single `UpdateConsensus` payload.
    pub max_batch_size_bytes: usize,
}

impl ConsensusOptions {
    /// Creates options with production defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            consensus_rpc_timeout: Duration::from_secs(3),
            raft_heartbeat_interval: Duration::from_millis(500),
            leader_failure_max_missed_heartbeat_periods: 6.0,
            leader_failure_monitor_check_mean: Duration::from_millis(500),
            leader_failure_monitor_check_stddev: Duration::from_millis(100),
            leader_failure_exp_backoff_max_delta: Duration::from_secs(20),
            enable_leader_failure_detection: true,
            evict_failed_followers: true,
            after_stepdown_delay_election_multiplier: 5,
            leader_lease_duration: Duration::from_secs(2),
            ht_lease_duration: Duration::from_secs(2),
            min_leader_stepdown_retry_interval: Duration::from_secs(10),
            max_group_replicate_batch_size: 16,
            prepare_queue_max_size: 10_000,
            follower_unavailable_considered_failed: Duration::from_secs(300),
            max_batch_size_bytes: 4 * 1024 * 1024,
        }
    }

    /// The election timeout derived from the heartbeat interval.
    #[must_use]
    pub fn election_timeout(&self) -> Duration {
        self.raft_heartbeat_interval
            .mul_f64(self.leader_failure_max_missed_heartbeat_periods)
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.raft_heartbeat_interval = interval;
        self
    }

    /// Sets the failure-monitor sampling parameters.
    #[must_use]
    pub const fn with_failure_monitor_sampling(mut self, mean: Duration, stddev: Duration) -> Self {
        self.leader_failure_monitor_check_mean = mean;
        self.leader_failure_monitor_check_stddev = stddev;
        self
    }

    /// Enables or disables leader failure detection.
    #[must_use]
    pub const fn with_leader_failure_detection(mut self, enabled: bool) -> Self {
        self.enable_leader_failure_detection = enabled;
        self
    }

    /// Enables or disables automatic failed-follower eviction.
    #[must_use]
    pub const fn with_evict_failed_followers(mut self, enabled: bool) -> Self {
        self.evict_failed_followers = enabled;
        self
    }

    /// Sets both lease windows.
    #[must_use]
    pub const fn with_lease_durations(mut self, leader: Duration, ht: Duration) -> Self {
        self.leader_lease_duration = leader;
        self.ht_lease_duration = ht;
        self
    }

    /// Validates internal consistency.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if any option is out of range.
    pub fn validate(&self) -> tessera_core::Result<()> {
        use tessera_core::Error;

        if self.raft_heartbeat_interval.is_zero() {
            return Err(Error::invalid_argument(
                "raft_heartbeat_interval must be positive",
            ));
        }
        if self.leader_failure_max_missed_heartbeat_periods < 1.0 {
            return Err(Error::invalid_argument(
                "leader_failure_max_missed_heartbeat_periods must be >= 1",
            ));
        }
        if self.max_group_replicate_batch_size == 0 {
            return Err(Error::invalid_argument(
                "max_group_replicate_batch_size must be positive",
            ));
        }
        if self.prepare_queue_max_size == 0 {
            return Err(Error::invalid_argument(
                "prepare_queue_max_size must be positive",
            ));
        }
        if self.max_batch_size_bytes == 0 {
            return Err(Error::invalid_argument(
                "max_batch_size_bytes must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ConsensusOptions::new().validate().is_ok());
    }

    #[test]
    fn test_election_timeout_derivation() {
        let options = ConsensusOptions::new().with_heartbeat_interval(Duration::from_millis(100));
        assert_eq!(options.election_timeout(), Duration::from_millis(600));
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let mut options = ConsensusOptions::new();
        options.leader_failure_max_missed_heartbeat_periods = 0.5;
        assert!(options.validate().is_err());
    }
}
