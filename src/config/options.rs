use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunables for discovery, membership and consensus. Every field is optional; unset fields take
/// the documented default. Durations are (de)serialized as milliseconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Default 100ms.
    #[serde(with = "opt_millis", rename = "leader_heartbeat_ms")]
    pub leader_heartbeat_duration: Option<Duration>,
    /// Default 500ms.
    #[serde(with = "opt_millis", rename = "election_min_timeout_ms")]
    pub election_min_timeout: Option<Duration>,
    /// Default 1500ms.
    #[serde(with = "opt_millis", rename = "election_max_timeout_ms")]
    pub election_max_timeout: Option<Duration>,
    /// Default 300ms. Applies to every outbound consensus RPC.
    #[serde(with = "opt_millis", rename = "rpc_timeout_ms")]
    pub rpc_timeout: Option<Duration>,
    /// Default 1s.
    #[serde(with = "opt_millis", rename = "announce_interval_ms")]
    pub announce_interval: Option<Duration>,
    /// Default 5s. A member not heard from for this long is unreachable.
    #[serde(with = "opt_millis", rename = "liveness_timeout_ms")]
    pub liveness_timeout: Option<Duration>,
    /// Default 60s. The leader proposes removal of members unreachable for this long.
    #[serde(with = "opt_millis", rename = "member_expiry_ms")]
    pub member_expiry: Option<Duration>,
    /// Default 500ms.
    #[serde(with = "opt_millis", rename = "join_attempt_timeout_ms")]
    pub join_attempt_timeout: Option<Duration>,
    /// Default 5s.
    #[serde(with = "opt_millis", rename = "join_deadline_ms")]
    pub join_deadline: Option<Duration>,
    /// Default 100ms, doubled after every failed round up to `join_max_backoff`.
    #[serde(with = "opt_millis", rename = "join_initial_backoff_ms")]
    pub join_initial_backoff: Option<Duration>,
    /// Default 1s.
    #[serde(with = "opt_millis", rename = "join_max_backoff_ms")]
    pub join_max_backoff: Option<Duration>,
    /// Default 5s.
    #[serde(with = "opt_millis", rename = "bootstrap_deadline_ms")]
    pub bootstrap_deadline: Option<Duration>,
    /// Default 1000 log entries.
    pub snapshot_threshold: Option<u64>,
    /// Default 64.
    pub max_entries_per_append: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ClusterOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub rpc_timeout: Duration,
    pub announce_interval: Duration,
    pub liveness_timeout: Duration,
    pub member_expiry: Duration,
    pub join_attempt_timeout: Duration,
    pub join_deadline: Duration,
    pub join_initial_backoff: Duration,
    pub join_max_backoff: Duration,
    pub bootstrap_deadline: Duration,
    pub snapshot_threshold: usize,
    pub max_entries_per_append: usize,
}

// Shortest heartbeat or announce period; anything below spins.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
#[error("Invalid cluster options: {0}")]
pub struct OptionsError(&'static str);

impl ClusterOptionsValidated {
    fn validate(&self) -> Result<(), OptionsError> {
        if self.leader_heartbeat_duration < MIN_PERIOD {
            return Err(OptionsError("Leader heartbeat must be at least 1ms"));
        }
        if self.announce_interval < MIN_PERIOD {
            return Err(OptionsError("Announce interval must be at least 1ms"));
        }
        if self.liveness_timeout <= self.announce_interval {
            return Err(OptionsError("Liveness timeout must be greater than the announce interval"));
        }
        if self.member_expiry <= self.liveness_timeout {
            return Err(OptionsError("Member expiry must be greater than the liveness timeout"));
        }
        if self.leader_heartbeat_duration >= self.election_min_timeout {
            return Err(OptionsError(
                "Election minimum timeout must be greater than leader's heartbeat",
            ));
        }
        if self.election_min_timeout >= self.election_max_timeout {
            return Err(OptionsError(
                "Election minimum timeout must be less than maximum timeout",
            ));
        }
        if self.rpc_timeout >= self.election_min_timeout {
            return Err(OptionsError(
                "RPC timeout must be less than the election minimum timeout",
            ));
        }
        if self.join_initial_backoff > self.join_max_backoff {
            return Err(OptionsError("Join initial backoff must not exceed max backoff"));
        }
        if self.snapshot_threshold == 0 {
            return Err(OptionsError("Snapshot threshold must be at least 1"));
        }
        if self.max_entries_per_append == 0 {
            return Err(OptionsError("Max entries per append must be at least 1"));
        }

        Ok(())
    }
}

impl TryFrom<ClusterOptions> for ClusterOptionsValidated {
    type Error = OptionsError;

    fn try_from(options: ClusterOptions) -> Result<Self, Self::Error> {
        let values = ClusterOptionsValidated {
            leader_heartbeat_duration: options
                .leader_heartbeat_duration
                .unwrap_or(Duration::from_millis(100)),
            election_min_timeout: options.election_min_timeout.unwrap_or(Duration::from_millis(500)),
            election_max_timeout: options.election_max_timeout.unwrap_or(Duration::from_millis(1500)),
            rpc_timeout: options.rpc_timeout.unwrap_or(Duration::from_millis(300)),
            announce_interval: options.announce_interval.unwrap_or(Duration::from_secs(1)),
            liveness_timeout: options.liveness_timeout.unwrap_or(Duration::from_secs(5)),
            member_expiry: options.member_expiry.unwrap_or(Duration::from_secs(60)),
            join_attempt_timeout: options.join_attempt_timeout.unwrap_or(Duration::from_millis(500)),
            join_deadline: options.join_deadline.unwrap_or(Duration::from_secs(5)),
            join_initial_backoff: options.join_initial_backoff.unwrap_or(Duration::from_millis(100)),
            join_max_backoff: options.join_max_backoff.unwrap_or(Duration::from_secs(1)),
            bootstrap_deadline: options.bootstrap_deadline.unwrap_or(Duration::from_secs(5)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(1000) as usize,
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64) as usize,
        };

        values.validate()?;
        Ok(values)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::convert::TryFrom;
    use tokio::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                serializer.serialize_some(&millis)
            }
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
