//! Runtime-tunable options for a bucket distributor, with the defaults
//! named in the public interface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tuning knobs for [`crate::start_bucket_distributor`]. Constructible
/// programmatically with [`DistributorOptions::default`], or loaded from an
/// operator-supplied JSON document via [`DistributorOptions::from_json`] /
/// [`DistributorOptions::from_json_str`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorOptions {
    /// Self-announce cadence on the gossip exchange.
    #[serde(with = "duration_secs")]
    pub peers_period: Duration,
    /// A peer with no announce in this long is dropped from the peer map.
    #[serde(with = "duration_secs")]
    pub expiration_period: Duration,
    /// Delay before the first partition-size recompute after start.
    #[serde(with = "duration_secs")]
    pub partition_delay: Duration,
    /// Period between partition-size recomputes thereafter.
    #[serde(with = "duration_secs")]
    pub partition_period: Duration,
}

impl Default for DistributorOptions {
    fn default() -> Self {
        DistributorOptions {
            peers_period: Duration::from_secs(60),
            expiration_period: Duration::from_secs(120),
            partition_delay: Duration::from_secs(5),
            partition_period: Duration::from_secs(5),
        }
    }
}

impl DistributorOptions {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let options = DistributorOptions::default();
        assert_eq!(options.peers_period, Duration::from_secs(60));
        assert_eq!(options.expiration_period, Duration::from_secs(120));
        assert_eq!(options.partition_delay, Duration::from_secs(5));
        assert_eq!(options.partition_period, Duration::from_secs(5));
    }

    #[test]
    fn from_json_str_overrides_only_the_given_keys() {
        let options = DistributorOptions::from_json_str(r#"{"peers_period": 30}"#).unwrap();
        assert_eq!(options.peers_period, Duration::from_secs(30));
        assert_eq!(options.expiration_period, Duration::from_secs(120));
    }
}
