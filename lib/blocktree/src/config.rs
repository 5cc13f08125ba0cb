use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the tree engine and the default splitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Byte capacity of a file leaf under the fixed-size splitter.
    pub block_size: usize,
    /// Maximum children per indirect block.
    pub max_ptrs_per_block: usize,
    /// Maximum entries per directory leaf.
    pub max_dir_entries_per_block: usize,
    /// Ceiling on concurrent block fetches inside a range fetch.
    pub max_parallel_block_fetches: usize,
    /// Per-range-fetch deadline. `None` waits indefinitely.
    #[serde(with = "opt_duration_ms")]
    pub fetch_deadline: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 512 << 10,
            max_ptrs_per_block: 256,
            max_dir_entries_per_block: 64,
            max_parallel_block_fetches: 100,
            fetch_deadline: None,
        }
    }
}

/// Milliseconds on the wire, `Duration` in memory.
mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fetch_ceiling_is_bounded() {
        let c = Config::default();
        assert_eq!(c.max_parallel_block_fetches, 100);
        assert!(c.fetch_deadline.is_none());
    }
}
