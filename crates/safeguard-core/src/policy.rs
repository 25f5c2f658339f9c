//! Per-level execution delay policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fallback delay for levels the table does not name.
pub const DEFAULT_DELAY_HOURS: i64 = 24;

/// Maps a security level to the number of hours a deferred action waits
/// before becoming due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayPolicy {
    hours: HashMap<String, i64>,
}

impl DelayPolicy {
    pub fn new(hours: HashMap<String, i64>) -> Self {
        Self { hours }
    }

    /// Delay in hours for `level`; unknown levels fall back to 24h.
    pub fn delay_hours(&self, level: &str) -> i64 {
        self.hours.get(level).copied().unwrap_or(DEFAULT_DELAY_HOURS)
    }
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            hours: HashMap::from([("L3".to_string(), 24), ("L4".to_string(), 48)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_maps_l3_and_l4() {
        let policy = DelayPolicy::default();
        assert_eq!(policy.delay_hours("L3"), 24);
        assert_eq!(policy.delay_hours("L4"), 48);
    }

    #[test]
    fn unknown_level_falls_back_to_24h() {
        let policy = DelayPolicy::default();
        assert_eq!(policy.delay_hours("L7"), 24);
    }

    #[test]
    fn custom_table_overrides_defaults() {
        let policy = DelayPolicy::new(HashMap::from([("L3".to_string(), 1)]));
        assert_eq!(policy.delay_hours("L3"), 1);
        assert_eq!(policy.delay_hours("L4"), 24);
    }
}
