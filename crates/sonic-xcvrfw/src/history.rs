//! Download durations remembered across operations.

use std::collections::HashMap;
use std::time::Duration;

use crate::platform::ModuleKey;

/// Duration of the last successful full download per module.
///
/// Owned by whoever drives a test run and passed explicitly to the
/// controller: written by a successful valid-image stage, read by the
/// interrupt operations.
#[derive(Debug, Clone, Default)]
pub struct DownloadTimingHistory {
    durations: HashMap<ModuleKey, Duration>,
}

impl DownloadTimingHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful download, returning the previous entry if any.
    pub fn record(&mut self, module: &ModuleKey, elapsed: Duration) -> Option<Duration> {
        self.durations.insert(module.clone(), elapsed)
    }

    /// Returns the recorded duration for `module`.
    pub fn get(&self, module: &ModuleKey) -> Option<Duration> {
        self.durations.get(module).copied()
    }

    pub fn contains(&self, module: &ModuleKey) -> bool {
        self.durations.contains_key(module)
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let mut history = DownloadTimingHistory::new();
        let key = ModuleKey::new("sw1", "Ethernet0");
        assert!(history.is_empty());
        assert_eq!(history.get(&key), None);

        assert_eq!(history.record(&key, Duration::from_secs(600)), None);
        assert_eq!(history.get(&key), Some(Duration::from_secs(600)));

        let previous = history.record(&key, Duration::from_secs(620));
        assert_eq!(previous, Some(Duration::from_secs(600)));
        assert_eq!(history.get(&key), Some(Duration::from_secs(620)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_keyed_by_switch_and_port() {
        let mut history = DownloadTimingHistory::new();
        history.record(&ModuleKey::new("sw1", "Ethernet0"), Duration::from_secs(300));
        assert!(!history.contains(&ModuleKey::new("sw2", "Ethernet0")));
        assert!(!history.contains(&ModuleKey::new("sw1", "Ethernet8")));
        assert!(history.contains(&ModuleKey::new("sw1", "Ethernet0")));
    }
}
