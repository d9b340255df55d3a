use serde::{Deserialize, Serialize};

/// Engine-wide tunables. Loaded from the `[engine]` table of the catalog
/// file; every field has a default so an empty table is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Rows per grouped submission for batch operations.
    pub batch_size: usize,
    /// Row count that triggers a single large-result warning per execution.
    pub warn_threshold: usize,
    /// Extraction stops once this many rows were read. `None` = unbounded.
    pub max_threshold: Option<usize>,
    /// Requests for a page past the last one return page 1 instead of an
    /// empty page.
    pub page_over_to_first: bool,
    /// Executions slower than this are reported as slow statements.
    pub slow_sql_millis: u64,
    /// Emit a debug report with fitted SQL for every execution.
    pub print_sql: bool,
    pub default_data_source: String,
    /// Commit after successful entity operations. Statement requests carry
    /// their own flag.
    pub auto_commit: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            warn_threshold: 25_000,
            max_threshold: None,
            page_over_to_first: true,
            slow_sql_millis: 18_000,
            print_sql: false,
            default_data_source: String::from("default"),
            auto_commit: false,
        }
    }
}

impl EngineSettings {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = EngineSettings::default();
        assert_eq!(s.batch_size, 50);
        assert_eq!(s.warn_threshold, 25_000);
        assert!(s.max_threshold.is_none());
        assert!(s.page_over_to_first);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let s: EngineSettings = toml::from_str("batch_size = 200\nmax_threshold = 1000").unwrap();
        assert_eq!(s.batch_size, 200);
        assert_eq!(s.max_threshold, Some(1000));
        assert_eq!(s.slow_sql_millis, 18_000);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let s = EngineSettings {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(s.batch_size(), 1);
    }
}
