//! Configuration keys, with the literal defaults of §6.

use std::time::Duration;

use crate::bridge::SelectionStrategy;

#[derive(Debug, Clone)]
pub struct JicofoConfig {
    pub bridge_selection_strategy: SelectionStrategy,
    pub bridge_failure_reset_threshold: Duration,
    pub max_sources_per_user: usize,
    pub health_check_interval: Duration,
    pub health_check_retry: Duration,
    pub max_stats_report_age: Duration,
    /// `None` means disabled, the documented default.
    pub service_rediscovery_interval: Option<Duration>,
    pub enable_lip_sync: bool,
    pub open_sctp: bool,
    pub enable_tcc: bool,
    pub enable_remb: bool,
    pub enable_opus_red: bool,
    pub enable_rtx: bool,
    pub start_bitrate_kbps: u32,
    pub min_bitrate_kbps: Option<u32>,
}

impl Default for JicofoConfig {
    fn default() -> Self {
        Self {
            bridge_selection_strategy: SelectionStrategy::Single,
            bridge_failure_reset_threshold: Duration::from_millis(300_000),
            max_sources_per_user: 20,
            health_check_interval: Duration::from_millis(10_000),
            health_check_retry: Duration::from_millis(5_000),
            max_stats_report_age: Duration::from_millis(15_000),
            service_rediscovery_interval: None,
            enable_lip_sync: false,
            open_sctp: true,
            enable_tcc: true,
            enable_remb: false,
            enable_opus_red: false,
            enable_rtx: true,
            start_bitrate_kbps: 800,
            min_bitrate_kbps: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literal_values() {
        let config = JicofoConfig::default();
        assert_eq!(config.bridge_selection_strategy, SelectionStrategy::Single);
        assert_eq!(config.bridge_failure_reset_threshold, Duration::from_millis(300_000));
        assert_eq!(config.max_sources_per_user, 20);
        assert_eq!(config.health_check_interval, Duration::from_millis(10_000));
        assert_eq!(config.health_check_retry, Duration::from_millis(5_000));
        assert_eq!(config.max_stats_report_age, Duration::from_millis(15_000));
        assert!(config.service_rediscovery_interval.is_none());
        assert!(!config.enable_lip_sync);
        assert!(config.open_sctp);
        assert!(config.enable_tcc);
        assert!(!config.enable_remb);
        assert!(!config.enable_opus_red);
        assert!(config.enable_rtx);
        assert_eq!(config.start_bitrate_kbps, 800);
        assert!(config.min_bitrate_kbps.is_none());
    }
}
