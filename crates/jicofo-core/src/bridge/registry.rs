//! Fleet of media relays with stats, operational flag, and failure-cooldown
//! (component C3).

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::events::BridgeEvent;

/// Stats snapshot reported by the discovery adapter (§6 item 4).
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub region: Option<String>,
    pub relay_id: Option<String>,
    pub video_stream_count: i64,
    pub shutdown_in_progress: bool,
}

/// Registry entry for one media relay, keyed by JID in [`BridgeRegistry`].
#[derive(Debug, Clone)]
pub struct Bridge {
    pub jid: String,
    pub version: Option<String>,
    operational: bool,
    failure_timestamp: Option<Instant>,
    stats: Option<BridgeStats>,
    /// Accumulator of video-stream-count events since the last stats
    /// snapshot; reset on every `set_stats` call regardless of whether the
    /// underlying count changed (§3, §9 Open Questions — preserved verbatim).
    video_stream_count_diff: i64,
    discovery_order: u64,
}

impl Bridge {
    fn new(jid: String, version: Option<String>, discovery_order: u64) -> Self {
        Self {
            jid,
            version,
            operational: true,
            failure_timestamp: None,
            stats: None,
            video_stream_count_diff: 0,
            discovery_order,
        }
    }

    pub fn region(&self) -> Option<&str> {
        self.stats.as_ref().and_then(|s| s.region.as_deref())
    }

    pub fn relay_id(&self) -> Option<&str> {
        self.stats.as_ref().and_then(|s| s.relay_id.as_deref())
    }

    pub fn stats(&self) -> Option<&BridgeStats> {
        self.stats.as_ref()
    }

    /// `videoStreamCount + videoStreamCountDiff` (§3).
    pub fn estimated_load(&self) -> i64 {
        let base = self.stats.as_ref().map(|s| s.video_stream_count).unwrap_or(0);
        base + self.video_stream_count_diff
    }

    /// `operational == false` iff `now - failureTimestamp < threshold` (§3).
    /// Re-elevates to operational on read once the threshold has elapsed,
    /// without requiring any stats to arrive (invariant 6, §8).
    pub fn is_operational(&self, failure_reset_threshold: Duration) -> bool {
        match self.failure_timestamp {
            Some(ts) => ts.elapsed() >= failure_reset_threshold,
            None => self.operational,
        }
    }
}

/// Holds `jid -> Bridge`. Reads that enumerate operational bridges take a
/// snapshot (§5); the map itself is a `DashMap` for low-contention
/// concurrent access, matching `ConferenceRoom::participants` in the
/// grounding corpus.
pub struct BridgeRegistry {
    bridges: DashMap<String, Bridge>,
    failure_reset_threshold: Duration,
    next_discovery_order: std::sync::atomic::AtomicU64,
    events: tokio::sync::broadcast::Sender<BridgeEvent>,
}

impl BridgeRegistry {
    pub fn new(failure_reset_threshold: Duration) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(256);
        Self {
            bridges: DashMap::new(),
            failure_reset_threshold,
            next_discovery_order: std::sync::atomic::AtomicU64::new(0),
            events: tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Idempotent: re-adding an already-known bridge is a no-op besides an
    /// optional version bump.
    pub fn add_bridge(&self, jid: &str, version: Option<String>) {
        if let Some(mut existing) = self.bridges.get_mut(jid) {
            if version.is_some() {
                existing.version = version;
            }
            return;
        }
        let order = self
            .next_discovery_order
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.bridges
            .insert(jid.to_string(), Bridge::new(jid.to_string(), version, order));
        let _ = self.events.send(BridgeEvent::Up { bridge_jid: jid.to_string() });
        tracing::info!(bridge = jid, "bridge added to registry");
    }

    pub fn remove_bridge(&self, jid: &str) {
        if self.bridges.remove(jid).is_some() {
            let _ = self.events.send(BridgeEvent::Down { bridge_jid: jid.to_string() });
            tracing::info!(bridge = jid, "bridge removed from registry");
        }
    }

    pub fn get(&self, jid: &str) -> Option<Bridge> {
        self.bridges.get(jid).map(|b| b.clone())
    }

    pub fn get_known_count(&self) -> usize {
        self.bridges.len()
    }

    /// Operational bridges only, ordered per §4.3: ascending estimated load,
    /// ties broken by discovery order.
    pub fn list_operational(&self) -> Vec<Bridge> {
        let threshold = self.failure_reset_threshold;
        let mut bridges: Vec<Bridge> = self
            .bridges
            .iter()
            .map(|e| e.value().clone())
            .filter(|b| b.is_operational(threshold))
            .collect();
        bridges.sort_by(|a, b| compare_bridges(a, b, threshold));
        bridges
    }

    /// Replaces the stats snapshot, resets `video_stream_count_diff`
    /// unconditionally, and flips operational to the negation of
    /// `shutdown_in_progress` (§4.3).
    pub fn set_stats(&self, jid: &str, stats: BridgeStats) {
        if let Some(mut bridge) = self.bridges.get_mut(jid) {
            let now_operational = !stats.shutdown_in_progress;
            bridge.stats = Some(stats);
            bridge.video_stream_count_diff = 0;
            if bridge.operational != now_operational {
                self.set_operational_locked(&mut bridge, now_operational);
            }
        }
    }

    pub fn on_video_streams_changed(&self, jid: &str, delta: i64) {
        if let Some(mut bridge) = self.bridges.get_mut(jid) {
            bridge.video_stream_count_diff += delta;
            let _ = self.events.send(BridgeEvent::VideoStreamsChanged {
                bridge_jid: jid.to_string(),
                delta,
            });
        }
    }

    pub fn set_operational(&self, jid: &str, operational: bool) {
        if let Some(mut bridge) = self.bridges.get_mut(jid) {
            self.set_operational_locked(&mut bridge, operational);
        }
    }

    fn set_operational_locked(&self, bridge: &mut Bridge, operational: bool) {
        bridge.operational = operational;
        if operational {
            bridge.failure_timestamp = None;
        } else {
            bridge.failure_timestamp = Some(Instant::now());
            tracing::warn!(bridge = %bridge.jid, "bridge marked non-operational");
        }
    }

    /// Convenience for the health-checker and allocator failure paths:
    /// marks non-operational and fires `HealthCheckFailed`.
    pub fn report_health_check_failed(&self, jid: &str) {
        self.set_operational(jid, false);
        let _ = self.events.send(BridgeEvent::HealthCheckFailed {
            bridge_jid: jid.to_string(),
        });
    }
}

/// Total order with operational status as the primary key: a non-operational
/// bridge always compares greater than an operational one, regardless of
/// load (invariant 5, §8). Within the same operational status, ascending
/// load, ties by discovery order. Exposed as a free function per §9 Design
/// Notes ("surface it as a pure comparison function... not as a method on
/// the entity").
pub fn compare_bridges(a: &Bridge, b: &Bridge, failure_reset_threshold: Duration) -> std::cmp::Ordering {
    let a_operational = a.is_operational(failure_reset_threshold);
    let b_operational = b.is_operational(failure_reset_threshold);
    b_operational
        .cmp(&a_operational)
        .then_with(|| a.estimated_load().cmp(&b.estimated_load()))
        .then_with(|| a.discovery_order.cmp(&b.discovery_order))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_ascending_load_with_discovery_tiebreak() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        registry.add_bridge("b1", None);
        registry.add_bridge("b2", None);
        registry.set_stats(
            "b1",
            BridgeStats {
                region: Some("us".into()),
                relay_id: Some("r1".into()),
                video_stream_count: 10,
                shutdown_in_progress: false,
            },
        );
        registry.set_stats(
            "b2",
            BridgeStats {
                region: Some("eu".into()),
                relay_id: Some("r2".into()),
                video_stream_count: 3,
                shutdown_in_progress: false,
            },
        );

        let ordered = registry.list_operational();
        assert_eq!(ordered[0].jid, "b2");
        assert_eq!(ordered[1].jid, "b1");
    }

    /// Invariant 5 (§8): non-operational bridges sort greater than
    /// operational ones regardless of load, exercised against the
    /// comparator directly rather than through `list_operational`'s
    /// pre-filtered output.
    #[test]
    fn compare_bridges_ranks_non_operational_above_any_operational_load() {
        let threshold = Duration::from_millis(300_000);
        let registry = BridgeRegistry::new(threshold);
        registry.add_bridge("heavy-but-up", None);
        registry.add_bridge("light-but-down", None);
        registry.set_stats(
            "heavy-but-up",
            BridgeStats { region: None, relay_id: None, video_stream_count: 100, shutdown_in_progress: false },
        );
        registry.set_stats(
            "light-but-down",
            BridgeStats { region: None, relay_id: None, video_stream_count: 0, shutdown_in_progress: false },
        );
        registry.set_operational("light-but-down", false);

        let heavy_but_up = registry.get("heavy-but-up").unwrap();
        let light_but_down = registry.get("light-but-down").unwrap();

        assert_eq!(
            compare_bridges(&heavy_but_up, &light_but_down, threshold),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_bridges(&light_but_down, &heavy_but_up, threshold),
            std::cmp::Ordering::Greater
        );
    }

    #[test]
    fn failure_reset_returns_to_operational_without_new_stats() {
        let registry = BridgeRegistry::new(Duration::from_millis(20));
        registry.add_bridge("b1", None);
        registry.set_operational("b1", false);
        assert!(registry.list_operational().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.list_operational().len(), 1);
    }

    #[test]
    fn set_stats_resets_diff_unconditionally() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        registry.add_bridge("b1", None);
        registry.on_video_streams_changed("b1", 5);
        assert_eq!(registry.get("b1").unwrap().estimated_load(), 5);

        registry.set_stats(
            "b1",
            BridgeStats {
                region: None,
                relay_id: None,
                video_stream_count: 5,
                shutdown_in_progress: false,
            },
        );
        assert_eq!(registry.get("b1").unwrap().estimated_load(), 5);
    }

    #[test]
    fn shutdown_in_progress_flips_operational_and_sets_failure_timestamp() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        registry.add_bridge("b1", None);
        registry.set_stats(
            "b1",
            BridgeStats {
                region: None,
                relay_id: None,
                video_stream_count: 0,
                shutdown_in_progress: true,
            },
        );
        assert!(registry.list_operational().is_empty());
    }

    #[test]
    fn add_bridge_is_idempotent() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        registry.add_bridge("b1", Some("v1".into()));
        registry.add_bridge("b1", Some("v2".into()));
        assert_eq!(registry.get_known_count(), 1);
        assert_eq!(registry.get("b1").unwrap().version.as_deref(), Some("v2"));
    }
}
