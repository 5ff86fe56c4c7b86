//! Policy that picks a bridge for a (conference, participant) pair
//! (component C4). Pure function over the operational bridge list plus the
//! conference's currently-used bridges — no state of its own.

use std::time::Duration;

use rand::seq::SliceRandom;

use super::registry::{compare_bridges, Bridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Single,
    Split,
    RegionBased,
}

impl SelectionStrategy {
    /// Parsed from the `bridge-selection-strategy` config key; an
    /// unrecognised name falls back to `single` and logs an error (§4.4).
    pub fn from_config_name(name: &str) -> Self {
        match name {
            "single" => SelectionStrategy::Single,
            "split" => SelectionStrategy::Split,
            "region-based" => SelectionStrategy::RegionBased,
            other => {
                tracing::error!(strategy = other, "unknown bridge-selection-strategy, falling back to single");
                SelectionStrategy::Single
            }
        }
    }
}

/// Bridges already in use by the conference, in the order they were added.
pub struct ConferenceBridges<'a> {
    pub in_use: &'a [Bridge],
}

pub struct BridgeSelector {
    pub strategy: SelectionStrategy,
    /// Threshold `compare_bridges` uses to re-derive operational status as
    /// its primary sort key (§8 invariant 5), matching `BridgeRegistry`'s.
    failure_reset_threshold: Duration,
}

impl BridgeSelector {
    pub fn new(strategy: SelectionStrategy, failure_reset_threshold: Duration) -> Self {
        Self { strategy, failure_reset_threshold }
    }

    pub fn select<'a>(
        &self,
        operational: &'a [Bridge],
        conference: &ConferenceBridges<'_>,
        participant_region: Option<&str>,
    ) -> Option<Bridge> {
        match self.strategy {
            SelectionStrategy::Single => self.select_single(operational, conference),
            SelectionStrategy::Split => self.select_split(operational, conference),
            SelectionStrategy::RegionBased => {
                self.select_region_based(operational, conference, participant_region)
            }
        }
    }

    /// Once a conference has a bridge, always return it. Logs an error if
    /// the conference somehow has more than one. If the chosen bridge isn't
    /// operational, returns `None` (the conference must restart) (§4.4).
    fn select_single(
        &self,
        operational: &[Bridge],
        conference: &ConferenceBridges<'_>,
    ) -> Option<Bridge> {
        if !conference.in_use.is_empty() {
            if conference.in_use.len() > 1 {
                tracing::error!("single-bridge conference unexpectedly has more than one bridge");
            }
            let current = &conference.in_use[0];
            return operational.iter().find(|b| b.jid == current.jid).cloned();
        }
        let mut ordered: Vec<Bridge> = operational.to_vec();
        ordered.sort_by(|a, b| compare_bridges(a, b, self.failure_reset_threshold));
        ordered.into_iter().next()
    }

    /// Prefers any operational bridge not already used by the conference;
    /// else a random one among those used (§4.4 — test strategy).
    fn select_split(
        &self,
        operational: &[Bridge],
        conference: &ConferenceBridges<'_>,
    ) -> Option<Bridge> {
        let unused = operational
            .iter()
            .find(|b| !conference.in_use.iter().any(|u| u.jid == b.jid));
        if let Some(bridge) = unused {
            return Some(bridge.clone());
        }
        conference.in_use.choose(&mut rand::thread_rng()).cloned()
    }

    /// Region-aware placement (§4.4).
    fn select_region_based(
        &self,
        operational: &[Bridge],
        conference: &ConferenceBridges<'_>,
        participant_region: Option<&str>,
    ) -> Option<Bridge> {
        if conference.in_use.is_empty() {
            if let Some(region) = participant_region {
                if let Some(matching) = operational.iter().find(|b| b.region() == Some(region)) {
                    return Some(matching.clone());
                }
            }
            let mut ordered: Vec<Bridge> = operational.to_vec();
            ordered.sort_by(|a, b| compare_bridges(a, b, self.failure_reset_threshold));
            return ordered.into_iter().next();
        }

        // Multi-bridge mode requires the first bridge to advertise a relay-id;
        // otherwise fall back to that first bridge regardless of region.
        let first = &conference.in_use[0];
        if first.relay_id().is_none() {
            return operational.iter().find(|b| b.jid == first.jid).cloned();
        }

        if let Some(region) = participant_region {
            if let Some(existing_in_region) = conference
                .in_use
                .iter()
                .find(|b| b.region() == Some(region))
            {
                return operational
                    .iter()
                    .find(|b| b.jid == existing_in_region.jid)
                    .cloned();
            }
            if let Some(new_in_region) = operational.iter().find(|b| {
                b.region() == Some(region) && !conference.in_use.iter().any(|u| u.jid == b.jid)
            }) {
                return Some(new_in_region.clone());
            }
        }

        // Fall back to the least-loaded bridge already used by the conference.
        let mut candidates: Vec<Bridge> = conference
            .in_use
            .iter()
            .filter_map(|u| operational.iter().find(|b| b.jid == u.jid).cloned())
            .collect();
        candidates.sort_by(|a, b| compare_bridges(a, b, self.failure_reset_threshold));
        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::{BridgeRegistry, BridgeStats};
    use std::time::Duration;

    fn bridge(registry: &BridgeRegistry, jid: &str, region: &str, streams: i64, relay_id: bool) {
        registry.add_bridge(jid, None);
        registry.set_stats(
            jid,
            BridgeStats {
                region: Some(region.into()),
                relay_id: if relay_id { Some(format!("{jid}-relay")) } else { None },
                video_stream_count: streams,
                shutdown_in_progress: false,
            },
        );
    }

    #[test]
    fn single_strategy_sticks_to_first_bridge() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        bridge(&registry, "b1", "us", 10, true);
        bridge(&registry, "b2", "eu", 3, true);
        let operational = registry.list_operational();

        let selector = BridgeSelector::new(SelectionStrategy::Single, Duration::from_millis(300_000));
        let first_pick = selector
            .select(&operational, &ConferenceBridges { in_use: &[] }, None)
            .unwrap();
        assert_eq!(first_pick.jid, "b2"); // lowest load picked initially

        let in_use = vec![first_pick];
        let second_pick = selector
            .select(&operational, &ConferenceBridges { in_use: &in_use }, None)
            .unwrap();
        assert_eq!(second_pick.jid, "b2");
    }

    #[test]
    fn single_strategy_returns_none_if_chosen_bridge_down() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        bridge(&registry, "b1", "us", 10, true);
        registry.set_operational("b1", false);
        let operational = registry.list_operational();
        let stale = vec![registry.get("b1").unwrap()];

        let selector = BridgeSelector::new(SelectionStrategy::Single, Duration::from_millis(300_000));
        assert!(selector
            .select(&operational, &ConferenceBridges { in_use: &stale }, None)
            .is_none());
    }

    #[test]
    fn region_based_prefers_matching_region_for_empty_conference() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        bridge(&registry, "b_us", "us", 0, true);
        bridge(&registry, "b_eu", "eu", 0, true);
        let operational = registry.list_operational();

        let selector = BridgeSelector::new(SelectionStrategy::RegionBased, Duration::from_millis(300_000));
        let pick = selector
            .select(&operational, &ConferenceBridges { in_use: &[] }, Some("us"))
            .unwrap();
        assert_eq!(pick.jid, "b_us");
    }

    #[test]
    fn region_based_adds_new_bridge_for_new_region() {
        // S5 from spec §8.
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        bridge(&registry, "b_us", "us", 0, true);
        bridge(&registry, "b_eu", "eu", 0, true);
        let operational = registry.list_operational();

        let selector = BridgeSelector::new(SelectionStrategy::RegionBased, Duration::from_millis(300_000));
        let b_us = operational.iter().find(|b| b.jid == "b_us").unwrap().clone();
        let in_use = vec![b_us];
        let pick = selector
            .select(&operational, &ConferenceBridges { in_use: &in_use }, Some("eu"))
            .unwrap();
        assert_eq!(pick.jid, "b_eu");
    }

    #[test]
    fn region_based_falls_back_to_first_bridge_without_relay_id() {
        let registry = BridgeRegistry::new(Duration::from_millis(300_000));
        bridge(&registry, "b_us", "us", 0, false);
        bridge(&registry, "b_eu", "eu", 0, false);
        let operational = registry.list_operational();

        let selector = BridgeSelector::new(SelectionStrategy::RegionBased, Duration::from_millis(300_000));
        let b_us = operational.iter().find(|b| b.jid == "b_us").unwrap().clone();
        let in_use = vec![b_us];
        let pick = selector
            .select(&operational, &ConferenceBridges { in_use: &in_use }, Some("eu"))
            .unwrap();
        assert_eq!(pick.jid, "b_us");
    }

    #[test]
    fn unknown_strategy_name_falls_back_to_single() {
        assert_eq!(SelectionStrategy::from_config_name("bogus"), SelectionStrategy::Single);
    }
}
