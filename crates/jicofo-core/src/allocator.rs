//! Cancellable per-participant allocation task (component C7).
//!
//! Decoupled from `ConferenceController` through [`AllocatorCallbacks`] so
//! this module has no dependency on `conference` — the controller spawns one
//! of these per invite/re-invite and reacts to the callbacks it receives,
//! the same inversion `registrar-core`'s `RegistrationManager` uses against
//! its registrar trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::{
    AllocatedChannels, BridgeControlAdapter, ChannelAllocationError, FeatureDiscoveryAdapter,
    OfferContents, SessionAdapter, SupportedFeatures,
};
use crate::bridge::{Bridge, BridgeRegistry, BridgeSelector, ConferenceBridges};
use crate::lipsync::{self, LipSyncTarget};
use crate::source::{MediaSourceGroupMap, MediaSourceMap};

/// `NEW -> DISCOVERING -> OFFER_BUILT -> ALLOCATING -> OFFER_SENT -> DONE`,
/// with `FAILED_RETRY`, `CANCELLED`, `ABORTED` branches (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorState {
    Done,
    Cancelled,
    Aborted,
}

/// Cooperative cancellation observed at every await point (§4.7, §5).
/// Cloning shares the same flag; cancelling one handle cancels the task.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Hooks the allocator calls into `ConferenceController` for everything it
/// cannot decide on its own: building the content list, reading the
/// conference-wide source set, and reacting to terminal outcomes.
#[async_trait]
pub trait AllocatorCallbacks: Send + Sync {
    async fn build_offer_contents(&self, target_jid: &str, features: &SupportedFeatures) -> OfferContents;

    /// Bridges already in use by this conference, for the selector.
    async fn bridges_in_use(&self) -> Vec<Bridge>;

    async fn conference_sources_for(&self, excluding_jid: &str) -> (MediaSourceMap, MediaSourceGroupMap);

    fn lip_sync_target(&self, target_jid: &str) -> LipSyncTarget;

    async fn on_first_allocation_on_bridge(&self, target_jid: &str, bridge_jid: &str);
    async fn on_allocation_rejected(&self, target_jid: &str, reason: String);
    async fn on_bridge_failed(&self, bridge_jid: &str);
    async fn on_invite_failed(&self, target_jid: &str);
    async fn on_established(&self, target_jid: &str, channels: AllocatedChannels);
}

/// Looks up the colibri-control handle for a given bridge. One conference
/// can span several bridges (multi-bridge/Octo, §4.9), each with its own
/// bridge-session, hence a factory rather than a single adapter instance.
pub trait BridgeControlFactory: Send + Sync {
    fn get(&self, bridge_jid: &str) -> Arc<dyn BridgeControlAdapter>;
}

pub struct ChannelAllocator {
    pub target_jid: String,
    pub endpoint_id: String,
    pub stat_id: String,
    pub start_muted: (bool, bool),
    pub re_invite: bool,
    pub participant_region: Option<String>,
    pub enable_lip_sync: bool,
    cancel: CancelToken,
    feature_discovery: Arc<dyn FeatureDiscoveryAdapter>,
    bridge_control: Arc<dyn BridgeControlFactory>,
    session: Arc<dyn SessionAdapter>,
    registry: Arc<BridgeRegistry>,
    selector: Arc<BridgeSelector>,
    callbacks: Arc<dyn AllocatorCallbacks>,
}

impl ChannelAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_jid: impl Into<String>,
        endpoint_id: impl Into<String>,
        stat_id: impl Into<String>,
        re_invite: bool,
        feature_discovery: Arc<dyn FeatureDiscoveryAdapter>,
        bridge_control: Arc<dyn BridgeControlFactory>,
        session: Arc<dyn SessionAdapter>,
        registry: Arc<BridgeRegistry>,
        selector: Arc<BridgeSelector>,
        callbacks: Arc<dyn AllocatorCallbacks>,
    ) -> Self {
        Self {
            target_jid: target_jid.into(),
            endpoint_id: endpoint_id.into(),
            stat_id: stat_id.into(),
            start_muted: (false, false),
            re_invite,
            participant_region: None,
            enable_lip_sync: false,
            cancel: CancelToken::new(),
            feature_discovery,
            bridge_control,
            session,
            registry,
            selector,
            callbacks,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs the state machine to completion. Exactly one allocator should be
    /// active per participant at a time; the caller is responsible for
    /// cancelling any predecessor synchronously before spawning a new one
    /// (§4.7, §5).
    pub async fn run(&self) -> AllocatorState {
        if self.cancelled() {
            return AllocatorState::Cancelled;
        }

        // NEW -> DISCOVERING
        let features = match self.feature_discovery.discover_features(&self.target_jid).await {
            Ok(features) => features,
            Err(reason) => {
                tracing::warn!(target = self.target_jid, reason, "feature discovery failed, aborting invite");
                self.callbacks.on_invite_failed(&self.target_jid).await;
                return AllocatorState::Aborted;
            }
        };
        if self.cancelled() {
            return AllocatorState::Cancelled;
        }

        // DISCOVERING -> OFFER_BUILT
        let offer = self.callbacks.build_offer_contents(&self.target_jid, &features).await;
        if self.cancelled() {
            return AllocatorState::Cancelled;
        }

        // OFFER_BUILT -> ALLOCATING: pick a bridge.
        let Some(mut bridge) = self.pick_bridge().await else {
            tracing::warn!(target = self.target_jid, "no bridge available for invite");
            self.callbacks.on_invite_failed(&self.target_jid).await;
            return AllocatorState::Aborted;
        };

        let channels = loop {
            if self.cancelled() {
                return AllocatorState::Cancelled;
            }
            let control = self.bridge_control.get(&bridge.jid);
            if control.is_disposed() {
                return AllocatorState::Aborted;
            }

            match control
                .create_channels(&self.endpoint_id, &self.stat_id, !self.re_invite, &offer)
                .await
            {
                Ok(channels) => {
                    self.callbacks.on_first_allocation_on_bridge(&self.target_jid, &bridge.jid).await;
                    break channels;
                }
                Err(ChannelAllocationError::BadRequest { reason }) => {
                    tracing::warn!(target = self.target_jid, reason, "bridge rejected channel description");
                    self.callbacks.on_allocation_rejected(&self.target_jid, reason).await;
                    return AllocatorState::Aborted;
                }
                Err(ChannelAllocationError::Other { reason }) => {
                    tracing::warn!(bridge = bridge.jid, reason, "channel allocation failed, failing bridge over");
                    self.registry.report_health_check_failed(&bridge.jid);
                    self.callbacks.on_bridge_failed(&bridge.jid).await;

                    match self.pick_bridge().await {
                        Some(next) => bridge = next,
                        None => {
                            self.callbacks.on_invite_failed(&self.target_jid).await;
                            return AllocatorState::Aborted;
                        }
                    }
                }
            }
        };

        if self.cancelled() {
            self.bridge_control.get(&bridge.jid).expire_channels(&self.endpoint_id).await;
            return AllocatorState::Cancelled;
        }

        // ALLOCATING -> OFFER_SENT: augment the offer with the allocation
        // reply's transport info and every other participant's sources,
        // filtered for lip-sync (§4.7).
        let (others_sources, others_groups) = self.callbacks.conference_sources_for(&self.target_jid).await;
        let target = self.callbacks.lip_sync_target(&self.target_jid);
        let filtered_sources = lipsync::rewrite_for_target(&others_sources, self.enable_lip_sync, &target);

        let mut offer = offer;
        offer.ice_candidates = channels.ice_candidates.clone();
        offer.rtcp_mux = channels.rtcp_mux;
        offer.sctp_port = channels.sctp_port;
        offer.sources = filtered_sources;
        offer.source_groups = others_groups;

        let ack = if self.re_invite {
            self.session.replace_transport(&self.target_jid, &offer, self.start_muted).await
        } else {
            self.session.initiate_session(&self.target_jid, &offer, self.start_muted).await
        };

        if !ack {
            self.bridge_control.get(&bridge.jid).expire_channels(&self.endpoint_id).await;
            self.callbacks.on_invite_failed(&self.target_jid).await;
            return AllocatorState::Aborted;
        }

        // OFFER_SENT -> DONE
        if self.cancelled() {
            self.bridge_control.get(&bridge.jid).expire_channels(&self.endpoint_id).await;
            return AllocatorState::Cancelled;
        }
        self.callbacks.on_established(&self.target_jid, channels).await;
        AllocatorState::Done
    }

    async fn pick_bridge(&self) -> Option<Bridge> {
        let operational = self.registry.list_operational();
        let in_use = self.callbacks.bridges_in_use().await;
        self.selector
            .select(&operational, &ConferenceBridges { in_use: &in_use }, self.participant_region.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeStats, SelectionStrategy};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeFeatureDiscovery {
        fail: bool,
    }
    #[async_trait]
    impl FeatureDiscoveryAdapter for FakeFeatureDiscovery {
        async fn discover_features(&self, _jid: &str) -> Result<SupportedFeatures, String> {
            if self.fail {
                Err("timeout".into())
            } else {
                Ok(SupportedFeatures { audio: true, video: true, ..Default::default() })
            }
        }
    }

    struct FakeSession {
        ack: bool,
    }
    #[async_trait]
    impl SessionAdapter for FakeSession {
        async fn initiate_session(&self, _t: &str, _c: &OfferContents, _m: (bool, bool)) -> bool {
            self.ack
        }
        async fn replace_transport(&self, _t: &str, _c: &OfferContents, _m: (bool, bool)) -> bool {
            self.ack
        }
        async fn send_add_source(&self, _t: &str, _s: &MediaSourceMap, _g: &MediaSourceGroupMap) {}
        async fn send_remove_source(&self, _t: &str, _s: &MediaSourceMap, _g: &MediaSourceGroupMap) {}
        async fn terminate_session(&self, _t: &str, _r: &str, _m: &str) {}
    }

    struct FakeBridgeControl {
        outcome: Mutex<Vec<Result<AllocatedChannels, ChannelAllocationError>>>,
    }
    #[async_trait]
    impl BridgeControlAdapter for FakeBridgeControl {
        async fn create_channels(&self, _e: &str, _s: &str, _i: bool, _c: &OfferContents) -> Result<AllocatedChannels, ChannelAllocationError> {
            self.outcome.lock().unwrap().remove(0)
        }
        async fn expire_channels(&self, _e: &str) {}
        fn is_disposed(&self) -> bool {
            false
        }
    }

    struct FakeBridgeControlFactory {
        controls: std::collections::HashMap<String, Arc<FakeBridgeControl>>,
    }
    impl BridgeControlFactory for FakeBridgeControlFactory {
        fn get(&self, bridge_jid: &str) -> Arc<dyn BridgeControlAdapter> {
            self.controls.get(bridge_jid).cloned().unwrap() as Arc<dyn BridgeControlAdapter>
        }
    }

    struct FakeCallbacks {
        log: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl AllocatorCallbacks for FakeCallbacks {
        async fn build_offer_contents(&self, _t: &str, _f: &SupportedFeatures) -> OfferContents {
            OfferContents::default()
        }
        async fn bridges_in_use(&self) -> Vec<Bridge> {
            vec![]
        }
        async fn conference_sources_for(&self, _e: &str) -> (MediaSourceMap, MediaSourceGroupMap) {
            (MediaSourceMap::new(), MediaSourceGroupMap::new())
        }
        fn lip_sync_target(&self, _t: &str) -> LipSyncTarget {
            LipSyncTarget { supports_lip_sync: false }
        }
        async fn on_first_allocation_on_bridge(&self, _target_jid: &str, bridge_jid: &str) {
            self.log.lock().unwrap().push(format!("first_alloc:{bridge_jid}"));
        }
        async fn on_allocation_rejected(&self, _t: &str, _r: String) {
            self.log.lock().unwrap().push("rejected".into());
        }
        async fn on_bridge_failed(&self, bridge_jid: &str) {
            self.log.lock().unwrap().push(format!("bridge_failed:{bridge_jid}"));
        }
        async fn on_invite_failed(&self, _t: &str) {
            self.log.lock().unwrap().push("invite_failed".into());
        }
        async fn on_established(&self, _t: &str, _c: AllocatedChannels) {
            self.log.lock().unwrap().push("established".into());
        }
    }

    fn setup_registry_with_bridge(jid: &str) -> Arc<BridgeRegistry> {
        let registry = Arc::new(BridgeRegistry::new(Duration::from_millis(300_000)));
        registry.add_bridge(jid, None);
        registry.set_stats(
            jid,
            BridgeStats { region: None, relay_id: None, video_stream_count: 0, shutdown_in_progress: false },
        );
        registry
    }

    #[tokio::test]
    async fn happy_path_reaches_done_and_notifies_established() {
        let registry = setup_registry_with_bridge("b1");
        let selector = Arc::new(BridgeSelector::new(SelectionStrategy::Single, Duration::from_millis(300_000)));
        let mut controls = std::collections::HashMap::new();
        controls.insert(
            "b1".to_string(),
            Arc::new(FakeBridgeControl { outcome: Mutex::new(vec![Ok(AllocatedChannels::default())]) }),
        );
        let callbacks = Arc::new(FakeCallbacks { log: Mutex::new(vec![]) });

        let allocator = ChannelAllocator::new(
            "p1@room",
            "ep1",
            "stat1",
            false,
            Arc::new(FakeFeatureDiscovery { fail: false }),
            Arc::new(FakeBridgeControlFactory { controls }),
            Arc::new(FakeSession { ack: true }),
            registry,
            selector,
            callbacks.clone(),
        );

        assert_eq!(allocator.run().await, AllocatorState::Done);
        let log = callbacks.log.lock().unwrap();
        assert_eq!(log.as_slice(), ["first_alloc:b1", "established"]);
    }

    #[tokio::test]
    async fn feature_discovery_failure_aborts() {
        let registry = setup_registry_with_bridge("b1");
        let selector = Arc::new(BridgeSelector::new(SelectionStrategy::Single, Duration::from_millis(300_000)));
        let callbacks = Arc::new(FakeCallbacks { log: Mutex::new(vec![]) });
        let allocator = ChannelAllocator::new(
            "p1@room",
            "ep1",
            "stat1",
            false,
            Arc::new(FakeFeatureDiscovery { fail: true }),
            Arc::new(FakeBridgeControlFactory { controls: Default::default() }),
            Arc::new(FakeSession { ack: true }),
            registry,
            selector,
            callbacks.clone(),
        );

        assert_eq!(allocator.run().await, AllocatorState::Aborted);
        assert_eq!(callbacks.log.lock().unwrap().as_slice(), ["invite_failed"]);
    }

    #[tokio::test]
    async fn bad_request_aborts_without_marking_bridge_non_operational() {
        let registry = setup_registry_with_bridge("b1");
        let selector = Arc::new(BridgeSelector::new(SelectionStrategy::Single, Duration::from_millis(300_000)));
        let mut controls = std::collections::HashMap::new();
        controls.insert(
            "b1".to_string(),
            Arc::new(FakeBridgeControl {
                outcome: Mutex::new(vec![Err(ChannelAllocationError::BadRequest { reason: "bad offer".into() })]),
            }),
        );
        let callbacks = Arc::new(FakeCallbacks { log: Mutex::new(vec![]) });
        let allocator = ChannelAllocator::new(
            "p1@room",
            "ep1",
            "stat1",
            false,
            Arc::new(FakeFeatureDiscovery { fail: false }),
            Arc::new(FakeBridgeControlFactory { controls }),
            Arc::new(FakeSession { ack: true }),
            registry.clone(),
            selector,
            callbacks.clone(),
        );

        assert_eq!(allocator.run().await, AllocatorState::Aborted);
        assert_eq!(callbacks.log.lock().unwrap().as_slice(), ["rejected"]);
        assert!(registry.get("b1").unwrap().is_operational(Duration::from_millis(300_000)));
    }

    #[tokio::test]
    async fn other_error_fails_bridge_over_to_next_operational_bridge() {
        let registry = Arc::new(BridgeRegistry::new(Duration::from_millis(300_000)));
        for jid in ["b1", "b2"] {
            registry.add_bridge(jid, None);
            registry.set_stats(
                jid,
                BridgeStats { region: None, relay_id: None, video_stream_count: 0, shutdown_in_progress: false },
            );
        }
        let selector = Arc::new(BridgeSelector::new(SelectionStrategy::Split, Duration::from_millis(300_000)));
        let mut controls = std::collections::HashMap::new();
        controls.insert(
            "b1".to_string(),
            Arc::new(FakeBridgeControl {
                outcome: Mutex::new(vec![Err(ChannelAllocationError::Other { reason: "timeout".into() })]),
            }),
        );
        controls.insert(
            "b2".to_string(),
            Arc::new(FakeBridgeControl { outcome: Mutex::new(vec![Ok(AllocatedChannels::default())]) }),
        );
        let callbacks = Arc::new(FakeCallbacks { log: Mutex::new(vec![]) });

        let allocator = ChannelAllocator::new(
            "p1@room",
            "ep1",
            "stat1",
            false,
            Arc::new(FakeFeatureDiscovery { fail: false }),
            Arc::new(FakeBridgeControlFactory { controls }),
            Arc::new(FakeSession { ack: true }),
            registry.clone(),
            selector,
            callbacks.clone(),
        );

        assert_eq!(allocator.run().await, AllocatorState::Done);
        assert!(!registry.get("b1").unwrap().is_operational(Duration::from_millis(300_000)));
    }

    #[tokio::test]
    async fn cancel_before_run_short_circuits() {
        let registry = setup_registry_with_bridge("b1");
        let selector = Arc::new(BridgeSelector::new(SelectionStrategy::Single, Duration::from_millis(300_000)));
        let callbacks = Arc::new(FakeCallbacks { log: Mutex::new(vec![]) });
        let allocator = ChannelAllocator::new(
            "p1@room",
            "ep1",
            "stat1",
            false,
            Arc::new(FakeFeatureDiscovery { fail: false }),
            Arc::new(FakeBridgeControlFactory { controls: Default::default() }),
            Arc::new(FakeSession { ack: true }),
            registry,
            selector,
            callbacks,
        );
        allocator.cancel_token().cancel();
        assert_eq!(allocator.run().await, AllocatorState::Cancelled);
    }
}
