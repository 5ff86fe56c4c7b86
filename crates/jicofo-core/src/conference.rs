//! Per-conference orchestrator (component C9). Owns the participant list,
//! the bridge-sessions in use, and the Octo relay topology; membership and
//! source events drive `ChannelAllocator` tasks and fan out source changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::adapters::{AllocatedChannels, FeatureDiscoveryAdapter, OfferContents, SessionAdapter, SupportedFeatures};
use crate::allocator::{AllocatorCallbacks, AllocatorState, BridgeControlFactory, ChannelAllocator};
use crate::bridge::{Bridge, BridgeRegistry, BridgeSelector};
use crate::error::{JicofoError, Result};
use crate::lipsync::LipSyncTarget;
use crate::participant::{OctoParticipant, Participant};
use crate::source::{MediaSourceGroupMap, MediaSourceMap, MediaType};

/// Per-bridge state for one conference: which bridges currently host
/// participants, and whether colibri control on that bridge has failed (§3,
/// §4.9, §5 "Restart semantics on bridge failure").
struct BridgeSessionState {
    has_failed: bool,
}

pub struct ConferenceController {
    pub room_id: String,
    max_sources_per_user: usize,
    enable_lip_sync: bool,
    open_sctp: bool,
    participants: RwLock<HashMap<String, Participant>>,
    bridge_sessions: RwLock<HashMap<String, BridgeSessionState>>,
    octo_participants: RwLock<HashMap<String, OctoParticipant>>,
    registry: Arc<BridgeRegistry>,
    selector: Arc<BridgeSelector>,
    session: Arc<dyn SessionAdapter>,
    feature_discovery: Arc<dyn FeatureDiscoveryAdapter>,
    bridge_control: Arc<dyn BridgeControlFactory>,
}

impl ConferenceController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room_id: impl Into<String>,
        max_sources_per_user: usize,
        enable_lip_sync: bool,
        open_sctp: bool,
        registry: Arc<BridgeRegistry>,
        selector: Arc<BridgeSelector>,
        session: Arc<dyn SessionAdapter>,
        feature_discovery: Arc<dyn FeatureDiscoveryAdapter>,
        bridge_control: Arc<dyn BridgeControlFactory>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            max_sources_per_user,
            enable_lip_sync,
            open_sctp,
            participants: RwLock::new(HashMap::new()),
            bridge_sessions: RwLock::new(HashMap::new()),
            octo_participants: RwLock::new(HashMap::new()),
            registry,
            selector,
            session,
            feature_discovery,
            bridge_control,
        }
    }

    /// `member-joined`: creates the participant and spawns an inviting
    /// `ChannelAllocator` (§4.7, §4.8 `JOINED -> INVITING`).
    pub async fn on_member_joined(self: &Arc<Self>, jid: &str, endpoint_id: &str, region: Option<String>) {
        let mut participant = Participant::new(jid, endpoint_id, self.max_sources_per_user);
        participant.start_inviting();
        self.participants.write().await.insert(jid.to_string(), participant);
        self.spawn_allocator(jid, endpoint_id, region, false).await;
    }

    /// `member-left`: releases channels and cancels any active allocator
    /// (§3 Lifecycles).
    pub async fn on_member_left(&self, jid: &str) {
        let mut participants = self.participants.write().await;
        if let Some(participant) = participants.remove(jid) {
            if let (Some(bridge_jid), Some(_)) = (&participant.allocated_bridge, &participant.allocated_channels) {
                self.bridge_control.get(bridge_jid).expire_channels(&participant.endpoint_id).await;
            }
            tracing::info!(jid, "participant left, torn down");
        }
    }

    /// Answer to a session-initiate/transport-replace carrying the
    /// participant's advertised sources (§4.8 `INVITING -> ESTABLISHED`,
    /// §4.9 `onSessionAnswer`).
    pub async fn on_session_answer(&self, jid: &str, sources: MediaSourceMap, groups: MediaSourceGroupMap) -> Result<()> {
        let (accepted_sources, accepted_groups) = self.validate_and_apply_add(jid, &sources, &groups).await?;

        let mut participants = self.participants.write().await;
        let Some(participant) = participants.get_mut(jid) else {
            return Err(JicofoError::session_signalling_failed(jid, "participant gone before answer processed"));
        };
        let drained = participant.establish();
        drop(participants);

        self.fan_out_add(jid, &accepted_sources, &accepted_groups).await;

        // Deliver this participant's own drained pending queues (§4.8,
        // invariant 7: pending-drain).
        if !drained.to_add.0.is_empty() || !drained.to_add.1.is_empty() {
            self.session.send_add_source(jid, &drained.to_add.0, &drained.to_add.1).await;
        }
        if !drained.to_remove.0.is_empty() || !drained.to_remove.1.is_empty() {
            self.session.send_remove_source(jid, &drained.to_remove.0, &drained.to_remove.1).await;
        }

        Ok(())
    }

    /// `source-add` from an established participant: validate, apply, fan
    /// out to every other participant (established immediately, pending
    /// otherwise) (§4.9).
    pub async fn on_source_add(&self, jid: &str, sources: MediaSourceMap, groups: MediaSourceGroupMap) -> Result<()> {
        let (accepted_sources, accepted_groups) = self.validate_and_apply_add(jid, &sources, &groups).await?;
        self.fan_out_add(jid, &accepted_sources, &accepted_groups).await;
        Ok(())
    }

    /// `source-remove`: validate against the hypothetical post-removal
    /// state, apply, fan out exactly the effective delta (§4.1, §4.9).
    pub async fn on_source_remove(&self, jid: &str, sources: MediaSourceMap, groups: MediaSourceGroupMap) -> Result<()> {
        let (removed_sources, removed_groups) = {
            let mut participants = self.participants.write().await;
            if !participants.contains_key(jid) {
                return Err(JicofoError::invalid_sources(format!("unknown participant {jid}")));
            }

            let (mut conference_sources, mut conference_groups) = self.union_excluding(&participants, jid);
            let own = participants.get(jid).unwrap();
            conference_sources.add(&own.local_sources);
            conference_groups.add(&own.local_source_groups);
            let validator = crate::source::SourceValidator::new(
                &conference_sources,
                &conference_groups,
                jid,
                self.max_sources_per_user,
            );
            let (removed_sources, removed_groups) = validator.try_remove(&sources, &groups)?;

            let participant = participants.get_mut(jid).unwrap();
            participant.local_sources.remove(&removed_sources);
            participant.local_source_groups.remove(&removed_groups);
            (removed_sources, removed_groups)
        };

        self.fan_out_remove(jid, &removed_sources, &removed_groups).await;
        Ok(())
    }

    /// Bridge went down: every affected bridge-session is marked failed and
    /// every participant on it gets a fresh re-inviting allocator (§4.9, §5).
    pub async fn on_bridge_down(self: &Arc<Self>, bridge_jid: &str) {
        if let Some(session) = self.bridge_sessions.write().await.get_mut(bridge_jid) {
            session.has_failed = true;
        }

        let affected: Vec<(String, String, Option<String>)> = self
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.allocated_bridge.as_deref() == Some(bridge_jid))
            .map(|p| (p.jid.clone(), p.endpoint_id.clone(), None))
            .collect();

        for (jid, endpoint_id, region) in affected {
            self.spawn_allocator(&jid, &endpoint_id, region, true).await;
        }
    }

    /// Union of all other participants' accepted sources/groups, used to
    /// build offers (§4.9 `getAllSources`/`getAllSourceGroups`).
    pub async fn get_all_sources(&self, excluding: &str) -> MediaSourceMap {
        let participants = self.participants.read().await;
        self.union_excluding(&participants, excluding).0
    }

    pub async fn get_all_source_groups(&self, excluding: &str) -> MediaSourceGroupMap {
        let participants = self.participants.read().await;
        self.union_excluding(&participants, excluding).1
    }

    fn union_excluding(
        &self,
        participants: &HashMap<String, Participant>,
        excluding: &str,
    ) -> (MediaSourceMap, MediaSourceGroupMap) {
        let mut sources = MediaSourceMap::new();
        let mut groups = MediaSourceGroupMap::new();
        for participant in participants.values() {
            if participant.jid == excluding {
                continue;
            }
            sources.add(&participant.local_sources);
            groups.add(&participant.local_source_groups);
        }
        (sources, groups)
    }

    async fn validate_and_apply_add(
        &self,
        jid: &str,
        sources: &MediaSourceMap,
        groups: &MediaSourceGroupMap,
    ) -> Result<(MediaSourceMap, MediaSourceGroupMap)> {
        let mut participants = self.participants.write().await;
        if !participants.contains_key(jid) {
            return Err(JicofoError::invalid_sources(format!("unknown participant {jid}")));
        }

        let (conference_sources, conference_groups) = self.union_excluding(&participants, jid);
        let validator = crate::source::SourceValidator::new(
            &conference_sources,
            &conference_groups,
            jid,
            self.max_sources_per_user,
        );
        let (accepted_sources, accepted_groups) = validator.try_add(sources, groups)?;

        let participant = participants.get_mut(jid).unwrap();
        participant.local_sources.add(&accepted_sources);
        participant.local_source_groups.add(&accepted_groups);

        Ok((accepted_sources, accepted_groups))
    }

    async fn fan_out_add(&self, source_jid: &str, sources: &MediaSourceMap, groups: &MediaSourceGroupMap) {
        if sources.is_empty() && groups.is_empty() {
            return;
        }
        let mut participants = self.participants.write().await;
        let targets: Vec<String> = participants.keys().filter(|j| *j != source_jid).cloned().collect();
        for target in targets {
            let established = participants.get(&target).is_some_and(Participant::is_established);
            if established {
                self.session.send_add_source(&target, sources, groups).await;
            } else if let Some(participant) = participants.get_mut(&target) {
                participant.queue_remote_add(sources.clone(), groups.clone());
            }
        }
    }

    async fn fan_out_remove(&self, source_jid: &str, sources: &MediaSourceMap, groups: &MediaSourceGroupMap) {
        if sources.is_empty() && groups.is_empty() {
            return;
        }
        let mut participants = self.participants.write().await;
        let targets: Vec<String> = participants.keys().filter(|j| *j != source_jid).cloned().collect();
        for target in targets {
            let established = participants.get(&target).is_some_and(Participant::is_established);
            if established {
                self.session.send_remove_source(&target, sources, groups).await;
            } else if let Some(participant) = participants.get_mut(&target) {
                participant.queue_remote_remove(sources.clone(), groups.clone());
            }
        }
    }

    async fn spawn_allocator(self: &Arc<Self>, jid: &str, endpoint_id: &str, region: Option<String>, re_invite: bool) {
        let allocator = ChannelAllocator::new(
            jid,
            endpoint_id,
            format!("{endpoint_id}-stat"),
            re_invite,
            self.feature_discovery.clone(),
            self.bridge_control.clone(),
            self.session.clone(),
            self.registry.clone(),
            self.selector.clone(),
            self.clone() as Arc<dyn AllocatorCallbacks>,
        );
        let mut allocator = allocator;
        allocator.participant_region = region;
        allocator.enable_lip_sync = self.enable_lip_sync;

        if let Some(participant) = self.participants.write().await.get_mut(jid) {
            participant.set_active_allocator(allocator.cancel_token());
        }

        let jid = jid.to_string();
        tokio::spawn(async move {
            match allocator.run().await {
                AllocatorState::Done | AllocatorState::Cancelled => {}
                AllocatorState::Aborted => {
                    tracing::warn!(jid, "allocator aborted");
                }
            }
        });
    }
}

#[async_trait]
impl AllocatorCallbacks for ConferenceController {
    async fn build_offer_contents(&self, target_jid: &str, features: &SupportedFeatures) -> OfferContents {
        let mut media_kinds = Vec::new();
        if features.audio {
            media_kinds.push(MediaType::Audio);
        }
        if features.video {
            media_kinds.push(MediaType::Video);
        }
        if self.open_sctp && features.sctp {
            media_kinds.push(MediaType::Data);
        }
        tracing::debug!(target_jid, ?media_kinds, "built offer contents");
        OfferContents { media_kinds, ..Default::default() }
    }

    async fn bridges_in_use(&self) -> Vec<Bridge> {
        let bridges = self.bridge_sessions.read().await;
        bridges.keys().filter_map(|jid| self.registry.get(jid)).collect()
    }

    async fn conference_sources_for(&self, excluding_jid: &str) -> (MediaSourceMap, MediaSourceGroupMap) {
        let participants = self.participants.read().await;
        self.union_excluding(&participants, excluding_jid)
    }

    fn lip_sync_target(&self, _target_jid: &str) -> LipSyncTarget {
        LipSyncTarget { supports_lip_sync: self.enable_lip_sync }
    }

    async fn on_first_allocation_on_bridge(&self, target_jid: &str, bridge_jid: &str) {
        let is_new_bridge_session = {
            let mut sessions = self.bridge_sessions.write().await;
            let was_present = sessions.contains_key(bridge_jid);
            sessions.entry(bridge_jid.to_string()).or_insert(BridgeSessionState { has_failed: false });
            !was_present
        };

        if let Some(participant) = self.participants.write().await.get_mut(target_jid) {
            participant.allocated_bridge = Some(bridge_jid.to_string());
        }

        if is_new_bridge_session {
            self.sync_octo_topology().await;
        }
    }

    async fn on_allocation_rejected(&self, target_jid: &str, reason: String) {
        tracing::warn!(target_jid, reason, "restarting conference state for participant after rejection");
        self.teardown_participant(target_jid).await;
    }

    async fn on_bridge_failed(&self, bridge_jid: &str) {
        if let Some(session) = self.bridge_sessions.write().await.get_mut(bridge_jid) {
            session.has_failed = true;
        }
    }

    async fn on_invite_failed(&self, target_jid: &str) {
        self.teardown_participant(target_jid).await;
    }

    async fn on_established(&self, target_jid: &str, channels: AllocatedChannels) {
        let mut participants = self.participants.write().await;
        if let Some(participant) = participants.get_mut(target_jid) {
            participant.allocated_channels = Some(channels);
        }
    }
}

impl ConferenceController {
    async fn teardown_participant(&self, jid: &str) {
        self.participants.write().await.remove(jid);
    }

    /// Multi-bridge/Octo: for each bridge hosting at least one participant,
    /// maintain a synthetic [`OctoParticipant`] carrying the union of every
    /// other bridge's participants' sources, so they get injected into
    /// offers built for endpoints on this bridge (§3, §4.9).
    async fn sync_octo_topology(&self) {
        let participants = self.participants.read().await;
        let bridges: Vec<String> = self.bridge_sessions.read().await.keys().cloned().collect();
        if bridges.len() < 2 {
            self.octo_participants.write().await.clear();
            return;
        }

        let mut octo = self.octo_participants.write().await;
        for bridge_jid in &bridges {
            let mut relay = OctoParticipant::new(bridge_jid.clone());
            relay.peer_relay_ids = bridges.iter().filter(|b| *b != bridge_jid).cloned().collect();
            for participant in participants.values() {
                if participant.allocated_bridge.as_deref() == Some(bridge_jid.as_str()) {
                    continue;
                }
                relay.sources.add(&participant.local_sources);
                relay.source_groups.add(&participant.local_source_groups);
            }
            relay.mark_first_allocation_complete();
            octo.insert(bridge_jid.clone(), relay);
        }
        octo.retain(|jid, _| bridges.contains(jid));
    }
}

#[cfg(test)]
impl ConferenceController {
    async fn insert_participant_for_test(&self, participant: Participant) {
        self.participants.write().await.insert(participant.jid.clone(), participant);
    }
}
