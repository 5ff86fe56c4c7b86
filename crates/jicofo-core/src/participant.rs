//! Per-peer state: supported features, allocated channels, local sources,
//! and pending remote source queues (component C8).

use crate::adapters::{AllocatedChannels, SupportedFeatures};
use crate::allocator::CancelToken;
use crate::source::{MediaSourceGroupMap, MediaSourceMap};

/// `JOINED -> INVITING -> ESTABLISHED -> LEAVING -> GONE` (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Joined,
    Inviting,
    Established,
    Leaving,
    Gone,
}

impl ParticipantState {
    fn can_transition_to(self, next: ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (self, next),
            (Joined, Inviting)
                | (Inviting, Established)
                | (Established, Inviting)
                | (Joined, Leaving)
                | (Inviting, Leaving)
                | (Established, Leaving)
                | (Leaving, Gone)
        )
    }
}

/// Owner JID, endpoint-id, supported features, local source containers,
/// and pending-remote queues drained on first establishment (§3, §4.8).
pub struct Participant {
    pub jid: String,
    pub endpoint_id: String,
    pub max_sources_per_media: usize,
    state: ParticipantState,
    pub supported_features: SupportedFeatures,
    pub local_sources: MediaSourceMap,
    pub local_source_groups: MediaSourceGroupMap,
    pub allocated_channels: Option<AllocatedChannels>,
    pub allocated_bridge: Option<String>,
    pending_remote_to_add: MediaSourceMap,
    pending_remote_groups_to_add: MediaSourceGroupMap,
    pending_remote_to_remove: MediaSourceMap,
    pending_remote_groups_to_remove: MediaSourceGroupMap,
    /// Cancel handle for the in-flight `ChannelAllocator`, if any. At most
    /// one allocator may be non-`DONE` for a participant at a time (§4.7,
    /// §5 invariant 4); spawning a new one cancels this first.
    pub active_allocator: Option<CancelToken>,
}

/// Sources queued for immediate delivery once a participant becomes
/// `ESTABLISHED`, draining `pendingRemoteSourcesToAdd`/`ToRemove` (§4.8).
pub struct DrainedPending {
    pub to_add: (MediaSourceMap, MediaSourceGroupMap),
    pub to_remove: (MediaSourceMap, MediaSourceGroupMap),
}

impl Participant {
    pub fn new(jid: impl Into<String>, endpoint_id: impl Into<String>, max_sources_per_media: usize) -> Self {
        Self {
            jid: jid.into(),
            endpoint_id: endpoint_id.into(),
            max_sources_per_media,
            state: ParticipantState::Joined,
            supported_features: SupportedFeatures::default(),
            local_sources: MediaSourceMap::new(),
            local_source_groups: MediaSourceGroupMap::new(),
            allocated_channels: None,
            allocated_bridge: None,
            pending_remote_to_add: MediaSourceMap::new(),
            pending_remote_groups_to_add: MediaSourceGroupMap::new(),
            pending_remote_to_remove: MediaSourceMap::new(),
            pending_remote_groups_to_remove: MediaSourceGroupMap::new(),
            active_allocator: None,
        }
    }

    /// Cancels any allocator currently in flight for this participant and
    /// records `token` as the new active one (§4.7/§5 invariant 4).
    pub fn set_active_allocator(&mut self, token: CancelToken) {
        if let Some(previous) = self.active_allocator.take() {
            previous.cancel();
        }
        self.active_allocator = Some(token);
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ParticipantState::Established
    }

    fn transition(&mut self, next: ParticipantState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                jid = self.jid,
                from = ?self.state,
                to = ?next,
                "ignoring invalid participant state transition"
            );
            return;
        }
        self.state = next;
    }

    pub fn start_inviting(&mut self) {
        self.transition(ParticipantState::Inviting);
    }

    pub fn start_re_inviting(&mut self) {
        self.transition(ParticipantState::Inviting);
    }

    /// While not `ESTABLISHED`, remote deltas from other participants queue
    /// here instead of being sent immediately (§4.8).
    pub fn queue_remote_add(&mut self, sources: MediaSourceMap, groups: MediaSourceGroupMap) {
        self.pending_remote_to_add.add(&sources);
        self.pending_remote_groups_to_add.add(&groups);
    }

    pub fn queue_remote_remove(&mut self, sources: MediaSourceMap, groups: MediaSourceGroupMap) {
        self.pending_remote_to_remove.add(&sources);
        self.pending_remote_groups_to_remove.add(&groups);
    }

    /// `INVITING -> ESTABLISHED`: drains both pending queues for immediate
    /// delivery. A source queued in both add and remove still emits both,
    /// per the engineered behaviour documented in §4.8.
    pub fn establish(&mut self) -> DrainedPending {
        self.transition(ParticipantState::Established);

        let to_add = (
            std::mem::take(&mut self.pending_remote_to_add),
            std::mem::take(&mut self.pending_remote_groups_to_add),
        );
        let to_remove = (
            std::mem::take(&mut self.pending_remote_to_remove),
            std::mem::take(&mut self.pending_remote_groups_to_remove),
        );

        DrainedPending { to_add, to_remove }
    }

    pub fn start_leaving(&mut self) {
        self.transition(ParticipantState::Leaving);
    }

    pub fn finish_leaving(&mut self) {
        self.transition(ParticipantState::Gone);
    }
}

/// Synthetic participant representing a bridge-to-bridge relay on one
/// bridge (§3). Holds peer relay-ids plus the same source containers.
pub struct OctoParticipant {
    pub bridge_jid: String,
    pub peer_relay_ids: Vec<String>,
    pub sources: MediaSourceMap,
    pub source_groups: MediaSourceGroupMap,
    session_established: bool,
}

impl OctoParticipant {
    pub fn new(bridge_jid: impl Into<String>) -> Self {
        Self {
            bridge_jid: bridge_jid.into(),
            peer_relay_ids: Vec::new(),
            sources: MediaSourceMap::new(),
            source_groups: MediaSourceGroupMap::new(),
            session_established: false,
        }
    }

    pub fn is_session_established(&self) -> bool {
        self.session_established
    }

    /// Flipped when the first channel allocation completes on this bridge.
    pub fn mark_first_allocation_complete(&mut self) {
        self.session_established = true;
    }
}
