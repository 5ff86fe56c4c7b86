//! External interfaces the core consumes (§6). All are synchronous
//! request/reply or fire-and-forget; the core does not care how they are
//! implemented on the wire — callers supply a concrete implementation and
//! hand it to the composition root.

use async_trait::async_trait;

use crate::source::{MediaSourceGroupMap, MediaSourceMap};

/// Opaque content list built by the `ChannelAllocator` and carried through
/// the session and bridge-control adapters. The core never inspects its
/// internal representation beyond what §4.7 describes; adapters translate
/// it to and from the wire format.
///
/// `transport`/`sctp_port`/`rtcp_mux` are filled in once the allocation
/// reply is known (`ALLOCATING -> OFFER_SENT`); `sources`/`source_groups`
/// carry every other participant's sources, filtered for lip-sync (§4.6),
/// so the offer actually sent downstream describes the whole conference.
#[derive(Debug, Clone, Default)]
pub struct OfferContents {
    pub media_kinds: Vec<crate::source::MediaType>,
    pub ice_candidates: Vec<String>,
    pub rtcp_mux: bool,
    pub sctp_port: Option<u16>,
    pub sources: MediaSourceMap,
    pub source_groups: MediaSourceGroupMap,
}

/// Participant-supported feature flags discovered by the feature-discovery
/// adapter (§4.7 `NEW -> DISCOVERING`).
#[derive(Debug, Clone, Default)]
pub struct SupportedFeatures {
    pub audio: bool,
    pub video: bool,
    pub bundle: bool,
    pub ice: bool,
    pub dtls: bool,
    pub rtx: bool,
    pub sctp: bool,
    pub lip_sync: bool,
}

/// §6 item 1: chat-room membership/role events and presence publishing.
#[async_trait]
pub trait ChatRoomAdapter: Send + Sync {
    async fn send_presence_extension(&self, room: &str, opaque: &str);
}

/// §6 item 2: session-negotiation request/reply methods.
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    async fn initiate_session(
        &self,
        target_jid: &str,
        contents: &OfferContents,
        start_muted: (bool, bool),
    ) -> bool;

    async fn replace_transport(
        &self,
        target_jid: &str,
        contents: &OfferContents,
        start_muted: (bool, bool),
    ) -> bool;

    async fn send_add_source(&self, target_jid: &str, sources: &MediaSourceMap, groups: &MediaSourceGroupMap);

    async fn send_remove_source(&self, target_jid: &str, sources: &MediaSourceMap, groups: &MediaSourceGroupMap);

    async fn terminate_session(&self, target_jid: &str, reason: &str, message: &str);
}

/// §7: the bridge rejected the description itself, vs. the bridge being
/// unreachable or erroring for any other reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAllocationError {
    BadRequest { reason: String },
    Other { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct AllocatedChannels {
    pub ice_candidates: Vec<String>,
    pub rtcp_mux: bool,
    pub sctp_port: Option<u16>,
}

/// §6 item 3: colibri channel allocation on one bridge.
#[async_trait]
pub trait BridgeControlAdapter: Send + Sync {
    async fn create_channels(
        &self,
        endpoint_id: &str,
        stat_id: &str,
        initiator: bool,
        contents: &OfferContents,
    ) -> Result<AllocatedChannels, ChannelAllocationError>;

    async fn expire_channels(&self, endpoint_id: &str);

    fn is_disposed(&self) -> bool;
}

/// Feature discovery, invoked at the `NEW -> DISCOVERING` transition of
/// the `ChannelAllocator` (§4.7). Not independently numbered in §6, but
/// required by the same "adapter, synchronous request/reply" shape.
#[async_trait]
pub trait FeatureDiscoveryAdapter: Send + Sync {
    async fn discover_features(&self, jid: &str) -> Result<SupportedFeatures, String>;
}

/// §6 item 4: bridge discovery push notifications, consumed by the
/// composition root to drive `BridgeRegistry`.
pub trait BridgeDiscoveryAdapter: Send + Sync {
    fn subscribe_bridge_updates(&self, callback: Box<dyn Fn(BridgeDiscoveryEvent) + Send + Sync>);
}

#[derive(Debug, Clone)]
pub enum BridgeDiscoveryEvent {
    BridgeUp { jid: String, version: Option<String> },
    BridgeDown { jid: String },
    BridgeStats { jid: String, stats: crate::bridge::BridgeStats },
}
