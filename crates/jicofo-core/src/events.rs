//! Internal pub-sub event bus (§9 Design Notes — "Observers / event bus").
//!
//! `BridgeRegistry` owns the broadcast sender; `HealthChecker` and the
//! discovery-adapter glue publish into it; `ConferenceController`
//! subscribes. Grounded on `session-core`'s
//! `bridge_event_subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<BridgeEvent>>>>`,
//! adapted to a broadcast channel since many conference controllers can
//! subscribe to one shared registry.

/// Tagged variants for the four event kinds named in §9: `BRIDGE_UP`,
/// `BRIDGE_DOWN`, `VIDEOSTREAMS_CHANGED`, `HEALTH_CHECK_FAILED`.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Up { bridge_jid: String },
    Down { bridge_jid: String },
    VideoStreamsChanged { bridge_jid: String, delta: i64 },
    HealthCheckFailed { bridge_jid: String },
}

impl BridgeEvent {
    pub fn bridge_jid(&self) -> &str {
        match self {
            BridgeEvent::Up { bridge_jid }
            | BridgeEvent::Down { bridge_jid }
            | BridgeEvent::VideoStreamsChanged { bridge_jid, .. }
            | BridgeEvent::HealthCheckFailed { bridge_jid } => bridge_jid,
        }
    }
}
