//! Error taxonomy (§7). Kinds, not wrapped transport errors — each variant
//! names the recovery the `ConferenceController` or `ChannelAllocator` takes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JicofoError>;

#[derive(Debug, Error)]
pub enum JicofoError {
    /// The selector could not find a usable bridge for this conference.
    #[error("no bridge available for conference")]
    NoBridgeAvailable,

    /// The bridge rejected the channel-allocation description itself
    /// (not a bridge failure) — restart the conference, don't blame the bridge.
    #[error("channel allocation rejected by bridge: {reason}")]
    ChannelAllocationRejected { reason: String },

    /// Transport/timeout talking to a bridge — mark it non-operational and
    /// try the next one.
    #[error("bridge {bridge_jid} unavailable: {reason}")]
    BridgeUnavailable { bridge_jid: String, reason: String },

    /// A source/group change failed validation; the change is rejected
    /// atomically and the connection stays up.
    #[error("invalid sources: {reason}")]
    InvalidSources { reason: String },

    /// No acknowledgement for session-initiate/transport-replace.
    #[error("session signalling failed for {jid}: {reason}")]
    SessionSignallingFailed { jid: String, reason: String },

    /// Feature discovery failed; offer is built with a downgraded feature
    /// set rather than failing the invite outright.
    #[error("feature discovery failed for {jid}: {reason}")]
    FeatureDiscoveryFailed { jid: String, reason: String },

    /// A health-check probe (plus its one retry) failed.
    #[error("health check failed for bridge {bridge_jid}")]
    HealthCheckFailed { bridge_jid: String },

    /// Not a real error — a cancelled allocator task unwinding silently.
    #[error("operation cancelled")]
    Cancelled,
}

impl JicofoError {
    pub fn invalid_sources(reason: impl Into<String>) -> Self {
        JicofoError::InvalidSources {
            reason: reason.into(),
        }
    }

    pub fn bridge_unavailable(bridge_jid: impl Into<String>, reason: impl Into<String>) -> Self {
        JicofoError::BridgeUnavailable {
            bridge_jid: bridge_jid.into(),
            reason: reason.into(),
        }
    }

    pub fn session_signalling_failed(jid: impl Into<String>, reason: impl Into<String>) -> Self {
        JicofoError::SessionSignallingFailed {
            jid: jid.into(),
            reason: reason.into(),
        }
    }

    /// True for the one error kind that unwinds silently (no logging as a
    /// failure, no peer notification).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JicofoError::Cancelled)
    }
}
