//! Conference-focus control plane: bridge registry and selection, the
//! channel-allocator state machine, source bookkeeping and validation,
//! bridge health checking, and lip-sync source rewriting.

pub mod adapters;
pub mod allocator;
pub mod bridge;
pub mod config;
pub mod conference;
pub mod error;
pub mod events;
pub mod lipsync;
pub mod participant;
pub mod source;

pub use config::JicofoConfig;
pub use conference::ConferenceController;
pub use error::{JicofoError, Result};
