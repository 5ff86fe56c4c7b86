//! Source (SSRC) bookkeeping and validation (components C1, C2).

pub mod map;
pub mod validator;

pub use map::{GroupSemantics, MediaSourceGroupMap, MediaSourceMap, MediaType, Owner, Source, SourceGroup};
pub use validator::SourceValidator;
