//! Incremental decoding state: module identities, cached projections and the
//! session-scoped bag holding them.

pub mod bag;
pub mod state;

pub use bag::{BagSnapshot, IncrementalStateBag};
pub use state::{AttentionState, CacheMode, ModuleId};
