//! Concurrency slot accounting shared by the run queue and the per-run
//! step controllers.

pub mod scope;
pub mod table;

pub use scope::{claims_for_tags, LimitScope, ScopeKey, SlotClaim, SlotLimit};
pub use table::SlotTable;
