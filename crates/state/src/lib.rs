//! Nested transactional ledger-state views.
//!
//! The engine between transaction application code and the persistent
//! ledger store: copy-on-write, arbitrarily nestable read/write views of a
//! keyed ledger. An in-flight operation opens a child view, reads the latest
//! uncommitted state of its ancestors, mutates entries through scoped
//! handles, and then either atomically promotes its changes to the parent or
//! discards them.
//!
//! - [`LedgerState`]: a nestable overlay with create/load/erase/commit/
//!   rollback semantics, sealing, and active-handle bookkeeping.
//! - [`EntryView`] / [`ConstEntryView`] / [`HeaderView`]: scoped handles
//!   that deactivate on drop and expire with their view.
//! - [`TrustLineView`] / [`ConstTrustLineView`]: one surface over real
//!   trust-line entries and the issuer's synthetic infinite line.
//! - [`LedgerStateRoot`]: the store-backed bottom of the stack, with entry
//!   and best-offer caches and one store transaction per child.

mod cache;
mod entry;
mod error;
mod header;
pub mod keys;
mod root;
mod trust_line;
mod view;

pub use entry::{ConstEntryView, EntryView};
pub use error::{Result, StateError};
pub use header::HeaderView;
pub use root::{LedgerStateRoot, DEFAULT_BEST_OFFERS_CACHE_SIZE, DEFAULT_ENTRY_CACHE_SIZE};
pub use trust_line::{trust_line_liabilities, ConstTrustLineView, TrustLineView};
pub use view::{
    is_better_offer, EntryDelta, HeaderDelta, InflationWinner, LedgerState, LedgerStateDelta,
    INFLATION_VOTE_THRESHOLD,
};
