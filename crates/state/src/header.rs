//! Scoped handle over a view's ledger header.

use std::sync::Weak;

use parking_lot::Mutex;
use stellar_xdr::curr::LedgerHeader;

use crate::error::{Result, StateError};
use crate::view::ViewInner;

/// A live handle to the ledger header of one view.
///
/// Header mutations are local to the view until it commits; at most one
/// header handle is live per view.
pub struct HeaderView {
    view: Weak<Mutex<ViewInner>>,
    id: u64,
}

impl HeaderView {
    pub(crate) fn new(view: Weak<Mutex<ViewInner>>, id: u64) -> Self {
        Self { view, id }
    }

    /// A copy of the header as currently present in the view.
    pub fn current(&self) -> Result<LedgerHeader> {
        self.with_view(|inner| Ok(inner.header().clone()))
    }

    /// The ledger version in force for this view.
    pub fn ledger_version(&self) -> Result<u32> {
        self.with_view(|inner| Ok(inner.header().ledger_version))
    }

    /// Mutates the header in place.
    pub fn modify<R>(&self, f: impl FnOnce(&mut LedgerHeader) -> R) -> Result<R> {
        self.with_view(|inner| Ok(f(inner.header_mut())))
    }

    fn with_view<R>(&self, f: impl FnOnce(&mut ViewInner) -> Result<R>) -> Result<R> {
        let arc = self.view.upgrade().ok_or(StateError::HandleExpired)?;
        let mut inner = arc.lock();
        if !inner.is_header_handle_active(self.id) {
            return Err(StateError::HandleExpired);
        }
        f(&mut inner)
    }
}

impl Drop for HeaderView {
    fn drop(&mut self) {
        if let Some(arc) = self.view.upgrade() {
            arc.lock().deactivate_header_if(self.id);
        }
    }
}
