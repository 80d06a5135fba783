//! Scoped handles over single ledger entries.
//!
//! A handle is a `(weak view pointer, key, activation id)` triple. The owning
//! view records the activation id in its active map; every dereference
//! re-validates both the pointer and the id, so a handle that outlives its
//! view, or that was superseded when the view cleared its active set,
//! reports [`StateError::HandleExpired`] instead of touching stale state.
//!
//! Handles move but do not clone, and release their activation when dropped.

use std::sync::Weak;

use parking_lot::Mutex;
use stellar_xdr::curr::{LedgerEntry, LedgerKey};

use crate::error::{Result, StateError};
use crate::view::ViewInner;

/// A live, mutable handle to one entry in a ledger-state view.
///
/// Mutations write through to the view's overlay slot. At most one handle is
/// live per key per view.
pub struct EntryView {
    view: Weak<Mutex<ViewInner>>,
    key: LedgerKey,
    id: u64,
}

impl EntryView {
    pub(crate) fn new(view: Weak<Mutex<ViewInner>>, key: LedgerKey, id: u64) -> Self {
        Self { view, key, id }
    }

    /// The key this handle is bound to.
    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    /// A copy of the entry as currently present in the view.
    pub fn current(&self) -> Result<LedgerEntry> {
        self.with_view(|inner| inner.slot_entry(&self.key))
    }

    /// Mutates the entry in place through the view's overlay slot.
    pub fn modify<R>(&self, f: impl FnOnce(&mut LedgerEntry) -> R) -> Result<R> {
        self.with_view(|inner| {
            let entry = inner.slot_entry_mut(&self.key)?;
            Ok(f(entry))
        })
    }

    /// Deactivates the handle and erases the entry from the view.
    pub fn erase(self) -> Result<()> {
        let arc = self.view.upgrade().ok_or(StateError::HandleExpired)?;
        let mut inner = arc.lock();
        if !inner.is_handle_active(&self.key, self.id) {
            return Err(StateError::HandleExpired);
        }
        inner.deactivate_if(&self.key, self.id);
        inner.erase_slot(&self.key)
    }

    fn with_view<R>(&self, f: impl FnOnce(&mut ViewInner) -> Result<R>) -> Result<R> {
        let arc = self.view.upgrade().ok_or(StateError::HandleExpired)?;
        let mut inner = arc.lock();
        if !inner.is_handle_active(&self.key, self.id) {
            return Err(StateError::HandleExpired);
        }
        f(&mut inner)
    }
}

impl Drop for EntryView {
    fn drop(&mut self) {
        if let Some(arc) = self.view.upgrade() {
            arc.lock().deactivate_if(&self.key, self.id);
        }
    }
}

/// A live, read-only handle to one entry.
///
/// Created by `load_without_record`: the lookup claims the key's activation
/// slot (so it is mutually exclusive with a mutable handle) but installs no
/// overlay slot, and the view's change set never mentions the key.
pub struct ConstEntryView {
    view: Weak<Mutex<ViewInner>>,
    key: LedgerKey,
    id: u64,
    entry: LedgerEntry,
}

impl ConstEntryView {
    pub(crate) fn new(
        view: Weak<Mutex<ViewInner>>,
        key: LedgerKey,
        id: u64,
        entry: LedgerEntry,
    ) -> Self {
        Self {
            view,
            key,
            id,
            entry,
        }
    }

    /// The key this handle is bound to.
    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    /// The entry as seen when the handle was opened.
    pub fn current(&self) -> Result<&LedgerEntry> {
        let arc = self.view.upgrade().ok_or(StateError::HandleExpired)?;
        let inner = arc.lock();
        if !inner.is_handle_active(&self.key, self.id) {
            return Err(StateError::HandleExpired);
        }
        Ok(&self.entry)
    }
}

impl Drop for ConstEntryView {
    fn drop(&mut self) {
        if let Some(arc) = self.view.upgrade() {
            arc.lock().deactivate_if(&self.key, self.id);
        }
    }
}
