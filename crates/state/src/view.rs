//! Nestable copy-on-write ledger-state views.
//!
//! A [`LedgerState`] is an in-memory overlay on top of a parent, which is
//! either another view or the store root. Every touched key maps to a slot that is either
//! *live* (the entry exists with these bytes at this view) or a *tombstone*
//! (deleted at this view); an unmentioned key defers to the parent. A view
//! ends in exactly one of two ways: `commit`, which folds its slots
//! atomically into the parent, or `rollback`, which discards them. Dropping
//! a view rolls it back.
//!
//! Reads hand out scoped handles ([`EntryView`], [`HeaderView`]) registered
//! in the view's active set; the active set, the sealing flag and the
//! single-child rule are what make the use-after-free and double-modify
//! classes of bug unrepresentable here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use stellar_xdr::curr::{
    AccountId, Asset, LedgerEntry, LedgerEntryChange, LedgerEntryChanges, LedgerEntryData,
    LedgerHeader, LedgerKey, OfferEntry,
};

use crate::entry::{ConstEntryView, EntryView};
use crate::error::{Result, StateError};
use crate::header::HeaderView;
use crate::keys::entry_key;
use crate::root::RootInner;

/// Orders two offers of the same book: better means cheaper, ties broken by
/// the lower (older) offer id.
///
/// Prices compare as exact rationals by cross-multiplication; the quotients
/// are never materialized as floating point.
pub fn is_better_offer(lhs: &OfferEntry, rhs: &OfferEntry) -> bool {
    let lhs_value = i128::from(lhs.price.n) * i128::from(rhs.price.d);
    let rhs_value = i128::from(rhs.price.n) * i128::from(lhs.price.d);
    if lhs_value != rhs_value {
        return lhs_value < rhs_value;
    }
    lhs.offer_id < rhs.offer_id
}

/// One inflation winner: a destination account and its summed votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflationWinner {
    pub account_id: AccountId,
    pub votes: i64,
}

/// Change set of a sealed view: per key, the value at this view and the value
/// the parent held at sealing time; plus both headers.
#[derive(Debug, Clone)]
pub struct LedgerStateDelta {
    pub entries: BTreeMap<LedgerKey, EntryDelta>,
    pub header: HeaderDelta,
}

/// Per-key delta: `current` is this view's value, `previous` the parent's.
#[derive(Debug, Clone)]
pub struct EntryDelta {
    pub current: Option<LedgerEntry>,
    pub previous: Option<LedgerEntry>,
}

/// Header delta of a sealed view.
#[derive(Debug, Clone)]
pub struct HeaderDelta {
    pub current: LedgerHeader,
    pub previous: LedgerHeader,
}

/// Minimum balance for an account's inflation vote to count, in stroops.
pub const INFLATION_VOTE_THRESHOLD: i64 = 1_000_000_000;

/// An overlay slot: the entry is either live at this view or deleted here.
#[derive(Debug, Clone)]
pub(crate) enum EntrySlot {
    Live(LedgerEntry),
    Dead,
}

/// The link from a view to whatever it overlays.
#[derive(Clone)]
pub(crate) enum ParentLink {
    Root(Arc<RootInner>),
    View(Arc<Mutex<ViewInner>>),
}

impl ParentLink {
    pub(crate) fn header(&self) -> LedgerHeader {
        match self {
            ParentLink::Root(root) => root.header(),
            ParentLink::View(view) => view.lock().header.clone(),
        }
    }

    pub(crate) fn newest_version(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        match self {
            ParentLink::Root(root) => root.newest_version(key),
            ParentLink::View(view) => view.lock().newest_version(key),
        }
    }

    fn all_offers(&self) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        match self {
            ParentLink::Root(root) => root.all_offers(),
            ParentLink::View(view) => view.lock().all_offers(),
        }
    }

    fn best_offer(
        &self,
        buying: &Asset,
        selling: &Asset,
        exclude: &mut BTreeSet<LedgerKey>,
    ) -> Result<Option<LedgerEntry>> {
        match self {
            ParentLink::Root(root) => root.best_offer(buying, selling, exclude),
            ParentLink::View(view) => view.lock().best_offer(buying, selling, exclude),
        }
    }

    fn offers_by_account_and_asset(
        &self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        match self {
            ParentLink::Root(root) => root.offers_by_account_and_asset(account_id, asset),
            ParentLink::View(view) => view.lock().offers_by_account_and_asset(account_id, asset),
        }
    }

    fn inflation_winners(
        &self,
        max_winners: usize,
        min_votes: i64,
    ) -> Result<Vec<InflationWinner>> {
        match self {
            ParentLink::Root(root) => root.inflation_winners(max_winners, min_votes),
            ParentLink::View(view) => view.lock().inflation_winners(max_winners, min_votes),
        }
    }

    fn attach_child(&self, child: Weak<Mutex<ViewInner>>) -> Result<()> {
        match self {
            ParentLink::Root(root) => root.attach_child(child),
            ParentLink::View(view) => {
                let mut inner = view.lock();
                inner.check_open()?;
                inner.check_not_sealed()?;
                inner.check_no_child()?;
                inner.child = Some(child);
                // A view with a live child surrenders its own handles.
                inner.active.clear();
                inner.active_header = None;
                Ok(())
            }
        }
    }

    fn commit_child(
        &self,
        entries: BTreeMap<LedgerKey, EntrySlot>,
        header: LedgerHeader,
    ) -> Result<()> {
        match self {
            ParentLink::Root(root) => root.commit_child(entries, header),
            ParentLink::View(view) => view.lock().absorb_child(entries, header),
        }
    }

    fn rollback_child(&self) {
        match self {
            ParentLink::Root(root) => root.rollback_child(),
            ParentLink::View(view) => {
                view.lock().child = None;
            }
        }
    }
}

/// Interior state of one view, shared with its handles and its child.
pub(crate) struct ViewInner {
    parent: ParentLink,
    child: Option<Weak<Mutex<ViewInner>>>,
    header: LedgerHeader,
    entries: BTreeMap<LedgerKey, EntrySlot>,
    active: HashMap<LedgerKey, u64>,
    active_header: Option<u64>,
    next_handle_id: u64,
    update_last_modified: bool,
    sealed: bool,
    closed: bool,
}

impl ViewInner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StateError::Closed);
        }
        Ok(())
    }

    fn check_not_sealed(&self) -> Result<()> {
        if self.sealed {
            return Err(StateError::Sealed);
        }
        Ok(())
    }

    fn check_no_child(&self) -> Result<()> {
        if self.child.is_some() {
            return Err(StateError::HasChild);
        }
        Ok(())
    }

    fn register_active(&mut self, key: LedgerKey) -> u64 {
        self.next_handle_id += 1;
        let id = self.next_handle_id;
        self.active.insert(key, id);
        id
    }

    pub(crate) fn is_handle_active(&self, key: &LedgerKey, id: u64) -> bool {
        self.active.get(key) == Some(&id)
    }

    pub(crate) fn deactivate_if(&mut self, key: &LedgerKey, id: u64) {
        if self.active.get(key) == Some(&id) {
            self.active.remove(key);
        }
    }

    pub(crate) fn is_header_handle_active(&self, id: u64) -> bool {
        self.active_header == Some(id)
    }

    pub(crate) fn deactivate_header_if(&mut self, id: u64) {
        if self.active_header == Some(id) {
            self.active_header = None;
        }
    }

    pub(crate) fn header(&self) -> &LedgerHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut LedgerHeader {
        &mut self.header
    }

    pub(crate) fn slot_entry(&self, key: &LedgerKey) -> Result<LedgerEntry> {
        match self.entries.get(key) {
            Some(EntrySlot::Live(entry)) => Ok(entry.clone()),
            _ => Err(StateError::HandleExpired),
        }
    }

    pub(crate) fn slot_entry_mut(&mut self, key: &LedgerKey) -> Result<&mut LedgerEntry> {
        match self.entries.get_mut(key) {
            Some(EntrySlot::Live(entry)) => Ok(entry),
            _ => Err(StateError::HandleExpired),
        }
    }

    /// The newest visible value for a key: this view's slot if mentioned,
    /// the parent chain otherwise. A tombstone reads as "no value".
    pub(crate) fn newest_version(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        match self.entries.get(key) {
            Some(EntrySlot::Live(entry)) => Ok(Some(entry.clone())),
            Some(EntrySlot::Dead) => Ok(None),
            None => self.parent.newest_version(key),
        }
    }

    /// Shared erase path. The caller has already settled the active-handle
    /// question for this key.
    pub(crate) fn erase_slot(&mut self, key: &LedgerKey) -> Result<()> {
        if self.newest_version(key)?.is_none() {
            return Err(StateError::NotFound);
        }
        if self.parent.newest_version(key)?.is_none() {
            // Born in this view; dying here leaves no trace.
            self.entries.remove(key);
        } else {
            self.entries.insert(key.clone(), EntrySlot::Dead);
        }
        Ok(())
    }

    fn all_offers(&self) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        let mut offers = self.parent.all_offers()?;
        for (key, slot) in &self.entries {
            if !matches!(key, LedgerKey::Offer(_)) {
                continue;
            }
            match slot {
                EntrySlot::Dead => {
                    offers.remove(key);
                }
                EntrySlot::Live(entry) => {
                    offers.insert(key.clone(), entry.clone());
                }
            }
        }
        Ok(offers)
    }

    /// Merges the locally-best candidate with the parent's best.
    ///
    /// Every offer key this view holds a slot for goes into `exclude` before
    /// the parent is consulted: a locally modified, created or tombstoned
    /// offer must never surface through an ancestor's stream.
    fn best_offer(
        &self,
        buying: &Asset,
        selling: &Asset,
        exclude: &mut BTreeSet<LedgerKey>,
    ) -> Result<Option<LedgerEntry>> {
        let mut best: Option<LedgerEntry> = None;
        for (key, slot) in &self.entries {
            if !matches!(key, LedgerKey::Offer(_)) {
                continue;
            }
            if !exclude.insert(key.clone()) {
                continue;
            }
            let entry = match slot {
                EntrySlot::Live(entry) => entry,
                EntrySlot::Dead => continue,
            };
            let offer = match &entry.data {
                LedgerEntryData::Offer(offer) => offer,
                _ => continue,
            };
            if &offer.buying != buying || &offer.selling != selling {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => match &current.data {
                    LedgerEntryData::Offer(current_offer) => is_better_offer(offer, current_offer),
                    _ => true,
                },
            };
            if better {
                best = Some(entry.clone());
            }
        }

        let parent_best = self.parent.best_offer(buying, selling, exclude)?;
        match (best, parent_best) {
            (Some(local), Some(parent)) => {
                let local_offer = match &local.data {
                    LedgerEntryData::Offer(o) => o.clone(),
                    _ => return Ok(Some(parent)),
                };
                let parent_offer = match &parent.data {
                    LedgerEntryData::Offer(o) => o.clone(),
                    _ => return Ok(Some(local)),
                };
                if is_better_offer(&local_offer, &parent_offer) {
                    Ok(Some(local))
                } else {
                    Ok(Some(parent))
                }
            }
            (local, parent) => Ok(local.or(parent)),
        }
    }

    fn offers_by_account_and_asset(
        &self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        let mut offers = self.parent.offers_by_account_and_asset(account_id, asset)?;
        for (key, slot) in &self.entries {
            if !matches!(key, LedgerKey::Offer(_)) {
                continue;
            }
            match slot {
                EntrySlot::Dead => {
                    offers.remove(key);
                }
                EntrySlot::Live(entry) => {
                    if let LedgerEntryData::Offer(offer) = &entry.data {
                        if &offer.seller_id == account_id
                            && (&offer.selling == asset || &offer.buying == asset)
                        {
                            offers.insert(key.clone(), entry.clone());
                        }
                    }
                }
            }
        }
        Ok(offers)
    }

    /// Net vote movement this view causes, per destination account.
    fn inflation_delta_votes(&self) -> Result<BTreeMap<AccountId, i64>> {
        let mut delta: BTreeMap<AccountId, i64> = BTreeMap::new();
        for (key, slot) in &self.entries {
            if !matches!(key, LedgerKey::Account(_)) {
                continue;
            }
            if let EntrySlot::Live(entry) = slot {
                if let LedgerEntryData::Account(account) = &entry.data {
                    if let Some(dest) = &account.inflation_dest {
                        if account.balance >= INFLATION_VOTE_THRESHOLD {
                            *delta.entry(dest.clone()).or_insert(0) += account.balance;
                        }
                    }
                }
            }
            if let Some(previous) = self.parent.newest_version(key)? {
                if let LedgerEntryData::Account(account) = &previous.data {
                    if let Some(dest) = &account.inflation_dest {
                        if account.balance >= INFLATION_VOTE_THRESHOLD {
                            *delta.entry(dest.clone()).or_insert(0) -= account.balance;
                        }
                    }
                }
            }
        }
        Ok(delta)
    }

    /// Incremental inflation-winner computation (§ the padded parent query):
    /// the parent answers a widened query, then local vote deltas are folded
    /// in and the combined total re-ranked.
    fn inflation_winners(
        &self,
        max_winners: usize,
        min_votes: i64,
    ) -> Result<Vec<InflationWinner>> {
        let delta_votes = self.inflation_delta_votes()?;

        let num_changed = delta_votes.values().filter(|v| **v != 0).count();
        let new_max_winners = max_winners + num_changed;
        // An empty delta means no account's total can have increased.
        let max_increase = delta_votes.values().copied().max().unwrap_or(0).max(0);
        let new_min_votes = (min_votes - max_increase).max(0);

        let parent_winners = self.parent.inflation_winners(new_max_winners, new_min_votes)?;

        let mut total_votes: BTreeMap<AccountId, i64> = parent_winners
            .into_iter()
            .map(|w| (w.account_id, w.votes))
            .collect();
        for (account_id, vote_delta) in delta_votes {
            if total_votes.contains_key(&account_id) || vote_delta >= min_votes {
                *total_votes.entry(account_id).or_insert(0) += vote_delta;
            }
        }

        let mut winners: Vec<InflationWinner> = total_votes
            .into_iter()
            .filter(|(_, votes)| *votes >= min_votes)
            .map(|(account_id, votes)| InflationWinner { account_id, votes })
            .collect();
        winners.sort_by(|lhs, rhs| {
            rhs.votes.cmp(&lhs.votes).then_with(|| {
                meridian_db::encode_account_id(&rhs.account_id)
                    .cmp(&meridian_db::encode_account_id(&lhs.account_id))
            })
        });
        winners.truncate(max_winners);
        Ok(winners)
    }

    /// Folds a committing child's slots into this view.
    fn absorb_child(
        &mut self,
        entries: BTreeMap<LedgerKey, EntrySlot>,
        header: LedgerHeader,
    ) -> Result<()> {
        for (key, slot) in entries {
            match slot {
                EntrySlot::Live(entry) => {
                    self.entries.insert(key, EntrySlot::Live(entry));
                }
                EntrySlot::Dead => {
                    if self.parent.newest_version(&key)?.is_none() {
                        // Born below this view and died: no ancestor knows
                        // the key, so it vanishes entirely.
                        self.entries.remove(&key);
                    } else {
                        self.entries.insert(key, EntrySlot::Dead);
                    }
                }
            }
        }
        self.header = header;
        self.child = None;
        Ok(())
    }

    /// Seals the view and, when requested at construction, stamps every live
    /// slot with the current ledger sequence. Idempotent.
    fn seal_and_maybe_update_last_modified(&mut self) -> Result<()> {
        self.check_no_child()?;

        self.sealed = true;
        self.active.clear();
        self.active_header = None;

        if self.update_last_modified {
            let seq = self.header.ledger_seq;
            for slot in self.entries.values_mut() {
                if let EntrySlot::Live(entry) = slot {
                    entry.last_modified_ledger_seq = seq;
                }
            }
        }
        Ok(())
    }
}

/// A nestable, single-writer ledger-state view.
///
/// See the module docs for the lifecycle. All operations that hand out
/// handles fail with [`StateError::Sealed`] after a change-set extraction and
/// with [`StateError::HasChild`] while a child view is live.
pub struct LedgerState {
    inner: Arc<Mutex<ViewInner>>,
}

impl LedgerState {
    pub(crate) fn make(parent: ParentLink, update_last_modified: bool) -> Result<Self> {
        let header = parent.header();
        let inner = Arc::new(Mutex::new(ViewInner {
            parent: parent.clone(),
            child: None,
            header,
            entries: BTreeMap::new(),
            active: HashMap::new(),
            active_header: None,
            next_handle_id: 0,
            update_last_modified,
            sealed: false,
            closed: false,
        }));
        parent.attach_child(Arc::downgrade(&inner))?;
        Ok(Self { inner })
    }

    /// Opens a child view of this view.
    ///
    /// Fails with [`StateError::HasChild`] if a child is already live and
    /// [`StateError::Sealed`] after sealing. While the child lives, this
    /// view's own handles are surrendered and every mutating operation fails.
    pub fn begin_child(&self, update_last_modified: bool) -> Result<LedgerState> {
        LedgerState::make(ParentLink::View(self.inner.clone()), update_last_modified)
    }

    /// Creates a new entry and returns a live handle to it.
    pub fn create(&self, entry: LedgerEntry) -> Result<EntryView> {
        let key = entry_key(&entry)?;
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.check_not_sealed()?;
        inner.check_no_child()?;

        if inner.newest_version(&key)?.is_some() {
            return Err(StateError::KeyExists);
        }

        inner.entries.insert(key.clone(), EntrySlot::Live(entry));
        let id = inner.register_active(key.clone());
        Ok(EntryView::new(Arc::downgrade(&self.inner), key, id))
    }

    /// Loads the newest visible version of a key for modification.
    ///
    /// The entry is copied into this view's overlay; mutations through the
    /// returned handle write to that copy. Returns `Ok(None)` when the key
    /// has no live value anywhere on the lookup path.
    pub fn load(&self, key: &LedgerKey) -> Result<Option<EntryView>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.check_not_sealed()?;
        inner.check_no_child()?;
        if inner.active.contains_key(key) {
            return Err(StateError::AlreadyActive);
        }

        let newest = match inner.newest_version(key)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        inner
            .entries
            .insert(key.clone(), EntrySlot::Live(newest));
        let id = inner.register_active(key.clone());
        Ok(Some(EntryView::new(
            Arc::downgrade(&self.inner),
            key.clone(),
            id,
        )))
    }

    /// Loads the newest visible version of a key without recording it.
    ///
    /// No overlay slot is installed, so the view's change set never mentions
    /// the key; the activation slot is still claimed, making the handle
    /// mutually exclusive with [`LedgerState::load`] on the same key.
    pub fn load_without_record(&self, key: &LedgerKey) -> Result<Option<ConstEntryView>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.check_not_sealed()?;
        inner.check_no_child()?;
        if inner.active.contains_key(key) {
            return Err(StateError::AlreadyActive);
        }

        let newest = match inner.newest_version(key)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let id = inner.register_active(key.clone());
        Ok(Some(ConstEntryView::new(
            Arc::downgrade(&self.inner),
            key.clone(),
            id,
            newest,
        )))
    }

    /// Erases the newest visible version of a key.
    ///
    /// A key created in this very view vanishes without a trace; a key known
    /// to an ancestor is tombstoned.
    pub fn erase(&self, key: &LedgerKey) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.check_not_sealed()?;
        inner.check_no_child()?;
        if inner.active.contains_key(key) {
            return Err(StateError::AlreadyActive);
        }
        inner.erase_slot(key)
    }

    /// Opens the single live header handle.
    pub fn load_header(&self) -> Result<HeaderView> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.check_not_sealed()?;
        inner.check_no_child()?;
        if inner.active_header.is_some() {
            return Err(StateError::HeaderActive);
        }

        inner.next_handle_id += 1;
        let id = inner.next_handle_id;
        inner.active_header = Some(id);
        Ok(HeaderView::new(Arc::downgrade(&self.inner), id))
    }

    /// A copy of this view's current header.
    pub fn header(&self) -> LedgerHeader {
        self.inner.lock().header.clone()
    }

    /// The newest visible version of a key, without opening a handle.
    pub fn newest_version(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.inner.lock().newest_version(key)
    }

    /// Every live offer visible through this view.
    pub fn all_offers(&self) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        self.inner.lock().all_offers()
    }

    /// The best live offer for `(buying, selling)`, merged across this view
    /// and its ancestors, excluding the given keys.
    pub fn best_offer(
        &self,
        buying: &Asset,
        selling: &Asset,
        mut exclude: BTreeSet<LedgerKey>,
    ) -> Result<Option<LedgerEntry>> {
        self.inner.lock().best_offer(buying, selling, &mut exclude)
    }

    /// Loads the best offer for `(buying, selling)` and opens a handle on it.
    pub fn load_best_offer(&self, buying: &Asset, selling: &Asset) -> Result<Option<EntryView>> {
        let best = {
            let inner = self.inner.lock();
            inner.check_open()?;
            inner.check_not_sealed()?;
            inner.check_no_child()?;
            inner.best_offer(buying, selling, &mut BTreeSet::new())?
        };
        match best {
            Some(entry) => self.load(&entry_key(&entry)?),
            None => Ok(None),
        }
    }

    /// Snapshot of every offer visible through this view where the account
    /// sells, with the asset on either side of the trade.
    pub fn offers_by_account_and_asset(
        &self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        self.inner
            .lock()
            .offers_by_account_and_asset(account_id, asset)
    }

    /// Loads a handle on every visible offer of an account touching an asset.
    pub fn load_offers_by_account_and_asset(
        &self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<Vec<EntryView>> {
        let offers = self.offers_by_account_and_asset(account_id, asset)?;
        let mut views = Vec::with_capacity(offers.len());
        for key in offers.keys() {
            match self.load(key)? {
                Some(view) => views.push(view),
                None => {
                    return Err(StateError::InvariantViolated(
                        "visible offer disappeared during load".into(),
                    ))
                }
            }
        }
        Ok(views)
    }

    /// Loads every visible offer, grouped by seller.
    pub fn load_all_offers(&self) -> Result<BTreeMap<AccountId, Vec<EntryView>>> {
        let offers = self.all_offers()?;
        let mut by_seller: BTreeMap<AccountId, Vec<EntryView>> = BTreeMap::new();
        for key in offers.keys() {
            let seller = match key {
                LedgerKey::Offer(o) => o.seller_id.clone(),
                _ => continue,
            };
            match self.load(key)? {
                Some(view) => by_seller.entry(seller).or_default().push(view),
                None => {
                    return Err(StateError::InvariantViolated(
                        "visible offer disappeared during load".into(),
                    ))
                }
            }
        }
        Ok(by_seller)
    }

    /// Top inflation winners visible through this view.
    ///
    /// Winners are destination accounts whose summed voter balances (voters
    /// at or above [`INFLATION_VOTE_THRESHOLD`] only) reach `min_votes`,
    /// ranked `(votes DESC, strkey DESC)` and truncated to `max_winners`.
    pub fn inflation_winners(
        &self,
        max_winners: usize,
        min_votes: i64,
    ) -> Result<Vec<InflationWinner>> {
        self.inner.lock().inflation_winners(max_winners, min_votes)
    }

    /// Read-only snapshot of this view's overlay; legal on sealed views.
    pub fn entries(&self) -> BTreeMap<LedgerKey, Option<LedgerEntry>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, slot)| {
                let value = match slot {
                    EntrySlot::Live(entry) => Some(entry.clone()),
                    EntrySlot::Dead => None,
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Seals the view and classifies its slots against the parent as
    /// Created / Updated / Removed (each prefixed by the parent's State).
    pub fn get_changes(&self) -> Result<LedgerEntryChanges> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.seal_and_maybe_update_last_modified()?;

        let mut changes = Vec::new();
        for (key, slot) in &inner.entries {
            let previous = inner.parent.newest_version(key)?;
            match previous {
                Some(previous) => {
                    changes.push(LedgerEntryChange::State(previous));
                    match slot {
                        EntrySlot::Live(entry) => {
                            changes.push(LedgerEntryChange::Updated(entry.clone()));
                        }
                        EntrySlot::Dead => {
                            changes.push(LedgerEntryChange::Removed(key.clone()));
                        }
                    }
                }
                None => match slot {
                    EntrySlot::Live(entry) => {
                        changes.push(LedgerEntryChange::Created(entry.clone()));
                    }
                    EntrySlot::Dead => {
                        return Err(StateError::InvariantViolated(
                            "tombstone without ancestor value".into(),
                        ));
                    }
                },
            }
        }
        changes
            .try_into()
            .map(LedgerEntryChanges)
            .map_err(|_| StateError::InvariantViolated("change set too large".into()))
    }

    /// Seals the view and extracts its full delta against the parent.
    pub fn get_delta(&self) -> Result<LedgerStateDelta> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.seal_and_maybe_update_last_modified()?;

        let mut entries = BTreeMap::new();
        for (key, slot) in &inner.entries {
            let previous = inner.parent.newest_version(key)?;
            let current = match slot {
                EntrySlot::Live(entry) => Some(entry.clone()),
                EntrySlot::Dead => None,
            };
            entries.insert(key.clone(), EntryDelta { current, previous });
        }

        Ok(LedgerStateDelta {
            entries,
            header: HeaderDelta {
                current: inner.header.clone(),
                previous: inner.parent.header(),
            },
        })
    }

    /// Seals the view and returns every surviving entry.
    pub fn live_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.seal_and_maybe_update_last_modified()?;
        Ok(inner
            .entries
            .values()
            .filter_map(|slot| match slot {
                EntrySlot::Live(entry) => Some(entry.clone()),
                EntrySlot::Dead => None,
            })
            .collect())
    }

    /// Seals the view and returns every deleted key.
    pub fn dead_entries(&self) -> Result<Vec<LedgerKey>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.seal_and_maybe_update_last_modified()?;
        Ok(inner
            .entries
            .iter()
            .filter_map(|(key, slot)| match slot {
                EntrySlot::Dead => Some(key.clone()),
                EntrySlot::Live(_) => None,
            })
            .collect())
    }

    /// Applies `f` to the header of a sealed view.
    ///
    /// The only mutation a sealed view admits; used for post-apply header
    /// tweaks before the view commits.
    pub fn unseal_header(&self, f: impl FnOnce(&mut LedgerHeader)) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if !inner.sealed {
            return Err(StateError::NotSealed);
        }
        if inner.active_header.is_some() {
            return Err(StateError::HeaderActive);
        }
        f(&mut inner.header);
        Ok(())
    }

    /// Seals the view and folds its slots atomically into the parent.
    pub fn commit(self) -> Result<()> {
        let (entries, header, parent) = {
            let mut inner = self.inner.lock();
            inner.check_open()?;
            inner.seal_and_maybe_update_last_modified()?;
            inner.closed = true;
            (
                std::mem::take(&mut inner.entries),
                inner.header.clone(),
                inner.parent.clone(),
            )
        };
        parent.commit_child(entries, header)
    }

    /// Discards the view. A live child is rolled back first.
    pub fn rollback(self) {
        Self::close(&self.inner);
    }

    fn close(inner: &Arc<Mutex<ViewInner>>) {
        let (child, parent) = {
            let mut guard = inner.lock();
            if guard.closed {
                return;
            }
            guard.closed = true;
            guard.active.clear();
            guard.active_header = None;
            guard.entries.clear();
            (guard.child.take(), guard.parent.clone())
        };
        if let Some(weak) = child {
            if let Some(child_inner) = weak.upgrade() {
                Self::close(&child_inner);
            }
        }
        parent.rollback_child();
    }
}

impl Drop for LedgerState {
    fn drop(&mut self) {
        // A leaked view rolls back.
        Self::close(&self.inner);
    }
}
