//! The store root: bottom of the view stack.
//!
//! A [`LedgerStateRoot`] presents the same read surface a view expects of its
//! parent, but answers from the persistent store through two caches: an
//! entry cache over point lookups (remembering both presence and absence)
//! and a best-offers cache holding, per order book, the ordered prefix of
//! offers loaded so far.
//!
//! The root admits one child at a time. Attaching the child opens a store
//! transaction; committing it writes the child's effective diffs and the new
//! header inside that transaction, updates the entry cache with the written
//! values, and clears the best-offers cache (the book has changed). Rolling
//! the child back aborts the transaction and leaves both caches warm.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use stellar_xdr::curr::{
    AccountId, Asset, Hash, LedgerEntry, LedgerEntryType, LedgerHeader, LedgerHeaderExt,
    LedgerKey, StellarValue, StellarValueExt, TimePoint, VecM,
};
use tracing::{debug, trace, warn};

use meridian_db::{queries, Database};

use crate::cache::{BestOffersCache, EntryCache};
use crate::error::{Result, StateError};
use crate::keys::entry_key;
use crate::view::{EntrySlot, InflationWinner, LedgerState, ParentLink, ViewInner};

/// How many offers one store query pulls when extending a book's prefix.
const BEST_OFFER_BATCH_SIZE: usize = 5;

/// Default entry-cache capacity.
pub const DEFAULT_ENTRY_CACHE_SIZE: usize = 4096;

/// Default best-offers-cache capacity (number of order books).
pub const DEFAULT_BEST_OFFERS_CACHE_SIZE: usize = 64;

/// The persistent-store end of the view stack.
pub struct LedgerStateRoot {
    inner: Arc<RootInner>,
}

pub(crate) struct RootInner {
    db: Mutex<Database>,
    header: Mutex<LedgerHeader>,
    entry_cache: Mutex<EntryCache>,
    best_offers_cache: Mutex<BestOffersCache>,
    child: Mutex<Option<Weak<Mutex<ViewInner>>>>,
}

impl LedgerStateRoot {
    /// Opens a root over the given store with default cache sizes.
    ///
    /// The initial header is the store's last committed header, or a zeroed
    /// header for a store that has never committed one.
    pub fn new(db: Database) -> Result<Self> {
        Self::with_cache_sizes(db, DEFAULT_ENTRY_CACHE_SIZE, DEFAULT_BEST_OFFERS_CACHE_SIZE)
    }

    /// Opens a root with explicit cache capacities.
    pub fn with_cache_sizes(
        db: Database,
        entry_cache_size: usize,
        best_offers_cache_size: usize,
    ) -> Result<Self> {
        let header = queries::header::load_header(db.conn())?.unwrap_or_else(empty_header);
        Ok(Self {
            inner: Arc::new(RootInner {
                db: Mutex::new(db),
                header: Mutex::new(header),
                entry_cache: Mutex::new(EntryCache::new(entry_cache_size)),
                best_offers_cache: Mutex::new(BestOffersCache::new(best_offers_cache_size)),
                child: Mutex::new(None),
            }),
        })
    }

    /// Opens a child view rooted at the store.
    ///
    /// Fails with [`StateError::HasChild`] while another child is live.
    pub fn begin(&self, update_last_modified: bool) -> Result<LedgerState> {
        LedgerState::make(ParentLink::Root(self.inner.clone()), update_last_modified)
    }

    /// The last committed header.
    pub fn header(&self) -> LedgerHeader {
        self.inner.header()
    }

    /// Read-through point lookup.
    pub fn newest_version(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.inner.newest_version(key)
    }

    /// Every offer in the store.
    pub fn all_offers(&self) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        self.inner.all_offers()
    }

    /// The best stored offer for `(buying, selling)` outside `exclude`.
    pub fn best_offer(
        &self,
        buying: &Asset,
        selling: &Asset,
        mut exclude: BTreeSet<LedgerKey>,
    ) -> Result<Option<LedgerEntry>> {
        self.inner.best_offer(buying, selling, &mut exclude)
    }

    /// Every stored offer of an account touching an asset.
    pub fn offers_by_account_and_asset(
        &self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        self.inner.offers_by_account_and_asset(account_id, asset)
    }

    /// Inflation winners computed by the store.
    pub fn inflation_winners(
        &self,
        max_winners: usize,
        min_votes: i64,
    ) -> Result<Vec<InflationWinner>> {
        self.inner.inflation_winners(max_winners, min_votes)
    }

    /// Number of stored objects of one entry variant.
    pub fn count_objects(&self, entry_type: LedgerEntryType) -> Result<u64> {
        self.inner.check_no_child()?;
        Ok(self.inner.db.lock().count_objects(entry_type)?)
    }

    /// Number of stored objects of one variant last modified in
    /// `[first, last]`.
    pub fn count_objects_in_range(
        &self,
        entry_type: LedgerEntryType,
        first: u32,
        last: u32,
    ) -> Result<u64> {
        self.inner.check_no_child()?;
        Ok(self
            .inner
            .db
            .lock()
            .count_objects_in_range(entry_type, first, last)?)
    }

    /// Deletes every stored object last modified at or after `ledger` and
    /// invalidates both caches.
    pub fn delete_objects_modified_on_or_after(&self, ledger: u32) -> Result<()> {
        self.inner.check_no_child()?;
        self.inner.entry_cache.lock().clear();
        self.inner.best_offers_cache.lock().clear();
        self.inner
            .db
            .lock()
            .delete_objects_modified_on_or_after(ledger)?;
        Ok(())
    }
}

impl RootInner {
    fn check_no_child(&self) -> Result<()> {
        if self.child.lock().is_some() {
            return Err(StateError::HasChild);
        }
        Ok(())
    }

    pub(crate) fn header(&self) -> LedgerHeader {
        self.header.lock().clone()
    }

    pub(crate) fn newest_version(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        let db = self.db.lock();
        self.lookup_through_cache(&db, key)
    }

    fn lookup_through_cache(&self, db: &Database, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        if let Some(hit) = self.entry_cache.lock().get(key) {
            return Ok(hit);
        }

        let loaded = match key {
            LedgerKey::Account(k) => queries::accounts::load_account(db.conn(), &k.account_id)?,
            LedgerKey::Trustline(k) => {
                queries::trustlines::load_trustline(db.conn(), &k.account_id, &k.asset)?
            }
            LedgerKey::Offer(k) => {
                queries::offers::load_offer(db.conn(), &k.seller_id, k.offer_id)?
            }
            LedgerKey::Data(k) => queries::data::load_data(db.conn(), &k.account_id, &k.data_name)?,
            _ => {
                return Err(StateError::InvariantViolated(
                    "unknown ledger key type".into(),
                ))
            }
        };

        self.entry_cache.lock().put(key.clone(), loaded.clone());
        Ok(loaded)
    }

    pub(crate) fn all_offers(&self) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        let db = self.db.lock();
        let mut offers = BTreeMap::new();
        for entry in queries::offers::load_all_offers(db.conn())? {
            offers.insert(entry_key(&entry)?, entry);
        }
        Ok(offers)
    }

    /// Serves the best offer from the cached prefix, extending it from the
    /// store in fixed-size batches until a non-excluded offer appears or the
    /// book is exhausted.
    pub(crate) fn best_offer(
        &self,
        buying: &Asset,
        selling: &Asset,
        exclude: &mut BTreeSet<LedgerKey>,
    ) -> Result<Option<LedgerEntry>> {
        let db = self.db.lock();
        let mut cache = self.best_offers_cache.lock();
        let book = cache.book_mut(buying, selling);

        for entry in &book.offers {
            if !exclude.contains(&entry_key(entry)?) {
                return Ok(Some(entry.clone()));
            }
        }

        while !book.all_loaded {
            let page = queries::offers::load_best_offers(
                db.conn(),
                buying,
                selling,
                BEST_OFFER_BATCH_SIZE,
                book.offers.len(),
            )?;
            if page.len() < BEST_OFFER_BATCH_SIZE {
                book.all_loaded = true;
            }
            let start = book.offers.len();
            book.offers.extend(page);
            for entry in &book.offers[start..] {
                if !exclude.contains(&entry_key(entry)?) {
                    return Ok(Some(entry.clone()));
                }
            }
        }

        Ok(None)
    }

    pub(crate) fn offers_by_account_and_asset(
        &self,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>> {
        let db = self.db.lock();
        let mut offers = BTreeMap::new();
        for entry in
            queries::offers::load_offers_by_account_and_asset(db.conn(), account_id, asset)?
        {
            offers.insert(entry_key(&entry)?, entry);
        }
        Ok(offers)
    }

    pub(crate) fn inflation_winners(
        &self,
        max_winners: usize,
        min_votes: i64,
    ) -> Result<Vec<InflationWinner>> {
        let db = self.db.lock();
        let winners = queries::accounts::load_inflation_winners(db.conn(), max_winners, min_votes)?;
        Ok(winners
            .into_iter()
            .map(|(account_id, votes)| InflationWinner { account_id, votes })
            .collect())
    }

    /// Attaches the single child and opens its store transaction.
    pub(crate) fn attach_child(&self, child: Weak<Mutex<ViewInner>>) -> Result<()> {
        let mut slot = self.child.lock();
        if slot.is_some() {
            return Err(StateError::HasChild);
        }
        self.db.lock().begin()?;
        *slot = Some(child);
        trace!("opened store transaction for child view");
        Ok(())
    }

    /// Writes a committing child's slots through to the store.
    pub(crate) fn commit_child(
        &self,
        entries: BTreeMap<LedgerKey, EntrySlot>,
        header: LedgerHeader,
    ) -> Result<()> {
        let mut slot = self.child.lock();
        let db = self.db.lock();

        // The book is about to change; the prefix cache is worthless now.
        self.best_offers_cache.lock().clear();

        let result: Result<()> = (|| {
            for (key, entry_slot) in &entries {
                match (key, entry_slot) {
                    (LedgerKey::Account(_), EntrySlot::Live(e)) => {
                        queries::accounts::upsert_account(db.conn(), e)?
                    }
                    (LedgerKey::Account(k), EntrySlot::Dead) => {
                        queries::accounts::delete_account(db.conn(), &k.account_id)?
                    }
                    (LedgerKey::Trustline(_), EntrySlot::Live(e)) => {
                        queries::trustlines::upsert_trustline(db.conn(), e)?
                    }
                    (LedgerKey::Trustline(k), EntrySlot::Dead) => {
                        queries::trustlines::delete_trustline(db.conn(), &k.account_id, &k.asset)?
                    }
                    (LedgerKey::Offer(_), EntrySlot::Live(e)) => {
                        queries::offers::upsert_offer(db.conn(), e)?
                    }
                    (LedgerKey::Offer(k), EntrySlot::Dead) => {
                        queries::offers::delete_offer(db.conn(), k.offer_id)?
                    }
                    (LedgerKey::Data(_), EntrySlot::Live(e)) => {
                        queries::data::upsert_data(db.conn(), e)?
                    }
                    (LedgerKey::Data(k), EntrySlot::Dead) => {
                        queries::data::delete_data(db.conn(), &k.account_id, &k.data_name)?
                    }
                    _ => {
                        return Err(StateError::InvariantViolated(
                            "unknown ledger key type".into(),
                        ))
                    }
                }

                let cached = match entry_slot {
                    EntrySlot::Live(e) => Some(e.clone()),
                    EntrySlot::Dead => None,
                };
                self.entry_cache.lock().put(key.clone(), cached);
            }
            queries::header::save_header(db.conn(), &header)?;
            db.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(
                    entries = entries.len(),
                    ledger_seq = header.ledger_seq,
                    "committed child view to store"
                );
                *self.header.lock() = header;
                *slot = None;
                Ok(())
            }
            Err(e) => {
                // The cache was updated mid-loop; none of it can be trusted.
                self.entry_cache.lock().clear();
                if let Err(rb) = db.rollback() {
                    warn!(error = %rb, "store rollback failed after commit error");
                }
                *slot = None;
                Err(e)
            }
        }
    }

    /// Aborts the child's store transaction.
    pub(crate) fn rollback_child(&self) {
        let mut slot = self.child.lock();
        if slot.is_none() {
            return;
        }
        if let Err(e) = self.db.lock().rollback() {
            warn!(error = %e, "store rollback failed");
        }
        *slot = None;
        trace!("rolled back child view");
    }
}

fn empty_header() -> LedgerHeader {
    LedgerHeader {
        ledger_version: 0,
        previous_ledger_hash: Hash([0; 32]),
        scp_value: StellarValue {
            tx_set_hash: Hash([0; 32]),
            close_time: TimePoint(0),
            upgrades: VecM::default(),
            ext: StellarValueExt::Basic,
        },
        tx_set_result_hash: Hash([0; 32]),
        bucket_list_hash: Hash([0; 32]),
        ledger_seq: 0,
        total_coins: 0,
        fee_pool: 0,
        inflation_seq: 0,
        id_pool: 0,
        base_fee: 0,
        base_reserve: 0,
        max_tx_set_size: 0,
        skip_list: [Hash([0; 32]), Hash([0; 32]), Hash([0; 32]), Hash([0; 32])],
        ext: LedgerHeaderExt::V0,
    }
}
