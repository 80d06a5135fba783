//! Bounded caches for the store root.
//!
//! Two caches sit in front of the persistent store. The entry cache maps a
//! key to its last known store-level state, present or absent, so repeated
//! point lookups during one ledger close hit memory. The best-offers cache
//! holds, per order book, the ordered prefix of offers loaded so far together
//! with a flag recording whether the store has been exhausted.
//!
//! Eviction follows an access counter: when a cache is full, the batch of
//! least-recently-stamped entries is dropped.

use std::collections::HashMap;

use stellar_xdr::curr::{Asset, LedgerEntry, LedgerKey};

/// Entry cache: key → present(entry) | absent, as last read from or written
/// to the store.
pub(crate) struct EntryCache {
    entries: HashMap<LedgerKey, CachedEntry>,
    capacity: usize,
    counter: u64,
}

struct CachedEntry {
    value: Option<LedgerEntry>,
    stamp: u64,
}

impl EntryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            counter: 0,
        }
    }

    /// Outer `None` means "not cached"; inner `None` means "known absent".
    pub fn get(&mut self, key: &LedgerKey) -> Option<Option<LedgerEntry>> {
        self.counter += 1;
        let counter = self.counter;
        let cached = self.entries.get_mut(key)?;
        cached.stamp = counter;
        Some(cached.value.clone())
    }

    pub fn put(&mut self, key: LedgerKey, value: Option<LedgerEntry>) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_batch();
        }
        self.counter += 1;
        self.entries.insert(
            key,
            CachedEntry {
                value,
                stamp: self.counter,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_batch(&mut self) {
        let target = (self.capacity / 10).max(1);
        let mut stamps: Vec<(u64, LedgerKey)> = self
            .entries
            .iter()
            .map(|(k, v)| (v.stamp, k.clone()))
            .collect();
        stamps.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, key) in stamps.into_iter().take(target) {
            self.entries.remove(&key);
        }
    }
}

/// One order book's cached state: the ordered prefix of offers loaded from
/// the store, and whether the store has no more rows for this book.
#[derive(Default)]
pub(crate) struct BestOffers {
    pub offers: Vec<LedgerEntry>,
    pub all_loaded: bool,
}

/// Best-offers cache, keyed by `(buying, selling)`.
pub(crate) struct BestOffersCache {
    books: HashMap<(Asset, Asset), CachedBook>,
    capacity: usize,
    counter: u64,
}

struct CachedBook {
    book: BestOffers,
    stamp: u64,
}

impl BestOffersCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            books: HashMap::new(),
            capacity: capacity.max(1),
            counter: 0,
        }
    }

    /// The cached book for an asset pair, created empty on first access.
    pub fn book_mut(&mut self, buying: &Asset, selling: &Asset) -> &mut BestOffers {
        let key = (buying.clone(), selling.clone());
        if self.books.len() >= self.capacity && !self.books.contains_key(&key) {
            self.evict_batch();
        }
        self.counter += 1;
        let counter = self.counter;
        let cached = self.books.entry(key).or_insert_with(|| CachedBook {
            book: BestOffers::default(),
            stamp: counter,
        });
        cached.stamp = counter;
        &mut cached.book
    }

    pub fn clear(&mut self) {
        self.books.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.books.len()
    }

    fn evict_batch(&mut self) {
        let target = (self.capacity / 10).max(1);
        let mut stamps: Vec<(u64, (Asset, Asset))> = self
            .books
            .iter()
            .map(|(k, v)| (v.stamp, k.clone()))
            .collect();
        stamps.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, key) in stamps.into_iter().take(target) {
            self.books.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{AccountId, LedgerKeyAccount, PublicKey, Uint256};

    fn make_key(byte: u8) -> LedgerKey {
        LedgerKey::Account(LedgerKeyAccount {
            account_id: AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32]))),
        })
    }

    #[test]
    fn test_entry_cache_hit_and_absent() {
        let mut cache = EntryCache::new(16);
        assert!(cache.get(&make_key(1)).is_none());

        cache.put(make_key(1), None);
        // Cached absence is a hit carrying None.
        assert_eq!(cache.get(&make_key(1)), Some(None));
    }

    #[test]
    fn test_entry_cache_eviction_is_bounded() {
        let mut cache = EntryCache::new(8);
        for i in 0..32u8 {
            cache.put(make_key(i), None);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_entry_cache_clear() {
        let mut cache = EntryCache::new(8);
        cache.put(make_key(1), None);
        cache.clear();
        assert!(cache.get(&make_key(1)).is_none());
    }

    #[test]
    fn test_best_offers_cache_prefix_persists() {
        let mut cache = BestOffersCache::new(4);
        cache.book_mut(&Asset::Native, &Asset::Native).all_loaded = true;
        assert!(cache.book_mut(&Asset::Native, &Asset::Native).all_loaded);

        cache.clear();
        assert!(!cache.book_mut(&Asset::Native, &Asset::Native).all_loaded);
        assert_eq!(cache.len(), 1);
    }
}
