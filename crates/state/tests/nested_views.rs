//! End-to-end behavior of nested views over a store root.

use std::collections::BTreeSet;

use meridian_db::{queries, Database};
use meridian_state::keys::{account_key, entry_key, offer_key};
use meridian_state::{LedgerState, LedgerStateRoot, StateError};
use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, AccountId, AlphaNum4, Asset, AssetCode4, Hash, LedgerEntry,
    LedgerEntryChange, LedgerEntryData, LedgerEntryExt, LedgerEntryType, LedgerHeader,
    LedgerHeaderExt, OfferEntry, OfferEntryExt, Price, PublicKey, SequenceNumber, StellarValue,
    StellarValueExt, String32, Thresholds, TimePoint, Uint256, VecM,
};

fn make_account_id(byte: u8) -> AccountId {
    AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
}

fn make_header(ledger_seq: u32) -> LedgerHeader {
    LedgerHeader {
        ledger_version: 10,
        previous_ledger_hash: Hash([0; 32]),
        scp_value: StellarValue {
            tx_set_hash: Hash([0; 32]),
            close_time: TimePoint(0),
            upgrades: VecM::default(),
            ext: StellarValueExt::Basic,
        },
        tx_set_result_hash: Hash([0; 32]),
        bucket_list_hash: Hash([0; 32]),
        ledger_seq,
        total_coins: 0,
        fee_pool: 0,
        inflation_seq: 0,
        id_pool: 0,
        base_fee: 100,
        base_reserve: 5_000_000,
        max_tx_set_size: 100,
        skip_list: [Hash([0; 32]), Hash([0; 32]), Hash([0; 32]), Hash([0; 32])],
        ext: LedgerHeaderExt::V0,
    }
}

fn make_account(byte: u8, balance: i64) -> LedgerEntry {
    make_account_with_inflation(byte, balance, None)
}

fn make_account_with_inflation(byte: u8, balance: i64, dest: Option<u8>) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Account(AccountEntry {
            account_id: make_account_id(byte),
            balance,
            seq_num: SequenceNumber(1),
            num_sub_entries: 0,
            inflation_dest: dest.map(make_account_id),
            flags: 0,
            home_domain: String32::default(),
            thresholds: Thresholds([1, 0, 0, 0]),
            signers: vec![].try_into().unwrap(),
            ext: AccountEntryExt::V0,
        }),
        ext: LedgerEntryExt::V0,
    }
}

fn usd() -> Asset {
    Asset::CreditAlphanum4(AlphaNum4 {
        asset_code: AssetCode4(*b"USD\0"),
        issuer: make_account_id(200),
    })
}

fn eur() -> Asset {
    Asset::CreditAlphanum4(AlphaNum4 {
        asset_code: AssetCode4(*b"EUR\0"),
        issuer: make_account_id(201),
    })
}

fn make_offer(seller: u8, id: i64, selling: Asset, buying: Asset, amount: i64, n: i32, d: i32) -> LedgerEntry {
    LedgerEntry {
        last_modified_ledger_seq: 1,
        data: LedgerEntryData::Offer(OfferEntry {
            seller_id: make_account_id(seller),
            offer_id: id,
            selling,
            buying,
            amount,
            price: Price { n, d },
            flags: 0,
            ext: OfferEntryExt::V0,
        }),
        ext: LedgerEntryExt::V0,
    }
}

/// A root over an in-memory store seeded with a header and entries.
fn make_root(entries: &[LedgerEntry]) -> LedgerStateRoot {
    let db = Database::open_in_memory().unwrap();
    queries::header::save_header(db.conn(), &make_header(1)).unwrap();
    for entry in entries {
        match &entry.data {
            LedgerEntryData::Account(_) => {
                queries::accounts::upsert_account(db.conn(), entry).unwrap()
            }
            LedgerEntryData::Offer(_) => queries::offers::upsert_offer(db.conn(), entry).unwrap(),
            LedgerEntryData::Trustline(_) => {
                queries::trustlines::upsert_trustline(db.conn(), entry).unwrap()
            }
            _ => panic!("unsupported fixture entry"),
        }
    }
    LedgerStateRoot::new(db).unwrap()
}

fn balance_of(state: &LedgerState, byte: u8) -> i64 {
    let entry = state
        .newest_version(&account_key(&make_account_id(byte)))
        .unwrap()
        .unwrap();
    match entry.data {
        LedgerEntryData::Account(acc) => acc.balance,
        _ => panic!("not an account"),
    }
}

// S1: a created entry disappears without a trace when its view rolls back.
#[test]
fn test_create_then_rollback_leaves_nothing() {
    let root = make_root(&[]);
    let r = root.begin(true).unwrap();

    {
        let c = r.begin_child(true).unwrap();
        let view = c
            .create(make_offer(1, 1, usd(), eur(), 100, 1, 1))
            .unwrap();
        drop(view);
        c.rollback();
    }

    assert!(r.all_offers().unwrap().is_empty());
    r.commit().unwrap();
    assert_eq!(root.count_objects(LedgerEntryType::Offer).unwrap(), 0);
}

// S2: commit folds into the parent; the parent's rollback discards it all.
#[test]
fn test_nested_commit_folding() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();

    {
        let c1 = r.begin_child(true).unwrap();
        {
            let c2 = c1.begin_child(true).unwrap();
            let handle = c2.load(&account_key(&make_account_id(5))).unwrap().unwrap();
            handle
                .modify(|e| {
                    if let LedgerEntryData::Account(acc) = &mut e.data {
                        acc.balance = 42;
                    }
                })
                .unwrap();
            drop(handle);
            c2.commit().unwrap();
        }
        assert_eq!(balance_of(&c1, 5), 42);
        c1.rollback();
    }

    assert_eq!(balance_of(&r, 5), 1_000);
}

#[test]
fn test_rollback_restores_store_exactly() {
    let root = make_root(&[make_account(5, 1_000), make_offer(5, 9, usd(), eur(), 10, 1, 1)]);

    {
        let r = root.begin(true).unwrap();
        let c = r.begin_child(true).unwrap();
        c.erase(&offer_key(&make_account_id(5), 9)).unwrap();
        let handle = c.load(&account_key(&make_account_id(5))).unwrap().unwrap();
        handle
            .modify(|e| {
                if let LedgerEntryData::Account(acc) = &mut e.data {
                    acc.balance = 7;
                }
            })
            .unwrap();
        drop(handle);
        c.commit().unwrap();
        r.rollback();
    }

    assert_eq!(root.count_objects(LedgerEntryType::Offer).unwrap(), 1);
    assert_eq!(root.count_objects(LedgerEntryType::Account).unwrap(), 1);
    let account = root
        .newest_version(&account_key(&make_account_id(5)))
        .unwrap()
        .unwrap();
    match account.data {
        LedgerEntryData::Account(acc) => assert_eq!(acc.balance, 1_000),
        _ => panic!("not an account"),
    }
    assert!(root
        .newest_version(&offer_key(&make_account_id(5), 9))
        .unwrap()
        .is_some());
}

#[test]
fn test_active_handle_exclusivity() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    let key = account_key(&make_account_id(5));

    let handle = r.load(&key).unwrap().unwrap();
    assert!(matches!(r.load(&key), Err(StateError::AlreadyActive)));
    assert!(matches!(
        r.load_without_record(&key),
        Err(StateError::AlreadyActive)
    ));
    assert!(matches!(r.erase(&key), Err(StateError::AlreadyActive)));
    assert!(matches!(
        r.create(make_account(5, 1)),
        Err(StateError::KeyExists)
    ));
    drop(handle);

    // Released on drop: the key is loadable again.
    let handle = r.load(&key).unwrap().unwrap();
    drop(handle);

    let header = r.load_header().unwrap();
    assert!(matches!(r.load_header(), Err(StateError::HeaderActive)));
    drop(header);
    let _header = r.load_header().unwrap();
}

#[test]
fn test_handles_expire_with_their_view() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    let handle = r.load(&account_key(&make_account_id(5))).unwrap().unwrap();
    r.rollback();
    assert!(matches!(handle.current(), Err(StateError::HandleExpired)));
}

#[test]
fn test_child_surrenders_parent_handles() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    let handle = r.load(&account_key(&make_account_id(5))).unwrap().unwrap();

    let c = r.begin_child(true).unwrap();
    assert!(matches!(handle.current(), Err(StateError::HandleExpired)));
    assert!(matches!(
        r.load(&account_key(&make_account_id(5))),
        Err(StateError::HasChild)
    ));
    c.rollback();

    // With the child gone the parent is usable again.
    let _handle = r.load(&account_key(&make_account_id(5))).unwrap().unwrap();
}

#[test]
fn test_parent_rollback_closes_child() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    let c = r.begin_child(true).unwrap();
    r.rollback();
    assert!(matches!(
        c.load(&account_key(&make_account_id(5))),
        Err(StateError::Closed)
    ));
}

#[test]
fn test_sealing_rejects_mutation() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    let changes = r.get_changes().unwrap();
    assert!(changes.0.is_empty());

    assert!(matches!(
        r.load(&account_key(&make_account_id(5))),
        Err(StateError::Sealed)
    ));
    assert!(matches!(
        r.create(make_account(6, 1)),
        Err(StateError::Sealed)
    ));
    assert!(matches!(r.load_header(), Err(StateError::Sealed)));

    // The one mutation a sealed view admits.
    r.unseal_header(|h| h.ledger_seq = 99).unwrap();
    assert_eq!(r.header().ledger_seq, 99);
}

#[test]
fn test_unseal_header_requires_sealed() {
    let root = make_root(&[]);
    let r = root.begin(true).unwrap();
    assert!(matches!(
        r.unseal_header(|_| {}),
        Err(StateError::NotSealed)
    ));
}

#[test]
fn test_erase_semantics() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();

    // Unknown key: nothing to erase.
    assert!(matches!(
        r.erase(&account_key(&make_account_id(9))),
        Err(StateError::NotFound)
    ));

    // Created here and erased here: the slot vanishes entirely.
    let c = r.begin_child(true).unwrap();
    drop(c.create(make_account(9, 5)).unwrap());
    c.erase(&account_key(&make_account_id(9))).unwrap();
    assert!(c.entries().is_empty());

    // Known to the ancestor: a tombstone.
    c.erase(&account_key(&make_account_id(5))).unwrap();
    let entries = c.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries
        .get(&account_key(&make_account_id(5)))
        .unwrap()
        .is_none());
    assert!(c
        .newest_version(&account_key(&make_account_id(5)))
        .unwrap()
        .is_none());
    c.commit().unwrap();

    // Folded into the parent as a deletion of the stored entry.
    assert!(r
        .newest_version(&account_key(&make_account_id(5)))
        .unwrap()
        .is_none());
}

#[test]
fn test_create_over_tombstone() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    r.erase(&account_key(&make_account_id(5))).unwrap();
    let handle = r.create(make_account(5, 77)).unwrap();
    drop(handle);
    assert_eq!(balance_of(&r, 5), 77);
}

#[test]
fn test_get_changes_classification() {
    let root = make_root(&[make_account(5, 1_000), make_account(6, 2_000)]);
    let r = root.begin(true).unwrap();

    drop(r.create(make_account(7, 10)).unwrap());
    let handle = r.load(&account_key(&make_account_id(5))).unwrap().unwrap();
    handle
        .modify(|e| {
            if let LedgerEntryData::Account(acc) = &mut e.data {
                acc.balance = 11;
            }
        })
        .unwrap();
    drop(handle);
    r.erase(&account_key(&make_account_id(6))).unwrap();

    let changes = r.get_changes().unwrap();
    let kinds: Vec<&'static str> = changes
        .0
        .iter()
        .map(|c| match c {
            LedgerEntryChange::Created(_) => "created",
            LedgerEntryChange::Updated(_) => "updated",
            LedgerEntryChange::Removed(_) => "removed",
            LedgerEntryChange::State(_) => "state",
            _ => "other",
        })
        .collect();
    // Keys iterate in order: account 5 (updated), 6 (removed), 7 (created).
    assert_eq!(
        kinds,
        vec!["state", "updated", "state", "removed", "created"]
    );
}

#[test]
fn test_commit_stamps_last_modified() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();

    let header = r.load_header().unwrap();
    header.modify(|h| h.ledger_seq = 12).unwrap();
    drop(header);

    let handle = r.load(&account_key(&make_account_id(5))).unwrap().unwrap();
    handle
        .modify(|e| {
            if let LedgerEntryData::Account(acc) = &mut e.data {
                acc.balance = 2;
            }
        })
        .unwrap();
    drop(handle);
    r.commit().unwrap();

    let stored = root
        .newest_version(&account_key(&make_account_id(5)))
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_modified_ledger_seq, 12);
    assert_eq!(root.header().ledger_seq, 12);
}

#[test]
fn test_best_offer_merge_and_determinism() {
    let root = make_root(&[
        make_offer(1, 10, usd(), eur(), 100, 2, 1),
        make_offer(2, 11, usd(), eur(), 100, 1, 1),
        make_offer(3, 12, usd(), eur(), 100, 1, 2),
    ]);
    let r = root.begin(true).unwrap();

    // Best is the cheapest stored offer.
    let best = r.best_offer(&eur(), &usd(), BTreeSet::new()).unwrap().unwrap();
    assert_eq!(entry_key(&best).unwrap(), offer_key(&make_account_id(3), 12));

    // Deterministic for a fixed exclude set.
    let mut exclude = BTreeSet::new();
    exclude.insert(offer_key(&make_account_id(3), 12));
    let second = r
        .best_offer(&eur(), &usd(), exclude.clone())
        .unwrap()
        .unwrap();
    let second_again = r.best_offer(&eur(), &usd(), exclude).unwrap().unwrap();
    assert_eq!(entry_key(&second).unwrap(), entry_key(&second_again).unwrap());
    assert_eq!(
        entry_key(&second).unwrap(),
        offer_key(&make_account_id(2), 11)
    );

    // A locally created cheaper offer beats every stored one; a locally
    // superseded key never surfaces through the ancestor stream.
    let c = r.begin_child(true).unwrap();
    drop(c.create(make_offer(4, 13, usd(), eur(), 100, 1, 4)).unwrap());
    let best = c.best_offer(&eur(), &usd(), BTreeSet::new()).unwrap().unwrap();
    assert_eq!(entry_key(&best).unwrap(), offer_key(&make_account_id(4), 13));

    c.erase(&offer_key(&make_account_id(4), 13)).unwrap();
    c.erase(&offer_key(&make_account_id(3), 12)).unwrap();
    let best = c.best_offer(&eur(), &usd(), BTreeSet::new()).unwrap().unwrap();
    assert_eq!(entry_key(&best).unwrap(), offer_key(&make_account_id(2), 11));
}

#[test]
fn test_best_offer_ties_break_on_offer_id() {
    let root = make_root(&[
        make_offer(1, 21, usd(), eur(), 100, 1, 1),
        make_offer(2, 20, usd(), eur(), 100, 1, 1),
    ]);
    let r = root.begin(true).unwrap();
    let best = r.best_offer(&eur(), &usd(), BTreeSet::new()).unwrap().unwrap();
    assert_eq!(entry_key(&best).unwrap(), offer_key(&make_account_id(2), 20));
}

#[test]
fn test_best_offer_batches_past_prefix() {
    // More offers than one load batch; excluding the whole first batch must
    // reach into the next one.
    let mut entries = Vec::new();
    for i in 0..8i64 {
        entries.push(make_offer(1, 30 + i, usd(), eur(), 100, (i + 1) as i32, 1));
    }
    let root = make_root(&entries);

    let mut exclude = BTreeSet::new();
    for i in 0..7i64 {
        exclude.insert(offer_key(&make_account_id(1), 30 + i));
    }
    let best = root.best_offer(&eur(), &usd(), exclude).unwrap().unwrap();
    assert_eq!(entry_key(&best).unwrap(), offer_key(&make_account_id(1), 37));
}

#[test]
fn test_load_best_offer_opens_handle() {
    let root = make_root(&[make_offer(1, 10, usd(), eur(), 100, 1, 1)]);
    let r = root.begin(true).unwrap();
    let handle = r.load_best_offer(&eur(), &usd()).unwrap().unwrap();
    assert_eq!(handle.key(), &offer_key(&make_account_id(1), 10));
    handle.erase().unwrap();
    assert!(r.load_best_offer(&eur(), &usd()).unwrap().is_none());
}

#[test]
fn test_offers_by_account_and_asset() {
    let root = make_root(&[
        make_offer(1, 10, usd(), eur(), 100, 1, 1),
        make_offer(1, 11, eur(), usd(), 100, 1, 1),
        make_offer(2, 12, usd(), eur(), 100, 1, 1),
    ]);
    let r = root.begin(true).unwrap();

    let offers = r
        .offers_by_account_and_asset(&make_account_id(1), &usd())
        .unwrap();
    assert_eq!(offers.len(), 2);

    let c = r.begin_child(true).unwrap();
    c.erase(&offer_key(&make_account_id(1), 10)).unwrap();
    let offers = c
        .offers_by_account_and_asset(&make_account_id(1), &usd())
        .unwrap();
    assert_eq!(offers.len(), 1);
}

#[test]
fn test_inflation_winners_incremental() {
    let root = make_root(&[
        make_account_with_inflation(1, 5_000_000_000, Some(50)),
        make_account_with_inflation(2, 3_000_000_000, Some(60)),
    ]);
    let r = root.begin(true).unwrap();

    // Store-level winners pass through an empty view unchanged.
    let winners = r.inflation_winners(10, 1).unwrap();
    assert_eq!(winners.len(), 2);
    assert_eq!(winners[0].account_id, make_account_id(50));
    assert_eq!(winners[0].votes, 5_000_000_000);

    // A local balance change reranks the winners.
    let handle = r.load(&account_key(&make_account_id(2))).unwrap().unwrap();
    handle
        .modify(|e| {
            if let LedgerEntryData::Account(acc) = &mut e.data {
                acc.balance = 7_000_000_000;
            }
        })
        .unwrap();
    drop(handle);
    let winners = r.inflation_winners(10, 1).unwrap();
    assert_eq!(winners[0].account_id, make_account_id(60));
    assert_eq!(winners[0].votes, 7_000_000_000);

    // Votes below the voter threshold stop counting.
    let handle = r.load(&account_key(&make_account_id(2))).unwrap().unwrap();
    handle
        .modify(|e| {
            if let LedgerEntryData::Account(acc) = &mut e.data {
                acc.balance = 10;
            }
        })
        .unwrap();
    drop(handle);
    let winners = r.inflation_winners(10, 1).unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].account_id, make_account_id(50));

    // Truncation to max_winners.
    let winners = r.inflation_winners(0, 1).unwrap();
    assert!(winners.is_empty());
}

#[test]
fn test_root_single_child() {
    let root = make_root(&[]);
    let r = root.begin(true).unwrap();
    assert!(matches!(root.begin(true), Err(StateError::HasChild)));
    assert!(matches!(
        root.count_objects(LedgerEntryType::Offer),
        Err(StateError::HasChild)
    ));
    r.rollback();
    let _r = root.begin(true).unwrap();
}

#[test]
fn test_delete_objects_modified_on_or_after() {
    let root = make_root(&[make_account(5, 1_000)]);
    {
        let r = root.begin(true).unwrap();
        let header = r.load_header().unwrap();
        header.modify(|h| h.ledger_seq = 9).unwrap();
        drop(header);
        drop(r.create(make_account(6, 10)).unwrap());
        r.commit().unwrap();
    }
    assert_eq!(root.count_objects(LedgerEntryType::Account).unwrap(), 2);

    root.delete_objects_modified_on_or_after(9).unwrap();
    assert_eq!(root.count_objects(LedgerEntryType::Account).unwrap(), 1);
    assert!(root
        .newest_version(&account_key(&make_account_id(6)))
        .unwrap()
        .is_none());
    assert!(root
        .newest_version(&account_key(&make_account_id(5)))
        .unwrap()
        .is_some());
}

#[test]
fn test_load_without_record_is_not_written_back() {
    let root = make_root(&[make_account(5, 1_000)]);
    let r = root.begin(true).unwrap();
    {
        let handle = r
            .load_without_record(&account_key(&make_account_id(5)))
            .unwrap()
            .unwrap();
        assert!(matches!(
            handle.current().unwrap().data,
            LedgerEntryData::Account(_)
        ));
    }
    assert!(r.entries().is_empty());
    let changes = r.get_changes().unwrap();
    assert!(changes.0.is_empty());
}
