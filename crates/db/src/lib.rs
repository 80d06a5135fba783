//! SQLite-backed persistent ledger store.
//!
//! This crate is the bottom of the Meridian state stack: one table per entry
//! variant (accounts, trust lines, offers, named data) plus a single-row
//! header table, with the exact query surface the root view requires:
//! point lookups by key, ordered best-offer pages, the account+asset offer
//! selection, the inflation-winner aggregate, object counts, and store-level
//! transactions.
//!
//! All writes are expected to happen inside a store transaction driven by the
//! root view; the [`Database`] type exposes `begin`/`commit`/`rollback` for
//! that purpose and deliberately keeps no transaction object alive across
//! calls.

use rusqlite::Connection;
use stellar_xdr::curr::LedgerEntryType;
use tracing::debug;

mod codec;
mod error;
pub mod queries;

pub use codec::{decode_account_id, encode_account_id};
pub use error::{DbError, Result};

/// A handle to the SQLite ledger store.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a store at the given path and ensure the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Open a fresh in-memory store. Used heavily by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(queries::accounts::CREATE_ACCOUNTS_TABLE)?;
        self.conn
            .execute_batch(queries::trustlines::CREATE_TRUSTLINES_TABLE)?;
        self.conn.execute_batch(queries::offers::CREATE_OFFERS_TABLE)?;
        self.conn.execute_batch(queries::data::CREATE_DATA_TABLE)?;
        self.conn.execute_batch(queries::header::CREATE_HEADER_TABLE)?;
        Ok(())
    }

    /// The underlying connection, for the query modules.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a store transaction.
    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Commit the open store transaction.
    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open store transaction.
    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Count stored objects of one entry variant.
    pub fn count_objects(&self, entry_type: LedgerEntryType) -> Result<u64> {
        let table = table_for_entry_type(entry_type)?;
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    /// Count stored objects of one variant last modified within
    /// `[first, last]` (inclusive).
    pub fn count_objects_in_range(
        &self,
        entry_type: LedgerEntryType,
        first: u32,
        last: u32,
    ) -> Result<u64> {
        let table = table_for_entry_type(entry_type)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE lastmodified >= ?1 AND lastmodified <= ?2"),
            rusqlite::params![first, last],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete every object last modified at or after `ledger`.
    ///
    /// Used when rewinding the store to an earlier ledger; callers must also
    /// discard any in-memory caches built over the deleted range.
    pub fn delete_objects_modified_on_or_after(&self, ledger: u32) -> Result<()> {
        debug!(ledger, "deleting objects modified on or after ledger");
        for table in ["accounts", "trustlines", "offers", "accountdata"] {
            self.conn.execute(
                &format!("DELETE FROM {table} WHERE lastmodified >= ?1"),
                rusqlite::params![ledger],
            )?;
        }
        Ok(())
    }
}

fn table_for_entry_type(entry_type: LedgerEntryType) -> Result<&'static str> {
    match entry_type {
        LedgerEntryType::Account => Ok("accounts"),
        LedgerEntryType::Trustline => Ok("trustlines"),
        LedgerEntryType::Offer => Ok("offers"),
        LedgerEntryType::Data => Ok("accountdata"),
        _ => Err(DbError::Unsupported("unknown ledger entry type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{
        AccountEntry, AccountEntryExt, AccountId, LedgerEntry, LedgerEntryData, LedgerEntryExt,
        PublicKey, SequenceNumber, String32, Thresholds, Uint256,
    };

    fn make_account(byte: u8, last_modified: u32) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: last_modified,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32]))),
                balance: 100,
                seq_num: SequenceNumber(1),
                num_sub_entries: 0,
                inflation_dest: None,
                flags: 0,
                home_domain: String32::default(),
                thresholds: Thresholds([1, 0, 0, 0]),
                signers: vec![].try_into().unwrap(),
                ext: AccountEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    #[test]
    fn test_counts_and_range_deletion() {
        let db = Database::open_in_memory().unwrap();
        queries::accounts::upsert_account(db.conn(), &make_account(1, 5)).unwrap();
        queries::accounts::upsert_account(db.conn(), &make_account(2, 9)).unwrap();

        assert_eq!(db.count_objects(LedgerEntryType::Account).unwrap(), 2);
        assert_eq!(
            db.count_objects_in_range(LedgerEntryType::Account, 6, 9).unwrap(),
            1
        );
        assert_eq!(db.count_objects(LedgerEntryType::Offer).unwrap(), 0);

        db.delete_objects_modified_on_or_after(6).unwrap();
        assert_eq!(db.count_objects(LedgerEntryType::Account).unwrap(), 1);
    }

    #[test]
    fn test_transaction_rollback() {
        let db = Database::open_in_memory().unwrap();
        db.begin().unwrap();
        queries::accounts::upsert_account(db.conn(), &make_account(1, 1)).unwrap();
        db.rollback().unwrap();
        assert_eq!(db.count_objects(LedgerEntryType::Account).unwrap(), 0);

        db.begin().unwrap();
        queries::accounts::upsert_account(db.conn(), &make_account(1, 1)).unwrap();
        db.commit().unwrap();
        assert_eq!(db.count_objects(LedgerEntryType::Account).unwrap(), 1);
    }
}
