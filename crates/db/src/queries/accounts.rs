//! Account storage.
//!
//! The full entry travels as one XDR blob; `balance` and `inflationdest` are
//! duplicated into indexed columns because the inflation-winner aggregate
//! filters and groups on them.

use rusqlite::{params, Connection, OptionalExtension};
use stellar_xdr::curr::{AccountId, LedgerEntry, LedgerEntryData};

use crate::codec::{decode_account_id, decode_xdr, encode_account_id, encode_xdr};
use crate::error::{DbError, Result};

/// Minimum balance an account must hold for its inflation vote to count,
/// in stroops.
pub const INFLATION_VOTE_THRESHOLD: i64 = 1_000_000_000;

/// SQL to create the accounts table and the inflation index.
pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    accountid       TEXT NOT NULL PRIMARY KEY,
    balance         INTEGER NOT NULL,
    inflationdest   TEXT,
    lastmodified    INTEGER NOT NULL,
    entry           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS accountbalances ON accounts (balance)
    WHERE balance >= 1000000000;
"#;

/// Load an account entry by id.
pub fn load_account(conn: &Connection, account_id: &AccountId) -> Result<Option<LedgerEntry>> {
    let mut stmt =
        conn.prepare_cached("SELECT entry FROM accounts WHERE accountid = ?1")?;
    let encoded: Option<String> = stmt
        .query_row(params![encode_account_id(account_id)], |row| row.get(0))
        .optional()?;
    encoded.map(|e| decode_xdr(&e)).transpose()
}

/// Insert or update an account entry.
pub fn upsert_account(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let account = match &entry.data {
        LedgerEntryData::Account(a) => a,
        _ => return Err(DbError::InvalidKey("entry is not an account".into())),
    };

    let inflation_dest = account.inflation_dest.as_ref().map(encode_account_id);

    let mut stmt = conn.prepare_cached(
        "INSERT INTO accounts (accountid, balance, inflationdest, lastmodified, entry) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (accountid) DO UPDATE SET \
         balance = excluded.balance, \
         inflationdest = excluded.inflationdest, \
         lastmodified = excluded.lastmodified, \
         entry = excluded.entry",
    )?;
    stmt.execute(params![
        encode_account_id(&account.account_id),
        account.balance,
        inflation_dest,
        entry.last_modified_ledger_seq,
        encode_xdr(entry)?,
    ])?;
    Ok(())
}

/// Delete an account entry by id.
pub fn delete_account(conn: &Connection, account_id: &AccountId) -> Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM accounts WHERE accountid = ?1")?;
    stmt.execute(params![encode_account_id(account_id)])?;
    Ok(())
}

/// Aggregate inflation votes.
///
/// Returns up to `max_winners` destination accounts whose summed voter
/// balances are at least `min_votes`, counting only voters at or above
/// [`INFLATION_VOTE_THRESHOLD`]. Ordered by `(votes DESC, strkey DESC)`;
/// the StrKey text column sorts the same way the engine's in-memory
/// tie-break does.
pub fn load_inflation_winners(
    conn: &Connection,
    max_winners: usize,
    min_votes: i64,
) -> Result<Vec<(AccountId, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sum(balance) AS votes, inflationdest FROM accounts \
         WHERE inflationdest IS NOT NULL AND balance >= ?1 \
         GROUP BY inflationdest \
         HAVING sum(balance) >= ?2 \
         ORDER BY votes DESC, inflationdest DESC \
         LIMIT ?3",
    )?;

    let mut rows = stmt.query(params![
        INFLATION_VOTE_THRESHOLD,
        min_votes,
        max_winners as i64
    ])?;
    let mut winners = Vec::new();
    while let Some(row) = rows.next()? {
        let votes: i64 = row.get(0)?;
        let dest: String = row.get(1)?;
        winners.push((decode_account_id(&dest)?, votes));
    }
    Ok(winners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{
        AccountEntry, AccountEntryExt, LedgerEntryExt, PublicKey, SequenceNumber, String32,
        Thresholds, Uint256,
    };

    fn make_account_id(byte: u8) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
    }

    fn make_account(byte: u8, balance: i64, inflation_dest: Option<u8>) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: make_account_id(byte),
                balance,
                seq_num: SequenceNumber(1),
                num_sub_entries: 0,
                inflation_dest: inflation_dest.map(make_account_id),
                flags: 0,
                home_domain: String32::default(),
                thresholds: Thresholds([1, 0, 0, 0]),
                signers: vec![].try_into().unwrap(),
                ext: AccountEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        }
    }

    fn make_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_ACCOUNTS_TABLE).unwrap();
        conn
    }

    #[test]
    fn test_roundtrip() {
        let conn = make_db();
        let entry = make_account(3, 500, None);
        upsert_account(&conn, &entry).unwrap();
        assert_eq!(load_account(&conn, &make_account_id(3)).unwrap(), Some(entry));

        delete_account(&conn, &make_account_id(3)).unwrap();
        assert!(load_account(&conn, &make_account_id(3)).unwrap().is_none());
    }

    #[test]
    fn test_inflation_winners() {
        let conn = make_db();
        // Two voters for dest 50, one for dest 60, one below the threshold.
        upsert_account(&conn, &make_account(1, 2_000_000_000, Some(50))).unwrap();
        upsert_account(&conn, &make_account(2, 3_000_000_000, Some(50))).unwrap();
        upsert_account(&conn, &make_account(3, 4_000_000_000, Some(60))).unwrap();
        upsert_account(&conn, &make_account(4, 10, Some(60))).unwrap();

        let winners = load_inflation_winners(&conn, 10, 1).unwrap();
        assert_eq!(winners.len(), 2);
        assert_eq!(winners[0], (make_account_id(50), 5_000_000_000));
        assert_eq!(winners[1], (make_account_id(60), 4_000_000_000));

        let capped = load_inflation_winners(&conn, 1, 1).unwrap();
        assert_eq!(capped.len(), 1);

        let high_bar = load_inflation_winners(&conn, 10, 4_500_000_000).unwrap();
        assert_eq!(high_bar.len(), 1);
        assert_eq!(high_bar[0].0, make_account_id(50));
    }
}
