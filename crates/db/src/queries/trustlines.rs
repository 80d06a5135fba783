//! Trust-line storage.

use rusqlite::{params, Connection, OptionalExtension};
use stellar_xdr::curr::{AccountId, LedgerEntry, LedgerEntryData, TrustLineAsset};

use crate::codec::{decode_xdr, encode_account_id, encode_xdr};
use crate::error::{DbError, Result};

/// SQL to create the trustlines table.
pub const CREATE_TRUSTLINES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trustlines (
    accountid       TEXT NOT NULL,
    asset           TEXT NOT NULL,
    balance         INTEGER NOT NULL,
    tlimit          INTEGER NOT NULL,
    flags           INTEGER NOT NULL,
    lastmodified    INTEGER NOT NULL,
    entry           TEXT NOT NULL,
    PRIMARY KEY (accountid, asset)
);
"#;

/// Load a trust line by account and asset.
pub fn load_trustline(
    conn: &Connection,
    account_id: &AccountId,
    asset: &TrustLineAsset,
) -> Result<Option<LedgerEntry>> {
    let mut stmt = conn
        .prepare_cached("SELECT entry FROM trustlines WHERE accountid = ?1 AND asset = ?2")?;
    let encoded: Option<String> = stmt
        .query_row(
            params![encode_account_id(account_id), encode_xdr(asset)?],
            |row| row.get(0),
        )
        .optional()?;
    encoded.map(|e| decode_xdr(&e)).transpose()
}

/// Insert or update a trust-line entry.
pub fn upsert_trustline(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let line = match &entry.data {
        LedgerEntryData::Trustline(t) => t,
        _ => return Err(DbError::InvalidKey("entry is not a trust line".into())),
    };

    let mut stmt = conn.prepare_cached(
        "INSERT INTO trustlines (accountid, asset, balance, tlimit, flags, lastmodified, entry) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT (accountid, asset) DO UPDATE SET \
         balance = excluded.balance, \
         tlimit = excluded.tlimit, \
         flags = excluded.flags, \
         lastmodified = excluded.lastmodified, \
         entry = excluded.entry",
    )?;
    stmt.execute(params![
        encode_account_id(&line.account_id),
        encode_xdr(&line.asset)?,
        line.balance,
        line.limit,
        line.flags,
        entry.last_modified_ledger_seq,
        encode_xdr(entry)?,
    ])?;
    Ok(())
}

/// Delete a trust line by account and asset.
pub fn delete_trustline(
    conn: &Connection,
    account_id: &AccountId,
    asset: &TrustLineAsset,
) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("DELETE FROM trustlines WHERE accountid = ?1 AND asset = ?2")?;
    stmt.execute(params![encode_account_id(account_id), encode_xdr(asset)?])?;
    Ok(())
}
