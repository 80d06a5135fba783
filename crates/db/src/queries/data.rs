//! Named-data storage.

use rusqlite::{params, Connection, OptionalExtension};
use stellar_xdr::curr::{AccountId, LedgerEntry, LedgerEntryData, String64};

use crate::codec::{decode_xdr, encode_account_id, encode_xdr};
use crate::error::{DbError, Result};

/// SQL to create the accountdata table.
pub const CREATE_DATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accountdata (
    accountid       TEXT NOT NULL,
    dataname        TEXT NOT NULL,
    lastmodified    INTEGER NOT NULL,
    entry           TEXT NOT NULL,
    PRIMARY KEY (accountid, dataname)
);
"#;

/// Load a data entry by account and name.
pub fn load_data(
    conn: &Connection,
    account_id: &AccountId,
    data_name: &String64,
) -> Result<Option<LedgerEntry>> {
    let mut stmt = conn
        .prepare_cached("SELECT entry FROM accountdata WHERE accountid = ?1 AND dataname = ?2")?;
    let encoded: Option<String> = stmt
        .query_row(
            params![encode_account_id(account_id), encode_xdr(data_name)?],
            |row| row.get(0),
        )
        .optional()?;
    encoded.map(|e| decode_xdr(&e)).transpose()
}

/// Insert or update a data entry.
pub fn upsert_data(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let data = match &entry.data {
        LedgerEntryData::Data(d) => d,
        _ => return Err(DbError::InvalidKey("entry is not a data entry".into())),
    };

    let mut stmt = conn.prepare_cached(
        "INSERT INTO accountdata (accountid, dataname, lastmodified, entry) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (accountid, dataname) DO UPDATE SET \
         lastmodified = excluded.lastmodified, \
         entry = excluded.entry",
    )?;
    stmt.execute(params![
        encode_account_id(&data.account_id),
        encode_xdr(&data.data_name)?,
        entry.last_modified_ledger_seq,
        encode_xdr(entry)?,
    ])?;
    Ok(())
}

/// Delete a data entry by account and name.
pub fn delete_data(conn: &Connection, account_id: &AccountId, data_name: &String64) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("DELETE FROM accountdata WHERE accountid = ?1 AND dataname = ?2")?;
    stmt.execute(params![
        encode_account_id(account_id),
        encode_xdr(data_name)?
    ])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{DataEntry, DataEntryExt, DataValue, LedgerEntryExt, PublicKey, Uint256};

    fn make_account_id(byte: u8) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
    }

    #[test]
    fn test_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_DATA_TABLE).unwrap();

        let name = String64::try_from("config".as_bytes().to_vec()).unwrap();
        let entry = LedgerEntry {
            last_modified_ledger_seq: 3,
            data: LedgerEntryData::Data(DataEntry {
                account_id: make_account_id(4),
                data_name: name.clone(),
                data_value: DataValue(vec![1, 2, 3].try_into().unwrap()),
                ext: DataEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        };
        upsert_data(&conn, &entry).unwrap();
        assert_eq!(
            load_data(&conn, &make_account_id(4), &name).unwrap(),
            Some(entry)
        );

        delete_data(&conn, &make_account_id(4), &name).unwrap();
        assert!(load_data(&conn, &make_account_id(4), &name).unwrap().is_none());
    }
}
