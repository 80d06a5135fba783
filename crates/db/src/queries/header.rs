//! Ledger-header persistence.
//!
//! The store keeps exactly the last committed header, in a single-row table.
//! The root view reads it at construction and rewrites it inside the same
//! store transaction that carries the entry diffs of a committing child.

use rusqlite::{params, Connection, OptionalExtension};
use stellar_xdr::curr::LedgerHeader;

use crate::codec::{decode_xdr, encode_xdr};
use crate::error::Result;

/// SQL to create the header table.
pub const CREATE_HEADER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledgerheader (
    id              INTEGER NOT NULL PRIMARY KEY CHECK (id = 0),
    ledgerseq       INTEGER NOT NULL,
    data            TEXT NOT NULL
);
"#;

/// Load the last committed header, if any has been written.
pub fn load_header(conn: &Connection) -> Result<Option<LedgerHeader>> {
    let mut stmt = conn.prepare_cached("SELECT data FROM ledgerheader WHERE id = 0")?;
    let encoded: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;
    encoded.map(|e| decode_xdr(&e)).transpose()
}

/// Write the last committed header.
pub fn save_header(conn: &Connection, header: &LedgerHeader) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO ledgerheader (id, ledgerseq, data) VALUES (0, ?1, ?2) \
         ON CONFLICT (id) DO UPDATE SET \
         ledgerseq = excluded.ledgerseq, \
         data = excluded.data",
    )?;
    stmt.execute(params![header.ledger_seq, encode_xdr(header)?])?;
    Ok(())
}
