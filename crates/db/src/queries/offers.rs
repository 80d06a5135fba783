//! SQL-backed offer storage.
//!
//! The offers table is the only table the engine queries in sorted order:
//! best-offer pages come back ordered by `(price ASC, offerid ASC)`, where
//! `price` is a precomputed `n/d` REAL column used purely as a sort key
//! within one `(sellingasset, buyingasset)` book. Exact price comparisons
//! between individual offers always happen in memory by cross-multiplication.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE offers (
//!     sellerid         TEXT NOT NULL,      -- StrKey-encoded account id
//!     offerid          INTEGER NOT NULL PRIMARY KEY,
//!     sellingasset     TEXT NOT NULL,      -- base64-encoded XDR Asset
//!     buyingasset      TEXT NOT NULL,      -- base64-encoded XDR Asset
//!     amount           INTEGER NOT NULL,
//!     pricen           INTEGER NOT NULL,
//!     priced           INTEGER NOT NULL,
//!     price            REAL NOT NULL,
//!     flags            INTEGER NOT NULL,
//!     lastmodified     INTEGER NOT NULL,
//!     extension        TEXT NOT NULL,
//!     ledgerext        TEXT NOT NULL
//! );
//! ```

use rusqlite::{params, Connection};
use stellar_xdr::curr::{
    AccountId, Asset, LedgerEntry, LedgerEntryData, OfferEntry, Price,
};

use crate::codec::{decode_account_id, decode_xdr, encode_account_id, encode_xdr};
use crate::error::{DbError, Result};

/// SQL to create the offers table and its indexes.
pub const CREATE_OFFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS offers (
    sellerid         TEXT NOT NULL,
    offerid          INTEGER NOT NULL PRIMARY KEY,
    sellingasset     TEXT NOT NULL,
    buyingasset      TEXT NOT NULL,
    amount           INTEGER NOT NULL,
    pricen           INTEGER NOT NULL,
    priced           INTEGER NOT NULL,
    price            REAL NOT NULL,
    flags            INTEGER NOT NULL,
    lastmodified     INTEGER NOT NULL,
    extension        TEXT NOT NULL,
    ledgerext        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS bestofferindex ON offers (sellingasset, buyingasset, price, offerid);
CREATE INDEX IF NOT EXISTS offerbyseller ON offers (sellerid);
"#;

const OFFER_COLUMNS: &str = "sellerid, offerid, sellingasset, buyingasset, \
     amount, pricen, priced, flags, lastmodified, extension, ledgerext";

/// Sort key for the best-offer index.
fn price_as_double(price: &Price) -> f64 {
    price.n as f64 / price.d as f64
}

/// Load a single offer by seller and offer id.
pub fn load_offer(
    conn: &Connection,
    seller_id: &AccountId,
    offer_id: i64,
) -> Result<Option<LedgerEntry>> {
    if offer_id < 0 {
        return Ok(None);
    }

    let seller = encode_account_id(seller_id);
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OFFER_COLUMNS} FROM offers WHERE sellerid = ?1 AND offerid = ?2"
    ))?;
    let mut rows = stmt.query(params![seller, offer_id])?;

    match rows.next()? {
        Some(row) => Ok(Some(row_to_ledger_entry(row)?)),
        None => Ok(None),
    }
}

/// Load one page of the order book for `(buying, selling)`.
///
/// Offers come back in `(price ASC, offerid ASC)` order starting at `offset`
/// rows into the book. The caller extends its cached prefix page by page.
pub fn load_best_offers(
    conn: &Connection,
    buying: &Asset,
    selling: &Asset,
    limit: usize,
    offset: usize,
) -> Result<Vec<LedgerEntry>> {
    let buying_encoded = encode_xdr(buying)?;
    let selling_encoded = encode_xdr(selling)?;

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OFFER_COLUMNS} FROM offers \
         WHERE sellingasset = ?1 AND buyingasset = ?2 \
         ORDER BY price, offerid LIMIT ?3 OFFSET ?4"
    ))?;

    let mut rows = stmt.query(params![
        selling_encoded,
        buying_encoded,
        limit as i64,
        offset as i64
    ])?;
    let mut offers = Vec::with_capacity(limit);
    while let Some(row) = rows.next()? {
        offers.push(row_to_ledger_entry(row)?);
    }
    Ok(offers)
}

/// Load every offer where `account_id` is the seller and `asset` appears on
/// either side of the trade.
///
/// `asset` must not be native.
pub fn load_offers_by_account_and_asset(
    conn: &Connection,
    account_id: &AccountId,
    asset: &Asset,
) -> Result<Vec<LedgerEntry>> {
    if matches!(asset, Asset::Native) {
        return Err(DbError::Unsupported(
            "offers cannot be selected by the native asset",
        ));
    }

    let account = encode_account_id(account_id);
    let asset_encoded = encode_xdr(asset)?;

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OFFER_COLUMNS} FROM offers WHERE sellerid = ?1 AND \
         (sellingasset = ?2 OR buyingasset = ?3)"
    ))?;

    let mut rows = stmt.query(params![account, asset_encoded, asset_encoded])?;
    let mut offers = Vec::new();
    while let Some(row) = rows.next()? {
        offers.push(row_to_ledger_entry(row)?);
    }
    Ok(offers)
}

/// Load every offer in the store.
pub fn load_all_offers(conn: &Connection) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {OFFER_COLUMNS} FROM offers"))?;
    let mut rows = stmt.query([])?;
    let mut offers = Vec::new();
    while let Some(row) = rows.next()? {
        offers.push(row_to_ledger_entry(row)?);
    }
    Ok(offers)
}

/// Insert or update a single offer entry.
pub fn upsert_offer(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let offer = match &entry.data {
        LedgerEntryData::Offer(o) => o,
        _ => return Err(DbError::InvalidKey("entry is not an offer".into())),
    };

    let mut stmt = conn.prepare_cached(
        "INSERT INTO offers (sellerid, offerid, sellingasset, buyingasset, \
         amount, pricen, priced, price, flags, lastmodified, extension, ledgerext) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT (offerid) DO UPDATE SET \
         sellerid = excluded.sellerid, \
         sellingasset = excluded.sellingasset, \
         buyingasset = excluded.buyingasset, \
         amount = excluded.amount, \
         pricen = excluded.pricen, \
         priced = excluded.priced, \
         price = excluded.price, \
         flags = excluded.flags, \
         lastmodified = excluded.lastmodified, \
         extension = excluded.extension, \
         ledgerext = excluded.ledgerext",
    )?;

    stmt.execute(params![
        encode_account_id(&offer.seller_id),
        offer.offer_id,
        encode_xdr(&offer.selling)?,
        encode_xdr(&offer.buying)?,
        offer.amount,
        offer.price.n,
        offer.price.d,
        price_as_double(&offer.price),
        offer.flags,
        entry.last_modified_ledger_seq,
        encode_xdr(&offer.ext)?,
        encode_xdr(&entry.ext)?,
    ])?;
    Ok(())
}

/// Delete an offer by id.
pub fn delete_offer(conn: &Connection, offer_id: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM offers WHERE offerid = ?1")?;
    stmt.execute(params![offer_id])?;
    Ok(())
}

fn row_to_ledger_entry(row: &rusqlite::Row) -> Result<LedgerEntry> {
    let seller_strkey: String = row.get(0)?;
    let offer_id: i64 = row.get(1)?;
    let selling_encoded: String = row.get(2)?;
    let buying_encoded: String = row.get(3)?;
    let amount: i64 = row.get(4)?;
    let price_n: i32 = row.get(5)?;
    let price_d: i32 = row.get(6)?;
    let flags: u32 = row.get(7)?;
    let last_modified: u32 = row.get(8)?;
    let extension_encoded: String = row.get(9)?;
    let ledger_ext_encoded: String = row.get(10)?;

    Ok(LedgerEntry {
        last_modified_ledger_seq: last_modified,
        data: LedgerEntryData::Offer(OfferEntry {
            seller_id: decode_account_id(&seller_strkey)?,
            offer_id,
            selling: decode_xdr(&selling_encoded)?,
            buying: decode_xdr(&buying_encoded)?,
            amount,
            price: Price {
                n: price_n,
                d: price_d,
            },
            flags,
            ext: decode_xdr(&extension_encoded)?,
        }),
        ext: decode_xdr(&ledger_ext_encoded)?,
    })
}
