//! Key projection and key constructors.
//!
//! Each supported entry variant has an injective projection onto a
//! [`LedgerKey`]; everything in the engine is addressed through these keys.

use stellar_xdr::curr::{
    AccountId, Asset, LedgerEntry, LedgerEntryData, LedgerKey, LedgerKeyAccount, LedgerKeyData,
    LedgerKeyOffer, LedgerKeyTrustLine, String64, TrustLineAsset,
};

use crate::error::{Result, StateError};

/// Projects an entry onto its key.
pub fn entry_key(entry: &LedgerEntry) -> Result<LedgerKey> {
    match &entry.data {
        LedgerEntryData::Account(a) => Ok(account_key(&a.account_id)),
        LedgerEntryData::Trustline(t) => Ok(LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: t.account_id.clone(),
            asset: t.asset.clone(),
        })),
        LedgerEntryData::Offer(o) => Ok(offer_key(&o.seller_id, o.offer_id)),
        LedgerEntryData::Data(d) => Ok(data_key(&d.account_id, &d.data_name)),
        _ => Err(StateError::InvariantViolated(
            "unknown ledger entry type".into(),
        )),
    }
}

/// Key of an account entry.
pub fn account_key(account_id: &AccountId) -> LedgerKey {
    LedgerKey::Account(LedgerKeyAccount {
        account_id: account_id.clone(),
    })
}

/// Key of a trust-line entry.
pub fn trust_line_key(account_id: &AccountId, asset: &Asset) -> LedgerKey {
    LedgerKey::Trustline(LedgerKeyTrustLine {
        account_id: account_id.clone(),
        asset: asset_to_trust_line_asset(asset),
    })
}

/// Key of an offer entry.
pub fn offer_key(seller_id: &AccountId, offer_id: i64) -> LedgerKey {
    LedgerKey::Offer(LedgerKeyOffer {
        seller_id: seller_id.clone(),
        offer_id,
    })
}

/// Key of a named-data entry.
pub fn data_key(account_id: &AccountId, data_name: &String64) -> LedgerKey {
    LedgerKey::Data(LedgerKeyData {
        account_id: account_id.clone(),
        data_name: data_name.clone(),
    })
}

/// Converts a trading asset into its trust-line form.
pub fn asset_to_trust_line_asset(asset: &Asset) -> TrustLineAsset {
    match asset {
        Asset::Native => TrustLineAsset::Native,
        Asset::CreditAlphanum4(a) => TrustLineAsset::CreditAlphanum4(a.clone()),
        Asset::CreditAlphanum12(a) => TrustLineAsset::CreditAlphanum12(a.clone()),
    }
}

/// The issuer of a credit asset, or `None` for the native asset.
pub fn asset_issuer(asset: &Asset) -> Option<&AccountId> {
    match asset {
        Asset::Native => None,
        Asset::CreditAlphanum4(a) => Some(&a.issuer),
        Asset::CreditAlphanum12(a) => Some(&a.issuer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{
        AlphaNum4, AssetCode4, LedgerEntryExt, OfferEntry, OfferEntryExt, Price, PublicKey,
        Uint256,
    };

    fn make_account_id(byte: u8) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
    }

    #[test]
    fn test_offer_entry_key() {
        let entry = LedgerEntry {
            last_modified_ledger_seq: 0,
            data: LedgerEntryData::Offer(OfferEntry {
                seller_id: make_account_id(1),
                offer_id: 42,
                selling: Asset::Native,
                buying: Asset::CreditAlphanum4(AlphaNum4 {
                    asset_code: AssetCode4(*b"USD\0"),
                    issuer: make_account_id(2),
                }),
                amount: 10,
                price: Price { n: 1, d: 1 },
                flags: 0,
                ext: OfferEntryExt::V0,
            }),
            ext: LedgerEntryExt::V0,
        };
        assert_eq!(entry_key(&entry).unwrap(), offer_key(&make_account_id(1), 42));
    }

    #[test]
    fn test_asset_issuer() {
        assert!(asset_issuer(&Asset::Native).is_none());
        let usd = Asset::CreditAlphanum4(AlphaNum4 {
            asset_code: AssetCode4(*b"USD\0"),
            issuer: make_account_id(9),
        });
        assert_eq!(asset_issuer(&usd), Some(&make_account_id(9)));
    }
}
