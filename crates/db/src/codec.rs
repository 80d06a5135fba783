//! Row codecs shared by the query modules.
//!
//! Account ids are stored StrKey-encoded so they are readable in the database
//! and sort the same way their text form sorts. Everything structured (assets,
//! entry extensions, whole entries) is stored as base64-encoded XDR.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use stellar_xdr::curr::{AccountId, Limits, PublicKey, ReadXdr, Uint256, WriteXdr};

use crate::error::{DbError, Result};

/// Encode an account id to its StrKey text form.
pub fn encode_account_id(account_id: &AccountId) -> String {
    match &account_id.0 {
        PublicKey::PublicKeyTypeEd25519(key) => {
            stellar_strkey::ed25519::PublicKey(key.0).to_string()
        }
    }
}

/// Decode a StrKey-encoded account id.
pub fn decode_account_id(strkey: &str) -> Result<AccountId> {
    let pk = stellar_strkey::ed25519::PublicKey::from_string(strkey)
        .map_err(|e| DbError::InvalidKey(e.to_string()))?;
    Ok(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(pk.0))))
}

/// Encode any XDR value to base64.
pub fn encode_xdr<T: WriteXdr>(value: &T) -> Result<String> {
    let bytes = value.to_xdr(Limits::none())?;
    Ok(BASE64.encode(bytes))
}

/// Decode a base64-encoded XDR value.
pub fn decode_xdr<T: ReadXdr>(encoded: &str) -> Result<T> {
    let bytes = BASE64.decode(encoded)?;
    Ok(T::from_xdr(bytes, Limits::none())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{AlphaNum4, Asset, AssetCode4};

    fn make_account_id(byte: u8) -> AccountId {
        AccountId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
    }

    #[test]
    fn test_account_id_roundtrip() {
        let id = make_account_id(42);
        let encoded = encode_account_id(&id);
        let decoded = decode_account_id(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_xdr_roundtrip() {
        let asset = Asset::CreditAlphanum4(AlphaNum4 {
            asset_code: AssetCode4(*b"USD\0"),
            issuer: make_account_id(7),
        });
        let encoded = encode_xdr(&asset).unwrap();
        let decoded: Asset = decode_xdr(&encoded).unwrap();
        assert_eq!(asset, decoded);
    }

    #[test]
    fn test_invalid_strkey_rejected() {
        assert!(decode_account_id("not a strkey").is_err());
    }
}
