//! Polymorphic trust-line views.
//!
//! An account holding a credit asset does so through a trust-line entry,
//! unless it *is* the issuer, in which case no entry exists and the line is
//! synthetic: infinite balance, zero liabilities, always authorized, and
//! mutations that succeed without effect. [`TrustLineView`] unifies the two
//! behind one accessor surface so offer code never branches on issuer-ness.

use stellar_xdr::curr::{
    AccountId, Asset, LedgerEntry, LedgerEntryData, Liabilities, TrustLineEntry,
    TrustLineEntryExt, TrustLineEntryV1, TrustLineEntryV1Ext, TrustLineFlags,
};

use crate::entry::{ConstEntryView, EntryView};
use crate::error::{Result, StateError};
use crate::header::HeaderView;
use crate::keys::{asset_issuer, trust_line_key};
use crate::view::LedgerState;

use meridian_common::protocol::{protocol_version_starts_from, LIABILITIES_PROTOCOL_VERSION};

/// Reads the liabilities recorded on a trust-line entry.
pub fn trust_line_liabilities(line: &TrustLineEntry) -> Liabilities {
    match &line.ext {
        TrustLineEntryExt::V1(v1) => v1.liabilities.clone(),
        TrustLineEntryExt::V0 => Liabilities {
            buying: 0,
            selling: 0,
        },
    }
}

fn set_trust_line_liabilities(line: &mut TrustLineEntry, liabilities: Liabilities) {
    match &mut line.ext {
        TrustLineEntryExt::V1(v1) => v1.liabilities = liabilities,
        TrustLineEntryExt::V0 => {
            line.ext = TrustLineEntryExt::V1(TrustLineEntryV1 {
                liabilities,
                ext: TrustLineEntryV1Ext::V0,
            });
        }
    }
}

fn is_authorized_flag(flags: u32) -> bool {
    flags & (TrustLineFlags::AuthorizedFlag as u32) != 0
}

fn as_trust_line(entry: &LedgerEntry) -> Result<&TrustLineEntry> {
    match &entry.data {
        LedgerEntryData::Trustline(line) => Ok(line),
        _ => Err(StateError::InvariantViolated(
            "entry is not a trust line".into(),
        )),
    }
}

/// A live view over an account's line to one asset.
pub enum TrustLineView {
    /// The synthetic line of the asset's issuer.
    Issuer { account_id: AccountId, asset: Asset },
    /// A real trust-line entry, held through a mutable handle.
    Line {
        entry: EntryView,
        account_id: AccountId,
        asset: Asset,
    },
}

impl TrustLineView {
    /// Loads the line `account_id` holds for `asset`, or the issuer-synthetic
    /// line when `account_id` issues the asset. `Ok(None)` means no line.
    pub fn load(
        state: &LedgerState,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<Option<TrustLineView>> {
        let issuer = asset_issuer(asset).ok_or_else(|| {
            StateError::InvariantViolated("the native asset has no trust line".into())
        })?;
        if issuer == account_id {
            return Ok(Some(TrustLineView::Issuer {
                account_id: account_id.clone(),
                asset: asset.clone(),
            }));
        }
        let key = trust_line_key(account_id, asset);
        Ok(state.load(&key)?.map(|entry| TrustLineView::Line {
            entry,
            account_id: account_id.clone(),
            asset: asset.clone(),
        }))
    }

    pub fn account_id(&self) -> &AccountId {
        match self {
            TrustLineView::Issuer { account_id, .. } => account_id,
            TrustLineView::Line { account_id, .. } => account_id,
        }
    }

    pub fn asset(&self) -> &Asset {
        match self {
            TrustLineView::Issuer { asset, .. } => asset,
            TrustLineView::Line { asset, .. } => asset,
        }
    }

    /// Balance of the line; the issuer's is unbounded.
    pub fn balance(&self) -> Result<i64> {
        match self {
            TrustLineView::Issuer { .. } => Ok(i64::MAX),
            TrustLineView::Line { entry, .. } => {
                let current = entry.current()?;
                Ok(as_trust_line(&current)?.balance)
            }
        }
    }

    /// Adds `delta` to the balance, bounded below by selling liabilities and
    /// above by `limit - buying liabilities` from version 10 on. Returns
    /// whether the new balance fits; the issuer's line absorbs anything.
    pub fn add_balance(&self, header: &HeaderView, delta: i64) -> Result<bool> {
        match self {
            TrustLineView::Issuer { .. } => Ok(true),
            TrustLineView::Line { entry, .. } => {
                if delta == 0 {
                    return Ok(true);
                }
                let version = header.ledger_version()?;
                entry.modify(|raw| {
                    let line = match &mut raw.data {
                        LedgerEntryData::Trustline(line) => line,
                        _ => return false,
                    };
                    let liabilities = trust_line_liabilities(line);
                    let (min_balance, max_balance) =
                        if protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
                            (liabilities.selling, line.limit - liabilities.buying)
                        } else {
                            (0, line.limit)
                        };
                    let new_balance = match line.balance.checked_add(delta) {
                        Some(b) => b,
                        None => return false,
                    };
                    if new_balance < min_balance || new_balance > max_balance {
                        return false;
                    }
                    line.balance = new_balance;
                    true
                })
            }
        }
    }

    /// Buying liabilities recorded on the line; zero for the issuer.
    pub fn buying_liabilities(&self, _header: &HeaderView) -> Result<i64> {
        match self {
            TrustLineView::Issuer { .. } => Ok(0),
            TrustLineView::Line { entry, .. } => {
                let current = entry.current()?;
                Ok(trust_line_liabilities(as_trust_line(&current)?).buying)
            }
        }
    }

    /// Selling liabilities recorded on the line; zero for the issuer.
    pub fn selling_liabilities(&self, _header: &HeaderView) -> Result<i64> {
        match self {
            TrustLineView::Issuer { .. } => Ok(0),
            TrustLineView::Line { entry, .. } => {
                let current = entry.current()?;
                Ok(trust_line_liabilities(as_trust_line(&current)?).selling)
            }
        }
    }

    /// Adds `delta` to buying liabilities. The new total must stay within
    /// `[0, limit - balance]`. The issuer's line succeeds without effect.
    pub fn add_buying_liabilities(&self, header: &HeaderView, delta: i64) -> Result<bool> {
        match self {
            TrustLineView::Issuer { .. } => Ok(true),
            TrustLineView::Line { entry, .. } => {
                let version = header.ledger_version()?;
                if !protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
                    return Err(StateError::InvariantViolated(
                        "liabilities do not exist before version 10".into(),
                    ));
                }
                entry.modify(|raw| {
                    let line = match &mut raw.data {
                        LedgerEntryData::Trustline(line) => line,
                        _ => return false,
                    };
                    let mut liabilities = trust_line_liabilities(line);
                    let new_buying = match liabilities.buying.checked_add(delta) {
                        Some(v) => v,
                        None => return false,
                    };
                    if new_buying < 0 || new_buying > line.limit - line.balance {
                        return false;
                    }
                    liabilities.buying = new_buying;
                    set_trust_line_liabilities(line, liabilities);
                    true
                })
            }
        }
    }

    /// Adds `delta` to selling liabilities. The new total must stay within
    /// `[0, balance]`. The issuer's line succeeds without effect.
    pub fn add_selling_liabilities(&self, header: &HeaderView, delta: i64) -> Result<bool> {
        match self {
            TrustLineView::Issuer { .. } => Ok(true),
            TrustLineView::Line { entry, .. } => {
                let version = header.ledger_version()?;
                if !protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
                    return Err(StateError::InvariantViolated(
                        "liabilities do not exist before version 10".into(),
                    ));
                }
                entry.modify(|raw| {
                    let line = match &mut raw.data {
                        LedgerEntryData::Trustline(line) => line,
                        _ => return false,
                    };
                    let mut liabilities = trust_line_liabilities(line);
                    let new_selling = match liabilities.selling.checked_add(delta) {
                        Some(v) => v,
                        None => return false,
                    };
                    if new_selling < 0 || new_selling > line.balance {
                        return false;
                    }
                    liabilities.selling = new_selling;
                    set_trust_line_liabilities(line, liabilities);
                    true
                })
            }
        }
    }

    /// Whether the holder is authorized; the issuer always is.
    pub fn is_authorized(&self) -> Result<bool> {
        match self {
            TrustLineView::Issuer { .. } => Ok(true),
            TrustLineView::Line { entry, .. } => {
                let current = entry.current()?;
                Ok(is_authorized_flag(as_trust_line(&current)?.flags))
            }
        }
    }

    /// Balance net of selling liabilities (version 10 on).
    pub fn available_balance(&self, header: &HeaderView) -> Result<i64> {
        match self {
            TrustLineView::Issuer { .. } => Ok(i64::MAX),
            TrustLineView::Line { entry, .. } => {
                let version = header.ledger_version()?;
                let current = entry.current()?;
                let line = as_trust_line(&current)?;
                available_balance_of(line, version)
            }
        }
    }

    /// Room left under the limit, net of buying liabilities (version 10 on).
    pub fn max_amount_receive(&self, header: &HeaderView) -> Result<i64> {
        match self {
            TrustLineView::Issuer { .. } => Ok(i64::MAX),
            TrustLineView::Line { entry, .. } => {
                let version = header.ledger_version()?;
                let current = entry.current()?;
                let line = as_trust_line(&current)?;
                max_amount_receive_of(line, version)
            }
        }
    }
}

/// A read-only view over an account's line to one asset.
pub enum ConstTrustLineView {
    Issuer { account_id: AccountId, asset: Asset },
    Line { entry: ConstEntryView },
}

impl ConstTrustLineView {
    /// Read-only counterpart of [`TrustLineView::load`], backed by
    /// `load_without_record`.
    pub fn load(
        state: &LedgerState,
        account_id: &AccountId,
        asset: &Asset,
    ) -> Result<Option<ConstTrustLineView>> {
        let issuer = asset_issuer(asset).ok_or_else(|| {
            StateError::InvariantViolated("the native asset has no trust line".into())
        })?;
        if issuer == account_id {
            return Ok(Some(ConstTrustLineView::Issuer {
                account_id: account_id.clone(),
                asset: asset.clone(),
            }));
        }
        let key = trust_line_key(account_id, asset);
        Ok(state
            .load_without_record(&key)?
            .map(|entry| ConstTrustLineView::Line { entry }))
    }

    pub fn balance(&self) -> Result<i64> {
        match self {
            ConstTrustLineView::Issuer { .. } => Ok(i64::MAX),
            ConstTrustLineView::Line { entry } => Ok(as_trust_line(entry.current()?)?.balance),
        }
    }

    pub fn is_authorized(&self) -> Result<bool> {
        match self {
            ConstTrustLineView::Issuer { .. } => Ok(true),
            ConstTrustLineView::Line { entry } => {
                Ok(is_authorized_flag(as_trust_line(entry.current()?)?.flags))
            }
        }
    }

    pub fn available_balance(&self, header: &HeaderView) -> Result<i64> {
        match self {
            ConstTrustLineView::Issuer { .. } => Ok(i64::MAX),
            ConstTrustLineView::Line { entry } => {
                let version = header.ledger_version()?;
                available_balance_of(as_trust_line(entry.current()?)?, version)
            }
        }
    }

    pub fn max_amount_receive(&self, header: &HeaderView) -> Result<i64> {
        match self {
            ConstTrustLineView::Issuer { .. } => Ok(i64::MAX),
            ConstTrustLineView::Line { entry } => {
                let version = header.ledger_version()?;
                max_amount_receive_of(as_trust_line(entry.current()?)?, version)
            }
        }
    }
}

fn available_balance_of(line: &TrustLineEntry, version: u32) -> Result<i64> {
    let mut available = line.balance;
    if protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
        available -= trust_line_liabilities(line).selling;
    }
    Ok(available.max(0))
}

fn max_amount_receive_of(line: &TrustLineEntry, version: u32) -> Result<i64> {
    let mut room = line.limit - line.balance;
    if protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
        room -= trust_line_liabilities(line).buying;
    }
    Ok(room.max(0))
}
