//! Account helpers, liability accounting and the offer adjuster.
//!
//! Liabilities are the committed-but-unexecuted amounts a live offer
//! reserves on its maker: selling liabilities equal the remaining offer
//! amount, buying liabilities the implied buy rounded up. From protocol
//! version 10 every balance and limit computation is net of them, and
//! placing or consuming an offer releases and reacquires them around the
//! exchange.

use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, AccountEntryExtensionV1, AccountEntryExtensionV1Ext, AccountId,
    Asset, LedgerEntry, LedgerEntryData, LedgerHeader, Liabilities, OfferEntry, Price,
};

use meridian_common::math::{big_divide_saturating, Rounding};
use meridian_common::protocol::{protocol_version_starts_from, LIABILITIES_PROTOCOL_VERSION};
use meridian_state::keys::{account_key, asset_issuer, offer_key};
use meridian_state::{
    ConstEntryView, ConstTrustLineView, EntryView, HeaderView, LedgerState, Result, StateError,
    TrustLineView,
};

// =============================================================================
// Loaders
// =============================================================================

/// Loads an account entry for modification.
pub fn load_account(state: &LedgerState, account_id: &AccountId) -> Result<Option<EntryView>> {
    state.load(&account_key(account_id))
}

/// Loads an account entry read-only.
pub fn load_account_without_record(
    state: &LedgerState,
    account_id: &AccountId,
) -> Result<Option<ConstEntryView>> {
    state.load_without_record(&account_key(account_id))
}

/// Loads an offer entry for modification.
pub fn load_offer(
    state: &LedgerState,
    seller_id: &AccountId,
    offer_id: i64,
) -> Result<Option<EntryView>> {
    state.load(&offer_key(seller_id, offer_id))
}

/// Views the account variant of an entry.
pub fn as_account(entry: &LedgerEntry) -> Result<&AccountEntry> {
    match &entry.data {
        LedgerEntryData::Account(account) => Ok(account),
        _ => Err(StateError::InvariantViolated(
            "entry is not an account".into(),
        )),
    }
}

/// Views the offer variant of an entry.
pub fn as_offer(entry: &LedgerEntry) -> Result<&OfferEntry> {
    match &entry.data {
        LedgerEntryData::Offer(offer) => Ok(offer),
        _ => Err(StateError::InvariantViolated("entry is not an offer".into())),
    }
}

// =============================================================================
// Account balances and reserves
// =============================================================================

/// Reads the liabilities recorded on an account entry.
pub fn account_liabilities(account: &AccountEntry) -> Liabilities {
    match &account.ext {
        AccountEntryExt::V1(v1) => v1.liabilities.clone(),
        AccountEntryExt::V0 => Liabilities {
            buying: 0,
            selling: 0,
        },
    }
}

fn set_account_liabilities(account: &mut AccountEntry, liabilities: Liabilities) {
    match &mut account.ext {
        AccountEntryExt::V1(v1) => v1.liabilities = liabilities,
        AccountEntryExt::V0 => {
            account.ext = AccountEntryExt::V1(AccountEntryExtensionV1 {
                liabilities,
                ext: AccountEntryExtensionV1Ext::V0,
            });
        }
    }
}

/// Minimum balance an account must keep for its sub-entry count.
pub fn min_balance(header: &LedgerHeader, num_sub_entries: u32) -> i64 {
    (2 + num_sub_entries as i64) * header.base_reserve as i64
}

/// Balance above the reserve, net of selling liabilities from version 10.
/// May be negative for an under-reserved account.
pub fn available_balance(header: &LedgerHeader, account: &AccountEntry) -> i64 {
    let mut available = account.balance - min_balance(header, account.num_sub_entries);
    if protocol_version_starts_from(header.ledger_version, LIABILITIES_PROTOCOL_VERSION) {
        available -= account_liabilities(account).selling;
    }
    available
}

/// Native room left on an account, net of buying liabilities from version 10.
pub fn max_amount_receive(header: &LedgerHeader, account: &AccountEntry) -> i64 {
    if protocol_version_starts_from(header.ledger_version, LIABILITIES_PROTOCOL_VERSION) {
        i64::MAX - account.balance - account_liabilities(account).buying
    } else {
        i64::MAX
    }
}

/// Adds `delta` to an account's native balance.
///
/// From version 10 the balance is bounded below by selling liabilities and
/// above by `i64::MAX - buying liabilities`. Returns whether the new balance
/// fits.
pub fn add_balance(header: &HeaderView, account: &EntryView, delta: i64) -> Result<bool> {
    if delta == 0 {
        return Ok(true);
    }
    let version = header.ledger_version()?;
    account.modify(|raw| {
        let acc = match &mut raw.data {
            LedgerEntryData::Account(acc) => acc,
            _ => return false,
        };
        let (min, max) =
            if protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
                let liabilities = account_liabilities(acc);
                (liabilities.selling, i64::MAX - liabilities.buying)
            } else {
                (0, i64::MAX)
            };
        let new_balance = match acc.balance.checked_add(delta) {
            Some(b) => b,
            None => return false,
        };
        if new_balance < min || new_balance > max {
            return false;
        }
        acc.balance = new_balance;
        true
    })
}

/// Adjusts an account's sub-entry count by `count`.
///
/// Adding sub-entries requires the balance to cover the increased reserve
/// (net of selling liabilities from version 10); returns whether it does.
pub fn add_num_entries(header: &HeaderView, account: &EntryView, count: i32) -> Result<bool> {
    let header_data = header.current()?;
    account.modify(|raw| {
        let acc = match &mut raw.data {
            LedgerEntryData::Account(acc) => acc,
            _ => return Err(StateError::InvariantViolated("entry is not an account".into())),
        };
        let new_count = acc.num_sub_entries as i64 + count as i64;
        if new_count < 0 {
            return Err(StateError::InvariantViolated(
                "sub-entry count cannot go negative".into(),
            ));
        }
        let mut effective_min = min_balance(&header_data, new_count as u32);
        if protocol_version_starts_from(
            header_data.ledger_version,
            LIABILITIES_PROTOCOL_VERSION,
        ) {
            effective_min += account_liabilities(acc).selling;
        }
        // The reserve is only enforced when the count grows.
        if count > 0 && acc.balance < effective_min {
            return Ok(false);
        }
        acc.num_sub_entries = new_count as u32;
        Ok(true)
    })?
}

/// Adds `delta` to an account's buying liabilities; the new total must stay
/// within `[0, i64::MAX - balance]`.
pub fn add_account_buying_liabilities(
    header: &HeaderView,
    account: &EntryView,
    delta: i64,
) -> Result<bool> {
    check_liabilities_supported(header)?;
    account.modify(|raw| {
        let acc = match &mut raw.data {
            LedgerEntryData::Account(acc) => acc,
            _ => return false,
        };
        let mut liabilities = account_liabilities(acc);
        let new_buying = match liabilities.buying.checked_add(delta) {
            Some(v) => v,
            None => return false,
        };
        if new_buying < 0 || new_buying > i64::MAX - acc.balance {
            return false;
        }
        liabilities.buying = new_buying;
        set_account_liabilities(acc, liabilities);
        true
    })
}

/// Adds `delta` to an account's selling liabilities; the new total must stay
/// within `[0, balance - minimum balance]`.
pub fn add_account_selling_liabilities(
    header: &HeaderView,
    account: &EntryView,
    delta: i64,
) -> Result<bool> {
    check_liabilities_supported(header)?;
    let header_data = header.current()?;
    account.modify(|raw| {
        let acc = match &mut raw.data {
            LedgerEntryData::Account(acc) => acc,
            _ => return false,
        };
        let mut liabilities = account_liabilities(acc);
        let new_selling = match liabilities.selling.checked_add(delta) {
            Some(v) => v,
            None => return false,
        };
        let max_liabilities = acc.balance - min_balance(&header_data, acc.num_sub_entries);
        if new_selling < 0 || new_selling > max_liabilities {
            return false;
        }
        liabilities.selling = new_selling;
        set_account_liabilities(acc, liabilities);
        true
    })
}

fn check_liabilities_supported(header: &HeaderView) -> Result<()> {
    let version = header.ledger_version()?;
    if !protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
        return Err(StateError::InvariantViolated(
            "liabilities do not exist before version 10".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Capacity: how much can an account trade
// =============================================================================

/// Read-only surface shared by the mutable and const trust-line views.
pub trait TrustLineReader {
    fn is_authorized(&self) -> Result<bool>;
    fn available_balance(&self, header: &HeaderView) -> Result<i64>;
    fn max_amount_receive(&self, header: &HeaderView) -> Result<i64>;
}

impl TrustLineReader for TrustLineView {
    fn is_authorized(&self) -> Result<bool> {
        TrustLineView::is_authorized(self)
    }
    fn available_balance(&self, header: &HeaderView) -> Result<i64> {
        TrustLineView::available_balance(self, header)
    }
    fn max_amount_receive(&self, header: &HeaderView) -> Result<i64> {
        TrustLineView::max_amount_receive(self, header)
    }
}

impl TrustLineReader for ConstTrustLineView {
    fn is_authorized(&self) -> Result<bool> {
        ConstTrustLineView::is_authorized(self)
    }
    fn available_balance(&self, header: &HeaderView) -> Result<i64> {
        ConstTrustLineView::available_balance(self, header)
    }
    fn max_amount_receive(&self, header: &HeaderView) -> Result<i64> {
        ConstTrustLineView::max_amount_receive(self, header)
    }
}

/// How much of `asset` the account can sell: native available balance above
/// the reserve, or the authorized trust line's available balance.
pub fn can_sell_at_most<T: TrustLineReader>(
    header: &HeaderView,
    account: &AccountEntry,
    asset: &Asset,
    trust_line: Option<&T>,
) -> Result<i64> {
    if matches!(asset, Asset::Native) {
        let header_data = header.current()?;
        return Ok(available_balance(&header_data, account).max(0));
    }
    match trust_line {
        Some(line) if line.is_authorized()? => line.available_balance(header),
        _ => Ok(0),
    }
}

/// How much of `asset` the account can receive: native headroom, or the
/// trust line's room under its limit.
pub fn can_buy_at_most<T: TrustLineReader>(
    header: &HeaderView,
    account: &AccountEntry,
    asset: &Asset,
    trust_line: Option<&T>,
) -> Result<i64> {
    if matches!(asset, Asset::Native) {
        let header_data = header.current()?;
        return Ok(max_amount_receive(&header_data, account).max(0));
    }
    match trust_line {
        Some(line) => Ok(line.max_amount_receive(header)?.max(0)),
        None => Ok(0),
    }
}

// =============================================================================
// Offer liabilities and the adjuster
// =============================================================================

/// Selling liabilities of an offer: its remaining amount.
pub fn offer_selling_liabilities(offer: &OfferEntry) -> i64 {
    offer.amount
}

/// Buying liabilities of an offer: the implied buy `amount * n / d`, rounded
/// up and saturating to `i64::MAX` on overflow.
pub fn offer_buying_liabilities(offer: &OfferEntry) -> Result<i64> {
    Ok(big_divide_saturating(
        offer.amount,
        offer.price.n as i64,
        offer.price.d as i64,
        Rounding::Up,
    )?)
}

/// Shrinks an offer amount to respect both caps: the result is the largest
/// `amount <= max_sell` whose implied buy (rounded up) is `<= max_buy`.
/// Monotonic in every argument and idempotent.
pub fn adjust_offer(price: &Price, max_sell: i64, max_buy: i64) -> Result<i64> {
    if max_sell <= 0 || max_buy <= 0 {
        return Ok(0);
    }
    // ceil(a * n / d) <= max_buy  <=>  a <= floor(max_buy * d / n)
    let cap = big_divide_saturating(max_buy, price.d as i64, price.n as i64, Rounding::Down)?;
    Ok(max_sell.min(cap))
}

// =============================================================================
// Releasing and reacquiring offer liabilities (version 10 on)
// =============================================================================

/// Reserves `offer`'s liabilities on its maker's account and trust lines.
///
/// The maker's handles must not be live; both sides are loaded transiently.
/// Failure to fit is a broken invariant: callers establish capacity first.
pub fn acquire_liabilities(
    state: &LedgerState,
    header: &HeaderView,
    offer: &OfferEntry,
) -> Result<()> {
    apply_liabilities(state, header, offer, 1)
}

/// Releases `offer`'s liabilities from its maker, making the reserved
/// balance spendable for the duration of an exchange or a modify.
pub fn release_liabilities(
    state: &LedgerState,
    header: &HeaderView,
    offer: &OfferEntry,
) -> Result<()> {
    apply_liabilities(state, header, offer, -1)
}

fn apply_liabilities(
    state: &LedgerState,
    header: &HeaderView,
    offer: &OfferEntry,
    sign: i64,
) -> Result<()> {
    let buying_delta = sign * offer_buying_liabilities(offer)?;
    let selling_delta = sign * offer_selling_liabilities(offer);
    let seller = &offer.seller_id;

    if matches!(offer.buying, Asset::Native) {
        let account = load_account(state, seller)?
            .ok_or_else(|| StateError::InvariantViolated("offer maker missing".into()))?;
        if !add_account_buying_liabilities(header, &account, buying_delta)? {
            return Err(StateError::InvariantViolated(
                "could not change buying liabilities".into(),
            ));
        }
    } else if asset_issuer(&offer.buying) != Some(seller) {
        let line = TrustLineView::load(state, seller, &offer.buying)?
            .ok_or_else(|| StateError::InvariantViolated("maker trust line missing".into()))?;
        if !line.add_buying_liabilities(header, buying_delta)? {
            return Err(StateError::InvariantViolated(
                "could not change buying liabilities".into(),
            ));
        }
    }

    if matches!(offer.selling, Asset::Native) {
        let account = load_account(state, seller)?
            .ok_or_else(|| StateError::InvariantViolated("offer maker missing".into()))?;
        if !add_account_selling_liabilities(header, &account, selling_delta)? {
            return Err(StateError::InvariantViolated(
                "could not change selling liabilities".into(),
            ));
        }
    } else if asset_issuer(&offer.selling) != Some(seller) {
        let line = TrustLineView::load(state, seller, &offer.selling)?
            .ok_or_else(|| StateError::InvariantViolated("maker trust line missing".into()))?;
        if !line.add_selling_liabilities(header, selling_delta)? {
            return Err(StateError::InvariantViolated(
                "could not change selling liabilities".into(),
            ));
        }
    }

    Ok(())
}

// =============================================================================
// Misc
// =============================================================================

/// Mints the next offer id from the header's id generator.
pub fn generate_offer_id(header: &HeaderView) -> Result<i64> {
    header.modify(|h| {
        h.id_pool += 1;
        h.id_pool as i64
    })
}

/// Caps sheep spendable by the implied wheat limit for pre-10 ledgers:
/// `max_wheat_receive * d / n`, treating overflow as unbounded.
pub fn sheep_limit_from_wheat(max_wheat_receive: i64, price: &Price) -> Result<i64> {
    Ok(big_divide_saturating(
        max_wheat_receive,
        price.d as i64,
        price.n as i64,
        Rounding::Down,
    )?)
}
