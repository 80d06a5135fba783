//! The offer-exchange kernel.
//!
//! Converts a taker's sheep into wheat by walking the best-offer stream of a
//! ledger-state view: each candidate counter-offer (selling wheat, buying
//! sheep) passes through a caller-supplied filter, is crossed with exact
//! rational arithmetic, and is then either erased (fully filled) or written
//! back with its reduced amount. The maker's liabilities are released before
//! the cross and reacquired on the residual.
//!
//! All quantities are computed in 128-bit intermediates with explicit
//! rounding; prices never pass through floating point.

use std::collections::BTreeSet;

use stellar_xdr::curr::{Asset, ClaimOfferAtom, LedgerEntryData, OfferEntry, Price};

use meridian_common::protocol::{protocol_version_starts_from, LIABILITIES_PROTOCOL_VERSION};
use meridian_state::keys::entry_key;
use meridian_state::{HeaderView, LedgerState, Result, StateError, TrustLineView};

use crate::util::{
    acquire_liabilities, add_balance, add_num_entries, adjust_offer, as_account, load_account,
    load_offer, release_liabilities, can_buy_at_most, can_sell_at_most,
};

/// Verdict of the filter callback on one candidate counter-offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferFilterResult {
    /// Cross this offer.
    Keep,
    /// Leave this offer alone and move to the next one.
    Skip,
    /// Stop the exchange entirely.
    Stop,
}

/// Terminal status of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertResult {
    /// A taker limit was exhausted.
    Ok,
    /// The book ran out (or stopped yielding) before a limit was reached.
    Partial,
    /// The filter stopped the exchange.
    FilterStop,
}

/// What a conversion did: exact amounts moved, one claim atom per taken
/// counter-offer in taking order, and the terminal status.
#[derive(Debug)]
pub struct ExchangeOutcome {
    pub sheep_sent: i64,
    pub wheat_received: i64,
    pub offer_trail: Vec<ClaimOfferAtom>,
    pub status: ConvertResult,
}

/// Crossed quantities for one counter-offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CrossResult {
    wheat_received: i64,
    sheep_sent: i64,
    wheat_stays: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExchangeQuantities {
    pub wheat_received: i64,
    pub sheep_sent: i64,
    pub wheat_stays: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeError {
    InvalidPrice,
    InvalidAmount,
    Overflow,
    PriceError,
}

pub(crate) fn map_exchange_error(e: ExchangeError) -> StateError {
    match e {
        ExchangeError::Overflow => StateError::Overflow,
        ExchangeError::InvalidPrice => {
            StateError::InvariantViolated("exchange saw an invalid price".into())
        }
        ExchangeError::InvalidAmount => {
            StateError::InvariantViolated("exchange produced an out-of-bounds amount".into())
        }
        ExchangeError::PriceError => {
            StateError::InvariantViolated("exchange violated the price error bound".into())
        }
    }
}

/// Compares two prices as exact rationals.
pub fn compare_price(lhs: &Price, rhs: &Price) -> std::cmp::Ordering {
    let lhs_value = i128::from(lhs.n) * i128::from(rhs.d);
    let rhs_value = i128::from(rhs.n) * i128::from(lhs.d);
    lhs_value.cmp(&rhs_value)
}

#[derive(Clone, Copy)]
enum Round {
    Down,
    Up,
}

fn wide_div(n: i128, d: i128, round: Round) -> std::result::Result<i64, ExchangeError> {
    if d <= 0 {
        return Err(ExchangeError::InvalidPrice);
    }
    let value = match round {
        Round::Down => n / d,
        Round::Up => {
            if n == 0 {
                0
            } else {
                (n + d - 1) / d
            }
        }
    };
    if value > i64::MAX as i128 {
        return Err(ExchangeError::Overflow);
    }
    Ok(value as i64)
}

/// The smaller of what the sender can give and what the receiver can take,
/// valued in units of `price_n`.
fn offer_value(price_n: i32, price_d: i32, max_send: i64, max_receive: i64) -> i128 {
    let send_value = i128::from(max_send) * i128::from(price_n);
    let receive_value = i128::from(max_receive) * i128::from(price_d);
    send_value.min(receive_value)
}

/// Rejects exchanges whose effective price strays more than 1% from the
/// offer's price due to rounding.
fn check_price_error_bound(
    price: &Price,
    wheat_receive: i64,
    sheep_send: i64,
) -> std::result::Result<(), ExchangeError> {
    let err_n = 100i64
        .checked_mul(price.n as i64)
        .ok_or(ExchangeError::Overflow)?;
    let err_d = 100i64
        .checked_mul(price.d as i64)
        .ok_or(ExchangeError::Overflow)?;

    let lhs = i128::from(wheat_receive) * i128::from(err_n);
    let rhs = i128::from(sheep_send) * i128::from(err_d);

    let abs_diff = if lhs > rhs { lhs - rhs } else { rhs - lhs };
    let cap = i128::from(wheat_receive) * i128::from(price.n);
    if abs_diff <= cap {
        Ok(())
    } else {
        Err(ExchangeError::PriceError)
    }
}

/// Core crossing arithmetic.
///
/// `price` is the counter-offer's price (wheat valued in sheep). The wheat
/// side gives at most `max_wheat_send` and takes at most `max_sheep_receive`;
/// the sheep side symmetric. `wheat_stays` reports which side was the
/// limiting one: `true` means the counter-offer survives the cross.
pub(crate) fn exchange_v10_without_price_error_thresholds(
    price: &Price,
    max_wheat_send: i64,
    max_wheat_receive: i64,
    max_sheep_send: i64,
    max_sheep_receive: i64,
) -> std::result::Result<ExchangeQuantities, ExchangeError> {
    if price.n <= 0 || price.d <= 0 {
        return Err(ExchangeError::InvalidPrice);
    }

    let wheat_value = offer_value(price.n, price.d, max_wheat_send, max_sheep_receive);
    let sheep_value = offer_value(price.d, price.n, max_sheep_send, max_wheat_receive);
    let wheat_stays = wheat_value > sheep_value;

    let (wheat_receive, sheep_send) = if wheat_stays {
        if price.n > price.d {
            let wheat_receive = wide_div(sheep_value, price.n as i128, Round::Down)?;
            let sheep_send = wide_div(
                i128::from(wheat_receive) * i128::from(price.n),
                price.d as i128,
                Round::Up,
            )?;
            (wheat_receive, sheep_send)
        } else {
            let sheep_send = wide_div(sheep_value, price.d as i128, Round::Down)?;
            let wheat_receive = wide_div(
                i128::from(sheep_send) * i128::from(price.d),
                price.n as i128,
                Round::Down,
            )?;
            (wheat_receive, sheep_send)
        }
    } else if price.n > price.d {
        let wheat_receive = wide_div(wheat_value, price.n as i128, Round::Down)?;
        let sheep_send = wide_div(
            i128::from(wheat_receive) * i128::from(price.n),
            price.d as i128,
            Round::Down,
        )?;
        (wheat_receive, sheep_send)
    } else {
        let sheep_send = wide_div(wheat_value, price.d as i128, Round::Down)?;
        let wheat_receive = wide_div(
            i128::from(sheep_send) * i128::from(price.d),
            price.n as i128,
            Round::Up,
        )?;
        (wheat_receive, sheep_send)
    };

    if wheat_receive < 0
        || wheat_receive > max_wheat_receive.min(max_wheat_send)
        || sheep_send < 0
        || sheep_send > max_sheep_receive.min(max_sheep_send)
    {
        return Err(ExchangeError::InvalidAmount);
    }

    Ok(ExchangeQuantities {
        wheat_received: wheat_receive,
        sheep_sent: sheep_send,
        wheat_stays,
    })
}

/// [`exchange_v10_without_price_error_thresholds`] plus the rounding-quality
/// gate: an exchange whose rounded amounts disagree with the price by more
/// than the error bound is zeroed out instead of executed.
pub(crate) fn exchange_v10(
    price: &Price,
    max_wheat_send: i64,
    max_wheat_receive: i64,
    max_sheep_send: i64,
    max_sheep_receive: i64,
) -> std::result::Result<ExchangeQuantities, ExchangeError> {
    let mut res = exchange_v10_without_price_error_thresholds(
        price,
        max_wheat_send,
        max_wheat_receive,
        max_sheep_send,
        max_sheep_receive,
    )?;

    if res.wheat_received > 0 && res.sheep_sent > 0 {
        let wheat_value = i128::from(res.wheat_received) * i128::from(price.n);
        let sheep_value = i128::from(res.sheep_sent) * i128::from(price.d);
        if res.wheat_stays && sheep_value < wheat_value {
            return Err(ExchangeError::InvalidAmount);
        }
        if !res.wheat_stays && sheep_value > wheat_value {
            return Err(ExchangeError::InvalidAmount);
        }
        if check_price_error_bound(price, res.wheat_received, res.sheep_sent).is_err() {
            res.wheat_received = 0;
            res.sheep_sent = 0;
        }
    } else {
        res.wheat_received = 0;
        res.sheep_sent = 0;
    }

    Ok(res)
}

/// Converts up to `max_sheep_send` of `sheep` into at most
/// `max_wheat_receive` of `wheat` against the view's best-offer stream.
///
/// Candidate counter-offers reach `filter` in `(price ASC, offerID ASC)`
/// order; `Skip` excludes one candidate, `Stop` ends the exchange with
/// [`ConvertResult::FilterStop`]. Every mutation happens inside `state`, so
/// the caller can roll the whole conversion back by discarding the view.
pub fn convert_with_offers<F>(
    state: &LedgerState,
    header: &HeaderView,
    sheep: &Asset,
    max_sheep_send: i64,
    wheat: &Asset,
    max_wheat_receive: i64,
    mut filter: F,
) -> Result<ExchangeOutcome>
where
    F: FnMut(&OfferEntry) -> OfferFilterResult,
{
    let mut outcome = ExchangeOutcome {
        sheep_sent: 0,
        wheat_received: 0,
        offer_trail: Vec::new(),
        status: ConvertResult::Ok,
    };

    let mut max_sheep_send = max_sheep_send;
    let mut max_wheat_receive = max_wheat_receive;
    let mut skipped: BTreeSet<stellar_xdr::curr::LedgerKey> = BTreeSet::new();
    let mut need_more = max_sheep_send > 0 && max_wheat_receive > 0;

    while need_more {
        // Counter-offers sell wheat and buy sheep.
        let candidate = state.best_offer(sheep, wheat, skipped.clone())?;
        let Some(candidate) = candidate else {
            break;
        };
        let offer = match &candidate.data {
            LedgerEntryData::Offer(offer) => offer.clone(),
            _ => {
                return Err(StateError::InvariantViolated(
                    "best offer is not an offer".into(),
                ))
            }
        };

        match filter(&offer) {
            OfferFilterResult::Keep => {}
            OfferFilterResult::Skip => {
                skipped.insert(entry_key(&candidate)?);
                continue;
            }
            OfferFilterResult::Stop => {
                outcome.status = ConvertResult::FilterStop;
                return Ok(outcome);
            }
        }

        let cross = cross_offer_v10(
            state,
            header,
            &offer,
            max_wheat_receive,
            max_sheep_send,
            &mut outcome.offer_trail,
        )?;

        outcome.sheep_sent += cross.sheep_sent;
        outcome.wheat_received += cross.wheat_received;
        max_sheep_send -= cross.sheep_sent;
        max_wheat_receive -= cross.wheat_received;

        need_more = max_wheat_receive > 0 && max_sheep_send > 0;
        if !need_more {
            outcome.status = ConvertResult::Ok;
            return Ok(outcome);
        }
        if cross.wheat_stays {
            outcome.status = ConvertResult::Partial;
            return Ok(outcome);
        }
    }

    outcome.status = if need_more {
        ConvertResult::Partial
    } else {
        ConvertResult::Ok
    };
    Ok(outcome)
}

/// Crosses one counter-offer.
///
/// Releases the maker's liabilities so its full balance backs the trade,
/// caps the crossable amount by the maker's real capacity, runs the exact
/// exchange, moves both balances, and then erases the offer (crediting the
/// maker's sub-entry count) or writes back the reduced amount and reacquires
/// liabilities on it. Appends one claim atom.
fn cross_offer_v10(
    state: &LedgerState,
    header: &HeaderView,
    offer: &OfferEntry,
    max_wheat_receive: i64,
    max_sheep_send: i64,
    offer_trail: &mut Vec<ClaimOfferAtom>,
) -> Result<CrossResult> {
    let wheat = offer.selling.clone();
    let sheep = offer.buying.clone();
    let seller = offer.seller_id.clone();

    let liabilities_active = protocol_version_starts_from(
        header.ledger_version()?,
        LIABILITIES_PROTOCOL_VERSION,
    );
    if liabilities_active {
        release_liabilities(state, header, offer)?;
    }

    let (max_wheat_send, max_sheep_receive) = seller_capacity(state, header, offer)?;
    let adjusted_amount = adjust_offer(&offer.price, max_wheat_send, max_sheep_receive)?;

    let exchange = exchange_v10(
        &offer.price,
        adjusted_amount,
        max_wheat_receive,
        max_sheep_send,
        max_sheep_receive,
    )
    .map_err(map_exchange_error)?;

    if exchange.sheep_sent != 0 {
        transfer(state, header, &seller, &sheep, exchange.sheep_sent)?;
    }
    if exchange.wheat_received != 0 {
        transfer(state, header, &seller, &wheat, -exchange.wheat_received)?;
    }

    let mut new_amount = if exchange.wheat_stays {
        adjusted_amount - exchange.wheat_received
    } else {
        0
    };
    if new_amount > 0 {
        // Balances moved; shrink the residual to what still fits.
        let (can_send, can_receive) = seller_capacity(state, header, offer)?;
        new_amount = adjust_offer(&offer.price, new_amount.min(can_send), can_receive)?;
    }

    let offer_view = load_offer(state, &seller, offer.offer_id)?.ok_or_else(|| {
        StateError::InvariantViolated("crossed offer disappeared from the view".into())
    })?;
    if new_amount == 0 {
        offer_view.erase()?;
        let account = load_account(state, &seller)?
            .ok_or_else(|| StateError::InvariantViolated("offer maker missing".into()))?;
        add_num_entries(header, &account, -1)?;
    } else {
        offer_view.modify(|raw| {
            if let LedgerEntryData::Offer(o) = &mut raw.data {
                o.amount = new_amount;
            }
        })?;
        drop(offer_view);
        if liabilities_active {
            let residual = OfferEntry {
                amount: new_amount,
                ..offer.clone()
            };
            acquire_liabilities(state, header, &residual)?;
        }
    }

    offer_trail.push(ClaimOfferAtom {
        seller_id: seller,
        offer_id: offer.offer_id,
        asset_sold: wheat,
        amount_sold: exchange.wheat_received,
        asset_bought: sheep,
        amount_bought: exchange.sheep_sent,
    });

    Ok(CrossResult {
        wheat_received: exchange.wheat_received,
        sheep_sent: exchange.sheep_sent,
        wheat_stays: exchange.wheat_stays,
    })
}

/// How much wheat the maker can still send and how much sheep it can still
/// receive, capped by the offer's remaining amount.
fn seller_capacity(
    state: &LedgerState,
    header: &HeaderView,
    offer: &OfferEntry,
) -> Result<(i64, i64)> {
    let account = load_account(state, &offer.seller_id)?
        .ok_or_else(|| StateError::InvariantViolated("offer maker missing".into()))?;
    let account_entry = account.current()?;
    let acc = as_account(&account_entry)?;

    let wheat_line = if matches!(offer.selling, Asset::Native) {
        None
    } else {
        TrustLineView::load(state, &offer.seller_id, &offer.selling)?
    };
    let sheep_line = if matches!(offer.buying, Asset::Native) {
        None
    } else {
        TrustLineView::load(state, &offer.seller_id, &offer.buying)?
    };

    let max_wheat_send = offer
        .amount
        .min(can_sell_at_most(header, acc, &offer.selling, wheat_line.as_ref())?);
    let max_sheep_receive = can_buy_at_most(header, acc, &offer.buying, sheep_line.as_ref())?;
    Ok((max_wheat_send, max_sheep_receive))
}

/// Moves `delta` of `asset` on the maker's side of a cross.
fn transfer(
    state: &LedgerState,
    header: &HeaderView,
    account_id: &stellar_xdr::curr::AccountId,
    asset: &Asset,
    delta: i64,
) -> Result<()> {
    if matches!(asset, Asset::Native) {
        let account = load_account(state, account_id)?
            .ok_or_else(|| StateError::InvariantViolated("offer maker missing".into()))?;
        if !add_balance(header, &account, delta)? {
            return Err(StateError::InvariantViolated(
                "exchange moved a balance out of bounds".into(),
            ));
        }
        return Ok(());
    }
    let line = TrustLineView::load(state, account_id, asset)?
        .ok_or_else(|| StateError::InvariantViolated("maker trust line missing".into()))?;
    if !line.add_balance(header, delta)? {
        return Err(StateError::InvariantViolated(
            "exchange moved a balance out of bounds".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests_support {
    use stellar_xdr::curr::{
        Hash, LedgerHeader, LedgerHeaderExt, StellarValue, StellarValueExt, TimePoint, VecM,
    };

    pub fn test_header(ledger_version: u32, base_reserve: u32) -> LedgerHeader {
        LedgerHeader {
            ledger_version,
            previous_ledger_hash: Hash([0; 32]),
            scp_value: StellarValue {
                tx_set_hash: Hash([0; 32]),
                close_time: TimePoint(0),
                upgrades: VecM::default(),
                ext: StellarValueExt::Basic,
            },
            tx_set_result_hash: Hash([0; 32]),
            bucket_list_hash: Hash([0; 32]),
            ledger_seq: 1,
            total_coins: 0,
            fee_pool: 0,
            inflation_seq: 0,
            id_pool: 0,
            base_fee: 100,
            base_reserve,
            max_tx_set_size: 100,
            skip_list: [Hash([0; 32]), Hash([0; 32]), Hash([0; 32]), Hash([0; 32])],
            ext: LedgerHeaderExt::V0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(n: i32, d: i32) -> Price {
        Price { n, d }
    }

    #[test]
    fn test_exchange_one_to_one() {
        let res = exchange_v10(&price(1, 1), 100, 100, 100, 100).unwrap();
        assert_eq!(res.wheat_received, 100);
        assert_eq!(res.sheep_sent, 100);
        assert!(!res.wheat_stays);
    }

    #[test]
    fn test_exchange_two_to_one() {
        // Wheat is twice as dear as sheep; taking 50 wheat costs 100 sheep.
        let res = exchange_v10(&price(2, 1), 100, 50, 100, 100).unwrap();
        assert_eq!(res.wheat_received, 50);
        assert_eq!(res.sheep_sent, 100);
    }

    #[test]
    fn test_exchange_invalid_price() {
        assert_eq!(
            exchange_v10(&price(0, 1), 100, 100, 100, 100),
            Err(ExchangeError::InvalidPrice)
        );
        assert_eq!(
            exchange_v10(&price(1, 0), 100, 100, 100, 100),
            Err(ExchangeError::InvalidPrice)
        );
    }

    #[test]
    fn test_exchange_wheat_stays_when_sheep_limited() {
        let res = exchange_v10(&price(1, 1), 1000, 100, 50, 100).unwrap();
        assert!(res.wheat_stays);
        assert!(res.sheep_sent <= 50);
    }

    #[test]
    fn test_exchange_zero_limits() {
        let res = exchange_v10(&price(1, 1), 0, 0, 0, 0).unwrap();
        assert_eq!(res.wheat_received, 0);
        assert_eq!(res.sheep_sent, 0);
    }

    #[test]
    fn test_exchange_round_trip_bound() {
        // Property: sheep_sent * n stays within one rounding step of
        // wheat_received * d at the offer's price.
        for (n, d) in [(1, 1), (2, 3), (7, 5), (10, 1), (1, 10)] {
            let res = exchange_v10(&price(n, d), 1000, 1000, 1000, 1000).unwrap();
            if res.wheat_received == 0 {
                continue;
            }
            let lhs = i128::from(res.wheat_received) * i128::from(n);
            let rhs = i128::from(res.sheep_sent) * i128::from(d);
            let diff = (lhs - rhs).abs();
            assert!(diff <= i128::from(n.max(d)));
        }
    }

    #[test]
    fn test_exchange_large_amounts() {
        let large = 1_000_000_000_000i64;
        let res = exchange_v10(&price(1, 1), large, large, large, large).unwrap();
        assert_eq!(res.wheat_received, large);
        assert_eq!(res.sheep_sent, large);
    }

    #[test]
    fn test_exchange_fractional_price() {
        let res = exchange_v10(&price(3, 7), 100, 100, 100, 100).unwrap();
        assert!(res.wheat_received > 0);
        assert!(res.sheep_sent > 0);
        // At 3/7, sheep are cheaper per wheat: we pay fewer sheep than wheat.
        assert!(res.sheep_sent <= res.wheat_received);
    }

    #[test]
    fn test_compare_price_exact() {
        use std::cmp::Ordering;
        assert_eq!(compare_price(&price(1, 2), &price(2, 4)), Ordering::Equal);
        assert_eq!(compare_price(&price(1, 3), &price(1, 2)), Ordering::Less);
        assert_eq!(
            compare_price(
                &price(1, 3),
                &price(333_333_333, 1_000_000_000)
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn test_wide_div_rounding() {
        assert_eq!(wide_div(10, 3, Round::Down).unwrap(), 3);
        assert_eq!(wide_div(10, 3, Round::Up).unwrap(), 4);
        assert_eq!(wide_div(0, 3, Round::Up).unwrap(), 0);
        assert!(wide_div(10, 0, Round::Down).is_err());
    }
}
