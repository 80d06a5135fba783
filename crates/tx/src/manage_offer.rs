//! The ManageOffer driver: end-to-end create / modify / delete of a maker
//! offer.
//!
//! Selling sheep for wheat means checking the counter-offers that sell wheat
//! for sheep. The driver validates the request, checks trust and issuers,
//! releases the old offer's liabilities on a modify, sizes the exchange from
//! the maker's real capacity, runs the crossing kernel with the
//! self-cross/passive filter, applies the fills, shrinks the residual to
//! what reserves and limits still allow, and finally installs the surviving
//! offer or reports it deleted. Everything happens in one child view that is
//! committed on success; on any failed outcome the child is dropped and
//! every mutation rolls back.

use stellar_xdr::curr::{
    AccountId, Asset, ClaimOfferAtom, LedgerEntry, LedgerEntryData, LedgerEntryExt, OfferEntry,
    OfferEntryExt, OfferEntryFlags, Price,
};
use tracing::debug;

use meridian_common::protocol::{
    protocol_version_starts_from, FORBID_CREATE_WITH_ZERO_PROTOCOL_VERSION,
    LIABILITIES_PROTOCOL_VERSION, RESERVE_BEFORE_NATIVE_SELL_PROTOCOL_VERSION,
};
use meridian_state::keys::asset_issuer;
use meridian_state::{
    ConstTrustLineView, HeaderView, LedgerState, Result, StateError, TrustLineView,
};

use crate::exchange::{compare_price, convert_with_offers, ConvertResult, OfferFilterResult};
use crate::util::{
    add_balance, add_num_entries, adjust_offer, as_account, as_offer, can_buy_at_most,
    can_sell_at_most, generate_offer_id, load_account, load_account_without_record, load_offer,
    max_amount_receive, available_balance, offer_buying_liabilities, offer_selling_liabilities,
    release_liabilities, acquire_liabilities, sheep_limit_from_wheat,
};

/// A create / modify / delete request for a maker offer.
///
/// `offer_id == 0` creates; a non-zero id modifies (or, with `amount == 0`,
/// deletes) the existing offer. `passive` only applies to creates; a
/// modified offer keeps the passivity it was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManageOfferOp {
    pub source: AccountId,
    pub selling: Asset,
    pub buying: Asset,
    pub amount: i64,
    pub price: Price,
    pub offer_id: i64,
    pub passive: bool,
}

/// What happened to the maker's offer on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferEffect {
    Created(OfferEntry),
    Updated(OfferEntry),
    Deleted,
}

/// Successful outcome: the offers taken along the way, in taking order, and
/// the final disposition of the maker's own offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManageOfferSuccess {
    pub offers_claimed: Vec<ClaimOfferAtom>,
    pub offer: OfferEffect,
}

/// Result codes of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageOfferResult {
    Success(ManageOfferSuccess),
    Malformed,
    SellNoTrust,
    SellNoIssuer,
    SellNotAuthorized,
    Underfunded,
    BuyNoTrust,
    BuyNoIssuer,
    BuyNotAuthorized,
    LineFull,
    LowReserve,
    CrossSelf,
    NotFound,
}

/// Applies a ManageOffer request on a child of `state_outer`.
///
/// Returns `Ok(code)` for every operation-level outcome; only store failures
/// and broken invariants surface as `Err`. No mutation survives a non-success
/// code.
pub fn apply_manage_offer(
    state_outer: &LedgerState,
    op: &ManageOfferOp,
) -> Result<ManageOfferResult> {
    let outer_version = state_outer.header().ledger_version;

    // Structural validity first; nothing is loaded yet.
    if op.selling == op.buying {
        return Ok(ManageOfferResult::Malformed);
    }
    if op.amount < 0 || op.price.n <= 0 || op.price.d <= 0 {
        return Ok(ManageOfferResult::Malformed);
    }
    if protocol_version_starts_from(outer_version, FORBID_CREATE_WITH_ZERO_PROTOCOL_VERSION)
        && op.offer_id == 0
        && op.amount == 0
    {
        return Ok(ManageOfferResult::NotFound);
    }

    let ls = state_outer.begin_child(true)?;

    if let Some(code) = check_offer_valid(&ls, op)? {
        return Ok(code);
    }

    let creating = op.offer_id == 0;
    let mut new_offer = OfferEntry {
        seller_id: op.source.clone(),
        offer_id: op.offer_id,
        selling: op.selling.clone(),
        buying: op.buying.clone(),
        amount: op.amount,
        price: op.price.clone(),
        flags: 0,
        ext: OfferEntryExt::V0,
    };
    let mut passive = op.passive;

    if !creating {
        let header = ls.load_header()?;
        let existing = match load_offer(&ls, &op.source, op.offer_id)? {
            Some(existing) => existing,
            None => return Ok(ManageOfferResult::NotFound),
        };
        let old_entry = existing.current()?;
        let old_offer = as_offer(&old_entry)?.clone();

        // The new offer keeps the old flags; passivity is not re-chosen.
        new_offer.flags = old_offer.flags;
        passive = old_offer.flags & (OfferEntryFlags::PassiveFlag as u32) != 0;

        // Release the old liabilities so the balance they reserved can back
        // the exchange. Both assets may have changed, even swapped sides.
        if protocol_version_starts_from(header.ledger_version()?, LIABILITIES_PROTOCOL_VERSION) {
            release_liabilities(&ls, &header, &old_offer)?;
        }

        // The old entry goes away, but the maker's sub-entry count is not
        // decremented yet; it is settled when the final disposition is known.
        existing.erase()?;
    } else if passive {
        new_offer.flags |= OfferEntryFlags::PassiveFlag as u32;
    }

    let mut offers_claimed: Vec<ClaimOfferAtom> = Vec::new();

    if op.amount > 0 {
        let max_wheat_price = Price {
            n: op.price.d,
            d: op.price.n,
        };

        let (max_sheep_send, max_wheat_receive) =
            match compute_offer_exchange_parameters(&ls, op, &new_offer, creating)? {
                Ok(limits) => limits,
                Err(code) => return Ok(code),
            };
        if max_wheat_receive == 0 {
            return Ok(ManageOfferResult::LineFull);
        }

        let header = ls.load_header()?;
        let version = header.ledger_version()?;

        let mut crossed_self = false;
        let outcome = convert_with_offers(
            &ls,
            &header,
            &op.selling,
            max_sheep_send,
            &op.buying,
            max_wheat_receive,
            |counter: &OfferEntry| {
                // Offers arrive cheapest-first: one too dear ends the scan.
                // A passive maker refuses to cross at its own price.
                let price_cmp = compare_price(&counter.price, &max_wheat_price);
                if (passive && price_cmp != std::cmp::Ordering::Less)
                    || price_cmp == std::cmp::Ordering::Greater
                {
                    return OfferFilterResult::Stop;
                }
                if counter.seller_id == op.source {
                    crossed_self = true;
                    return OfferFilterResult::Stop;
                }
                OfferFilterResult::Keep
            },
        )?;

        let sheep_stays = match outcome.status {
            ConvertResult::Ok => false,
            ConvertResult::Partial => true,
            ConvertResult::FilterStop => {
                if crossed_self {
                    return Ok(ManageOfferResult::CrossSelf);
                }
                true
            }
        };
        offers_claimed = outcome.offer_trail;

        if outcome.wheat_received > 0 {
            // The exchange never crosses the maker's own offers, so loading
            // fresh handles here cannot conflict with anything it left live.
            credit_taker(&ls, &header, op, &op.buying, outcome.wheat_received)?;
            credit_taker(&ls, &header, op, &op.selling, -outcome.sheep_sent)?;
        }

        new_offer.amount = max_sheep_send - outcome.sheep_sent;
        if protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
            if sheep_stays {
                new_offer.amount = adjust_residual(&ls, &header, op, new_offer.amount)?;
            } else {
                new_offer.amount = 0;
            }
        }
    } else {
        new_offer.amount = 0;
    }

    let header = ls.load_header()?;
    let effect = if new_offer.amount > 0 {
        if creating {
            {
                let account = load_account(&ls, &op.source)?.ok_or_else(|| {
                    StateError::InvariantViolated("source account missing".into())
                })?;
                // The reserve should already be covered at this point on
                // version 9 and later, but the store is the judge.
                if !add_num_entries(&header, &account, 1)? {
                    return Ok(ManageOfferResult::LowReserve);
                }
            }
            new_offer.offer_id = generate_offer_id(&header)?;
        }

        let entry = LedgerEntry {
            last_modified_ledger_seq: 0,
            data: LedgerEntryData::Offer(new_offer.clone()),
            ext: LedgerEntryExt::V0,
        };
        drop(ls.create(entry)?);

        if protocol_version_starts_from(header.ledger_version()?, LIABILITIES_PROTOCOL_VERSION) {
            acquire_liabilities(&ls, &header, &new_offer)?;
        }

        if creating {
            OfferEffect::Created(new_offer.clone())
        } else {
            OfferEffect::Updated(new_offer.clone())
        }
    } else {
        if !creating {
            let account = load_account(&ls, &op.source)?
                .ok_or_else(|| StateError::InvariantViolated("source account missing".into()))?;
            add_num_entries(&header, &account, -1)?;
        }
        OfferEffect::Deleted
    };
    drop(header);

    ls.commit()?;
    debug!(
        offer_id = new_offer.offer_id,
        claimed = offers_claimed.len(),
        "manage offer applied"
    );
    Ok(ManageOfferResult::Success(ManageOfferSuccess {
        offers_claimed,
        offer: effect,
    }))
}

/// Issuers must exist and the maker must hold, and be authorized on, a line
/// for each non-native side; the selling side must also be funded. Runs in a
/// throwaway child so nothing it loads is recorded.
fn check_offer_valid(ls: &LedgerState, op: &ManageOfferOp) -> Result<Option<ManageOfferResult>> {
    if op.amount == 0 {
        // Deleting; the trust lines are irrelevant.
        return Ok(None);
    }

    let v = ls.begin_child(true)?;
    let result = check_offer_valid_inner(&v, op);
    drop(v);
    result
}

fn check_offer_valid_inner(
    v: &LedgerState,
    op: &ManageOfferOp,
) -> Result<Option<ManageOfferResult>> {
    if !matches!(op.selling, Asset::Native) {
        let sheep_line = TrustLineView::load(v, &op.source, &op.selling)?;
        let issuer_id = asset_issuer(&op.selling).cloned();
        let issuer = match issuer_id {
            Some(id) => load_account_without_record(v, &id)?,
            None => None,
        };
        if issuer.is_none() {
            return Ok(Some(ManageOfferResult::SellNoIssuer));
        }
        let Some(sheep_line) = sheep_line else {
            return Ok(Some(ManageOfferResult::SellNoTrust));
        };
        if sheep_line.balance()? == 0 {
            return Ok(Some(ManageOfferResult::Underfunded));
        }
        if !sheep_line.is_authorized()? {
            return Ok(Some(ManageOfferResult::SellNotAuthorized));
        }
    }

    if !matches!(op.buying, Asset::Native) {
        let wheat_line = TrustLineView::load(v, &op.source, &op.buying)?;
        let issuer_id = asset_issuer(&op.buying).cloned();
        let issuer = match issuer_id {
            Some(id) => load_account_without_record(v, &id)?,
            None => None,
        };
        if issuer.is_none() {
            return Ok(Some(ManageOfferResult::BuyNoIssuer));
        }
        let Some(wheat_line) = wheat_line else {
            return Ok(Some(ManageOfferResult::BuyNoTrust));
        };
        if !wheat_line.is_authorized()? {
            return Ok(Some(ManageOfferResult::BuyNotAuthorized));
        }
    }

    Ok(None)
}

/// Sizes the exchange: how much sheep the maker can actually send and how
/// much wheat it can actually receive, under the version-gated rules. Runs
/// in a throwaway child so the trial sub-entry reservation is reverted.
fn compute_offer_exchange_parameters(
    ls: &LedgerState,
    op: &ManageOfferOp,
    new_offer: &OfferEntry,
    creating: bool,
) -> Result<std::result::Result<(i64, i64), ManageOfferResult>> {
    let v = ls.begin_child(true)?;
    let header = v.load_header()?;
    let version = header.ledger_version()?;

    let account = load_account(&v, &op.source)?
        .ok_or_else(|| StateError::InvariantViolated("source account missing".into()))?;

    if creating
        && (protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION)
            || (matches!(op.selling, Asset::Native)
                && protocol_version_starts_from(
                    version,
                    RESERVE_BEFORE_NATIVE_SELL_PROTOCOL_VERSION,
                )))
    {
        // Reserve the would-be sub-entry before measuring capacity, so the
        // maker cannot sell into its own reserve. The child view rolls this
        // back; the real reservation happens only if the offer persists.
        if !add_num_entries(&header, &account, 1)? {
            return Ok(Err(ManageOfferResult::LowReserve));
        }
    }

    let sheep_line = if matches!(op.selling, Asset::Native) {
        None
    } else {
        TrustLineView::load(&v, &op.source, &op.selling)?
    };
    let wheat_line = if matches!(op.buying, Asset::Native) {
        None
    } else {
        TrustLineView::load(&v, &op.source, &op.buying)?
    };

    let account_entry = account.current()?;
    let acc = as_account(&account_entry)?;

    let max_wheat_receive = can_buy_at_most(&header, acc, &op.buying, wheat_line.as_ref())?;

    let max_sheep_send;
    if protocol_version_starts_from(version, LIABILITIES_PROTOCOL_VERSION) {
        let header_data = header.current()?;
        let available_limit = if matches!(op.buying, Asset::Native) {
            max_amount_receive(&header_data, acc)
        } else {
            let line = wheat_line
                .as_ref()
                .ok_or_else(|| StateError::InvariantViolated("wheat line missing".into()))?;
            line.max_amount_receive(&header)?
        };
        if available_limit < offer_buying_liabilities(new_offer)? {
            return Ok(Err(ManageOfferResult::LineFull));
        }

        let balance = if matches!(op.selling, Asset::Native) {
            available_balance(&header_data, acc)
        } else {
            let line = sheep_line
                .as_ref()
                .ok_or_else(|| StateError::InvariantViolated("sheep line missing".into()))?;
            line.available_balance(&header)?
        };
        if balance < offer_selling_liabilities(new_offer) {
            return Ok(Err(ManageOfferResult::Underfunded));
        }

        max_sheep_send = can_sell_at_most(&header, acc, &op.selling, sheep_line.as_ref())?;
    } else {
        let max_sheep_can_sell = can_sell_at_most(&header, acc, &op.selling, sheep_line.as_ref())?;
        let max_sheep_based_on_wheat = sheep_limit_from_wheat(max_wheat_receive, &op.price)?;
        max_sheep_send = max_sheep_can_sell.min(max_sheep_based_on_wheat);
    }

    // Never more than the offer asks for.
    Ok(Ok((op.amount.min(max_sheep_send), max_wheat_receive)))
}

/// Applies the exchange's net result to the maker's balances.
fn credit_taker(
    ls: &LedgerState,
    header: &HeaderView,
    op: &ManageOfferOp,
    asset: &Asset,
    delta: i64,
) -> Result<()> {
    if matches!(asset, Asset::Native) {
        let account = load_account(ls, &op.source)?
            .ok_or_else(|| StateError::InvariantViolated("source account missing".into()))?;
        if !add_balance(header, &account, delta)? {
            return Err(StateError::InvariantViolated(
                "offer claimed over limit".into(),
            ));
        }
        return Ok(());
    }

    let line = TrustLineView::load(ls, &op.source, asset)?
        .ok_or_else(|| StateError::InvariantViolated("taker trust line missing".into()))?;
    if !line.add_balance(header, delta)? {
        return Err(StateError::InvariantViolated(
            "offer claimed over limit".into(),
        ));
    }
    Ok(())
}

/// Shrinks the residual offer so that, post-trade, it still fits the maker's
/// balance, reserves and limits. Read-only loads: nothing here is recorded.
fn adjust_residual(
    ls: &LedgerState,
    header: &HeaderView,
    op: &ManageOfferOp,
    residual: i64,
) -> Result<i64> {
    let account = load_account_without_record(ls, &op.source)?
        .ok_or_else(|| StateError::InvariantViolated("source account missing".into()))?;
    let sheep_line = if matches!(op.selling, Asset::Native) {
        None
    } else {
        ConstTrustLineView::load(ls, &op.source, &op.selling)?
    };
    let wheat_line = if matches!(op.buying, Asset::Native) {
        None
    } else {
        ConstTrustLineView::load(ls, &op.source, &op.buying)?
    };

    let acc = as_account(account.current()?)?.clone();
    let max_send =
        residual.min(can_sell_at_most(header, &acc, &op.selling, sheep_line.as_ref())?);
    let max_receive = can_buy_at_most(header, &acc, &op.buying, wheat_line.as_ref())?;
    adjust_offer(&op.price, max_send, max_receive)
}
