//! Offer-exchange kernel and the ManageOffer driver.
//!
//! This crate hosts the transaction-side half of the Meridian engine: the
//! arithmetic-exact crossing of a taker offer against the best-offer stream
//! of a ledger-state view ([`exchange`]), the liability accounting and offer
//! adjuster that keep reserves and limits honest ([`util`]), and the
//! end-to-end create/modify/delete driver for maker offers
//! ([`manage_offer`]).

pub mod exchange;
pub mod manage_offer;
pub mod util;

pub use exchange::{
    convert_with_offers, ConvertResult, ExchangeOutcome, OfferFilterResult,
};
pub use manage_offer::{
    apply_manage_offer, ManageOfferOp, ManageOfferResult, ManageOfferSuccess, OfferEffect,
};

pub use meridian_state::{Result, StateError};
