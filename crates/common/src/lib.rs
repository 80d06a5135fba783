//! Shared utilities for the Meridian ledger-state engine.
//!
//! This crate carries the pieces every other crate in the workspace leans on:
//! exact 128-bit intermediate arithmetic for price and liability math, and
//! the protocol-version gates that decide which ledger rules are in force.

pub mod math;
pub mod protocol;

pub use math::{big_divide, big_divide_saturating, MathError, Rounding};
pub use protocol::ProtocolVersion;
