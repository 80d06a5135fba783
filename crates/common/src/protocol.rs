//! Protocol-version gates.
//!
//! Ledger rules change across protocol versions, and several of those changes
//! materially alter offer semantics: liabilities exist from version 10,
//! selling native reserves a sub-entry up front from version 9, and creating
//! an offer with both id and amount zero is rejected from version 3. The
//! helpers here keep those comparisons type-safe and greppable instead of
//! scattering bare integers through the transaction code.

/// Known protocol versions, with discriminants equal to the on-ledger values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
    V6 = 6,
    V7 = 7,
    V8 = 8,
    V9 = 9,
    V10 = 10,
    V11 = 11,
    V12 = 12,
}

impl ProtocolVersion {
    /// Convert to the underlying `u32` value.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// Feature gates
// =============================================================================

/// First version in which accounts and trust lines carry liabilities, and in
/// which offer placement releases/reacquires them around the exchange.
pub const LIABILITIES_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V10;

/// First version that reserves the new sub-entry before computing how much
/// native balance an offer can sell.
pub const RESERVE_BEFORE_NATIVE_SELL_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V9;

/// First version that rejects a create (`offer_id = 0`) with `amount = 0`.
pub const FORBID_CREATE_WITH_ZERO_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V3;

/// The highest protocol version this engine implements.
pub const CURRENT_LEDGER_PROTOCOL_VERSION: u32 = 12;

// =============================================================================
// Version comparisons
// =============================================================================

/// Returns `true` if `version` is at or after the target version.
#[inline]
pub fn protocol_version_starts_from(version: u32, from: ProtocolVersion) -> bool {
    version >= from.as_u32()
}

/// Returns `true` if `version` is strictly before the target version.
#[inline]
pub fn protocol_version_is_before(version: u32, before: ProtocolVersion) -> bool {
    version < before.as_u32()
}
