//! 128-bit intermediate arithmetic for amount and price calculations.
//!
//! Offer crossing and liability accounting compute expressions of the form
//! `a * b / c` where `a * b` can exceed 64 bits even though every operand
//! and every result fits in an `i64`. The functions here widen to 128 bits
//! for the intermediate product and apply an explicit rounding mode, so the
//! engine never loses a stroop to silent truncation.

/// Rounding mode for division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Round toward zero.
    Down,
    /// Round away from zero.
    Up,
}

/// Error type for the widening arithmetic helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathError {
    /// The result does not fit in the target type.
    Overflow,
    /// The divisor was zero or negative.
    DivisionByZero,
    /// An input was negative where only non-negative values are meaningful.
    NegativeInput,
}

impl std::fmt::Display for MathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MathError::Overflow => write!(f, "overflow in wide division"),
            MathError::DivisionByZero => write!(f, "division by zero"),
            MathError::NegativeInput => write!(f, "negative input where non-negative required"),
        }
    }
}

impl std::error::Error for MathError {}

/// Computes `a * b / c` with a 128-bit intermediate product.
///
/// `a` and `b` must be non-negative and `c` must be strictly positive.
/// Returns [`MathError::Overflow`] when the rounded quotient does not fit in
/// an `i64`; callers that treat overflow as "unbounded" should use
/// [`big_divide_saturating`] instead.
pub fn big_divide(a: i64, b: i64, c: i64, rounding: Rounding) -> Result<i64, MathError> {
    if a < 0 || b < 0 {
        return Err(MathError::NegativeInput);
    }
    if c <= 0 {
        return Err(MathError::DivisionByZero);
    }

    let result = big_divide_unsigned(a as u64, b as u64, c as u64, rounding)?;
    if result > i64::MAX as u64 {
        return Err(MathError::Overflow);
    }
    Ok(result as i64)
}

/// Computes `a * b / c`, substituting `i64::MAX` when the quotient overflows.
///
/// This is the documented overflow treatment for buying-liability math: an
/// offer whose implied buy amount cannot be represented reserves the maximum
/// representable amount.
pub fn big_divide_saturating(a: i64, b: i64, c: i64, rounding: Rounding) -> Result<i64, MathError> {
    match big_divide(a, b, c, rounding) {
        Ok(v) => Ok(v),
        Err(MathError::Overflow) => Ok(i64::MAX),
        Err(e) => Err(e),
    }
}

/// Unsigned core of [`big_divide`].
pub fn big_divide_unsigned(a: u64, b: u64, c: u64, rounding: Rounding) -> Result<u64, MathError> {
    if c == 0 {
        return Err(MathError::DivisionByZero);
    }

    let product = (a as u128) * (b as u128);
    let c128 = c as u128;

    let result = match rounding {
        Rounding::Down => product / c128,
        Rounding::Up => {
            let adjusted = product.checked_add(c128 - 1).ok_or(MathError::Overflow)?;
            adjusted / c128
        }
    };

    if result > u64::MAX as u128 {
        return Err(MathError::Overflow);
    }
    Ok(result as u64)
}

/// Widening multiply of two non-negative `i64` values.
///
/// # Panics
///
/// Panics if either input is negative; amounts and prices in the engine are
/// validated non-negative before any arithmetic runs.
#[inline]
pub fn big_multiply(a: i64, b: i64) -> u128 {
    assert!(a >= 0 && b >= 0, "big_multiply requires non-negative inputs");
    (a as u128) * (b as u128)
}

/// Divides a 128-bit numerator by a positive `i64` divisor.
pub fn big_divide_128(a: u128, b: i64, rounding: Rounding) -> Result<i64, MathError> {
    if b <= 0 {
        return Err(MathError::DivisionByZero);
    }
    let b128 = b as u128;

    let result = match rounding {
        Rounding::Down => a / b128,
        Rounding::Up => {
            if a > u128::MAX - (b128 - 1) {
                return Err(MathError::Overflow);
            }
            a.div_ceil(b128)
        }
    };

    if result > i64::MAX as u128 {
        return Err(MathError::Overflow);
    }
    Ok(result as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_divide_basic() {
        assert_eq!(big_divide(10, 20, 5, Rounding::Down), Ok(40));
        assert_eq!(big_divide(10, 20, 5, Rounding::Up), Ok(40));
    }

    #[test]
    fn test_big_divide_rounding() {
        // 10 * 3 / 4 = 7.5
        assert_eq!(big_divide(10, 3, 4, Rounding::Down), Ok(7));
        assert_eq!(big_divide(10, 3, 4, Rounding::Up), Ok(8));

        assert_eq!(big_divide(7, 1, 3, Rounding::Down), Ok(2));
        assert_eq!(big_divide(7, 1, 3, Rounding::Up), Ok(3));
    }

    #[test]
    fn test_big_divide_wide_intermediate() {
        // a * b = 10^21, well past i64, but the quotient fits.
        let a = 1_000_000_000_000i64;
        let b = 1_000_000_000i64;
        let c = 1_000_000i64;
        assert_eq!(
            big_divide(a, b, c, Rounding::Down),
            Ok(1_000_000_000_000_000)
        );
    }

    #[test]
    fn test_big_divide_overflow() {
        assert_eq!(
            big_divide(i64::MAX, 2, 1, Rounding::Down),
            Err(MathError::Overflow)
        );
    }

    #[test]
    fn test_big_divide_saturating() {
        assert_eq!(
            big_divide_saturating(i64::MAX, 2, 1, Rounding::Up),
            Ok(i64::MAX)
        );
        assert_eq!(big_divide_saturating(6, 7, 2, Rounding::Up), Ok(21));
        assert_eq!(
            big_divide_saturating(1, 1, 0, Rounding::Up),
            Err(MathError::DivisionByZero)
        );
    }

    #[test]
    fn test_big_divide_invalid_inputs() {
        assert_eq!(
            big_divide(-1, 1, 1, Rounding::Down),
            Err(MathError::NegativeInput)
        );
        assert_eq!(
            big_divide(1, -1, 1, Rounding::Down),
            Err(MathError::NegativeInput)
        );
        assert_eq!(
            big_divide(1, 1, 0, Rounding::Down),
            Err(MathError::DivisionByZero)
        );
        assert_eq!(
            big_divide(1, 1, -3, Rounding::Down),
            Err(MathError::DivisionByZero)
        );
    }

    #[test]
    fn test_big_divide_zero_numerator() {
        assert_eq!(big_divide(0, 5, 3, Rounding::Down), Ok(0));
        assert_eq!(big_divide(0, 5, 3, Rounding::Up), Ok(0));
    }

    #[test]
    fn test_big_divide_128() {
        let product = big_multiply(1_000_000, 1_000_000);
        assert_eq!(
            big_divide_128(product, 1000, Rounding::Down),
            Ok(1_000_000_000)
        );
        assert_eq!(big_divide_128(10, 3, Rounding::Up), Ok(4));
    }

    #[test]
    #[should_panic]
    fn test_big_multiply_rejects_negative() {
        big_multiply(-1, 1);
    }
}
