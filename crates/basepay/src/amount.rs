//! Decimal token amounts <-> smallest-unit integers.
//!
//! Integer-only: no `f64` anywhere in the pipeline.

use alloy::primitives::U256;

use crate::BasePayError;

/// Parse a human-readable decimal amount (e.g. `"8"`, `"0.5"`) into the
/// token's smallest unit.
///
/// Rejects empty input, signs, non-digit characters, and fractional digits
/// beyond `decimals` unless they are all zeros.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256, BasePayError> {
    let trimmed = amount.trim();
    if trimmed.is_empty() {
        return Err(BasePayError::InvalidRequest(
            "amount is empty".to_string(),
        ));
    }

    let (integer_part, fractional_part) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if integer_part.is_empty() && fractional_part.is_empty() {
        return Err(BasePayError::InvalidRequest(format!(
            "invalid amount '{amount}': no numeric content"
        )));
    }
    if !integer_part.chars().all(|c| c.is_ascii_digit())
        || !fractional_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(BasePayError::InvalidRequest(format!(
            "invalid amount '{amount}': expected a non-negative decimal number"
        )));
    }

    let decimals = decimals as usize;
    let frac_str = if fractional_part.len() > decimals {
        let (kept, excess) = fractional_part.split_at(decimals);
        if excess.chars().any(|c| c != '0') {
            return Err(BasePayError::InvalidRequest(format!(
                "invalid amount '{amount}': more than {decimals} decimal places"
            )));
        }
        kept
    } else {
        fractional_part
    };

    let overflow =
        || BasePayError::InvalidRequest(format!("invalid amount '{amount}': overflow"));

    let integer = if integer_part.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(integer_part, 10).map_err(|_| overflow())?
    };
    let fractional = if frac_str.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(frac_str, 10).map_err(|_| overflow())?
    };

    // Scale the fractional part if it had fewer digits than `decimals`.
    let scale = U256::from(10u64).pow(U256::from(decimals - frac_str.len()));
    let multiplier = U256::from(10u64).pow(U256::from(decimals));

    integer
        .checked_mul(multiplier)
        .and_then(|whole| fractional.checked_mul(scale).map(|frac| (whole, frac)))
        .and_then(|(whole, frac)| whole.checked_add(frac))
        .ok_or_else(overflow)
}

/// Format a smallest-unit amount as a decimal string, always keeping at least
/// one fractional digit (`8000000` at 6 decimals is `"8.0"`).
pub fn format_units(amount: U256, decimals: u8) -> String {
    let digits = amount.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return format!("{digits}.0");
    }

    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits
    };
    let (integer, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        format!("{integer}.0")
    } else {
        format!("{integer}.{fraction}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_amount() {
        assert_eq!(parse_units("8", 6).unwrap(), U256::from(8_000_000u64));
    }

    #[test]
    fn test_parse_fractional_amount() {
        assert_eq!(parse_units("100.50", 6).unwrap(), U256::from(100_500_000u64));
        assert_eq!(parse_units(".5", 6).unwrap(), U256::from(500_000u64));
        assert_eq!(parse_units("0.000001", 6).unwrap(), U256::from(1u64));
    }

    #[test]
    fn test_parse_allows_trailing_zeros_beyond_decimals() {
        assert_eq!(parse_units("1.0000000", 6).unwrap(), U256::from(1_000_000u64));
    }

    #[test]
    fn test_parse_rejects_excess_precision() {
        // 7 significant decimal digits cannot be expressed in 6-decimal units
        assert!(parse_units("0.0000019", 6).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_units("", 6).is_err());
        assert!(parse_units(".", 6).is_err());
        assert!(parse_units("-1", 6).is_err());
        assert!(parse_units("$8", 6).is_err());
        assert!(parse_units("1.2.3", 6).is_err());
        assert!(parse_units("1e6", 6).is_err());
    }

    #[test]
    fn test_parse_overflow_fails() {
        let huge = "9".repeat(80);
        assert!(parse_units(&huge, 6).is_err());
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(U256::from(8_000_000u64), 6), "8.0");
        assert_eq!(format_units(U256::from(100_500_000u64), 6), "100.5");
        assert_eq!(format_units(U256::from(1u64), 6), "0.000001");
        assert_eq!(format_units(U256::ZERO, 6), "0.0");
        assert_eq!(
            format_units(U256::from(1_500_000_000_000_000_000u128), 18),
            "1.5"
        );
    }
}
