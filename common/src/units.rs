// Third party imports
use ethers::core::types::U256;

/// One gwei in wei
pub const GWEI: u64 = 1_000_000_000;

/// One ether in wei
pub fn ether() -> U256 {
    U256::exp10(18)
}

/// Converts a (possibly fractional) gwei amount to wei, negative inputs clamp to zero
pub fn gwei_to_wei(gwei: f64) -> U256 {
    if !gwei.is_finite() || gwei <= 0.0 {
        return U256::zero();
    }
    U256::from((gwei * GWEI as f64).round() as u128)
}

/// Converts wei to gwei for logging
pub fn wei_to_gwei(wei: U256) -> f64 {
    let whole = wei / U256::from(GWEI);
    let frac = wei % U256::from(GWEI);
    whole.low_u128() as f64 + frac.as_u64() as f64 / GWEI as f64
}

/// Parses a wei amount written as decimal or `0x` hex
pub fn parse_wei(input: &str) -> Result<U256, String> {
    let trimmed = input.trim().replace('_', "");
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex amount '{input}': {e}"))
    } else {
        U256::from_dec_str(&trimmed).map_err(|e| format!("invalid amount '{input}': {e}"))
    }
}

/// Increases `value` by `percent` percent, rounding up
pub fn bump_by_percent(value: U256, percent: u64) -> U256 {
    if percent == 0 {
        return value;
    }
    let bumped = value.saturating_mul(U256::from(100 + percent));
    let hundred = U256::from(100);
    let (quotient, remainder) = bumped.div_mod(hundred);
    if remainder.is_zero() {
        quotient
    } else {
        quotient + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gwei_conversions() {
        assert_eq!(gwei_to_wei(2.0), U256::from(2_000_000_000u64));
        assert_eq!(gwei_to_wei(0.1), U256::from(100_000_000u64));
        assert_eq!(gwei_to_wei(-1.0), U256::zero());
        assert_eq!(wei_to_gwei(U256::from(1_500_000_000u64)), 1.5);
    }

    #[test]
    fn test_parse_wei() {
        assert_eq!(parse_wei("5000000000000000000").unwrap(), ether() * 5);
        assert_eq!(parse_wei("0x0de0b6b3a7640000").unwrap(), ether());
        assert_eq!(parse_wei("1_000").unwrap(), U256::from(1000));
        assert!(parse_wei("five").is_err());
    }

    #[test]
    fn test_bump_by_percent() {
        assert_eq!(bump_by_percent(U256::from(100), 10), U256::from(110));
        assert_eq!(bump_by_percent(U256::from(15), 10), U256::from(17));
        assert_eq!(bump_by_percent(U256::from(15), 0), U256::from(15));
    }
}
