use ethers::types::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

// Exact for anything that fits in 96 bits of mantissa and scale <= 28
pub fn u256_to_decimal(value: U256, decimals: u8) -> Result<Decimal, ConversionError> {
    let value_str = value.to_string();
    let mut decimal_value = Decimal::from_str(&value_str)
        .map_err(|e| ConversionError::InvalidDecimal(e.to_string()))?;

    decimal_value
        .set_scale(decimals as u32)
        .map_err(|_| ConversionError::Overflow)?;
    Ok(decimal_value)
}

/// Human-scale rendering of a raw amount, without trailing zeros.
pub fn format_amount(value: U256, decimals: u8) -> String {
    match u256_to_decimal(value, decimals) {
        Ok(d) => d.normalize().to_string(),
        // Wider than rust_decimal can hold: let ethers do the string math.
        Err(_) => match ethers::utils::format_units(value, decimals as u32) {
            Ok(s) => trim_fraction(&s),
            // format_units stops at 77 decimals.
            Err(_) => trim_fraction(&shift_decimal_point(&value.to_string(), decimals)),
        },
    }
}

/// Places the decimal point `decimals` digits from the right of `digits`.
fn shift_decimal_point(digits: &str, decimals: u8) -> String {
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits.to_string();
    }
    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (int, frac) = padded.split_at(padded.len() - decimals);
    format!("{}.{}", int, frac)
}

/// Normalized float for sorting and USD maths. Precision loss is accepted here.
pub fn to_normalized(value: U256, decimals: u8) -> f64 {
    match u256_to_decimal(value, decimals) {
        Ok(d) => d.to_f64().unwrap_or(0.0),
        Err(_) => format_amount(value, decimals).parse::<f64>().unwrap_or(0.0),
    }
}

fn trim_fraction(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

pub fn address_to_string(addr: Address) -> String {
    format!("{:?}", addr).to_lowercase()
}

pub fn string_to_address(s: &str) -> Result<Address, ConversionError> {
    Address::from_str(s.trim()).map_err(|e| ConversionError::InvalidAddress(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount_trims_zeros() {
        let raw = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(format_amount(raw, 18), "1.5");
        assert_eq!(format_amount(U256::zero(), 18), "0");
        assert_eq!(format_amount(U256::from(1_234_567u64), 6), "1.234567");
    }

    #[test]
    fn test_huge_amount_falls_back_to_format_units() {
        // 2^200 does not fit in a rust_decimal mantissa
        let raw = U256::from(2u8).pow(U256::from(200u8));
        let shown = format_amount(raw, 18);
        assert!(shown.contains('.') || shown.len() > 20);
        assert!(to_normalized(raw, 18) > 1e40);
    }

    #[test]
    fn test_extreme_decimals_still_scale() {
        let raw = U256::exp10(30);
        assert_eq!(format_amount(raw, 80), format!("0.{}1", "0".repeat(49)));
        let normalized = to_normalized(raw, 80);
        assert!(normalized > 0.0 && normalized < 1e-49);
        assert_eq!(format_amount(U256::from(5u8), 255).len(), 257);
    }

    #[test]
    fn test_normalized_value() {
        let raw = U256::from(2_500_000u64);
        assert!((to_normalized(raw, 6) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_address_round_trip_is_lowercase() {
        let addr = string_to_address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert_eq!(
            address_to_string(addr),
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
    }
}
