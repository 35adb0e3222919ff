use {
    alloy::primitives::U256,
    anyhow::{Context, Result, ensure},
    bigdecimal::{BigDecimal, num_bigint::ToBigInt},
    num::{BigInt, BigRational, BigUint, Zero, bigint::Sign},
    std::{ops::Neg, str::FromStr},
};

fn u256_to_big_uint(input: &U256) -> BigUint {
    BigUint::from_bytes_be(&input.to_be_bytes::<32>())
}

fn u256_to_big_int(input: &U256) -> BigInt {
    BigInt::from_biguint(Sign::Plus, u256_to_big_uint(input))
}

pub fn u256_to_big_rational(input: &U256) -> BigRational {
    BigRational::new(u256_to_big_int(input), 1.into())
}

fn big_uint_to_u256(input: &BigUint) -> Result<U256> {
    let bytes = input.to_bytes_be();
    ensure!(bytes.len() <= 32, "too large");
    U256::try_from_be_slice(&bytes).context("too large")
}

fn big_int_to_u256(input: &BigInt) -> Result<U256> {
    ensure!(input.sign() != Sign::Minus, "negative");
    big_uint_to_u256(input.magnitude())
}

pub fn u256_to_big_decimal(u256: &U256) -> BigDecimal {
    BigDecimal::from(u256_to_big_int(u256))
}

pub fn big_decimal_to_u256(big_decimal: &BigDecimal) -> Option<U256> {
    if !big_decimal.is_integer() {
        return None;
    }
    let big_int = big_decimal.to_bigint()?;
    big_int_to_u256(&big_int).ok()
}

/// Parses a decimal string like `"0.01"` into an exact ratio. Going through
/// `f64` would carry its binary rounding error into the ratio.
pub fn big_rational_from_decimal_str(s: &str) -> Result<BigRational> {
    let s = s.trim();
    let (is_negative, s) = if let Some(stripped) = s.strip_prefix('-') {
        (true, stripped)
    } else {
        (false, s)
    };

    let parts: Vec<&str> = s.split('.').collect();
    match parts.len() {
        1 => {
            let numerator = BigInt::from_str(parts[0]).context("unable to parse integer part")?;
            Ok(BigRational::from_integer(numerator))
        }
        2 => {
            let integer_part = if parts[0].is_empty() {
                // Handle cases like ".5" as "0.5"
                BigInt::zero()
            } else {
                BigInt::from_str(parts[0]).context("unable to parse integer part")?
            };

            let fractional_part = if parts[1].is_empty() {
                // Handle cases like "1." as "1.0"
                BigInt::zero()
            } else {
                BigInt::from_str(parts[1]).context("unable to parse fractional part")?
            };

            let fractional_length =
                u32::try_from(parts[1].len()).context("fractional part too long")?;
            let denominator = BigInt::from(10u32).pow(fractional_length);
            let numerator = integer_part * &denominator + fractional_part;
            Ok(BigRational::new(numerator, denominator))
        }
        _ => Err(anyhow::anyhow!("invalid decimal number")),
    }
    .map(|ratio| if is_negative { ratio.neg() } else { ratio })
}
