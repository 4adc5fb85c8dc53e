use anyhow::{anyhow, Result};
use rust_decimal::Decimal;

/// Largest number of decimals a `Decimal` can represent exactly.
pub const MAX_DECIMALS: u32 = 28;

/// Convert a human amount (e.g. `0.1`) into integer base units.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128> {
    if decimals > MAX_DECIMALS {
        return Err(anyhow!("Unsupported decimals: {}", decimals));
    }
    if amount.is_sign_negative() {
        return Err(anyhow!("Amount must not be negative: {}", amount));
    }

    let normalized = amount.normalize();
    if normalized.scale() > decimals {
        return Err(anyhow!(
            "Amount {} has more than {} fractional digits",
            amount,
            decimals
        ));
    }

    let mut scaled = normalized;
    scaled.rescale(decimals);
    // rescale silently lowers the scale when the mantissa would overflow
    if scaled.scale() != decimals {
        return Err(anyhow!("Amount {} is too large for {} decimals", amount, decimals));
    }

    u128::try_from(scaled.mantissa()).map_err(|_| anyhow!("Amount {} out of range", amount))
}

/// Convert integer base units back into a human amount.
pub fn from_base_units(units: u128, decimals: u32) -> Result<Decimal> {
    let mantissa = i128::try_from(units).map_err(|_| anyhow!("Base units {} out of range", units))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map(|d| d.normalize())
        .map_err(|e| anyhow!("Base units {} with {} decimals: {}", units, decimals, e))
}
