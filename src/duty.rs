// 🧮 Duty Calculator - own duty of a single claim
//
//   own_duty = claim_value × copies × rate × exchange_rate
//
// Pure, exact decimal arithmetic. The result is rounded to cents (half away
// from zero) because every stored money column carries two decimal places;
// sums of rounded amounts stay exact, so cumulative totals never drift.

use crate::entities::{ClaimInput, LedgerEntry};
use crate::error::ValidationError;
use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places of every stored money amount
pub const MONEY_DP: u32 = 2;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute the duty owed for one claim
pub fn own_duty(
    claim_value: Decimal,
    copies: i64,
    rate: Decimal,
    exchange_rate: Decimal,
) -> Result<Decimal, ValidationError> {
    validate_inputs(claim_value, copies, rate, exchange_rate)?;

    let overflow = || ValidationError::new("claim_value", "duty amount is too large to represent");

    let duty = claim_value
        .checked_mul(Decimal::from(copies))
        .and_then(|v| v.checked_mul(rate))
        .and_then(|v| v.checked_mul(exchange_rate))
        .ok_or_else(overflow)?;

    Ok(round_money(duty))
}

/// Own duty for a full claim submission
pub fn duty_for_claim(claim: &ClaimInput) -> Result<Decimal, ValidationError> {
    own_duty(claim.claim_value, claim.copies, claim.rate, claim.exchange_rate)
}

/// Own duty from an entry's current inputs
pub fn duty_for_entry(entry: &LedgerEntry) -> Result<Decimal, ValidationError> {
    own_duty(entry.claim_value, entry.copies, entry.rate, entry.exchange_rate)
}

fn validate_inputs(
    claim_value: Decimal,
    copies: i64,
    rate: Decimal,
    exchange_rate: Decimal,
) -> Result<(), ValidationError> {
    if claim_value.is_sign_negative() && !claim_value.is_zero() {
        return Err(ValidationError::new(
            "claim_value",
            format!("must not be negative, got {}", claim_value),
        ));
    }

    if copies < 0 {
        return Err(ValidationError::new(
            "copies",
            format!("must not be negative, got {}", copies),
        ));
    }

    if rate.is_sign_negative() && !rate.is_zero() {
        return Err(ValidationError::new(
            "rate",
            format!("must not be negative, got {}", rate),
        ));
    }

    if exchange_rate <= Decimal::ZERO {
        return Err(ValidationError::new(
            "exchange_rate",
            format!("must be greater than zero, got {}", exchange_rate),
        ));
    }

    Ok(())
}
