//! Commission / VAT split and minor-unit conversion for the escrow ledger.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Currency amounts carry two decimal places.
pub const CURRENCY_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateError {
    #[error("{name} must be in [0, 1), got {value}")]
    OutOfRange { name: &'static str, value: Decimal },
}

/// Rates applied to every gross payment. Both are fractions in `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    commission_rate: Decimal,
    vat_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(10, 2),
            vat_rate: Decimal::new(21, 2),
        }
    }
}

impl FeeSchedule {
    pub fn new(commission_rate: Decimal, vat_rate: Decimal) -> Result<Self, RateError> {
        check_rate("commission rate", commission_rate)?;
        check_rate("VAT rate", vat_rate)?;
        Ok(Self {
            commission_rate,
            vat_rate,
        })
    }

    pub fn commission_rate(&self) -> Decimal {
        self.commission_rate
    }

    pub fn vat_rate(&self) -> Decimal {
        self.vat_rate
    }

    /// `commission = gross × commission_rate`, `vat = commission × vat_rate`,
    /// `net = gross − commission − vat`. Each component is rounded to the
    /// currency scale before the next is derived from it, so the three parts
    /// always sum back to the gross.
    pub fn split(&self, gross: Decimal) -> FeeSplit {
        let gross = round_currency(gross);
        let commission = round_currency(gross * self.commission_rate);
        let vat = round_currency(commission * self.vat_rate);
        let application_fee = commission + vat;
        FeeSplit {
            gross,
            commission,
            vat,
            application_fee,
            net: gross - application_fee,
        }
    }
}

fn check_rate(name: &'static str, value: Decimal) -> Result<(), RateError> {
    if value < Decimal::ZERO || value >= Decimal::ONE {
        return Err(RateError::OutOfRange { name, value });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub gross: Decimal,
    pub commission: Decimal,
    pub vat: Decimal,
    /// What the platform keeps: commission + VAT.
    pub application_fee: Decimal,
    pub net: Decimal,
}

pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Amount in minor units (cents), rounded to the nearest integer.
/// `None` if it does not fit an `i64`.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}
