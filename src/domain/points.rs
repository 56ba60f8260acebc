use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Points are whole units; there is no fractional point.
pub type Points = i64;

/// Upper bound on any user's balance.
pub const MAX_BALANCE: Points = 1_000_000;

/// Why an amount was rejected before it reached a ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountError {
    #[error("amount must not be zero")]
    Zero,

    #[error("amount must be positive, got {0}")]
    Negative(Points),

    #[error("amount must be a whole number of points, got {0:?}")]
    NotAnInteger(String),
}

/// Check that an amount is usable for a charge or use.
pub fn validate_amount(amount: Points) -> Result<Points, AmountError> {
    match amount {
        0 => Err(AmountError::Zero),
        a if a < 0 => Err(AmountError::Negative(a)),
        a => Ok(a),
    }
}

/// Parse user input into a positive whole number of points.
/// Example: "50" -> 50, "+7" -> 7; "12.5", "0", "-3" are rejected.
pub fn parse_points(input: &str) -> Result<Points, AmountError> {
    let input = input.trim();

    // "10.0" still names a whole number of points
    let whole = match input.split_once('.') {
        Some((units, fraction)) if !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') => {
            units
        }
        Some(_) => return Err(AmountError::NotAnInteger(input.to_string())),
        None => input,
    };

    let amount: Points = whole
        .parse()
        .map_err(|_| AmountError::NotAnInteger(input.to_string()))?;
    validate_amount(amount)
}
