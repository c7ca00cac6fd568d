use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MICROS_PER_CREDIT: u64 = 1_000_000;

/// Non-negative credit amount stored as whole micro-credits.
///
/// Serialized as a decimal number of credits so that JSON payloads read
/// naturally (`12.5`), while all arithmetic stays exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Credits(u64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    pub const fn from_micros(micros: u64) -> Self {
        Credits(micros)
    }

    /// Convert a decimal credit amount. Returns `None` for negative or
    /// non-finite input.
    pub fn from_credits(amount: f64) -> Option<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return None;
        }
        let micros = (amount * MICROS_PER_CREDIT as f64).round();
        if micros > u64::MAX as f64 {
            return None;
        }
        Some(Credits(micros as u64))
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / MICROS_PER_CREDIT as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }

    /// Signed delta in micro-credits, as recorded in the audit log.
    pub fn signed(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_CREDIT;
        let frac = format!("{:06}", self.0 % MICROS_PER_CREDIT);
        // Keep at least two decimals, drop the rest of the trailing zeros.
        let trimmed = frac.trim_end_matches('0');
        let frac = if trimmed.len() < 2 { &frac[..2] } else { trimmed };
        write!(f, "{}.{}", whole, frac)
    }
}

impl Serialize for Credits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Credits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let amount = f64::deserialize(deserializer)?;
        Credits::from_credits(amount)
            .ok_or_else(|| serde::de::Error::custom("credit amount must be a non-negative number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_keeps_two_decimals() {
        assert_eq!(Credits::from_micros(0).to_string(), "0.00");
        assert_eq!(Credits::from_micros(100_000_000).to_string(), "100.00");
        assert_eq!(Credits::from_micros(2_500_000).to_string(), "2.50");
        assert_eq!(Credits::from_micros(41_200).to_string(), "0.0412");
        assert_eq!(Credits::from_micros(1).to_string(), "0.000001");
    }

    #[test]
    fn from_credits_rejects_negative_and_nan() {
        assert!(Credits::from_credits(-0.5).is_none());
        assert!(Credits::from_credits(f64::NAN).is_none());
        assert!(Credits::from_credits(f64::INFINITY).is_none());
        assert_eq!(Credits::from_credits(0.1), Some(Credits::from_micros(100_000)));
    }

    #[test]
    fn checked_sub_never_goes_negative() {
        let five = Credits::from_micros(5);
        let three = Credits::from_micros(3);
        assert_eq!(five.checked_sub(three), Some(Credits::from_micros(2)));
        assert_eq!(three.checked_sub(five), None);
    }

    #[test]
    fn serde_uses_decimal_credits() {
        let json = serde_json::to_string(&Credits::from_micros(12_500_000)).unwrap();
        assert_eq!(json, "12.5");
        let back: Credits = serde_json::from_str("0.001").unwrap();
        assert_eq!(back, Credits::from_micros(1_000));
        assert!(serde_json::from_str::<Credits>("-1").is_err());
    }
}
