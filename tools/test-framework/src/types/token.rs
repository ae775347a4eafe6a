/*!
   Token amounts and transfer requests.
*/

use core::fmt::{self, Display};
use core::ops::{Add, Sub};
use core::str::FromStr;
use eyre::eyre;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{handle_generic_error, Error};

/// Number of decimal places of UTXO coins (satoshi per coin is `10^8`).
pub const COIN_DECIMALS: u32 = 8;

/**
   A non-negative integer token amount in the smallest unit of a denom.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn checked_add(self, other: impl Into<Amount>) -> Option<Self> {
        self.0.checked_add(other.into().0).map(Self)
    }

    pub fn checked_sub(self, other: impl Into<Amount>) -> Option<Self> {
        self.0.checked_sub(other.into().0).map(Self)
    }

    pub fn checked_mul(self, factor: u128) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /**
       Parse a decimal coin string such as `"50.00000000"` or `"1e-5"`
       into the smallest unit, with the given number of decimals.
       Extra precision beyond `decimals` is rejected.
    */
    pub fn from_decimal_str(value: &str, decimals: u32) -> Result<Self, Error> {
        let value = value.trim().trim_matches('"');

        let (mantissa, exponent) = match value.find(['e', 'E']) {
            Some(i) => {
                let exponent: i32 = value[i + 1..].parse().map_err(handle_generic_error)?;
                (&value[..i], exponent)
            }
            None => (value, 0),
        };

        if mantissa.starts_with('-') {
            return Err(Error::generic(eyre!("negative amount: {value}")));
        }

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };

        let digits = format!("{int_part}{frac_part}");
        let scale = decimals as i32 + exponent - frac_part.len() as i32;

        let digits = digits.trim_start_matches('0');
        let base: u128 = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(handle_generic_error)?
        };

        if scale >= 0 {
            let factor = 10u128
                .checked_pow(scale as u32)
                .ok_or_else(|| eyre!("amount {value} overflows"))?;
            base.checked_mul(factor)
                .map(Amount)
                .ok_or_else(|| Error::generic(eyre!("amount {value} overflows")))
        } else {
            let divisor = 10u128
                .checked_pow((-scale) as u32)
                .ok_or_else(|| eyre!("amount {value} has too many decimals"))?;
            if base % divisor != 0 {
                return Err(Error::generic(eyre!(
                    "amount {value} has more than {decimals} decimals"
                )));
            }
            Ok(Amount(base / divisor))
        }
    }

    /// Format the amount as a decimal coin string with the given decimals.
    pub fn to_decimal_string(&self, decimals: u32) -> String {
        let factor = 10u128.pow(decimals);
        format!(
            "{}.{:0width$}",
            self.0 / factor,
            self.0 % factor,
            width = decimals as usize
        )
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let value = s
            .trim()
            .parse::<u128>()
            .map_err(|e| Error::generic(eyre!("invalid amount `{s}`: {e}")))?;
        Ok(Amount(value))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(value as u128)
    }
}

impl From<u32> for Amount {
    fn from(value: u32) -> Self {
        Amount(value as u128)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, other: Amount) -> Amount {
        Amount(self.0 + other.0)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, other: Amount) -> Amount {
        Amount(self.0 - other.0)
    }
}

// Amounts that fit in a u64 are written as integers, larger ones as strings,
// since TOML integers are 64-bit.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match u64::try_from(self.0) {
            Ok(value) => serializer.serialize_u64(value),
            Err(_) => serializer.serialize_str(&self.0.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a non-negative integer amount or a string holding one")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Amount, E> {
                Ok(Amount(value as u128))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Amount, E> {
                u128::try_from(value)
                    .map(Amount)
                    .map_err(|_| E::custom(format!("negative amount {value}")))
            }

            fn visit_u128<E: de::Error>(self, value: u128) -> Result<Amount, E> {
                Ok(Amount(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Amount, E> {
                value
                    .trim()
                    .parse::<u128>()
                    .map(Amount)
                    .map_err(|e| E::custom(format!("invalid amount `{value}`: {e}")))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/**
   The target of a transfer: an address on a chain, a denom and an
   amount. Also used as the balance baseline of
   [`poll_for_balance_change`](crate::testutil::poll_for_balance_change).
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAmount {
    pub address: String,
    pub denom: String,
    pub amount: Amount,
}

impl WalletAmount {
    pub fn new(address: impl Into<String>, denom: impl Into<String>, amount: impl Into<Amount>) -> Self {
        Self {
            address: address.into(),
            denom: denom.into(),
            amount: amount.into(),
        }
    }
}

impl Display for WalletAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} to {}", self.amount, self.denom, self.address)
    }
}
