//! Shared building blocks for the domain modules: string-backed enums,
//! row decoding helpers and input normalisation.

use std::fmt::Display;
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use crate::errors::{AppError, Result};

/// Declare an enum that is stored as snake_case text and serialised the
/// same way over JSON.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

pub(crate) use string_enum;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decode a TEXT column through `FromStr` (decimals, status enums).
pub fn parse_column<T>(row: &SqliteRow, column: &str) -> sqlx::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: T::Err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.to_string().into(),
    })
}

/// ISO-4217 style code: three ASCII letters, upper-cased.
pub fn normalize_currency(raw: &str) -> Result<String> {
    let code = raw.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::Validation(format!(
            "currency must be a three-letter code, got {raw:?}"
        )));
    }
    Ok(code.to_ascii_uppercase())
}

/// `a + b`, with overflow reported as bad input instead of a panic.
pub fn checked_add(field: &str, a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b).ok_or_else(|| out_of_range(field))
}

pub fn checked_sub(field: &str, a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_sub(b).ok_or_else(|| out_of_range(field))
}

fn out_of_range(field: &str) -> AppError {
    AppError::Validation(format!("{field} is out of range"))
}

/// Sum amounts stored as decimal text.
pub fn sum_decimal_text(field: &str, values: &[String]) -> Result<Decimal> {
    values.iter().try_fold(Decimal::ZERO, |sum, raw| {
        let amount = raw
            .parse::<Decimal>()
            .map_err(|e| AppError::Database(sqlx::Error::Decode(e.into())))?;
        checked_add(field, sum, amount)
    })
}

pub fn require_positive(field: &str, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}

pub fn require_non_empty(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Canonical text form used for every stored amount.
pub fn decimal_text(amount: Decimal) -> String {
    amount.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    string_enum! {
        pub enum Colour {
            Red => "red",
            DarkBlue => "dark_blue",
        }
    }

    #[test]
    fn string_enum_round_trips_through_text() {
        assert_eq!(Colour::DarkBlue.as_str(), "dark_blue");
        assert_eq!("red".parse::<Colour>().unwrap(), Colour::Red);
        assert!("green".parse::<Colour>().is_err());
        assert_eq!(
            serde_json::to_string(&Colour::DarkBlue).unwrap(),
            "\"dark_blue\""
        );
    }

    #[test]
    fn currency_is_normalised() {
        assert_eq!(normalize_currency(" usd ").unwrap(), "USD");
        assert!(normalize_currency("US").is_err());
        assert!(normalize_currency("U5D").is_err());
    }

    #[test]
    fn positive_amounts_only() {
        assert!(require_positive("amount", Decimal::ZERO).is_err());
        assert!(require_positive("amount", Decimal::new(-1, 0)).is_err());
        assert!(require_positive("amount", Decimal::new(1, 2)).is_ok());
    }

    #[test]
    fn decimal_text_drops_trailing_zeros() {
        assert_eq!(decimal_text(Decimal::new(9500, 2)), "95");
        assert_eq!(decimal_text(Decimal::new(1050, 2)), "10.5");
    }
}
