//! Shared value types: timestamps and fixed-point money
use super::error::{OrderError, OrderResult};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Current time, but never earlier than `floor`. Keeps audit timestamps monotonic
    /// when the wall clock steps backwards.
    pub fn not_before(floor: &TimeStamp<Utc>) -> Self {
        let now = Self::new();
        if now < *floor { floor.clone() } else { now }
    }
}

// chrono's Utc is not Ord itself, so ordering is spelled out for the Utc instantiation
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Fixed-point monetary amount. Stored as the 16-byte `Decimal` serialization so no
/// precision is lost between writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }
    /// Whole currency units, e.g. `Money::from_units(50)` is 50.00.
    pub fn from_units(units: i64) -> Self {
        Self(Decimal::new(units, 0))
    }
    pub fn amount(&self) -> Decimal {
        self.0
    }
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }
    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }
    /// Subtraction that stops at zero instead of going negative.
    pub fn saturating_sub_floor(self, rhs: Money) -> Money {
        if rhs.0 >= self.0 {
            Money::ZERO
        } else {
            Money(self.0.saturating_sub(rhs.0))
        }
    }

    // Checked arithmetic. `Decimal` operators panic past ~7.9e28, so every amount
    // derived from caller input goes through these instead.

    pub fn try_add(self, rhs: Money) -> OrderResult<Money> {
        self.0
            .checked_add(rhs.0)
            .map(Money)
            .ok_or(OrderError::AmountOverflow)
    }
    pub fn try_sub(self, rhs: Money) -> OrderResult<Money> {
        self.0
            .checked_sub(rhs.0)
            .map(Money)
            .ok_or(OrderError::AmountOverflow)
    }
    /// Unit price times a quantity.
    pub fn try_mul(self, quantity: u64) -> OrderResult<Money> {
        self.0
            .checked_mul(Decimal::from(quantity))
            .map(Money)
            .ok_or(OrderError::AmountOverflow)
    }
    pub fn try_scale(self, factor: Decimal) -> OrderResult<Money> {
        self.0
            .checked_mul(factor)
            .map(Money)
            .ok_or(OrderError::AmountOverflow)
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl<C> minicbor::Encode<C> for Money {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0.serialize())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Money {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let raw: [u8; 16] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("money must be 16 bytes"))?;

        Ok(Money(Decimal::deserialize(raw)))
    }
}
