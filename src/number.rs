// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::cmp::Ordering;
use core::fmt::{self, Debug, Display, Formatter};
use core::str::FromStr;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};
use serde::ser::Serializer;
use serde::Serialize;

const F64_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0; // 2^53

/// Arbitrary precision number type.
///
/// Values that fit in an `i64` stay inline; larger magnitudes promote to a
/// shared big integer. Fractional values are kept as `f64`.
#[derive(Clone)]
pub enum Number {
    Int(i64),
    Float(f64),
    Big(Rc<BigInt>),
}

use Number::*;

impl Number {
    fn from_big(value: BigInt) -> Number {
        match value.to_i64() {
            Some(i) => Int(i),
            None => Big(Rc::new(value)),
        }
    }

    fn as_big(&self) -> Option<BigInt> {
        match self {
            Int(i) => Some(BigInt::from(*i)),
            Float(f) if f.fract() == 0.0 && f.abs() < F64_SAFE_INTEGER => {
                Some(BigInt::from(*f as i64))
            }
            Float(_) => None,
            Big(b) => Some(b.as_ref().clone()),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Int(i) => *i as f64,
            Float(f) => *f,
            Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Int(i) => Some(*i),
            Float(f) if f.fract() == 0.0 && f.abs() < F64_SAFE_INTEGER => Some(*f as i64),
            Float(_) => None,
            Big(b) => b.to_i64(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.as_i64() {
            Some(i) if i >= 0 => Some(i as u64),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        match self {
            Int(_) | Big(_) => true,
            Float(f) => f.fract() == 0.0,
        }
    }

    pub fn is_positive(&self) -> bool {
        match self {
            Int(i) => *i > 0,
            Float(f) => *f > 0.0,
            Big(b) => b.is_positive(),
        }
    }

    pub fn add(&self, rhs: &Number) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => match a.checked_add(*b) {
                Some(c) => Ok(Int(c)),
                None => Ok(Self::from_big(BigInt::from(*a) + BigInt::from(*b))),
            },
            (a, b) => match (a.as_big(), b.as_big()) {
                (Some(x), Some(y)) if a.is_integer() && b.is_integer() => {
                    Ok(Self::from_big(x + y))
                }
                _ => Ok(Float(a.as_f64() + b.as_f64())),
            },
        }
    }

    pub fn sub(&self, rhs: &Number) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => match a.checked_sub(*b) {
                Some(c) => Ok(Int(c)),
                None => Ok(Self::from_big(BigInt::from(*a) - BigInt::from(*b))),
            },
            (a, b) => match (a.as_big(), b.as_big()) {
                (Some(x), Some(y)) if a.is_integer() && b.is_integer() => {
                    Ok(Self::from_big(x - y))
                }
                _ => Ok(Float(a.as_f64() - b.as_f64())),
            },
        }
    }

    pub fn mul(&self, rhs: &Number) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => match a.checked_mul(*b) {
                Some(c) => Ok(Int(c)),
                None => Ok(Self::from_big(BigInt::from(*a) * BigInt::from(*b))),
            },
            (a, b) => match (a.as_big(), b.as_big()) {
                (Some(x), Some(y)) if a.is_integer() && b.is_integer() => {
                    Ok(Self::from_big(x * y))
                }
                _ => Ok(Float(a.as_f64() * b.as_f64())),
            },
        }
    }

    pub fn divide(&self, rhs: &Number) -> Result<Number> {
        if let (Int(a), Int(b)) = (self, rhs) {
            if *b == 0 {
                bail!("divide by zero");
            }
            if a % b == 0 {
                return Ok(Int(a / b));
            }
        }
        let d = rhs.as_f64();
        if d == 0.0 {
            bail!("divide by zero");
        }
        Ok(Float(self.as_f64() / d))
    }

    pub fn modulo(&self, rhs: &Number) -> Result<Number> {
        let a = self
            .as_i64()
            .ok_or_else(|| anyhow!("modulo on floating-point number"))?;
        let b = rhs
            .as_i64()
            .ok_or_else(|| anyhow!("modulo on floating-point number"))?;
        if b == 0 {
            bail!("modulo by zero");
        }
        Ok(Int(a % b))
    }

    pub fn neg(&self) -> Number {
        match self {
            Int(i) => Int(-i),
            Float(f) => Float(-f),
            Big(b) => Self::from_big(-b.as_ref().clone()),
        }
    }

    pub fn abs(&self) -> Number {
        match self {
            Int(i) => Int(i.wrapping_abs()),
            Float(f) => Float(f.abs()),
            Big(b) => Self::from_big(b.abs()),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Big(a), Big(b)) => a.as_ref().cmp(b.as_ref()),
            (Int(a), Big(b)) => BigInt::from(*a).cmp(b.as_ref()),
            (Big(a), Int(b)) => a.as_ref().cmp(&BigInt::from(*b)),
            // Mixed float comparisons go through f64. Values parsed from JSON
            // documents are never NaN; total_cmp keeps the order total anyway.
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Int(n)
    }
}

impl From<u64> for Number {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(i) => Int(i),
            Err(_) => Self::from_big(BigInt::from(n)),
        }
    }
}

impl From<i128> for Number {
    fn from(n: i128) -> Self {
        Self::from_big(BigInt::from(n))
    }
}

impl From<u128> for Number {
    fn from(n: u128) -> Self {
        Self::from_big(BigInt::from(n))
    }
}

impl From<usize> for Number {
    fn from(n: usize) -> Self {
        Self::from(n as u64)
    }
}

impl From<f64> for Number {
    fn from(n: f64) -> Self {
        if n.fract() == 0.0 && n.abs() < F64_SAFE_INTEGER {
            Int(n as i64)
        } else {
            Float(n)
        }
    }
}

impl FromStr for Number {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Int(i));
        }
        if !s.contains(['.', 'e', 'E']) {
            if let Ok(b) = s.parse::<BigInt>() {
                return Ok(Self::from_big(b));
            }
        }
        match s.parse::<f64>() {
            Ok(f) => Ok(Float(f)),
            Err(_) => bail!("invalid number `{s}`"),
        }
    }
}

impl Display for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Int(i) => write!(f, "{i}"),
            Float(v) => write!(f, "{v}"),
            Big(b) => write!(f, "{b}"),
        }
    }
}

impl Debug for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Serialize for Number {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Int(i) => serializer.serialize_i64(*i),
            Float(v) => serializer.serialize_f64(*v),
            Big(b) => match b.to_i128() {
                Some(i) => serializer.serialize_i128(i),
                None => serializer.serialize_str(&b.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_overflow_promotes() -> Result<()> {
        let a = Number::from(i64::MAX);
        let b = a.add(&Number::from(1i64))?;
        assert!(matches!(b, Big(_)));
        assert_eq!(b.sub(&Number::from(1i64))?, a);
        Ok(())
    }

    #[test]
    fn cross_variant_ordering() {
        assert_eq!(Number::from(1i64), Number::from(1.0));
        assert!(Number::from(1i64) < Number::from(1.5));
        assert!(Number::from(u64::MAX) > Number::from(i64::MAX));
    }

    #[test]
    fn division() -> Result<()> {
        assert_eq!(
            Number::from(6i64).divide(&Number::from(3i64))?,
            Number::from(2i64)
        );
        assert_eq!(
            Number::from(1i64).divide(&Number::from(2i64))?,
            Number::from(0.5)
        );
        assert!(Number::from(1i64).divide(&Number::from(0i64)).is_err());
        Ok(())
    }

    #[test]
    fn parse_big() -> Result<()> {
        let n = Number::from_str("123456789012345678901234567890")?;
        assert!(matches!(n, Big(_)));
        assert_eq!(n.to_string(), "123456789012345678901234567890");
        Ok(())
    }
}
