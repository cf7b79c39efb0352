//! Integers and doubles, with exact comparison between the two.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Rem, Sub};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Numeric {
    Integer(i64),
    Float(f64),
}

/// Integers of smaller magnitude convert to `f64` without loss.
pub const MOST_POSITIVE_EXACT_FLOAT: i64 = 1 << 53;

/// 2^63: the smallest float above every `i64`.
const ABOVE_I64: f64 = 9_223_372_036_854_775_808.0;

impl Numeric {
    pub fn as_float(self) -> f64 {
        match self {
            Numeric::Integer(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn is_zero(self) -> bool {
        self.as_float() == 0.0
    }

    /// The `i64` equal to `f`, if there is one.
    fn integral(f: f64) -> Option<i64> {
        (f.fract() == 0.0 && f >= i64::MIN as f64 && f < ABOVE_I64).then(|| f as i64)
    }

    /// `int` on two integers; `float` as soon as either side is a float.
    fn combine(
        self,
        other: Self,
        int: fn(i64, i64) -> Option<i64>,
        float: fn(f64, f64) -> f64,
    ) -> Option<Self> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => int(a, b).map(Numeric::Integer),
            (a, b) => Some(Numeric::Float(float(a.as_float(), b.as_float()))),
        }
    }

    /// Remainder taking the sign of the modulus.
    pub fn modulo(self, modulus: Self) -> Option<Self> {
        let shifted = ((self % modulus)? + modulus)?;
        shifted % modulus
    }
}

impl Add for Numeric {
    type Output = Option<Self>;

    fn add(self, other: Self) -> Option<Self> {
        self.combine(other, i64::checked_add, |a, b| a + b)
    }
}

impl Sub for Numeric {
    type Output = Option<Self>;

    fn sub(self, other: Self) -> Option<Self> {
        self.combine(other, i64::checked_sub, |a, b| a - b)
    }
}

impl Mul for Numeric {
    type Output = Option<Self>;

    fn mul(self, other: Self) -> Option<Self> {
        self.combine(other, i64::checked_mul, |a, b| a * b)
    }
}

/// Always a float. Dividing by zero has no result.
impl Div for Numeric {
    type Output = Option<Self>;

    fn div(self, other: Self) -> Option<Self> {
        (!other.is_zero()).then(|| Numeric::Float(self.as_float() / other.as_float()))
    }
}

impl Rem for Numeric {
    type Output = Option<Self>;

    fn rem(self, other: Self) -> Option<Self> {
        if other.is_zero() {
            return None;
        }
        self.combine(other, i64::checked_rem, |a, b| a % b)
    }
}

fn compare_int_float(i: i64, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        None
    } else if i.unsigned_abs() < MOST_POSITIVE_EXACT_FLOAT as u64 {
        (i as f64).partial_cmp(&f)
    } else if f >= ABOVE_I64 {
        Some(Ordering::Less)
    } else if f < i64::MIN as f64 {
        Some(Ordering::Greater)
    } else {
        // |i| >= 2^53, so any fraction truncated off `f` cannot change the order.
        Some(i.cmp(&(f as i64)))
    }
}

impl PartialOrd for Numeric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use Numeric::*;
        match (*self, *other) {
            (Integer(a), Integer(b)) => Some(a.cmp(&b)),
            (Float(a), Float(b)) => a.partial_cmp(&b),
            (Integer(i), Float(f)) => compare_int_float(i, f),
            (Float(f), Integer(i)) => compare_int_float(i, f).map(Ordering::reverse),
        }
    }
}

impl PartialEq for Numeric {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl Eq for Numeric {}

/// A float equal to some `i64` hashes as that integer.
impl Hash for Numeric {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match *self {
            Numeric::Integer(i) => i.hash(state),
            Numeric::Float(f) => match Self::integral(f) {
                Some(i) => i.hash(state),
                None => f.to_bits().hash(state),
            },
        }
    }
}

impl From<i64> for Numeric {
    fn from(i: i64) -> Self {
        Numeric::Integer(i)
    }
}

impl From<f64> for Numeric {
    fn from(f: f64) -> Self {
        Numeric::Float(f)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;
    use Numeric::*;

    fn hashed(n: Numeric) -> u64 {
        let mut hasher = DefaultHasher::new();
        n.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn test_integer_float_ordering() {
        let nan = Float(f64::NAN);
        assert!(Integer(1) != nan);
        assert!(!(Integer(1) < nan) && !(Integer(1) > nan));

        assert!(Integer(0) == Float(-0.0));
        assert!(Integer(2) > Float(1.0));
        assert!(Integer(2) < Float(2.0 + 2.0 * f64::EPSILON));
        assert!(Integer(i64::MAX) < Float(f64::INFINITY));
        assert!(Integer(i64::MIN) > Float(f64::NEG_INFINITY));

        let two_53 = 2f64.powi(53);
        assert!(Integer(1 << 53) == Float(two_53));
        assert!(Integer((1 << 53) + 1) > Float(two_53));
        assert!(Integer(i64::MAX) < Float(2f64.powi(63)));
        assert!(Integer(i64::MIN) == Float(-(2f64.powi(63))));
    }

    #[test]
    fn test_equal_numbers_hash_alike() {
        let pairs = [
            (Integer(0), Float(-0.0)),
            (Integer(7), Float(7.0)),
            (Integer(1 << 53), Float(2f64.powi(53))),
            (Integer(1 << 60), Float(2f64.powi(60))),
            (Integer(i64::MIN), Float(-(2f64.powi(63)))),
        ];
        for (int, float) in pairs {
            assert_eq!(int, float);
            assert_eq!(hashed(int), hashed(float), "{} and {}", int, float);
        }
        assert_ne!(hashed(Integer(1)), hashed(Float(1.5)));
    }

    #[test]
    fn test_arithmetic_without_overflow() {
        assert_eq!(Integer(2) + Integer(3), Some(Integer(5)));
        assert_eq!(Integer(1) + Float(0.5), Some(Float(1.5)));
        assert_eq!(Integer(i64::MAX) + Integer(1), None);
        assert_eq!(Integer(i64::MIN) - Integer(1), None);
        assert_eq!(Integer(i64::MAX) * Integer(2), None);
    }

    #[test]
    fn test_division_and_remainders() {
        assert_eq!(Integer(7) / Integer(2), Some(Float(3.5)));
        assert_eq!(Integer(7) / Integer(0), None);
        assert_eq!(Float(7.0) / Float(0.0), None);

        assert_eq!(Integer(-7) % Integer(3), Some(Integer(-1)));
        assert_eq!(Integer(7) % Integer(0), None);
        assert_eq!(Integer(-7).modulo(Integer(3)), Some(Integer(2)));
        assert_eq!(Integer(7).modulo(Integer(-3)), Some(Integer(-2)));
        assert_eq!(Float(-7.5).modulo(Integer(2)), Some(Float(0.5)));
        assert_eq!(Integer(7).modulo(Integer(0)), None);
    }
}
