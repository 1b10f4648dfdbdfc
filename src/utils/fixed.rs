use std::fmt;
use std::ops::{Add, Sub};

use super::geometry::Coordinate;

/// Signed 24.8 fixed point number
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    /// Number of fractional bits
    pub const FRACTION_BITS: u32 = 8;

    /// Wrap a raw 24.8 value
    #[inline]
    pub const fn from_raw(raw: i32) -> Fixed {
        Fixed(raw)
    }

    /// Exact conversion from an integer
    #[inline]
    pub const fn from_int(value: i32) -> Fixed {
        Fixed(value << Self::FRACTION_BITS)
    }

    /// The raw 24.8 representation
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Widen to the unsigned 16.16 layout used by plane source rectangles
    ///
    /// Negative values saturate at zero.
    #[inline]
    pub fn to_16_16(self) -> u32 {
        (Ord::max(self.0, 0) as u32) << 8
    }

    /// Integer part, rounded towards zero
    #[inline]
    pub fn to_int(self) -> i32 {
        self.0 / (1 << Self::FRACTION_BITS)
    }
}

impl Add for Fixed {
    type Output = Fixed;
    #[inline]
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    #[inline]
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.saturating_sub(rhs.0))
    }
}

impl Coordinate for Fixed {
    const ZERO: Fixed = Fixed(0);

    #[inline]
    fn to_f64(self) -> f64 {
        self.0 as f64 / 256.0
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        Fixed((v * 256.0).round() as i32)
    }
    #[inline]
    fn saturating_add(self, other: Self) -> Self {
        self + other
    }
    #[inline]
    fn saturating_sub(self, other: Self) -> Self {
        self - other
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::Fixed;
    use crate::utils::geometry::Coordinate;

    #[test]
    fn conversions() {
        assert_eq!(Fixed::from_int(3).raw(), 768);
        assert_eq!(Fixed::from_f64(1.5).raw(), 384);
        assert_eq!(Fixed::from_f64(1.5).to_int(), 1);
        assert_eq!(Fixed::from_int(64).to_16_16(), 64 << 16);
        assert_eq!(Fixed::from_int(-1).to_16_16(), 0);
    }
}
