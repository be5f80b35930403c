//! Compile-time unit safety for network-analysis quantities.
//!
//! Prevents mixing incompatible units like MW and Mvar, or radians and per-unit
//! voltage, at the type level rather than by convention.
//!
//! All types are `#[repr(transparent)]` newtypes over `f64` so the wrapper has
//! zero runtime cost; the compiler optimizes it away entirely.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

macro_rules! impl_unit_ops {
    ($type:ty, $unit_name:literal) => {
        impl Add for $type {
            type Output = Self;
            fn add(self, rhs: Self) -> Self::Output {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $type {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self::Output {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $type {
            type Output = Self;
            fn neg(self) -> Self::Output {
                Self(-self.0)
            }
        }

        impl Mul<f64> for $type {
            type Output = Self;
            fn mul(self, rhs: f64) -> Self::Output {
                Self(self.0 * rhs)
            }
        }

        impl Mul<$type> for f64 {
            type Output = $type;
            fn mul(self, rhs: $type) -> Self::Output {
                <$type>::new(self * rhs.0)
            }
        }

        impl Div<f64> for $type {
            type Output = Self;
            fn div(self, rhs: f64) -> Self::Output {
                Self(self.0 / rhs)
            }
        }

        impl Div<$type> for $type {
            type Output = f64;
            fn div(self, rhs: $type) -> Self::Output {
                self.0 / rhs.0
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:.6} {}", self.0, $unit_name)
            }
        }

        impl $type {
            #[inline]
            pub const fn new(value: f64) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn value(self) -> f64 {
                self.0
            }

            #[inline]
            pub fn is_finite(self) -> bool {
                self.0.is_finite()
            }

            #[inline]
            pub fn abs(self) -> Self {
                Self(self.0.abs())
            }
        }
    };
}

/// Active power in megawatts. Positive for generation-side specs, negative
/// for load-sink injections once composed into a power-flow spec vector.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Megawatts(pub f64);
impl_unit_ops!(Megawatts, "MW");

/// Reactive power in megavolt-amperes-reactive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Megavars(pub f64);
impl_unit_ops!(Megavars, "Mvar");

/// Voltage magnitude normalized to a chosen base (dimensionless).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PerUnit(pub f64);
impl_unit_ops!(PerUnit, "pu");

impl PerUnit {
    pub const ONE: Self = Self(1.0);
    pub const ZERO: Self = Self(0.0);
}

/// Absolute voltage in kilovolts.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Kilovolts(pub f64);
impl_unit_ops!(Kilovolts, "kV");

/// Angle in radians, the native unit for every trigonometric computation in
/// the solvers. Conversion from/to degrees happens only at I/O boundaries
/// that are out of this core's scope.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Radians(pub f64);
impl_unit_ops!(Radians, "rad");

impl Radians {
    pub const ZERO: Self = Self(0.0);

    #[inline]
    pub fn sin(self) -> f64 {
        self.0.sin()
    }

    #[inline]
    pub fn cos(self) -> f64 {
        self.0.cos()
    }

    /// True when the angle lies in `[-pi, pi]`, the range the data model
    /// requires for any stored `voltage_angle_rad`.
    pub fn in_principal_range(self) -> bool {
        self.0 >= -std::f64::consts::PI && self.0 <= std::f64::consts::PI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn megawatts_arithmetic() {
        let p1 = Megawatts(2.0);
        let p2 = Megawatts(0.5);
        assert_eq!((p1 + p2).value(), 2.5);
        assert_eq!((p1 - p2).value(), 1.5);
        assert_eq!((-p1).value(), -2.0);
        assert_eq!((p1 * 2.0).value(), 4.0);
        assert_eq!((2.0 * p1).value(), 4.0);
    }

    #[test]
    fn per_unit_constants() {
        assert_eq!(PerUnit::ONE.value(), 1.0);
        assert_eq!(PerUnit::ZERO.value(), 0.0);
    }

    #[test]
    fn radians_principal_range() {
        assert!(Radians(0.0).in_principal_range());
        assert!(Radians(std::f64::consts::PI).in_principal_range());
        assert!(!Radians(std::f64::consts::PI + 0.1).in_principal_range());
    }
}
