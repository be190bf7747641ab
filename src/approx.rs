//! Utilities to approximate equality of floating point values.
//!
//! Device results go through `f32` on some backends and through reordered
//! summations on all of them, so comparisons against host references grade
//! the distance instead of asking for bit equality.

use num_complex::Complex64;

/// The max epsilon accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected minimum epsilon accepted on `f32`s.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// The best expected epsilon accepted on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// The max epsilon accepted on `f64`s.
pub const F64_MAX_ERROR: f64 = 1e-3;

/// The expected minimum epsilon accepted on `f64`s.
pub const F64_AVG_ERROR: f64 = 1e-6;

/// The best expected epsilon accepted on `f64`s.
pub const F64_MIN_ERROR: f64 = 1e-13;

/// Checks the relative distance based off epsilon.
pub trait RelativeEq<Rhs: ?Sized> {
    /// Enumerates the equality of `self`
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = (self - rhs).abs();

        if dif < F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F32_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq<Self> for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = (self - rhs).abs();

        if dif < F64_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F64_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F64_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq<Self> for Complex64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        (self - rhs).norm().approx_eq(&0.0)
    }
}

impl<const N: usize, T: RelativeEq<U>, U> RelativeEq<[U; N]> for [T; N] {
    fn approx_eq(&self, rhs: &[U; N]) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (t_val, u_val) in self.iter().zip(rhs) {
            eq = eq.max(t_val.approx_eq(u_val));
            if eq == ApproxEquality::Scarce {
                break; // can't improve from here; not equal
            }
        }
        eq
    }
}

/// The approximated equality enumerated, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,

    /// Good epsilon.
    Partial = 1,

    /// Acceptable epsilon
    Relative = 2,

    /// No relative equality.
    Scarce = 3,
}

/// Approximates equality based off the relative difference.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) == ApproxEquality::Precise
}

/// Element-wise comparison that accepts anything short of [`ApproxEquality::Scarce`].
#[must_use]
pub fn approx_eq_slice(a: &[f64], b: &[f64]) -> bool {
    a.approx_eq(b) != ApproxEquality::Scarce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_are_ordered_by_distance() {
        assert_eq!(1.0_f64.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0_f64.approx_eq(&1.000_000_1), ApproxEquality::Partial);
        assert_eq!(1.0_f32.approx_eq(&1.000_1), ApproxEquality::Relative);
        assert_eq!(1.0_f32.approx_eq(&1.1), ApproxEquality::Scarce);
    }

    #[test]
    fn slices_take_the_worst_grade() {
        let a = [1.0, 2.0, 3.0];
        assert_eq!(a.approx_eq(&[1.0, 2.000_01, 3.0]), ApproxEquality::Relative);
        assert!(!approx_eq_slice(&a, &[1.0, 2.0]));
        assert!(approx_eq_slice(&a, &[1.0, 2.0, 3.000_5]));
        assert!(approx_eq(
            &Complex64::new(1.0, -1.0),
            &Complex64::new(1.0, -1.0)
        ));
    }
}
