//! The log-domain cost algebra.
//!
//! Costs are tracked as `10*log2(X)` stored in a 16-bit integer. The maximum
//! cost for ordinary tables is `64*(2**63)` which becomes 6900, so every
//! cost fits without overflow. Costs are estimates; rather than compute
//! `10*log2(X)` exactly, a close table-driven approximation is used: any
//! X<=1 is stored as 0, X=2 is 10, X=3 is 16, X=1000 is 99, and so on.
//!
//! Working in the log domain turns cost multiplication into plain `+` and
//! turns addition into [`Cost::plus`], a saturating table lookup.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A cost or row-count estimate in the `10*log2(X)` domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cost(pub u16);

impl Cost {
    /// Zero cost; also the representation of any quantity X<=1.
    pub const ZERO: Self = Self(0);

    /// Convert an integer into a cost: a good approximation of `10*log2(x)`.
    #[must_use]
    pub fn of(x: u64) -> Self {
        const A: [u16; 8] = [0, 2, 3, 5, 6, 7, 8, 9];
        let mut x = x;
        let mut y: i32 = 40;
        if x < 8 {
            if x < 2 {
                return Self::ZERO;
            }
            while x < 8 {
                y -= 10;
                x <<= 1;
            }
        } else {
            while x > 255 {
                y += 40;
                x >>= 4;
            }
            while x > 15 {
                y += 10;
                x >>= 1;
            }
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self((i32::from(A[(x & 7) as usize]) + y - 10) as u16)
    }

    /// The (approximate) sum of two costs.
    ///
    /// This is not the `+` operator because costs are stored
    /// logarithmically: `plus` approximates `10*log2(2^(a/10) + 2^(b/10))`.
    /// When the operands are more than 50 apart the smaller vanishes
    /// entirely; between 32 and 49 apart it contributes a single unit;
    /// otherwise a 32-entry lookup supplies the correction.
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        const X: [u16; 32] = [
            10, 10, // 0,1
            9, 9, // 2,3
            8, 8, // 4,5
            7, 7, 7, // 6,7,8
            6, 6, 6, // 9,10,11
            5, 5, 5, // 12-14
            4, 4, 4, 4, // 15-18
            3, 3, 3, 3, 3, 3, // 19-24
            2, 2, 2, 2, 2, 2, 2, // 25-31
        ];
        let (hi, lo) = if self.0 >= other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        let d = hi - lo;
        if d >= 50 {
            Self(hi)
        } else if d >= 32 {
            Self(hi + 1)
        } else {
            Self(hi + X[d as usize])
        }
    }

    /// Estimate the logarithm of a cost-domain value: 0 for anything at or
    /// below `Cost::of(8)`, the excess above it otherwise.
    #[must_use]
    pub fn est_log(self) -> Self {
        let base = Self::of(8);
        if self.0 <= base.0 {
            Self::ZERO
        } else {
            Self(self.0 - base.0)
        }
    }

    /// Reduce a double (as received from a virtual table's planning method)
    /// into the cost domain.
    #[must_use]
    pub fn from_f64(x: f64) -> Self {
        if x <= 1.0 {
            return Self::ZERO;
        }
        if x <= 2_000_000_000.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            return Self::of(x as u64);
        }
        let bits = x.to_bits();
        #[allow(clippy::cast_possible_truncation)]
        let e = ((bits >> 52) as i64 - 1022) as u16;
        Self(e * 10)
    }

    /// Convert a cost back into its (approximate) integer value X.
    #[must_use]
    pub fn to_rows(self) -> u64 {
        if self.0 < 10 {
            return 1;
        }
        let mut n = u64::from(self.0 % 10);
        let x = self.0 / 10;
        if n >= 5 {
            n -= 2;
        } else if n >= 1 {
            n -= 1;
        }
        if x >= 3 {
            (n + 8) << (x - 3)
        } else {
            (n + 8) >> (3 - x)
        }
    }

    /// Saturating subtraction, staying at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl Add for Cost {
    type Output = Self;
    /// Plain `+` in the log domain multiplies the underlying quantities.
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Add<u16> for Cost {
    type Output = Self;
    fn add(self, rhs: u16) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<u16> for Cost {
    type Output = Self;
    fn sub(self, rhs: u16) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
