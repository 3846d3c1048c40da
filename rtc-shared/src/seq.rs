//! Wrap-aware modular arithmetic for RTP sequence numbers and SCTP TSNs.
//!
//! Both wrap at their native width; comparisons use the sign of the
//! half-modulus difference rather than plain integer `<`/`>`, so values
//! just past a wraparound still compare correctly.

use std::cmp::Ordering;

macro_rules! wrapping_num {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn new(v: $inner) -> Self {
                Self(v)
            }

            pub fn value(self) -> $inner {
                self.0
            }

            pub fn add(self, delta: $inner) -> Self {
                Self(self.0.wrapping_add(delta))
            }

            pub fn plus_one(self) -> Self {
                self.add(1)
            }

            pub fn minus_one(self) -> Self {
                Self(self.0.wrapping_sub(1))
            }

            /// `self > other`, wrap-aware: true iff the signed difference
            /// `self - other` is positive when interpreted as a half-modulus
            /// signed value.
            pub fn gt(self, other: Self) -> bool {
                let diff = self.0.wrapping_sub(other.0);
                diff != 0 && (diff as <$inner as WrapSigned>::Signed) > 0
            }

            pub fn gte(self, other: Self) -> bool {
                self == other || self.gt(other)
            }

            pub fn lt(self, other: Self) -> bool {
                other.gt(self)
            }

            pub fn lte(self, other: Self) -> bool {
                self == other || other.gt(self)
            }

            /// Forward modular distance from `other` to `self` (`self - other`).
            pub fn distance(self, other: Self) -> $inner {
                self.0.wrapping_sub(other.0)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(if self == other {
                    Ordering::Equal
                } else if self.gt(*other) {
                    Ordering::Greater
                } else {
                    Ordering::Less
                })
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.partial_cmp(other).unwrap()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

/// Helper trait so the macro can name the signed counterpart of each width.
trait WrapSigned {
    type Signed;
}
impl WrapSigned for u16 {
    type Signed = i16;
}
impl WrapSigned for u32 {
    type Signed = i32;
}

wrapping_num!(SeqNum, u16);
wrapping_num!(Tsn, u32);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seq_wraps_correctly() {
        let a = SeqNum::new(65534);
        let b = SeqNum::new(2);
        assert!(b.gt(a));
        assert!(!a.gt(b));
        assert_eq!(a.add(4), b);
    }

    #[test]
    fn tsn_half_modulus_comparison() {
        // a > b iff (a<b and b-a>2^31) or (a>b and a-b<2^31), per RFC 4960 §1.6
        let a = Tsn::new(0xFFFF_FFF0);
        let b = Tsn::new(5);
        assert!(b.gt(a));
        assert!(!a.gt(b));
    }

    #[test]
    fn plus_one_and_minus_one_invert() {
        let a = SeqNum::new(0);
        assert_eq!(a.plus_one().minus_one(), a);
    }
}
