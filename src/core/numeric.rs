//! Scalar abstraction shared by every layer.
//!
//! Integers saturate instead of wrapping; floats follow IEEE-754. Everything
//! transcendental is evaluated in f64 and converted back with [`Scalar::from_f64`].

use std::fmt;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(feature = "simd")]
use wide::f32x4;

/// Element type of a network.
pub trait Scalar:
    Copy
    + PartialEq
    + PartialOrd
    + Default
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Tag written into serialized networks.
    const TYPE_NAME: &'static str;
    const IS_FLOAT: bool;
    const IS_SIGNED: bool;
    /// Bytes per value in the binary codec.
    const BYTES: usize;
    /// True when every value converts to f32 and back without loss (GPU path).
    const GPU_EXACT: bool;

    const ZERO: Self;
    const ONE: Self;
    const MIN: Self;
    const MAX: Self;

    fn sat_add(self, rhs: Self) -> Self;
    fn sat_sub(self, rhs: Self) -> Self;
    fn sat_mul(self, rhs: Self) -> Self;

    /// Integers round half away from zero and saturate; NaN maps to zero.
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    /// `exp` as used by the activations of this type.
    fn exp_f64(x: f64) -> f64;

    /// Bit pattern used for exact comparisons.
    fn to_bits(self) -> u64;

    fn write_le<W: Write>(self, w: &mut W) -> io::Result<()>;
    fn read_le<R: Read>(r: &mut R) -> io::Result<Self>;

    #[inline]
    fn clip(self, lower: Self, upper: Self) -> Self {
        if self < lower {
            lower
        } else if self > upper {
            upper
        } else {
            self
        }
    }

    /// Whether `v` lies inside the representable range of the type.
    #[inline]
    fn fits_f64(v: f64) -> bool {
        v.is_finite() && v >= Self::MIN.to_f64() && v <= Self::MAX.to_f64()
    }

    /// `init + Σ weights[i] * inputs[i]`, accumulated in order.
    #[inline]
    fn dot(weights: &[Self], inputs: &[Self], init: Self) -> Self {
        weights
            .iter()
            .zip(inputs)
            .fold(init, |acc, (&w, &x)| acc.sat_add(w.sat_mul(x)))
    }
}

/// Range-reduced polynomial `exp` used by integer activations.
///
/// `x = k·ln2 + r` with `|r| <= ln2/2`, degree-6 Taylor series in `r`, scaled by `2^k`.
/// Relative error stays below 2e-7 across the clamped domain.
pub fn poly_exp(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let x = x.clamp(-708.0, 709.0);
    let k = (x / std::f64::consts::LN_2).round();
    let r = x - k * std::f64::consts::LN_2;
    let p = 1.0
        + r * (1.0 + r * (1.0 / 2.0 + r * (1.0 / 6.0 + r * (1.0 / 24.0 + r * (1.0 / 120.0 + r / 720.0)))));
    p * 2f64.powi(k as i32)
}

macro_rules! impl_int_scalar {
    ($t:ident, $name:literal, $signed:expr, $bytes:expr, $gpu:expr) => {
        impl Scalar for $t {
            const TYPE_NAME: &'static str = $name;
            const IS_FLOAT: bool = false;
            const IS_SIGNED: bool = $signed;
            const BYTES: usize = $bytes;
            const GPU_EXACT: bool = $gpu;

            const ZERO: Self = 0;
            const ONE: Self = 1;
            const MIN: Self = <$t>::MIN;
            const MAX: Self = <$t>::MAX;

            #[inline]
            fn sat_add(self, rhs: Self) -> Self {
                self.saturating_add(rhs)
            }

            #[inline]
            fn sat_sub(self, rhs: Self) -> Self {
                self.saturating_sub(rhs)
            }

            #[inline]
            fn sat_mul(self, rhs: Self) -> Self {
                self.saturating_mul(rhs)
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                // `as` saturates and maps NaN to 0.
                v.round() as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn exp_f64(x: f64) -> f64 {
                poly_exp(x)
            }

            #[inline]
            fn to_bits(self) -> u64 {
                self as u64
            }

            fn write_le<W: Write>(self, w: &mut W) -> io::Result<()> {
                int_write_le!($t, self, w)
            }

            fn read_le<R: Read>(r: &mut R) -> io::Result<Self> {
                int_read_le!($t, r)
            }
        }
    };
}

macro_rules! int_write_le {
    (isize, $v:expr, $w:expr) => {
        $w.write_all(&($v as i64).to_le_bytes())
    };
    (usize, $v:expr, $w:expr) => {
        $w.write_all(&($v as u64).to_le_bytes())
    };
    ($t:ident, $v:expr, $w:expr) => {
        $w.write_all(&$v.to_le_bytes())
    };
}

macro_rules! int_read_le {
    (isize, $r:expr) => {{
        let mut buf = [0u8; 8];
        $r.read_exact(&mut buf)?;
        isize::try_from(i64::from_le_bytes(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "isize out of range"))
    }};
    (usize, $r:expr) => {{
        let mut buf = [0u8; 8];
        $r.read_exact(&mut buf)?;
        usize::try_from(u64::from_le_bytes(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "usize out of range"))
    }};
    ($t:ident, $r:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$t>()];
        $r.read_exact(&mut buf)?;
        Ok(<$t>::from_le_bytes(buf))
    }};
}

impl_int_scalar!(i8, "i8", true, 1, true);
impl_int_scalar!(i16, "i16", true, 2, true);
impl_int_scalar!(i32, "i32", true, 4, false);
impl_int_scalar!(i64, "i64", true, 8, false);
impl_int_scalar!(isize, "isize", true, 8, false);
impl_int_scalar!(u8, "u8", false, 1, true);
impl_int_scalar!(u16, "u16", false, 2, true);
impl_int_scalar!(u32, "u32", false, 4, false);
impl_int_scalar!(u64, "u64", false, 8, false);
impl_int_scalar!(usize, "usize", false, 8, false);

impl Scalar for f32 {
    const TYPE_NAME: &'static str = "f32";
    const IS_FLOAT: bool = true;
    const IS_SIGNED: bool = true;
    const BYTES: usize = 4;
    const GPU_EXACT: bool = true;

    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const MIN: Self = f32::MIN;
    const MAX: Self = f32::MAX;

    #[inline]
    fn sat_add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn sat_sub(self, rhs: Self) -> Self {
        self - rhs
    }

    #[inline]
    fn sat_mul(self, rhs: Self) -> Self {
        self * rhs
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn exp_f64(x: f64) -> f64 {
        x.exp()
    }

    #[inline]
    fn to_bits(self) -> u64 {
        f32::to_bits(self) as u64
    }

    fn write_le<W: Write>(self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_le<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    #[cfg(feature = "simd")]
    fn dot(weights: &[Self], inputs: &[Self], init: Self) -> Self {
        let n = weights.len().min(inputs.len());
        let lanes = n / 4 * 4;
        let mut acc = f32x4::ZERO;
        for j in (0..lanes).step_by(4) {
            let w = f32x4::new([weights[j], weights[j + 1], weights[j + 2], weights[j + 3]]);
            let x = f32x4::new([inputs[j], inputs[j + 1], inputs[j + 2], inputs[j + 3]]);
            acc += w * x;
        }
        let mut sum = init + acc.reduce_add();
        for j in lanes..n {
            sum += weights[j] * inputs[j];
        }
        sum
    }
}

impl Scalar for f64 {
    const TYPE_NAME: &'static str = "f64";
    const IS_FLOAT: bool = true;
    const IS_SIGNED: bool = true;
    const BYTES: usize = 8;
    const GPU_EXACT: bool = false;

    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const MIN: Self = f64::MIN;
    const MAX: Self = f64::MAX;

    #[inline]
    fn sat_add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn sat_sub(self, rhs: Self) -> Self {
        self - rhs
    }

    #[inline]
    fn sat_mul(self, rhs: Self) -> Self {
        self * rhs
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn exp_f64(x: f64) -> f64 {
        x.exp()
    }

    #[inline]
    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn write_le<W: Write>(self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_le<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
}
