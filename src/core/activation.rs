use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::numeric::Scalar;

/// Slope of the negative branch of `leaky_relu`.
pub const LEAKY_SLOPE: f64 = 0.01;

/// Per-neuron non-linearity. Serialized by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Elu,
    /// Row-wise normalisation, applied after the per-neuron sweep.
    Softmax,
}

impl Activation {
    pub const ALL: [Activation; 7] = [
        Activation::Linear,
        Activation::Relu,
        Activation::LeakyRelu,
        Activation::Sigmoid,
        Activation::Tanh,
        Activation::Elu,
        Activation::Softmax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leaky_relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Elu => "elu",
            Activation::Softmax => "softmax",
        }
    }

    /// Shader selector used by the GPU backend.
    pub fn code(self) -> u32 {
        match self {
            Activation::Linear => 0,
            Activation::Relu => 1,
            Activation::LeakyRelu => 2,
            Activation::Sigmoid => 3,
            Activation::Tanh => 4,
            Activation::Elu => 5,
            Activation::Softmax => 6,
        }
    }

    /// Apply to a pre-activation sum of type `T`.
    ///
    /// Softmax is the identity here; [`softmax_rows`] finishes it per row.
    /// Integer `leaky_relu` uses `round(x / 100)` on the negative branch.
    #[inline]
    pub fn apply<T: Scalar>(self, sum: T) -> T {
        match self {
            Activation::Linear | Activation::Softmax => sum,
            Activation::Relu => {
                if sum > T::ZERO {
                    sum
                } else {
                    T::ZERO
                }
            }
            Activation::LeakyRelu => {
                if sum > T::ZERO {
                    sum
                } else {
                    T::from_f64(sum.to_f64() * LEAKY_SLOPE)
                }
            }
            _ => T::from_f64(self.apply_f64::<T>(sum.to_f64())),
        }
    }

    /// Forward in f64, using the exp flavour of `T`.
    pub fn apply_f64<T: Scalar>(self, x: f64) -> f64 {
        match self {
            Activation::Linear | Activation::Softmax => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    x * LEAKY_SLOPE
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + T::exp_f64(-x)),
            Activation::Tanh => {
                if T::IS_FLOAT {
                    x.tanh()
                } else {
                    let e = T::exp_f64(2.0 * x);
                    if e.is_infinite() {
                        1.0
                    } else {
                        (e - 1.0) / (e + 1.0)
                    }
                }
            }
            Activation::Elu => {
                if x >= 0.0 {
                    x
                } else {
                    T::exp_f64(x) - 1.0
                }
            }
        }
    }

    /// Derivative with respect to the pre-activation `sum`.
    ///
    /// `value` is the neuron's activated output; sigmoid, tanh and softmax use it.
    pub fn derivative<T: Scalar>(self, sum: f64, value: f64) -> f64 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if sum > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if sum > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            Activation::Sigmoid | Activation::Softmax => value * (1.0 - value),
            Activation::Tanh => {
                let t = self.apply_f64::<T>(sum);
                1.0 - t * t
            }
            Activation::Elu => {
                if sum >= 0.0 {
                    1.0
                } else {
                    T::exp_f64(sum)
                }
            }
        }
    }

    /// Pre-activation that produces `y`, clamped into the invertible domain.
    ///
    /// Flat regions (relu below zero) map to zero.
    pub fn inverse(self, y: f64) -> f64 {
        const EPS: f64 = 1e-12;
        match self {
            Activation::Linear => y,
            Activation::Relu => y.max(0.0),
            Activation::LeakyRelu => {
                if y > 0.0 {
                    y
                } else {
                    y / LEAKY_SLOPE
                }
            }
            Activation::Sigmoid => {
                let p = y.clamp(EPS, 1.0 - EPS);
                (p / (1.0 - p)).ln()
            }
            Activation::Tanh => y.clamp(-1.0 + EPS, 1.0 - EPS).atanh(),
            Activation::Elu => {
                if y >= 0.0 {
                    y
                } else {
                    (y.max(-1.0 + EPS) + 1.0).ln()
                }
            }
            Activation::Softmax => y.max(EPS).ln(),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Activation::ALL
            .iter()
            .copied()
            .find(|a| a.name() == s)
            .ok_or_else(|| NetError::config(format!("unknown activation `{s}`")))
    }
}

/// Numerically stable softmax of one row, in f64.
pub fn softmax(row: &[f64]) -> Vec<f64> {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let n = row.len().max(1) as f64;
        return vec![1.0 / n; row.len()];
    }
    let exps: Vec<f64> = row.iter().map(|&v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Normalise each row of a row-major `width × height` buffer in place.
///
/// Values are lifted to f64 regardless of `T` and cast back afterwards.
pub fn softmax_rows<T: Scalar>(values: &mut [T], width: usize) {
    if width == 0 {
        return;
    }
    for row in values.chunks_mut(width) {
        let lifted: Vec<f64> = row.iter().map(|v| v.to_f64()).collect();
        for (dst, p) in row.iter_mut().zip(softmax(&lifted)) {
            *dst = T::from_f64(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for a in Activation::ALL {
            assert_eq!(a.name().parse::<Activation>().unwrap(), a);
        }
        assert!("swish".parse::<Activation>().is_err());
        let json = serde_json::to_string(&Activation::LeakyRelu).unwrap();
        assert_eq!(json, "\"leaky_relu\"");
    }

    #[test]
    fn float_forward_matches_table() {
        assert_eq!(Activation::Relu.apply(-2.0f32), 0.0);
        assert_eq!(Activation::Relu.apply(2.0f32), 2.0);
        assert!((Activation::LeakyRelu.apply(-2.0f64) + 0.02).abs() < 1e-12);
        assert!((Activation::Sigmoid.apply(0.0f64) - 0.5).abs() < 1e-12);
        assert!((Activation::Tanh.apply(1.0f64) - 1.0f64.tanh()).abs() < 1e-12);
        assert!((Activation::Elu.apply(-1.0f64) - ((-1.0f64).exp() - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn integer_leaky_uses_hundredth_rounding() {
        assert_eq!(Activation::LeakyRelu.apply(-250i32), -3);
        assert_eq!(Activation::LeakyRelu.apply(-49i32), 0);
        assert_eq!(Activation::LeakyRelu.apply(i8::MIN), -1);
        assert_eq!(Activation::LeakyRelu.apply(17u8), 17);
    }

    #[test]
    fn integer_exp_activations_stay_in_range() {
        for x in [i16::MIN, -300, -1, 0, 1, 300, i16::MAX] {
            let s = Activation::Sigmoid.apply(x);
            assert!((0..=1).contains(&s));
            let t = Activation::Tanh.apply(x);
            assert!((-1..=1).contains(&t));
            let e = Activation::Elu.apply(x);
            assert!(e >= -1);
        }
    }

    #[test]
    fn derivatives_match_table() {
        assert_eq!(Activation::Linear.derivative::<f64>(3.0, 3.0), 1.0);
        assert_eq!(Activation::Relu.derivative::<f64>(-1.0, 0.0), 0.0);
        assert_eq!(Activation::LeakyRelu.derivative::<f64>(-1.0, -0.01), LEAKY_SLOPE);
        assert!((Activation::Sigmoid.derivative::<f64>(0.0, 0.5) - 0.25).abs() < 1e-12);
        assert!((Activation::Tanh.derivative::<f64>(0.0, 0.0) - 1.0).abs() < 1e-12);
        assert!((Activation::Elu.derivative::<f64>(-1.0, 0.0) - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn inverse_undoes_forward() {
        for a in [
            Activation::Linear,
            Activation::LeakyRelu,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Elu,
        ] {
            for x in [-1.5, -0.2, 0.3, 1.1] {
                let y = a.apply_f64::<f64>(x);
                assert!((a.inverse(y) - x).abs() < 1e-9, "{a} at {x}");
            }
        }
    }

    #[test]
    fn softmax_rows_normalise_each_row() {
        let mut v = vec![1.0f32, 2.0, 3.0, 0.0, 0.0, 0.0];
        softmax_rows(&mut v, 3);
        let r0: f32 = v[..3].iter().sum();
        let r1: f32 = v[3..].iter().sum();
        assert!((r0 - 1.0).abs() < 1e-6);
        assert!((r1 - 1.0).abs() < 1e-6);
        assert!((v[3] - 1.0 / 3.0).abs() < 1e-6);
    }
}
