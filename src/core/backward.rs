//! CPU backward pass.
//!
//! Errors are swept from the output down to the input layer first; deltas are
//! then computed from the pre-update weights and applied in one go.

use crate::activation::Activation;
use crate::error::{NetError, Result};
use crate::forward::Tag;
use crate::network::Network;
use crate::numeric::Scalar;

/// Per-update clip bounds in `T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRange<T> {
    pub lower: T,
    pub upper: T,
}

impl<T: Scalar> ClipRange<T> {
    /// Bounds given as f64; values outside `T` are a [`NetError::NumericOverflow`].
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        if lower > upper {
            return Err(NetError::config(format!(
                "clip lower bound {lower} exceeds upper bound {upper}"
            )));
        }
        for v in [lower, upper] {
            if !T::fits_f64(v) {
                return Err(NetError::NumericOverflow(format!(
                    "clip bound {v} does not fit {}",
                    T::TYPE_NAME
                )));
            }
        }
        Ok(Self {
            lower: T::from_f64(lower),
            upper: T::from_f64(upper),
        })
    }

    pub(crate) fn from_scalars(upper: T, lower: T) -> Result<Self> {
        if lower > upper {
            return Err(NetError::config(format!(
                "clip lower bound {lower} exceeds upper bound {upper}"
            )));
        }
        Ok(Self { lower, upper })
    }

    #[inline]
    fn delta(&self, v: f64) -> T {
        T::from_f64(v).clip(self.lower, self.upper)
    }
}

impl<T: Scalar> Network<T> {
    /// One gradient step towards `target` (shape of the output layer).
    pub fn backward(&mut self, target: &[Vec<f64>], lr: f64, clip_upper: T, clip_lower: T) -> Result<()> {
        let clip = ClipRange::from_scalars(clip_upper, clip_lower)?;
        self.check_grid(self.output_index(), target)?;
        self.note_fallback();
        if self.try_gpu_backward(target, lr, clip) {
            return Ok(());
        }
        self.cpu_backward(target, lr, clip, None);
        Ok(())
    }

    /// Backward restricted to partition `k` of `total`.
    ///
    /// Weight updates only touch connections whose source column is in the
    /// partition; bias updates only touch neurons whose own column is.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_tagged(
        &mut self,
        target: &[Vec<f64>],
        lr: f64,
        total: usize,
        k: usize,
        clip_upper: T,
        clip_lower: T,
    ) -> Result<()> {
        let tag = Tag::new(total, k)?;
        let clip = ClipRange::from_scalars(clip_upper, clip_lower)?;
        self.check_grid(self.output_index(), target)?;
        self.note_fallback();
        self.cpu_backward(target, lr, clip, Some(tag));
        Ok(())
    }

    pub(crate) fn cpu_backward(&mut self, target: &[Vec<f64>], lr: f64, clip: ClipRange<T>, tag: Option<Tag>) {
        self.ensure_host_weights();
        self.flush_dense();
        self.seed_output_error(target);
        self.sweep_errors(tag);
        self.apply_updates(lr, clip, tag);
        self.mark_device_stale();
    }

    /// `value - target`, times `f'(sum)` unless the output is softmax or linear.
    pub(crate) fn seed_output_error(&mut self, target: &[Vec<f64>]) {
        let out = self.output_index();
        let diffs: Vec<f64> = self.layers[out]
            .neurons
            .iter()
            .zip(target.iter().flatten())
            .map(|(n, t)| n.value.to_f64() - t)
            .collect();
        self.seed_output_delta(&diffs);
    }

    /// Seed the output errors from `dL/dvalue`, one per output neuron.
    pub(crate) fn seed_output_delta(&mut self, diffs: &[f64]) {
        let out = self.output_index();
        let grid = &mut self.layers[out];
        let act = grid.activation;
        for (n, &diff) in grid.neurons.iter_mut().zip(diffs) {
            n.error = match act {
                Activation::Softmax | Activation::Linear => diff,
                _ => diff * act.derivative::<T>(n.sum.to_f64(), n.value.to_f64()),
            };
        }
    }

    /// Propagate output errors to every earlier layer, including the input.
    ///
    /// Input-layer errors are raw `Σ w·err` (no derivative); reverse inference
    /// reads them as the input gradient.
    pub(crate) fn sweep_errors(&mut self, tag: Option<Tag>) {
        let out = self.output_index();
        for grid in &mut self.layers[..out] {
            for n in &mut grid.neurons {
                n.error = 0.0;
            }
        }
        for l in (1..=out).rev() {
            let (earlier, rest) = self.layers.split_at_mut(l);
            let grid = &mut rest[0];
            if l != out {
                let act = grid.activation;
                for n in &mut grid.neurons {
                    n.error *= act.derivative::<T>(n.sum.to_f64(), n.value.to_f64());
                }
            }
            if let Some(dim) = self.dimensions[l].as_mut() {
                dim.chain(&mut grid.neurons);
            }
            for n in &grid.neurons {
                if n.error == 0.0 {
                    continue;
                }
                for c in &n.connections {
                    if tag.is_some_and(|t| !t.admits(c.src_x)) {
                        continue;
                    }
                    let src = &mut earlier[c.src_layer as usize];
                    let idx = c.src_y as usize * src.width + c.src_x as usize;
                    src.neurons[idx].error += c.weight.to_f64() * n.error;
                }
            }
        }
    }

    pub(crate) fn apply_updates(&mut self, lr: f64, clip: ClipRange<T>, tag: Option<Tag>) {
        for l in 1..self.layers.len() {
            let (earlier, rest) = self.layers.split_at_mut(l);
            let grid = &mut rest[0];
            let width = grid.width;
            for (r, n) in grid.neurons.iter_mut().enumerate() {
                let err = n.error;
                if err == 0.0 {
                    continue;
                }
                let own_column = (r % width) as u32;
                if tag.map_or(true, |t| t.admits(own_column)) {
                    n.bias = n.bias.sat_add(clip.delta(-lr * err));
                    if let Some(cache) = grid.dense.as_mut() {
                        cache.mirror_bias(r, n.bias);
                    }
                }
                for (ci, c) in n.connections.iter_mut().enumerate() {
                    if tag.is_some_and(|t| !t.admits(c.src_x)) {
                        continue;
                    }
                    let src = &earlier[c.src_layer as usize];
                    let v = src.neurons[c.src_y as usize * src.width + c.src_x as usize]
                        .value
                        .to_f64();
                    c.weight = c.weight.sat_add(clip.delta(-lr * err * v));
                    if let Some(cache) = grid.dense.as_mut() {
                        cache.mirror_weight(r, ci, c.weight);
                    }
                }
            }
        }

        for (grid, dim) in self.layers.iter().zip(self.dimensions.iter_mut()) {
            if let Some(dim) = dim {
                let width = grid.width;
                dim.update(lr, clip, |r| tag.map_or(true, |t| t.admits((r % width) as u32)));
            }
        }
    }

    /// Gradient of the loss with respect to the input grid for the last forward.
    ///
    /// Weights are left untouched.
    pub fn input_gradient(&mut self, target: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.check_grid(self.output_index(), target)?;
        self.ensure_host_weights();
        self.flush_dense();
        self.seed_output_error(target);
        self.sweep_errors(None);
        let input = &self.layers[0];
        Ok(input
            .neurons
            .chunks(input.width)
            .map(|row| row.iter().map(|n| n.error).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(act: Activation) -> Network<f64> {
        let mut n = Network::create(
            &[(2, 1), (1, 1)],
            &[Activation::Linear, act],
            &[true, true],
            Some(1),
        )
        .unwrap();
        n.set_weight(1, 0, 0, 0, 0.5).unwrap();
        n.set_weight(1, 0, 0, 1, -0.25).unwrap();
        n
    }

    #[test]
    fn linear_step_matches_hand_gradient() {
        let mut n = single(Activation::Linear);
        n.forward(&[vec![1.0, 2.0]]).unwrap();
        // value 0.0, target 1.0, err -1.0
        n.backward(&[vec![1.0]], 0.1, 10.0, -10.0).unwrap();
        assert!((n.weight(1, 0, 0, 0).unwrap() - 0.6).abs() < 1e-12);
        assert!((n.weight(1, 0, 0, 1).unwrap() - (-0.05)).abs() < 1e-12);
        assert!((n.layers()[1].neurons()[0].bias - 0.1).abs() < 1e-12);
    }

    #[test]
    fn deltas_are_clipped() {
        let mut n = single(Activation::Linear);
        n.forward(&[vec![1.0, 2.0]]).unwrap();
        n.backward(&[vec![100.0]], 1.0, 0.5, -0.5).unwrap();
        assert!((n.weight(1, 0, 0, 0).unwrap() - 1.0).abs() < 1e-12);
        assert!((n.weight(1, 0, 0, 1).unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn inverted_clip_is_config_invalid() {
        let mut n = single(Activation::Linear);
        n.forward(&[vec![1.0, 2.0]]).unwrap();
        let r = n.backward(&[vec![1.0]], 0.1, -1.0, 1.0);
        assert!(matches!(r, Err(NetError::ConfigInvalid(_))));
        assert_eq!(n.weight(1, 0, 0, 0), Some(0.5));
    }

    #[test]
    fn clip_range_checks_scalar_bounds() {
        assert!(ClipRange::<i8>::new(-1.0, 1.0).is_ok());
        assert!(matches!(ClipRange::<i8>::new(-1.0, 300.0), Err(NetError::NumericOverflow(_))));
        assert!(matches!(ClipRange::<u8>::new(-1.0, 1.0), Err(NetError::NumericOverflow(_))));
        assert!(matches!(ClipRange::<f32>::new(1.0, -1.0), Err(NetError::ConfigInvalid(_))));
    }

    #[test]
    fn sigmoid_output_uses_derivative() {
        let mut n = single(Activation::Sigmoid);
        n.set_weight(1, 0, 0, 0, 0.0).unwrap();
        n.set_weight(1, 0, 0, 1, 0.0).unwrap();
        n.forward(&[vec![1.0, 0.0]]).unwrap();
        // s = 0.5, err = (0.5 - 1) * 0.25
        n.backward(&[vec![1.0]], 1.0, 1.0, -1.0).unwrap();
        assert!((n.weight(1, 0, 0, 0).unwrap() - 0.125).abs() < 1e-12);
        assert_eq!(n.weight(1, 0, 0, 1), Some(0.0));
    }

    #[test]
    fn hidden_errors_use_pre_update_weights() {
        let mut n = Network::<f64>::create(
            &[(1, 1), (1, 1), (1, 1)],
            &[Activation::Linear; 3],
            &[true; 3],
            Some(1),
        )
        .unwrap();
        n.set_weight(1, 0, 0, 0, 1.0).unwrap();
        n.set_weight(2, 0, 0, 0, 2.0).unwrap();
        n.forward(&[vec![1.0]]).unwrap();
        // out = 2, target 0: err_out 2, err_hidden = 2 * 2 = 4
        n.backward(&[vec![0.0]], 0.1, 10.0, -10.0).unwrap();
        assert!((n.weight(2, 0, 0, 0).unwrap() - (2.0 - 0.2)).abs() < 1e-12);
        assert!((n.weight(1, 0, 0, 0).unwrap() - (1.0 - 0.4)).abs() < 1e-12);
    }

    #[test]
    fn tagged_backward_touches_only_its_partition() {
        let mut n = Network::<f64>::create(
            &[(4, 1), (2, 1)],
            &[Activation::Linear, Activation::Linear],
            &[true, true],
            Some(5),
        )
        .unwrap();
        let before = n.clone();
        let input = [vec![1.0, 1.0, 1.0, 1.0]];
        n.forward_tagged(&input, 2, 1).unwrap();
        n.backward_tagged(&[vec![5.0, -5.0]], 0.1, 2, 1, 1.0, -1.0).unwrap();
        for x in 0..2 {
            for c in 0..4 {
                let changed = n.weight(1, x, 0, c) != before.weight(1, x, 0, c);
                assert_eq!(changed, c % 2 == 1, "neuron {x} conn {c}");
            }
        }
        assert_eq!(n.layers()[1].neurons()[0].bias, before.layers()[1].neurons()[0].bias);
        assert_ne!(n.layers()[1].neurons()[1].bias, before.layers()[1].neurons()[1].bias);
    }

    #[test]
    fn integer_updates_saturate() {
        let mut n = Network::<i8>::create(
            &[(1, 1), (1, 1)],
            &[Activation::Linear, Activation::Linear],
            &[true, true],
            Some(1),
        )
        .unwrap();
        n.set_weight(1, 0, 0, 0, 120).unwrap();
        n.forward(&[vec![1.0]]).unwrap();
        // err = 120 - 200, delta clipped to 10, 120 + 10 saturates
        n.backward(&[vec![200.0]], 1.0, 10, -10).unwrap();
        assert_eq!(n.weight(1, 0, 0, 0), Some(i8::MAX));
        assert_eq!(n.layers()[1].neurons()[0].bias, 10);
    }

    #[test]
    fn input_gradient_is_weight_times_error() {
        let mut n = single(Activation::Linear);
        n.forward(&[vec![1.0, 2.0]]).unwrap();
        let g = n.input_gradient(&[vec![1.0]]).unwrap();
        assert_eq!(g, vec![vec![-0.5, 0.25]]);
        assert_eq!(n.weight(1, 0, 0, 0), Some(0.5));
    }
}
