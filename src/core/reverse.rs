//! Reverse inference: recovering an input grid from an output grid.
//!
//! The exact paths need a square chain (every layer fully connected and as
//! wide as the input). The iterative path works on any topology.

use tracing::debug;

use crate::error::{NetError, Result};
use crate::network::Network;
use crate::numeric::Scalar;

/// Pivots below this are treated as singular.
pub const PIVOT_EPSILON: f64 = 1e-12;

/// Momentum SGD settings for [`Network::reverse_iterative`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeInverse {
    pub steps: usize,
    pub step_size: f64,
    pub momentum: f64,
    pub restarts: usize,
    /// Stop as soon as `‖forward(x) - target‖²` drops below this.
    pub epsilon: f64,
}

impl IterativeInverse {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            step_size: 0.05,
            momentum: 0.9,
            restarts: 4,
            epsilon: 1e-6,
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_restarts(mut self, restarts: usize) -> Self {
        self.restarts = restarts;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(NetError::config(format!("step size {} must be positive", self.step_size)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(NetError::config(format!("momentum {} must be in [0, 1)", self.momentum)));
        }
        if self.restarts == 0 {
            return Err(NetError::config("at least one restart is required"));
        }
        Ok(())
    }
}

/// Best candidate found by [`Network::reverse_iterative`].
#[derive(Debug, Clone, PartialEq)]
pub struct InverseResult {
    pub input: Vec<Vec<f64>>,
    /// `‖forward(input) - target‖²`
    pub loss: f64,
    pub converged: bool,
}

/// Solve `a · x = b` for a row-major `n × n` matrix by LU with partial pivoting.
fn lu_solve(mut a: Vec<f64>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i * n + col].abs().total_cmp(&a[j * n + col].abs()))
            .unwrap_or(col);
        let p = a[pivot * n + col];
        if !(p.abs() >= PIVOT_EPSILON) {
            return Err(NetError::InverseInfeasible(format!(
                "singular weight matrix (pivot {p:e} in column {col})"
            )));
        }
        if pivot != col {
            for k in 0..n {
                a.swap(col * n + k, pivot * n + k);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let f = a[row * n + col] / p;
            if f == 0.0 {
                continue;
            }
            for k in col..n {
                a[row * n + k] -= f * a[col * n + k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row * n + k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row * n + row];
    }
    Ok(x)
}

impl<T: Scalar> Network<T> {
    /// Every non-input layer is canonical dense and as large as the input.
    fn check_square_chain(&self, linear_only: bool) -> Result<()> {
        let n = self.layers[0].len();
        for l in 1..self.layers.len() {
            let g = &self.layers[l];
            if !g.fully_connected || !g.is_canonical_dense(l, self.layers[l - 1].shape()) {
                return Err(NetError::InverseInfeasible(format!("layer {l} is not fully connected")));
            }
            if g.len() != n {
                return Err(NetError::InverseInfeasible(format!(
                    "layer {l} has {} neurons, input has {n}",
                    g.len()
                )));
            }
            if g.replay.enabled {
                return Err(NetError::InverseInfeasible(format!("layer {l} replays")));
            }
            if self.dimensions[l].is_some() {
                return Err(NetError::InverseInfeasible(format!("layer {l} has sub-networks")));
            }
            if linear_only && g.activation != crate::activation::Activation::Linear {
                return Err(NetError::InverseInfeasible(format!(
                    "layer {l} uses {} activation",
                    g.activation
                )));
            }
        }
        Ok(())
    }

    fn solve_chain(&mut self, output: &[Vec<f64>], invert_activation: bool) -> Result<Vec<Vec<f64>>> {
        self.check_grid(self.output_index(), output)?;
        self.check_square_chain(!invert_activation)?;
        self.ensure_host_weights();
        self.flush_dense();

        let mut y: Vec<f64> = output.iter().flatten().copied().collect();
        for l in (1..self.layers.len()).rev() {
            let g = &self.layers[l];
            if invert_activation {
                for v in &mut y {
                    *v = g.activation.inverse(*v);
                }
            }
            let matrix = g
                .neurons
                .iter()
                .flat_map(|n| n.connections.iter().map(|c| c.weight.to_f64()))
                .collect();
            let rhs = y.iter().zip(&g.neurons).map(|(v, n)| v - n.bias.to_f64()).collect();
            y = lu_solve(matrix, rhs)
                .map_err(|e| NetError::InverseInfeasible(format!("layer {l}: {e}")))?;
        }
        let width = self.layers[0].width;
        Ok(y.chunks(width).map(<[f64]>::to_vec).collect())
    }

    /// Invert a linear square chain by solving `W·x = y - b` per layer.
    pub fn reverse_exact(&mut self, output: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.solve_chain(output, false)
    }

    /// Like [`reverse_exact`](Network::reverse_exact), inverting each
    /// activation first. Values outside an activation's range are clamped.
    pub fn reverse_layer_by_layer(&mut self, output: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.solve_chain(output, true)
    }

    /// Search for an input whose forward pass matches `output`.
    ///
    /// Momentum SGD on the input grid, restarted from uniform `[0, 1)` inputs
    /// drawn from the network's generator. Returns the best candidate.
    pub fn reverse_iterative(&mut self, output: &[Vec<f64>], options: IterativeInverse) -> Result<InverseResult> {
        self.check_grid(self.output_index(), output)?;
        options.validate()?;
        let (w, h) = self.input_shape();
        let target: Vec<f64> = output.iter().flatten().copied().collect();

        let mut best = InverseResult {
            input: vec![vec![0.0; w]; h],
            loss: f64::INFINITY,
            converged: false,
        };
        for restart in 0..options.restarts {
            let mut x: Vec<Vec<f64>> = (0..h)
                .map(|_| (0..w).map(|_| self.rng.next_f64_01()).collect())
                .collect();
            let mut velocity = vec![vec![0.0; w]; h];
            for step in 0..=options.steps {
                self.forward(&x)?;
                let loss: f64 = self
                    .output_grid()
                    .iter()
                    .flatten()
                    .zip(&target)
                    .map(|(y, t)| (y - t) * (y - t))
                    .sum();
                if loss < best.loss {
                    best.input.clone_from(&x);
                    best.loss = loss;
                }
                if loss < options.epsilon {
                    best.converged = true;
                    debug!("inverse converged after {} restarts, {} steps: loss {:e}", restart, step, loss);
                    return Ok(best);
                }
                if step == options.steps {
                    break;
                }
                let grad = self.input_gradient(output)?;
                for ((xr, vr), gr) in x.iter_mut().zip(&mut velocity).zip(&grad) {
                    for ((xv, vv), g) in xr.iter_mut().zip(vr.iter_mut()).zip(gr) {
                        *vv = options.momentum * *vv - options.step_size * g;
                        *xv += *vv;
                    }
                }
            }
        }
        debug!("inverse kept best of {} restarts: loss {:e}", options.restarts, best.loss);
        Ok(best)
    }

    /// Nudge every weight and bias by `percent`% of its magnitude towards a
    /// lower error on one sample.
    ///
    /// Biases move against the neuron's error, weights against `error * source`.
    pub fn attribution_set(&mut self, input: &[Vec<f64>], target: &[Vec<f64>], percent: f64) -> Result<()> {
        if !(percent.is_finite() && percent >= 0.0) {
            return Err(NetError::config(format!("percent {percent} must be non-negative")));
        }
        self.check_grid(self.output_index(), target)?;
        self.forward(input)?;
        self.ensure_host_weights();
        self.flush_dense();
        self.seed_output_error(target);
        self.sweep_errors(None);

        let frac = percent / 100.0;
        let nudge = |v: T, direction: f64| -> T {
            if direction == 0.0 {
                return v;
            }
            let x = v.to_f64();
            T::from_f64(x + direction.signum() * x.abs() * frac)
        };
        for l in 1..self.layers.len() {
            let (earlier, rest) = self.layers.split_at_mut(l);
            let grid = &mut rest[0];
            for (r, n) in grid.neurons.iter_mut().enumerate() {
                let err = n.error;
                n.bias = nudge(n.bias, -err);
                for (ci, c) in n.connections.iter_mut().enumerate() {
                    let src = &earlier[c.src_layer as usize];
                    let v = src.neurons[c.src_y as usize * src.width + c.src_x as usize].value.to_f64();
                    c.weight = nudge(c.weight, -err * v);
                    if let Some(cache) = grid.dense.as_mut() {
                        cache.mirror_weight(r, ci, c.weight);
                    }
                }
                if let Some(cache) = grid.dense.as_mut() {
                    cache.mirror_bias(r, n.bias);
                }
            }
        }
        self.mark_device_stale();
        self.refresh_device();
        Ok(())
    }
}
