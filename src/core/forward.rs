//! CPU forward pass, output extraction and loss.

use tracing::debug;

use crate::activation::{softmax_rows, Activation};
use crate::error::{NetError, Result};
use crate::grid::{Connection, Grid};
use crate::network::Network;
use crate::numeric::Scalar;
use crate::replay::ReplayPhase;

/// Floor applied to probabilities inside the cross-entropy log.
const LOG_FLOOR: f64 = 1e-15;

/// Restricts a pass to connections whose source column is `k mod total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag {
    total: usize,
    k: usize,
}

impl Tag {
    pub(crate) fn new(total: usize, k: usize) -> Result<Self> {
        if total == 0 || k >= total {
            return Err(NetError::config(format!(
                "tag {k} is not a partition of {total}"
            )));
        }
        Ok(Self { total, k })
    }

    #[inline]
    pub(crate) fn admits(self, column: u32) -> bool {
        column as usize % self.total == self.k
    }
}

/// Values standing in for layer `s - 1` while layer `s` is replayed.
pub(crate) struct InputOverride<T> {
    values: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Scalar> InputOverride<T> {
    fn of(grid: &Grid<T>) -> Self {
        Self {
            values: grid.values(),
            width: grid.width,
            height: grid.height,
        }
    }
}

#[inline]
fn source_value<T: Scalar>(
    earlier: &[Grid<T>],
    layer: usize,
    c: &Connection<T>,
    over: Option<&InputOverride<T>>,
) -> T {
    let src = c.src_layer as usize;
    let (x, y) = (c.src_x as usize, c.src_y as usize);
    if let Some(o) = over {
        if src + 1 == layer && x < o.width && y < o.height {
            return o.values[y * o.width + x];
        }
    }
    let g = &earlier[src];
    g.neurons[y * g.width + x].value
}

impl<T: Scalar> Network<T> {
    /// Run the input grid (`height` rows of `width` values) through every layer.
    pub fn forward(&mut self, input: &[Vec<f64>]) -> Result<()> {
        self.check_grid(0, input)?;
        self.softmax_applied = false;
        self.note_fallback();
        if self.try_gpu_forward(input) {
            return Ok(());
        }
        self.cpu_forward(input, None);
        Ok(())
    }

    /// Forward restricted to partition `k` of `total` (by source column).
    ///
    /// Always runs on the CPU.
    pub fn forward_tagged(&mut self, input: &[Vec<f64>], total: usize, k: usize) -> Result<()> {
        let tag = Tag::new(total, k)?;
        self.check_grid(0, input)?;
        self.softmax_applied = false;
        self.note_fallback();
        self.cpu_forward(input, Some(tag));
        Ok(())
    }

    pub(crate) fn cpu_forward(&mut self, input: &[Vec<f64>], tag: Option<Tag>) {
        self.ensure_host_weights();
        self.flush_dense();
        self.load_input(input);
        for l in 1..self.layers.len() {
            self.run_layer(l, tag);
        }
    }

    pub(crate) fn load_input(&mut self, input: &[Vec<f64>]) {
        let grid = &mut self.layers[0];
        for (n, v) in grid.neurons.iter_mut().zip(input.iter().flatten()) {
            n.value = T::from_f64(*v);
            n.sum = n.value;
        }
        grid.refresh_cache();
    }

    pub(crate) fn check_grid(&self, layer: usize, grid: &[Vec<f64>]) -> Result<()> {
        let expected = self.layers[layer].shape();
        let width = grid.first().map_or(0, Vec::len);
        if grid.len() != expected.1 || grid.iter().any(|row| row.len() != expected.0) {
            return Err(NetError::shape(expected, (width, grid.len())));
        }
        Ok(())
    }

    /// Evaluate layer `index`, driving its replay settings.
    pub(crate) fn run_layer(&mut self, index: usize, tag: Option<Tag>) {
        let last = self.layers.len() - 1;
        let cfg = &self.layers[index].replay;
        if !cfg.enabled || index == last {
            self.eval_layer(index, tag, None);
            return;
        }
        let Some(source) = cfg.source_layer(index) else {
            debug!("layer {}: replay offset {} out of range, skipped", index, cfg.offset);
            self.eval_layer(index, tag, None);
            return;
        };
        let phase = cfg.phase;
        let repeats = cfg.repeats(&self.layers[index].cached_outputs);
        if self.debug && repeats > 0 {
            debug!("layer {}: replaying layer {} x{} ({:?})", index, source, repeats, phase);
        }

        match phase {
            ReplayPhase::Before => {
                for _ in 0..repeats {
                    let over = InputOverride::of(&self.layers[source]);
                    self.eval_layer(source, tag, Some(&over));
                }
                self.eval_layer(index, tag, None);
            }
            ReplayPhase::After => {
                self.eval_layer(index, tag, None);
                for _ in 0..repeats {
                    let over = InputOverride::of(&self.layers[index]);
                    self.eval_layer(source, tag, Some(&over));
                    if source != index {
                        self.eval_layer(index, tag, None);
                    }
                }
            }
        }
    }

    /// One sweep over layer `l`. Neurons only read earlier layers.
    pub(crate) fn eval_layer(&mut self, l: usize, tag: Option<Tag>, over: Option<&InputOverride<T>>) {
        let (earlier, rest) = self.layers.split_at_mut(l);
        let grid = &mut rest[0];
        let act = grid.activation;
        let width = grid.width;
        let neurons = &mut grid.neurons;

        match grid.dense.as_ref() {
            Some(cache) if tag.is_none() && over.is_none() => {
                let inputs: Vec<T> = earlier[l - 1].neurons.iter().map(|n| n.value).collect();
                for (r, n) in neurons.iter_mut().enumerate() {
                    n.sum = T::dot(cache.row(r), &inputs, cache.biases()[r]);
                    n.value = act.apply(n.sum);
                }
            }
            _ => {
                for n in neurons.iter_mut() {
                    let mut sum = n.bias;
                    for c in &n.connections {
                        if tag.is_some_and(|t| !t.admits(c.src_x)) {
                            continue;
                        }
                        let v = source_value(earlier, l, c, over);
                        sum = sum.sat_add(c.weight.sat_mul(v));
                    }
                    n.sum = sum;
                    n.value = act.apply(sum);
                }
            }
        }

        if let Some(dim) = self.dimensions[l].as_mut() {
            dim.apply(neurons, act);
        }

        if act == Activation::Softmax {
            let mut values: Vec<T> = neurons.iter().map(|n| n.value).collect();
            softmax_rows(&mut values, width);
            for (n, v) in neurons.iter_mut().zip(values) {
                n.value = v;
            }
        }
        grid.refresh_cache();
        if self.debug {
            debug!("cpu dispatch: layer {} ({}x{})", l, width, grid.height);
        }
    }

    /// Row 0 of the output layer.
    pub fn output(&self) -> Vec<f64> {
        let grid = &self.layers[self.output_index()];
        grid.neurons[..grid.width]
            .iter()
            .map(|n| n.value.to_f64())
            .collect()
    }

    /// Every row of the output layer.
    pub fn output_grid(&self) -> Vec<Vec<f64>> {
        self.layers[self.output_index()].value_rows()
    }

    /// Normalise the output rows once per forward.
    ///
    /// A no-op when the output layer already uses softmax.
    pub fn apply_softmax(&mut self) {
        let out = self.output_index();
        if self.softmax_applied || self.layers[out].activation == Activation::Softmax {
            return;
        }
        let grid = &mut self.layers[out];
        let mut values = grid.values();
        softmax_rows(&mut values, grid.width);
        for (n, v) in grid.neurons.iter_mut().zip(values) {
            n.value = v;
        }
        grid.refresh_cache();
        self.softmax_applied = true;
    }

    /// Cross-entropy (per row, averaged) for a softmax output, mean squared error otherwise.
    pub fn compute_loss(&self, target: &[Vec<f64>]) -> Result<f64> {
        let out = self.output_index();
        self.check_grid(out, target)?;
        let grid = &self.layers[out];
        let pairs = grid
            .neurons
            .iter()
            .map(|n| n.value.to_f64())
            .zip(target.iter().flatten().copied());
        let loss = if grid.activation == Activation::Softmax {
            let ce: f64 = pairs.map(|(p, t)| -t * p.max(LOG_FLOOR).ln()).sum();
            ce / grid.height as f64
        } else {
            let se: f64 = pairs.map(|(v, t)| (v - t) * (v - t)).sum();
            se / grid.len() as f64
        };
        Ok(loss)
    }
}
