//! Layers as 2-D grids of neurons with explicit fan-in.

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::dense::DenseCache;
use crate::numeric::Scalar;
use crate::prng::Prng;
use crate::replay::ReplayConfig;

/// One incoming edge: the source neuron and its weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Connection<T> {
    pub src_layer: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub weight: T,
}

impl<T: Scalar> Connection<T> {
    pub fn new(src_layer: usize, src_x: usize, src_y: usize, weight: T) -> Self {
        Self {
            src_layer: src_layer as u32,
            src_x: src_x as u32,
            src_y: src_y as u32,
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Neuron<T> {
    pub value: T,
    /// Pre-activation sum of the last evaluation.
    pub sum: T,
    pub bias: T,
    /// Evaluated in order; the order is persisted.
    pub connections: Vec<Connection<T>>,
    pub(crate) error: f64,
}

impl<T: Scalar> Neuron<T> {
    pub fn new(bias: T, connections: Vec<Connection<T>>) -> Self {
        Self {
            value: T::ZERO,
            sum: T::ZERO,
            bias,
            connections,
            error: 0.0,
        }
    }

    /// Error signal from the last backward sweep.
    pub fn error(&self) -> f64 {
        self.error
    }
}

/// A `width × height` layer, row-major (`index = y * width + x`).
#[derive(Debug, Clone)]
pub struct Grid<T> {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) neurons: Vec<Neuron<T>>,
    pub(crate) activation: Activation,
    pub(crate) fully_connected: bool,
    pub(crate) replay: ReplayConfig,
    /// Values of the last evaluation, read by replay gates.
    pub(crate) cached_outputs: Vec<f64>,
    pub(crate) dense: Option<DenseCache<T>>,
}

impl<T: Scalar> Grid<T> {
    /// Input layer: no connections.
    pub(crate) fn input(width: usize, height: usize) -> Self {
        Self::from_neurons(
            width,
            height,
            Activation::Linear,
            true,
            (0..width * height).map(|_| Neuron::new(T::ZERO, Vec::new())).collect(),
        )
    }

    pub(crate) fn from_neurons(
        width: usize,
        height: usize,
        activation: Activation,
        fully_connected: bool,
        neurons: Vec<Neuron<T>>,
    ) -> Self {
        Self {
            width,
            height,
            cached_outputs: vec![0.0; neurons.len()],
            neurons,
            activation,
            fully_connected,
            replay: ReplayConfig::default(),
            dense: None,
        }
    }

    /// Hidden or output layer wired to the layer `index - 1` of shape `prev`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn connected(
        index: usize,
        width: usize,
        height: usize,
        activation: Activation,
        fully_connected: bool,
        prev: (usize, usize),
        radius: usize,
        rng: &mut Prng,
    ) -> Self {
        let src = index - 1;
        let mut neurons = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let sources = if fully_connected {
                    dense_sources(prev)
                } else {
                    sparse_sources((x, y), (width, height), prev, radius)
                };
                let fan_in = sources.len();
                let connections = sources
                    .into_iter()
                    .map(|(sx, sy)| Connection::new(src, sx, sy, init_weight::<T>(fan_in, rng)))
                    .collect();
                neurons.push(Neuron::new(T::ZERO, connections));
            }
        }
        Self::from_neurons(width, height, activation, fully_connected, neurons)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn is_fully_connected(&self) -> bool {
        self.fully_connected
    }

    pub fn replay(&self) -> &ReplayConfig {
        &self.replay
    }

    pub fn neurons(&self) -> &[Neuron<T>] {
        &self.neurons
    }

    pub fn neuron(&self, x: usize, y: usize) -> Option<&Neuron<T>> {
        if x < self.width && y < self.height {
            self.neurons.get(y * self.width + x)
        } else {
            None
        }
    }

    pub fn cached_outputs(&self) -> &[f64] {
        &self.cached_outputs
    }

    pub fn values(&self) -> Vec<T> {
        self.neurons.iter().map(|n| n.value).collect()
    }

    /// Values as rows of f64.
    pub fn value_rows(&self) -> Vec<Vec<f64>> {
        self.neurons
            .chunks(self.width.max(1))
            .map(|row| row.iter().map(|n| n.value.to_f64()).collect())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.neurons.iter().map(|n| n.connections.len()).sum()
    }

    /// True when every neuron reads the whole layer `index - 1` in row-major order.
    ///
    /// Baking and the GPU path both require this.
    pub fn is_canonical_dense(&self, index: usize, prev: (usize, usize)) -> bool {
        if index == 0 {
            return false;
        }
        let src = (index - 1) as u32;
        let cols = prev.0 * prev.1;
        self.neurons.iter().all(|n| {
            n.connections.len() == cols
                && n.connections.iter().enumerate().all(|(j, c)| {
                    c.src_layer == src
                        && c.src_x as usize == j % prev.0
                        && c.src_y as usize == j / prev.0
                })
        })
    }

    pub(crate) fn refresh_cache(&mut self) {
        self.cached_outputs.clear();
        self.cached_outputs
            .extend(self.neurons.iter().map(|n| n.value.to_f64()));
    }
}

/// Every position of `prev` in row-major order.
fn dense_sources(prev: (usize, usize)) -> Vec<(usize, usize)> {
    let (pw, ph) = prev;
    (0..ph).flat_map(|y| (0..pw).map(move |x| (x, y))).collect()
}

/// Chebyshev window of `radius` around the projected centre of `(x, y)` in `prev`.
fn sparse_sources(
    (x, y): (usize, usize),
    (w, h): (usize, usize),
    (pw, ph): (usize, usize),
    radius: usize,
) -> Vec<(usize, usize)> {
    let cx = x * pw / w;
    let cy = y * ph / h;
    let x0 = cx.saturating_sub(radius);
    let y0 = cy.saturating_sub(radius);
    let x1 = (cx + radius).min(pw - 1);
    let y1 = (cy + radius).min(ph - 1);
    (y0..=y1).flat_map(|sy| (x0..=x1).map(move |sx| (sx, sy))).collect()
}

/// Largest magnitude drawn for integer weights before fan-in scaling.
const INT_INIT_SCALE: f64 = 16.0;

pub(crate) fn init_weight<T: Scalar>(fan_in: usize, rng: &mut Prng) -> T {
    let fan = fan_in.max(1) as f64;
    if T::IS_FLOAT {
        let limit = 1.0 / fan.sqrt();
        return T::from_f64(rng.gen_range_f64(-limit, limit));
    }
    let scale = T::MAX.to_f64().sqrt().min(INT_INIT_SCALE);
    let r = ((scale / fan.sqrt()).round() as usize).max(1);
    let draw = rng.gen_range_usize(0, 2 * r + 1) as f64;
    if T::IS_SIGNED {
        T::from_f64(draw - r as f64)
    } else {
        T::from_f64((draw / 2.0).floor())
    }
}
