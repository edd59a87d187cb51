//! The network façade: construction, accessors, replay settings and weight leases.

use std::fmt;
use std::ops::{Deref, DerefMut};

use tracing::debug;

use crate::activation::Activation;
use crate::backend::{Backend, BackendState};
use crate::config::{LayerSpec, NetworkConfig, DEFAULT_SPARSE_RADIUS};
use crate::dimension::LayerDimension;
use crate::error::{NetError, Result};
use crate::eval::Performance;
use crate::grid::{Grid, Neuron};
use crate::numeric::Scalar;
use crate::prng::{Prng, DEFAULT_SEED};
use crate::replay::ReplayConfig;

/// A feed-forward network of 2-D layers over scalar type `T`.
///
/// Layer 0 is the input, the last layer is the output. Connections only read
/// from earlier layers.
pub struct Network<T: Scalar> {
    pub(crate) layers: Vec<Grid<T>>,
    /// Sub-networks per layer, `None` for plain layers.
    pub(crate) dimensions: Vec<Option<LayerDimension<T>>>,
    pub(crate) rng: Prng,
    pub(crate) sparse_radius: usize,
    pub(crate) performance: Option<Performance>,
    pub(crate) state: BackendState,
    pub(crate) fallback_reason: Option<String>,
    pub(crate) debug: bool,
    pub(crate) baked: bool,
    pub(crate) softmax_applied: bool,
    /// Device weights are newer than the connections.
    pub(crate) host_stale: bool,
    /// Connections are newer than the device weights.
    pub(crate) device_stale: bool,
    #[cfg(feature = "gpu")]
    pub(crate) gpu: Option<crate::gpu::GpuNetwork>,
}

impl<T: Scalar> Network<T> {
    /// Build from parallel per-layer slices.
    ///
    /// `seed = None` uses the default seed, so construction is always reproducible.
    pub fn create(
        shapes: &[(usize, usize)],
        activations: &[Activation],
        fully_connected: &[bool],
        seed: Option<u64>,
    ) -> Result<Self> {
        if shapes.len() != activations.len() || shapes.len() != fully_connected.len() {
            return Err(NetError::config(format!(
                "{} shapes, {} activations and {} connectivity flags",
                shapes.len(),
                activations.len(),
                fully_connected.len()
            )));
        }
        let layers = shapes
            .iter()
            .zip(activations)
            .zip(fully_connected)
            .map(|((&(w, h), &act), &fc)| {
                let spec = LayerSpec::new(w, h, act);
                if fc {
                    spec
                } else {
                    spec.sparse()
                }
            })
            .collect();
        let mut config = NetworkConfig::new(layers);
        config.seed = seed;
        Self::new(config)
    }

    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = Prng::new(config.seed.unwrap_or(DEFAULT_SEED));
        let mut layers: Vec<Grid<T>> = Vec::with_capacity(config.layers.len());
        for (i, spec) in config.layers.iter().enumerate() {
            let mut grid = if i == 0 {
                let mut g = Grid::input(spec.width, spec.height);
                g.activation = spec.activation;
                g.fully_connected = spec.fully_connected;
                g
            } else {
                let prev = layers[i - 1].shape();
                Grid::connected(
                    i,
                    spec.width,
                    spec.height,
                    spec.activation,
                    spec.fully_connected,
                    prev,
                    config.sparse_radius,
                    &mut rng,
                )
            };
            grid.replay = ReplayConfig::from_spec(&spec.replay);
            layers.push(grid);
        }

        let mut net = Self::from_layers(layers, rng);
        net.sparse_radius = config.sparse_radius;
        net.debug = config.debug;
        for (i, spec) in config.layers.iter().enumerate() {
            if let Some(dim) = &spec.dimension {
                let shapes: Vec<_> = dim.layers.iter().map(|l| (l.width, l.height)).collect();
                let acts: Vec<_> = dim.layers.iter().map(|l| l.activation).collect();
                let fc: Vec<_> = dim.layers.iter().map(|l| l.fully_connected).collect();
                net.set_layer_dimension(i, &shapes, &acts, &fc, dim.options())?;
            }
        }
        debug!(
            "created {} network with {} layers ({} connections)",
            T::TYPE_NAME,
            net.layers.len(),
            net.connection_count()
        );
        if config.backend == Backend::Gpu {
            if let Err(e) = net.set_backend(Backend::Gpu) {
                debug!("GPU requested but unavailable: {}", e);
            }
        }
        Ok(net)
    }

    pub(crate) fn from_layers(layers: Vec<Grid<T>>, rng: Prng) -> Self {
        Self {
            dimensions: layers.iter().map(|_| None).collect(),
            layers,
            rng,
            sparse_radius: DEFAULT_SPARSE_RADIUS,
            performance: None,
            state: BackendState::CpuOnly,
            fallback_reason: None,
            debug: false,
            baked: false,
            softmax_applied: false,
            host_stale: false,
            device_stale: false,
            #[cfg(feature = "gpu")]
            gpu: None,
        }
    }

    pub fn layers(&self) -> &[Grid<T>] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Grid<T>> {
        self.layers.get(index)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn output_index(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn input_shape(&self) -> (usize, usize) {
        self.layers[0].shape()
    }

    pub fn output_shape(&self) -> (usize, usize) {
        self.layers[self.output_index()].shape()
    }

    pub fn scalar_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    pub fn connection_count(&self) -> usize {
        self.layers.iter().map(Grid::connection_count).sum()
    }

    pub fn sparse_radius(&self) -> usize {
        self.sparse_radius
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Record of the last [`evaluate`](Network::evaluate) call.
    pub fn performance(&self) -> Option<&Performance> {
        self.performance.as_ref()
    }

    pub fn rng_state(&self) -> u64 {
        self.rng.state()
    }

    /// Reseed the network's PRNG (used by shuffling and iterative inversion).
    pub fn reseed(&mut self, seed: u64) {
        self.rng = Prng::new(seed);
    }

    fn neuron_mut(&mut self, layer: usize, x: usize, y: usize) -> Result<&mut Neuron<T>> {
        if layer == 0 || layer >= self.layers.len() {
            return Err(NetError::config(format!("layer {layer} has no weights")));
        }
        let grid = &mut self.layers[layer];
        if x >= grid.width || y >= grid.height {
            return Err(NetError::config(format!(
                "({x},{y}) lies outside layer {layer} ({}x{})",
                grid.width, grid.height
            )));
        }
        let w = grid.width;
        Ok(&mut grid.neurons[y * w + x])
    }

    pub fn weight(&self, layer: usize, x: usize, y: usize, conn: usize) -> Option<T> {
        self.layers
            .get(layer)?
            .neuron(x, y)?
            .connections
            .get(conn)
            .map(|c| c.weight)
    }

    pub fn set_weight(&mut self, layer: usize, x: usize, y: usize, conn: usize, w: T) -> Result<()> {
        self.ensure_host_weights();
        let neuron = self.neuron_mut(layer, x, y)?;
        let slot = neuron
            .connections
            .get_mut(conn)
            .ok_or_else(|| NetError::config(format!("neuron ({x},{y}) has no connection {conn}")))?;
        slot.weight = w;
        let width = self.layers[layer].width;
        if let Some(cache) = self.layers[layer].dense.as_mut() {
            cache.mirror_weight(y * width + x, conn, w);
        }
        self.mark_device_stale();
        Ok(())
    }

    pub fn set_bias(&mut self, layer: usize, x: usize, y: usize, b: T) -> Result<()> {
        self.ensure_host_weights();
        self.neuron_mut(layer, x, y)?.bias = b;
        let width = self.layers[layer].width;
        if let Some(cache) = self.layers[layer].dense.as_mut() {
            cache.mirror_bias(y * width + x, b);
        }
        self.mark_device_stale();
        Ok(())
    }

    /// Configure replay for one layer. Offsets outside the hidden range are rejected.
    pub fn set_replay(&mut self, layer: usize, config: ReplayConfig) -> Result<()> {
        config.validate(layer, self.layers.len())?;
        self.layers[layer].replay = config;
        Ok(())
    }

    /// Same shapes, activations, flags, replay settings, connection order and
    /// bit-identical weights and biases.
    pub fn structurally_eq(&self, other: &Network<T>) -> bool {
        self.layers.len() == other.layers.len()
            && self.layers.iter().zip(&other.layers).all(|(a, b)| {
                a.shape() == b.shape()
                    && a.activation == b.activation
                    && a.fully_connected == b.fully_connected
                    && a.replay.to_spec() == b.replay.to_spec()
                    && a.neurons.iter().zip(&b.neurons).all(|(na, nb)| {
                        na.bias.to_bits() == nb.bias.to_bits()
                            && na.connections.len() == nb.connections.len()
                            && na.connections.iter().zip(&nb.connections).all(|(ca, cb)| {
                                (ca.src_layer, ca.src_x, ca.src_y) == (cb.src_layer, cb.src_x, cb.src_y)
                                    && ca.weight.to_bits() == cb.weight.to_bits()
                            })
                    })
            })
            && self.dimensions.iter().zip(&other.dimensions).all(|(a, b)| match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.structurally_eq(b),
                _ => false,
            })
    }

    /// Copy into another scalar type. Fails if any weight or bias does not fit `U`.
    pub fn convert<U: Scalar>(&self) -> Result<Network<U>> {
        fn cast<T: Scalar, U: Scalar>(v: T, what: &str) -> Result<U> {
            let f = v.to_f64();
            if U::fits_f64(f) {
                Ok(U::from_f64(f))
            } else {
                Err(NetError::NumericOverflow(format!(
                    "{what} {v} does not fit {}",
                    U::TYPE_NAME
                )))
            }
        }

        let mut layers = Vec::with_capacity(self.layers.len());
        for grid in &self.layers {
            let mut neurons = Vec::with_capacity(grid.neurons.len());
            for n in &grid.neurons {
                let mut conns = Vec::with_capacity(n.connections.len());
                for c in &n.connections {
                    conns.push(crate::grid::Connection {
                        src_layer: c.src_layer,
                        src_x: c.src_x,
                        src_y: c.src_y,
                        weight: cast::<T, U>(c.weight, "weight")?,
                    });
                }
                neurons.push(Neuron::new(cast::<T, U>(n.bias, "bias")?, conns));
            }
            let mut g = Grid::from_neurons(
                grid.width,
                grid.height,
                grid.activation,
                grid.fully_connected,
                neurons,
            );
            g.replay = grid.replay.clone();
            layers.push(g);
        }
        let mut out = Network::from_layers(layers, self.rng.clone());
        out.sparse_radius = self.sparse_radius;
        out.debug = self.debug;
        for (slot, dim) in out.dimensions.iter_mut().zip(&self.dimensions) {
            if let Some(dim) = dim {
                *slot = Some(dim.convert::<U>()?);
            }
        }
        Ok(out)
    }

    /// Borrow the network for destructive weight edits.
    ///
    /// Every weight and bias is restored, and re-uploaded to the device, when the
    /// lease is dropped.
    pub fn lease_weights(&mut self) -> WeightLease<'_, T> {
        self.ensure_host_weights();
        self.flush_dense();
        let snapshot = self
            .layers
            .iter()
            .map(|g| {
                g.neurons
                    .iter()
                    .map(|n| (n.bias, n.connections.iter().map(|c| c.weight).collect()))
                    .collect()
            })
            .collect();
        WeightLease {
            net: self,
            snapshot,
        }
    }
}

impl<T: Scalar> Clone for Network<T> {
    /// Copies the host side only; the clone runs on CPU.
    fn clone(&self) -> Self {
        let state = match &self.state {
            BackendState::GpuFailed { reason } => BackendState::GpuFailed {
                reason: reason.clone(),
            },
            _ => BackendState::CpuOnly,
        };
        Self {
            layers: self.layers.clone(),
            dimensions: self.dimensions.clone(),
            rng: self.rng.clone(),
            sparse_radius: self.sparse_radius,
            performance: self.performance.clone(),
            state,
            fallback_reason: self.fallback_reason.clone(),
            debug: self.debug,
            baked: self.baked,
            softmax_applied: self.softmax_applied,
            host_stale: false,
            device_stale: false,
            #[cfg(feature = "gpu")]
            gpu: None,
        }
    }
}

impl<T: Scalar> fmt::Debug for Network<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shapes: Vec<(usize, usize)> = self.layers.iter().map(Grid::shape).collect();
        f.debug_struct("Network")
            .field("scalar", &T::TYPE_NAME)
            .field("shapes", &shapes)
            .field("state", &self.state)
            .field("baked", &self.baked)
            .finish()
    }
}

type NeuronWeights<T> = (T, Vec<T>);

/// Exclusive borrow of a network whose weights are restored on drop.
pub struct WeightLease<'a, T: Scalar> {
    net: &'a mut Network<T>,
    snapshot: Vec<Vec<NeuronWeights<T>>>,
}

impl<T: Scalar> WeightLease<'_, T> {
    /// Overwrite a layer's device weight buffer with raw little-endian f32 bytes.
    #[cfg(feature = "gpu")]
    pub fn write_raw_weight_bytes(&mut self, layer: usize, bytes: &[u8]) -> Result<()> {
        let gpu = self
            .net
            .gpu
            .as_ref()
            .ok_or_else(|| NetError::BackendUnavailable("GPU is not initialised".into()))?;
        gpu.write_raw_weights(layer, bytes)
            .map_err(|e| NetError::BackendUnavailable(e.to_string()))?;
        self.net.host_stale = true;
        Ok(())
    }
}

impl<T: Scalar> Deref for WeightLease<'_, T> {
    type Target = Network<T>;

    fn deref(&self) -> &Network<T> {
        self.net
    }
}

impl<T: Scalar> DerefMut for WeightLease<'_, T> {
    fn deref_mut(&mut self) -> &mut Network<T> {
        self.net
    }
}

impl<T: Scalar> Drop for WeightLease<'_, T> {
    fn drop(&mut self) {
        let net = &mut *self.net;
        for (grid, saved) in net.layers.iter_mut().zip(&self.snapshot) {
            for (r, (n, (bias, weights))) in grid.neurons.iter_mut().zip(saved).enumerate() {
                n.bias = *bias;
                for (c, (conn, w)) in n.connections.iter_mut().zip(weights).enumerate() {
                    conn.weight = *w;
                    if let Some(cache) = grid.dense.as_mut() {
                        cache.mirror_weight(r, c, *w);
                    }
                }
                if let Some(cache) = grid.dense.as_mut() {
                    cache.mirror_bias(r, *bias);
                }
            }
        }
        net.host_stale = false;
        net.mark_device_stale();
        net.refresh_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Network<f32> {
        Network::create(
            &[(3, 1), (4, 1), (2, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Linear],
            &[true, true, true],
            Some(42),
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_bad_descriptors() {
        let r = Network::<f32>::create(&[], &[], &[], None);
        assert!(matches!(r, Err(NetError::ConfigInvalid(_))));
        let r = Network::<f32>::create(&[(0, 3), (2, 2)], &[Activation::Linear; 2], &[true; 2], None);
        assert!(matches!(r, Err(NetError::ConfigInvalid(_))));
        let r = Network::<f32>::create(&[(1, 3), (2, 2)], &[Activation::Linear], &[true; 2], None);
        assert!(matches!(r, Err(NetError::ConfigInvalid(_))));
    }

    #[test]
    fn shapes_are_preserved() {
        let n = Network::<i16>::create(
            &[(28, 28), (16, 4), (10, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Softmax],
            &[true, false, true],
            Some(1),
        )
        .unwrap();
        assert_eq!(n.input_shape(), (28, 28));
        assert_eq!(n.layers()[1].shape(), (16, 4));
        assert_eq!(n.output_shape(), (10, 1));
        assert_eq!(n.scalar_type(), "i16");
        assert!(n.layers()[2].neurons().iter().all(|x| x.connections.len() == 64));
    }

    #[test]
    fn same_seed_builds_equal_networks() {
        assert!(small().structurally_eq(&small()));
        let other = Network::<f32>::create(
            &[(3, 1), (4, 1), (2, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Linear],
            &[true, true, true],
            Some(43),
        )
        .unwrap();
        assert!(!small().structurally_eq(&other));
    }

    #[test]
    fn set_weight_checks_bounds() {
        let mut n = small();
        n.set_weight(1, 2, 0, 1, 0.5).unwrap();
        assert_eq!(n.weight(1, 2, 0, 1), Some(0.5));
        assert!(n.set_weight(0, 0, 0, 0, 1.0).is_err());
        assert!(n.set_weight(1, 9, 0, 0, 1.0).is_err());
        assert!(n.set_weight(1, 0, 0, 7, 1.0).is_err());
    }

    #[test]
    fn set_replay_validates_offset() {
        let mut n = small();
        let cfg = ReplayConfig::fixed(crate::replay::ReplayPhase::Before, -1, 2);
        assert!(n.set_replay(1, cfg.clone()).is_err());
        assert!(n.set_replay(2, cfg).is_ok());
        assert!(n.layers()[2].replay().enabled);
    }

    #[test]
    fn convert_reports_overflow() {
        let mut n = small();
        let ok: Network<f64> = n.convert().unwrap();
        assert_eq!(ok.scalar_type(), "f64");
        n.set_weight(2, 0, 0, 0, 1000.0).unwrap();
        let r = n.convert::<i8>();
        assert!(matches!(r, Err(NetError::NumericOverflow(_))));
        let wide: Network<i32> = n.convert().unwrap();
        assert_eq!(wide.weight(2, 0, 0, 0), Some(1000));
    }

    #[test]
    fn lease_restores_weights() {
        let mut n = small();
        let before = n.clone();
        {
            let mut lease = n.lease_weights();
            lease.set_weight(1, 0, 0, 0, 9.0).unwrap();
            lease.set_bias(2, 1, 0, -3.0).unwrap();
            assert_eq!(lease.weight(1, 0, 0, 0), Some(9.0));
        }
        assert!(n.structurally_eq(&before));
    }

    #[test]
    fn clone_is_cpu_only() {
        let n = small();
        let c = n.clone();
        assert_eq!(c.status().state, BackendState::CpuOnly);
    }
}
