//! Dense bake: row-major weight matrices for fully-connected layers.
//!
//! Connection weights stay authoritative. The cache is a mirror the forward pass
//! can run matrix-vector products on; backward keeps it current, and edits made
//! through [`Network::dense_mut`] are written back on [`Network::unbake`].

use tracing::debug;

use crate::error::{NetError, Result};
use crate::network::Network;
use crate::numeric::Scalar;

#[derive(Debug, Clone, PartialEq)]
pub struct DenseCache<T> {
    rows: usize,
    cols: usize,
    weights: Vec<T>,
    biases: Vec<T>,
    dirty: bool,
}

impl<T: Scalar> DenseCache<T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    pub fn biases(&self) -> &[T] {
        &self.biases
    }

    pub fn row(&self, r: usize) -> &[T] {
        &self.weights[r * self.cols..(r + 1) * self.cols]
    }

    pub fn weights_mut(&mut self) -> &mut [T] {
        &mut self.weights
    }

    pub fn biases_mut(&mut self) -> &mut [T] {
        &mut self.biases
    }

    pub fn set(&mut self, row: usize, col: usize, w: T) {
        self.weights[row * self.cols + col] = w;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mirror_weight(&mut self, row: usize, col: usize, w: T) {
        if let Some(slot) = self.weights.get_mut(row * self.cols + col) {
            *slot = w;
        }
    }

    pub(crate) fn mirror_bias(&mut self, row: usize, b: T) {
        if let Some(slot) = self.biases.get_mut(row) {
            *slot = b;
        }
    }
}

impl<T: Scalar> Network<T> {
    /// Materialise dense matrices for every canonical fully-connected layer.
    ///
    /// Idempotent; sparse layers keep the per-connection path.
    pub fn bake(&mut self) {
        if self.baked {
            return;
        }
        self.ensure_host_weights();
        for l in 1..self.layers.len() {
            let prev = self.layers[l - 1].shape();
            let grid = &mut self.layers[l];
            if !grid.fully_connected || !grid.is_canonical_dense(l, prev) {
                continue;
            }
            let cols = prev.0 * prev.1;
            let mut weights = Vec::with_capacity(grid.len() * cols);
            let mut biases = Vec::with_capacity(grid.len());
            for n in &grid.neurons {
                weights.extend(n.connections.iter().map(|c| c.weight));
                biases.push(n.bias);
            }
            grid.dense = Some(DenseCache {
                rows: grid.neurons.len(),
                cols,
                weights,
                biases,
                dirty: false,
            });
        }
        self.baked = true;
        if self.debug {
            debug!("baked {} dense layers", self.baked_layer_count());
        }
    }

    /// Drop the dense matrices, writing dirty ones back first. Idempotent.
    pub fn unbake(&mut self) {
        self.flush_dense();
        for grid in &mut self.layers {
            grid.dense = None;
        }
        self.baked = false;
    }

    pub fn is_baked(&self) -> bool {
        self.baked
    }

    pub fn baked_layer_count(&self) -> usize {
        self.layers.iter().filter(|g| g.dense.is_some()).count()
    }

    pub fn dense(&self, layer: usize) -> Option<&DenseCache<T>> {
        self.layers.get(layer).and_then(|g| g.dense.as_ref())
    }

    /// Mutable access to a baked layer's matrix. Marks it dirty.
    pub fn dense_mut(&mut self, layer: usize) -> Result<&mut DenseCache<T>> {
        let cache = self
            .layers
            .get_mut(layer)
            .and_then(|g| g.dense.as_mut())
            .ok_or_else(|| NetError::config(format!("layer {layer} is not baked")))?;
        cache.dirty = true;
        Ok(cache)
    }

    /// Write dirty matrices back into the connections, keeping the caches.
    pub(crate) fn flush_dense(&mut self) {
        let mut wrote = false;
        for grid in &mut self.layers {
            let Some(cache) = grid.dense.as_mut() else {
                continue;
            };
            if !cache.dirty {
                continue;
            }
            for (r, n) in grid.neurons.iter_mut().enumerate() {
                n.bias = cache.biases[r];
                for (c, conn) in n.connections.iter_mut().enumerate() {
                    conn.weight = cache.weights[r * cache.cols + c];
                }
            }
            cache.dirty = false;
            wrote = true;
        }
        if wrote {
            self.mark_device_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::activation::Activation;
    use crate::network::Network;

    fn net() -> Network<f32> {
        Network::create(
            &[(4, 1), (3, 2), (2, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Sigmoid],
            &[true, true, true],
            Some(3),
        )
        .unwrap()
    }

    #[test]
    fn bake_then_unbake_is_identity() {
        let original = net();
        let mut n = original.clone();
        n.bake();
        n.bake();
        assert_eq!(n.baked_layer_count(), 2);
        n.unbake();
        n.unbake();
        assert!(!n.is_baked());
        assert!(n.structurally_eq(&original));
    }

    #[test]
    fn debug_bake_reports_and_keeps_weights() {
        let original = net();
        let mut n = original.clone();
        n.set_debug(true);
        n.bake();
        assert_eq!(n.baked_layer_count(), 2);
        n.unbake();
        n.set_debug(false);
        assert!(n.structurally_eq(&original));
    }

    #[test]
    fn baked_forward_matches_connection_forward() {
        let input = vec![vec![0.2, -0.4, 0.9, 0.1]];
        let mut plain = net();
        plain.forward(&input).unwrap();
        let mut baked = net();
        baked.bake();
        baked.forward(&input).unwrap();
        for (a, b) in plain.output().iter().zip(baked.output()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn dirty_edits_write_back_on_unbake() {
        let mut n = net();
        assert!(n.dense_mut(1).is_err());
        n.bake();
        {
            let d = n.dense_mut(1).unwrap();
            d.set(0, 2, 0.75);
            d.biases_mut()[1] = -0.5;
        }
        n.unbake();
        let layer = &n.layers()[1];
        assert_eq!(layer.neurons()[0].connections[2].weight, 0.75);
        assert_eq!(layer.neurons()[1].bias, -0.5);
    }

    #[test]
    fn backward_keeps_mirror_in_step() {
        let mut n = net();
        n.bake();
        n.forward(&[vec![1.0, 0.5, -0.5, 0.25]]).unwrap();
        n.backward(&[vec![0.0, 1.0]], 0.1, 1.0, -1.0).unwrap();
        let layer = &n.layers()[2];
        let cache = n.dense(2).unwrap();
        for (r, neuron) in layer.neurons().iter().enumerate() {
            assert_eq!(cache.biases()[r], neuron.bias);
            for (c, conn) in neuron.connections.iter().enumerate() {
                assert_eq!(cache.row(r)[c], conn.weight);
            }
        }
    }
}
