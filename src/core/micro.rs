//! Checkpoints, micro-networks and network surgery.
//!
//! A micro-network is the tail `[k..N-1]` of a network, re-anchored so that
//! layer `k` becomes its input. Three-way verification runs the same sample
//! through the full network, through the full network resumed from the
//! checkpoint, and through the micro-network.

use tracing::{debug, info};

use crate::error::{NetError, Result};
use crate::grid::{Connection, Grid, Neuron};
use crate::network::Network;
use crate::numeric::Scalar;

/// Outputs of the three execution paths for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeWayReport {
    pub equivalent: bool,
    /// Full forward, resumed parent, micro-network.
    pub outputs: [Vec<f64>; 3],
    pub max_deviation: f64,
}

/// An independent network built from the layers above a checkpoint.
#[derive(Debug, Clone)]
pub struct MicroNetwork<T: Scalar> {
    network: Network<T>,
    source_layer: usize,
}

impl<T: Scalar> MicroNetwork<T> {
    /// Parent layer index that this network's input layer stands for.
    pub fn source_layer(&self) -> usize {
        self.source_layer
    }

    pub fn network(&self) -> &Network<T> {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network<T> {
        &mut self.network
    }

    pub fn into_network(self) -> Network<T> {
        self.network
    }

    /// Evaluate from a checkpoint grid of the parent's layer `source_layer`.
    pub fn forward_from_checkpoint(&mut self, state: &[Vec<f64>]) -> Result<()> {
        self.network.forward(state)
    }

    /// Compare this micro-network against `parent` on one input.
    pub fn verify_three_way(
        &mut self,
        parent: &mut Network<T>,
        input: &[Vec<f64>],
        tolerance: f64,
    ) -> Result<ThreeWayReport> {
        if parent.num_layers() != self.source_layer + self.network.num_layers() {
            return Err(NetError::config(format!(
                "micro-network from layer {} has {} layers, parent has {}",
                self.source_layer,
                self.network.num_layers(),
                parent.num_layers()
            )));
        }
        let k = self.source_layer;

        parent.forward(input)?;
        let full = flatten(parent.output_grid());
        let state = parent.layer_state(k)?;

        parent.forward_from_layer(k, &state)?;
        let resumed = flatten(parent.output_grid());

        self.forward_from_checkpoint(&state)?;
        let micro = flatten(self.network.output_grid());

        let max_deviation = max_abs_diff(&full, &resumed)
            .max(max_abs_diff(&full, &micro))
            .max(max_abs_diff(&resumed, &micro));
        let equivalent = max_deviation <= tolerance;
        if parent.debug() {
            debug!(
                "three-way check at layer {}: max deviation {:e} (tolerance {:e})",
                k, max_deviation, tolerance
            );
        }
        Ok(ThreeWayReport {
            equivalent,
            outputs: [full, resumed, micro],
            max_deviation,
        })
    }
}

fn flatten(grid: Vec<Vec<f64>>) -> Vec<f64> {
    grid.into_iter().flatten().collect()
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter().zip(b).fold(0.0, |m, (x, y)| {
        let d = (x - y).abs();
        if d.is_nan() {
            f64::INFINITY
        } else {
            m.max(d)
        }
    })
}

impl<T: Scalar> Network<T> {
    /// Copy of layer `k`'s current values.
    pub fn layer_state(&self, k: usize) -> Result<Vec<Vec<f64>>> {
        self.layers
            .get(k)
            .map(Grid::value_rows)
            .ok_or_else(|| NetError::config(format!("layer {k} out of range")))
    }

    /// Overwrite layer `k` with `state` and evaluate the layers above it.
    pub fn forward_from_layer(&mut self, k: usize, state: &[Vec<f64>]) -> Result<()> {
        if k >= self.layers.len() {
            return Err(NetError::config(format!("layer {k} out of range")));
        }
        self.check_grid(k, state)?;
        self.note_fallback();
        self.softmax_applied = false;
        self.ensure_host_weights();
        self.flush_dense();

        let grid = &mut self.layers[k];
        for (n, v) in grid.neurons.iter_mut().zip(state.iter().flatten()) {
            n.value = T::from_f64(*v);
        }
        grid.refresh_cache();
        for l in k + 1..self.layers.len() {
            self.run_layer(l, None);
        }
        Ok(())
    }

    /// Build the micro-network for checkpoint layer `k` (`k < N-1`).
    ///
    /// Connections reaching below `k`, and replay sources at or below `k`, are
    /// a [`NetError::ConfigInvalid`].
    pub fn extract_micro_network(&mut self, k: usize) -> Result<MicroNetwork<T>> {
        let n = self.layers.len();
        if k + 1 >= n {
            return Err(NetError::config(format!(
                "checkpoint layer {k} must be below the output layer {}",
                n - 1
            )));
        }
        self.ensure_host_weights();
        self.flush_dense();

        let anchor = &self.layers[k];
        let input_neurons = anchor
            .neurons
            .iter()
            .map(|src| {
                let mut n = Neuron::new(src.bias, Vec::new());
                n.value = src.value;
                n
            })
            .collect();
        let mut input = Grid::from_neurons(
            anchor.width,
            anchor.height,
            anchor.activation,
            anchor.fully_connected,
            input_neurons,
        );
        input.refresh_cache();

        let mut layers = Vec::with_capacity(n - k);
        layers.push(input);
        for l in k + 1..n {
            let grid = &self.layers[l];
            if grid.replay.enabled {
                match grid.replay.source_layer(l) {
                    Some(s) if s > k => {}
                    _ => {
                        return Err(NetError::config(format!(
                            "layer {l} replays a layer at or below checkpoint {k}"
                        )))
                    }
                }
            }
            let mut neurons = Vec::with_capacity(grid.neurons.len());
            for nrn in &grid.neurons {
                let mut conns = Vec::with_capacity(nrn.connections.len());
                for c in &nrn.connections {
                    let src = c.src_layer as usize;
                    if src < k {
                        return Err(NetError::config(format!(
                            "layer {l} reads layer {src}, below checkpoint {k}"
                        )));
                    }
                    conns.push(Connection {
                        src_layer: (src - k) as u32,
                        src_x: c.src_x,
                        src_y: c.src_y,
                        weight: c.weight,
                    });
                }
                let mut copy = Neuron::new(nrn.bias, conns);
                copy.value = nrn.value;
                copy.sum = nrn.sum;
                neurons.push(copy);
            }
            let mut g = Grid::from_neurons(grid.width, grid.height, grid.activation, grid.fully_connected, neurons);
            g.replay = grid.replay.clone();
            g.cached_outputs = grid.cached_outputs.clone();
            layers.push(g);
        }

        let mut network = Network::from_layers(layers, self.rng.clone());
        for (slot, dim) in network.dimensions.iter_mut().skip(1).zip(&self.dimensions[k + 1..]) {
            slot.clone_from(dim);
        }
        network.sparse_radius = self.sparse_radius;
        network.debug = self.debug;
        if self.baked {
            network.bake();
        }
        debug!("extracted {}-layer micro-network at layer {}", n - k, k);
        Ok(MicroNetwork {
            network,
            source_layer: k,
        })
    }

    /// Verify a fresh micro-network at `k` on every input, then write its
    /// weights back into layers `k+1..N-1`.
    ///
    /// All-or-nothing: on any divergence the network is left untouched.
    pub fn network_surgery(
        &mut self,
        k: usize,
        inputs: &[Vec<Vec<f64>>],
        tolerance: f64,
    ) -> Result<MicroNetwork<T>> {
        let mut micro = self.extract_micro_network(k)?;
        let mut trial = self.clone();
        for (i, input) in inputs.iter().enumerate() {
            let report = micro.verify_three_way(&mut trial, input, tolerance)?;
            if !report.equivalent {
                info!(
                    "surgery at layer {} rejected: sample {} deviates by {:e}",
                    k, i, report.max_deviation
                );
                return Err(NetError::VerificationDivergence {
                    max_deviation: report.max_deviation,
                    tolerance,
                });
            }
        }

        for (j, dim) in micro.network.dimensions.iter().enumerate().skip(1) {
            self.dimensions[k + j].clone_from(dim);
        }
        for (j, src) in micro.network.layers.iter().enumerate().skip(1) {
            let grid = &mut self.layers[k + j];
            for (r, (dst, from)) in grid.neurons.iter_mut().zip(&src.neurons).enumerate() {
                dst.bias = from.bias;
                for (c, (dc, fc)) in dst.connections.iter_mut().zip(&from.connections).enumerate() {
                    dc.weight = fc.weight;
                    if let Some(cache) = grid.dense.as_mut() {
                        cache.mirror_weight(r, c, fc.weight);
                    }
                }
                if let Some(cache) = grid.dense.as_mut() {
                    cache.mirror_bias(r, from.bias);
                }
            }
        }
        self.mark_device_stale();
        self.refresh_device();
        info!("surgery at layer {} verified on {} inputs", k, inputs.len());
        Ok(micro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::replay::{Gate, ReplayConfig, ReplayPhase};

    fn net() -> Network<f64> {
        Network::create(
            &[(3, 1), (8, 1), (6, 1), (2, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Tanh, Activation::Softmax],
            &[true; 4],
            Some(7),
        )
        .unwrap()
    }

    #[test]
    fn three_way_equivalence() {
        let mut parent = net();
        let mut micro = parent.extract_micro_network(2).unwrap();
        assert_eq!(micro.network().num_layers(), 2);
        assert_eq!(micro.network().input_shape(), (6, 1));
        for input in [[0.1, 0.2, 0.3], [-1.0, 0.5, 2.0], [0.0, 0.0, 0.0]] {
            let r = micro
                .verify_three_way(&mut parent, &[input.to_vec()], 1e-10)
                .unwrap();
            assert!(r.equivalent, "deviation {}", r.max_deviation);
            assert_eq!(r.outputs[0].len(), 2);
        }
    }

    #[test]
    fn sub_networks_travel_with_the_micro_network() {
        let mut parent = net();
        parent
            .set_layer_dimension(
                2,
                &[(1, 1), (3, 1), (1, 1)],
                &[Activation::Linear, Activation::Tanh, Activation::Linear],
                &[true; 3],
                crate::dimension::DimensionOptions::default(),
            )
            .unwrap();
        let mut micro = parent.extract_micro_network(1).unwrap();
        assert!(micro.network().layer_dimension(1).is_some());
        let r = micro
            .verify_three_way(&mut parent, &[vec![0.3, -0.8, 0.5]], 1e-10)
            .unwrap();
        assert!(r.equivalent, "deviation {}", r.max_deviation);
    }

    #[test]
    fn connections_are_reanchored() {
        let mut parent = net();
        let micro = parent.extract_micro_network(1).unwrap();
        let m = micro.network();
        assert_eq!(m.num_layers(), 3);
        assert!(m.layer(0).unwrap().neurons().iter().all(|n| n.connections.is_empty()));
        for (l, g) in m.layers().iter().enumerate().skip(1) {
            for n in g.neurons() {
                assert!(n.connections.iter().all(|c| c.src_layer as usize == l - 1));
            }
        }
        assert_eq!(m.weight(1, 0, 0, 0), parent.weight(2, 0, 0, 0));
    }

    #[test]
    fn output_layer_cannot_be_a_checkpoint() {
        let mut parent = net();
        assert!(matches!(
            parent.extract_micro_network(3),
            Err(NetError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn checkpoint_resume_matches_full_forward() {
        let mut parent = net();
        parent.forward(&[vec![0.4, -0.3, 0.9]]).unwrap();
        let full = parent.output_grid();
        let state = parent.layer_state(1).unwrap();
        parent.forward_from_layer(1, &state).unwrap();
        assert_eq!(parent.output_grid(), full);
        assert!(parent.forward_from_layer(1, &[vec![1.0]]).is_err());
    }

    #[test]
    fn surgery_is_identity_on_success() {
        let mut parent = net();
        let before = parent.clone();
        let inputs = vec![vec![vec![0.1, 0.2, 0.3]], vec![vec![0.9, -0.9, 0.0]]];
        let micro = parent.network_surgery(1, &inputs, 1e-10).unwrap();
        assert_eq!(micro.source_layer(), 1);
        assert!(parent.structurally_eq(&before));
    }

    #[test]
    fn surgery_rejects_divergence_atomically() {
        let mut parent: Network<f64> = Network::create(
            &[(2, 1), (3, 1), (3, 1), (3, 1), (2, 1)],
            &[Activation::Linear; 5],
            &[true; 5],
            Some(11),
        )
        .unwrap();
        // Repeats depend on what the layer produced last time.
        let gate = Gate::custom(|cached| if cached.iter().any(|v| *v != 0.0) { 1.0 } else { 0.0 });
        parent
            .set_replay(3, ReplayConfig::gated(ReplayPhase::Before, -1, gate, 3))
            .unwrap();
        let before = parent.clone();
        let r = parent.network_surgery(1, &[vec![vec![0.7, -0.2]]], 1e-10);
        assert!(matches!(r, Err(NetError::VerificationDivergence { .. })));
        assert!(parent.structurally_eq(&before));
    }

    #[test]
    fn replay_reaching_the_checkpoint_is_rejected() {
        let mut parent = net();
        parent
            .set_replay(2, ReplayConfig::fixed(ReplayPhase::Before, -1, 1))
            .unwrap();
        assert!(parent.extract_micro_network(1).is_err());
        assert!(parent.extract_micro_network(0).is_ok());
    }
}
