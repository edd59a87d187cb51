use serde::Serialize;

use crate::activation::Activation;
use crate::backend::BackendStatus;
use crate::eval::Performance;
use crate::grid::Grid;
use crate::micro::MicroNetwork;
use crate::network::Network;
use crate::numeric::Scalar;

/// A read-only snapshot of a network's layers.
///
/// Design intent:
/// - Observers cannot mutate or steer the network.
/// - Snapshotting is *on-demand* and can allocate; forward and backward stay unchanged.
/// - Values reflect the last forward pass; weights reflect the host copy
///   (see `BackendStatus::host_stale`).
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    pub scalar_type: &'static str,
    pub backend: BackendStatus,
    pub baked: bool,
    pub layers: Vec<LayerSummary>,
    pub performance: Option<Performance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSummary {
    pub index: usize,
    pub width: usize,
    pub height: usize,
    pub activation: Activation,
    pub fully_connected: bool,
    pub replay_enabled: bool,
    /// Sub-networks attached to this layer, 0 for a plain layer.
    pub sub_networks: usize,
    pub connections: usize,
    pub weight_min: f64,
    pub weight_max: f64,
    pub weight_mean_abs: f64,
    pub value_mean: f64,
    pub value_max: f64,
}

impl LayerSummary {
    fn of<T: Scalar>(index: usize, grid: &Grid<T>, sub_networks: usize) -> Self {
        let mut weight_min = f64::INFINITY;
        let mut weight_max = f64::NEG_INFINITY;
        let mut abs_sum = 0.0;
        let mut count = 0usize;
        for n in grid.neurons() {
            for c in &n.connections {
                let w = c.weight.to_f64();
                weight_min = weight_min.min(w);
                weight_max = weight_max.max(w);
                abs_sum += w.abs();
                count += 1;
            }
        }
        if count == 0 {
            weight_min = 0.0;
            weight_max = 0.0;
        }
        let values = grid.cached_outputs();
        let (value_mean, value_max) = if values.is_empty() {
            (0.0, 0.0)
        } else {
            (
                values.iter().sum::<f64>() / values.len() as f64,
                values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            )
        };
        Self {
            index,
            width: grid.width(),
            height: grid.height(),
            activation: grid.activation(),
            fully_connected: grid.is_fully_connected(),
            replay_enabled: grid.replay().enabled,
            sub_networks,
            connections: count,
            weight_min,
            weight_max,
            weight_mean_abs: if count == 0 { 0.0 } else { abs_sum / count as f64 },
            value_mean,
            value_max,
        }
    }
}

pub struct NetworkAdapter<'a, T: Scalar> {
    network: &'a Network<T>,
}

impl<'a, T: Scalar> NetworkAdapter<'a, T> {
    pub fn new(network: &'a Network<T>) -> Self {
        Self { network }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            scalar_type: self.network.scalar_type(),
            backend: self.network.status(),
            baked: self.network.is_baked(),
            layers: self
                .network
                .layers()
                .iter()
                .enumerate()
                .map(|(i, g)| {
                    let subs = self.network.layer_dimension(i).map_or(0, |d| d.networks().len());
                    LayerSummary::of(i, g, subs)
                })
                .collect(),
            performance: self.network.performance().cloned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MicroSnapshot {
    pub parent: NetworkSnapshot,
    pub micro: NetworkSnapshot,
    pub source_layer: usize,
}

pub struct MicroAdapter<'a, T: Scalar> {
    parent: &'a Network<T>,
    micro: &'a MicroNetwork<T>,
}

impl<'a, T: Scalar> MicroAdapter<'a, T> {
    pub fn new(parent: &'a Network<T>, micro: &'a MicroNetwork<T>) -> Self {
        Self { parent, micro }
    }

    pub fn snapshot(&self) -> MicroSnapshot {
        MicroSnapshot {
            parent: NetworkAdapter::new(self.parent).snapshot(),
            micro: NetworkAdapter::new(self.micro.network()).snapshot(),
            source_layer: self.micro.source_layer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionOptions;

    #[test]
    fn snapshot_summarises_layers() {
        let mut n: Network<f32> = Network::create(
            &[(2, 2), (3, 1), (2, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Sigmoid],
            &[true, false, true],
            Some(4),
        )
        .unwrap();
        n.forward(&[vec![0.5, 0.5], vec![0.5, 0.5]]).unwrap();
        let snap = NetworkAdapter::new(&n).snapshot();
        assert_eq!(snap.scalar_type, "f32");
        assert_eq!(snap.layers.len(), 3);
        assert_eq!(snap.layers[0].connections, 0);
        assert_eq!(snap.layers[0].weight_min, 0.0);
        assert_eq!(snap.layers[2].connections, 6);
        assert!(snap.layers[2].value_max > 0.0 && snap.layers[2].value_max < 1.0);
        assert!(snap.layers[1].weight_min <= snap.layers[1].weight_max);
    }

    #[test]
    fn micro_snapshot_pairs_both_sides() {
        let mut n: Network<f64> =
            Network::create(&[(2, 1), (3, 1), (2, 1)], &[Activation::Linear; 3], &[true; 3], None).unwrap();
        let micro = n.extract_micro_network(1).unwrap();
        let snap = MicroAdapter::new(&n, &micro).snapshot();
        assert_eq!(snap.source_layer, 1);
        assert_eq!(snap.micro.layers.len(), 2);
        assert_eq!(snap.micro.layers[1].weight_max, snap.parent.layers[2].weight_max);
    }

    #[test]
    fn snapshot_counts_sub_networks() {
        let mut n: Network<f64> =
            Network::create(&[(2, 1), (3, 1), (2, 1)], &[Activation::Linear; 3], &[true; 3], Some(8)).unwrap();
        let sub = [(1, 1), (2, 1), (1, 1)];
        n.set_layer_dimension(1, &sub, &[Activation::Linear; 3], &[true; 3], DimensionOptions::default())
            .unwrap();
        n.set_layer_dimension(2, &sub, &[Activation::Linear; 3], &[true; 3], DimensionOptions::shared())
            .unwrap();
        let snap = NetworkAdapter::new(&n).snapshot();
        let counts: Vec<usize> = snap.layers.iter().map(|l| l.sub_networks).collect();
        assert_eq!(counts, vec![0, 3, 1]);
    }
}
