//! Dimensional layers: every neuron of a layer owns a small sub-network.
//!
//! The weighted sum `s` of a neuron is fed to its sub-network (one input, one
//! output) and the layer activation sees `s + g(s)`. Sub-networks are either
//! one per neuron or a single one shared by the whole layer. Backward scales
//! the error by `1 + g'(s)` and trains the sub-networks with the same step.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::backward::ClipRange;
use crate::error::{NetError, Result};
use crate::grid::Neuron;
use crate::network::Network;
use crate::numeric::Scalar;

/// Weight initialisation for freshly built sub-networks.
///
/// Integer networks always use the fan-in scaled integer draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// Uniform in `±1/sqrt(fan_in)`, as every other layer.
    #[default]
    FanIn,
    /// Uniform in `±sqrt(6/(fan_in + fan_out))`.
    Xavier,
    /// Uniform in `±sqrt(6/fan_in)`.
    He,
}

impl InitMethod {
    pub fn name(self) -> &'static str {
        match self {
            InitMethod::FanIn => "fan_in",
            InitMethod::Xavier => "xavier",
            InitMethod::He => "he",
        }
    }

    fn limit(self, fan_in: usize, fan_out: usize) -> f64 {
        let fan_in = fan_in.max(1) as f64;
        match self {
            InitMethod::FanIn => 1.0 / fan_in.sqrt(),
            InitMethod::Xavier => (6.0 / (fan_in + fan_out.max(1) as f64)).sqrt(),
            InitMethod::He => (6.0 / fan_in).sqrt(),
        }
    }
}

impl FromStr for InitMethod {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        [InitMethod::FanIn, InitMethod::Xavier, InitMethod::He]
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| NetError::config(format!("unknown init method `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DimensionOptions {
    /// One sub-network for the whole layer instead of one per neuron.
    pub shared: bool,
    pub init: InitMethod,
}

impl DimensionOptions {
    pub fn shared() -> Self {
        Self {
            shared: true,
            ..Self::default()
        }
    }

    pub fn with_init(mut self, init: InitMethod) -> Self {
        self.init = init;
        self
    }
}

/// Sub-networks attached to one layer.
#[derive(Debug, Clone)]
pub struct LayerDimension<T: Scalar> {
    pub(crate) shared: bool,
    pub(crate) nets: Vec<Network<T>>,
    /// `s` per neuron from the last evaluation.
    inputs: Vec<T>,
    /// Error at `s + g(s)` per neuron from the last backward sweep.
    deltas: Vec<f64>,
}

/// One input, one output, and an output that is not softmax.
fn check_sub_network<T: Scalar>(net: &Network<T>) -> Result<()> {
    if net.input_shape() != (1, 1) || net.output_shape() != (1, 1) {
        return Err(NetError::config(format!(
            "sub-network must map 1x1 to 1x1, got {:?} -> {:?}",
            net.input_shape(),
            net.output_shape()
        )));
    }
    if net.layers()[net.output_index()].activation() == Activation::Softmax {
        return Err(NetError::config("sub-network output cannot be softmax"));
    }
    Ok(())
}

impl<T: Scalar> LayerDimension<T> {
    /// `nets` holds one network when `shared`, otherwise one per neuron.
    pub(crate) fn from_parts(shared: bool, nets: Vec<Network<T>>, neurons: usize) -> Result<Self> {
        let want = if shared { 1 } else { neurons };
        if nets.len() != want {
            return Err(NetError::config(format!(
                "{} sub-networks for {} neurons (shared: {})",
                nets.len(),
                neurons,
                shared
            )));
        }
        for net in &nets {
            check_sub_network(net)?;
        }
        Ok(Self {
            shared,
            nets,
            inputs: vec![T::ZERO; neurons],
            deltas: vec![0.0; neurons],
        })
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn networks(&self) -> &[Network<T>] {
        &self.nets
    }

    /// Sub-network used by neuron `index` (row-major).
    pub fn network(&self, index: usize) -> Option<&Network<T>> {
        self.nets.get(self.slot(index)?)
    }

    pub fn network_mut(&mut self, index: usize) -> Option<&mut Network<T>> {
        let slot = self.slot(index)?;
        self.nets.get_mut(slot)
    }

    fn slot(&self, index: usize) -> Option<usize> {
        if index >= self.inputs.len() {
            None
        } else if self.shared {
            Some(0)
        } else {
            Some(index)
        }
    }

    pub(crate) fn structurally_eq(&self, other: &LayerDimension<T>) -> bool {
        self.shared == other.shared
            && self.nets.len() == other.nets.len()
            && self.nets.iter().zip(&other.nets).all(|(a, b)| a.structurally_eq(b))
    }

    pub(crate) fn convert<U: Scalar>(&self) -> Result<LayerDimension<U>> {
        let nets = self.nets.iter().map(Network::convert::<U>).collect::<Result<Vec<_>>>()?;
        LayerDimension::from_parts(self.shared, nets, self.inputs.len())
    }

    /// Replace each sum `s` by `s + g(s)` and re-apply the activation.
    pub(crate) fn apply(&mut self, neurons: &mut [Neuron<T>], act: Activation) {
        let shared = self.shared;
        for (r, n) in neurons.iter_mut().enumerate() {
            self.inputs[r] = n.sum;
            let net = &mut self.nets[if shared { 0 } else { r }];
            n.sum = n.sum.sat_add(net.eval_scalar(n.sum));
            n.value = act.apply(n.sum);
        }
    }

    /// Turn the error at `s + g(s)` into the error at `s`.
    pub(crate) fn chain(&mut self, neurons: &mut [Neuron<T>]) {
        let shared = self.shared;
        for (r, n) in neurons.iter_mut().enumerate() {
            let delta = n.error;
            self.deltas[r] = delta;
            if delta == 0.0 {
                continue;
            }
            let net = &mut self.nets[if shared { 0 } else { r }];
            n.error = delta + net.backprop_scalar(self.inputs[r], delta);
        }
    }

    /// One gradient step on the sub-network of every admitted neuron.
    pub(crate) fn update(&mut self, lr: f64, clip: ClipRange<T>, admits: impl Fn(usize) -> bool) {
        let shared = self.shared;
        for r in 0..self.deltas.len() {
            let delta = self.deltas[r];
            if delta == 0.0 || !admits(r) {
                continue;
            }
            let net = &mut self.nets[if shared { 0 } else { r }];
            net.backprop_scalar(self.inputs[r], delta);
            net.apply_updates(lr, clip, None);
        }
    }
}

impl<T: Scalar> Network<T> {
    /// Give every neuron of `layer` a sub-network built from the per-layer
    /// slices, as for [`Network::create`]. Seeds are drawn from this network's
    /// PRNG. Layers with sub-networks always run on the CPU.
    pub fn set_layer_dimension(
        &mut self,
        layer: usize,
        shapes: &[(usize, usize)],
        activations: &[Activation],
        fully_connected: &[bool],
        options: DimensionOptions,
    ) -> Result<()> {
        if layer == 0 || layer >= self.layers.len() {
            return Err(NetError::config(format!(
                "layer {layer} cannot carry sub-networks (layers 1..{})",
                self.layers.len()
            )));
        }
        let neurons = self.layers[layer].len();
        let count = if options.shared { 1 } else { neurons };
        let mut nets = Vec::with_capacity(count);
        for _ in 0..count {
            let seed = self.rng.next_u64();
            let mut sub = Network::create(shapes, activations, fully_connected, Some(seed))?;
            sub.init_weights(options.init);
            nets.push(sub);
        }
        self.dimensions[layer] = Some(LayerDimension::from_parts(options.shared, nets, neurons)?);
        debug!(
            "layer {}: {} sub-network(s) of {} layers ({})",
            layer,
            count,
            shapes.len(),
            options.init.name()
        );
        Ok(())
    }

    /// Detach the sub-networks of `layer`, returning them.
    pub fn clear_layer_dimension(&mut self, layer: usize) -> Option<LayerDimension<T>> {
        self.dimensions.get_mut(layer).and_then(Option::take)
    }

    pub fn layer_dimension(&self, layer: usize) -> Option<&LayerDimension<T>> {
        self.dimensions.get(layer).and_then(Option::as_ref)
    }

    pub fn layer_dimension_mut(&mut self, layer: usize) -> Option<&mut LayerDimension<T>> {
        self.dimensions.get_mut(layer).and_then(Option::as_mut)
    }

    pub fn has_dimensions(&self) -> bool {
        self.dimensions.iter().any(Option::is_some)
    }

    /// Attach decoded sub-networks. Used by the codecs.
    pub(crate) fn install_dimension(&mut self, layer: usize, shared: bool, nets: Vec<Network<T>>) -> Result<()> {
        if layer == 0 || layer >= self.layers.len() {
            return Err(NetError::config(format!("layer {layer} cannot carry sub-networks")));
        }
        if self.dimensions[layer].is_some() {
            return Err(NetError::config(format!("layer {layer} has sub-networks twice")));
        }
        let dim = LayerDimension::from_parts(shared, nets, self.layers[layer].len())?;
        self.dimensions[layer] = Some(dim);
        Ok(())
    }

    /// Redraw float weights with `method`. Integer networks keep their draw.
    fn init_weights(&mut self, method: InitMethod) {
        if !T::IS_FLOAT || method == InitMethod::FanIn {
            return;
        }
        for l in 1..self.layers.len() {
            let fan_out = self.layers[l].len();
            let grid = &mut self.layers[l];
            for n in &mut grid.neurons {
                let limit = method.limit(n.connections.len(), fan_out);
                for c in &mut n.connections {
                    c.weight = T::from_f64(self.rng.gen_range_f64(-limit, limit));
                }
            }
        }
    }

    /// Evaluate a one-input network on `x` and return its single output.
    pub(crate) fn eval_scalar(&mut self, x: T) -> T {
        self.ensure_host_weights();
        self.flush_dense();
        let input = &mut self.layers[0];
        input.neurons[0].value = x;
        input.neurons[0].sum = x;
        input.refresh_cache();
        for l in 1..self.layers.len() {
            self.run_layer(l, None);
        }
        self.layers[self.output_index()].neurons[0].value
    }

    /// `delta · g'(x)` for an error `delta` at the output, leaving every
    /// neuron's error in place for a following update.
    pub(crate) fn backprop_scalar(&mut self, x: T, delta: f64) -> f64 {
        self.eval_scalar(x);
        self.seed_output_delta(&[delta]);
        self.sweep_errors(None);
        self.layers[0].neurons[0].error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(fc: bool) -> Network<f64> {
        Network::create(
            &[(2, 1), (3, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, fc, true],
            Some(12),
        )
        .unwrap()
    }

    fn attach(net: &mut Network<f64>, options: DimensionOptions) {
        net.set_layer_dimension(
            1,
            &[(1, 1), (4, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            options,
        )
        .unwrap();
    }

    #[test]
    fn per_neuron_and_shared_counts() {
        let mut a = host(true);
        attach(&mut a, DimensionOptions::default());
        assert_eq!(a.layer_dimension(1).unwrap().networks().len(), 3);
        assert!(a.layer_dimension(1).unwrap().network(3).is_none());

        let mut b = host(true);
        attach(&mut b, DimensionOptions::shared());
        let dim = b.layer_dimension(1).unwrap();
        assert!(dim.is_shared());
        assert_eq!(dim.networks().len(), 1);
        assert!(std::ptr::eq(dim.network(0).unwrap(), dim.network(2).unwrap()));
    }

    #[test]
    fn forward_adds_sub_network_output() {
        let input = [vec![0.3, -0.6]];
        let mut plain = host(true);
        plain.forward(&input).unwrap();

        let mut dim = host(true);
        attach(&mut dim, DimensionOptions::default());
        dim.forward(&input).unwrap();

        for (r, n) in dim.layers()[1].neurons().iter().enumerate() {
            let s = plain.layers()[1].neurons()[r].sum;
            let mut sub = dim.layer_dimension(1).unwrap().network(r).unwrap().clone();
            sub.forward(&[vec![s]]).unwrap();
            let z = s + sub.output()[0];
            assert!((n.sum - z).abs() < 1e-12);
            assert!((n.value - z.tanh()).abs() < 1e-12);
        }
    }

    #[test]
    fn bad_sub_shapes_are_rejected() {
        let mut n = host(true);
        let wide_input = n.set_layer_dimension(
            1,
            &[(2, 1), (1, 1)],
            &[Activation::Linear, Activation::Linear],
            &[true, true],
            DimensionOptions::default(),
        );
        assert!(matches!(wide_input, Err(NetError::ConfigInvalid(_))));
        let softmax = n.set_layer_dimension(
            1,
            &[(1, 1), (1, 1)],
            &[Activation::Linear, Activation::Softmax],
            &[true, true],
            DimensionOptions::default(),
        );
        assert!(softmax.is_err());
        assert!(n
            .set_layer_dimension(
                0,
                &[(1, 1), (1, 1)],
                &[Activation::Linear, Activation::Linear],
                &[true, true],
                DimensionOptions::default(),
            )
            .is_err());
        assert!(!n.has_dimensions());
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut n = host(false);
        attach(&mut n, DimensionOptions::default().with_init(InitMethod::Xavier));
        let x = vec![vec![0.2, -0.4]];
        let target = [vec![0.5]];
        n.forward(&x).unwrap();
        let grad = n.input_gradient(&target).unwrap();

        let h = 1e-6;
        for i in 0..2 {
            let mut up = x.clone();
            up[0][i] += h;
            let mut down = x.clone();
            down[0][i] -= h;
            n.forward(&up).unwrap();
            let lu = 0.5 * (n.output()[0] - 0.5).powi(2);
            n.forward(&down).unwrap();
            let ld = 0.5 * (n.output()[0] - 0.5).powi(2);
            let numeric = (lu - ld) / (2.0 * h);
            assert!((grad[0][i] - numeric).abs() < 1e-6, "{} vs {}", grad[0][i], numeric);
        }
    }

    #[test]
    fn backward_trains_sub_networks() {
        let mut n = host(true);
        attach(&mut n, DimensionOptions::shared().with_init(InitMethod::He));
        let before = n.layer_dimension(1).unwrap().clone();
        let input = [vec![0.7, 0.1]];
        let target = [vec![-0.4]];
        n.forward(&input).unwrap();
        let first = n.compute_loss(&target).unwrap();
        for _ in 0..200 {
            n.forward(&input).unwrap();
            n.backward(&target, 0.05, 1.0, -1.0).unwrap();
        }
        n.forward(&input).unwrap();
        assert!(n.compute_loss(&target).unwrap() < first * 0.01);
        assert!(!n.layer_dimension(1).unwrap().structurally_eq(&before));
    }

    #[test]
    fn tagged_backward_leaves_other_partition_sub_networks() {
        let mut n = host(true);
        attach(&mut n, DimensionOptions::default());
        let before = n.layer_dimension(1).unwrap().clone();
        let input = [vec![0.7, 0.1]];
        n.forward_tagged(&input, 2, 0).unwrap();
        n.backward_tagged(&[vec![1.0]], 0.1, 2, 0, 1.0, -1.0).unwrap();
        let after = n.layer_dimension(1).unwrap();
        // Neuron 1 sits in column 1, outside partition 0.
        assert!(after.networks()[1].structurally_eq(&before.networks()[1]));
        assert!(!after.networks()[0].structurally_eq(&before.networks()[0]));
    }

    #[test]
    fn clone_convert_and_clear() {
        let mut n = host(true);
        attach(&mut n, DimensionOptions::default());
        let copy = n.clone();
        assert!(copy.structurally_eq(&n));

        let narrow: Network<f32> = n.convert().unwrap();
        assert_eq!(narrow.layer_dimension(1).unwrap().networks().len(), 3);

        let taken = n.clear_layer_dimension(1).unwrap();
        assert_eq!(taken.networks().len(), 3);
        assert!(!n.has_dimensions());
        assert!(!copy.structurally_eq(&n));
    }

    #[test]
    fn init_method_parses_by_name() {
        assert_eq!("xavier".parse::<InitMethod>().unwrap(), InitMethod::Xavier);
        assert_eq!("he".parse::<InitMethod>().unwrap(), InitMethod::He);
        assert!("glorot".parse::<InitMethod>().is_err());
    }

    #[test]
    fn config_builds_the_same_sub_networks() {
        use crate::config::{DimensionSpec, LayerSpec, NetworkConfig};

        let mut direct = host(true);
        attach(&mut direct, DimensionOptions::default());

        let sub = DimensionSpec::new(vec![
            LayerSpec::new(1, 1, Activation::Linear),
            LayerSpec::new(4, 1, Activation::Tanh),
            LayerSpec::new(1, 1, Activation::Linear),
        ]);
        let config = NetworkConfig::new(vec![
            LayerSpec::new(2, 1, Activation::Linear),
            LayerSpec::new(3, 1, Activation::Tanh).with_dimension(sub),
            LayerSpec::new(1, 1, Activation::Linear),
        ])
        .with_seed(12);
        let built = Network::<f64>::new(config).unwrap();
        assert!(built.structurally_eq(&direct));
    }
}
