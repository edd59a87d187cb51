//! Construction and training options, loadable from JSON.

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::backend::Backend;
use crate::dimension::{DimensionOptions, InitMethod};
use crate::error::{NetError, Result};
use crate::replay::ReplayConfig;
pub use crate::replay::ReplaySpec;

/// Default Chebyshev radius of sparse fan-in windows.
pub const DEFAULT_SPARSE_RADIUS: usize = 1;

fn default_true() -> bool {
    true
}

fn default_radius() -> usize {
    DEFAULT_SPARSE_RADIUS
}

/// One layer of a [`NetworkConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_true")]
    pub fully_connected: bool,
    #[serde(default)]
    pub replay: ReplaySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<DimensionSpec>,
}

/// Sub-networks for every neuron of a layer. Their layers cannot replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub init: InitMethod,
}

impl DimensionSpec {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self {
            layers,
            shared: false,
            init: InitMethod::default(),
        }
    }

    pub fn options(&self) -> DimensionOptions {
        DimensionOptions {
            shared: self.shared,
            init: self.init,
        }
    }
}

impl LayerSpec {
    pub fn new(width: usize, height: usize, activation: Activation) -> Self {
        Self {
            width,
            height,
            activation,
            fully_connected: true,
            replay: ReplaySpec::default(),
            dimension: None,
        }
    }

    pub fn sparse(mut self) -> Self {
        self.fully_connected = false;
        self
    }

    pub fn with_replay(mut self, replay: &ReplayConfig) -> Self {
        self.replay = replay.to_spec();
        self
    }

    pub fn with_dimension(mut self, dimension: DimensionSpec) -> Self {
        self.dimension = Some(dimension);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_radius")]
    pub sparse_radius: usize,
    #[serde(default)]
    pub backend: Backend,
    /// Emit a debug event for every dispatch.
    #[serde(default)]
    pub debug: bool,
}

impl NetworkConfig {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self {
            layers,
            seed: None,
            sparse_radius: DEFAULT_SPARSE_RADIUS,
            backend: Backend::Cpu,
            debug: false,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_sparse_radius(mut self, radius: usize) -> Self {
        self.sparse_radius = radius;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| NetError::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(NetError::config("network needs at least one layer"));
        }
        for (i, l) in self.layers.iter().enumerate() {
            if l.width == 0 || l.height == 0 {
                return Err(NetError::config(format!(
                    "layer {i} has zero size ({}x{})",
                    l.width, l.height
                )));
            }
            if l.width > u32::MAX as usize || l.height > u32::MAX as usize {
                return Err(NetError::config(format!("layer {i} is too large")));
            }
        }
        for (i, l) in self.layers.iter().enumerate().skip(1) {
            ReplayConfig::from_spec(&l.replay).validate(i, self.layers.len())?;
        }
        if self.layers[0].replay.enabled {
            return Err(NetError::config("the input layer cannot replay"));
        }
        if self.layers[0].dimension.is_some() {
            return Err(NetError::config("the input layer cannot carry sub-networks"));
        }
        for (i, l) in self.layers.iter().enumerate() {
            let Some(dim) = &l.dimension else { continue };
            if dim.layers.iter().any(|s| s.replay.enabled || s.dimension.is_some()) {
                return Err(NetError::config(format!(
                    "sub-networks of layer {i} cannot replay or nest"
                )));
            }
        }
        Ok(())
    }
}

/// Options for [`Network::train_with`](crate::network::Network::train_with).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub shuffle: bool,
    pub clip_upper: f64,
    pub clip_lower: f64,
    /// Log every epoch at info instead of debug.
    pub debug: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 0.01,
            shuffle: false,
            clip_upper: 1.0,
            clip_lower: -1.0,
            debug: false,
        }
    }
}

impl TrainConfig {
    pub fn new(epochs: usize, learning_rate: f64) -> Self {
        Self {
            epochs,
            learning_rate,
            ..Self::default()
        }
    }

    pub fn with_clip(mut self, lower: f64, upper: f64) -> Self {
        self.clip_lower = lower;
        self.clip_upper = upper;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() {
            return Err(NetError::config("learning rate must be finite"));
        }
        if self.clip_lower > self.clip_upper {
            return Err(NetError::config(format!(
                "clip_lower {} exceeds clip_upper {}",
                self.clip_lower, self.clip_upper
            )));
        }
        Ok(())
    }
}
