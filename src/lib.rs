//! # gridnet
//!
//! A grid-structured feed-forward neural network engine.
//!
//! Every layer is a 2-D grid of neurons with explicit fan-in connections,
//! generic over the scalar type (saturating integers or IEEE floats). The
//! same network runs on a scalar CPU path or on a wgpu compute path.
//!
//! ## Quick Start
//!
//! ```
//! use gridnet::prelude::*;
//!
//! let mut net = Network::<f32>::create(
//!     &[(3, 1), (8, 1), (2, 1)],
//!     &[Activation::Linear, Activation::Relu, Activation::Softmax],
//!     &[true, true, true],
//!     Some(42),
//! )
//! .unwrap();
//!
//! net.forward(&[vec![0.1, 0.5, 0.9]]).unwrap();
//! let out = net.output();
//! assert!((out.iter().sum::<f64>() - 1.0).abs() < 1e-6);
//! ```
//!
//! ## Feature Flags
//!
//! - `gpu`: Enable wgpu compute shaders for dense layers
//! - `simd`: Enable SIMD dot products on baked layers via the `wide` crate
//! - `parallel`: Train independent networks concurrently via rayon
//!
//! ## Modules
//!
//! - [`network`]: Network construction, lifecycle and backend state
//! - [`forward`] / [`backward`]: CPU execution and training
//! - [`replay`]: Static and gated layer re-execution
//! - [`dimension`]: Per-neuron sub-networks
//! - [`micro`]: Checkpoint extraction and three-way verification
//! - [`codec`]: Text and binary serialization
//! - [`eval`]: Deviation buckets and diagnostics
//! - [`reverse`]: Output-to-input inference

#[path = "core/error.rs"]
pub mod error;

#[path = "core/numeric.rs"]
pub mod numeric;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/activation.rs"]
pub mod activation;

#[path = "core/replay.rs"]
pub mod replay;

#[path = "core/grid.rs"]
pub mod grid;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/forward.rs"]
pub mod forward;

#[path = "core/backward.rs"]
pub mod backward;

#[path = "core/train.rs"]
pub mod train;

#[path = "core/dense.rs"]
pub mod dense;

#[path = "core/backend.rs"]
pub mod backend;

#[cfg(feature = "gpu")]
#[path = "core/gpu.rs"]
pub mod gpu;

#[path = "core/dimension.rs"]
pub mod dimension;

#[path = "core/micro.rs"]
pub mod micro;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/codec.rs"]
pub mod codec;

#[path = "core/eval.rs"]
pub mod eval;

#[path = "core/reverse.rs"]
pub mod reverse;

#[path = "core/dataset.rs"]
pub mod dataset;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use gridnet::prelude::*;
/// ```
pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::backend::{Backend, BackendState, BackendStatus};
    pub use crate::codec::AnyNetwork;
    pub use crate::config::{DimensionSpec, LayerSpec, NetworkConfig, TrainConfig};
    pub use crate::dimension::{DimensionOptions, InitMethod};
    pub use crate::error::{NetError, Result};
    pub use crate::eval::Performance;
    pub use crate::micro::{MicroNetwork, ThreeWayReport};
    pub use crate::network::Network;
    pub use crate::numeric::Scalar;
    pub use crate::replay::{Gate, RepeatMap, ReplayConfig, ReplayPhase};
    pub use crate::reverse::IterativeInverse;
}
