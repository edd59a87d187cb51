//! Execution backend selection and the CPU/GPU state machine.
//!
//! ```text
//! CpuOnly --initialize_gpu--> GpuInitialising --> GpuReady | GpuFailed
//! GpuFailed --forward/backward--> CpuOnly (fallback reported once)
//! GpuReady --teardown_gpu--> CpuOnly (weights synced first)
//! ```

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backward::ClipRange;
use crate::error::{NetError, Result};
use crate::network::Network;
use crate::numeric::Scalar;

/// Requested execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    CpuOnly,
    GpuInitialising,
    GpuReady,
    GpuFailed { reason: String },
}

/// Snapshot returned by [`Network::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub state: BackendState,
    /// Why the last GPU request fell back to the CPU.
    pub fallback_reason: Option<String>,
    /// Device weights are newer than host weights; call `sync_weights_to_host`.
    pub host_stale: bool,
}

impl<T: Scalar> Network<T> {
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            state: self.state.clone(),
            fallback_reason: self.fallback_reason.clone(),
            host_stale: self.host_stale,
        }
    }

    /// Backend that forward and backward currently run on.
    pub fn backend(&self) -> Backend {
        match self.state {
            BackendState::GpuReady => Backend::Gpu,
            _ => Backend::Cpu,
        }
    }

    pub fn set_backend(&mut self, backend: Backend) -> Result<()> {
        match backend {
            Backend::Cpu => self.teardown_gpu(),
            Backend::Gpu => self.initialize_gpu(),
        }
    }

    /// Allocate device buffers and upload the weights.
    ///
    /// On failure the network stays usable on the CPU and the reason is kept in
    /// [`status`](Network::status).
    pub fn initialize_gpu(&mut self) -> Result<()> {
        if self.state == BackendState::GpuReady {
            return Ok(());
        }
        self.state = BackendState::GpuInitialising;
        info!("initialising GPU backend for {} network", T::TYPE_NAME);
        match self.open_gpu() {
            Ok(()) => {
                self.state = BackendState::GpuReady;
                self.fallback_reason = None;
                info!("GPU backend ready");
                Ok(())
            }
            Err(reason) => {
                info!("GPU backend failed: {}", reason);
                self.fallback_reason = Some(reason.clone());
                self.state = BackendState::GpuFailed {
                    reason: reason.clone(),
                };
                Err(NetError::BackendUnavailable(reason))
            }
        }
    }

    /// Sync weights to the host and release device buffers.
    pub fn teardown_gpu(&mut self) -> Result<()> {
        match self.state {
            BackendState::GpuReady => {
                self.sync_weights_to_host()?;
                self.close_gpu();
                self.state = BackendState::CpuOnly;
                info!("GPU backend released");
            }
            BackendState::GpuFailed { .. } | BackendState::GpuInitialising => {
                self.close_gpu();
                self.state = BackendState::CpuOnly;
            }
            BackendState::CpuOnly => {}
        }
        Ok(())
    }

    /// Report a failed GPU request once and continue on the CPU.
    pub(crate) fn note_fallback(&mut self) {
        if let BackendState::GpuFailed { reason } = &self.state {
            warn!("GPU unavailable, running on CPU: {}", reason);
            self.fallback_reason = Some(reason.clone());
            self.state = BackendState::CpuOnly;
        }
    }

    pub(crate) fn mark_device_stale(&mut self) {
        self.device_stale = true;
    }

    /// Make host weights current before a CPU read or write.
    pub(crate) fn ensure_host_weights(&mut self) {
        if self.host_stale {
            if let Err(e) = self.sync_weights_to_host() {
                warn!("could not read weights back from the GPU: {}", e);
            }
        }
    }
}

#[cfg(not(feature = "gpu"))]
impl<T: Scalar> Network<T> {
    fn open_gpu(&mut self) -> std::result::Result<(), String> {
        Err("built without the `gpu` feature".into())
    }

    fn close_gpu(&mut self) {}

    /// Copy device weights into the connections. A no-op without a device.
    pub fn sync_weights_to_host(&mut self) -> Result<()> {
        self.host_stale = false;
        Ok(())
    }

    pub(crate) fn refresh_device(&mut self) {
        self.device_stale = false;
    }

    pub(crate) fn try_gpu_forward(&mut self, _input: &[Vec<f64>]) -> bool {
        false
    }

    pub(crate) fn try_gpu_backward(&mut self, _target: &[Vec<f64>], _lr: f64, _clip: ClipRange<T>) -> bool {
        false
    }
}

#[cfg(feature = "gpu")]
mod device {
    use tracing::{debug, warn};

    use super::BackendState;
    use crate::activation::{softmax_rows, Activation};
    use crate::backward::ClipRange;
    use crate::error::{NetError, Result};
    use crate::gpu::{GpuError, GpuNetwork, LayerPlan, Quantize};
    use crate::network::Network;
    use crate::numeric::Scalar;

    #[inline]
    fn to_f32<T: Scalar>(v: T) -> f32 {
        v.to_f64() as f32
    }

    #[inline]
    fn from_f32<T: Scalar>(v: f32) -> T {
        T::from_f64(v as f64)
    }

    impl<T: Scalar> Network<T> {
        pub(super) fn open_gpu(&mut self) -> std::result::Result<(), String> {
            if !T::GPU_EXACT {
                return Err(format!("{} has no exact f32 representation", T::TYPE_NAME));
            }
            self.ensure_host_weights();
            self.flush_dense();
            let gpu = GpuNetwork::new(&self.gpu_plan(), self.quantize(), self.debug)
                .map_err(|e| e.to_string())?;
            self.gpu = Some(gpu);
            self.host_stale = false;
            self.device_stale = false;
            Ok(())
        }

        pub(super) fn close_gpu(&mut self) {
            self.gpu = None;
            self.host_stale = false;
            self.device_stale = false;
        }

        fn quantize(&self) -> Quantize {
            Quantize {
                enabled: !T::IS_FLOAT,
                lo: to_f32(T::MIN),
                hi: to_f32(T::MAX),
            }
        }

        fn gpu_plan(&self) -> Vec<LayerPlan> {
            self.layers
                .iter()
                .enumerate()
                .map(|(l, g)| {
                    let on_device = l > 0
                        && g.fully_connected
                        && g.is_canonical_dense(l, self.layers[l - 1].shape());
                    LayerPlan {
                        len: g.len(),
                        act: g.activation.code(),
                        dense: on_device.then(|| self.layer_weights_f32(l)),
                    }
                })
                .collect()
        }

        fn layer_weights_f32(&self, l: usize) -> (Vec<f32>, Vec<f32>) {
            let g = &self.layers[l];
            let weights = g
                .neurons
                .iter()
                .flat_map(|n| n.connections.iter().map(|c| to_f32(c.weight)))
                .collect();
            let biases = g.neurons.iter().map(|n| to_f32(n.bias)).collect();
            (weights, biases)
        }

        /// Copy device weights into the connections (and dense mirrors).
        pub fn sync_weights_to_host(&mut self) -> Result<()> {
            let Some(gpu) = self.gpu.as_ref() else {
                self.host_stale = false;
                return Ok(());
            };
            if !self.host_stale {
                return Ok(());
            }
            for l in 1..self.layers.len() {
                if !gpu.is_device_layer(l) {
                    continue;
                }
                let (w, b) = gpu
                    .read_weights(l)
                    .map_err(|e| NetError::BackendUnavailable(e.to_string()))?;
                let cols = self.layers[l - 1].len();
                let grid = &mut self.layers[l];
                for (r, n) in grid.neurons.iter_mut().enumerate() {
                    n.bias = from_f32(b[r]);
                    for (c, conn) in n.connections.iter_mut().enumerate() {
                        conn.weight = from_f32(w[r * cols + c]);
                    }
                    if let Some(cache) = grid.dense.as_mut() {
                        cache.mirror_bias(r, n.bias);
                        for (c, conn) in n.connections.iter().enumerate() {
                            cache.mirror_weight(r, c, conn.weight);
                        }
                    }
                }
            }
            self.host_stale = false;
            Ok(())
        }

        /// Re-upload host weights if they changed since the last upload.
        pub(crate) fn refresh_device(&mut self) {
            if !self.device_stale {
                return;
            }
            let Some(gpu) = self.gpu.as_ref() else {
                self.device_stale = false;
                return;
            };
            for l in 1..self.layers.len() {
                if !gpu.is_device_layer(l) {
                    continue;
                }
                let (w, b) = self.layer_weights_f32(l);
                if let Err(e) = gpu.write_weights(l, &w, &b) {
                    warn!("could not upload layer {} weights: {}", l, e);
                }
            }
            self.device_stale = false;
        }

        fn gpu_ready(&self) -> bool {
            self.state == BackendState::GpuReady && self.gpu.is_some()
        }

        pub(crate) fn try_gpu_forward(&mut self, input: &[Vec<f64>]) -> bool {
            if !self.gpu_ready() {
                return false;
            }
            // Replay re-enters layers with overrides and sub-networks run per
            // neuron; both stay on the CPU.
            if self.layers.iter().any(|g| g.replay.enabled) || self.has_dimensions() {
                return false;
            }
            self.flush_dense();
            self.refresh_device();
            match self.gpu_forward(input) {
                Ok(()) => true,
                Err(e) => {
                    warn!("GPU forward failed, using CPU for this sample: {}", e);
                    false
                }
            }
        }

        fn gpu_forward(&mut self, input: &[Vec<f64>]) -> std::result::Result<(), GpuError> {
            self.load_input(input);
            let Some(gpu) = self.gpu.take() else {
                return Err(GpuError::NoAdapter);
            };
            let result = self.drive_forward(&gpu);
            self.gpu = Some(gpu);
            result
        }

        fn drive_forward(&mut self, gpu: &GpuNetwork) -> std::result::Result<(), GpuError> {
            let n = self.layers.len();
            let values: Vec<f32> = self.layers[0].neurons.iter().map(|x| to_f32(x.value)).collect();
            gpu.write_values(0, &values);

            // Host copies of layers below `host_upto` are current.
            let mut host_upto = 1;
            for l in 1..n {
                if gpu.is_device_layer(l) {
                    gpu.forward_layer(l)?;
                    if self.layers[l].activation == Activation::Softmax {
                        self.pull_layer(gpu, l)?;
                        let width = self.layers[l].width;
                        let mut vals = self.layers[l].values();
                        softmax_rows(&mut vals, width);
                        for (nrn, v) in self.layers[l].neurons.iter_mut().zip(&vals) {
                            nrn.value = *v;
                        }
                        let vals: Vec<f32> = vals.into_iter().map(to_f32).collect();
                        gpu.write_values(l, &vals);
                        host_upto = host_upto.max(l + 1);
                    }
                } else {
                    for k in host_upto..l {
                        self.pull_layer(gpu, k)?;
                    }
                    self.eval_layer(l, None, None);
                    let vals: Vec<f32> = self.layers[l].neurons.iter().map(|x| to_f32(x.value)).collect();
                    let sums: Vec<f32> = self.layers[l].neurons.iter().map(|x| to_f32(x.sum)).collect();
                    gpu.write_values(l, &vals);
                    gpu.write_pre(l, &sums);
                    host_upto = l + 1;
                    if self.debug {
                        debug!("layer {} evaluated on CPU inside a GPU forward", l);
                    }
                }
            }
            for k in host_upto..n {
                self.pull_layer(gpu, k)?;
            }
            for g in &mut self.layers {
                g.refresh_cache();
            }
            Ok(())
        }

        fn pull_layer(&mut self, gpu: &GpuNetwork, l: usize) -> std::result::Result<(), GpuError> {
            let values = gpu.read_values(l)?;
            let sums = gpu.read_pre(l)?;
            for ((nrn, v), s) in self.layers[l].neurons.iter_mut().zip(values).zip(sums) {
                nrn.value = from_f32(v);
                nrn.sum = from_f32(s);
            }
            Ok(())
        }

        pub(crate) fn try_gpu_backward(&mut self, target: &[Vec<f64>], lr: f64, clip: ClipRange<T>) -> bool {
            let on_device = self.gpu.as_ref().is_some_and(GpuNetwork::fully_on_device);
            if !self.gpu_ready() || !on_device || self.has_dimensions() {
                return false;
            }
            self.flush_dense();
            self.refresh_device();
            let Some(mut gpu) = self.gpu.take() else {
                return false;
            };
            let result = self.drive_backward(&mut gpu, target, lr, clip);
            self.gpu = Some(gpu);
            match result {
                Ok(()) => {
                    self.host_stale = true;
                    true
                }
                Err(e) => {
                    warn!("GPU backward failed, using CPU for this sample: {}", e);
                    self.host_stale = true;
                    self.ensure_host_weights();
                    false
                }
            }
        }

        fn drive_backward(
            &mut self,
            gpu: &mut GpuNetwork,
            target: &[Vec<f64>],
            lr: f64,
            clip: ClipRange<T>,
        ) -> std::result::Result<(), GpuError> {
            // Host state is the last forward's; mirror it so the kernels see it.
            for (l, g) in self.layers.iter().enumerate() {
                let vals: Vec<f32> = g.neurons.iter().map(|x| to_f32(x.value)).collect();
                let sums: Vec<f32> = g.neurons.iter().map(|x| to_f32(x.sum)).collect();
                gpu.write_values(l, &vals);
                gpu.write_pre(l, &sums);
            }
            self.seed_output_error(target);
            let out = self.output_index();
            let errors: Vec<f32> = self.layers[out].neurons.iter().map(|x| x.error as f32).collect();
            gpu.write_errors(out, &errors);
            gpu.backward(lr as f32, to_f32(clip.lower), to_f32(clip.upper))
        }
    }
}
