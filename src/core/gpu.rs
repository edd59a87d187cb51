//! GPU compute backend using wgpu for fully-connected layers.
//!
//! Every layer owns a values, pre-activation and error buffer. Layers that run on
//! the device additionally own dense f32 weights, biases and a uniform parameter
//! block; the input of layer L is bound to the values buffer of layer L-1.
//! Integer networks are emulated in f32 by rounding (ties away from zero) and
//! clamping to the scalar range inside the shaders.
//!
//! Enable with the `gpu` feature flag.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, OnceLock};

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use thiserror::Error;
use tracing::debug;
use wgpu::util::DeviceExt;

/// Maximum CPU/GPU forward deviation for f32 networks.
pub const GPU_F32_TOLERANCE: f64 = 1e-5;
/// Maximum CPU/GPU forward deviation for quantized integer networks.
pub const GPU_QUANTIZED_TOLERANCE: f64 = 1e-3;

/// Cap on the workgroup size, below device limits.
const MAX_WORKGROUP: u32 = 256;

/// Uniform block shared by the three kernels (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LayerParams {
    pub in_len: u32,
    pub out_len: u32,
    pub act: u32,
    pub prev_act: u32,
    pub quantize: u32,
    pub lo: f32,
    pub hi: f32,
    pub lr: f32,
    pub clip_lo: f32,
    pub clip_hi: f32,
    pub _pad: [u32; 2],
}

/// Error type for GPU operations.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no compatible GPU adapter")]
    NoAdapter,
    #[error("failed to receive GPU result")]
    ReceiveError,
    #[error("GPU buffer mapping failed: {0:?}")]
    MapError(wgpu::BufferAsyncError),
    #[error("GPU validation failed: {0}")]
    Validation(String),
    #[error("layer {0} has no device weights")]
    NotOnDevice(usize),
    #[error("expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("pipeline cache poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kernel {
    Forward,
    Propagate,
    Update,
}

impl Kernel {
    fn body(self) -> &'static str {
        match self {
            Kernel::Forward => FORWARD_BODY,
            Kernel::Propagate => PROPAGATE_BODY,
            Kernel::Update => UPDATE_BODY,
        }
    }
}

/// Device, queue and pipelines shared by every network in the process.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<HashMap<(Kernel, u32), Arc<wgpu::ComputePipeline>>>,
    limits: wgpu::Limits,
    adapter_name: String,
}

static CONTEXT: OnceLock<Option<Arc<GpuContext>>> = OnceLock::new();

/// The process-wide context, created on first use. `None` when no adapter exists.
pub fn shared_context() -> Option<Arc<GpuContext>> {
    CONTEXT
        .get_or_init(|| GpuContext::new().map(Arc::new))
        .clone()
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuContext {
    /// Create a new GPU context. Blocks until the device is ready.
    pub fn new() -> Option<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gridnet GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .ok()?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Layer Bind Group Layout"),
            entries: &[
                // Weights, biases
                storage_entry(0, false),
                storage_entry(1, false),
                // Previous layer values
                storage_entry(2, true),
                // Own values, pre-activation sums, errors
                storage_entry(3, false),
                storage_entry(4, false),
                storage_entry(5, false),
                // Previous layer sums and errors
                storage_entry(6, true),
                storage_entry(7, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Layer Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let limits = device.limits();

        Some(Self {
            device,
            queue,
            bind_group_layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
            limits,
            adapter_name,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// `min(next_pow2(threads), device limits, 256)`.
    pub fn workgroup_size(&self, threads: usize) -> u32 {
        let want = (threads.max(1) as u32).next_power_of_two();
        want.min(self.limits.max_compute_invocations_per_workgroup)
            .min(self.limits.max_compute_workgroup_size_x)
            .min(MAX_WORKGROUP)
            .max(1)
    }

    fn pipeline(&self, kernel: Kernel, wg: u32) -> Result<Arc<wgpu::ComputePipeline>, GpuError> {
        let mut cache = self.pipelines.lock().map_err(|_| GpuError::Poisoned)?;
        if let Some(p) = cache.get(&(kernel, wg)) {
            return Ok(Arc::clone(p));
        }
        let source = format!("{SHADER_HEADER}{}", kernel.body()).replace("@WG@", &wg.to_string());
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Layer Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });
        let pipeline = Arc::new(self.device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some("Layer Pipeline"),
                layout: Some(&self.pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            },
        ));
        cache.insert((kernel, wg), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn storage(&self, label: &str, contents: &[f32]) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        })
    }

    fn read(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<f32>, GpuError> {
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        let map_result = rx.recv().map_err(|_| GpuError::ReceiveError)?;
        map_result.map_err(GpuError::MapError)?;

        let data = slice.get_mapped_range();
        let out = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    fn scoped<R>(&self, f: impl FnOnce() -> Result<R, GpuError>) -> Result<R, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Validation(err.to_string()));
        }
        out
    }
}

/// Host-side description of one layer for upload.
#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub len: usize,
    pub act: u32,
    /// Row-major weights and biases; `None` keeps the layer on the CPU.
    pub dense: Option<(Vec<f32>, Vec<f32>)>,
}

/// Integer emulation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantize {
    pub enabled: bool,
    pub lo: f32,
    pub hi: f32,
}

struct DeviceWeights {
    weights: wgpu::Buffer,
    biases: wgpu::Buffer,
    params: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    params_data: LayerParams,
}

struct GpuLayer {
    len: usize,
    in_len: usize,
    values: wgpu::Buffer,
    pre: wgpu::Buffer,
    errors: wgpu::Buffer,
    device: Option<DeviceWeights>,
}

/// Device buffers for one network.
pub struct GpuNetwork {
    ctx: Arc<GpuContext>,
    layers: Vec<GpuLayer>,
    debug: bool,
}

impl GpuNetwork {
    pub fn new(plan: &[LayerPlan], quantize: Quantize, debug: bool) -> Result<Self, GpuError> {
        let ctx = shared_context().ok_or(GpuError::NoAdapter)?;
        let layers = ctx.scoped(|| {
            let mut layers: Vec<GpuLayer> = Vec::with_capacity(plan.len());
            for (l, p) in plan.iter().enumerate() {
                let zeros = vec![0.0f32; p.len];
                let values = ctx.storage("Values Buffer", &zeros);
                let pre = ctx.storage("Pre Buffer", &zeros);
                let errors = ctx.storage("Errors Buffer", &zeros);
                let in_len = if l == 0 { 0 } else { plan[l - 1].len };
                let device = match (&p.dense, l) {
                    (Some((w, b)), l) if l > 0 => {
                        let prev = &layers[l - 1];
                        let params_data = LayerParams {
                            in_len: in_len as u32,
                            out_len: p.len as u32,
                            act: p.act,
                            prev_act: plan[l - 1].act,
                            quantize: quantize.enabled as u32,
                            lo: quantize.lo,
                            hi: quantize.hi,
                            lr: 0.0,
                            clip_lo: 0.0,
                            clip_hi: 0.0,
                            _pad: [0; 2],
                        };
                        let weights = ctx.storage("Weights Buffer", w);
                        let biases = ctx.storage("Biases Buffer", b);
                        let params = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("Params Buffer"),
                            contents: bytemuck::bytes_of(&params_data),
                            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        });
                        let buffers = [
                            &weights,
                            &biases,
                            &prev.values,
                            &values,
                            &pre,
                            &errors,
                            &prev.pre,
                            &prev.errors,
                            &params,
                        ];
                        let entries: Vec<wgpu::BindGroupEntry> = buffers
                            .iter()
                            .enumerate()
                            .map(|(i, b)| wgpu::BindGroupEntry {
                                binding: i as u32,
                                resource: b.as_entire_binding(),
                            })
                            .collect();
                        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some("Layer Bind Group"),
                            layout: &ctx.bind_group_layout,
                            entries: &entries,
                        });
                        Some(DeviceWeights {
                            weights,
                            biases,
                            params,
                            bind_group,
                            params_data,
                        })
                    }
                    _ => None,
                };
                layers.push(GpuLayer {
                    len: p.len,
                    in_len,
                    values,
                    pre,
                    errors,
                    device,
                });
            }
            Ok(layers)
        })?;
        debug!(
            "GPU network on {}: {} of {} layers on device",
            ctx.adapter_name(),
            layers.iter().filter(|l| l.device.is_some()).count(),
            layers.len()
        );
        Ok(Self { ctx, layers, debug })
    }

    pub fn is_device_layer(&self, layer: usize) -> bool {
        self.layers.get(layer).is_some_and(|l| l.device.is_some())
    }

    /// True when every non-input layer runs on the device.
    pub fn fully_on_device(&self) -> bool {
        self.layers.iter().skip(1).all(|l| l.device.is_some())
    }

    fn device_layer(&self, layer: usize) -> Result<&DeviceWeights, GpuError> {
        self.layers
            .get(layer)
            .and_then(|l| l.device.as_ref())
            .ok_or(GpuError::NotOnDevice(layer))
    }

    pub fn write_values(&self, layer: usize, values: &[f32]) {
        if let Some(l) = self.layers.get(layer) {
            self.ctx.queue.write_buffer(&l.values, 0, bytemuck::cast_slice(values));
        }
    }

    pub fn write_pre(&self, layer: usize, sums: &[f32]) {
        if let Some(l) = self.layers.get(layer) {
            self.ctx.queue.write_buffer(&l.pre, 0, bytemuck::cast_slice(sums));
        }
    }

    pub fn write_errors(&self, layer: usize, errors: &[f32]) {
        if let Some(l) = self.layers.get(layer) {
            self.ctx.queue.write_buffer(&l.errors, 0, bytemuck::cast_slice(errors));
        }
    }

    pub fn write_weights(&self, layer: usize, weights: &[f32], biases: &[f32]) -> Result<(), GpuError> {
        let d = self.device_layer(layer)?;
        self.ctx.queue.write_buffer(&d.weights, 0, bytemuck::cast_slice(weights));
        self.ctx.queue.write_buffer(&d.biases, 0, bytemuck::cast_slice(biases));
        Ok(())
    }

    /// Overwrite a layer's weight buffer with raw little-endian f32 bytes.
    pub fn write_raw_weights(&self, layer: usize, bytes: &[u8]) -> Result<(), GpuError> {
        let d = self.device_layer(layer)?;
        let expected = d.weights.size() as usize;
        if bytes.len() != expected {
            return Err(GpuError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        self.ctx.queue.write_buffer(&d.weights, 0, bytes);
        Ok(())
    }

    pub fn read_values(&self, layer: usize) -> Result<Vec<f32>, GpuError> {
        let l = &self.layers[layer];
        self.ctx.read(&l.values, l.len)
    }

    pub fn read_pre(&self, layer: usize) -> Result<Vec<f32>, GpuError> {
        let l = &self.layers[layer];
        self.ctx.read(&l.pre, l.len)
    }

    /// Row-major weights and biases of a device layer.
    pub fn read_weights(&self, layer: usize) -> Result<(Vec<f32>, Vec<f32>), GpuError> {
        let d = self.device_layer(layer)?;
        let l = &self.layers[layer];
        let w = self.ctx.read(&d.weights, l.len * l.in_len)?;
        let b = self.ctx.read(&d.biases, l.len)?;
        Ok((w, b))
    }

    /// One forward dispatch for a device layer.
    pub fn forward_layer(&self, layer: usize) -> Result<(), GpuError> {
        let d = self.device_layer(layer)?;
        let len = self.layers[layer].len;
        let wg = self.ctx.workgroup_size(len);
        let pipeline = self.ctx.pipeline(Kernel::Forward, wg)?;
        self.ctx.scoped(|| {
            let mut encoder = self
                .ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Forward Encoder"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Forward Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &d.bind_group, &[]);
                pass.dispatch_workgroups((len as u32).div_ceil(wg), 1, 1);
            }
            self.ctx.queue.submit(std::iter::once(encoder.finish()));
            Ok(())
        })?;
        if self.debug {
            debug!("gpu dispatch: forward layer {} ({} threads, workgroup {})", layer, len, wg);
        }
        Ok(())
    }

    /// Error propagation for every layer, then every weight update, in one submission.
    ///
    /// The output layer's errors must already be written.
    pub fn backward(&mut self, lr: f32, clip_lo: f32, clip_hi: f32) -> Result<(), GpuError> {
        let n = self.layers.len();
        for l in 1..n {
            let d = self.layers[l]
                .device
                .as_mut()
                .ok_or(GpuError::NotOnDevice(l))?;
            d.params_data.lr = lr;
            d.params_data.clip_lo = clip_lo;
            d.params_data.clip_hi = clip_hi;
            self.ctx
                .queue
                .write_buffer(&d.params, 0, bytemuck::bytes_of(&d.params_data));
        }

        let mut steps = Vec::with_capacity(2 * n);
        for l in (2..n).rev() {
            let threads = self.layers[l].in_len;
            let wg = self.ctx.workgroup_size(threads);
            steps.push((Kernel::Propagate, l, threads, wg));
        }
        for l in (1..n).rev() {
            let threads = self.layers[l].len;
            let wg = self.ctx.workgroup_size(threads);
            steps.push((Kernel::Update, l, threads, wg));
        }
        let pipelines = steps
            .iter()
            .map(|&(k, _, _, wg)| self.ctx.pipeline(k, wg))
            .collect::<Result<Vec<_>, _>>()?;

        self.ctx.scoped(|| {
            let mut encoder = self
                .ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Backward Encoder"),
                });
            for (&(_, l, threads, wg), pipeline) in steps.iter().zip(&pipelines) {
                let d = self.device_layer(l)?;
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Backward Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &d.bind_group, &[]);
                pass.dispatch_workgroups((threads as u32).div_ceil(wg), 1, 1);
            }
            self.ctx.queue.submit(std::iter::once(encoder.finish()));
            Ok(())
        })?;
        if self.debug {
            for &(k, l, threads, wg) in &steps {
                debug!("gpu dispatch: {:?} layer {} ({} threads, workgroup {})", k, l, threads, wg);
            }
        }
        Ok(())
    }
}

const SHADER_HEADER: &str = r#"
struct Params {
    in_len: u32,
    out_len: u32,
    act: u32,
    prev_act: u32,
    quantize: u32,
    lo: f32,
    hi: f32,
    lr: f32,
    clip_lo: f32,
    clip_hi: f32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read_write> weights: array<f32>;
@group(0) @binding(1) var<storage, read_write> biases: array<f32>;
@group(0) @binding(2) var<storage, read> prev_values: array<f32>;
@group(0) @binding(3) var<storage, read_write> values: array<f32>;
@group(0) @binding(4) var<storage, read_write> pre: array<f32>;
@group(0) @binding(5) var<storage, read_write> errors: array<f32>;
@group(0) @binding(6) var<storage, read> prev_pre: array<f32>;
@group(0) @binding(7) var<storage, read_write> prev_errors: array<f32>;
@group(0) @binding(8) var<uniform> params: Params;

fn round_away(x: f32) -> f32 {
    return sign(x) * floor(abs(x) + 0.5);
}

fn quant(x: f32) -> f32 {
    if params.quantize == 1u {
        return clamp(round_away(x), params.lo, params.hi);
    }
    return x;
}

fn activate(x: f32, act: u32) -> f32 {
    switch act {
        case 1u: { return max(x, 0.0); }
        case 2u: {
            if x > 0.0 { return x; }
            return 0.01 * x;
        }
        case 3u: { return 1.0 / (1.0 + exp(-x)); }
        case 4u: { return tanh(clamp(x, -20.0, 20.0)); }
        case 5u: {
            if x >= 0.0 { return x; }
            return exp(x) - 1.0;
        }
        default: { return x; }
    }
}

fn derivative(x: f32, v: f32, act: u32) -> f32 {
    switch act {
        case 1u: {
            if x > 0.0 { return 1.0; }
            return 0.0;
        }
        case 2u: {
            if x > 0.0 { return 1.0; }
            return 0.01;
        }
        case 3u, 6u: { return v * (1.0 - v); }
        case 4u: {
            let t = tanh(clamp(x, -20.0, 20.0));
            return 1.0 - t * t;
        }
        case 5u: {
            if x >= 0.0 { return 1.0; }
            return exp(x);
        }
        default: { return 1.0; }
    }
}
"#;

const FORWARD_BODY: &str = r#"
@compute @workgroup_size(@WG@)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if i >= params.out_len {
        return;
    }
    var sum = quant(biases[i]);
    let row = i * params.in_len;
    if params.quantize == 1u {
        // Saturate every product and running total, as the host does.
        for (var j = 0u; j < params.in_len; j = j + 1u) {
            sum = quant(sum + quant(weights[row + j] * prev_values[j]));
        }
    } else {
        for (var j = 0u; j < params.in_len; j = j + 1u) {
            sum = sum + weights[row + j] * prev_values[j];
        }
    }
    pre[i] = sum;
    values[i] = quant(activate(sum, params.act));
}
"#;

const PROPAGATE_BODY: &str = r#"
@compute @workgroup_size(@WG@)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    if j >= params.in_len {
        return;
    }
    var acc = 0.0;
    for (var i = 0u; i < params.out_len; i = i + 1u) {
        acc = acc + weights[i * params.in_len + j] * errors[i];
    }
    prev_errors[j] = acc * derivative(prev_pre[j], prev_values[j], params.prev_act);
}
"#;

const UPDATE_BODY: &str = r#"
fn step_delta(d: f32) -> f32 {
    var v = d;
    if params.quantize == 1u {
        v = round_away(v);
    }
    return clamp(v, params.clip_lo, params.clip_hi);
}

fn settle(w: f32) -> f32 {
    if params.quantize == 1u {
        return clamp(w, params.lo, params.hi);
    }
    return w;
}

@compute @workgroup_size(@WG@)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if i >= params.out_len {
        return;
    }
    let err = errors[i];
    let row = i * params.in_len;
    for (var j = 0u; j < params.in_len; j = j + 1u) {
        let d = step_delta(-params.lr * err * prev_values[j]);
        weights[row + j] = settle(weights[row + j] + d);
    }
    biases[i] = settle(biases[i] + step_delta(-params.lr * err));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[test]
    fn gpu_context_creation() {
        // This test may fail on systems without GPU support
        match shared_context() {
            Some(ctx) => {
                println!("GPU context created on {}", ctx.adapter_name());
                assert_eq!(ctx.workgroup_size(10), 16);
                assert!(ctx.workgroup_size(100_000) <= MAX_WORKGROUP);
            }
            None => println!("No GPU available (expected in some CI environments)"),
        }
    }

    fn mnist_net() -> Network<f32> {
        Network::create(
            &[(28, 28), (2048, 1), (10, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Softmax],
            &[true, true, true],
            Some(2024),
        )
        .unwrap()
    }

    fn pattern() -> Vec<Vec<f64>> {
        (0..28)
            .map(|y| (0..28).map(|x| ((x * 7 + y * 3) % 11) as f64 / 10.0).collect())
            .collect()
    }

    #[test]
    fn cpu_gpu_forward_parity() {
        let mut gpu = mnist_net();
        if let Err(e) = gpu.initialize_gpu() {
            println!("No GPU available, skipping parity: {e}");
            return;
        }
        let mut cpu = mnist_net();
        let input = pattern();
        cpu.forward(&input).unwrap();
        gpu.forward(&input).unwrap();
        for (a, b) in cpu.output().iter().zip(gpu.output()) {
            assert!((a - b).abs() <= GPU_F32_TOLERANCE, "cpu {a} gpu {b}");
        }
    }

    fn saturating_i8() -> Network<i8> {
        let mut net = Network::<i8>::create(
            &[(3, 1), (1, 1)],
            &[Activation::Linear, Activation::Linear],
            &[true, true],
            Some(5),
        )
        .unwrap();
        for (c, w) in [100, 100, -100].into_iter().enumerate() {
            net.set_weight(1, 0, 0, c, w).unwrap();
        }
        net.set_bias(1, 0, 0, 0).unwrap();
        net
    }

    #[test]
    fn i8_forward_saturates_each_partial_sum() {
        let input = [vec![1.0, 1.0, 1.0]];
        let mut cpu = saturating_i8();
        cpu.forward(&input).unwrap();
        assert_eq!(cpu.output(), vec![27.0]);

        let mut gpu = saturating_i8();
        if let Err(e) = gpu.initialize_gpu() {
            println!("No GPU available, skipping i8 parity: {e}");
            return;
        }
        gpu.forward(&input).unwrap();
        assert_eq!(gpu.output(), cpu.output());
    }

    #[test]
    fn i16_cpu_gpu_forward_parity() {
        let build = || {
            Network::<i16>::create(
                &[(6, 1), (5, 1), (3, 1)],
                &[Activation::Linear, Activation::Relu, Activation::Linear],
                &[true, true, true],
                Some(17),
            )
            .unwrap()
        };
        let mut gpu = build();
        if gpu.initialize_gpu().is_err() {
            println!("No GPU available, skipping");
            return;
        }
        let mut cpu = build();
        for l in 1..3 {
            let width = cpu.layers()[l].neurons().len();
            let fan_in = cpu.layers()[l - 1].neurons().len();
            for x in 0..width {
                for c in 0..fan_in {
                    let w = 9000 - ((x * 7 + c * 13) % 5) as i16 * 4000;
                    cpu.set_weight(l, x, 0, c, w).unwrap();
                    gpu.set_weight(l, x, 0, c, w).unwrap();
                }
            }
        }
        let input = [vec![3.0, -2.0, 4.0, 1.0, -5.0, 2.0]];
        cpu.forward(&input).unwrap();
        gpu.forward(&input).unwrap();
        for (a, b) in cpu.output().iter().zip(gpu.output()) {
            assert!((a - b).abs() <= GPU_QUANTIZED_TOLERANCE, "cpu {a} gpu {b}");
        }
    }

    #[test]
    fn sub_networks_keep_gpu_networks_on_cpu() {
        let build = || {
            let mut n = Network::<f32>::create(
                &[(4, 1), (5, 1), (2, 1)],
                &[Activation::Linear, Activation::Tanh, Activation::Linear],
                &[true, true, true],
                Some(29),
            )
            .unwrap();
            n.set_layer_dimension(
                1,
                &[(1, 1), (3, 1), (1, 1)],
                &[Activation::Linear, Activation::Tanh, Activation::Linear],
                &[true, true, true],
                DimensionOptions::default(),
            )
            .unwrap();
            n
        };
        let mut gpu = build();
        if gpu.initialize_gpu().is_err() {
            println!("No GPU available, skipping");
            return;
        }
        let mut cpu = build();
        let input = [vec![0.2, -0.4, 0.6, 0.1]];
        let target = [vec![0.5, -0.5]];
        for _ in 0..3 {
            cpu.forward(&input).unwrap();
            gpu.forward(&input).unwrap();
            assert_eq!(cpu.output(), gpu.output());
            cpu.backward(&target, 0.05, 10.0, -10.0).unwrap();
            gpu.backward(&target, 0.05, 10.0, -10.0).unwrap();
        }
        assert!(!gpu.status().host_stale);
        assert!(cpu.structurally_eq(&gpu));
    }

    #[test]
    fn gpu_training_syncs_back() {
        let mut gpu = Network::<f32>::create(
            &[(4, 1), (8, 1), (2, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            Some(3),
        )
        .unwrap();
        if gpu.initialize_gpu().is_err() {
            println!("No GPU available, skipping");
            return;
        }
        let mut cpu = gpu.clone();
        let input = [vec![0.1, 0.4, -0.3, 0.9]];
        let target = [vec![0.5, -0.5]];
        for _ in 0..5 {
            cpu.forward(&input).unwrap();
            cpu.backward(&target, 0.05, 1.0, -1.0).unwrap();
            gpu.forward(&input).unwrap();
            gpu.backward(&target, 0.05, 1.0, -1.0).unwrap();
        }
        gpu.sync_weights_to_host().unwrap();
        for (lc, lg) in cpu.layers().iter().zip(gpu.layers()) {
            for (nc, ng) in lc.neurons().iter().zip(lg.neurons()) {
                for (cc, cg) in nc.connections.iter().zip(&ng.connections) {
                    assert!((cc.weight - cg.weight).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn lease_restores_device_weights() {
        let mut net = mnist_net();
        if net.initialize_gpu().is_err() {
            println!("No GPU available, skipping");
            return;
        }
        let input = pattern();
        net.forward(&input).unwrap();
        let before = net.output();
        {
            let mut lease = net.lease_weights();
            let zeros = vec![0u8; 10 * 2048 * 4];
            lease.write_raw_weight_bytes(2, &zeros).unwrap();
        }
        net.forward(&input).unwrap();
        for (a, b) in before.iter().zip(net.output()) {
            assert!((a - b).abs() <= GPU_F32_TOLERANCE);
        }
    }
}
