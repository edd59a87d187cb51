//! Network persistence: a JSON text document and a chunked binary image.
//!
//! Binary layout: `GRIDNET1`, `u32` version, then LZ4 chunks:
//!
//! | tag    | payload                                                        |
//! |--------|----------------------------------------------------------------|
//! | `TYPE` | scalar type name                                               |
//! | `PRNG` | `u64` generator state                                          |
//! | `LAYR` | per layer: width, height (varint), activation, flags, replay   |
//! | `NEUR` | per neuron: bias, varint count, `(layer, x, y)` varints, weight |
//! | `DIMS` | optional: per layer with sub-networks, one nested image each   |
//!
//! Scalars are written at the native width of `T`. Unknown chunks are skipped.
//! Both decoders validate everything before a network is returned.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::activation::Activation;
use crate::error::{NetError, Result};
use crate::grid::{Connection, Grid, Neuron};
use crate::network::Network;
use crate::numeric::Scalar;
use crate::prng::{Prng, DEFAULT_SEED};
use crate::replay::{ReplayConfig, ReplaySpec};
use crate::storage;

pub const TEXT_FORMAT: &str = "gridnet";
pub const TEXT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DocHeader {
    format: String,
    version: u32,
    scalar_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
struct NetworkDoc<T> {
    format: String,
    version: u32,
    scalar_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rng_state: Option<u64>,
    layers: Vec<LayerDoc<T>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
struct LayerDoc<T> {
    width: usize,
    height: usize,
    activation: Activation,
    fully_connected: bool,
    #[serde(default)]
    replay: ReplaySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dimension: Option<DimensionDoc<T>>,
    neurons: Vec<NeuronDoc<T>>,
}

/// Sub-networks of a layer, each a complete document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
struct DimensionDoc<T> {
    shared: bool,
    networks: Vec<NetworkDoc<T>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Scalar")]
struct NeuronDoc<T> {
    bias: TextScalar<T>,
    /// `[layer, x, y, weight]`
    connections: Vec<(u32, u32, u32, TextScalar<T>)>,
}

/// A value in the text document. Non-finite floats are written as the hex bit
/// pattern of their native width (`"0x7ff8000000000000"`) so they load back exactly.
#[derive(Debug, Clone, Copy)]
struct TextScalar<T>(T);

impl<T: Scalar> Serialize for TextScalar<T> {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        if T::IS_FLOAT && !self.0.to_f64().is_finite() {
            s.serialize_str(&format!("0x{:0width$x}", self.0.to_bits(), width = 2 * T::BYTES))
        } else {
            self.0.serialize(s)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged, bound = "T: Scalar")]
enum RawScalar<T> {
    Number(T),
    Bits(String),
}

impl<'de, T: Scalar> Deserialize<'de> for TextScalar<T> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        match RawScalar::<T>::deserialize(d)? {
            RawScalar::Number(v) => Ok(TextScalar(v)),
            RawScalar::Bits(text) => scalar_from_bits::<T>(&text)
                .map(TextScalar)
                .ok_or_else(|| de::Error::custom(format!("bad {} bit pattern {text:?}", T::TYPE_NAME))),
        }
    }
}

fn scalar_from_bits<T: Scalar>(text: &str) -> Option<T> {
    let hex = text.strip_prefix("0x")?;
    if !T::IS_FLOAT || hex.len() != 2 * T::BYTES {
        return None;
    }
    let bits = u64::from_str_radix(hex, 16).ok()?;
    T::read_le(&mut &bits.to_le_bytes()[..T::BYTES]).ok()
}

/// Layer description shared by both decoders.
struct LayerParts<T> {
    width: usize,
    height: usize,
    activation: Activation,
    fully_connected: bool,
    replay: ReplaySpec,
    neurons: Vec<Neuron<T>>,
}

fn invalid_data(e: io::Error) -> NetError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => NetError::corrupt(e.to_string()),
        _ => NetError::Io(e),
    }
}

fn read_header(text: &str) -> Result<DocHeader> {
    let header: DocHeader =
        serde_json::from_str(text).map_err(|e| NetError::corrupt(format!("bad document: {e}")))?;
    if header.format != TEXT_FORMAT {
        return Err(NetError::corrupt(format!("unknown format {:?}", header.format)));
    }
    if header.version != TEXT_VERSION {
        return Err(NetError::corrupt(format!("unsupported version {}", header.version)));
    }
    Ok(header)
}

/// Every neuron of a fully-connected layer reads each position of the previous layer once.
fn check_full_fan_in<T>(l: usize, prev: (usize, usize), neurons: &[Neuron<T>]) -> Result<()> {
    let cols = prev.0 * prev.1;
    let mut seen = vec![false; cols];
    for (i, n) in neurons.iter().enumerate() {
        seen.iter_mut().for_each(|s| *s = false);
        let mut covered = 0;
        for c in &n.connections {
            if c.src_layer as usize != l - 1 {
                continue;
            }
            let j = c.src_y as usize * prev.0 + c.src_x as usize;
            if !seen[j] {
                seen[j] = true;
                covered += 1;
            }
        }
        if covered != cols || n.connections.len() != cols {
            return Err(NetError::corrupt(format!(
                "layer {l} is fully connected but neuron {i} reads {} of {cols} inputs",
                n.connections.len()
            )));
        }
    }
    Ok(())
}

/// Check shapes, sources and replay settings, then build the network.
fn assemble<T: Scalar>(parts: Vec<LayerParts<T>>, rng_state: Option<u64>) -> Result<Network<T>> {
    if parts.is_empty() {
        return Err(NetError::corrupt("network has no layers"));
    }
    let shapes: Vec<(usize, usize)> = parts.iter().map(|p| (p.width, p.height)).collect();
    let count = parts.len();
    let mut layers = Vec::with_capacity(count);
    for (l, p) in parts.into_iter().enumerate() {
        if p.width == 0 || p.height == 0 {
            return Err(NetError::corrupt(format!("layer {l} has zero size")));
        }
        if p.width > u32::MAX as usize || p.height > u32::MAX as usize {
            return Err(NetError::corrupt(format!("layer {l} is too large")));
        }
        let size = p
            .width
            .checked_mul(p.height)
            .ok_or_else(|| NetError::corrupt(format!("layer {l} is too large")))?;
        if p.neurons.len() != size {
            return Err(NetError::corrupt(format!(
                "layer {l} is {}x{} but has {} neurons",
                p.width,
                p.height,
                p.neurons.len()
            )));
        }
        for n in &p.neurons {
            for c in &n.connections {
                let src = c.src_layer as usize;
                let ok = src < l
                    && (c.src_x as usize) < shapes[src].0
                    && (c.src_y as usize) < shapes[src].1;
                if !ok {
                    return Err(NetError::corrupt(format!(
                        "layer {l} has a dangling source ({}, {}, {})",
                        c.src_layer, c.src_x, c.src_y
                    )));
                }
            }
        }
        if l > 0 && p.fully_connected {
            check_full_fan_in(l, shapes[l - 1], &p.neurons)?;
        }
        let replay = ReplayConfig::from_spec(&p.replay);
        if replay.enabled {
            replay
                .validate(l, count)
                .map_err(|e| NetError::corrupt(e.to_string()))?;
        }
        let mut grid = Grid::from_neurons(p.width, p.height, p.activation, p.fully_connected, p.neurons);
        grid.replay = replay;
        layers.push(grid);
    }
    let rng = Prng::from_state(rng_state.unwrap_or(DEFAULT_SEED));
    Ok(Network::from_layers(layers, rng))
}

impl<T: Scalar> Network<T> {
    /// Make host weights current before encoding.
    fn settle(&mut self) {
        self.ensure_host_weights();
        self.flush_dense();
    }

    /// Settle this network and every sub-network.
    fn settle_all(&mut self) {
        self.settle();
        for dim in self.dimensions.iter_mut().flatten() {
            for net in &mut dim.nets {
                net.settle_all();
            }
        }
    }

    fn to_doc(&self) -> NetworkDoc<T> {
        NetworkDoc {
            format: TEXT_FORMAT.to_string(),
            version: TEXT_VERSION,
            scalar_type: T::TYPE_NAME.to_string(),
            rng_state: Some(self.rng.state()),
            layers: self
                .layers
                .iter()
                .zip(&self.dimensions)
                .map(|(g, dim)| LayerDoc {
                    width: g.width,
                    height: g.height,
                    activation: g.activation,
                    fully_connected: g.fully_connected,
                    replay: g.replay.to_spec(),
                    dimension: dim.as_ref().map(|d| DimensionDoc {
                        shared: d.shared,
                        networks: d.nets.iter().map(Network::to_doc).collect(),
                    }),
                    neurons: g
                        .neurons
                        .iter()
                        .map(|n| NeuronDoc {
                            bias: TextScalar(n.bias),
                            connections: n
                                .connections
                                .iter()
                                .map(|c| (c.src_layer, c.src_x, c.src_y, TextScalar(c.weight)))
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn to_text(&mut self) -> Result<String> {
        self.settle_all();
        serde_json::to_string_pretty(&self.to_doc()).map_err(|e| NetError::corrupt(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let header = read_header(text)?;
        if header.scalar_type != T::TYPE_NAME {
            return Err(NetError::corrupt(format!(
                "document holds {} weights, expected {}",
                header.scalar_type,
                T::TYPE_NAME
            )));
        }
        let doc: NetworkDoc<T> =
            serde_json::from_str(text).map_err(|e| NetError::corrupt(format!("bad document: {e}")))?;
        Self::from_doc(doc)
    }

    fn from_doc(doc: NetworkDoc<T>) -> Result<Self> {
        if doc.format != TEXT_FORMAT || doc.version != TEXT_VERSION || doc.scalar_type != T::TYPE_NAME {
            return Err(NetError::corrupt(format!(
                "nested document is {} v{} of {}",
                doc.format, doc.version, doc.scalar_type
            )));
        }
        let mut dims = Vec::new();
        let mut parts = Vec::with_capacity(doc.layers.len());
        for (l, layer) in doc.layers.into_iter().enumerate() {
            if let Some(d) = layer.dimension {
                let nets = d
                    .networks
                    .into_iter()
                    .map(Self::from_doc)
                    .collect::<Result<Vec<_>>>()?;
                dims.push((l, d.shared, nets));
            }
            parts.push(LayerParts {
                width: layer.width,
                height: layer.height,
                activation: layer.activation,
                fully_connected: layer.fully_connected,
                replay: layer.replay,
                neurons: layer
                    .neurons
                    .into_iter()
                    .map(|n| {
                        let conns = n
                            .connections
                            .into_iter()
                            .map(|(layer, x, y, TextScalar(weight))| Connection {
                                src_layer: layer,
                                src_x: x,
                                src_y: y,
                                weight,
                            })
                            .collect();
                        Neuron::new(n.bias.0, conns)
                    })
                    .collect(),
            });
        }
        let mut net = assemble(parts, doc.rng_state)?;
        for (l, shared, nets) in dims {
            net.install_dimension(l, shared, nets)
                .map_err(|e| NetError::corrupt(e.to_string()))?;
        }
        Ok(net)
    }

    pub fn save_text(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let text = self.to_text()?;
        fs::write(path.as_ref(), text)?;
        debug!("saved {} network to {}", T::TYPE_NAME, path.as_ref().display());
        Ok(())
    }

    pub fn load_text(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_text(&text)
    }

    /// Serialize the binary image.
    pub fn write_binary<W: Write>(&mut self, w: &mut W) -> Result<()> {
        self.settle_all();
        self.write_image(w)?;
        Ok(())
    }

    fn write_image<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut payload = Vec::new();
        storage::write_string(&mut payload, T::TYPE_NAME)?;
        storage::write_chunk_lz4(w, *b"TYPE", &payload)?;

        payload.clear();
        storage::write_u64_le(&mut payload, self.rng.state())?;
        storage::write_chunk_lz4(w, *b"PRNG", &payload)?;

        payload.clear();
        self.write_layer_payload(&mut payload)?;
        storage::write_chunk_lz4(w, *b"LAYR", &payload)?;

        payload.clear();
        self.write_neuron_payload(&mut payload)?;
        storage::write_chunk_lz4(w, *b"NEUR", &payload)?;

        if self.has_dimensions() {
            payload.clear();
            self.write_dimension_payload(&mut payload)?;
            storage::write_chunk_lz4(w, *b"DIMS", &payload)?;
        }
        Ok(())
    }

    /// Per layer with sub-networks: layer, shared flag, count, then one
    /// length-prefixed image per sub-network.
    fn write_dimension_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let present: Vec<_> = self
            .dimensions
            .iter()
            .enumerate()
            .filter_map(|(l, d)| d.as_ref().map(|d| (l, d)))
            .collect();
        storage::write_varint(w, present.len() as u64)?;
        for (l, dim) in present {
            storage::write_varint(w, l as u64)?;
            storage::write_u8(w, u8::from(dim.shared))?;
            storage::write_varint(w, dim.nets.len() as u64)?;
            for net in &dim.nets {
                let mut image = Vec::new();
                net.write_image(&mut image)?;
                storage::write_bytes(w, &image)?;
            }
        }
        Ok(())
    }

    fn write_layer_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_varint(w, self.layers.len() as u64)?;
        for g in &self.layers {
            storage::write_varint(w, g.width as u64)?;
            storage::write_varint(w, g.height as u64)?;
            storage::write_u8(w, g.activation.code() as u8)?;
            storage::write_u8(w, u8::from(g.fully_connected))?;
            let replay = serde_json::to_vec(&g.replay.to_spec())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            storage::write_bytes(w, &replay)?;
        }
        Ok(())
    }

    fn write_neuron_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for g in &self.layers {
            for n in &g.neurons {
                n.bias.write_le(w)?;
                storage::write_varint(w, n.connections.len() as u64)?;
                for c in &n.connections {
                    storage::write_varint(w, u64::from(c.src_layer))?;
                    storage::write_varint(w, u64::from(c.src_x))?;
                    storage::write_varint(w, u64::from(c.src_y))?;
                    c.weight.write_le(w)?;
                }
            }
        }
        Ok(())
    }

    pub fn read_binary<R: Read>(r: &mut R) -> Result<Self> {
        let image = Image::read(r)?;
        Self::from_image(image)
    }

    fn from_image(image: Image) -> Result<Self> {
        if image.scalar_type != T::TYPE_NAME {
            return Err(NetError::corrupt(format!(
                "image holds {} weights, expected {}",
                image.scalar_type,
                T::TYPE_NAME
            )));
        }
        let mut parts: Vec<LayerParts<T>> = image.layers.into_iter().map(LayerParts::retype).collect();
        let mut cursor = Cursor::new(image.neurons);
        for p in &mut parts {
            let count = p.width.checked_mul(p.height).ok_or_else(|| NetError::corrupt("layer too large"))?;
            p.neurons = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let n = read_neuron::<T, _>(&mut cursor).map_err(invalid_data)?;
                p.neurons.push(n);
            }
        }
        if cursor.position() != cursor.get_ref().len() as u64 {
            return Err(NetError::corrupt("trailing bytes in NEUR chunk"));
        }
        let mut net = assemble(parts, image.rng_state)?;
        if let Some(dims) = image.dims {
            net.read_dimension_payload(&dims)?;
        }
        Ok(net)
    }

    fn read_dimension_payload(&mut self, payload: &[u8]) -> Result<()> {
        let mut r = Cursor::new(payload);
        let count = storage::read_varint(&mut r).map_err(invalid_data)?;
        for _ in 0..count {
            let layer = storage::read_varint(&mut r).map_err(invalid_data)? as usize;
            let shared = match storage::read_u8(&mut r).map_err(invalid_data)? {
                0 => false,
                1 => true,
                other => return Err(NetError::corrupt(format!("layer {layer}: bad shared flag {other}"))),
            };
            let nets_len = storage::read_varint(&mut r).map_err(invalid_data)? as usize;
            let mut nets = Vec::with_capacity(nets_len.min(1 << 12));
            for _ in 0..nets_len {
                let image = storage::read_bytes(&mut r).map_err(invalid_data)?;
                nets.push(Self::from_binary(&image)?);
            }
            self.install_dimension(layer, shared, nets)
                .map_err(|e| NetError::corrupt(e.to_string()))?;
        }
        if r.position() != payload.len() as u64 {
            return Err(NetError::corrupt("trailing bytes in DIMS chunk"));
        }
        Ok(())
    }

    pub fn to_binary(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_binary(&mut buf)?;
        Ok(buf)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        Self::read_binary(&mut Cursor::new(bytes))
    }

    pub fn save_binary(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_binary()?;
        fs::write(path.as_ref(), bytes)?;
        debug!("saved {} network to {}", T::TYPE_NAME, path.as_ref().display());
        Ok(())
    }

    pub fn load_binary(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_binary(&bytes)
    }

    /// Exact size of the binary image in bytes.
    pub fn image_size_bytes(&mut self) -> Result<usize> {
        self.settle_all();
        let mut cw = storage::CountingWriter::new();
        self.write_image(&mut cw)?;
        Ok(cw.written())
    }
}

fn read_neuron<T: Scalar, R: Read>(r: &mut R) -> io::Result<Neuron<T>> {
    let bias = T::read_le(r)?;
    let count = storage::read_varint(r)? as usize;
    let mut conns = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let src_layer = storage::read_varint_u32(r)?;
        let src_x = storage::read_varint_u32(r)?;
        let src_y = storage::read_varint_u32(r)?;
        let weight = T::read_le(r)?;
        conns.push(Connection {
            src_layer,
            src_x,
            src_y,
            weight,
        });
    }
    Ok(Neuron::new(bias, conns))
}

/// Chunks of a binary image, before the scalar type is applied.
struct Image {
    scalar_type: String,
    rng_state: Option<u64>,
    layers: Vec<LayerParts<()>>,
    neurons: Vec<u8>,
    dims: Option<Vec<u8>>,
}

impl<T> LayerParts<T> {
    fn retype<U>(self) -> LayerParts<U> {
        LayerParts {
            width: self.width,
            height: self.height,
            activation: self.activation,
            fully_connected: self.fully_connected,
            replay: self.replay,
            neurons: Vec::new(),
        }
    }
}

impl Image {
    fn read<R: Read>(r: &mut R) -> Result<Self> {
        let magic = storage::read_exact::<8, _>(r).map_err(invalid_data)?;
        if &magic != storage::MAGIC {
            return Err(NetError::corrupt("bad image magic"));
        }
        let version = storage::read_u32_le(r).map_err(invalid_data)?;
        if version != storage::VERSION_CURRENT {
            return Err(NetError::corrupt(format!("unsupported image version {version}")));
        }

        let mut scalar_type = None;
        let mut rng_state = None;
        let mut layers = None;
        let mut neurons = None;
        let mut dims = None;
        while let Some((tag, payload)) = storage::read_chunk_lz4(r).map_err(invalid_data)? {
            if &tag == b"NEUR" {
                neurons = Some(payload);
                continue;
            }
            if &tag == b"DIMS" {
                dims = Some(payload);
                continue;
            }
            let mut cursor = Cursor::new(payload.as_slice());
            match &tag {
                b"TYPE" => scalar_type = Some(storage::read_string(&mut cursor).map_err(invalid_data)?),
                b"PRNG" => rng_state = Some(storage::read_u64_le(&mut cursor).map_err(invalid_data)?),
                b"LAYR" => layers = Some(read_layer_payload(&mut cursor)?),
                _ => {
                    // Unknown chunk: skipped.
                }
            }
        }
        Ok(Self {
            scalar_type: scalar_type.ok_or_else(|| NetError::corrupt("missing TYPE"))?,
            rng_state,
            layers: layers.ok_or_else(|| NetError::corrupt("missing LAYR"))?,
            neurons: neurons.ok_or_else(|| NetError::corrupt("missing NEUR"))?,
            dims,
        })
    }
}

fn read_layer_payload(r: &mut Cursor<&[u8]>) -> Result<Vec<LayerParts<()>>> {
    let count = storage::read_varint(r).map_err(invalid_data)? as usize;
    let mut layers = Vec::with_capacity(count.min(1 << 12));
    for l in 0..count {
        let width = storage::read_varint(r).map_err(invalid_data)? as usize;
        let height = storage::read_varint(r).map_err(invalid_data)? as usize;
        let code = storage::read_u8(r).map_err(invalid_data)?;
        let activation = Activation::ALL
            .into_iter()
            .find(|a| a.code() == u32::from(code))
            .ok_or_else(|| NetError::corrupt(format!("layer {l}: unknown activation code {code}")))?;
        let fully_connected = match storage::read_u8(r).map_err(invalid_data)? {
            0 => false,
            1 => true,
            other => return Err(NetError::corrupt(format!("layer {l}: bad flag {other}"))),
        };
        let replay_json = storage::read_bytes(r).map_err(invalid_data)?;
        let replay: ReplaySpec = serde_json::from_slice(&replay_json)
            .map_err(|e| NetError::corrupt(format!("layer {l}: bad replay settings: {e}")))?;
        layers.push(LayerParts {
            width,
            height,
            activation,
            fully_connected,
            replay,
            neurons: Vec::new(),
        });
    }
    Ok(layers)
}

impl Image {
    fn into_typed<T: Scalar>(self) -> Result<Network<T>> {
        Network::<T>::from_image(self)
    }
}

macro_rules! any_network {
    ($($variant:ident => $t:ty),* $(,)?) => {
        /// A network whose scalar type is only known at run time.
        #[derive(Debug, Clone)]
        pub enum AnyNetwork {
            $($variant(Network<$t>),)*
        }

        impl AnyNetwork {
            pub fn scalar_type(&self) -> &'static str {
                match self {
                    $(AnyNetwork::$variant(_) => <$t as Scalar>::TYPE_NAME,)*
                }
            }

            pub fn num_layers(&self) -> usize {
                match self {
                    $(AnyNetwork::$variant(n) => n.num_layers(),)*
                }
            }

            pub fn forward(&mut self, input: &[Vec<f64>]) -> Result<()> {
                match self {
                    $(AnyNetwork::$variant(n) => n.forward(input),)*
                }
            }

            pub fn output_grid(&self) -> Vec<Vec<f64>> {
                match self {
                    $(AnyNetwork::$variant(n) => n.output_grid(),)*
                }
            }

            pub fn to_text(&mut self) -> Result<String> {
                match self {
                    $(AnyNetwork::$variant(n) => n.to_text(),)*
                }
            }

            pub fn to_binary(&mut self) -> Result<Vec<u8>> {
                match self {
                    $(AnyNetwork::$variant(n) => n.to_binary(),)*
                }
            }

            pub fn from_text(text: &str) -> Result<Self> {
                let header = read_header(text)?;
                match header.scalar_type.as_str() {
                    $(name if name == <$t as Scalar>::TYPE_NAME => {
                        Network::<$t>::from_text(text).map(AnyNetwork::$variant)
                    })*
                    other => Err(NetError::corrupt(format!("unknown scalar type {other:?}"))),
                }
            }

            pub fn from_binary(bytes: &[u8]) -> Result<Self> {
                let image = Image::read(&mut Cursor::new(bytes))?;
                let scalar_type = image.scalar_type.clone();
                match scalar_type.as_str() {
                    $(name if name == <$t as Scalar>::TYPE_NAME => {
                        image.into_typed::<$t>().map(AnyNetwork::$variant)
                    })*
                    other => Err(NetError::corrupt(format!("unknown scalar type {other:?}"))),
                }
            }
        }

        $(
            impl From<Network<$t>> for AnyNetwork {
                fn from(n: Network<$t>) -> Self {
                    AnyNetwork::$variant(n)
                }
            }
        )*
    };
}

any_network! {
    I8 => i8,
    I16 => i16,
    I32 => i32,
    I64 => i64,
    Isize => isize,
    U8 => u8,
    U16 => u16,
    U32 => u32,
    U64 => u64,
    Usize => usize,
    F32 => f32,
    F64 => f64,
}

/// Load a text document of any scalar type.
pub fn load_any_text(path: impl AsRef<Path>) -> Result<AnyNetwork> {
    let text = fs::read_to_string(path)?;
    AnyNetwork::from_text(&text)
}

/// Load a binary image of any scalar type.
pub fn load_any_binary(path: impl AsRef<Path>) -> Result<AnyNetwork> {
    let bytes = fs::read(path)?;
    AnyNetwork::from_binary(&bytes)
}
