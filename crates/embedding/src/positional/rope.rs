//! Rotary positional embeddings.
//!
//! Queries and keys arrive laid out `[batch, seq, heads, head_dim]`. Channel
//! pairs `(2i, 2i + 1)` at absolute position `p` are rotated by the angle
//! `p * theta^(-2i / head_dim)`. The cosine/sine tables are computed once per
//! `(theta, head_dim, max_seq_len, device)` and shared through an [`Arc`]; the
//! process-wide registry only holds weak references so tables are released with
//! the last model that uses them.

use candle_core::{bail, DType, Device, DeviceLocation, Result, Tensor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Geometry of a rotary frequency table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality being rotated; must be even.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub theta: f64,
    /// Number of positions covered by the table.
    pub max_seq_len: usize,
}

impl RopeConfig {
    pub fn new(head_dim: usize, theta: f64, max_seq_len: usize) -> Self {
        Self {
            head_dim,
            theta,
            max_seq_len,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            bail!(
                "rotary head_dim must be a positive even number, got {}",
                self.head_dim
            );
        }
        if self.max_seq_len == 0 {
            bail!("rotary max_seq_len must be non-zero");
        }
        if !self.theta.is_finite() || self.theta <= 0.0 {
            bail!("rotary theta must be finite and positive, got {}", self.theta);
        }
        Ok(())
    }
}

/// Cache key covering every input of the table plus the device it lives on.
fn registry_key(config: &RopeConfig, device: &Device) -> String {
    let device_id = match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    };
    format!(
        "theta={:016x};dim={};seq={};dev={}",
        config.theta.to_bits(),
        config.head_dim,
        config.max_seq_len,
        device_id
    )
}

fn table_registry() -> &'static Mutex<HashMap<String, Weak<FrequencyTable>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<FrequencyTable>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Immutable f32 cosine and sine tables shaped `[max_seq_len, head_dim / 2]`.
#[derive(Debug)]
pub struct FrequencyTable {
    config: RopeConfig,
    cos: Tensor,
    sin: Tensor,
}

impl FrequencyTable {
    /// Computes a fresh table. Angles are evaluated in f64 and stored as f32.
    pub fn build(config: RopeConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let half_dim = config.head_dim / 2;
        let inv_freqs: Vec<f64> = (0..half_dim)
            .map(|idx| config.theta.powf(-((2 * idx) as f64) / config.head_dim as f64))
            .collect();

        let mut cos_data = Vec::with_capacity(config.max_seq_len * half_dim);
        let mut sin_data = Vec::with_capacity(config.max_seq_len * half_dim);
        for pos in 0..config.max_seq_len {
            for &inv_freq in &inv_freqs {
                let angle = pos as f64 * inv_freq;
                cos_data.push(angle.cos() as f32);
                sin_data.push(angle.sin() as f32);
            }
        }

        let shape = (config.max_seq_len, half_dim);
        Ok(Self {
            config,
            cos: Tensor::from_vec(cos_data, shape, device)?,
            sin: Tensor::from_vec(sin_data, shape, device)?,
        })
    }

    /// Returns the table for `config` on `device`, building it on first use.
    ///
    /// Callers asking for the same configuration while a previous handle is
    /// alive receive the same allocation.
    pub fn shared(config: RopeConfig, device: &Device) -> Result<Arc<Self>> {
        config.validate()?;
        let key = registry_key(&config, device);
        let mut registry = table_registry()
            .lock()
            .map_err(|_| candle_core::Error::Msg("rotary table registry lock poisoned".into()))?;

        if let Some(table) = registry.get(&key).and_then(Weak::upgrade) {
            log::debug!("rotary table reuse: {key}");
            return Ok(table);
        }

        log::debug!("rotary table build: {key}");
        let table = Arc::new(Self::build(config, device)?);
        registry.retain(|_, entry| entry.strong_count() > 0);
        registry.insert(key, Arc::downgrade(&table));
        Ok(table)
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Rows `[start, start + len)` of the cosine and sine tables.
    pub fn slice(&self, start: usize, len: usize) -> Result<(Tensor, Tensor)> {
        let end = start + len;
        if end > self.config.max_seq_len {
            bail!(
                "rotary positions {start}..{end} exceed max_seq_len {}",
                self.config.max_seq_len
            );
        }
        Ok((self.cos.narrow(0, start, len)?, self.sin.narrow(0, start, len)?))
    }
}

/// Applies rotary position embeddings using a shared [`FrequencyTable`].
#[derive(Debug, Clone)]
pub struct RotaryEmbedder {
    table: Arc<FrequencyTable>,
}

impl RotaryEmbedder {
    pub fn new(table: Arc<FrequencyTable>) -> Self {
        Self { table }
    }

    /// Convenience constructor that goes through the shared registry.
    pub fn shared(config: RopeConfig, device: &Device) -> Result<Self> {
        Ok(Self::new(FrequencyTable::shared(config, device)?))
    }

    pub fn table(&self) -> &Arc<FrequencyTable> {
        &self.table
    }

    /// Rotates `queries` and `keys` for positions starting at `start_pos`.
    ///
    /// Both tensors are `[batch, seq, heads, head_dim]`; head counts may differ.
    /// Math runs in f32 and the outputs keep the input dtypes.
    pub fn apply(&self, queries: &Tensor, keys: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _, head_dim) = queries.dims4()?;
        let (k_batch, k_seq, _, k_head_dim) = keys.dims4()?;
        if (k_batch, k_seq, k_head_dim) != (batch, seq_len, head_dim) {
            bail!(
                "rotary q/k mismatch: q={:?} k={:?}",
                queries.dims(),
                keys.dims()
            );
        }
        if head_dim != self.table.config.head_dim {
            bail!(
                "rotary table built for head_dim {} but inputs have {}",
                self.table.config.head_dim,
                head_dim
            );
        }

        let (cos, sin) = self.table.slice(start_pos, seq_len)?;
        let half_dim = head_dim / 2;
        let cos = cos.reshape((1, seq_len, 1, half_dim))?;
        let sin = sin.reshape((1, seq_len, 1, half_dim))?;

        Ok((rotate(queries, &cos, &sin)?, rotate(keys, &cos, &sin)?))
    }
}

fn rotate(tensor: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, heads, head_dim) = tensor.dims4()?;
    let half_dim = head_dim / 2;
    let dtype = tensor.dtype();

    let pairs = tensor
        .to_dtype(DType::F32)?
        .reshape((batch, seq_len, heads, half_dim, 2))?;
    let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let rotated_even = (even.broadcast_mul(cos)? - odd.broadcast_mul(sin)?)?;
    let rotated_odd = (odd.broadcast_mul(cos)? + even.broadcast_mul(sin)?)?;

    Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
        .reshape((batch, seq_len, heads, head_dim))?
        .to_dtype(dtype)
}
