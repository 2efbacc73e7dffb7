use std::{
    collections::HashMap,
    fs::{self, File},
    ops::Range,
    path::{Path, PathBuf},
};

use datasize::DataSize;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use rand::{rngs::StdRng, Rng, SeedableRng};
use safetensors::{Dtype, SafeTensors};
use tracing::info;

use super::config::{ShellConfig, WeightLayout};
use crate::error::{Result, ShellError};

/// Dense row-major f32 buffer. Never mutated once a layer owns it.
#[derive(Debug, Clone, PartialEq, DataSize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(ShellError::ShapeMismatch {
                name: "<tensor>".to_string(),
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0f32; numel],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    // (outer, dim, inner) around `axis`
    fn split_at_axis(&self, axis: usize) -> (usize, usize, usize) {
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        (outer, self.shape[axis], inner)
    }

    /// Copy of `range` along `axis`.
    pub fn narrow(&self, axis: usize, range: Range<usize>) -> Result<Tensor> {
        if axis >= self.shape.len() || range.end > self.shape[axis] || range.start > range.end {
            return Err(ShellError::ShapeMismatch {
                name: format!("narrow(axis={axis}, {range:?})"),
                expected: vec![range.end],
                got: self.shape.clone(),
            });
        }
        let (outer, dim, inner) = self.split_at_axis(axis);
        let len = range.end - range.start;
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let start = (o * dim + range.start) * inner;
            data.extend_from_slice(&self.data[start..start + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Tensor { shape, data })
    }

    /// Concatenation along `axis`; all other dimensions must agree.
    pub fn cat(parts: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| ShellError::config("cat of zero tensors"))?;
        let mut shape = first.shape.clone();
        shape[axis] = 0;
        for part in parts {
            let same_rank = part.shape.len() == first.shape.len();
            let others_agree = same_rank
                && part
                    .shape
                    .iter()
                    .zip(first.shape.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !others_agree {
                return Err(ShellError::ShapeMismatch {
                    name: format!("cat(axis={axis})"),
                    expected: first.shape.clone(),
                    got: part.shape.clone(),
                });
            }
            shape[axis] += part.shape[axis];
        }
        let (outer, _, inner) = first.split_at_axis(axis);
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for part in parts {
                let chunk = part.shape[axis] * inner;
                data.extend_from_slice(&part.data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Tensor { shape, data })
    }

    /// 2D transpose.
    pub fn t(&self) -> Result<Tensor> {
        if self.shape.len() != 2 {
            return Err(ShellError::ShapeMismatch {
                name: "transpose".to_string(),
                expected: vec![0, 0],
                got: self.shape.clone(),
            });
        }
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut data = vec![0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Ok(Tensor {
            shape: vec![cols, rows],
            data,
        })
    }
}

/// Named tensors by key path, readable whole or along one axis.
pub trait WeightSource {
    fn contains(&self, name: &str) -> bool;

    fn get_tensor(&self, name: &str) -> Result<Tensor>;

    fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.get_tensor(name)?.shape().to_vec())
    }

    /// `range` of `name` along `axis`.
    fn get_slice(&self, name: &str, axis: usize, range: Range<usize>) -> Result<Tensor> {
        self.get_tensor(name)?.narrow(axis, range)
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryWeights {
    tensors: HashMap<String, Tensor>,
}

impl InMemoryWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// A full CodeShell checkpoint with deterministic random values, stored in
    /// `config.layout`.
    pub fn random(config: &ShellConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = Self::new();
        let hidden = config.hidden_size;
        let qkv = config.q_size() + 2 * config.kv_size();
        let inter = config.intermediate_size;
        let scale = 1.0 / (hidden as f32).sqrt();

        let mut uniform = |shape: Vec<usize>, scale: f32, offset: f32| {
            let numel = shape.iter().product();
            let data = (0..numel)
                .map(|_| offset + scale * rng.gen_range(-1.0f32..1.0))
                .collect();
            Tensor { shape, data }
        };
        // linear weights are generated [out, in] and stored per layout
        let layout = config.layout;
        let store = |t: Tensor| match layout {
            WeightLayout::Standard => Ok(t),
            WeightLayout::Transposed => t.t(),
        };

        weights.insert(
            "transformer.wte.weight",
            uniform(vec![config.vocab_size, hidden], 1.0, 0.0),
        );
        for l in 0..config.num_hidden_layers {
            let p = format!("transformer.h.{l}");
            for ln in ["ln_1", "ln_2"] {
                weights.insert(format!("{p}.{ln}.weight"), uniform(vec![hidden], 0.1, 1.0));
                weights.insert(format!("{p}.{ln}.bias"), uniform(vec![hidden], 0.1, 0.0));
            }
            let c_attn = uniform(vec![qkv, hidden], scale, 0.0);
            weights.insert(format!("{p}.attn.c_attn.weight"), store(c_attn)?);
            weights.insert(format!("{p}.attn.c_attn.bias"), uniform(vec![qkv], 0.1, 0.0));
            let c_proj = uniform(vec![hidden, config.q_size()], scale, 0.0);
            weights.insert(format!("{p}.attn.c_proj.weight"), store(c_proj)?);
            weights.insert(format!("{p}.attn.c_proj.bias"), uniform(vec![hidden], 0.1, 0.0));
            let c_fc = uniform(vec![inter, hidden], scale, 0.0);
            weights.insert(format!("{p}.mlp.c_fc.weight"), store(c_fc)?);
            weights.insert(format!("{p}.mlp.c_fc.bias"), uniform(vec![inter], 0.1, 0.0));
            let down = uniform(vec![hidden, inter], 1.0 / (inter as f32).sqrt(), 0.0);
            weights.insert(format!("{p}.mlp.c_proj.weight"), store(down)?);
            weights.insert(format!("{p}.mlp.c_proj.bias"), uniform(vec![hidden], 0.1, 0.0));
        }
        weights.insert("transformer.ln_f.weight", uniform(vec![hidden], 0.1, 1.0));
        weights.insert("transformer.ln_f.bias", uniform(vec![hidden], 0.1, 0.0));
        Ok(weights)
    }
}

impl WeightSource for InMemoryWeights {
    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| ShellError::MissingWeight(name.to_string()))
    }

    fn shape(&self, name: &str) -> Result<Vec<usize>> {
        self.tensors
            .get(name)
            .map(|t| t.shape.clone())
            .ok_or_else(|| ShellError::MissingWeight(name.to_string()))
    }

    fn get_slice(&self, name: &str, axis: usize, range: Range<usize>) -> Result<Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| ShellError::MissingWeight(name.to_string()))?
            .narrow(axis, range)
    }
}

/// Memory-mapped `.safetensors` shards; tensors are converted to f32 on read.
pub struct SafetensorsWeights {
    mmaps: Vec<Mmap>,
    routing: HashMap<String, usize>, // tensor name -> index into mmaps
}

impl SafetensorsWeights {
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(paths.len());
        let mut routing = HashMap::new();
        for (i, path) in paths.iter().enumerate() {
            let f = File::open(path)?;
            let mmap = unsafe { MmapOptions::new().map(&f)? };
            {
                let st = SafeTensors::deserialize(&mmap)?;
                for name in st.names() {
                    routing.insert(name.to_string(), i);
                }
            }
            mmaps.push(mmap);
        }
        info!(files = paths.len(), tensors = routing.len(), "mapped safetensors");
        Ok(Self { mmaps, routing })
    }

    /// Every `*.safetensors` file directly under `dir`, in name order.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(ShellError::MissingWeight(format!(
                "no .safetensors files in {}",
                dir.as_ref().display()
            )));
        }
        Self::open(&paths)
    }
}

fn to_f32(name: &str, dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    match dtype {
        Dtype::F32 => Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes)),
        Dtype::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        other => Err(ShellError::unsupported(format!(
            "dtype {other:?} for tensor {name}"
        ))),
    }
}

impl WeightSource for SafetensorsWeights {
    fn contains(&self, name: &str) -> bool {
        self.routing.contains_key(name)
    }

    fn get_tensor(&self, name: &str) -> Result<Tensor> {
        let i = *self
            .routing
            .get(name)
            .ok_or_else(|| ShellError::MissingWeight(name.to_string()))?;
        let st = SafeTensors::deserialize(&self.mmaps[i])?;
        let view = st.tensor(name)?;
        let data = to_f32(name, view.dtype(), view.data())?;
        Tensor::new(view.shape().to_vec(), data)
    }
}
