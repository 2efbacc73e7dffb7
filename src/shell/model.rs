use datasize::DataSize;
use tracing::{debug, info};

use super::{
    batch::Batch,
    config::ShellConfig,
    kv_cache::KvCache,
    layer::{LayerNorm, ShellLayer},
    loader::{check_supported, load_head, load_vocab_embedding},
    rotary::RotaryEmbedding,
    shard::ShardContext,
    weights::WeightSource,
};
use crate::{
    error::{Result, ShellError},
    ops::matmul,
};

/// Vocab-parallel embedding: each shard looks up the ids it owns, everything
/// else hits a zero row, and the all-reduce assembles full rows.
#[derive(Debug, DataSize)]
pub struct TensorParallelEmbedding {
    table: Vec<f32>, // (block + 1, hidden)
    hidden: usize,
    min_id: usize,
    max_id: usize,
    null_idx: usize,
    #[data_size(skip)]
    shard: ShardContext,
}

impl TensorParallelEmbedding {
    pub fn load(name: &str, weights: &impl WeightSource, shard: &ShardContext) -> Result<Self> {
        let vs = load_vocab_embedding(name, weights, shard)?;
        let (rows, hidden) = (vs.table.shape()[0], vs.table.shape()[1]);
        Ok(Self {
            table: vs.table.into_data(),
            hidden,
            min_id: vs.min_id,
            max_id: vs.max_id,
            null_idx: rows - 1,
            shard: shard.clone(),
        })
    }

    pub fn forward(&self, input_ids: &[usize]) -> Result<Vec<f32>> {
        let h = self.hidden;
        let mut out = Vec::with_capacity(input_ids.len() * h);
        for &id in input_ids {
            let row = if (self.min_id..self.max_id).contains(&id) {
                id - self.min_id
            } else {
                self.null_idx
            };
            out.extend_from_slice(&self.table[row * h..(row + 1) * h]);
        }
        self.shard.all_reduce_sum(&mut out)?;
        Ok(out)
    }
}

/// Output projection to the vocabulary, gathered across shards when sharded.
#[derive(Debug, DataSize)]
pub struct TensorParallelHead {
    weight: Vec<f32>, // (local_vocab, hidden)
    local_vocab: usize,
    hidden: usize,
    should_gather: bool,
    #[data_size(skip)]
    shard: ShardContext,
}

impl TensorParallelHead {
    pub fn load(weights: &impl WeightSource, shard: &ShardContext) -> Result<Self> {
        let (weight, should_gather) = load_head(weights, shard)?;
        let (local_vocab, hidden) = (weight.shape()[0], weight.shape()[1]);
        Ok(Self {
            weight: weight.into_data(),
            local_vocab,
            hidden,
            should_gather,
            shard: shard.clone(),
        })
    }

    /// Full vocabulary size after the gather.
    pub fn vocab_size(&self) -> usize {
        if self.should_gather {
            self.local_vocab * self.shard.world_size
        } else {
            self.local_vocab
        }
    }

    /// `[n, hidden]` -> `[n, vocab_size]`
    pub fn forward(&self, hidden: &[f32]) -> Result<Vec<f32>> {
        let n = hidden.len() / self.hidden;
        let mut local = vec![0f32; n * self.local_vocab];
        for (x, o) in hidden
            .chunks_exact(self.hidden)
            .zip(local.chunks_exact_mut(self.local_vocab))
        {
            matmul(o, x, &self.weight);
        }
        if !self.should_gather {
            return Ok(local);
        }

        // gathered as [world_size, n, local_vocab], returned as [n, world_size * local_vocab]
        let gathered = self.shard.all_gather(&local)?;
        let vl = self.local_vocab;
        let mut logits = Vec::with_capacity(gathered.len());
        for t in 0..n {
            for rank_block in gathered.chunks_exact(n * vl) {
                logits.extend_from_slice(&rank_block[t * vl..(t + 1) * vl]);
            }
        }
        Ok(logits)
    }
}

#[derive(Debug, DataSize)]
pub struct ShellModel {
    embed_tokens: TensorParallelEmbedding,
    layers: Vec<ShellLayer>,
    norm: LayerNorm,
    rotary_emb: RotaryEmbedding,
    hidden_size: usize,
}

impl ShellModel {
    pub fn load(
        config: &ShellConfig,
        weights: &impl WeightSource,
        shard: &ShardContext,
    ) -> Result<Self> {
        let embed_tokens = TensorParallelEmbedding::load("transformer.wte.weight", weights, shard)?;
        let layers = (0..config.num_hidden_layers)
            .map(|layer_id| {
                let layer = ShellLayer::load(config, layer_id, weights, shard)?;
                debug!(layer_id, rank = shard.rank, "layer loaded");
                Ok(layer)
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNorm::load("transformer.ln_f", weights, config.layer_norm_epsilon)?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary_emb: RotaryEmbedding::new(config),
            hidden_size: config.hidden_size,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Final hidden states, `[n_tokens, hidden_size]`.
    pub fn forward(&self, batch: &Batch, kv_cache: &mut [KvCache]) -> Result<Vec<f32>> {
        if kv_cache.len() != self.layers.len() {
            return Err(ShellError::config(format!(
                "expected {} kv caches, got {}",
                self.layers.len(),
                kv_cache.len()
            )));
        }
        let mut hidden = self.embed_tokens.forward(&batch.input_ids)?;
        debug_assert_eq!(hidden.len(), batch.n_tokens() * self.hidden_size);

        // shared by every layer
        let cos_sin = self.rotary_emb.get_cos_sin(&batch.position_ids, batch.max_s);

        let mut residual = None;
        for (layer, cache) in self.layers.iter().zip(kv_cache.iter_mut()) {
            let (h, r) = layer.forward(hidden, residual, &cos_sin, batch, cache)?;
            hidden = h;
            residual = Some(r);
        }

        let (hidden, _) = self.norm.forward(hidden, residual);
        Ok(hidden)
    }
}

/// CodeShell causal LM over one tensor-parallel shard.
#[derive(Debug, DataSize)]
pub struct ShellForCausalLM {
    #[data_size(skip)]
    config: ShellConfig,
    model: ShellModel,
    lm_head: TensorParallelHead,
    num_kv_heads: usize, // on this shard
}

impl ShellForCausalLM {
    pub fn load(
        config: &ShellConfig,
        weights: &impl WeightSource,
        shard: &ShardContext,
    ) -> Result<Self> {
        config.validate()?;
        check_supported(config)?;
        if config.num_shard != shard.world_size {
            return Err(ShellError::config(format!(
                "`num_shard` is {} but the process group has {} ranks",
                config.num_shard, shard.world_size
            )));
        }

        let model = ShellModel::load(config, weights, shard)?;
        let lm_head = TensorParallelHead::load(weights, shard)?;
        if lm_head.vocab_size() != config.vocab_size {
            return Err(ShellError::ShapeMismatch {
                name: "lm_head".to_string(),
                expected: vec![config.vocab_size],
                got: vec![lm_head.vocab_size()],
            });
        }
        info!(
            rank = shard.rank,
            world_size = shard.world_size,
            layers = model.num_layers(),
            gather_logits = lm_head.should_gather,
            "model loaded"
        );
        Ok(Self {
            config: config.clone(),
            model,
            lm_head,
            num_kv_heads: config.num_key_value_heads / shard.world_size,
        })
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Empty per-layer caches sized for this shard's kv heads.
    pub fn new_kv_cache(&self, num_blocks: usize, block_size: usize) -> Vec<KvCache> {
        KvCache::for_layers(
            self.model.num_layers(),
            num_blocks,
            block_size,
            self.num_kv_heads,
            self.config.head_size(),
        )
    }

    /// Logits, `[rows, vocab_size]`: one row per token, or one per entry of
    /// `lm_head_indices` when set.
    pub fn forward(&self, batch: &Batch, kv_cache: &mut [KvCache]) -> Result<Vec<f32>> {
        let hidden = self.model.forward(batch, kv_cache)?;
        let hidden = match &batch.lm_head_indices {
            Some(indices) => {
                let h = self.config.hidden_size;
                let mut selected = Vec::with_capacity(indices.len() * h);
                for &i in indices {
                    selected.extend_from_slice(&hidden[i * h..(i + 1) * h]);
                }
                selected
            }
            None => hidden,
        };
        self.lm_head.forward(&hidden)
    }
}
