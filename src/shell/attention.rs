use datasize::DataSize;
use tracing::debug;

use super::{
    batch::Batch,
    config::ShellConfig,
    kv_cache::KvCache,
    linear::{ColumnLinear, RowLinear},
    loader::{load_qkv, load_row},
    rotary::CosSin,
    shard::ShardContext,
    weights::WeightSource,
};
use crate::{
    error::{Result, ShellError},
    ops::{axpy, dotprod, softmax},
};

/// Query head `h` reads key/value head `mapping[h]`: each kv head repeated
/// `num_heads / num_kv_heads` times.
pub fn kv_head_mapping(num_heads: usize, num_kv_heads: usize) -> Vec<usize> {
    let groups = num_heads / num_kv_heads;
    (0..num_kv_heads)
        .flat_map(|kv| std::iter::repeat(kv).take(groups))
        .collect()
}

/// Shapes shared by both attention kernels.
#[derive(Debug, Clone, Copy)]
pub struct AttentionDims {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub softmax_scale: f32,
}

impl AttentionDims {
    fn q_width(&self) -> usize {
        self.num_heads * self.head_size
    }

    fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_size
    }
}

/// Prefill: causal attention inside each sequence of a flattened batch.
///
/// `query` is `[n_tokens, num_heads, head_size]`, `key`/`value` are
/// `[n_tokens, num_kv_heads, head_size]`, `cu_seqlens` holds the sequence
/// boundaries. Tokens never attend across sequences.
pub fn flash_attention(
    out: &mut [f32],
    query: &[f32],
    key: &[f32],
    value: &[f32],
    cu_seqlens: &[usize],
    kv_head_mapping: &[usize],
    dims: AttentionDims,
) {
    let hs = dims.head_size;
    let (qw, kvw) = (dims.q_width(), dims.kv_width());
    for window in cu_seqlens.windows(2) {
        let (start, end) = (window[0], window[1]);
        let mut att = vec![0f32; end - start];
        for t in start..end {
            for h in 0..dims.num_heads {
                let q = &query[t * qw + h * hs..t * qw + (h + 1) * hs];
                let kv_off = kv_head_mapping[h] * hs;
                // iterate over the sequence up to and including the current token
                let att = &mut att[..t - start + 1];
                for (i, s) in (start..=t).enumerate() {
                    let k = &key[s * kvw + kv_off..s * kvw + kv_off + hs];
                    att[i] = dotprod(q, k) * dims.softmax_scale;
                }
                softmax(att);

                // weighted sum of the values
                let o = &mut out[t * qw + h * hs..t * qw + (h + 1) * hs];
                o.fill(0f32);
                for (i, s) in (start..=t).enumerate() {
                    axpy(o, att[i], &value[s * kvw + kv_off..s * kvw + kv_off + hs]);
                }
            }
        }
    }
}

/// Decode: one query token per sequence against that sequence's cached pages.
///
/// Sequence `i` attends over positions `0..input_lengths[i]` found through
/// `block_tables[i]`.
pub fn paged_attention(
    out: &mut [f32],
    query: &[f32],
    cache: &KvCache,
    kv_head_mapping: &[usize],
    dims: AttentionDims,
    block_tables: &[Vec<usize>],
    input_lengths: &[usize],
) {
    let hs = dims.head_size;
    let qw = dims.q_width();
    for (i, (table, &context_len)) in block_tables.iter().zip(input_lengths).enumerate() {
        let mut att = vec![0f32; context_len];
        for h in 0..dims.num_heads {
            let q = &query[i * qw + h * hs..i * qw + (h + 1) * hs];
            let kv_off = kv_head_mapping[h] * hs;
            for (pos, a) in att.iter_mut().enumerate() {
                let k = cache.key_at(cache.slot(table, pos));
                *a = dotprod(q, &k[kv_off..kv_off + hs]) * dims.softmax_scale;
            }
            softmax(&mut att);

            let o = &mut out[i * qw + h * hs..i * qw + (h + 1) * hs];
            o.fill(0f32);
            for (pos, a) in att.iter().enumerate() {
                let v = cache.value_at(cache.slot(table, pos));
                axpy(o, *a, &v[kv_off..kv_off + hs]);
            }
        }
    }
}

#[derive(Debug, DataSize)]
pub struct ShellAttention {
    num_heads: usize,    // on this shard
    num_kv_heads: usize, // on this shard
    head_size: usize,
    softmax_scale: f32,
    query_key_value: ColumnLinear,
    o_proj: RowLinear,
    kv_head_mapping: Vec<usize>,
}

impl ShellAttention {
    pub fn load(
        config: &ShellConfig,
        prefix: &str,
        weights: &impl WeightSource,
        shard: &ShardContext,
    ) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let head_size = config.head_size();
        let world_size = shard.world_size;
        if num_heads % world_size != 0 {
            return Err(ShellError::config(format!(
                "`num_heads` must be divisible by `num_shards` (got `num_heads`: {num_heads} and `num_shards`: {world_size})"
            )));
        }
        if config.num_key_value_heads % world_size != 0 {
            return Err(ShellError::config(format!(
                "`num_key_value_heads` must be divisible by `num_shards` (got `num_key_value_heads`: {} and `num_shards`: {world_size})",
                config.num_key_value_heads
            )));
        }
        let num_heads = num_heads / world_size;
        let num_kv_heads = config.num_key_value_heads / world_size;

        let query_key_value = ColumnLinear::new(load_qkv(config, prefix, weights, shard, true)?)?;
        let o_proj = RowLinear::new(
            load_row(config, &format!("{prefix}.c_proj"), weights, shard, true)?,
            shard.clone(),
        )?;
        debug!(prefix, num_heads, num_kv_heads, head_size, "attention loaded");
        Ok(Self {
            num_heads,
            num_kv_heads,
            head_size,
            softmax_scale: (head_size as f32).powf(-0.5),
            query_key_value,
            o_proj,
            kv_head_mapping: kv_head_mapping(num_heads, num_kv_heads),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn kv_head_mapping(&self) -> &[usize] {
        &self.kv_head_mapping
    }

    fn dims(&self) -> AttentionDims {
        AttentionDims {
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            head_size: self.head_size,
            softmax_scale: self.softmax_scale,
        }
    }

    /// `hidden` is `[n_tokens, hidden_size]`; returns the same shape, reduced
    /// across shards.
    pub fn forward(
        &self,
        hidden: &[f32],
        cos_sin: &CosSin,
        batch: &Batch,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        let dims = self.dims();
        let (qw, kvw) = (dims.q_width(), dims.kv_width());
        let n_tokens = batch.n_tokens();

        // split the fused projection into query, key and value
        let qkv = self.query_key_value.forward(hidden);
        let mut query = Vec::with_capacity(n_tokens * qw);
        let mut key = Vec::with_capacity(n_tokens * kvw);
        let mut value = Vec::with_capacity(n_tokens * kvw);
        for row in qkv.chunks_exact(qw + 2 * kvw) {
            query.extend_from_slice(&row[..qw]);
            key.extend_from_slice(&row[qw..qw + kvw]);
            value.extend_from_slice(&row[qw + kvw..]);
        }

        cos_sin.apply(&mut query, &mut key);

        cache.reshape_and_cache(&key, &value, &batch.slots);

        let mut attn_output = vec![0f32; n_tokens * qw];
        match &batch.cu_seqlen_prefill {
            Some(cu_seqlens) => flash_attention(
                &mut attn_output,
                &query,
                &key,
                &value,
                cu_seqlens,
                &self.kv_head_mapping,
                dims,
            ),
            None => paged_attention(
                &mut attn_output,
                &query,
                cache,
                &self.kv_head_mapping,
                dims,
                &batch.block_tables,
                &batch.input_lengths,
            ),
        }

        self.o_proj.forward(&attn_output)
    }
}
