//! Maps checkpoint tensors to this shard's slices.
//!
//! Every linear weight leaves this module as `[out_features, in_features]`,
//! whatever `WeightLayout` it was stored in.

use std::ops::Range;

use tracing::debug;

use super::{
    config::{ShellConfig, WeightLayout},
    shard::ShardContext,
    weights::{Tensor, WeightSource},
};
use crate::error::{Result, ShellError};

impl WeightLayout {
    /// Axis of the stored tensor indexing output features.
    pub fn out_axis(self) -> usize {
        match self {
            WeightLayout::Standard => 0,
            WeightLayout::Transposed => 1,
        }
    }

    /// Axis of the stored tensor indexing input features.
    pub fn in_axis(self) -> usize {
        1 - self.out_axis()
    }

    fn canonical(self, t: Tensor) -> Result<Tensor> {
        match self {
            WeightLayout::Standard => Ok(t),
            WeightLayout::Transposed => t.t(),
        }
    }
}

/// A loaded projection: `weight` is `[out, in]`, `bias` is `[out]`.
#[derive(Debug, Clone)]
pub struct LinearWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// Rejects what this core cannot serve before a single tensor is read.
pub fn check_supported(config: &ShellConfig) -> Result<()> {
    if let Some(quantize) = config.quantize {
        return Err(ShellError::unsupported(format!(
            "{quantize:?} quantization is not implemented for this model"
        )));
    }
    if config.device != "cpu" {
        return Err(ShellError::unsupported(format!("device `{}`", config.device)));
    }
    Ok(())
}

fn expect_dim(
    weights: &impl WeightSource,
    name: &str,
    axis: usize,
    expected: usize,
) -> Result<()> {
    let shape = weights.shape(name)?;
    if shape.get(axis) != Some(&expected) {
        let mut want = shape.clone();
        if axis < want.len() {
            want[axis] = expected;
        }
        return Err(ShellError::ShapeMismatch {
            name: name.to_string(),
            expected: want,
            got: shape,
        });
    }
    Ok(())
}

/// Shard `c_attn`, stored as `[q | k | v]` at full width, into this shard's
/// query, key and value blocks concatenated in that order.
pub fn load_qkv(
    config: &ShellConfig,
    prefix: &str,
    weights: &impl WeightSource,
    shard: &ShardContext,
    bias: bool,
) -> Result<LinearWeights> {
    let q_size = config.q_size();
    let kv_size = config.kv_size();
    let q = shard.shard_range(q_size, "q_size")?;
    let kv = shard.shard_range(kv_size, "kv_size")?;
    let k = q_size + kv.start..q_size + kv.end;
    let v = q_size + kv_size + kv.start..q_size + kv_size + kv.end;
    let ranges: [Range<usize>; 3] = [q, k, v];

    let layout = config.layout;
    let name = format!("{prefix}.c_attn.weight");
    expect_dim(weights, &name, layout.out_axis(), q_size + 2 * kv_size)?;
    let parts = ranges
        .iter()
        .map(|r| weights.get_slice(&name, layout.out_axis(), r.clone()))
        .collect::<Result<Vec<_>>>()?;
    let weight = layout.canonical(Tensor::cat(&parts, layout.out_axis())?)?;

    let bias = if bias {
        let name = format!("{prefix}.c_attn.bias");
        let parts = ranges
            .iter()
            .map(|r| weights.get_slice(&name, 0, r.clone()))
            .collect::<Result<Vec<_>>>()?;
        Some(Tensor::cat(&parts, 0)?)
    } else {
        None
    };
    debug!(prefix, shape = ?weight.shape(), rank = shard.rank, "loaded fused qkv");
    Ok(LinearWeights { weight, bias })
}

/// Column-parallel: this shard holds a contiguous slice of the output features.
pub fn load_column(
    config: &ShellConfig,
    prefix: &str,
    weights: &impl WeightSource,
    shard: &ShardContext,
    bias: bool,
) -> Result<LinearWeights> {
    let layout = config.layout;
    let name = format!("{prefix}.weight");
    let out_dim = weights.shape(&name)?[layout.out_axis()];
    let range = shard.shard_range(out_dim, &name)?;
    let weight = layout.canonical(weights.get_slice(&name, layout.out_axis(), range.clone())?)?;
    let bias = if bias {
        Some(weights.get_slice(&format!("{prefix}.bias"), 0, range)?)
    } else {
        None
    };
    Ok(LinearWeights { weight, bias })
}

/// Row-parallel: this shard holds a contiguous slice of the input features.
/// Only rank 0 carries the bias, which is then added once after the reduction.
pub fn load_row(
    config: &ShellConfig,
    prefix: &str,
    weights: &impl WeightSource,
    shard: &ShardContext,
    bias: bool,
) -> Result<LinearWeights> {
    let layout = config.layout;
    let name = format!("{prefix}.weight");
    let in_dim = weights.shape(&name)?[layout.in_axis()];
    let range = shard.shard_range(in_dim, &name)?;
    let weight = layout.canonical(weights.get_slice(&name, layout.in_axis(), range)?)?;
    let bias = if bias && shard.rank == 0 {
        Some(weights.get_tensor(&format!("{prefix}.bias"))?)
    } else {
        None
    };
    Ok(LinearWeights { weight, bias })
}

/// This shard's rows of a vocab-parallel embedding table.
#[derive(Debug, Clone)]
pub struct VocabShard {
    /// `[block + 1, hidden]`; the last row is zero and serves ids owned by other shards
    pub table: Tensor,
    pub min_id: usize,
    pub max_id: usize,
}

// tied checkpoints may carry the embedding only under the head's name
const ALIASES: &[(&str, &str)] = &[("transformer.wte.weight", "lm_head.weight")];

/// `name` if the source has it, otherwise its alias.
pub fn resolve_name<'a>(weights: &impl WeightSource, name: &'a str) -> Result<&'a str> {
    if weights.contains(name) {
        return Ok(name);
    }
    ALIASES
        .iter()
        .find(|(canonical, alias)| *canonical == name && weights.contains(alias))
        .map(|(_, alias)| *alias)
        .ok_or_else(|| ShellError::MissingWeight(name.to_string()))
}

pub fn load_vocab_embedding(
    name: &str,
    weights: &impl WeightSource,
    shard: &ShardContext,
) -> Result<VocabShard> {
    let name = resolve_name(weights, name)?;
    let shape = weights.shape(name)?;
    let (vocab, hidden) = (shape[0], shape[1]);
    let block = vocab.div_ceil(shard.world_size);
    let min_id = (shard.rank * block).min(vocab);
    let max_id = ((shard.rank + 1) * block).min(vocab);
    let rows = weights.get_slice(name, 0, min_id..max_id)?;

    let mut table = rows.into_data();
    table.resize((block + 1) * hidden, 0f32);
    Ok(VocabShard {
        table: Tensor::new(vec![block + 1, hidden], table)?,
        min_id,
        max_id,
    })
}

/// The output head and whether shard-local logits must be gathered.
///
/// The head is tied to `transformer.wte.weight`, read through its
/// `lm_head.weight` alias when only that is stored. The vocab dimension is
/// sharded when it divides evenly, otherwise every shard keeps the full head
/// and no gather is needed.
pub fn load_head(weights: &impl WeightSource, shard: &ShardContext) -> Result<(Tensor, bool)> {
    let name = resolve_name(weights, "transformer.wte.weight")?;
    let vocab = weights.shape(name)?[0];
    if shard.world_size > 1 && vocab % shard.world_size == 0 {
        let range = shard.shard_range(vocab, "vocab_size")?;
        Ok((weights.get_slice(name, 0, range)?, true))
    } else {
        Ok((weights.get_tensor(name)?, false))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shell::{config::Quantize, weights::InMemoryWeights};
    use proptest::prelude::*;

    fn arange(shape: Vec<usize>, offset: f32) -> Tensor {
        let numel = shape.iter().product::<usize>();
        Tensor::new(shape, (0..numel).map(|v| offset + v as f32).collect()).unwrap()
    }

    fn fused_source(config: &ShellConfig) -> (InMemoryWeights, Tensor, Tensor) {
        let out = config.q_size() + 2 * config.kv_size();
        let canonical = arange(vec![out, config.hidden_size], 0.0);
        let bias = arange(vec![out], 1000.0);
        let stored = match config.layout {
            WeightLayout::Standard => canonical.clone(),
            WeightLayout::Transposed => canonical.t().unwrap(),
        };
        let mut weights = InMemoryWeights::new();
        weights.insert("attn.c_attn.weight", stored);
        weights.insert("attn.c_attn.bias", bias.clone());
        (weights, canonical, bias)
    }

    // stitch per-shard [q_r | k_r | v_r] back into [q | k | v]
    fn reassemble(config: &ShellConfig, shards: &[LinearWeights]) -> (Tensor, Tensor) {
        let ws = shards.len();
        let q_block = config.q_size() / ws;
        let kv_block = config.kv_size() / ws;
        let blocks = [(0, q_block), (q_block, kv_block), (q_block + kv_block, kv_block)];
        let mut rows = Vec::new();
        let mut bias = Vec::new();
        for (start, len) in blocks {
            for s in shards {
                rows.push(s.weight.narrow(0, start..start + len).unwrap());
                bias.push(s.bias.as_ref().unwrap().narrow(0, start..start + len).unwrap());
            }
        }
        (Tensor::cat(&rows, 0).unwrap(), Tensor::cat(&bias, 0).unwrap())
    }

    proptest! {
        #[test]
        fn test_qkv_shards_reassemble_bit_for_bit(
            ws in 1usize..5,
            heads_per_shard in 1usize..4,
            group in 1usize..3,
            head_size in prop::sample::select(vec![2usize, 4]),
            transposed in any::<bool>(),
        ) {
            let kv_heads = ws * heads_per_shard;
            let heads = kv_heads * group;
            let layout = if transposed { WeightLayout::Transposed } else { WeightLayout::Standard };
            let config = ShellConfig::new(heads * head_size, 1, heads, kv_heads, 8, 8)
                .with_layout(layout);
            let (weights, canonical, bias) = fused_source(&config);

            let shards: Vec<_> = ShardContext::local_group(ws)
                .iter()
                .map(|ctx| load_qkv(&config, "attn", &weights, ctx, true).unwrap())
                .collect();
            let (w, b) = reassemble(&config, &shards);
            prop_assert_eq!(w, canonical);
            prop_assert_eq!(b, bias);
        }
    }

    #[test]
    fn test_qkv_rejects_uneven_kv_heads() {
        // head_size 6: q_size 12 divides by 4 shards, kv_size 6 does not
        let config = ShellConfig::new(12, 1, 2, 1, 8, 8);
        let (weights, _, _) = fused_source(&config);
        let ctxs = ShardContext::local_group(4);
        let err = load_qkv(&config, "attn", &weights, &ctxs[0], true);
        assert!(matches!(err, Err(ShellError::Config(_))));
    }

    #[test]
    fn test_qkv_shape_checked() {
        let config = ShellConfig::new(8, 1, 4, 4, 8, 8);
        let mut weights = InMemoryWeights::new();
        weights.insert("attn.c_attn.weight", Tensor::zeros(vec![8, 8]));
        let err = load_qkv(&config, "attn", &weights, &ShardContext::single(), false);
        assert!(matches!(err, Err(ShellError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_row_bias_only_on_rank_zero() {
        for layout in [WeightLayout::Standard, WeightLayout::Transposed] {
            let config = ShellConfig::new(8, 1, 2, 2, 8, 8).with_layout(layout);
            let canonical = arange(vec![4, 8], 0.0); // [out=4, in=8]
            let stored = match layout {
                WeightLayout::Standard => canonical.clone(),
                WeightLayout::Transposed => canonical.t().unwrap(),
            };
            let mut weights = InMemoryWeights::new();
            weights.insert("c_proj.weight", stored);
            weights.insert("c_proj.bias", arange(vec![4], 0.0));

            let shards: Vec<_> = ShardContext::local_group(2)
                .iter()
                .map(|ctx| load_row(&config, "c_proj", &weights, ctx, true).unwrap())
                .collect();
            assert!(shards[0].bias.is_some());
            assert!(shards[1].bias.is_none());
            assert_eq!(shards[1].weight.shape(), &[4, 4]);
            let parts: Vec<_> = shards.iter().map(|s| s.weight.clone()).collect();
            assert_eq!(Tensor::cat(&parts, 1).unwrap(), canonical);
        }
    }

    #[test]
    fn test_column_slices_outputs() {
        let config = ShellConfig::new(4, 1, 2, 2, 8, 8).with_layout(WeightLayout::Transposed);
        let canonical = arange(vec![8, 4], 0.0);
        let mut weights = InMemoryWeights::new();
        weights.insert("c_fc.weight", canonical.t().unwrap());
        weights.insert("c_fc.bias", arange(vec![8], 0.0));
        let ctxs = ShardContext::local_group(2);
        let lw = load_column(&config, "c_fc", &weights, &ctxs[1], true).unwrap();
        assert_eq!(lw.weight, canonical.narrow(0, 4..8).unwrap());
        assert_eq!(lw.bias.unwrap().data(), &[4., 5., 6., 7.]);
    }

    #[test]
    fn test_vocab_embedding_pads_last_shard() {
        let mut weights = InMemoryWeights::new();
        weights.insert("wte", arange(vec![5, 2], 0.0));
        let ctxs = ShardContext::local_group(2);
        let last = load_vocab_embedding("wte", &weights, &ctxs[1]).unwrap();
        assert_eq!((last.min_id, last.max_id), (3, 5));
        assert_eq!(last.table.shape(), &[4, 2]);
        assert_eq!(last.table.data(), &[6., 7., 8., 9., 0., 0., 0., 0.]);
    }

    #[test]
    fn test_head_falls_back_to_replicated() {
        let mut weights = InMemoryWeights::new();
        weights.insert("transformer.wte.weight", arange(vec![5, 2], 0.0));
        let ctxs = ShardContext::local_group(2);
        let (head, gather) = load_head(&weights, &ctxs[1]).unwrap();
        assert!(!gather);
        assert_eq!(head.shape(), &[5, 2]);
    }

    #[test]
    fn test_tied_embedding_name_wins_over_alias() {
        let mut weights = InMemoryWeights::new();
        weights.insert("transformer.wte.weight", arange(vec![4, 2], 0.0));
        weights.insert("lm_head.weight", arange(vec![4, 2], 100.0));
        let ctxs = ShardContext::local_group(2);
        let (head, gather) = load_head(&weights, &ctxs[1]).unwrap();
        assert!(gather);
        assert_eq!(head.data(), &[4., 5., 6., 7.]);
    }

    #[test]
    fn test_lm_head_alias_serves_embedding_and_head() {
        let mut weights = InMemoryWeights::new();
        weights.insert("lm_head.weight", arange(vec![4, 2], 0.0));
        let ctxs = ShardContext::local_group(2);
        let (head, gather) = load_head(&weights, &ctxs[0]).unwrap();
        assert!(gather);
        assert_eq!(head.data(), &[0., 1., 2., 3.]);
        let emb = load_vocab_embedding("transformer.wte.weight", &weights, &ctxs[1]).unwrap();
        assert_eq!(emb.table.data(), &[4., 5., 6., 7., 0., 0.]);

        let empty = InMemoryWeights::new();
        assert!(matches!(
            load_head(&empty, &ctxs[0]),
            Err(ShellError::MissingWeight(_))
        ));
    }

    #[test]
    fn test_quantize_rejected_eagerly() {
        let config = ShellConfig::new(8, 1, 2, 2, 8, 8).with_quantize(Some(Quantize::Gptq));
        assert!(matches!(check_supported(&config), Err(ShellError::Unsupported(_))));
        let config = ShellConfig::new(8, 1, 2, 2, 8, 8).with_device("cuda:0");
        assert!(matches!(check_supported(&config), Err(ShellError::Unsupported(_))));
    }
}
