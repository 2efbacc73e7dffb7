use datasize::DataSize;

use super::{
    attention::ShellAttention,
    batch::Batch,
    config::ShellConfig,
    kv_cache::KvCache,
    mlp::ShellMlp,
    rotary::CosSin,
    shard::ShardContext,
    weights::WeightSource,
};
use crate::{
    error::{Result, ShellError},
    ops::{accum, layernorm},
};

/// LayerNorm with bias that can fold in the pending residual add.
#[derive(Debug, DataSize)]
pub struct LayerNorm {
    weight: Vec<f32>,
    bias: Vec<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn load(prefix: &str, weights: &impl WeightSource, eps: f32) -> Result<Self> {
        let weight = weights.get_tensor(&format!("{prefix}.weight"))?;
        let bias = weights.get_tensor(&format!("{prefix}.bias"))?;
        if bias.shape() != weight.shape() {
            return Err(ShellError::ShapeMismatch {
                name: format!("{prefix}.bias"),
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        Ok(Self {
            weight: weight.into_data(),
            bias: bias.into_data(),
            eps,
        })
    }

    /// Returns `(norm(hidden + residual), hidden + residual)`; without a
    /// residual the sum is `hidden` itself.
    pub fn forward(&self, mut hidden: Vec<f32>, residual: Option<Vec<f32>>) -> (Vec<f32>, Vec<f32>) {
        if let Some(residual) = residual {
            accum(&mut hidden, &residual);
        }
        let dim = self.weight.len();
        let mut normed = vec![0f32; hidden.len()];
        for (o, x) in normed.chunks_exact_mut(dim).zip(hidden.chunks_exact(dim)) {
            layernorm(o, x, &self.weight, &self.bias, self.eps);
        }
        (normed, hidden)
    }
}

/// Pre-norm block: `ln_1 -> attn -> (+res) ln_2 -> mlp`.
///
/// The residual sums are deferred: each call returns the mlp output together
/// with the stream it must be added to, and the next norm does the add.
#[derive(Debug, DataSize)]
pub struct ShellLayer {
    self_attn: ShellAttention,
    mlp: ShellMlp,
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
}

impl ShellLayer {
    pub fn load(
        config: &ShellConfig,
        layer_id: usize,
        weights: &impl WeightSource,
        shard: &ShardContext,
    ) -> Result<Self> {
        let prefix = format!("transformer.h.{layer_id}");
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            self_attn: ShellAttention::load(config, &format!("{prefix}.attn"), weights, shard)?,
            mlp: ShellMlp::load(config, &format!("{prefix}.mlp"), weights, shard)?,
            input_layernorm: LayerNorm::load(&format!("{prefix}.ln_1"), weights, eps)?,
            post_attention_layernorm: LayerNorm::load(&format!("{prefix}.ln_2"), weights, eps)?,
        })
    }

    pub fn self_attn(&self) -> &ShellAttention {
        &self.self_attn
    }

    pub fn forward(
        &self,
        hidden: Vec<f32>,
        residual: Option<Vec<f32>>,
        cos_sin: &CosSin,
        batch: &Batch,
        cache: &mut KvCache,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let (normed, res) = self.input_layernorm.forward(hidden, residual);

        let attn_output = self.self_attn.forward(&normed, cos_sin, batch, cache)?;

        let (normed, attn_res) = self
            .post_attention_layernorm
            .forward(attn_output, Some(res));

        let mlp_output = self.mlp.forward(&normed)?;
        Ok((mlp_output, attn_res))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shell::weights::{InMemoryWeights, Tensor};

    #[test]
    fn test_fused_residual_add() {
        let mut weights = InMemoryWeights::new();
        weights.insert("ln.weight", Tensor::new(vec![2], vec![1., 1.]).unwrap());
        weights.insert("ln.bias", Tensor::new(vec![2], vec![0., 0.]).unwrap());
        let ln = LayerNorm::load("ln", &weights, 0.0).unwrap();

        let (normed, res) = ln.forward(vec![1., 2., 0., 0.], Some(vec![2., 0., 5., 3.]));
        assert_eq!(res, vec![3., 2., 5., 3.]);
        assert_eq!(normed, vec![1., -1., 1., -1.]);

        let (_, res) = ln.forward(vec![4., 6.], None);
        assert_eq!(res, vec![4., 6.]);
    }

    #[test]
    fn test_layernorm_shape_checked() {
        let mut weights = InMemoryWeights::new();
        weights.insert("ln.weight", Tensor::zeros(vec![4]));
        weights.insert("ln.bias", Tensor::zeros(vec![3]));
        assert!(matches!(
            LayerNorm::load("ln", &weights, 1e-5),
            Err(ShellError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_layer_loads_and_runs() {
        let config = ShellConfig::new(8, 1, 2, 2, 16, 8);
        let weights = InMemoryWeights::random(&config, 3).unwrap();
        let layer = ShellLayer::load(&config, 0, &weights, &ShardContext::single()).unwrap();
        let rope = crate::shell::rotary::RotaryEmbedding::new(&config);
        let batch = Batch::single_prefill(&[1, 2], &[0], 4);
        let cs = rope.get_cos_sin(&batch.position_ids, batch.max_s);
        let mut cache = KvCache::new(1, 4, 2, 4);
        let hidden: Vec<f32> = (0..16).map(|v| v as f32 * 0.05).collect();
        let (out, res) = layer
            .forward(hidden.clone(), None, &cs, &batch, &mut cache)
            .unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(res.len(), 16);
        assert!(out.iter().chain(res.iter()).all(|v| v.is_finite()));
        // the attention residual is hidden + attn(hidden), never hidden alone
        assert_ne!(res, hidden);
    }
}
