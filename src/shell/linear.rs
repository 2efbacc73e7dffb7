use datasize::DataSize;

use super::{loader::LinearWeights, shard::ShardContext};
use crate::{
    error::{Result, ShellError},
    ops::linear,
};

/// Dense projection applied row by row to a `[n_tokens, in_features]` batch.
#[derive(Debug, DataSize)]
pub struct Linear {
    weight: Vec<f32>, // (out_features, in_features)
    bias: Option<Vec<f32>>,
    out_features: usize,
    in_features: usize,
}

impl Linear {
    pub fn new(lw: LinearWeights) -> Result<Self> {
        let shape = lw.weight.shape().to_vec();
        if shape.len() != 2 {
            return Err(ShellError::ShapeMismatch {
                name: "linear weight".to_string(),
                expected: vec![0, 0],
                got: shape,
            });
        }
        let (out_features, in_features) = (shape[0], shape[1]);
        if let Some(bias) = &lw.bias {
            if bias.shape() != [out_features] {
                return Err(ShellError::ShapeMismatch {
                    name: "linear bias".to_string(),
                    expected: vec![out_features],
                    got: bias.shape().to_vec(),
                });
            }
        }
        Ok(Self {
            weight: lw.weight.into_data(),
            bias: lw.bias.map(|b| b.into_data()),
            out_features,
            in_features,
        })
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let n_tokens = x.len() / self.in_features;
        let mut out = vec![0f32; n_tokens * self.out_features];
        for (xrow, orow) in x
            .chunks_exact(self.in_features)
            .zip(out.chunks_exact_mut(self.out_features))
        {
            linear(orow, xrow, &self.weight, self.bias.as_deref());
        }
        out
    }
}

/// Output features are split across shards; the output stays sharded.
#[derive(Debug, DataSize)]
pub struct ColumnLinear {
    linear: Linear,
}

impl ColumnLinear {
    pub fn new(lw: LinearWeights) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(lw)?,
        })
    }

    pub fn out_features(&self) -> usize {
        self.linear.out_features()
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        self.linear.forward(x)
    }
}

/// Input features are split across shards; partial outputs are summed with an
/// all-reduce. Only rank 0 holds the bias so it lands in the sum once.
#[derive(Debug, DataSize)]
pub struct RowLinear {
    linear: Linear,
    #[data_size(skip)]
    shard: ShardContext,
}

impl RowLinear {
    pub fn new(lw: LinearWeights, shard: ShardContext) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(lw)?,
            shard,
        })
    }

    pub fn in_features(&self) -> usize {
        self.linear.in_features()
    }

    pub fn forward(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut out = self.linear.forward(x);
        self.shard.all_reduce_sum(&mut out)?;
        Ok(out)
    }
}
