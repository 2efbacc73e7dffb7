use datasize::DataSize;

use super::{
    config::{Activation, ShellConfig},
    linear::{ColumnLinear, RowLinear},
    loader::{load_column, load_row},
    shard::ShardContext,
    weights::WeightSource,
};
use crate::{
    error::Result,
    ops::{gelu, gelu_tanh, relu, silu},
};

impl Activation {
    pub fn apply(self, x: &mut [f32]) {
        match self {
            Activation::Gelu => gelu(x),
            Activation::GeluTanh => gelu_tanh(x),
            Activation::Relu => relu(x),
            Activation::Silu => silu(x),
        }
    }
}

/// `c_proj(act(c_fc(x)))`, with `c_fc` split by columns and `c_proj` by rows.
#[derive(Debug, DataSize)]
pub struct ShellMlp {
    #[data_size(skip)]
    act: Activation,
    c_fc: ColumnLinear,
    c_proj: RowLinear,
}

impl ShellMlp {
    pub fn load(
        config: &ShellConfig,
        prefix: &str,
        weights: &impl WeightSource,
        shard: &ShardContext,
    ) -> Result<Self> {
        let act = config.activation()?;
        let c_fc = ColumnLinear::new(load_column(
            config,
            &format!("{prefix}.c_fc"),
            weights,
            shard,
            true,
        )?)?;
        let c_proj = RowLinear::new(
            load_row(config, &format!("{prefix}.c_proj"), weights, shard, true)?,
            shard.clone(),
        )?;
        Ok(Self { act, c_fc, c_proj })
    }

    pub fn forward(&self, hidden: &[f32]) -> Result<Vec<f32>> {
        let mut x = self.c_fc.forward(hidden);
        self.act.apply(&mut x);
        self.c_proj.forward(&x)
    }
}
