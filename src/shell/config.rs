use std::{fs::File, io::BufReader, path::Path, str::FromStr};

use serde::Deserialize;

use crate::error::{Result, ShellError};

/// How a projection weight is stored on disk.
///
/// `Standard` is `[out_features, in_features]` (torch `nn.Linear`);
/// `Transposed` is `[in_features, out_features]` (GPT-2 `Conv1D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightLayout {
    #[default]
    Standard,
    Transposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RopeScaling {
    /// positions are divided by `factor`
    Linear { factor: f32 },
    /// NTK-aware base rescaling once the sequence outgrows `max_position_embeddings`
    Dynamic { factor: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantize {
    Gptq,
    Awq,
    BitsAndBytes,
    Eetq,
}

impl FromStr for Quantize {
    type Err = ShellError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gptq" => Ok(Quantize::Gptq),
            "awq" => Ok(Quantize::Awq),
            "bitsandbytes" => Ok(Quantize::BitsAndBytes),
            "eetq" => Ok(Quantize::Eetq),
            _ => Err(ShellError::unsupported(format!("quantization `{s}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Gelu,
    GeluTanh,
    Relu,
    Silu,
}

impl FromStr for Activation {
    type Err = ShellError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.to_lowercase();
        if s.contains("gelu") {
            return Ok(match s.as_str() {
                "gelu_fast" | "gelu_pytorch_tanh" => Activation::GeluTanh,
                _ => Activation::Gelu,
            });
        }
        match s.as_str() {
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            _ => Err(ShellError::config(format!("unknown activation function `{s}`"))),
        }
    }
}

// config.json as written by the checkpoint; CodeShell uses GPT-2 style names
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(alias = "n_embd")]
    hidden_size: usize,
    #[serde(alias = "n_layer")]
    num_hidden_layers: usize,
    #[serde(alias = "n_head")]
    num_attention_heads: usize,
    #[serde(default, alias = "num_query_groups")]
    num_key_value_heads: Option<usize>,
    #[serde(default, alias = "n_inner")]
    intermediate_size: Option<usize>,
    vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    rope_theta: f32,
    #[serde(default)]
    rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_max_positions", alias = "n_positions")]
    max_position_embeddings: usize,
    #[serde(default = "default_eps", alias = "rms_norm_eps")]
    layer_norm_epsilon: f32,
    #[serde(default = "default_act", alias = "activation_function")]
    hidden_act: String,
    #[serde(default)]
    architectures: Vec<String>,
}

fn default_rope_theta() -> f32 {
    10000.0
}
fn default_max_positions() -> usize {
    8192
}
fn default_eps() -> f32 {
    1e-5
}
fn default_act() -> String {
    "gelu_pytorch_tanh".to_string()
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub hidden_size: usize,       // transformer dimension
    pub num_hidden_layers: usize, // number of layers
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize, // can be < query heads because of grouped-query attention
    pub intermediate_size: usize,   // for mlp layers
    pub vocab_size: usize,
    pub rope_theta: f32,
    pub rope_scaling: Option<RopeScaling>,
    pub max_position_embeddings: usize,
    pub layer_norm_epsilon: f32,
    pub hidden_act: String,
    // runtime flags
    pub quantize: Option<Quantize>,
    pub layout: WeightLayout,
    pub device: String,
    pub num_shard: usize,
}

impl ShellConfig {
    /// A config with the given dimensions and CodeShell defaults for everything else.
    pub fn new(
        hidden_size: usize,
        num_hidden_layers: usize,
        num_attention_heads: usize,
        num_key_value_heads: usize,
        intermediate_size: usize,
        vocab_size: usize,
    ) -> Self {
        Self {
            hidden_size,
            num_hidden_layers,
            num_attention_heads,
            num_key_value_heads,
            intermediate_size,
            vocab_size,
            rope_theta: default_rope_theta(),
            rope_scaling: None,
            max_position_embeddings: default_max_positions(),
            layer_norm_epsilon: default_eps(),
            hidden_act: default_act(),
            quantize: None,
            layout: WeightLayout::Standard,
            device: "cpu".to_string(),
            num_shard: 1,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let raw: RawConfig = serde_json::from_reader(reader)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        // GPT-2 derived checkpoints store Conv1D weights
        let layout = match raw.architectures.first() {
            Some(arch) if arch.starts_with("GPT2") => WeightLayout::Transposed,
            _ => WeightLayout::Standard,
        };
        Self {
            hidden_size: raw.hidden_size,
            num_hidden_layers: raw.num_hidden_layers,
            num_attention_heads: raw.num_attention_heads,
            num_key_value_heads: raw.num_key_value_heads.unwrap_or(raw.num_attention_heads),
            intermediate_size: raw.intermediate_size.unwrap_or(4 * raw.hidden_size),
            vocab_size: raw.vocab_size,
            rope_theta: raw.rope_theta,
            rope_scaling: raw.rope_scaling,
            max_position_embeddings: raw.max_position_embeddings,
            layer_norm_epsilon: raw.layer_norm_epsilon,
            hidden_act: raw.hidden_act,
            quantize: None,
            layout,
            device: "cpu".to_string(),
            num_shard: 1,
        }
    }

    pub fn with_quantize(mut self, quantize: Option<Quantize>) -> Self {
        self.quantize = quantize;
        self
    }

    pub fn with_layout(mut self, layout: WeightLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_num_shard(mut self, num_shard: usize) -> Self {
        self.num_shard = num_shard;
        self
    }

    pub fn with_hidden_act(mut self, act: impl Into<String>) -> Self {
        self.hidden_act = act.into();
        self
    }

    pub fn with_rope_scaling(mut self, scaling: Option<RopeScaling>) -> Self {
        self.rope_scaling = scaling;
        self
    }

    pub fn head_size(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Width of the query block of the fused projection, unsharded.
    pub fn q_size(&self) -> usize {
        self.num_attention_heads * self.head_size()
    }

    /// Width of the key (and of the value) block of the fused projection, unsharded.
    pub fn kv_size(&self) -> usize {
        self.num_key_value_heads * self.head_size()
    }

    pub fn activation(&self) -> Result<Activation> {
        self.hidden_act.parse()
    }

    /// Checks the dimensions are self-consistent. Shard divisibility is checked
    /// where each weight is sharded.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(ShellError::config("head counts must be positive"));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ShellError::config(format!(
                "`hidden_size` {} is not divisible by `num_attention_heads` {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(ShellError::config(format!(
                "`num_attention_heads` {} is not a multiple of `num_key_value_heads` {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_size() % 2 != 0 {
            return Err(ShellError::config("rotary embedding needs an even head size"));
        }
        if self.num_shard == 0 {
            return Err(ShellError::config("`num_shard` must be at least 1"));
        }
        self.activation()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_codeshell_names() {
        let json = r#"{
            "architectures": ["CodeShellForCausalLM"],
            "n_embd": 64, "n_layer": 2, "n_head": 8, "num_query_groups": 2,
            "n_inner": 256, "vocab_size": 100, "n_positions": 512,
            "activation_function": "gelu_pytorch_tanh", "layer_norm_epsilon": 1e-5,
            "rope_scaling": {"type": "linear", "factor": 2.0}
        }"#;
        let config = ShellConfig::from_json_str(json).unwrap();
        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.num_key_value_heads, 2);
        assert_eq!(config.intermediate_size, 256);
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.layout, WeightLayout::Standard);
        assert_eq!(config.rope_scaling, Some(RopeScaling::Linear { factor: 2.0 }));
        assert_eq!(config.activation().unwrap(), Activation::GeluTanh);
        assert_eq!(config.head_size(), 8);
        assert_eq!(config.kv_size(), 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_gpt2_arch_is_transposed_and_kv_defaults() {
        let json = r#"{
            "architectures": ["GPT2LMHeadModel"],
            "hidden_size": 32, "num_hidden_layers": 1, "num_attention_heads": 4,
            "vocab_size": 10
        }"#;
        let config = ShellConfig::from_json_str(json).unwrap();
        assert_eq!(config.layout, WeightLayout::Transposed);
        assert_eq!(config.num_key_value_heads, 4);
        assert_eq!(config.intermediate_size, 128);
    }

    #[test]
    fn test_activation_names() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("gelu_new".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("gelu_fast".parse::<Activation>().unwrap(), Activation::GeluTanh);
        assert_eq!("swish".parse::<Activation>().unwrap(), Activation::Silu);
        assert!(matches!(
            "mish".parse::<Activation>(),
            Err(ShellError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_uneven_heads() {
        let config = ShellConfig::new(16, 1, 4, 3, 32, 8);
        assert!(matches!(config.validate(), Err(ShellError::Config(_))));
    }
}
