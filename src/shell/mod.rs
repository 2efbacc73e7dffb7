//! Tensor-parallel CodeShell inference.
//!
//! Every shard loads its slice of the checkpoint through [`ShardContext`] and
//! runs the same [`ShellForCausalLM::forward`] call; collectives inside the
//! row-parallel projections, the embedding and the head keep the shards in step.

pub mod attention;
pub mod batch;
pub mod config;
pub mod kv_cache;
pub mod layer;
pub mod linear;
pub mod loader;
pub mod mlp;
pub mod model;
pub mod rotary;
pub mod shard;
pub mod weights;

pub use batch::Batch;
pub use config::{Activation, Quantize, RopeScaling, ShellConfig, WeightLayout};
pub use kv_cache::KvCache;
pub use model::ShellForCausalLM;
pub use shard::{Communicator, LocalGroup, NoopCommunicator, ShardContext};
pub use weights::{InMemoryWeights, SafetensorsWeights, Tensor, WeightSource};
