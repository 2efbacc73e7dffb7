use std::io::Write;

use anyhow::{bail, Result};
use datasize::data_size;
use humansize::{format_size, DECIMAL};
use tracing::info;

use crate::{
    sampler::Sampler,
    utils::{time_in_ms, tokens_per_sec},
};
use rustic_shell::shell::{Batch, ShardContext, ShellForCausalLM};

/// Hands out cache blocks in order and never frees them; one sequence only.
pub struct BlockAllocator {
    next_free: usize,
    num_blocks: usize,
}

impl BlockAllocator {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            next_free: 0,
            num_blocks,
        }
    }

    pub fn allocate(&mut self) -> Result<usize> {
        if self.next_free == self.num_blocks {
            bail!("kv cache exhausted: all {} blocks in use", self.num_blocks);
        }
        self.next_free += 1;
        Ok(self.next_free - 1)
    }

    /// Grows `block_table` until it covers `len` positions.
    pub fn reserve(&mut self, block_table: &mut Vec<usize>, len: usize, block_size: usize) -> Result<()> {
        while block_table.len() * block_size < len {
            block_table.push(self.allocate()?);
        }
        Ok(())
    }
}

/// Runs `prompt` through one prefill, then decodes until the sequence holds
/// `steps` tokens, at least one of them new. Every shard of the group calls
/// this with the same arguments; the token rank 0 picks is the one every
/// shard continues with.
pub fn generate(
    lm: &ShellForCausalLM,
    shard: &ShardContext,
    sampler: &mut Sampler,
    prompt: &[usize],
    steps: usize,
    block_size: usize,
) -> Result<Vec<usize>> {
    if prompt.is_empty() {
        bail!("prompt must hold at least one token");
    }
    let steps = steps.max(prompt.len() + 1);
    let num_blocks = steps.div_ceil(block_size);
    let mut allocator = BlockAllocator::new(num_blocks);
    let mut kv_cache = lm.new_kv_cache(num_blocks, block_size);
    if shard.rank == 0 {
        info!(
            "kv cache heap: {}",
            format_size(data_size(&kv_cache), DECIMAL)
        );
    }

    let mut block_table = Vec::new();
    allocator.reserve(&mut block_table, prompt.len(), block_size)?;
    let mut tokens = prompt.to_vec();

    // prefill over the whole prompt, keeping only the last row of logits
    let mut batch = Batch::single_prefill(prompt, &block_table, block_size);
    batch.lm_head_indices = Some(vec![prompt.len() - 1]);
    let mut logits = lm.forward(&batch, &mut kv_cache)?;
    let mut token = pick(shard, sampler, &mut logits)?;
    emit(shard, token)?;

    // start the main loop
    let mut start = 0u128; // used to time our code, only initialized after first iteration
    let mut pos = prompt.len(); // position in the sequence
    while tokens.len() + 1 < steps {
        tokens.push(token);
        allocator.reserve(&mut block_table, pos + 1, block_size)?;
        let batch = Batch::single_decode(token, pos, &block_table, block_size);
        let mut logits = lm.forward(&batch, &mut kv_cache)?;
        token = pick(shard, sampler, &mut logits)?;
        emit(shard, token)?;
        pos += 1;

        // init the timer here because the first iteration can be slower
        if start == 0 {
            start = time_in_ms()?;
        }
    }
    tokens.push(token);
    if shard.rank == 0 {
        println!();
    }

    // report achieved tok/s (the timer starts after the first decode step)
    let decoded = tokens.len().saturating_sub(prompt.len() + 2);
    if shard.rank == 0 && decoded > 0 {
        let end = time_in_ms()?;
        info!("achieved tok/s: {:.2}", tokens_per_sec(decoded, start, end));
    }

    Ok(tokens)
}

// Every rank samples, then all adopt rank 0's choice.
fn pick(shard: &ShardContext, sampler: &mut Sampler, logits: &mut [f32]) -> Result<usize> {
    let local = sampler.sample(logits);
    let chosen = shard.all_gather(&[local as f32])?;
    Ok(chosen[0] as usize)
}

fn emit(shard: &ShardContext, token: usize) -> Result<()> {
    if shard.rank == 0 {
        print!("{token} ");
        std::io::stdout().flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rustic_shell::shell::{InMemoryWeights, ShellConfig};

    #[test]
    fn test_allocator_reserves_and_exhausts() {
        let mut allocator = BlockAllocator::new(2);
        let mut table = Vec::new();
        allocator.reserve(&mut table, 3, 2).unwrap();
        assert_eq!(table, vec![0, 1]);
        allocator.reserve(&mut table, 4, 2).unwrap();
        assert_eq!(table, vec![0, 1]);
        assert!(allocator.reserve(&mut table, 5, 2).is_err());
    }

    #[test]
    fn test_generate_greedy_length_and_determinism() {
        let config = ShellConfig::new(16, 2, 2, 1, 32, 32);
        let weights = InMemoryWeights::random(&config, 1).unwrap();
        let shard = ShardContext::single();
        let lm = ShellForCausalLM::load(&config, &weights, &shard).unwrap();

        let run = || {
            let mut sampler = Sampler::new(0.0, 0);
            generate(&lm, &shard, &mut sampler, &[3, 5], 7, 4).unwrap()
        };
        let tokens = run();
        assert_eq!(tokens.len(), 7);
        assert_eq!(&tokens[..2], &[3, 5]);
        assert!(tokens.iter().all(|&t| t < 32));
        assert_eq!(tokens, run());
    }
}
