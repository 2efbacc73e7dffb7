//! Tensor-parallel group membership and the collectives the model needs.
//!
//! Every shard runs the same forward call on its own slice of the weights.
//! Row-parallel projections and the vocab-parallel embedding end in an
//! all-reduce, the head ends in an all-gather; a shard that never reaches a
//! collective stalls the whole group.

use std::{
    fmt,
    ops::Range,
    sync::{Arc, Barrier, Mutex},
};

use crate::error::{Result, ShellError};

/// Collective operations over one process group.
pub trait Communicator: Send + Sync {
    /// Element-wise sum of `buf` across all ranks, written back into `buf` on every rank.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Concatenation of every rank's `local` buffer in rank order.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>>;
}

/// world_size == 1: every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommunicator;

impl Communicator for NoopCommunicator {
    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        Ok(local.to_vec())
    }
}

struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

/// In-process group where each shard is a thread holding one `LocalCommunicator`.
pub struct LocalGroup;

impl LocalGroup {
    /// One communicator per rank, index == rank.
    pub fn new(world_size: usize) -> Vec<LocalCommunicator> {
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| LocalCommunicator {
                rank,
                exchange: exchange.clone(),
            })
            .collect()
    }
}

pub struct LocalCommunicator {
    rank: usize,
    exchange: Arc<Exchange>,
}

impl LocalCommunicator {
    // publish our buffer, wait for everybody, read all buffers, wait again so
    // no rank overwrites its slot before the others have read it
    fn exchange(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        {
            let mut slots = self.lock()?;
            slots[self.rank] = local.to_vec();
        }
        self.exchange.barrier.wait();
        let all = self.lock()?.clone();
        self.exchange.barrier.wait();
        Ok(all)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<f32>>>> {
        self.exchange
            .slots
            .lock()
            .map_err(|_| ShellError::Communication("peer shard panicked".to_string()))
    }
}

impl Communicator for LocalCommunicator {
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let all = self.exchange(buf)?;
        // sum in rank order so every rank gets bit-identical results
        buf.fill(0.0);
        for part in &all {
            if part.len() != buf.len() {
                return Err(ShellError::Communication(format!(
                    "all_reduce length mismatch: {} vs {}",
                    part.len(),
                    buf.len()
                )));
            }
            for (b, p) in buf.iter_mut().zip(part.iter()) {
                *b += *p;
            }
        }
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        Ok(self.exchange(local)?.concat())
    }
}

/// This process's position in the tensor-parallel group, plus the group's collectives.
#[derive(Clone)]
pub struct ShardContext {
    pub rank: usize,
    pub world_size: usize,
    comm: Arc<dyn Communicator>,
}

impl fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl ShardContext {
    pub fn new(rank: usize, world_size: usize, comm: Arc<dyn Communicator>) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(ShellError::config(format!(
                "rank {rank} is outside a group of {world_size}"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            comm,
        })
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            comm: Arc::new(NoopCommunicator),
        }
    }

    /// One context per rank of an in-process `LocalGroup`.
    pub fn local_group(world_size: usize) -> Vec<Self> {
        LocalGroup::new(world_size)
            .into_iter()
            .map(|comm| Self {
                rank: comm.rank,
                world_size,
                comm: Arc::new(comm),
            })
            .collect()
    }

    /// `[rank * block, (rank + 1) * block)` of a dimension of size `dim`.
    pub fn shard_range(&self, dim: usize, what: &str) -> Result<Range<usize>> {
        if dim % self.world_size != 0 {
            return Err(ShellError::config(format!(
                "`{what}` ({dim}) is not divisible by `num_shards` ({})",
                self.world_size
            )));
        }
        let block = dim / self.world_size;
        Ok(self.rank * block..(self.rank + 1) * block)
    }

    pub fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        self.comm.all_reduce_sum(buf)
    }

    pub fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        if self.world_size == 1 {
            return Ok(local.to_vec());
        }
        self.comm.all_gather(local)
    }
}
