use datasize::DataSize;

/// One layer's paged key/value cache.
///
/// Both buffers are `[num_blocks, block_size, num_kv_heads, head_size]`, so
/// slot `s` lives in block `s / block_size` at offset `s % block_size`. The
/// serving loop owns block allocation; the model only reads and writes the
/// slots it is handed.
#[derive(Debug, Clone, DataSize)]
pub struct KvCache {
    key: Vec<f32>,
    value: Vec<f32>,
    num_blocks: usize,
    block_size: usize,
    kv_dim: usize, // num_kv_heads * head_size
}

impl KvCache {
    pub fn new(num_blocks: usize, block_size: usize, num_kv_heads: usize, head_size: usize) -> Self {
        let kv_dim = num_kv_heads * head_size;
        Self {
            key: vec![0f32; num_blocks * block_size * kv_dim],
            value: vec![0f32; num_blocks * block_size * kv_dim],
            num_blocks,
            block_size,
            kv_dim,
        }
    }

    /// One cache per layer, all with the same geometry.
    pub fn for_layers(
        n_layers: usize,
        num_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
    ) -> Vec<Self> {
        (0..n_layers)
            .map(|_| Self::new(num_blocks, block_size, num_kv_heads, head_size))
            .collect()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Slot holding position `pos` of a sequence whose pages are `block_table`.
    #[inline]
    pub fn slot(&self, block_table: &[usize], pos: usize) -> usize {
        block_table[pos / self.block_size] * self.block_size + pos % self.block_size
    }

    /// Writes token `t` of `key`/`value` (`[n_tokens, kv_dim]`) to `slots[t]`.
    pub fn reshape_and_cache(&mut self, key: &[f32], value: &[f32], slots: &[usize]) {
        let d = self.kv_dim;
        debug_assert!(key.len() == slots.len() * d && value.len() == key.len());
        for (t, &slot) in slots.iter().enumerate() {
            self.key[slot * d..(slot + 1) * d].copy_from_slice(&key[t * d..(t + 1) * d]);
            self.value[slot * d..(slot + 1) * d].copy_from_slice(&value[t * d..(t + 1) * d]);
        }
    }

    #[inline]
    pub fn key_at(&self, slot: usize) -> &[f32] {
        &self.key[slot * self.kv_dim..(slot + 1) * self.kv_dim]
    }

    #[inline]
    pub fn value_at(&self, slot: usize) -> &[f32] {
        &self.value[slot * self.kv_dim..(slot + 1) * self.kv_dim]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slot_addressing() {
        let cache = KvCache::new(4, 16, 1, 2);
        let table = [2, 0, 3];
        assert_eq!(cache.slot(&table, 0), 32);
        assert_eq!(cache.slot(&table, 15), 47);
        assert_eq!(cache.slot(&table, 16), 0);
        assert_eq!(cache.slot(&table, 33), 49);
        assert_eq!(cache.num_slots(), 64);
    }

    #[test]
    fn test_write_then_read() {
        let mut cache = KvCache::new(2, 2, 2, 1);
        cache.reshape_and_cache(&[1., 2., 3., 4.], &[5., 6., 7., 8.], &[3, 0]);
        assert_eq!(cache.key_at(3), &[1., 2.]);
        assert_eq!(cache.value_at(0), &[7., 8.]);
        assert_eq!(cache.key_at(1), &[0., 0.]);
    }
}
