/// Integer inputs of one forward call, already validated by the serving loop.
///
/// A batch is a prefill when `cu_seqlen_prefill` is set: tokens of several
/// new sequences laid end to end, sequence `i` spanning
/// `cu_seqlen_prefill[i]..cu_seqlen_prefill[i + 1]`. Otherwise it is a decode
/// step with exactly one token per sequence, whose context is read from the
/// paged cache through `block_tables[i]` for `input_lengths[i]` positions.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub input_ids: Vec<usize>,
    pub position_ids: Vec<usize>,
    pub cu_seqlen_prefill: Option<Vec<usize>>,
    pub block_tables: Vec<Vec<usize>>,
    /// cache slot for every token of `input_ids`
    pub slots: Vec<usize>,
    pub input_lengths: Vec<usize>,
    pub max_s: usize,
    /// rows of the output to keep, e.g. the last token of each sequence
    pub lm_head_indices: Option<Vec<usize>>,
}

impl Batch {
    pub fn is_prefill(&self) -> bool {
        self.cu_seqlen_prefill.is_some()
    }

    pub fn n_tokens(&self) -> usize {
        self.input_ids.len()
    }

    /// Prefill of one sequence at positions `0..ids.len()`, cached through `block_table`.
    pub fn single_prefill(ids: &[usize], block_table: &[usize], block_size: usize) -> Self {
        let n = ids.len();
        let slots = (0..n)
            .map(|pos| block_table[pos / block_size] * block_size + pos % block_size)
            .collect();
        Self {
            input_ids: ids.to_vec(),
            position_ids: (0..n).collect(),
            cu_seqlen_prefill: Some(vec![0, n]),
            block_tables: vec![block_table.to_vec()],
            slots,
            input_lengths: vec![n],
            max_s: n,
            lm_head_indices: None,
        }
    }

    /// Decode of one token at position `pos` of a sequence cached through `block_table`.
    pub fn single_decode(id: usize, pos: usize, block_table: &[usize], block_size: usize) -> Self {
        Self {
            input_ids: vec![id],
            position_ids: vec![pos],
            cu_seqlen_prefill: None,
            block_tables: vec![block_table.to_vec()],
            slots: vec![block_table[pos / block_size] * block_size + pos % block_size],
            input_lengths: vec![pos + 1],
            max_s: pos + 1,
            lm_head_indices: None,
        }
    }
}
