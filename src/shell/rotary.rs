use datasize::DataSize;

use super::config::{RopeScaling, ShellConfig};

/// Rotary position embedding with the half-split convention: coordinate `i`
/// of a head is paired with coordinate `i + head_size / 2`.
#[derive(Debug, Clone, DataSize)]
pub struct RotaryEmbedding {
    head_size: usize,
    base: f64,
    inv_freq: Vec<f64>, // (head_size / 2,)
    #[data_size(skip)]
    scaling: Option<RopeScaling>,
    max_position_embeddings: usize,
}

/// Per-token cos/sin rows, `head_size / 2` wide, for one forward call.
#[derive(Debug, Clone, PartialEq)]
pub struct CosSin {
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
    half: usize,
}

impl CosSin {
    pub fn n_tokens(&self) -> usize {
        self.cos.len() / self.half
    }

    /// Rotates `x`, laid out `[n_tokens, n_heads, head_size]`, in place.
    pub fn rotate(&self, x: &mut [f32]) {
        let half = self.half;
        let head_size = 2 * half;
        let n_tokens = self.n_tokens();
        if n_tokens == 0 {
            return;
        }
        let token_width = x.len() / n_tokens;
        for (t, token) in x.chunks_exact_mut(token_width).enumerate() {
            let cos = &self.cos[t * half..(t + 1) * half];
            let sin = &self.sin[t * half..(t + 1) * half];
            for head in token.chunks_exact_mut(head_size) {
                let (x1, x2) = head.split_at_mut(half);
                for i in 0..half {
                    let v0 = x1[i];
                    let v1 = x2[i];
                    x1[i] = v0 * cos[i] - v1 * sin[i];
                    x2[i] = v1 * cos[i] + v0 * sin[i];
                }
            }
        }
    }

    /// Rotates query and key in place; works the same for one token or many.
    pub fn apply(&self, query: &mut [f32], key: &mut [f32]) {
        self.rotate(query);
        self.rotate(key);
    }
}

fn create_inv_freq(head_size: usize, base: f64) -> Vec<f64> {
    (0..head_size)
        .step_by(2)
        .map(|i| 1.0 / base.powf(i as f64 / head_size as f64))
        .collect()
}

impl RotaryEmbedding {
    pub fn new(config: &ShellConfig) -> Self {
        Self::with_params(
            config.head_size(),
            config.rope_theta,
            config.rope_scaling,
            config.max_position_embeddings,
        )
    }

    pub fn with_params(
        head_size: usize,
        base: f32,
        scaling: Option<RopeScaling>,
        max_position_embeddings: usize,
    ) -> Self {
        let base = base as f64;
        Self {
            head_size,
            base,
            inv_freq: create_inv_freq(head_size, base),
            scaling,
            max_position_embeddings,
        }
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// cos/sin rows for every entry of `position_ids`. `max_s` is the longest
    /// sequence in the batch; it only matters for dynamic scaling.
    pub fn get_cos_sin(&self, position_ids: &[usize], max_s: usize) -> CosSin {
        let (inv_freq, position_scale) = match self.scaling {
            None => (self.inv_freq.clone(), 1.0),
            Some(RopeScaling::Linear { factor }) => (self.inv_freq.clone(), 1.0 / factor as f64),
            Some(RopeScaling::Dynamic { factor }) => {
                if max_s > self.max_position_embeddings {
                    let factor = factor as f64;
                    let d = self.head_size as f64;
                    let ratio = factor * max_s as f64 / self.max_position_embeddings as f64;
                    let base = self.base * (ratio - (factor - 1.0)).powf(d / (d - 2.0));
                    (create_inv_freq(self.head_size, base), 1.0)
                } else {
                    (self.inv_freq.clone(), 1.0)
                }
            }
        };

        let half = self.head_size / 2;
        let mut cos = Vec::with_capacity(position_ids.len() * half);
        let mut sin = Vec::with_capacity(position_ids.len() * half);
        for &pos in position_ids {
            let t = pos as f64 * position_scale;
            for freq in &inv_freq {
                let angle = t * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        CosSin { cos, sin, half }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reference(x: &[f32], pos: usize, theta: f64) -> Vec<f32> {
        let d = x.len();
        let half = d / 2;
        let mut out = x.to_vec();
        for i in 0..half {
            let angle = pos as f64 / theta.powf((2 * i) as f64 / d as f64);
            let (s, c) = angle.sin_cos();
            let (a, b) = (x[i] as f64, x[i + half] as f64);
            out[i] = (a * c - b * s) as f32;
            out[i + half] = (b * c + a * s) as f32;
        }
        out
    }

    #[test]
    fn test_matches_closed_form() {
        let rope = RotaryEmbedding::with_params(8, 10000.0, None, 8192);
        let head: Vec<f32> = (0..8).map(|v| 0.25 * v as f32 - 1.0).collect();
        for pos in [0usize, 1, 127, 8191] {
            let cs = rope.get_cos_sin(&[pos], pos + 1);
            let mut q = head.clone();
            let mut k = head.clone();
            cs.apply(&mut q, &mut k);
            let expected = reference(&head, pos, 10000.0);
            for i in 0..8 {
                assert!((q[i] - expected[i]).abs() < 1e-5, "pos {pos} coord {i}");
                assert!((k[i] - expected[i]).abs() < 1e-5, "pos {pos} coord {i}");
            }
        }
    }

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::with_params(4, 10000.0, None, 8192);
        let cs = rope.get_cos_sin(&[0, 0], 1);
        let mut x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let before = x.clone();
        cs.rotate(&mut x);
        assert_eq!(x, before);
    }

    #[test]
    fn test_batch_matches_single_token() {
        // two tokens, two heads each
        let rope = RotaryEmbedding::with_params(4, 10000.0, None, 8192);
        let x: Vec<f32> = (0..16).map(|v| v as f32 * 0.1).collect();
        let mut batched = x.clone();
        rope.get_cos_sin(&[3, 9], 10).rotate(&mut batched);
        let mut first = x[..8].to_vec();
        let mut second = x[8..].to_vec();
        rope.get_cos_sin(&[3], 10).rotate(&mut first);
        rope.get_cos_sin(&[9], 10).rotate(&mut second);
        assert_eq!(&batched[..8], &first[..]);
        assert_eq!(&batched[8..], &second[..]);
    }

    #[test]
    fn test_linear_scaling_divides_positions() {
        let plain = RotaryEmbedding::with_params(8, 10000.0, None, 8192);
        let scaled = RotaryEmbedding::with_params(
            8,
            10000.0,
            Some(RopeScaling::Linear { factor: 2.0 }),
            8192,
        );
        assert_eq!(
            scaled.get_cos_sin(&[10], 11),
            plain.get_cos_sin(&[5], 11)
        );
    }

    #[test]
    fn test_dynamic_scaling_kicks_in_past_max_positions() {
        let plain = RotaryEmbedding::with_params(8, 10000.0, None, 16);
        let dynamic = RotaryEmbedding::with_params(
            8,
            10000.0,
            Some(RopeScaling::Dynamic { factor: 2.0 }),
            16,
        );
        assert_eq!(dynamic.get_cos_sin(&[7], 16), plain.get_cos_sin(&[7], 16));
        let long = dynamic.get_cos_sin(&[7], 64);
        assert_ne!(long, plain.get_cos_sin(&[7], 64));
        // larger base, slower rotation of the low frequencies
        assert!(long.cos[3] > plain.get_cos_sin(&[7], 64).cos[3]);
    }
}
