use rand::{rngs::StdRng, SeedableRng};

use rustic_shell::ops::{argmax, logits_to_prob, sample};

pub struct Sampler {
    temperature: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, seed: u64) -> Self {
        Self {
            temperature,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Picks the next token from one row of logits; the row is overwritten
    /// with probabilities when sampling with a temperature.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        if self.temperature == 0.0f32 {
            // greedy argmax sampling: take the token with the highest probability
            argmax(logits)
        } else {
            logits_to_prob(logits, self.temperature);
            sample(logits, &mut self.rng)
        }
    }
}

#[cfg(test)]
mod test {
    use crate::sampler::Sampler;

    #[test]
    fn test_sample_argmax() {
        let mut sampler = Sampler::new(0.0f32, 0);
        let mut input = [0.3, 0.8, 0.2];
        let next = sampler.sample(&mut input);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_sample_with_temperature_is_seeded() {
        let logits = [0.1f32, 2.0, 0.5, 1.5];
        let draw = |seed| {
            let mut sampler = Sampler::new(0.8, seed);
            (0..16)
                .map(|_| sampler.sample(&mut logits.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
        assert!(draw(7).iter().all(|&t| t < logits.len()));
    }

    #[test]
    fn test_peaked_logits_always_win() {
        let mut sampler = Sampler::new(1.0, 3);
        for _ in 0..8 {
            assert_eq!(sampler.sample(&mut [0.0, 0.0, 60.0]), 2);
        }
    }
}
