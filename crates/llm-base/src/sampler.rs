use partial_sort::PartialSort;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::TokenId;

/// Turns the logits of a forward pass into token ids.
///
/// `logits` holds `shape[0]` values per position; samplers draw from the last
/// position. The returned vector holds the sampled ids in order (one, for
/// every sampler shipped here).
pub trait Sampler: Send {
    /// Samples token ids from `logits` of the given `shape`
    /// (`[n_vocab, n_tokens]`, fastest dimension first).
    fn sample(&mut self, logits: &[f32], shape: &[usize]) -> Vec<TokenId>;
}

fn last_position<'a>(logits: &'a [f32], shape: &[usize]) -> &'a [f32] {
    let n_vocab = shape[0];
    assert!(n_vocab > 0 && logits.len() >= n_vocab, "sampler needs at least one position");
    &logits[logits.len() - n_vocab..]
}

/// Always picks the highest logit. Deterministic; the sampler behind greedy
/// decoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample(&mut self, logits: &[f32], shape: &[usize]) -> Vec<TokenId> {
        let row = last_position(logits, shape);
        let mut best = 0usize;
        let mut best_value = f32::NEG_INFINITY;
        for (i, &v) in row.iter().enumerate() {
            if v > best_value {
                best = i;
                best_value = v;
            }
        }
        vec![best as TokenId]
    }
}

/// Top-k/top-p (nucleus) sampling: keep the `top_k` highest logits, convert
/// to probabilities, keep the smallest prefix whose mass reaches `top_p`,
/// renormalize and draw. Reproducible when seeded.
pub struct TopKTopPSampler {
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl TopKTopPSampler {
    /// Creates a sampler with entropy seeding.
    pub fn new(top_k: usize, top_p: f32) -> Self {
        Self::with_rng(top_k, top_p, StdRng::from_entropy())
    }

    /// Creates a sampler whose draws are a pure function of `seed`.
    pub fn with_seed(top_k: usize, top_p: f32, seed: u64) -> Self {
        Self::with_rng(top_k, top_p, StdRng::seed_from_u64(seed))
    }

    fn with_rng(top_k: usize, top_p: f32, rng: StdRng) -> Self {
        assert!(top_k >= 1, "top_k must be at least 1");
        assert!(top_p > 0.0 && top_p <= 1.0, "top_p must be in (0, 1]");
        TopKTopPSampler { top_k, top_p, rng }
    }
}

impl Sampler for TopKTopPSampler {
    fn sample(&mut self, logits: &[f32], shape: &[usize]) -> Vec<TokenId> {
        let row = last_position(logits, shape);
        let k = self.top_k.min(row.len());

        let mut logits_id: Vec<(f32, TokenId)> = row
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as TokenId))
            .collect();
        logits_id.partial_sort(k, |a, b| b.0.total_cmp(&a.0));
        logits_id.truncate(k);

        let maxl = logits_id[0].0;
        let mut probs: Vec<f32> = logits_id.iter().map(|(v, _)| (v - maxl).exp()).collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        if self.top_p < 1.0 {
            let mut cumsum = 0.0;
            for i in 0..probs.len() {
                cumsum += probs[i];
                if cumsum >= self.top_p {
                    probs.truncate(i + 1);
                    logits_id.truncate(i + 1);
                    break;
                }
            }
        }

        let dist = WeightedIndex::new(&probs).expect("top-k probabilities are positive");
        let idx = dist.sample(&mut self.rng);
        vec![logits_id[idx].1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_finds_the_peak() {
        let mut sampler = ArgmaxSampler;
        let logits = vec![0.1, 5.0, -2.0, 1.0];
        assert_eq!(sampler.sample(&logits, &[4, 1]), vec![1]);
    }

    #[test]
    fn argmax_uses_last_position_only() {
        let mut sampler = ArgmaxSampler;
        // Two positions; the peak of the first must not matter.
        let logits = vec![9.0, 0.0, 0.0, /* last: */ 0.0, 0.0, 3.0];
        assert_eq!(sampler.sample(&logits, &[3, 2]), vec![2]);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.37).sin()).collect();
        let a: Vec<_> = (0..10)
            .scan(TopKTopPSampler::with_seed(40, 0.95, 1234), |s, _| {
                Some(s.sample(&logits, &[50, 1]))
            })
            .collect();
        let b: Vec<_> = (0..10)
            .scan(TopKTopPSampler::with_seed(40, 0.95, 1234), |s, _| {
                Some(s.sample(&logits, &[50, 1]))
            })
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn top_k_one_degenerates_to_argmax() {
        let logits = vec![0.0, 2.0, 1.0];
        let mut sampler = TopKTopPSampler::with_seed(1, 1.0, 7);
        assert_eq!(sampler.sample(&logits, &[3, 1]), vec![1]);
    }

    #[test]
    fn tight_top_p_prunes_the_tail() {
        // One dominant logit: a tiny top_p keeps only it.
        let mut logits = vec![0.0f32; 20];
        logits[7] = 50.0;
        let mut sampler = TopKTopPSampler::with_seed(20, 0.5, 99);
        for _ in 0..20 {
            assert_eq!(sampler.sample(&logits, &[20, 1]), vec![7]);
        }
    }
}
