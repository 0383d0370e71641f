//! Next-token selection
//!
//! [`Sampler`] runs suppression, repetition penalty and temperature scaling
//! over the raw logits, then draws from either the top-k candidates or the
//! nucleus. The selection functions take the uniform random draw as an
//! argument so they are deterministic under test.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::processors::{
    LogitProcessor, LogitProcessorContext, RepetitionPenalty, TemperatureScaler, TokenSuppressor,
};
use crate::gguf::ops::{argmax, softmax};

/// Per-call sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    /// `<= 0` selects the arg-max
    pub temperature: f32,
    /// Nucleus threshold; values `>= 1` select top-k instead
    pub top_p: f32,
    /// Candidates kept by top-k
    pub top_k: usize,
    /// `> 1` penalizes recent tokens
    pub repetition_penalty: f32,
    /// Trailing tokens considered by the penalty
    pub repetition_window: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_p: 0.9,
            top_k: 50,
            repetition_penalty: 1.15,
            repetition_window: 64,
        }
    }
}

impl SamplingConfig {
    /// Deterministic arg-max selection
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }
}

fn by_value_desc(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// Walk `candidates` (probabilities in order) and return the index whose
/// cumulative mass first reaches `target`
fn inverse_cdf(candidates: &[(usize, f32)], target: f32) -> usize {
    let mut cdf = 0.0f32;
    for &(idx, prob) in candidates {
        cdf += prob;
        if target <= cdf {
            return idx;
        }
    }
    // rounding left the target past the total mass
    candidates
        .iter()
        .rev()
        .find(|&&(_, prob)| prob > 0.0)
        .or(candidates.last())
        .map_or(0, |&(idx, _)| idx)
}

/// Sample from the `k` highest logits
///
/// The kept logits are softmax-renormalized and `rng_value` in `[0, 1)`
/// selects by inverse CDF. `k` is clamped to `[1, logits.len()]`.
#[must_use]
pub fn sample_top_k(logits: &[f32], k: usize, rng_value: f32) -> usize {
    if logits.is_empty() {
        return 0;
    }
    let k = k.clamp(1, logits.len());
    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, by_value_desc);
        indexed.truncate(k);
    }
    indexed.sort_unstable_by(by_value_desc);

    let mut probs: Vec<f32> = indexed.iter().map(|&(_, v)| v).collect();
    softmax(&mut probs);
    for (entry, p) in indexed.iter_mut().zip(probs) {
        entry.1 = p;
    }
    inverse_cdf(&indexed, rng_value)
}

/// Nucleus sampling
///
/// Tokens are sorted by probability and accumulated until the mass reaches
/// `p`; the highest-probability token is always kept. The prefix is
/// renormalized and `rng_value` in `[0, 1)` selects by inverse CDF.
#[must_use]
pub fn sample_top_p(logits: &[f32], p: f32, rng_value: f32) -> usize {
    if logits.is_empty() {
        return 0;
    }
    let mut probs = logits.to_vec();
    softmax(&mut probs);
    let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    indexed.sort_unstable_by(by_value_desc);

    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, prob)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p {
            cutoff = i + 1;
            break;
        }
    }
    let nucleus = &indexed[..cutoff.max(1)];
    let mass: f32 = nucleus.iter().map(|&(_, prob)| prob).sum();
    inverse_cdf(nucleus, rng_value * mass)
}

/// Logit pipeline plus a seeded random source
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Seeded for reproducibility, or from OS entropy
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Transform `logits` in place and select the next token
    ///
    /// Order: suppression, repetition penalty over `recent`, temperature,
    /// then top-p when `top_p < 1` or top-k otherwise. A non-positive
    /// temperature returns the arg-max after penalties.
    pub fn sample(
        &mut self,
        logits: &mut [f32],
        config: &SamplingConfig,
        recent: &[u32],
        suppress: &[u32],
    ) -> u32 {
        let ctx = LogitProcessorContext::new(recent, 0);
        TokenSuppressor::new(suppress).process(logits, &ctx);
        RepetitionPenalty::new(config.repetition_penalty, config.repetition_window)
            .process(logits, &ctx);

        if config.temperature <= 0.0 {
            return argmax(logits) as u32;
        }
        TemperatureScaler::new(config.temperature).process(logits, &ctx);

        let r: f32 = self.rng.gen();
        let token = if config.top_p < 1.0 {
            sample_top_p(logits, config.top_p, r)
        } else {
            sample_top_k(logits, config.top_k, r)
        };
        token as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_one_is_argmax() {
        let logits = [0.1, 3.0, 2.9, -1.0];
        for r in [0.0, 0.5, 0.999] {
            assert_eq!(sample_top_k(&logits, 1, r), 1);
        }
    }

    #[test]
    fn test_top_k_restricts_candidates() {
        let logits = [5.0, 4.0, -10.0, -10.0, -10.0];
        for i in 0..100 {
            let r = i as f32 / 100.0;
            assert!(sample_top_k(&logits, 2, r) < 2);
        }
        // the lower half of the CDF belongs to the best token
        assert_eq!(sample_top_k(&logits, 2, 0.1), 0);
        assert_eq!(sample_top_k(&logits, 2, 0.99), 1);
    }

    #[test]
    fn test_top_k_larger_than_vocab() {
        assert!(sample_top_k(&[1.0, 2.0], 50, 0.5) < 2);
    }

    #[test]
    fn test_top_p_keeps_best_even_above_threshold() {
        // best token alone holds ~99.99% of the mass
        let logits = [0.0, 10.0, 0.0];
        for r in [0.0, 0.5, 0.9999] {
            assert_eq!(sample_top_p(&logits, 0.5, r), 1);
        }
        assert_eq!(sample_top_p(&logits, 0.0, 0.99), 1);
    }

    #[test]
    fn test_top_p_prefix() {
        // probabilities ≈ [0.64, 0.24, 0.09, 0.03]
        let logits = [3.0, 2.0, 1.0, 0.0];
        for i in 0..100 {
            let token = sample_top_p(&logits, 0.8, i as f32 / 100.0);
            assert!(token < 2, "token {token} outside nucleus");
        }
    }

    #[test]
    fn test_all_suppressed_still_returns_index() {
        let logits = [f32::NEG_INFINITY; 4];
        assert!(sample_top_k(&logits, 2, 0.3) < 4);
        assert!(sample_top_p(&logits, 0.9, 0.3) < 4);
    }

    #[test]
    fn test_sampler_greedy_honors_suppression_and_penalty() {
        let mut sampler = Sampler::new(Some(7));
        let config = SamplingConfig {
            repetition_penalty: 4.0,
            ..SamplingConfig::greedy()
        };
        let mut logits = vec![1.0, 3.0, 2.0, 2.5];
        // 1 suppressed, 3 penalized to 0.625, so 2 wins
        let token = sampler.sample(&mut logits, &config, &[3], &[1]);
        assert_eq!(token, 2);
        assert_eq!(logits[1], f32::NEG_INFINITY);
    }

    #[test]
    fn test_sampler_seed_reproducible() {
        let config = SamplingConfig {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 8,
            ..SamplingConfig::default()
        };
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32 * 0.3).collect();
        let draw = |seed| {
            let mut sampler = Sampler::new(Some(seed));
            (0..16)
                .map(|_| sampler.sample(&mut logits.clone(), &config, &[], &[]))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }
}
