//! Random sampling helpers and deterministic per-stream generators.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Draws `min(n_samples, pool_size)` distinct indices from `0..pool_size` by
/// rejecting repeats.
pub fn rejection_sample<R: Rng + ?Sized>(n_samples: usize, pool_size: usize, rng: &mut R) -> Vec<usize> {
    let target = n_samples.min(pool_size);
    let mut sample = Vec::with_capacity(target);
    while sample.len() < target {
        let candidate = rng.gen_range(0..pool_size);
        if !sample.contains(&candidate) {
            sample.push(candidate);
        }
    }
    sample
}

/// Like [`rejection_sample`], but `excluded` is never drawn. At most
/// `pool_size - 1` indices come back when `excluded` lies in the pool.
pub fn rejection_sample_excluding<R: Rng + ?Sized>(
    n_samples: usize,
    pool_size: usize,
    excluded: usize,
    rng: &mut R,
) -> Vec<usize> {
    if excluded >= pool_size {
        return rejection_sample(n_samples, pool_size, rng);
    }
    // Sample from a pool one smaller and shift everything at or past the gap.
    rejection_sample(n_samples, pool_size - 1, rng)
        .into_iter()
        .map(|j| if j >= excluded { j + 1 } else { j })
        .collect()
}

/// Independent generator for stream `stream` (a point or tree index) derived from
/// `base_seed`. The same pair always yields the same sequence.
pub fn stream_rng(base_seed: u64, stream: u64) -> StdRng {
    // splitmix64 finalizer over the combined seed
    let mut z = base_seed ^ stream.wrapping_add(1).wrapping_mul(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    StdRng::seed_from_u64(z ^ (z >> 31))
}
