//! Shared helpers for scheduler tests: deterministic signals and bounded
//! polling instead of bare sleeps.

use std::time::{Duration, Instant};

use rand::Rng;

/// Deterministic ramp signal: sample `n` of the stream is `n / 1_000_000`,
/// continuing across blocks. Distinct values make ordering bugs visible.
pub fn ramp_block(block_index: usize, block_size: usize) -> Vec<f32> {
    (0..block_size)
        .map(|i| (block_index * block_size + i) as f32 / 1_000_000.0)
        .collect()
}

/// A block of uniform noise in [-1, 1).
pub fn random_block(block_size: usize, rng: &mut impl Rng) -> Vec<f32> {
    (0..block_size).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Poll `condition` every millisecond until it holds or `timeout` expires.
/// Returns whether the condition was met.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
