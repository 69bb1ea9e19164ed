//! Randomness source for secrets
//!
//! Verification codes come from an injected [`RandomSource`] so tests can pin
//! them with [`SeededRandom`].

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub trait RandomSource: Send + Sync {
    /// Lowercase ASCII string of length `n`
    fn random_string(&self, n: usize) -> String;
}

/// Thread-local OS-seeded generator
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn random_string(&self, n: usize) -> String {
        sample(&mut rand::thread_rng(), n)
    }
}

/// Deterministic generator for tests
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn random_string(&self, n: usize) -> String {
        match self.rng.lock() {
            Ok(mut rng) => sample(&mut *rng, n),
            Err(poisoned) => sample(&mut *poisoned.into_inner(), n),
        }
    }
}

fn sample<R: Rng + ?Sized>(rng: &mut R, n: usize) -> String {
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
