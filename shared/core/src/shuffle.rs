use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::SeedableRng;
use serde::{Deserialize, Serialize};

/// Whether (and how) an ordering should be randomized.
///
/// Every rank that needs to agree on an ordering must hold the same seed;
/// derived sub-seeds keep per-epoch, per-bucket and wraparound shuffles
/// decorrelated while staying reproducible.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shuffle {
    #[default]
    DontShuffle,
    Seeded([u8; 32]),
}

impl Shuffle {
    pub fn seeded(seed: [u8; 32]) -> Self {
        Shuffle::Seeded(seed)
    }

    /// Expands a small integer seed into a full 32-byte seed.
    pub fn seeded_from_u64(seed: u64) -> Self {
        let mut full = [0u8; 32];
        for (i, chunk) in full.chunks_exact_mut(8).enumerate() {
            chunk.copy_from_slice(&seed.wrapping_add(i as u64).to_le_bytes());
        }
        Shuffle::Seeded(full)
    }

    pub fn is_seeded(&self) -> bool {
        matches!(self, Shuffle::Seeded(_))
    }

    /// Derives a sub-seed by folding `salt` into the base seed.
    /// `DontShuffle` stays `DontShuffle`.
    pub fn derive(&self, salt: u64) -> Self {
        match self {
            Shuffle::DontShuffle => Shuffle::DontShuffle,
            Shuffle::Seeded(seed) => {
                let mut derived = *seed;
                // splitmix64-style diffusion so consecutive salts don't
                // produce correlated streams
                let mut z = salt.wrapping_add(0x9e37_79b9_7f4a_7c15);
                z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
                z ^= z >> 31;
                for (i, b) in z.to_le_bytes().iter().enumerate() {
                    derived[i] ^= b;
                    derived[i + 8] ^= b.rotate_left(3);
                }
                Shuffle::Seeded(derived)
            }
        }
    }

    pub fn rng(&self) -> Option<ChaCha8Rng> {
        match self {
            Shuffle::DontShuffle => None,
            Shuffle::Seeded(seed) => Some(ChaCha8Rng::from_seed(*seed)),
        }
    }
}

/// Shuffles `items` in place. All callers holding the same seed observe the
/// same permutation; `DontShuffle` leaves the slice untouched.
pub fn deterministic_shuffle<T>(items: &mut [T], shuffle: Shuffle) {
    if let Some(mut rng) = shuffle.rng() {
        items.shuffle(&mut rng);
    }
}
