use rand::seq::SliceRandom;
use rand::Rng;

/// Randomized, repetition-free schedule of ordered stimulus pairs.
///
/// Each element encodes an ordered pair as `first * n + second`. The
/// sequence is a uniform permutation of `0..n²` with the self-pair
/// encodings removed: `i*n + i = i*(n+1)`, and the multiples of `n+1`
/// below `n²` are exactly those `n` values, so the length is always
/// `n² − n` and every remaining ordered pair appears exactly once
/// (both orderings of every unordered pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSequence {
    entries: Vec<u32>,
    stimulus_count: u32,
}

impl PairingSequence {
    pub fn schedule<R: Rng>(stimulus_count: u32, rng: &mut R) -> Self {
        let n = stimulus_count;
        let mut entries: Vec<u32> = (0..n * n).collect();
        entries.shuffle(rng);
        entries.retain(|&v| v % (n + 1) != 0);
        Self {
            entries,
            stimulus_count: n,
        }
    }

    /// Rebuild from persisted entries.
    pub fn from_entries(entries: Vec<u32>, stimulus_count: u32) -> Self {
        Self {
            entries,
            stimulus_count,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stimulus_count(&self) -> u32 {
        self.stimulus_count
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Ordered pair presented at 0-based trial position `index`.
    pub fn pair_at(&self, index: usize) -> Option<(u32, u32)> {
        self.entries
            .get(index)
            .map(|&k| decode(k, self.stimulus_count))
    }
}

/// `k = first * n + second` back to `(first, second)`.
pub fn decode(k: u32, n: u32) -> (u32, u32) {
    (k / n, k % n)
}

pub fn encode(first: u32, second: u32, n: u32) -> u32 {
    first * n + second
}

/// Maps indices scheduled over a reduced pilot pool onto the full stimulus
/// set, spreading them across its range: `i * (full-1)/(scheduled-1)`,
/// truncated. For 3 of 6 this selects variants 0, 2 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsetRemap {
    pub scheduled: u32,
    pub full: u32,
}

impl SubsetRemap {
    pub fn apply(&self, index: u32) -> u32 {
        debug_assert!(index < self.scheduled);
        if self.scheduled < 2 {
            return 0;
        }
        let scale = (self.full - 1) as f64 / (self.scheduled - 1) as f64;
        (index as f64 * scale).trunc() as u32
    }

    pub fn apply_pair(&self, pair: (u32, u32)) -> (u32, u32) {
        (self.apply(pair.0), self.apply(pair.1))
    }
}
