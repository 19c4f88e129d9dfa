use parking_lot::Mutex;
use rand::{
    distributions::{Alphanumeric, WeightedIndex},
    prelude::Distribution,
    rngs::StdRng,
    seq::SliceRandom,
    Rng, SeedableRng,
};
use std::{ops::Range, time::Duration};

/// Random payload source handed to scenario code.
///
/// Every virtual user owns one, seeded from the run seed and the VU id, so a run
/// with a fixed seed produces the same payload sequence per VU. Without a seed the
/// generator is seeded from the OS.
#[derive(Debug)]
pub struct DataGen {
    rng: Mutex<StdRng>,
}

impl DataGen {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Generator for virtual user `vu` of a run seeded with `seed`.
    pub fn for_vu(seed: Option<u64>, vu: u64) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(vu)),
            None => Self::from_entropy(),
        }
    }

    /// `len` random ASCII alphanumerics.
    pub fn alphanumeric(&self, len: usize) -> String {
        let mut rng = self.rng.lock();
        (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
    }

    /// Uniform integer in `range`. An empty range yields its start.
    pub fn range(&self, range: Range<u64>) -> u64 {
        if range.is_empty() {
            return range.start;
        }
        self.rng.lock().gen_range(range)
    }

    /// `true` with probability `p`.
    pub fn chance(&self, p: f64) -> bool {
        self.rng.lock().gen_bool(p.clamp(0.0, 1.0))
    }

    pub fn choose<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut *self.rng.lock())
    }

    /// Index drawn with probability proportional to `weights`. `None` when the
    /// weights are empty, all zero or invalid.
    pub fn weighted(&self, weights: &[f64]) -> Option<usize> {
        let dist = WeightedIndex::new(weights).ok()?;
        Some(dist.sample(&mut *self.rng.lock()))
    }

    /// Uniform duration between `min` and `max`, inclusive of `min`.
    pub fn duration(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span = (max - min).as_nanos().min(u64::MAX as u128) as u64;
        min + Duration::from_nanos(self.range(0..span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let a = DataGen::for_vu(Some(42), 3);
        let b = DataGen::for_vu(Some(42), 3);
        assert_eq!(a.alphanumeric(16), b.alphanumeric(16));
        assert_eq!(a.range(0..1000), b.range(0..1000));
    }

    #[test]
    fn vus_get_different_sequences() {
        let a = DataGen::for_vu(Some(42), 1);
        let b = DataGen::for_vu(Some(42), 2);
        assert_ne!(a.alphanumeric(32), b.alphanumeric(32));
    }

    #[test]
    fn alphanumeric_length_and_charset() {
        let s = DataGen::seeded(1).alphanumeric(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn weighted_respects_zero_weights() {
        let data = DataGen::seeded(7);
        for _ in 0..100 {
            assert_eq!(data.weighted(&[0.0, 1.0, 0.0]), Some(1));
        }
        assert_eq!(data.weighted(&[]), None);
        assert_eq!(data.weighted(&[0.0, 0.0]), None);
    }

    #[test]
    fn duration_stays_in_bounds() {
        let data = DataGen::seeded(9);
        let (min, max) = (Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..100 {
            let d = data.duration(min, max);
            assert!(d >= min && d < max);
        }
        assert_eq!(data.duration(max, min), max);
    }

    #[test]
    fn choose_from_empty_is_none() {
        let empty: [u8; 0] = [];
        assert_eq!(DataGen::seeded(0).choose(&empty), None);
    }
}
