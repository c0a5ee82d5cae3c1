use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

/// Random number generator with an optional fixed seed.
///
/// Seeded instances make record nonces, session ids, cookies and backoff
/// jitter reproducible, which the integration tests rely on. Ephemeral
/// curve keys do not come from here; they always use OS randomness.
pub(crate) struct SeededRng {
    inner: Option<StdRng>,
}

impl SeededRng {
    pub fn new(seed: Option<u64>) -> Self {
        let inner = seed.map(StdRng::seed_from_u64);
        Self { inner }
    }

    pub fn random<T>(&mut self) -> T
    where
        Standard: Distribution<T>,
    {
        match self.inner.as_mut() {
            Some(rng) => rng.gen(),
            None => rand::random(),
        }
    }
}

impl fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededRng")
            .field("seeded", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut rng1 = SeededRng::new(Some(12345));
        let mut rng2 = SeededRng::new(Some(12345));

        let a: [u8; 16] = rng1.random();
        let b: [u8; 16] = rng2.random();

        assert_eq!(a, b);
    }

    #[test]
    fn different_seed_different_stream() {
        let mut rng1 = SeededRng::new(Some(12345));
        let mut rng2 = SeededRng::new(Some(54321));

        let a: u64 = rng1.random();
        let b: u64 = rng2.random();

        assert_ne!(a, b);
    }
}
