use std::time::Duration;

use crate::SeededRng;

// Total jitter span in seconds, centered on zero.
const JITTER_RANGE: f32 = 0.5;

/// Retransmission timeout schedule for one flight.
///
/// The timeout starts at `start_rto`, doubles on every attempt and carries
/// a random jitter so two peers restarting together do not stay in lock
/// step. `can_retry` turns false once the retry budget is spent; the
/// caller then surfaces a timeout instead of resending.
pub(crate) struct ExponentialBackoff {
    start_rto: Duration,
    retries: usize,
    rto: Duration,
    jitter: f32,
    remaining: usize,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, retries: usize, rng: &mut SeededRng) -> Self {
        Self {
            start_rto,
            retries,
            rto: start_rto,
            jitter: Self::jitter(rng),
            remaining: retries,
        }
    }

    /// Back to the initial timeout with a full retry budget.
    pub fn reset(&mut self, rng: &mut SeededRng) {
        self.rto = self.start_rto;
        self.jitter = Self::jitter(rng);
        self.remaining = self.retries;
    }

    /// Current retransmission timeout including jitter.
    pub fn rto(&self) -> Duration {
        if self.jitter < 0.0 {
            self.rto.saturating_sub(Duration::from_secs_f32(-self.jitter))
        } else {
            self.rto + Duration::from_secs_f32(self.jitter)
        }
        .max(Duration::from_millis(50))
    }

    // A value between -0.25s and 0.25s.
    fn jitter(rng: &mut SeededRng) -> f32 {
        rng.random::<f32>() * JITTER_RANGE - (JITTER_RANGE / 2.0)
    }

    /// Consume one retry: double the timeout and redraw jitter.
    pub fn attempt(&mut self, rng: &mut SeededRng) {
        let Some(n) = self.remaining.checked_sub(1) else {
            return;
        };

        self.remaining = n;
        self.jitter = Self::jitter(rng);
        self.rto *= 2;
    }

    pub fn can_retry(&self) -> bool {
        self.remaining > 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubles_until_budget_spent() {
        let mut rng = SeededRng::new(Some(42));
        let mut exp = ExponentialBackoff::new(Duration::from_secs(1), 4, &mut rng);

        let mut previous = exp.rto();
        for _ in 0..3 {
            exp.attempt(&mut rng);
            let next = exp.rto();
            // Doubling dominates the +-0.25s jitter for a 1s start RTO.
            assert!(next > previous);
            previous = next;
            assert!(exp.can_retry());
        }

        exp.attempt(&mut rng);
        assert!(!exp.can_retry());

        // Further attempts are inert.
        let settled = exp.rto();
        exp.attempt(&mut rng);
        assert_eq!(exp.rto(), settled);
        assert!(!exp.can_retry());
    }

    #[test]
    fn reset_restores_budget_and_rto() {
        let mut rng = SeededRng::new(Some(7));
        let mut exp = ExponentialBackoff::new(Duration::from_secs(1), 2, &mut rng);

        exp.attempt(&mut rng);
        exp.attempt(&mut rng);
        assert!(!exp.can_retry());

        exp.reset(&mut rng);
        assert!(exp.can_retry());
        // Within jitter of the 1s start value.
        assert!(exp.rto() <= Duration::from_millis(1250));
        assert!(exp.rto() >= Duration::from_millis(750));
    }
}
