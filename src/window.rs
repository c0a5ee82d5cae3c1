use crate::error::RecordFault;

/// Sliding anti-replay window for one epoch.
///
/// Tracks the highest accepted sequence number and a 64-bit bitmap of the
/// sequence numbers at and below it. `check` is pure and runs before
/// decryption so too-old and duplicate records are dropped cheaply;
/// `update` runs only after the record's authentication tag verified, so a
/// forged sequence number can never advance or poison the window.
///
/// Each read epoch owns its own window; sequence numbers restart at zero on
/// an epoch change.
#[derive(Debug, Default)]
pub(crate) struct ReplayWindow {
    high_water: u64,
    seen: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Judge a sequence number without mutating the window.
    pub fn check(&self, seqno: u64) -> Result<(), RecordFault> {
        if seqno > self.high_water {
            return Ok(());
        }

        let offset = self.high_water - seqno;
        if offset >= 64 {
            return Err(RecordFault::TooOld);
        }
        if self.seen & (1u64 << offset) != 0 {
            return Err(RecordFault::Replayed);
        }

        Ok(())
    }

    /// Record an accepted sequence number.
    pub fn update(&mut self, seqno: u64) {
        if seqno > self.high_water {
            let delta = seqno - self.high_water;
            let shift = delta.min(63);
            self.seen <<= shift;
            self.seen |= 1;
            self.high_water = seqno;
        } else {
            let offset = self.high_water - seqno;
            if offset < 64 {
                self.seen |= 1u64 << offset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(w: &mut ReplayWindow, seqno: u64) -> bool {
        let fresh = w.check(seqno).is_ok();
        if fresh {
            w.update(seqno);
        }
        fresh
    }

    #[test]
    fn accepts_fresh_and_rejects_duplicate() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 1));
        assert_eq!(w.check(1), Err(RecordFault::Replayed));
        assert!(accept(&mut w, 2));
    }

    #[test]
    fn accepts_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 10));
        assert!(accept(&mut w, 8));
        assert_eq!(w.check(8), Err(RecordFault::Replayed));
        assert!(accept(&mut w, 9));
    }

    #[test]
    fn rejects_below_window() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 100));
        // offset 64: below high_water - 63, always too old
        assert_eq!(w.check(36), Err(RecordFault::TooOld));
        // offset 63: the oldest slot still inside the window
        assert!(accept(&mut w, 37));
    }

    #[test]
    fn duplicate_rejected_after_window_advance() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 10));
        assert!(accept(&mut w, 70));
        // 10 moved to bit 60 by the shift and is still marked seen.
        assert_eq!(w.check(10), Err(RecordFault::Replayed));
    }

    #[test]
    fn large_jump_caps_shift() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 1));
        assert!(accept(&mut w, 80));
        assert!(accept(&mut w, 79));
        assert_eq!(w.check(15), Err(RecordFault::TooOld));
    }

    #[test]
    fn check_alone_never_mutates() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 5));
        // A checked-but-unverified record must not occupy a slot.
        assert!(w.check(7).is_ok());
        assert!(w.check(7).is_ok());
        w.update(7);
        assert_eq!(w.check(7), Err(RecordFault::Replayed));
    }
}
