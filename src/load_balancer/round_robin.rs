//! Weighted round-robin selection.
//!
//! An entry with weight `w > 0` is served `w` times in a row before the
//! cursor moves on. Weight 0 means down and is skipped, unless more than two
//! full passes found nothing up; then the down entry under the cursor is
//! served so callers get an answer (and a 502) instead of waiting forever.

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: usize,
    served: u32,
    skipped: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next entry to serve, or `None` for an empty pool.
    pub fn next(&mut self, weights: &[u32]) -> Option<usize> {
        let len = weights.len();
        if len == 0 {
            return None;
        }
        if self.cursor >= len {
            self.cursor = 0;
            self.served = 0;
        }

        loop {
            let index = self.cursor;
            let weight = weights[index];
            if weight > 0 || self.skipped > 2 * len {
                self.skipped = 0;
                self.served += 1;
                if self.served >= weight.max(1) {
                    self.advance(len);
                }
                return Some(index);
            }
            self.skipped += 1;
            self.advance(len);
        }
    }

    fn advance(&mut self, len: usize) {
        self.cursor = (self.cursor + 1) % len;
        self.served = 0;
    }
}
