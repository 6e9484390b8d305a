/// Blocks kept for averaging
const TRACKED_BLOCKS: usize = 100;

/// Confirmed transactions per block over the last 100 blocks
#[derive(Debug)]
pub struct ThroughputTracker {
    counts: Vec<u64>,
    blocks: Vec<u64>,
    head: usize,
    len: usize,
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self {
            counts: vec![0; TRACKED_BLOCKS],
            blocks: vec![0; TRACKED_BLOCKS],
            head: 0,
            len: 0,
        }
    }
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_back(&self, offset: usize) -> usize {
        (self.head + TRACKED_BLOCKS - 1 - offset) % TRACKED_BLOCKS
    }

    /// Adds `count` confirmations for `block`, merging with an existing entry
    pub fn record(&mut self, block: u64, count: u64) {
        for offset in 0..self.len {
            let slot = self.slot_back(offset);
            if self.blocks[slot] == block {
                self.counts[slot] += count;
                return;
            }
        }
        self.counts[self.head] = count;
        self.blocks[self.head] = block;
        self.head = (self.head + 1) % TRACKED_BLOCKS;
        self.len = (self.len + 1).min(TRACKED_BLOCKS);
    }

    /// Average confirmations per block over the `window` blocks ending at `current`.
    /// Blocks without a record count as zero.
    pub fn average(&self, window: u64, current: u64) -> f64 {
        if window == 0 || current == 0 || self.len == 0 {
            return 0.0;
        }
        let window = window.min(self.len as u64);
        let lowest = current.saturating_sub(window);
        let total: u64 = (0..window as usize)
            .map(|offset| self.slot_back(offset))
            .filter(|slot| self.blocks[*slot] > lowest && self.blocks[*slot] <= current)
            .map(|slot| self.counts[slot])
            .sum();
        total as f64 / window as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages() {
        let mut tracker = ThroughputTracker::new();
        assert_eq!(tracker.average(5, 10), 0.0);

        for block in 1..=10 {
            tracker.record(block, block);
        }
        tracker.record(10, 5);
        // blocks 6..=10 hold 6 + 7 + 8 + 9 + 15
        assert_eq!(tracker.average(5, 10), 9.0);
        assert_eq!(tracker.average(20, 10), 6.0);
    }

    #[test]
    fn test_ring_wraps() {
        let mut tracker = ThroughputTracker::new();
        for block in 1..=250 {
            tracker.record(block, 2);
        }
        assert_eq!(tracker.average(60, 250), 2.0);
        assert_eq!(tracker.average(500, 250), 2.0);
    }
}
