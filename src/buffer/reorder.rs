//! Sequence reordering for datagram links
//!
//! UDP delivers payloads in any order, duplicated or not at all. The
//! receiver files each payload under its sequence number and releases them
//! strictly in order, skipping a missing sequence once enough later
//! payloads have piled up behind it.

use crate::error::BufferError;

/// Result of filing one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored for in-order release
    Accepted,
    /// Older than the next expected sequence; dropped
    Late,
    /// Same sequence already held; dropped
    Duplicate,
    /// Jumped past the whole window; buffered payloads were discarded and
    /// the window restarted at this sequence
    Resynced,
}

/// Reorder window keyed by sequence number
pub struct ReorderBuffer<T> {
    /// Slots indexed by sequence modulo capacity
    slots: Vec<Option<(u32, T)>>,
    /// Capacity (power of two)
    capacity: usize,
    mask: usize,
    /// Next sequence to release
    next_sequence: u32,
    /// Payloads held before a gap is given up on
    max_pending: usize,
    pending: usize,
    stats: ReorderStats,
}

impl<T> ReorderBuffer<T> {
    /// Create a window of `capacity` slots; `capacity` must be a power of two
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(BufferError::InvalidWindow(capacity));
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Ok(Self {
            slots,
            capacity,
            mask: capacity - 1,
            next_sequence: 0,
            max_pending: capacity / 2,
            pending: 0,
            stats: ReorderStats::default(),
        })
    }

    /// File a payload under its sequence number
    pub fn insert(&mut self, sequence: u32, item: T) -> InsertOutcome {
        let ahead = sequence.wrapping_sub(self.next_sequence);

        if ahead > u32::MAX / 2 {
            self.stats.late += 1;
            return InsertOutcome::Late;
        }

        let mut outcome = InsertOutcome::Accepted;
        if ahead as usize >= self.capacity {
            self.stats.lost += ahead as u64;
            self.clear_slots();
            self.next_sequence = sequence;
            outcome = InsertOutcome::Resynced;
        }

        let index = (sequence as usize) & self.mask;
        if let Some((held, _)) = &self.slots[index] {
            if *held == sequence {
                self.stats.duplicates += 1;
                return InsertOutcome::Duplicate;
            }
        }

        // two sequences inside the window never share a slot
        self.slots[index] = Some((sequence, item));
        self.pending += 1;
        self.stats.received += 1;
        outcome
    }

    /// Release the next payload in sequence order, if it can be released
    pub fn pop_ready(&mut self) -> Option<T> {
        loop {
            let index = (self.next_sequence as usize) & self.mask;
            if let Some((_, item)) = self.slots[index].take() {
                self.pending -= 1;
                self.next_sequence = self.next_sequence.wrapping_add(1);
                return Some(item);
            }

            if self.pending == 0 || self.pending < self.max_pending {
                return None;
            }

            // too much is waiting behind this gap
            self.stats.lost += 1;
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
    }

    /// Give up on the current gap and release the next payload held
    /// behind it
    pub fn skip_gap(&mut self) -> Option<T> {
        if self.pending == 0 {
            return None;
        }
        loop {
            let index = (self.next_sequence as usize) & self.mask;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if let Some((_, item)) = self.slots[index].take() {
                self.pending -= 1;
                return Some(item);
            }
            self.stats.lost += 1;
        }
    }

    /// Forget everything and expect sequence 0 next
    pub fn reset(&mut self) {
        self.set_next_sequence(0);
    }

    /// Forget everything and expect `sequence` next
    pub fn set_next_sequence(&mut self, sequence: u32) {
        self.clear_slots();
        self.next_sequence = sequence;
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Payloads waiting for release
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    fn clear_slots(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.pending = 0;
    }
}

/// Reorder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicates: u64,
}

impl ReorderStats {
    /// Share of sequences given up on, out of all expected so far
    pub fn loss_rate(&self) -> f32 {
        if self.received == 0 {
            0.0
        } else {
            self.lost as f32 / (self.received + self.lost) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buffer: &mut ReorderBuffer<u32>) -> Vec<u32> {
        std::iter::from_fn(|| buffer.pop_ready()).collect()
    }

    #[test]
    fn test_window_must_be_power_of_two() {
        assert!(ReorderBuffer::<u8>::new(12).is_err());
        assert!(ReorderBuffer::<u8>::new(1).is_err());
        assert!(ReorderBuffer::<u8>::new(16).is_ok());
    }

    #[test]
    fn test_out_of_order_delivery_is_resequenced() {
        let mut buffer = ReorderBuffer::new(16).unwrap();

        assert_eq!(buffer.insert(2, 2), InsertOutcome::Accepted);
        assert_eq!(buffer.pop_ready(), None);
        assert_eq!(buffer.insert(0, 0), InsertOutcome::Accepted);
        assert_eq!(buffer.insert(1, 1), InsertOutcome::Accepted);

        assert_eq!(drain(&mut buffer), vec![0, 1, 2]);
        assert_eq!(buffer.next_sequence(), 3);
    }

    #[test]
    fn test_duplicates_and_stale_packets_dropped() {
        let mut buffer = ReorderBuffer::new(16).unwrap();

        buffer.insert(1, 1);
        assert_eq!(buffer.insert(1, 1), InsertOutcome::Duplicate);
        buffer.insert(0, 0);
        assert_eq!(drain(&mut buffer), vec![0, 1]);

        assert_eq!(buffer.insert(0, 0), InsertOutcome::Late);

        let stats = buffer.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.late, 1);
    }

    #[test]
    fn test_gap_is_skipped_once_backlog_builds() {
        let mut buffer = ReorderBuffer::new(16).unwrap();

        buffer.insert(0, 0);
        for seq in 2..=8 {
            buffer.insert(seq, seq);
        }
        // seven payloads behind the gap, limit is eight
        assert_eq!(drain(&mut buffer), vec![0]);

        buffer.insert(9, 9);
        assert_eq!(drain(&mut buffer), (2..=9).collect::<Vec<_>>());
        assert_eq!(buffer.stats().lost, 1);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_skip_gap_releases_next_held() {
        let mut buffer = ReorderBuffer::new(16).unwrap();
        assert_eq!(buffer.skip_gap(), None);

        buffer.insert(3, 3);
        buffer.insert(4, 4);
        assert_eq!(buffer.pop_ready(), None);

        assert_eq!(buffer.skip_gap(), Some(3));
        assert_eq!(buffer.stats().lost, 3);
        assert_eq!(drain(&mut buffer), vec![4]);
    }

    #[test]
    fn test_loss_rate_counts_skipped_sequences() {
        let mut buffer = ReorderBuffer::new(16).unwrap();
        assert_eq!(buffer.stats().loss_rate(), 0.0);

        buffer.insert(0, 0);
        buffer.insert(2, 2);
        buffer.insert(3, 3);
        drain(&mut buffer);
        assert_eq!(buffer.skip_gap(), Some(2));
        drain(&mut buffer);

        // three received, one given up on
        assert!((buffer.stats().loss_rate() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_jump_past_window_resyncs() {
        let mut buffer = ReorderBuffer::new(8).unwrap();

        buffer.insert(1, 1);
        assert_eq!(buffer.insert(100, 100), InsertOutcome::Resynced);
        assert_eq!(buffer.next_sequence(), 100);
        assert_eq!(drain(&mut buffer), vec![100]);
    }

    #[test]
    fn test_sequence_wraps_around() {
        let mut buffer = ReorderBuffer::new(8).unwrap();
        buffer.set_next_sequence(u32::MAX - 1);

        buffer.insert(0, 0);
        buffer.insert(u32::MAX, u32::MAX);
        buffer.insert(u32::MAX - 1, u32::MAX - 1);

        assert_eq!(drain(&mut buffer), vec![u32::MAX - 1, u32::MAX, 0]);
    }
}
