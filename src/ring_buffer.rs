//! Fixed-size circular measurement buffer.
//!
//! The buffer allocates `capacity + 1` slots and only wraps once the write
//! cursor *exceeds* `capacity`, so the cursor visits every value in
//! `[0, capacity]` and the ring holds the last `capacity + 1` samples. Plots
//! are drawn over all of those slots.
//!
//! The validity count, on the other hand, saturates at `capacity`, and the
//! mean is taken over slots `[0, valid_count)`. Once the ring has wrapped the
//! mean therefore covers the first `capacity` physical slots, whatever their
//! age, and never includes the last slot. Readouts depend on both boundaries,
//! so they are kept exactly as observed on the measurement boards.

/// Circular buffer of samples with a saturating validity count.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    fill: T,
    index: usize,
    valid_count: usize,
    pushes: u64,
}

impl<T: Copy> RingBuffer<T> {
    /// Allocate `capacity + 1` slots, all set to `fill`.
    pub fn new(capacity: usize, fill: T) -> Self {
        Self {
            slots: vec![fill; capacity + 1],
            capacity,
            fill,
            index: 0,
            valid_count: 0,
            pushes: 0,
        }
    }

    /// Write `value` at the cursor and advance it, wrapping after slot `capacity`.
    pub fn push(&mut self, value: T) {
        self.slots[self.index] = value;
        self.index += 1;
        if self.index > self.capacity {
            self.index = 0;
        }
        self.pushes += 1;
    }

    /// Count one more slot as initialized for averaging, saturating at `capacity`.
    pub fn record_valid(&mut self) {
        self.valid_count = (self.valid_count + 1).min(self.capacity);
    }

    /// Back to the freshly allocated state.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = self.fill);
        self.index = 0;
        self.valid_count = 0;
        self.pushes = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current write cursor, always in `[0, capacity]`.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn valid_count(&self) -> usize {
        self.valid_count
    }

    pub fn fill_value(&self) -> T {
        self.fill
    }

    /// All `capacity + 1` slots in physical order.
    pub fn as_slice(&self) -> &[T] {
        &self.slots
    }

    /// Most recently pushed value, or `None` if nothing was pushed since init.
    pub fn latest(&self) -> Option<T> {
        if self.pushes == 0 {
            return None;
        }
        let last = if self.index == 0 {
            self.capacity
        } else {
            self.index - 1
        };
        Some(self.slots[last])
    }
}

impl<T: Copy + Into<f64>> RingBuffer<T> {
    /// Arithmetic mean over slots `[0, valid_count)`; `NaN` when no slot is valid.
    pub fn mean(&self) -> f64 {
        if self.valid_count == 0 {
            return f64::NAN;
        }
        let sum: f64 = self.slots[..self.valid_count]
            .iter()
            .map(|&v| v.into())
            .sum();
        sum / self.valid_count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_has_capacity_plus_one_filled_slots() {
        let buf = RingBuffer::new(100, 4.0_f64);
        assert_eq!(buf.as_slice().len(), 101);
        assert!(buf.as_slice().iter().all(|&v| v == 4.0));
        assert_eq!(buf.index(), 0);
        assert_eq!(buf.valid_count(), 0);
        assert_eq!(buf.latest(), None);
    }

    #[test]
    fn cursor_reaches_capacity_before_wrapping() {
        let mut buf = RingBuffer::new(3, 0.0_f64);
        let mut seen = Vec::new();
        for i in 0..9 {
            seen.push(buf.index());
            buf.push(i as f64);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
        assert_eq!(buf.index(), 1);
    }

    #[test]
    fn holds_last_capacity_plus_one_values_in_ring_order() {
        let mut buf = RingBuffer::new(4, -1.0_f64);
        for i in 0..13 {
            buf.push(i as f64);
        }
        // 13 pushes into 5 slots: slot k holds the last value v with v % 5 == k.
        assert_eq!(buf.as_slice(), &[10.0, 11.0, 12.0, 8.0, 9.0]);
        assert_eq!(buf.latest(), Some(12.0));
    }

    #[test]
    fn latest_wraps_to_last_slot() {
        let mut buf = RingBuffer::new(2, 0.0_f64);
        buf.push(1.0);
        buf.push(2.0);
        buf.push(3.0);
        assert_eq!(buf.index(), 0);
        assert_eq!(buf.latest(), Some(3.0));
    }

    #[test]
    fn mean_of_first_valid_samples() {
        let mut buf = RingBuffer::new(100, 4.0_f64);
        buf.push(4.0);
        buf.record_valid();
        buf.push(4.2);
        buf.record_valid();
        assert_eq!(buf.valid_count(), 2);
        assert!((buf.mean() - 4.1).abs() < 1e-12);
    }

    #[test]
    fn mean_is_nan_without_valid_samples() {
        let mut buf = RingBuffer::new(10, 1.0_f64);
        buf.push(5.0);
        assert!(buf.mean().is_nan());
    }

    #[test]
    fn valid_count_saturates_at_capacity() {
        let mut buf = RingBuffer::new(5, 0.0_f64);
        for _ in 0..50 {
            buf.record_valid();
        }
        assert_eq!(buf.valid_count(), 5);
    }

    #[test]
    fn mean_after_wrap_covers_leading_slots_only() {
        let mut buf = RingBuffer::new(2, 0.0_f64);
        for v in [1.0, 2.0, 3.0, 10.0] {
            buf.push(v);
            buf.record_valid();
        }
        // slots = [10, 2, 3], valid_count = 2 -> mean of slots 0 and 1.
        assert_eq!(buf.as_slice(), &[10.0, 2.0, 3.0]);
        assert_eq!(buf.valid_count(), 2);
        assert!((buf.mean() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn mean_accepts_narrow_sample_types() {
        let mut buf = RingBuffer::new(4, 0_i16);
        for v in [1_i16, 2, 3] {
            buf.push(v);
            buf.record_valid();
        }
        assert!((buf.mean() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn reset_restores_init_state() {
        let mut buf = RingBuffer::new(3, 0.9_f64);
        for v in [1.0, 2.0, 3.0] {
            buf.push(v);
            buf.record_valid();
        }
        buf.reset();
        assert_eq!(buf, RingBuffer::new(3, 0.9));
    }
}
