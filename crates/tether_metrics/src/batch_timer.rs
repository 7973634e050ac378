//! Drain batch timing

use super::ring_buffer::RingBuffer;
use std::time::Duration;

/// Rolling statistics over the batches a dispatcher loop drains.
pub struct BatchTimer {
    drain_times: RingBuffer<Duration>,
    batch_lens: RingBuffer<f64>,
}

impl BatchTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            drain_times: RingBuffer::new(capacity),
            batch_lens: RingBuffer::new(capacity),
        }
    }

    /// Record a batch whose duration was measured elsewhere.
    pub fn record(&mut self, elapsed: Duration, items: usize) {
        self.drain_times.push(elapsed);
        self.batch_lens.push(items as f64);
    }

    pub fn average_batch_len(&self) -> f64 {
        self.batch_lens.average()
    }

    pub fn average_drain_ms(&self) -> f64 {
        self.drain_times.average().as_secs_f64() * 1000.0
    }

    pub fn drain_range_ms(&self) -> (f64, f64) {
        let (min, max) = self.drain_times.min_max();
        (min.as_secs_f64() * 1000.0, max.as_secs_f64() * 1000.0)
    }
}
