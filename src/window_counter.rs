use std::sync::Mutex;
use tokio::time::{Duration, Instant};

const NUM_BUCKETS: usize = 10;

/// Counts events over a sliding window of time.
///
/// The window is split into [NUM_BUCKETS] slices; counts expire one slice
/// at a time, so the sum may include events up to one slice older than
/// the window.
#[derive(Debug)]
pub struct WindowedCounter {
    bucket_width: Duration,
    buckets: Mutex<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    // When the bucket at `current` started accumulating.
    current_start: Instant,
    current: usize,
    counts: [usize; NUM_BUCKETS],
}

impl Buckets {
    fn advance(&mut self, width: Duration, now: Instant) {
        let elapsed = now.saturating_duration_since(self.current_start);
        let steps = elapsed.as_nanos() / width.as_nanos();
        if steps == 0 {
            return;
        }
        for _ in 0..std::cmp::min(steps, NUM_BUCKETS as u128) {
            self.current = (self.current + 1) % NUM_BUCKETS;
            self.counts[self.current] = 0;
        }
        // Bounded by the elapsed time, so this cannot overflow.
        self.current_start += width * u32::try_from(steps).unwrap_or(u32::MAX);
        if self.current_start > now {
            self.current_start = now;
        }
    }
}

impl WindowedCounter {
    pub fn new(window: Duration) -> Self {
        let bucket_width = std::cmp::max(window / NUM_BUCKETS as u32, Duration::from_millis(1));
        Self {
            bucket_width,
            buckets: Mutex::new(Buckets {
                current_start: Instant::now(),
                current: 0,
                counts: [0; NUM_BUCKETS],
            }),
        }
    }

    pub fn add(&self, amount: usize) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.advance(self.bucket_width, Instant::now());
        let current = buckets.current;
        buckets.counts[current] = buckets.counts[current].saturating_add(amount);
    }

    pub fn sum(&self) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.advance(self.bucket_width, Instant::now());
        buckets
            .counts
            .iter()
            .fold(0, |acc, count| acc.saturating_add(*count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn sum_without_sliding() {
        let ctr = WindowedCounter::new(Duration::from_secs(3));

        ctr.add(1);
        assert_eq!(1, ctr.sum());
        ctr.add(1);
        assert_eq!(2, ctr.sum());
        ctr.add(3);
        assert_eq!(5, ctr.sum());
    }

    #[tokio::test(start_paused = true)]
    async fn old_counts_expire() {
        let ctr = WindowedCounter::new(Duration::from_secs(1));

        ctr.add(1);
        time::advance(Duration::from_millis(500)).await;
        ctr.add(2);
        assert_eq!(3, ctr.sum());

        time::advance(Duration::from_millis(600)).await;
        assert_eq!(2, ctr.sum());

        time::advance(Duration::from_secs(1)).await;
        assert_eq!(0, ctr.sum());
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_clears_everything() {
        let ctr = WindowedCounter::new(Duration::from_secs(2));

        for _ in 0..5 {
            ctr.add(10);
            time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(50, ctr.sum());

        time::advance(Duration::from_secs(3600)).await;
        assert_eq!(0, ctr.sum());

        ctr.add(7);
        assert_eq!(7, ctr.sum());
    }
}
