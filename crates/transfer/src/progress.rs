use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 128;

/// Throughput over a sliding time window.
///
/// Each sample is a number of bytes acknowledged at an instant. Samples
/// older than the window, or beyond the sample cap, are dropped.
pub struct SpeedCalculator {
    window: Duration,
    max_samples: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedCalculator {
    /// `window` defaults to 5 s, `max_samples` to 128.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        let max_samples = max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2);
        Self {
            window: window.unwrap_or(DEFAULT_WINDOW),
            max_samples,
            samples: Mutex::new(VecDeque::with_capacity(max_samples)),
        }
    }

    pub fn add_sample(&self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&self, bytes: u64, now: Instant) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back((now, bytes));
        while samples
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.window)
        {
            samples.pop_front();
        }
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples; `0.0` until two
    /// samples at distinct instants exist.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some((first, _)), Some((last, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = last.saturating_duration_since(*first);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The oldest sample opens the window; its bytes predate it.
        let bytes: u64 = samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Forgets all samples, e.g. when a paused upload starts again.
    pub fn reset(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}
