use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Traffic statistics with all-time totals and a sliding 1 s rate.
#[derive(Debug, Clone)]
pub struct Counter {
    pub total_bytes: usize,
    pub frames: usize,
    /// When the counter was created or last reset.
    pub t_begin: Instant,

    window: Duration,
    recent: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_bytes: 0,
            frames: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            recent: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Average rate since `t_begin`, in MB/s.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_bytes as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the last window, in MB/s.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Records one frame of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();
        self.total_bytes += size;
        self.frames += 1;

        self.recent.push_back((now, size));
        self.bytes_in_window += size;
        while let Some(&(ts, sz)) = self.recent.front() {
            if now.duration_since(ts) > self.window {
                self.recent.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_bytes = 0;
        self.frames = 0;
        self.t_begin = Instant::now();
        self.recent.clear();
        self.bytes_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_frames_and_bytes() {
        let mut counter = Counter::new();
        counter.increment(512 * 1024);
        counter.increment(512 * 1024);
        assert_eq!(counter.frames, 2);
        assert_eq!(counter.total_bytes, 1024 * 1024);
        assert!((counter.rate() - 1.0).abs() < 1e-9);
        counter.reset();
        assert_eq!(counter.frames, 0);
        assert_eq!(counter.rate(), 0.0);
    }
}
