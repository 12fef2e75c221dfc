//! Rate limiting for the chunk loops.

use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Granularity of the sleep-based limiter.
pub const RATE_CONTROL_RESOLUTION: Duration = Duration::from_millis(100);

/// Smallest chunk the limiter will shrink to.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Chunk size for a loop limited to `rate` bytes/s.
///
/// Halves `base` while one chunk would take longer than the control
/// resolution to drain, never going below [`MIN_CHUNK_SIZE`].
pub fn effective_chunk_size(base: usize, rate: u64) -> usize {
    let mut chunk = base.max(1);
    if rate == 0 {
        return chunk;
    }
    let resolution_ms = RATE_CONTROL_RESOLUTION.as_millis() as u64;
    while chunk > MIN_CHUNK_SIZE {
        let chunk_ms = 1000 * chunk as u64 / rate;
        if chunk_ms <= resolution_ms {
            break;
        }
        chunk = (chunk >> 1).max(MIN_CHUNK_SIZE);
    }
    chunk
}

/// Sleep-based limiter for one transfer loop.
///
/// Counts bytes since the window started and sleeps until the wall clock
/// catches up with `bytes / rate`. When the loop falls behind by more
/// than the resolution (a slow disk, a stalled server) the window restarts
/// so the limiter does not let a burst through afterwards.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    window_bytes: u64,
    window_start: Instant,
}

impl RateLimiter {
    /// `rate` in bytes per second; 0 disables limiting.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            window_bytes: 0,
            window_start: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.rate > 0
    }

    /// Account for `bytes` just moved, sleeping if ahead of schedule.
    pub async fn consume(&mut self, bytes: usize) {
        if self.rate == 0 {
            return;
        }
        self.window_bytes += bytes as u64;
        let should_take = Duration::from_micros(
            (u128::from(self.window_bytes) * 1_000_000 / u128::from(self.rate)) as u64,
        );
        let elapsed = self.window_start.elapsed();
        if should_take > elapsed {
            sleep(should_take - elapsed).await;
        } else if elapsed > should_take + RATE_CONTROL_RESOLUTION {
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }

    /// Start a fresh window (after a resume).
    pub fn reset(&mut self) {
        self.window_bytes = 0;
        self.window_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_without_limit() {
        assert_eq!(effective_chunk_size(65_536, 0), 65_536);
        assert_eq!(effective_chunk_size(100, 0), 100);
    }

    #[test]
    fn test_chunk_size_shrinks_to_resolution() {
        // 64 KiB at 100 KB/s takes 655 ms; halved until <= 100 ms
        let chunk = effective_chunk_size(65_536, 100_000);
        assert_eq!(chunk, 8_192);
        assert!(1000 * chunk as u64 / 100_000 <= 100);
        assert!(1000 * (chunk as u64 * 2) / 100_000 > 100);

        // fast enough already
        assert_eq!(effective_chunk_size(65_536, 10_000_000), 65_536);
    }

    #[test]
    fn test_chunk_size_floor() {
        assert_eq!(effective_chunk_size(65_536, 10), MIN_CHUNK_SIZE);
        assert_eq!(effective_chunk_size(32, 1), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_takes_expected_time() {
        let rate = 10_000u64;
        let chunk = effective_chunk_size(65_536, rate);
        let mut limiter = RateLimiter::new(rate);
        let started = Instant::now();
        let total = 50_000usize;
        let mut moved = 0;
        while moved < total {
            let n = chunk.min(total - moved);
            moved += n;
            limiter.consume(n).await;
        }
        let took = started.elapsed();
        let expected = Duration::from_secs(5);
        assert!(took >= expected, "took {:?}", took);
        assert!(took < expected + RATE_CONTROL_RESOLUTION, "took {:?}", took);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_restarts_window_after_stall() {
        let mut limiter = RateLimiter::new(1_000);
        limiter.consume(100).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let before = Instant::now();
        // behind schedule: no sleep, window restarts
        limiter.consume(100).await;
        assert_eq!(Instant::now(), before);
        // the next bytes are measured against the new window
        limiter.consume(100).await;
        let waited = Instant::now() - before;
        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(200), "waited {:?}", waited);
    }

    #[test]
    fn test_disabled_limiter_never_sleeps() {
        let mut limiter = RateLimiter::new(0);
        assert!(!limiter.is_active());
        tokio_test::block_on(limiter.consume(usize::MAX / 2));
    }
}
