use std::{thread, time::Duration, time::Instant};

/// Millisecond time source with the same shape as a microcontroller tick
/// counter: a `u32` that wraps roughly every 49.7 days.
pub trait Clock {
    fn now_ms(&self) -> u32;

    fn delay_ms(&mut self, ms: u32);

    /// Gives platform background work a chance to run.
    fn yield_now(&mut self) {}
}

/// Milliseconds from `since` to `now`, correct across a counter wrap as long
/// as the real gap is shorter than one full wrap.
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap.
        self.start.elapsed().as_millis() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn yield_now(&mut self) {
        thread::yield_now();
    }
}
