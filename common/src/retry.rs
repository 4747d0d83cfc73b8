use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval_ms: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(self) -> u32 {
        match self {
            Self::Succeeded { attempts } | Self::Exhausted { attempts } => attempts,
        }
    }

    pub fn succeeded(self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

impl RetryPolicy {
    pub fn new(poll_interval_ms: u32, max_attempts: u32) -> Self {
        Self {
            poll_interval_ms,
            max_attempts,
        }
    }

    /// Calls `probe` up to `max_attempts` times, sleeping `poll_interval_ms`
    /// between attempts. `on_failed_poll` sees the 1-based number of every
    /// attempt that came back false. Exhaustion is returned to the caller,
    /// which owns the escalation.
    pub fn poll_until<C, P, F>(
        &self,
        clock: &mut C,
        mut probe: P,
        mut on_failed_poll: F,
    ) -> RetryOutcome
    where
        C: Clock + ?Sized,
        P: FnMut() -> bool,
        F: FnMut(u32),
    {
        for attempt in 1..=self.max_attempts {
            if probe() {
                return RetryOutcome::Succeeded { attempts: attempt };
            }

            on_failed_poll(attempt);

            if attempt < self.max_attempts {
                clock.delay_ms(self.poll_interval_ms);
            }
        }

        RetryOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}
