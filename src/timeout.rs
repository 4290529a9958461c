use crate::ClockSource;

/// Deadline for one blocking poll, started from the driver's clock.
///
/// A timeout of zero disables the deadline and the poll blocks until the
/// sensor answers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutGuard {
    start_ms: u32,
    timeout_ms: u32,
}

impl TimeoutGuard {
    pub(crate) fn start(clock: &impl ClockSource, timeout_ms: u32) -> Self {
        Self {
            start_ms: clock.get_ms(),
            timeout_ms,
        }
    }

    pub(crate) fn expired(&self, clock: &impl ClockSource) -> bool {
        self.timeout_ms > 0 && clock.get_ms().wrapping_sub(self.start_ms) > self.timeout_ms
    }
}

/// How a poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Ready,
    TimedOut,
}
