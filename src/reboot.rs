//! Deferred device reset after a commit.
//!
//! Resetting from inside the write callback would cut off the host's USB
//! transaction mid-flight, so the reset is scheduled [`RESET_DEBOUNCE`] after
//! the commit and picked up by a periodic poll.

use embassy_time::{Duration, Instant};

use crate::config::RESET_DEBOUNCE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceAction {
    /// Arm the watchdog with a minimal timeout and spin.
    Reset,
}

/// A one-shot action becoming due strictly after `not_before`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScheduledTask {
    pub not_before: Instant,
    pub action: DeviceAction,
}

impl ScheduledTask {
    pub fn is_due(&self, now: Instant) -> bool {
        now > self.not_before
    }
}

pub struct RebootScheduler {
    debounce: Duration,
    task: Option<ScheduledTask>,
}

impl RebootScheduler {
    pub const fn new() -> Self {
        Self::with_debounce(RESET_DEBOUNCE)
    }

    pub const fn with_debounce(debounce: Duration) -> Self {
        Self { debounce, task: None }
    }

    /// Schedule the reset for a commit completed at `committed_at`.
    /// Only the first commit counts; later calls are ignored.
    pub fn arm(&mut self, committed_at: Instant) {
        if self.task.is_some() {
            return;
        }
        let not_before = committed_at.saturating_add(self.debounce);
        info!("reset scheduled for {} ms", not_before.as_millis());
        self.task = Some(ScheduledTask {
            not_before,
            action: DeviceAction::Reset,
        });
    }

    pub fn pending(&self) -> Option<ScheduledTask> {
        self.task
    }

    /// Returns the action once the debounce window has fully elapsed. The
    /// task stays scheduled; a due reset is never cancelled.
    pub fn poll(&self, now: Instant) -> Option<DeviceAction> {
        self.task.filter(|t| t.is_due(now)).map(|t| t.action)
    }
}

impl Default for RebootScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_scheduler_never_fires() {
        let s = RebootScheduler::new();
        assert_eq!(s.pending(), None);
        assert_eq!(s.poll(Instant::from_secs(3600)), None);
    }

    #[test]
    fn fires_only_after_debounce() {
        let mut s = RebootScheduler::new();
        let t0 = Instant::from_millis(1_000);
        s.arm(t0);

        assert_eq!(s.poll(t0), None);
        assert_eq!(s.poll(Instant::from_millis(1_499)), None);
        assert_eq!(s.poll(Instant::from_millis(1_500)), None);
        assert_eq!(s.poll(Instant::from_millis(1_501)), Some(DeviceAction::Reset));
        // Still due on later ticks.
        assert_eq!(s.poll(Instant::from_millis(5_000)), Some(DeviceAction::Reset));
    }

    #[test]
    fn first_arm_wins() {
        let mut s = RebootScheduler::with_debounce(Duration::from_millis(10));
        s.arm(Instant::from_millis(100));
        s.arm(Instant::from_millis(900));

        assert_eq!(s.pending().map(|t| t.not_before), Some(Instant::from_millis(110)));
        assert_eq!(s.poll(Instant::from_millis(111)), Some(DeviceAction::Reset));
    }
}
