//! Iteration pacing.
//!
//! [`IterationScheduler`] is the pure correction algorithm: a two-state machine with one
//! transition function, testable without a clock. [`Pacer`] puts wall-clock deadlines on top of
//! it with single-shot re-arm semantics.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Armed,
}

/// Self-correcting period generator.
///
/// The correction is proportional only: the next interval is `T + (T - measured)`, floored at
/// zero, so one slow step is paid back by one short wait and nothing accumulates.
#[derive(Debug, Clone)]
pub struct IterationScheduler {
    frequency: f64,
    nominal: Duration,
    interval: Duration,
    state: SchedulerState,
}

impl IterationScheduler {
    pub fn new(frequency: f64) -> Self {
        let mut s = Self {
            frequency: 0.0,
            nominal: Duration::ZERO,
            interval: Duration::ZERO,
            state: SchedulerState::Stopped,
        };
        s.set_target_frequency(frequency);
        s
    }

    /// `0` means back-to-back iterations. Negative or non-finite values are treated as `0`.
    pub fn set_target_frequency(&mut self, frequency: f64) {
        let frequency = if frequency.is_finite() && frequency >= 0.0 {
            frequency
        } else {
            tracing::warn!(frequency, "invalid target frequency, using 0");
            0.0
        };
        self.frequency = frequency;
        self.nominal = if frequency > 0.0 {
            Duration::from_secs_f64(1.0 / frequency)
        } else {
            Duration::ZERO
        };
        self.interval = self.nominal;
    }

    pub fn target_frequency(&self) -> f64 {
        self.frequency
    }

    pub fn nominal_interval(&self) -> Duration {
        self.nominal
    }

    /// Delay before the next iteration fires.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == SchedulerState::Armed
    }

    pub fn start(&mut self) {
        self.state = SchedulerState::Armed;
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        self.state = SchedulerState::Stopped;
    }

    /// Feed the wall-clock duration of the step that just completed; returns the next interval.
    pub fn on_step_measured(&mut self, measured: Duration) -> Duration {
        if self.frequency <= 0.0 {
            self.interval = Duration::ZERO;
            return self.interval;
        }
        let nominal = self.nominal.as_nanos() as i128;
        let next = nominal + (nominal - measured.as_nanos() as i128);
        self.interval = Duration::from_nanos(next.clamp(0, u64::MAX as i128) as u64);
        self.interval
    }
}

/// Wall-clock driver for an [`IterationScheduler`].
///
/// The host asks [`Pacer::time_until_due`] how long it may sleep, and brackets every iteration
/// with [`Pacer::step_started`] / [`Pacer::step_finished`]. The measured step is the time between
/// consecutive starts, so it includes the wait that preceded it.
#[derive(Debug, Clone)]
pub struct Pacer {
    scheduler: IterationScheduler,
    deadline: Option<Instant>,
    last_start: Option<Instant>,
    last_measured: Option<Duration>,
}

impl Pacer {
    pub fn new(scheduler: IterationScheduler) -> Self {
        Self {
            scheduler,
            deadline: None,
            last_start: None,
            last_measured: None,
        }
    }

    pub fn scheduler(&self) -> &IterationScheduler {
        &self.scheduler
    }

    pub fn set_target_frequency(&mut self, frequency: f64) {
        self.scheduler.set_target_frequency(frequency);
        if let Some(last) = self.last_start {
            if self.scheduler.is_armed() {
                self.deadline = Some(last + self.scheduler.interval());
            }
        }
    }

    /// Arm the first iteration one interval after `now`. No-op if already armed.
    pub fn arm(&mut self, now: Instant) {
        if self.scheduler.is_armed() {
            return;
        }
        self.scheduler.start();
        self.deadline = Some(now + self.scheduler.interval());
        self.last_start = None;
    }

    /// Cancel the pending deadline. Work already submitted is unaffected.
    pub fn disarm(&mut self) {
        self.scheduler.stop();
        self.deadline = None;
        self.last_start = None;
    }

    pub fn is_armed(&self) -> bool {
        self.scheduler.is_armed()
    }

    /// `None` when disarmed.
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|d| d.checked_duration_since(now).unwrap_or(Duration::ZERO))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.time_until_due(now) == Some(Duration::ZERO)
    }

    /// Record the start of an iteration; feeds the scheduler with the period since the last one.
    pub fn step_started(&mut self, now: Instant) -> Option<Duration> {
        self.deadline = None;
        let measured = self.last_start.map(|prev| now.saturating_duration_since(prev));
        if let Some(m) = measured {
            self.scheduler.on_step_measured(m);
        }
        self.last_start = Some(now);
        self.last_measured = measured;
        measured
    }

    /// Re-arm single-shot: the next deadline is one corrected interval after `now`.
    pub fn step_finished(&mut self, now: Instant) {
        if self.scheduler.is_armed() {
            self.deadline = Some(now + self.scheduler.interval());
        }
    }

    pub fn last_measured(&self) -> Option<Duration> {
        self.last_measured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_interval_from_frequency() {
        let s = IterationScheduler::new(50.0);
        assert_eq!(s.nominal_interval(), Duration::from_millis(20));
        assert_eq!(s.interval(), Duration::from_millis(20));
        assert_eq!(s.state(), SchedulerState::Stopped);
    }

    #[test]
    fn zero_frequency_never_waits() {
        let mut s = IterationScheduler::new(0.0);
        assert_eq!(s.interval(), Duration::ZERO);
        assert_eq!(s.on_step_measured(Duration::from_millis(40)), Duration::ZERO);
        assert_eq!(s.on_step_measured(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn invalid_frequency_clamps_to_zero() {
        let mut s = IterationScheduler::new(60.0);
        s.set_target_frequency(-3.0);
        assert_eq!(s.target_frequency(), 0.0);
        s.set_target_frequency(f64::NAN);
        assert_eq!(s.interval(), Duration::ZERO);
    }

    #[test]
    fn overrun_floors_at_zero() {
        let mut s = IterationScheduler::new(100.0);
        assert_eq!(s.on_step_measured(Duration::from_millis(25)), Duration::ZERO);
        assert_eq!(s.on_step_measured(Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn early_step_lengthens_next_wait() {
        let mut s = IterationScheduler::new(100.0);
        assert_eq!(s.on_step_measured(Duration::from_millis(7)), Duration::from_millis(13));
    }

    #[test]
    fn start_stop_are_idempotent() {
        let mut s = IterationScheduler::new(30.0);
        s.start();
        s.start();
        assert!(s.is_armed());
        s.stop();
        s.stop();
        assert!(!s.is_armed());
    }

    #[test]
    fn pacer_rearms_after_each_step() {
        let t0 = Instant::now();
        let mut p = Pacer::new(IterationScheduler::new(100.0));
        assert_eq!(p.time_until_due(t0), None);

        p.arm(t0);
        assert_eq!(p.time_until_due(t0), Some(Duration::from_millis(10)));
        assert!(!p.is_due(t0 + Duration::from_millis(9)));
        assert!(p.is_due(t0 + Duration::from_millis(10)));

        let s1 = t0 + Duration::from_millis(10);
        assert_eq!(p.step_started(s1), None);
        p.step_finished(s1 + Duration::from_millis(2));
        assert_eq!(
            p.time_until_due(s1 + Duration::from_millis(2)),
            Some(Duration::from_millis(10))
        );

        // 12ms period measured: next interval shortened by 2ms.
        let s2 = s1 + Duration::from_millis(12);
        assert_eq!(p.step_started(s2), Some(Duration::from_millis(12)));
        assert_eq!(p.scheduler().interval(), Duration::from_millis(8));
        p.step_finished(s2);
        assert_eq!(p.time_until_due(s2), Some(Duration::from_millis(8)));
    }

    #[test]
    fn disarm_cancels_deadline() {
        let t0 = Instant::now();
        let mut p = Pacer::new(IterationScheduler::new(10.0));
        p.arm(t0);
        p.disarm();
        p.disarm();
        assert_eq!(p.time_until_due(t0), None);
        p.step_finished(t0);
        assert_eq!(p.time_until_due(t0), None);
    }
}
