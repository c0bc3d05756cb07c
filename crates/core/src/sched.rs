// SPDX-License-Identifier: Apache-2.0

//! Auto-async scheduler.
//!
//! Tracks how much of a process's wall-clock time is spent inside the
//! runtime and flips the process-wide async state between on and off with
//! two hysteresis thresholds: a communication-bound process gains nothing
//! from the helper detour, a compute-bound one needs it. The state decided
//! at window allocation is frozen into every per-target descriptor, so hot
//! paths never consult the scheduler.

use proxima_config::EnvParams;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Per-target asynchronous redirection state, frozen at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncStat {
    /// Operations to this target are redirected through a helper.
    #[default]
    On,
    /// Operations go directly to the target.
    Off,
}

impl AsyncStat {
    pub(crate) fn to_word(self) -> u64 {
        match self {
            AsyncStat::On => 0,
            AsyncStat::Off => 1,
        }
    }

    pub(crate) fn from_word(word: u64) -> Self {
        if word == 0 { AsyncStat::On } else { AsyncStat::Off }
    }
}

/// The process-wide scheduler state.
pub(crate) struct AsyncScheduler {
    enabled: bool,
    thr_high: u64,
    thr_low: u64,
    state: AsyncStat,
    comm_time: Duration,
    interval_start: Instant,
}

/// Shared handle: the scheduler is per process and single-threaded.
pub(crate) type SchedHandle = Rc<RefCell<AsyncScheduler>>;

impl AsyncScheduler {
    pub(crate) fn new(env: &EnvParams) -> Self {
        Self {
            enabled: env.auto_async_sched,
            thr_high: env.async_thr_high,
            thr_low: env.async_thr_low,
            state: AsyncStat::On,
            comm_time: Duration::ZERO,
            interval_start: Instant::now(),
        }
    }

    pub(crate) fn handle(env: &EnvParams) -> SchedHandle {
        Rc::new(RefCell::new(Self::new(env)))
    }

    /// Adds runtime-entry time to the current interval.
    pub(crate) fn add_comm_time(&mut self, elapsed: Duration) {
        self.comm_time += elapsed;
    }

    /// Decides the async state for the interval ending now.
    pub(crate) fn decide(&mut self) -> AsyncStat {
        self.decide_at(Instant::now())
    }

    /// Clock-injectable decision, for deterministic tests.
    pub(crate) fn decide_at(&mut self, now: Instant) -> AsyncStat {
        if !self.enabled {
            return self.state;
        }
        let interval = now.saturating_duration_since(self.interval_start);
        if !interval.is_zero() {
            let freq = (self.comm_time.as_secs_f64() / interval.as_secs_f64() * 100.0) as u64;
            let old = self.state;
            if freq >= self.thr_high {
                self.state = AsyncStat::Off;
            } else if freq <= self.thr_low {
                self.state = AsyncStat::On;
            }
            if old != self.state {
                tracing::debug!(freq, ?old, new = ?self.state, "async state rescheduled");
            }
        }
        self.comm_time = Duration::ZERO;
        self.interval_start = now;
        self.state
    }
}

/// Guard accumulating the time a layer entry spends inside the runtime.
pub(crate) struct CommTimer {
    sched: SchedHandle,
    start: Instant,
}

impl CommTimer {
    pub(crate) fn start(sched: &SchedHandle) -> Self {
        Self {
            sched: Rc::clone(sched),
            start: Instant::now(),
        }
    }
}

impl Drop for CommTimer {
    fn drop(&mut self) {
        self.sched.borrow_mut().add_comm_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(high: u64, low: u64) -> AsyncScheduler {
        let env = EnvParams {
            auto_async_sched: true,
            async_thr_high: high,
            async_thr_low: low,
            ..EnvParams::default()
        };
        AsyncScheduler::new(&env)
    }

    #[test]
    fn communication_bound_turns_off() {
        let mut sched = scheduler(70, 30);
        let start = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(90));
        assert_eq!(
            sched.decide_at(start + Duration::from_millis(100)),
            AsyncStat::Off
        );
    }

    #[test]
    fn compute_bound_turns_on_again() {
        let mut sched = scheduler(70, 30);
        let start = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(90));
        let _ = sched.decide_at(start + Duration::from_millis(100));

        // Next interval is almost all compute.
        let mid = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(10));
        assert_eq!(
            sched.decide_at(mid + Duration::from_millis(100)),
            AsyncStat::On
        );
    }

    #[test]
    fn hysteresis_band_keeps_state() {
        let mut sched = scheduler(70, 30);
        let start = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(50));
        assert_eq!(
            sched.decide_at(start + Duration::from_millis(100)),
            AsyncStat::On
        );

        // Push off, then land in the band again: stays off.
        let t1 = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(80));
        let _ = sched.decide_at(t1 + Duration::from_millis(100));
        let t2 = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(50));
        assert_eq!(
            sched.decide_at(t2 + Duration::from_millis(100)),
            AsyncStat::Off
        );
    }

    #[test]
    fn accumulator_resets_each_decision() {
        let mut sched = scheduler(70, 30);
        let start = sched.interval_start;
        sched.add_comm_time(Duration::from_millis(90));
        let _ = sched.decide_at(start + Duration::from_millis(100));

        let mid = sched.interval_start;
        assert_eq!(
            sched.decide_at(mid + Duration::from_millis(100)),
            AsyncStat::On
        );
    }

    #[test]
    fn disabled_scheduler_pins_on() {
        let env = EnvParams::default();
        let mut sched = AsyncScheduler::new(&env);
        sched.add_comm_time(Duration::from_secs(10));
        assert_eq!(sched.decide(), AsyncStat::On);
    }
}
