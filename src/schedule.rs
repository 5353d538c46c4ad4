//! Time and cancellation for the pipeline driver.
//!
//! The driver never calls `thread::sleep` directly: every pause goes through a
//! `Clock`, and every clock sleep wakes early when the `StopSignal` is raised.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Cooperative stop flag shared between the driver and whoever owns the run
/// (Ctrl-C handler, supervisor, test).
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        if let Ok(mut stopped) = flag.lock() {
            *stopped = true;
        }
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        let (flag, _) = &*self.inner;
        flag.lock().map(|stopped| *stopped).unwrap_or(true)
    }

    /// Block for up to `timeout`. Returns true if stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let Ok(guard) = flag.lock() else {
            return true;
        };
        match cvar.wait_timeout_while(guard, timeout, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }
}

pub trait Clock: Send {
    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;

    /// Local wall-clock time, for record timestamps.
    fn wall(&self) -> DateTime<Local>;

    /// Sleep for `duration` unless stopped first. Returns true if stopped.
    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool;
}

#[derive(Clone, Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool {
        if duration.is_zero() {
            return stop.is_stopped();
        }
        stop.wait_timeout(duration)
    }
}

/// Deterministic clock for tests: sleeping advances time instantly.
///
/// Clones share the same time, so a test can advance it while the pipeline
/// holds another handle.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
    epoch: DateTime<Local>,
}

impl ManualClock {
    pub fn new(epoch: DateTime<Local>) -> Self {
        Self {
            now: Arc::new(Mutex::new(Duration::ZERO)),
            epoch,
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Local::now())
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }

    fn wall(&self) -> DateTime<Local> {
        let offset = chrono::Duration::from_std(self.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch + offset
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool {
        if stop.is_stopped() {
            return true;
        }
        self.advance(duration);
        stop.is_stopped()
    }
}
