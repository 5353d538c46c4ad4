//! Update gate: decides when a smoothed estimate is worth writing.
//!
//! A write happens when the free count differs from the last successfully
//! written value (or nothing was written yet), and at least `min_interval`
//! has passed since the last successful write. The rate limit wins over
//! freshness. The first write of a run is never rate limited.
//!
//! Times are offsets from the start of the run (see `schedule::Clock`).

use std::time::Duration;

use crate::error::PipelineError;
use crate::smoothing::SmoothedEstimate;

/// Last successfully written value. Only the gate mutates it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportedState {
    pub last_value: Option<SmoothedEstimate>,
    pub last_write_time: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Write,
    Unchanged,
    RateLimited { remaining: Duration },
}

#[derive(Debug)]
pub enum GateOutcome {
    Written,
    Unchanged,
    RateLimited { remaining: Duration },
    /// The write was attempted and failed; state was left as it was.
    Failed(PipelineError),
}

#[derive(Clone, Debug)]
pub struct UpdateGate {
    min_interval: Duration,
    state: ReportedState,
}

impl UpdateGate {
    /// `Duration::ZERO` disables rate limiting.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: ReportedState::default(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn state(&self) -> &ReportedState {
        &self.state
    }

    pub fn decide(&self, estimate: &SmoothedEstimate, now: Duration) -> GateDecision {
        if let Some(last) = &self.state.last_value {
            if last.free_count == estimate.free_count {
                return GateDecision::Unchanged;
            }
        }
        if let Some(written_at) = self.state.last_write_time {
            let elapsed = now.saturating_sub(written_at);
            if elapsed < self.min_interval {
                return GateDecision::RateLimited {
                    remaining: self.min_interval - elapsed,
                };
            }
        }
        GateDecision::Write
    }

    /// Run the gate and, when it opens, call `write`.
    ///
    /// State only advances when `write` succeeds, so a failed value is still
    /// a change on the next cycle.
    pub fn submit<F>(&mut self, estimate: SmoothedEstimate, now: Duration, write: F) -> GateOutcome
    where
        F: FnOnce(&SmoothedEstimate) -> Result<(), PipelineError>,
    {
        match self.decide(&estimate, now) {
            GateDecision::Unchanged => GateOutcome::Unchanged,
            GateDecision::RateLimited { remaining } => GateOutcome::RateLimited { remaining },
            GateDecision::Write => match write(&estimate) {
                Ok(()) => {
                    self.state = ReportedState {
                        last_value: Some(estimate),
                        last_write_time: Some(now),
                    };
                    GateOutcome::Written
                }
                Err(err) => GateOutcome::Failed(err),
            },
        }
    }
}
