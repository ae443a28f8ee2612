//! Start/pause/resume/stop surface over a [`Simulation`].
//!
//! The controller is a small state machine; it never runs on its own. A
//! presentation loop calls [`RunController::advance`] with how far to go and
//! uses [`RunController::playback_delay`] to pace itself in wall-clock time.
//! Speed only affects that pacing, never ordering or statistics.

use crate::engine::{SimConfig, Simulation};
use crate::error::{ParamError, SimError};
use crate::id::EventId;
use crate::scheduler::{RunLimit, RunOutcome};
use crate::snapshot::{GraphSnapshot, SnapshotError};
use crate::time::{SimTime, TimeUnit, to_f64};
use crate::view::RunView;
use std::time::Duration;
use tracing::{debug, warn};

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    /// Stopped by the user; the queue was discarded.
    Stopped,
    /// Drained, or reached the configured horizon.
    Finished,
    /// An internal error ended the run. Statistics stay readable.
    Aborted {
        node: String,
        event: Option<EventId>,
        detail: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no run has been started")]
    NoRun,
    #[error("run is not running ({0:?})")]
    NotRunning(RunStatus),
    #[error("run is not paused ({0:?})")]
    NotPaused(RunStatus),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug)]
pub struct RunController {
    sim: Option<Simulation>,
    status: RunStatus,
    speed: f64,
    config: SimConfig,
}

impl RunController {
    /// `config` is the template for every run; `start` overrides the seed.
    pub fn new(config: SimConfig) -> Self {
        Self {
            sim: None,
            status: RunStatus::Idle,
            speed: 1.0,
            config,
        }
    }

    /// Build a fresh run from `snapshot` and start it. Any previous run is
    /// dropped.
    pub fn start(&mut self, snapshot: &GraphSnapshot, seed: u64) -> Result<(), ControlError> {
        let model = snapshot.build()?;
        let config = SimConfig {
            seed,
            ..self.config.clone()
        };
        let mut sim = Simulation::from_model(model, config)?;
        sim.start()?;
        self.sim = Some(sim);
        self.status = RunStatus::Running;
        debug!(seed, "run controller started");
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), ControlError> {
        if self.status != RunStatus::Running {
            return Err(ControlError::NotRunning(self.status.clone()));
        }
        self.status = RunStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), ControlError> {
        if self.status != RunStatus::Paused {
            return Err(ControlError::NotPaused(self.status.clone()));
        }
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Discard pending events. Statistics collected so far are kept.
    pub fn stop(&mut self) -> Result<(), ControlError> {
        let sim = self.sim.as_mut().ok_or(ControlError::NoRun)?;
        sim.stop();
        self.status = RunStatus::Stopped;
        Ok(())
    }

    /// Set the playback multiplier. Out-of-range values are clamped to
    /// `MIN_SPEED..=MAX_SPEED`; returns the speed actually applied.
    pub fn set_speed(&mut self, multiplier: f64) -> Result<f64, ControlError> {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(ParamError::InvalidSpeed(multiplier).into());
        }
        self.speed = multiplier.clamp(MIN_SPEED, MAX_SPEED);
        Ok(self.speed)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Dispatch events up to `limit`, capped by the configured horizon.
    pub fn advance(&mut self, limit: RunLimit) -> Result<RunOutcome, ControlError> {
        if self.status != RunStatus::Running {
            return Err(ControlError::NotRunning(self.status.clone()));
        }
        let sim = self.sim.as_mut().ok_or(ControlError::NoRun)?;
        let horizon = sim.config().horizon;
        let until = match (limit.until, horizon) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let limit = RunLimit { until, ..limit };

        match sim.run(limit) {
            Ok(outcome) => {
                let at_horizon = horizon.is_some_and(|h| sim.now() >= h);
                if outcome == RunOutcome::Drained
                    || (outcome == RunOutcome::HorizonReached && at_horizon)
                {
                    self.status = RunStatus::Finished;
                }
                Ok(outcome)
            }
            Err(err) => {
                self.status = match &err {
                    SimError::Internal {
                        node,
                        event,
                        detail,
                    } => RunStatus::Aborted {
                        node: node.clone(),
                        event: *event,
                        detail: detail.clone(),
                    },
                    other => RunStatus::Aborted {
                        node: String::new(),
                        event: None,
                        detail: other.to_string(),
                    },
                };
                warn!(status = ?self.status, "run controller aborted");
                Err(err.into())
            }
        }
    }

    /// Advance by `sim_delta` of simulated time.
    pub fn advance_by(&mut self, sim_delta: SimTime) -> Result<RunOutcome, ControlError> {
        let now = self.sim.as_ref().ok_or(ControlError::NoRun)?.now();
        self.advance(RunLimit::until(now.saturating_add(sim_delta)))
    }

    /// Wall-clock time that `sim_delta` of simulated time should take to
    /// play back at the current speed.
    pub fn playback_delay(&self, sim_delta: SimTime) -> Duration {
        let secs = to_f64(sim_delta, TimeUnit::Seconds) / self.speed;
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn simulation(&self) -> Option<&Simulation> {
        self.sim.as_ref()
    }

    pub fn view(&self) -> Option<RunView> {
        self.sim.as_ref().map(Simulation::view)
    }
}
