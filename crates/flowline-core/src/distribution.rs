//! Stochastic laws for inter-arrival and processing times.

use crate::error::ParamError;
use crate::rng::SimRng;
use crate::time::{SimTime, TimeUnit, from_f64};
use rand_distr::{Distribution as _, Exp, Normal, SkewNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A duration law. Times are canonical; rates are events per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    /// Always the same duration.
    Constant(SimTime),
    /// Gaussian duration. Negative draws clamp to zero.
    Normal { mean: SimTime, stddev: SimTime },
    /// Skewed Gaussian: `shape > 0` leans right, `shape < 0` left and
    /// `shape == 0` is `Normal { mean: location, stddev: scale }`.
    /// Negative draws clamp to zero.
    SkewNormal {
        location: SimTime,
        scale: SimTime,
        shape: f64,
    },
    /// Arrivals of a Poisson process with rate `rate`: exponential gaps
    /// with mean `1 / rate` seconds.
    Poisson { rate: f64 },
    /// Exponentially distributed duration with mean `1 / rate` seconds.
    Exponential { rate: f64 },
}

impl Distribution {
    /// Reject parameters that cannot produce a meaningful duration.
    pub fn validate(&self) -> Result<(), ParamError> {
        match *self {
            Distribution::Constant(t) if t < SimTime::ZERO => Err(ParamError::NegativeTime(t)),
            Distribution::Normal { mean, .. } if mean < SimTime::ZERO => {
                Err(ParamError::NegativeTime(mean))
            }
            Distribution::Normal { stddev, .. } if stddev <= SimTime::ZERO => {
                Err(ParamError::NonPositiveStddev(stddev))
            }
            Distribution::SkewNormal { location, .. } if location < SimTime::ZERO => {
                Err(ParamError::NegativeTime(location))
            }
            Distribution::SkewNormal { scale, .. } if scale <= SimTime::ZERO => {
                Err(ParamError::NonPositiveStddev(scale))
            }
            Distribution::SkewNormal { shape, .. } if !shape.is_finite() => {
                Err(ParamError::NonFiniteShape(shape))
            }
            Distribution::Poisson { rate } | Distribution::Exponential { rate }
                if !(rate.is_finite() && rate > 0.0) =>
            {
                Err(ParamError::NonPositiveRate(rate))
            }
            _ => Ok(()),
        }
    }

    /// True when every draw is exactly zero.
    pub fn is_zero(&self) -> bool {
        matches!(*self, Distribution::Constant(t) if t == SimTime::ZERO)
    }

    /// Expected duration.
    pub fn mean(&self) -> SimTime {
        match *self {
            Distribution::Constant(t) => t,
            Distribution::Normal { mean, .. } => mean,
            Distribution::SkewNormal {
                location,
                scale,
                shape,
            } => {
                let delta = shape / (1.0 + shape * shape).sqrt();
                let shift = scale.to_num::<f64>() * delta * (2.0 / std::f64::consts::PI).sqrt();
                let mean = (location.to_num::<f64>() + shift).max(0.0);
                SimTime::checked_from_num(mean).unwrap_or(SimTime::MAX)
            }
            Distribution::Poisson { rate } | Distribution::Exponential { rate } => {
                from_f64(1.0 / rate, TimeUnit::Seconds).unwrap_or(SimTime::MAX)
            }
        }
    }

    /// Draw one duration. Constant laws never touch the generator.
    pub fn sample(&self, rng: &mut SimRng) -> SimTime {
        match *self {
            Distribution::Constant(t) => t,
            Distribution::Normal { mean, stddev } => {
                let draw = match Normal::new(mean.to_num::<f64>(), stddev.to_num::<f64>()) {
                    Ok(normal) => normal.sample(rng),
                    Err(_) => mean.to_num::<f64>(),
                };
                if draw < 0.0 {
                    debug!(draw, "normal sample below zero clamped");
                    return SimTime::ZERO;
                }
                SimTime::checked_from_num(draw).unwrap_or(SimTime::MAX)
            }
            Distribution::SkewNormal {
                location,
                scale,
                shape,
            } => {
                let location = location.to_num::<f64>();
                let draw = match SkewNormal::new(location, scale.to_num::<f64>(), shape) {
                    Ok(skew) => skew.sample(rng),
                    Err(_) => location,
                };
                if draw < 0.0 {
                    debug!(draw, "skew-normal sample below zero clamped");
                    return SimTime::ZERO;
                }
                SimTime::checked_from_num(draw).unwrap_or(SimTime::MAX)
            }
            Distribution::Poisson { rate } | Distribution::Exponential { rate } => {
                let secs = match Exp::new(rate) {
                    Ok(exp) => exp.sample(rng),
                    Err(_) => 0.0,
                };
                from_f64(secs, TimeUnit::Seconds).unwrap_or(SimTime::MAX)
            }
        }
    }
}
