//! Attempt-indexed wait intervals for the Open state
//!
//! The breaker asks for `wait_duration(attempts)` every time it enters Open,
//! where `attempts` counts consecutive Open entries (1 on the first trip).
//! Randomization uses the chrono-machines jitter formula:
//! `delay * (1 - factor + rand * factor)`.

use crate::errors::ConfigError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const MIN_WAIT: Duration = Duration::from_millis(1);

/// How long the breaker stays Open before probing recovery
#[derive(Clone)]
pub enum WaitInterval {
    /// Same wait on every attempt
    Fixed(Duration),
    /// Fixed wait shortened by up to `randomization_factor`
    Randomized {
        interval: Duration,
        randomization_factor: f64,
    },
    /// `initial * multiplier^(attempts - 1)`, capped at `max`, optionally randomized
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        randomization_factor: f64,
    },
    /// Caller-supplied function of the attempt count
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl WaitInterval {
    pub fn fixed(interval: Duration) -> Self {
        WaitInterval::Fixed(interval)
    }

    pub fn randomized(interval: Duration, randomization_factor: f64) -> Self {
        WaitInterval::Randomized {
            interval,
            randomization_factor,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        WaitInterval::Exponential {
            initial,
            multiplier,
            max,
            randomization_factor: 0.0,
        }
    }

    pub fn exponential_randomized(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        randomization_factor: f64,
    ) -> Self {
        WaitInterval::Exponential {
            initial,
            multiplier,
            max,
            randomization_factor,
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        WaitInterval::Custom(Arc::new(f))
    }

    /// Wait before leaving Open on the given (1-based) attempt
    pub fn wait_duration(&self, attempts: u32) -> Duration {
        match self {
            WaitInterval::Fixed(interval) => *interval,
            WaitInterval::Randomized {
                interval,
                randomization_factor,
            } => jitter(*interval, *randomization_factor),
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
                randomization_factor,
            } => {
                let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
                let grown = initial.as_secs_f64() * multiplier.powi(exponent);
                let capped = if grown.is_finite() && grown < max.as_secs_f64() {
                    Duration::from_secs_f64(grown)
                } else {
                    *max
                };
                jitter(capped, *randomization_factor)
            }
            WaitInterval::Custom(f) => f(attempts),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            WaitInterval::Fixed(interval) => check_wait(*interval),
            WaitInterval::Randomized {
                interval,
                randomization_factor,
            } => {
                check_wait(*interval)?;
                check_factor(*randomization_factor)
            }
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
                randomization_factor,
            } => {
                check_wait(*initial)?;
                check_wait(*max)?;
                if multiplier.is_nan() || *multiplier < 1.0 {
                    return Err(ConfigError::WaitIntervalMultiplier(*multiplier));
                }
                check_factor(*randomization_factor)
            }
            WaitInterval::Custom(_) => Ok(()),
        }
    }
}

impl Default for WaitInterval {
    fn default() -> Self {
        WaitInterval::Fixed(Duration::from_secs(60))
    }
}

impl fmt::Debug for WaitInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitInterval::Fixed(interval) => f.debug_tuple("Fixed").field(interval).finish(),
            WaitInterval::Randomized {
                interval,
                randomization_factor,
            } => f
                .debug_struct("Randomized")
                .field("interval", interval)
                .field("randomization_factor", randomization_factor)
                .finish(),
            WaitInterval::Exponential {
                initial,
                multiplier,
                max,
                randomization_factor,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("randomization_factor", randomization_factor)
                .finish(),
            WaitInterval::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

fn check_wait(interval: Duration) -> Result<(), ConfigError> {
    if interval < MIN_WAIT {
        return Err(ConfigError::WaitDurationInOpenState);
    }
    Ok(())
}

fn check_factor(factor: f64) -> Result<(), ConfigError> {
    if !(0.0..1.0).contains(&factor) {
        return Err(ConfigError::RandomizationFactor(factor));
    }
    Ok(())
}

/// Apply chrono-machines jitter to a delay (millisecond resolution)
fn jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: delay_ms,
        multiplier: 1.0,
        max_delay_ms: delay_ms,
    };
    let jittered_ms = policy.calculate_delay(1, factor);
    Duration::from_millis(jittered_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval_ignores_attempts() {
        let interval = WaitInterval::fixed(Duration::from_millis(250));
        assert_eq!(interval.wait_duration(1), Duration::from_millis(250));
        assert_eq!(interval.wait_duration(9), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_interval_doubles_and_caps() {
        let interval =
            WaitInterval::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(5));
        assert_eq!(interval.wait_duration(1), Duration::from_secs(1));
        assert_eq!(interval.wait_duration(2), Duration::from_secs(2));
        assert_eq!(interval.wait_duration(3), Duration::from_secs(4));
        assert_eq!(interval.wait_duration(4), Duration::from_secs(5));
        assert_eq!(interval.wait_duration(200), Duration::from_secs(5));
    }

    #[test]
    fn test_randomized_interval_stays_in_jitter_band() {
        let base = Duration::from_millis(1_000);
        let interval = WaitInterval::randomized(base, 0.5);
        for attempt in 1..50 {
            let wait = interval.wait_duration(attempt);
            assert!(wait >= Duration::from_millis(499), "{:?} below band", wait);
            assert!(wait <= Duration::from_millis(1_001), "{:?} above band", wait);
        }
    }

    #[test]
    fn test_custom_interval() {
        let interval = WaitInterval::custom(|attempts| Duration::from_millis(10 * attempts as u64));
        assert_eq!(interval.wait_duration(3), Duration::from_millis(30));
        assert!(interval.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            WaitInterval::fixed(Duration::from_micros(999)).validate(),
            Err(ConfigError::WaitDurationInOpenState)
        );
        assert_eq!(
            WaitInterval::randomized(Duration::from_secs(1), 1.0).validate(),
            Err(ConfigError::RandomizationFactor(1.0))
        );
        assert_eq!(
            WaitInterval::exponential(Duration::from_secs(1), 0.5, Duration::from_secs(10))
                .validate(),
            Err(ConfigError::WaitIntervalMultiplier(0.5))
        );
        assert!(WaitInterval::default().validate().is_ok());
    }
}
