//! Randomized fault injection for exercising the phase pipeline.
//!
//! Only compiled with the `fault-injection` feature. Each phase run may be
//! delayed and may fail outright with the configured probabilities.

use std::thread;
use std::time::Duration;

use crate::config::RouterConfig;
use crate::error::{RouterError, RouterResult};

#[derive(Debug, Clone)]
pub struct FaultInjector {
    delay_probability: f64,
    failure_probability: f64,
    max_delay: Duration,
}

impl FaultInjector {
    pub fn new(delay_probability: f64, failure_probability: f64, max_delay: Duration) -> Self {
        Self {
            delay_probability: delay_probability.clamp(0.0, 1.0),
            failure_probability: failure_probability.clamp(0.0, 1.0),
            max_delay,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            config.fault_delay_probability,
            config.fault_failure_probability,
            Duration::from_millis(config.fault_max_delay_ms),
        )
    }

    /// Sleeps and/or fails at random. Runs on the worker thread.
    pub fn inject(&self) -> RouterResult<()> {
        if fastrand::f64() < self.delay_probability {
            let millis = self.max_delay.as_millis() as u64;
            let delay = Duration::from_millis(fastrand::u64(0..=millis));
            log::debug!("injecting {:?} delay", delay);
            thread::sleep(delay);
        }
        if fastrand::f64() < self.failure_probability {
            log::debug!("injecting failure");
            return Err(RouterError::application("injected fault"));
        }
        Ok(())
    }
}
