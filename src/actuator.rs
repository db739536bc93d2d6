use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use thiserror::Error;

use crate::analytics::Decision;
use crate::config::ActuatorConfig;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("gpio {chip} line {line}: {source}")]
    Gpio {
        chip: String,
        line: u32,
        #[source]
        source: gpio_cdev::Error,
    },
}

/// A single binary output line.
pub trait Actuator: Send {
    fn set_value(&mut self, level: bool) -> Result<(), ActuatorError>;
}

/// Output line on a Linux GPIO character device, requested low.
pub struct GpioLine {
    handle: LineHandle,
    chip: String,
    line: u32,
}

impl GpioLine {
    pub fn open(config: &ActuatorConfig) -> Result<Self, ActuatorError> {
        let gpio_err = |source| ActuatorError::Gpio {
            chip: config.chip.clone(),
            line: config.line,
            source,
        };

        let mut chip = Chip::new(&config.chip).map_err(gpio_err)?;
        let handle = chip
            .get_line(config.line)
            .and_then(|line| line.request(LineRequestFlags::OUTPUT, 0, &config.consumer))
            .map_err(gpio_err)?;

        tracing::info!(chip = %config.chip, line = config.line, "gpio line acquired");

        Ok(Self {
            handle,
            chip: config.chip.clone(),
            line: config.line,
        })
    }
}

impl Actuator for GpioLine {
    fn set_value(&mut self, level: bool) -> Result<(), ActuatorError> {
        self.handle
            .set_value(u8::from(level))
            .map_err(|source| ActuatorError::Gpio {
                chip: self.chip.clone(),
                line: self.line,
                source,
            })
    }
}

/// Maps accumulator decisions onto the output line.
pub struct ActuatorController {
    line: Box<dyn Actuator>,
    level: Option<bool>,
}

impl ActuatorController {
    pub fn new(line: Box<dyn Actuator>) -> Self {
        Self { line, level: None }
    }

    /// Last level written, `None` until the first write.
    pub fn level(&self) -> Option<bool> {
        self.level
    }

    pub fn set_value(&mut self, level: bool) -> Result<(), ActuatorError> {
        self.line.set_value(level)?;
        self.level = Some(level);
        Ok(())
    }

    pub fn apply(&mut self, decision: Decision) -> Result<(), ActuatorError> {
        let level = decision.actuator_level();
        match decision {
            Decision::Triggered => tracing::info!(level = u8::from(level), "Detected!"),
            Decision::Safe => tracing::debug!(level = u8::from(level), "Safe!"),
        }
        self.set_value(level)
    }
}
