//! Field state: an external source of sampling temperature and bias
//!
//! The generation loop consults a [`FieldSource`] once per token. It may
//! override the temperature, tighten top-k through its destiny bias and
//! dampen the logits in place. [`NullField`] defers everything to the
//! caller; [`FieldKernel`] is an in-process state machine driven by a small
//! line-oriented command language:
//!
//! ```text
//! # comments start with '#' or '//'
//! PROPHECY 7
//! DESTINY 0.6
//! VELOCITY RUN
//! BASE_TEMP 1.1
//! PAIN 0.3
//! TENSION 0.2
//! PROPHECY_DEBT 1.5
//! RESET_DEBT
//! RESET_FIELD
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::error::{DeltavoxError, Result};

/// Movement mode; scales the base temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VelocityMode {
    /// ×0.5
    #[serde(rename = "NOMOVE")]
    NoMove,
    /// ×0.85
    Walk,
    /// ×1.2
    Run,
    /// ×0.7
    Backward,
}

impl VelocityMode {
    /// Temperature multiplier for this mode
    #[must_use]
    pub fn temperature_multiplier(self) -> f32 {
        match self {
            Self::NoMove => 0.5,
            Self::Walk => 0.85,
            Self::Run => 1.2,
            Self::Backward => 0.7,
        }
    }
}

impl FromStr for VelocityMode {
    type Err = DeltavoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NOMOVE" | "NO_MOVE" => Ok(Self::NoMove),
            "WALK" => Ok(Self::Walk),
            "RUN" => Ok(Self::Run),
            "BACKWARD" => Ok(Self::Backward),
            other => Err(DeltavoxError::InvalidConfiguration {
                reason: format!("unknown velocity mode {other:?}"),
            }),
        }
    }
}

impl fmt::Display for VelocityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoMove => "NOMOVE",
            Self::Walk => "WALK",
            Self::Run => "RUN",
            Self::Backward => "BACKWARD",
        };
        f.write_str(name)
    }
}

/// Field scalars recorded alongside each stored conversation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldSnapshot {
    /// Effective temperature (0 when the field defers)
    pub temperature: f32,
    /// Destiny bias
    pub destiny: f32,
    /// Pain
    pub pain: f32,
    /// Tension
    pub tension: f32,
    /// Prophecy debt
    pub debt: f32,
    /// Movement mode
    pub velocity: VelocityMode,
}

/// Read/mutate interface the generation loop depends on
pub trait FieldSource: Send {
    /// Sampling temperature; `<= 0` defers to the caller's
    fn temperature(&self) -> f32;

    /// Bias toward determinism; above 0.5 it shrinks top-k
    fn destiny_bias(&self) -> f32;

    /// Dampen logits in place
    fn apply_suffering_to_logits(&self, logits: &mut [f32]);

    /// Advance the field once per generated token
    fn step(&mut self, dt: f32);

    /// Current scalars
    fn snapshot(&self) -> FieldSnapshot;
}

/// A field that never intervenes
#[derive(Debug, Clone, Copy, Default)]
pub struct NullField;

impl FieldSource for NullField {
    fn temperature(&self) -> f32 {
        0.0
    }

    fn destiny_bias(&self) -> f32 {
        0.0
    }

    fn apply_suffering_to_logits(&self, _logits: &mut [f32]) {}

    fn step(&mut self, _dt: f32) {}

    fn snapshot(&self) -> FieldSnapshot {
        FieldSnapshot {
            temperature: 0.0,
            destiny: 0.0,
            pain: 0.0,
            tension: 0.0,
            debt: 0.0,
            velocity: VelocityMode::Walk,
        }
    }
}

/// Debt multiplier applied on every step
pub const DEBT_DECAY: f32 = 0.998;

/// In-process field state machine
#[derive(Debug, Clone, PartialEq)]
pub struct FieldKernel {
    prophecy: u32,
    destiny: f32,
    pain: f32,
    tension: f32,
    dissonance: f32,
    debt: f32,
    velocity: VelocityMode,
    base_temperature: f32,
    effective_temperature: f32,
    elapsed: f32,
}

impl Default for FieldKernel {
    fn default() -> Self {
        let mut kernel = Self {
            prophecy: 7,
            destiny: 0.35,
            pain: 0.0,
            tension: 0.0,
            dissonance: 0.0,
            debt: 0.0,
            velocity: VelocityMode::Walk,
            base_temperature: 1.0,
            effective_temperature: 0.0,
            elapsed: 0.0,
        };
        kernel.update_temperature();
        kernel
    }
}

fn invalid(line: &str, reason: impl fmt::Display) -> DeltavoxError {
    DeltavoxError::InvalidConfiguration {
        reason: format!("field command {line:?}: {reason}"),
    }
}

fn parse_arg<T: FromStr>(line: &str, arg: Option<&str>) -> Result<T> {
    let arg = arg.ok_or_else(|| invalid(line, "missing argument"))?;
    arg.parse()
        .map_err(|_| invalid(line, format_args!("cannot parse {arg:?}")))
}

impl FieldKernel {
    /// Kernel with default state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update_temperature(&mut self) {
        self.effective_temperature = self.base_temperature * self.velocity.temperature_multiplier();
    }

    /// Prophecy horizon
    #[must_use]
    pub fn prophecy(&self) -> u32 {
        self.prophecy
    }

    /// Base temperature before the velocity multiplier
    #[must_use]
    pub fn base_temperature(&self) -> f32 {
        self.base_temperature
    }

    /// Accumulated step time
    #[must_use]
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// Clear suffering and debt; prophecy, destiny and velocity are kept
    pub fn reset_field(&mut self) {
        self.pain = 0.0;
        self.tension = 0.0;
        self.dissonance = 0.0;
        self.debt = 0.0;
    }

    /// Clear prophecy debt
    pub fn reset_debt(&mut self) {
        self.debt = 0.0;
    }

    /// Execute one command line; blank lines and comments are ignored
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::InvalidConfiguration`] for an unknown
    /// command or a malformed argument.
    pub fn exec_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            return Ok(());
        }
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default().to_ascii_uppercase();
        let arg = parts.next();

        match command.as_str() {
            "PROPHECY" => self.prophecy = parse_arg::<u32>(line, arg)?.max(1),
            "DESTINY" => self.destiny = parse_arg::<f32>(line, arg)?.clamp(0.0, 1.0),
            "PAIN" => self.pain = parse_arg::<f32>(line, arg)?.clamp(0.0, 1.0),
            "TENSION" => self.tension = parse_arg::<f32>(line, arg)?.clamp(0.0, 1.0),
            "PROPHECY_DEBT" => self.debt = parse_arg::<f32>(line, arg)?.max(0.0),
            "BASE_TEMP" => {
                self.base_temperature = parse_arg::<f32>(line, arg)?.max(0.0);
                self.update_temperature();
            },
            "VELOCITY" => {
                self.velocity = arg
                    .ok_or_else(|| invalid(line, "missing argument"))?
                    .parse()?;
                self.update_temperature();
            },
            "RESET_FIELD" => self.reset_field(),
            "RESET_DEBT" => self.reset_debt(),
            _ => return Err(invalid(line, "unknown command")),
        }
        debug!(command = %command, "field command applied");
        Ok(())
    }

    /// Execute every line of `script`, stopping at the first error
    ///
    /// # Errors
    ///
    /// See [`FieldKernel::exec_line`].
    pub fn exec(&mut self, script: &str) -> Result<()> {
        script.lines().try_for_each(|line| self.exec_line(line))
    }

    /// Execute a script file
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Io`] if the file cannot be read, otherwise
    /// see [`FieldKernel::exec_line`].
    pub fn exec_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let script = std::fs::read_to_string(path).map_err(|e| DeltavoxError::io(path, e))?;
        self.exec(&script)
    }
}

impl FieldSource for FieldKernel {
    fn temperature(&self) -> f32 {
        self.effective_temperature
    }

    fn destiny_bias(&self) -> f32 {
        self.destiny
    }

    fn apply_suffering_to_logits(&self, logits: &mut [f32]) {
        let suffering = (self.pain * 0.7 + self.tension * 0.3).clamp(0.0, 1.0);
        if suffering <= 0.0 {
            return;
        }
        let factor = 1.0 - 0.5 * suffering;
        for logit in logits.iter_mut() {
            *logit *= factor;
        }
    }

    fn step(&mut self, dt: f32) {
        self.elapsed += dt;
        self.debt *= DEBT_DECAY;
        self.dissonance *= DEBT_DECAY;
        self.update_temperature();
    }

    fn snapshot(&self) -> FieldSnapshot {
        FieldSnapshot {
            temperature: self.effective_temperature,
            destiny: self.destiny,
            pain: self.pain,
            tension: self.tension,
            debt: self.debt,
            velocity: self.velocity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let kernel = FieldKernel::new();
        assert_eq!(kernel.prophecy(), 7);
        assert!((kernel.base_temperature() - 1.0).abs() < 1e-6);
        assert!((kernel.temperature() - 0.85).abs() < 1e-6);
        assert_eq!(kernel.snapshot().velocity, VelocityMode::Walk);
    }

    #[test]
    fn test_velocity_scales_temperature() {
        let mut kernel = FieldKernel::new();
        kernel.exec_line("VELOCITY RUN").unwrap();
        assert!((kernel.temperature() - 1.2).abs() < 1e-6);
        kernel.exec_line("velocity nomove").unwrap();
        assert!((kernel.temperature() - 0.5).abs() < 1e-6);
        kernel.exec("BASE_TEMP 2.0\nVELOCITY BACKWARD").unwrap();
        assert!((kernel.temperature() - 1.4).abs() < 1e-6);
    }

    #[test]
    fn test_debt_decays_per_step() {
        let mut kernel = FieldKernel::new();
        kernel.exec_line("PROPHECY_DEBT 5.0").unwrap();
        for _ in 0..200 {
            kernel.step(0.05);
        }
        let expected = 5.0 * DEBT_DECAY.powi(200);
        assert!((kernel.snapshot().debt - expected).abs() < 1e-3);
        assert!((kernel.elapsed() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_suffering_moves_logits_toward_zero() {
        let mut kernel = FieldKernel::new();
        kernel.exec("PAIN 0.8\nTENSION 0.6").unwrap();
        let original = [10.0f32, -5.0, 3.0, -8.0, 1.0];
        let mut logits = original;
        kernel.apply_suffering_to_logits(&mut logits);
        // suffering = 0.74, factor = 0.63
        for (after, before) in logits.iter().zip(original) {
            assert!((after - before * 0.63).abs() < 1e-4);
        }
    }

    #[test]
    fn test_no_suffering_is_identity() {
        let kernel = FieldKernel::new();
        let mut logits = [1.5f32, -2.0];
        kernel.apply_suffering_to_logits(&mut logits);
        assert_eq!(logits, [1.5, -2.0]);
    }

    #[test]
    fn test_reset_field_keeps_configuration() {
        let mut kernel = FieldKernel::new();
        kernel
            .exec("PROPHECY 42\nDESTINY 0.9\nPAIN 0.8\nTENSION 0.5\nPROPHECY_DEBT 3\nRESET_FIELD")
            .unwrap();
        let s = kernel.snapshot();
        assert_eq!(kernel.prophecy(), 42);
        assert!((s.destiny - 0.9).abs() < 1e-6);
        assert_eq!((s.pain, s.tension, s.debt), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_comments_and_errors() {
        let mut kernel = FieldKernel::new();
        kernel.exec("# header\n// note\n\n  DESTINY 0.35  ").unwrap();
        assert!((kernel.destiny_bias() - 0.35).abs() < 1e-6);

        assert!(kernel.exec_line("WORMHOLE 1").is_err());
        assert!(kernel.exec_line("DESTINY").is_err());
        assert!(kernel.exec_line("DESTINY lots").is_err());
        assert!(kernel.exec_line("VELOCITY SIDEWAYS").is_err());
    }

    #[test]
    fn test_exec_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.amk");
        std::fs::write(&path, "PROPHECY 13\nVELOCITY RUN\n").unwrap();
        let mut kernel = FieldKernel::new();
        kernel.exec_file(&path).unwrap();
        assert_eq!(kernel.prophecy(), 13);
        assert!(kernel.exec_file(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_null_field_defers() {
        let mut field = NullField;
        field.step(0.05);
        let mut logits = [3.0f32];
        field.apply_suffering_to_logits(&mut logits);
        assert_eq!(logits, [3.0]);
        assert_eq!(field.temperature(), 0.0);
        assert_eq!(field.destiny_bias(), 0.0);
    }
}
