// =============================================================================
// Logit processors
//
// Composable in-place transforms applied to raw logits before selection:
// suppression, repetition penalty and temperature scaling.
//
// References:
// - Keskar et al. (2019) "CTRL: A Conditional Transformer Language Model"
// - Holtzman et al. (2020) "The Curious Case of Neural Text Degeneration"
// =============================================================================

/// Context available during logit processing
#[derive(Debug, Clone, Copy)]
pub struct LogitProcessorContext<'a> {
    /// Recently emitted tokens, oldest first
    pub recent: &'a [u32],
    /// Current generation step (0-indexed)
    pub step: usize,
}

impl<'a> LogitProcessorContext<'a> {
    /// Create a new context
    #[must_use]
    pub fn new(recent: &'a [u32], step: usize) -> Self {
        Self { recent, step }
    }
}

/// Logit processor trait for composable pre-sampling transforms
///
/// # Example
///
/// ```
/// use deltavox::generate::{LogitProcessor, LogitProcessorContext};
///
/// struct BanFirst;
///
/// impl LogitProcessor for BanFirst {
///     fn process(&self, logits: &mut [f32], _ctx: &LogitProcessorContext) {
///         logits[0] = f32::NEG_INFINITY;
///     }
/// }
///
/// let mut logits = [1.0, 2.0];
/// BanFirst.process(&mut logits, &LogitProcessorContext::new(&[], 0));
/// assert_eq!(logits[0], f32::NEG_INFINITY);
/// ```
pub trait LogitProcessor: Send + Sync {
    /// Process logits in place
    fn process(&self, logits: &mut [f32], ctx: &LogitProcessorContext);

    /// Human-readable name for tracing
    fn name(&self) -> &'static str {
        "unnamed"
    }
}

/// Force a fixed set of tokens to negative infinity
#[derive(Debug, Clone, Copy)]
pub struct TokenSuppressor<'a> {
    suppress_ids: &'a [u32],
}

impl<'a> TokenSuppressor<'a> {
    /// Suppress `suppress_ids`; ids outside the vocabulary are ignored
    #[must_use]
    pub fn new(suppress_ids: &'a [u32]) -> Self {
        Self { suppress_ids }
    }
}

impl LogitProcessor for TokenSuppressor<'_> {
    fn process(&self, logits: &mut [f32], _ctx: &LogitProcessorContext) {
        for &token_id in self.suppress_ids {
            if let Some(logit) = logits.get_mut(token_id as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn name(&self) -> &'static str {
        "token_suppressor"
    }
}

/// Push logits of recently emitted tokens toward zero
///
/// Each distinct token in the trailing window is penalized once: positive
/// logits are divided by the penalty, negative ones multiplied.
#[derive(Debug, Clone, Copy)]
pub struct RepetitionPenalty {
    penalty: f32,
    window: usize,
}

impl RepetitionPenalty {
    /// `penalty` > 1 penalizes; `window` 0 means the whole history
    #[must_use]
    pub fn new(penalty: f32, window: usize) -> Self {
        Self { penalty, window }
    }
}

impl LogitProcessor for RepetitionPenalty {
    fn process(&self, logits: &mut [f32], ctx: &LogitProcessorContext) {
        if self.penalty <= 1.0 {
            return;
        }
        let tokens = if self.window > 0 && ctx.recent.len() > self.window {
            &ctx.recent[ctx.recent.len() - self.window..]
        } else {
            ctx.recent
        };

        let mut distinct = tokens.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        for token_id in distinct {
            if let Some(logit) = logits.get_mut(token_id as usize) {
                *logit = if *logit > 0.0 {
                    *logit / self.penalty
                } else {
                    *logit * self.penalty
                };
            }
        }
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Divide logits by the temperature
///
/// Non-positive temperatures leave logits unchanged; callers select the
/// arg-max instead.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureScaler {
    temperature: f32,
}

impl TemperatureScaler {
    /// Create a new temperature scaler
    #[must_use]
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }
}

impl LogitProcessor for TemperatureScaler {
    fn process(&self, logits: &mut [f32], _ctx: &LogitProcessorContext) {
        if self.temperature > 0.0 && (self.temperature - 1.0).abs() > 1e-6 {
            let inv = 1.0 / self.temperature;
            for logit in logits.iter_mut() {
                *logit *= inv;
            }
        }
    }

    fn name(&self) -> &'static str {
        "temperature_scaler"
    }
}
