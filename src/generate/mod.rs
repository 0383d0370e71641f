//! Token sampling
//!
//! Turns raw logits into the next token id:
//!
//! 1. Suppression of a fixed token set ([`TokenSuppressor`])
//! 2. Repetition penalty over a trailing window ([`RepetitionPenalty`])
//! 3. Temperature scaling ([`TemperatureScaler`])
//! 4. Top-k or nucleus selection ([`sample_top_k`], [`sample_top_p`])
//!
//! A non-positive temperature short-circuits to the arg-max.

mod processors;
mod sampler;
pub mod suppression;

pub use processors::{
    LogitProcessor, LogitProcessorContext, RepetitionPenalty, TemperatureScaler, TokenSuppressor,
};
pub use sampler::{sample_top_k, sample_top_p, Sampler, SamplingConfig};
pub use suppression::{contains_cjk, script_suppression_set};
