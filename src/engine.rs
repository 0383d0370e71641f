//! Generation driver
//!
//! [`Engine`] owns the weight container, model, vocabulary and the optional
//! delta correction. Every mutable piece of generation state sits behind one
//! mutex, so calls to [`Engine::generate`] against the same engine run one at
//! a time. A collaborator that calls back into the engine from the thread
//! currently generating gets [`DeltavoxError::Reentrant`] instead of a
//! deadlock.
//!
//! Per generated token the loop:
//!
//! 1. steps the field
//! 2. applies the delta correction when one is loaded and alpha > 0
//! 3. lets the field dampen the logits
//! 4. suppresses CJK tokens unless the correction is active
//! 5. samples and feeds the token back through the model

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::delta::DeltaVoice;
use crate::error::{DeltavoxError, Result};
use crate::field::{FieldKernel, FieldSource, NullField};
use crate::generate::{script_suppression_set, Sampler, SamplingConfig};
use crate::gguf::{LlamaModel, ModelConfig, WeightContainer};
use crate::memory::{JsonlMemory, MemoryRecord, MemoryStore, NullMemory};
use crate::tokenizer::Vocabulary;

/// Extra tokens allowed past `max_tokens` while waiting for a sentence end
pub const GRACE_TOKENS: usize = 32;

/// Output ceiling in bytes
pub const MAX_OUTPUT_BYTES: usize = 4096;

/// Field time step per generated token
pub const FIELD_DT: f32 = 0.05;

/// Destiny bias above which top-k shrinks
const DESTINY_THRESHOLD: f32 = 0.5;

/// Smallest top-k the destiny bias can force
const MIN_TOP_K: usize = 3;

/// Bytes that end a sentence during the grace window
const SENTENCE_END: [u8; 4] = [b'.', b'!', b'?', b'\n'];

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// End-of-sequence or end-of-turn token sampled
    EndOfSequence,
    /// Sentence terminator emitted inside the grace window
    SentenceEnd,
    /// Grace window exhausted
    MaxTokens,
    /// Output reached [`MAX_OUTPUT_BYTES`]
    ByteLimit,
    /// Position reached the model's sequence limit
    SequenceLimit,
}

/// Result of one [`Engine::generate`] call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Decoded response
    pub text: String,
    /// Sampled token ids, excluding the stop token
    pub tokens: Vec<u32>,
    /// Why the loop ended
    pub stop_reason: StopReason,
}

struct EngineState {
    model: LlamaModel,
    sampler: Sampler,
    delta: Option<DeltaVoice>,
    alpha: f32,
    field: Box<dyn FieldSource>,
}

/// Clears the owner slot when a generation ends, including by panic
struct OwnerGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Lock-guarded inference engine
pub struct Engine {
    config: RuntimeConfig,
    model_config: ModelConfig,
    vocab: Vocabulary,
    suppress: Vec<u32>,
    memory: Arc<dyn MemoryStore>,
    state: Mutex<EngineState>,
    owner: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("model_config", &self.model_config)
            .field("vocab_size", &self.vocab.len())
            .field("suppressed", &self.suppress.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Load weights, vocabulary and optional collaborators from `config`
    ///
    /// # Errors
    ///
    /// Container, model-shape and configuration errors abort construction.
    /// A delta that fails to load is logged and left disabled.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let config = config.validate()?;
        let container = Arc::new(WeightContainer::load(&config.weights_path)?);
        Self::build(container, config)
    }

    /// Build from an already loaded container
    ///
    /// `config.weights_path` is not opened.
    ///
    /// # Errors
    ///
    /// See [`Engine::new`].
    pub fn from_container(container: Arc<WeightContainer>, config: RuntimeConfig) -> Result<Self> {
        Self::build(container, config.validate()?)
    }

    /// `config` must already be validated
    fn build(container: Arc<WeightContainer>, config: RuntimeConfig) -> Result<Self> {
        let model_config = ModelConfig::from_gguf(container.directory(), config.max_seq_len)?;
        let vocab = Vocabulary::from_gguf(container.directory())?;
        let model = LlamaModel::new(container, model_config.clone())?;
        let suppress = script_suppression_set(&vocab);

        let delta = config
            .delta_path
            .as_deref()
            .and_then(|path| match load_validated(path, &model_config) {
                Ok(delta) => Some(delta),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "delta disabled");
                    None
                }
            });

        let field: Box<dyn FieldSource> = match &config.field_script {
            Some(path) => {
                let mut kernel = FieldKernel::new();
                kernel.exec_file(path)?;
                Box::new(kernel)
            }
            None => Box::new(NullField),
        };
        let memory: Arc<dyn MemoryStore> = match &config.memory_log {
            Some(path) => Arc::new(JsonlMemory::new(path)),
            None => Arc::new(NullMemory),
        };

        info!(
            architecture = %model_config.architecture,
            layers = model_config.num_layers,
            hidden = model_config.hidden_dim,
            vocab = vocab.len(),
            max_seq_len = model_config.max_seq_len,
            suppressed = suppress.len(),
            delta = delta.is_some(),
            "engine ready"
        );

        let state = EngineState {
            model,
            sampler: Sampler::new(config.seed),
            delta,
            alpha: config.alpha,
            field,
        };
        Ok(Self {
            config,
            model_config,
            vocab,
            suppress,
            memory,
            state: Mutex::new(state),
            owner: Mutex::new(None),
        })
    }

    /// Replace the field collaborator
    #[must_use]
    pub fn with_field(mut self, field: Box<dyn FieldSource>) -> Self {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner).field = field;
        self
    }

    /// Replace the memory collaborator
    #[must_use]
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    /// Validated runtime settings
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Model shape
    #[must_use]
    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    /// Tokenizer
    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>> {
        let current = thread::current().id();
        if *self.owner.lock().unwrap_or_else(PoisonError::into_inner) == Some(current) {
            return Err(DeltavoxError::Reentrant);
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Load and attach a delta archive
    ///
    /// The archive is read before the engine lock is taken.
    ///
    /// # Errors
    ///
    /// Returns the load or validation error; the engine is then left without
    /// a delta.
    pub fn load_delta(&self, path: impl AsRef<Path>) -> Result<()> {
        let loaded = load_validated(path.as_ref(), &self.model_config);
        let mut state = self.lock_state()?;
        match loaded {
            Ok(delta) => {
                info!(rank = delta.rank(), alpha = state.alpha, "delta attached");
                state.delta = Some(delta);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "delta rejected, correction disabled");
                state.delta = None;
                Err(e)
            }
        }
    }

    /// Set the blend strength, clamped to `[0, 1]`
    ///
    /// # Errors
    ///
    /// [`DeltavoxError::Reentrant`] from inside a generation.
    pub fn set_alpha(&self, alpha: f32) -> Result<()> {
        let alpha = if alpha.is_nan() { 0.0 } else { alpha.clamp(0.0, 1.0) };
        self.lock_state()?.alpha = alpha;
        info!(alpha, "alpha set");
        Ok(())
    }

    /// Current blend strength
    ///
    /// # Errors
    ///
    /// [`DeltavoxError::Reentrant`] from inside a generation.
    pub fn alpha(&self) -> Result<f32> {
        Ok(self.lock_state()?.alpha)
    }

    /// Whether a delta is attached
    ///
    /// # Errors
    ///
    /// [`DeltavoxError::Reentrant`] from inside a generation.
    pub fn has_delta(&self) -> Result<bool> {
        Ok(self.lock_state()?.delta.is_some())
    }

    /// Generate with the configured token budget and sampling settings
    ///
    /// # Errors
    ///
    /// See [`Engine::generate_with`].
    pub fn generate(&self, prompt: &str) -> Result<GenerationOutput> {
        self.generate_with(prompt, self.config.max_tokens, &self.config.sampling())
    }

    /// Generate a response to `prompt`
    ///
    /// Hitting the sequence limit ends the call early with the text produced
    /// so far. On completion a [`MemoryRecord`] is handed to the memory
    /// collaborator on a detached thread.
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Reentrant`] when called from the thread
    /// already generating on this engine.
    pub fn generate_with(
        &self,
        prompt: &str,
        max_tokens: usize,
        sampling: &SamplingConfig,
    ) -> Result<GenerationOutput> {
        let mut state = self.lock_state()?;
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        let _owner = OwnerGuard(&self.owner);

        let output = self.run(&mut state, prompt, max_tokens, sampling)?;
        debug!(
            tokens = output.tokens.len(),
            bytes = output.text.len(),
            stop = ?output.stop_reason,
            "generation finished"
        );

        let record = MemoryRecord {
            prompt: prompt.to_string(),
            response: output.text.clone(),
            field: state.field.snapshot(),
            alpha: state.alpha,
        };
        let memory = Arc::clone(&self.memory);
        thread::spawn(move || {
            if let Err(e) = memory.store(&record) {
                warn!(error = %e, "memory store failed");
            }
        });

        Ok(output)
    }

    fn run(
        &self,
        state: &mut EngineState,
        prompt: &str,
        max_tokens: usize,
        sampling: &SamplingConfig,
    ) -> Result<GenerationOutput> {
        let EngineState {
            model,
            sampler,
            delta,
            alpha,
            field,
        } = state;
        let alpha = *alpha;
        let max_seq_len = self.model_config.max_seq_len;

        let prompt_ids = self.vocab.encode(&self.config.format_prompt(prompt), false);
        model.reset();
        let mut pos = 0;
        for &id in &prompt_ids {
            if pos + 1 >= max_seq_len {
                warn!(prompt_tokens = prompt_ids.len(), max_seq_len, "prompt truncated");
                break;
            }
            model.forward(id, pos)?;
            pos += 1;
        }

        let correcting = delta.is_some() && alpha > 0.0;
        let suppress: &[u32] = if correcting { &[] } else { &self.suppress };
        let stop_ids = [self.vocab.eos_id(), self.vocab.end_of_turn_id()];

        let mut out = Vec::new();
        let mut tokens = Vec::new();
        let mut recent: Vec<u32> = Vec::with_capacity(sampling.repetition_window + 1);
        let mut stop_reason = StopReason::MaxTokens;

        for i in 0..max_tokens + GRACE_TOKENS {
            if out.len() >= MAX_OUTPUT_BYTES {
                stop_reason = StopReason::ByteLimit;
                break;
            }
            if i >= max_tokens && out.last().is_some_and(|b| SENTENCE_END.contains(b)) {
                stop_reason = StopReason::SentenceEnd;
                break;
            }

            field.step(FIELD_DT);
            let (hidden, logits) = model.hidden_and_logits_mut();
            if let (Some(delta), true) = (delta.as_mut(), correcting) {
                delta.apply_to_logits(logits, hidden, alpha)?;
            }
            field.apply_suffering_to_logits(logits);

            let step = SamplingConfig {
                temperature: effective_temperature(field.temperature(), sampling.temperature),
                top_k: effective_top_k(sampling.top_k, field.destiny_bias()),
                ..*sampling
            };
            let next = sampler.sample(logits, &step, &recent, suppress);

            recent.push(next);
            if recent.len() > sampling.repetition_window {
                recent.remove(0);
            }
            if stop_ids.contains(&Some(next)) {
                stop_reason = StopReason::EndOfSequence;
                break;
            }

            out.extend_from_slice(self.vocab.decode_token(next));
            tokens.push(next);

            match model.forward(next, pos) {
                Ok(()) => {}
                Err(DeltavoxError::RuntimeOverflow { position, max_seq_len }) => {
                    warn!(position, max_seq_len, "sequence limit hit mid-generation");
                    stop_reason = StopReason::SequenceLimit;
                    break;
                }
                Err(e) => return Err(e),
            }
            pos += 1;
            if pos >= max_seq_len {
                stop_reason = StopReason::SequenceLimit;
                break;
            }
        }

        Ok(GenerationOutput {
            text: String::from_utf8_lossy(&out).into_owned(),
            tokens,
            stop_reason,
        })
    }
}

fn load_validated(path: &Path, config: &ModelConfig) -> Result<DeltaVoice> {
    let delta = DeltaVoice::load(path)?;
    delta.validate(config.vocab_size, config.hidden_dim)?;
    Ok(delta)
}

/// Field temperature when positive, otherwise the requested one
fn effective_temperature(field: f32, requested: f32) -> f32 {
    if field > 0.0 {
        field
    } else {
        requested
    }
}

/// Shrink `top_k` as destiny bias rises past the threshold
fn effective_top_k(top_k: usize, destiny: f32) -> usize {
    if destiny > DESTINY_THRESHOLD {
        let shrunk = (top_k as f32 * (1.0 - 0.8 * destiny)) as usize;
        shrunk.max(MIN_TOP_K)
    } else {
        top_k
    }
}
