//! Decoder-only transformer over a weight container
//!
//! [`LlamaModel`] owns per-layer tensor views and the mutable
//! [`GenerationState`]. Each [`LlamaModel::forward`] call runs one decode
//! step: embed, then per layer RMSNorm → QKV → RoPE → causal GQA attention
//! → residual → RMSNorm → SwiGLU → residual, then a final norm and the
//! vocabulary projection.

use std::sync::Arc;

use tracing::{debug, info};

use super::config::ModelConfig;
use super::container::{TensorView, WeightContainer};
use super::kv_cache::KVCache;
use super::ops::{apply_rope, dot, rms_norm_into, silu, softmax};
use crate::error::{DeltavoxError, Result};
use crate::quantize::{dequantize_row_into, matvec_into};

/// Tensor views and small dequantized vectors for one transformer block
#[derive(Debug, Clone)]
struct LayerWeights {
    attn_norm: Vec<f32>,
    attn_q: TensorView,
    attn_k: TensorView,
    attn_v: TensorView,
    attn_output: TensorView,
    q_bias: Option<Vec<f32>>,
    k_bias: Option<Vec<f32>>,
    v_bias: Option<Vec<f32>>,
    ffn_norm: Vec<f32>,
    ffn_gate: TensorView,
    ffn_up: TensorView,
    ffn_down: TensorView,
}

/// Pre-allocated intermediates reused by every decode step
#[derive(Debug, Clone)]
struct ScratchBuffers {
    residual: Vec<f32>,
    normed: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    attn_out: Vec<f32>,
    proj: Vec<f32>,
    gate: Vec<f32>,
    up: Vec<f32>,
    scores: Vec<f32>,
}

/// Mutable decode state owned by the model
#[derive(Debug, Clone)]
pub struct GenerationState {
    position: usize,
    cache: KVCache,
    hidden: Vec<f32>,
    logits: Vec<f32>,
    scratch: ScratchBuffers,
}

impl GenerationState {
    fn new(config: &ModelConfig) -> Self {
        let hidden = config.hidden_dim;
        let kv = config.kv_dim();
        Self {
            position: 0,
            cache: KVCache::new(config.num_layers, kv, config.max_seq_len),
            hidden: vec![0.0; hidden],
            logits: vec![0.0; config.vocab_size],
            scratch: ScratchBuffers {
                residual: vec![0.0; hidden],
                normed: vec![0.0; hidden],
                q: vec![0.0; hidden],
                k: vec![0.0; kv],
                v: vec![0.0; kv],
                attn_out: vec![0.0; hidden],
                proj: vec![0.0; hidden],
                gate: vec![0.0; config.ffn_dim],
                up: vec![0.0; config.ffn_dim],
                scores: vec![0.0; config.max_seq_len],
            },
        }
    }

    /// Number of positions processed since the last reset
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Final normalized hidden state of the last step
    #[must_use]
    pub fn hidden(&self) -> &[f32] {
        &self.hidden
    }

    /// Logits of the last step
    #[must_use]
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }
}

/// Quantized LLaMA-family decoder
#[derive(Debug)]
pub struct LlamaModel {
    container: Arc<WeightContainer>,
    config: ModelConfig,
    token_embd: TensorView,
    output_norm: Vec<f32>,
    output: TensorView,
    layers: Vec<LayerWeights>,
    state: GenerationState,
}

fn expect_shape(name: &str, view: &TensorView, rows: usize, cols: usize) -> Result<()> {
    if view.rows != rows || view.cols != cols {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!(
                "{name} is [{}, {}], expected [{rows}, {cols}]",
                view.rows, view.cols
            ),
        });
    }
    Ok(())
}

fn small_vector(container: &WeightContainer, name: &str, len: usize) -> Result<Vec<f32>> {
    let values = container.tensor_f32(name)?;
    if values.len() != len {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!("{name} has {} values, expected {len}", values.len()),
        });
    }
    Ok(values)
}

fn optional_vector(
    container: &WeightContainer,
    name: &str,
    len: usize,
) -> Result<Option<Vec<f32>>> {
    if container.try_tensor(name).is_none() {
        return Ok(None);
    }
    small_vector(container, name, len).map(Some)
}

fn add_bias(x: &mut [f32], bias: Option<&Vec<f32>>) {
    if let Some(bias) = bias {
        for (v, b) in x.iter_mut().zip(bias) {
            *v += b;
        }
    }
}

impl LlamaModel {
    /// Bind tensor views for every layer and allocate generation state
    ///
    /// The output projection falls back to the token embedding when
    /// `output.weight` is absent (tied embeddings).
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::MissingTensor`] or
    /// [`DeltavoxError::DimensionMismatch`] if the container does not hold a
    /// model matching `config`.
    pub fn new(container: Arc<WeightContainer>, config: ModelConfig) -> Result<Self> {
        let hidden = config.hidden_dim;
        let kv = config.kv_dim();
        let ffn = config.ffn_dim;
        let vocab = config.vocab_size;

        let token_embd = container.tensor("token_embd.weight")?;
        expect_shape("token_embd.weight", &token_embd, vocab, hidden)?;

        let output = match container.try_tensor("output.weight") {
            Some(view) => view,
            None => {
                debug!("output.weight absent, tying output projection to token_embd");
                token_embd
            },
        };
        expect_shape("output.weight", &output, vocab, hidden)?;
        let output_norm = small_vector(&container, "output_norm.weight", hidden)?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let name = |suffix: &str| format!("blk.{i}.{suffix}");
            let view = |suffix: &str, rows: usize, cols: usize| -> Result<TensorView> {
                let full = name(suffix);
                let v = container.tensor(&full)?;
                expect_shape(&full, &v, rows, cols)?;
                Ok(v)
            };

            layers.push(LayerWeights {
                attn_norm: small_vector(&container, &name("attn_norm.weight"), hidden)?,
                attn_q: view("attn_q.weight", hidden, hidden)?,
                attn_k: view("attn_k.weight", kv, hidden)?,
                attn_v: view("attn_v.weight", kv, hidden)?,
                attn_output: view("attn_output.weight", hidden, hidden)?,
                q_bias: optional_vector(&container, &name("attn_q.bias"), hidden)?,
                k_bias: optional_vector(&container, &name("attn_k.bias"), kv)?,
                v_bias: optional_vector(&container, &name("attn_v.bias"), kv)?,
                ffn_norm: small_vector(&container, &name("ffn_norm.weight"), hidden)?,
                ffn_gate: view("ffn_gate.weight", ffn, hidden)?,
                ffn_up: view("ffn_up.weight", ffn, hidden)?,
                ffn_down: view("ffn_down.weight", hidden, ffn)?,
            });
        }

        info!(
            arch = %config.architecture,
            layers = config.num_layers,
            hidden = config.hidden_dim,
            heads = config.num_heads,
            kv_heads = config.num_kv_heads,
            vocab = config.vocab_size,
            max_seq_len = config.max_seq_len,
            "model ready"
        );

        let state = GenerationState::new(&config);
        Ok(Self {
            container,
            config,
            token_embd,
            output_norm,
            output,
            layers,
            state,
        })
    }

    /// Model dimensions
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Current generation state
    #[must_use]
    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    /// Logits of the last step
    #[must_use]
    pub fn logits(&self) -> &[f32] {
        &self.state.logits
    }

    /// Final hidden state and a mutable view of the logits
    ///
    /// Used to apply logits corrections that read the hidden state.
    pub fn hidden_and_logits_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.state.hidden, &mut self.state.logits)
    }

    /// Zero the key/value cache and position counter
    pub fn reset(&mut self) {
        self.state.cache.reset();
        self.state.position = 0;
        self.state.hidden.fill(0.0);
        self.state.logits.fill(0.0);
    }

    /// Run one decode step for `token` at `position`
    ///
    /// On success the state's logits and hidden vector describe the next
    /// token distribution.
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::RuntimeOverflow`] if `position` is at or past
    /// the sequence limit, and [`DeltavoxError::DimensionMismatch`] for a
    /// token outside the vocabulary.
    pub fn forward(&mut self, token: u32, position: usize) -> Result<()> {
        let config = &self.config;
        if position >= config.max_seq_len {
            return Err(DeltavoxError::RuntimeOverflow {
                position,
                max_seq_len: config.max_seq_len,
            });
        }
        if token as usize >= config.vocab_size {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!("token {token} outside vocabulary of {}", config.vocab_size),
            });
        }

        let container = &*self.container;
        let state = &mut self.state;
        let s = &mut state.scratch;
        let (hd, kv_dim) = (config.head_dim, config.kv_dim());
        let group = config.group_size();
        let scale = 1.0 / (hd as f32).sqrt();
        let seq = position + 1;

        dequantize_row_into(
            self.token_embd.qtype,
            container.row_bytes(&self.token_embd, token as usize),
            &mut s.residual,
        )?;

        let project = |view: &TensorView, x: &[f32], out: &mut [f32]| {
            matvec_into(view.qtype, container.bytes(view), x, view.cols, out)
        };

        for (li, layer) in self.layers.iter().enumerate() {
            rms_norm_into(&s.residual, &layer.attn_norm, config.rms_eps, &mut s.normed);

            project(&layer.attn_q, &s.normed, &mut s.q)?;
            project(&layer.attn_k, &s.normed, &mut s.k)?;
            project(&layer.attn_v, &s.normed, &mut s.v)?;
            add_bias(&mut s.q, layer.q_bias.as_ref());
            add_bias(&mut s.k, layer.k_bias.as_ref());
            add_bias(&mut s.v, layer.v_bias.as_ref());

            let (theta, style) = (config.rope_theta, config.rope_style);
            apply_rope(&mut s.q, config.num_heads, hd, position, theta, style);
            apply_rope(&mut s.k, config.num_kv_heads, hd, position, theta, style);

            state.cache.store(li, position, &s.k, &s.v);
            let keys = state.cache.keys(li, seq);
            let values = state.cache.values(li, seq);

            for h in 0..config.num_heads {
                let kv_off = (h / group) * hd;
                let q_h = &s.q[h * hd..(h + 1) * hd];
                let scores = &mut s.scores[..seq];
                for (t, score) in scores.iter_mut().enumerate() {
                    let k_t = &keys[t * kv_dim + kv_off..t * kv_dim + kv_off + hd];
                    *score = dot(q_h, k_t) * scale;
                }
                softmax(scores);

                let out = &mut s.attn_out[h * hd..(h + 1) * hd];
                out.fill(0.0);
                for (t, &w) in scores.iter().enumerate() {
                    let v_t = &values[t * kv_dim + kv_off..t * kv_dim + kv_off + hd];
                    for (o, &v) in out.iter_mut().zip(v_t) {
                        *o += w * v;
                    }
                }
            }

            project(&layer.attn_output, &s.attn_out, &mut s.proj)?;
            for (r, p) in s.residual.iter_mut().zip(&s.proj) {
                *r += p;
            }

            rms_norm_into(&s.residual, &layer.ffn_norm, config.rms_eps, &mut s.normed);
            project(&layer.ffn_gate, &s.normed, &mut s.gate)?;
            project(&layer.ffn_up, &s.normed, &mut s.up)?;
            for (g, &u) in s.gate.iter_mut().zip(&s.up) {
                *g = silu(*g) * u;
            }
            project(&layer.ffn_down, &s.gate, &mut s.proj)?;
            for (r, p) in s.residual.iter_mut().zip(&s.proj) {
                *r += p;
            }
        }

        rms_norm_into(&s.residual, &self.output_norm, config.rms_eps, &mut state.hidden);
        project(&self.output, &state.hidden, &mut state.logits)?;
        state.position = seq;
        Ok(())
    }
}
