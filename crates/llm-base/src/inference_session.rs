use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use ggml::{CancelToken, ComputationGraph, ComputeError, GraphPlan};
use thiserror::Error;

use crate::language_model::LanguageModel;
use crate::model::ExecutionMemory;
use crate::sampler::Sampler;
use crate::vocabulary::TokenizationError;
use crate::TokenId;

/// A decoded-text payload emitted while a completion streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The text of this chunk. The first chunk of a stream is the prompt
    /// passed through verbatim; later chunks are decoded generated tokens.
    pub text: String,
    /// Whether this is the final chunk of the stream.
    pub is_complete: bool,
    /// Whether the stream ended because the model produced its end-of-text
    /// token, rather than exhausting the requested budget.
    pub is_complete_eos: bool,
}

/// Errors raised while generating a completion.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The prompt could not be tokenized.
    #[error("could not tokenize prompt: {0}")]
    Tokenization(#[from] TokenizationError),
    /// The prompt tokenized to nothing; there is no position to start
    /// generating from.
    #[error("the prompt is empty")]
    EmptyPrompt,
    /// The prompt plus the requested budget does not fit the model's context
    /// window.
    #[error("the context window is full")]
    ContextFull,
    /// The cursor was cancelled (terminated) while executing.
    #[error("the completion was cancelled")]
    Cancelled,
    /// The cursor has already streamed; a new cursor is needed.
    #[error("the cursor is spent")]
    Spent,
    /// The tensor runtime failed. This indicates a bug, not a user error.
    #[error("graph computation failed: {0}")]
    Compute(ComputeError),
}

/// Statistics about one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceStats {
    /// How long the prompt prefill took.
    pub feed_prompt_duration: std::time::Duration,
    /// How many tokens the prompt held.
    pub prompt_tokens: usize,
    /// How long the decode loop took.
    pub predict_duration: std::time::Duration,
    /// The number of generated tokens.
    pub predict_tokens: usize,
}

impl Display for InferenceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "feed_prompt_duration: {}ms\nprompt_tokens: {}\npredict_duration: {}ms\npredict_tokens: {}\nper_token_duration: {:.3}ms",
            self.feed_prompt_duration.as_millis(),
            self.prompt_tokens,
            self.predict_duration.as_millis(),
            self.predict_tokens,
            (self.predict_duration.as_millis() as f64) / (self.predict_tokens as f64),
        )
    }
}

/// A completion cursor: the stateful owner of one autoregressive generation.
///
/// The cursor holds a shared reference to its model (weights are read-only),
/// a private [ExecutionMemory] (scratch and KV cache are never shared), and a
/// ring buffer of the last `chunk_size` sampled tokens that it periodically
/// decodes into [Chunk]s.
///
/// A cursor streams exactly once. After [CompletionCursor::exec_stream]
/// returns, the cursor is spent and further calls fail with
/// [InferenceError::Spent].
pub struct CompletionCursor {
    language_model: Arc<LanguageModel>,
    prompt: String,
    max_tokens: usize,
    n_threads: usize,
    sampler: Box<dyn Sampler>,
    cancel: CancelToken,
    n_past: usize,
    spent: bool,
}

impl CompletionCursor {
    pub(crate) fn new(
        language_model: Arc<LanguageModel>,
        prompt: &str,
        max_tokens: usize,
        sampler: Box<dyn Sampler>,
        n_threads: usize,
    ) -> Self {
        CompletionCursor {
            language_model,
            prompt: prompt.to_owned(),
            max_tokens,
            n_threads,
            sampler,
            cancel: CancelToken::new(),
            n_past: 0,
            spent: false,
        }
    }

    /// The cursor's cancel token. Tripping it makes an in-flight
    /// [CompletionCursor::exec_stream] fail with [InferenceError::Cancelled]
    /// at the next step or graph-node boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The model this cursor generates from.
    pub fn language_model(&self) -> &Arc<LanguageModel> {
        &self.language_model
    }

    /// Runs the generation loop, pushing chunks to `on_chunk` as they are
    /// produced:
    ///
    /// 1. the prompt, verbatim, as the first chunk;
    /// 2. a chunk of `chunk_size` decoded tokens every time the ring fills;
    /// 3. whatever tokens remain past the last full ring, as a final chunk
    ///    with [Chunk::is_complete] set (empty when generation stopped
    ///    exactly on a chunk boundary).
    ///
    /// Generation stops at `num_tokens` tokens (clamped to the cursor's
    /// budget), at the model's end-of-text token, or at cancellation.
    pub fn exec_stream(
        &mut self,
        num_tokens: usize,
        chunk_size: usize,
        mut on_chunk: impl FnMut(Chunk),
    ) -> Result<InferenceStats, InferenceError> {
        if self.spent {
            return Err(InferenceError::Spent);
        }
        self.spent = true;
        assert!(chunk_size >= 1, "chunk_size must be at least 1");

        let lm = self.language_model.clone();
        let hyperparameters = *lm.hyperparameters();
        let num_tokens = num_tokens.min(self.max_tokens);
        let eot = lm.end_of_text_token();

        let prompt_tokens = lm.vocabulary().tokenize(&self.prompt)?;

        // The caller gets the prompt back immediately, without a decode
        // round-trip, so the stream starts with visible output.
        on_chunk(Chunk {
            text: self.prompt.clone(),
            is_complete: num_tokens == 0,
            is_complete_eos: false,
        });
        if num_tokens == 0 {
            return Ok(InferenceStats {
                prompt_tokens: prompt_tokens.len(),
                ..Default::default()
            });
        }

        if prompt_tokens.is_empty() {
            return Err(InferenceError::EmptyPrompt);
        }
        if prompt_tokens.len() + num_tokens > hyperparameters.n_ctx {
            return Err(InferenceError::ContextFull);
        }

        // Scratch sized for the whole stream: the prefill consumes the full
        // prompt at once, while every later step is a single-token query
        // against an ever longer cache. Take whichever is bigger.
        let total_positions = prompt_tokens.len() + num_tokens;
        let scratch_bytes = lm
            .scratch_size(prompt_tokens.len(), prompt_tokens.len())
            .max(lm.scratch_size(1, total_positions));
        let memory = ExecutionMemory::new(scratch_bytes, &hyperparameters);

        let mut ring = vec![0 as TokenId; chunk_size];
        let mut stats = InferenceStats {
            prompt_tokens: prompt_tokens.len(),
            ..Default::default()
        };

        // Prefill: one pass over the whole prompt populates the KV cache and
        // yields the first sampled token.
        let start = Instant::now();
        ring[0] = self.forward_single(&memory, &prompt_tokens)?;
        stats.feed_prompt_duration = start.elapsed();

        let predict_start = Instant::now();
        let mut n_generated = 1;
        let mut hit_eos = eot == Some(ring[0]);

        if n_generated % chunk_size == 0 {
            on_chunk(self.full_ring_chunk(&ring));
        }

        if !hit_eos {
            for i in 1..num_tokens {
                if self.cancel.is_cancelled() {
                    return Err(InferenceError::Cancelled);
                }

                // Single-token step against the cache; this is what keeps
                // decoding linear instead of quadratic.
                let previous = ring[(i - 1) % chunk_size];
                let token = self.forward_single(&memory, &[previous])?;
                ring[i % chunk_size] = token;
                n_generated = i + 1;

                if n_generated % chunk_size == 0 {
                    on_chunk(self.full_ring_chunk(&ring));
                }
                if eot == Some(token) {
                    hit_eos = true;
                    break;
                }
            }
        }
        stats.predict_duration = predict_start.elapsed();
        stats.predict_tokens = n_generated;

        // Flush whatever the ring holds past the last full chunk (possibly
        // nothing, if generation stopped exactly on a boundary).
        let residual = n_generated % chunk_size;
        on_chunk(Chunk {
            text: lm.vocabulary().decode(&ring[..residual]),
            is_complete: true,
            is_complete_eos: hit_eos,
        });

        Ok(stats)
    }

    fn full_ring_chunk(&self, ring: &[TokenId]) -> Chunk {
        Chunk {
            text: self.language_model.vocabulary().decode(ring),
            is_complete: false,
            is_complete_eos: false,
        }
    }

    /// One forward pass plus one sample: consumes `tokens` at positions
    /// `n_past..`, returns the token sampled from the last position's
    /// logits.
    fn forward_single(
        &mut self,
        memory: &ExecutionMemory,
        tokens: &[TokenId],
    ) -> Result<TokenId, InferenceError> {
        let lm = self.language_model.clone();
        let token = {
            let ctx = memory.eval_ctx();
            let mut graph = ComputationGraph::new();
            let logits = lm.model().forward(
                lm.hyperparameters(),
                tokens,
                self.n_past,
                ctx,
                &mut graph,
                memory,
            );
            graph.build_forward_expand(&logits);

            let mut plan = GraphPlan::new(&graph, self.n_threads);
            plan.set_cancel_token(self.cancel.clone());
            graph.compute(&mut plan).map_err(|e| match e {
                ComputeError::Cancelled => InferenceError::Cancelled,
                other => InferenceError::Compute(other),
            })?;

            let logits_data = logits.read_f32s();
            self.sampler
                .sample(&logits_data, &[lm.hyperparameters().n_vocab, tokens.len()])[0]
        };
        self.n_past += tokens.len();
        memory.reset_eval();
        Ok(token)
    }
}

impl Drop for CompletionCursor {
    fn drop(&mut self) {
        // An exec may still be unwinding on another thread; make sure any
        // graph it is driving stops promptly.
        self.cancel.cancel();
    }
}
