use std::io::BufRead;
use std::sync::Arc;

use ggml::CancelToken;

use crate::hyperparameters::Hyperparameters;
use crate::inference_session::{CompletionCursor, InferenceError, InferenceStats};
use crate::loader::{
    apply_tied_weights, consume_magic, load_weights, LoadError, LoadProgress, ModelConfig,
};
use crate::model::{Model, ModelForward};
use crate::model_desc::{configure_quantization, ModelDescNode};
use crate::sampler::Sampler;
use crate::vocabulary::Vocabulary;
use crate::TokenId;

/// Everything the loader and the cursor need to know about one model family.
/// Architecture crates (GPT-2) export a static of these.
pub struct Architecture {
    /// A short name, used in logs.
    pub name: &'static str,
    /// Derives the weight description tree from the hyperparameters.
    pub model_desc: fn(&Hyperparameters) -> ModelDescNode,
    /// Builds the forward-pass graph.
    pub forward: ModelForward,
    /// Estimates the scratch bytes one pass needs, given how many tokens the
    /// pass consumes (`n_batch`) and how many positions of KV cache it reads
    /// (`n_positions`).
    pub scratch_size:
        fn(hyperparameters: &Hyperparameters, n_batch: usize, n_positions: usize) -> usize,
    /// `(source, destination)` pairs that may be aliased on disk; when the
    /// destination is absent from the stream it is copied from the source
    /// after loading.
    pub tied_weights: &'static [(&'static str, &'static str)],
}

/// A loaded language model: hyperparameters, vocabulary and weights bundled
/// behind one handle, shareable across any number of cursors.
pub struct LanguageModel {
    hyperparameters: Hyperparameters,
    vocabulary: Vocabulary,
    model: Model,
    architecture: &'static Architecture,
    end_of_text: Option<TokenId>,
}

impl LanguageModel {
    /// Reads a model from `reader`: magic, hyperparameters, token
    /// dictionary, then the weight records (§ the on-disk format), applying
    /// the quantization plan in `config` while streaming and aliasing tied
    /// weights at the end.
    pub fn load_from_stream(
        reader: &mut impl BufRead,
        architecture: &'static Architecture,
        config: &ModelConfig,
        mut progress: impl FnMut(LoadProgress),
        cancel: &CancelToken,
    ) -> Result<Self, LoadError> {
        consume_magic(reader)?;
        let hyperparameters = Hyperparameters::read(reader)?;
        progress(LoadProgress::HyperparametersLoaded);
        log::info!(
            "loading {} model: n_vocab={} n_ctx={} n_embd={} n_head={} n_layer={} ftype={}",
            architecture.name,
            hyperparameters.n_vocab,
            hyperparameters.n_ctx,
            hyperparameters.n_embd,
            hyperparameters.n_head,
            hyperparameters.n_layer,
            hyperparameters.file_type,
        );

        let mut desc = (architecture.model_desc)(&hyperparameters);
        if let Some(q) = &config.quantization {
            let include: Vec<&str> = q.include.iter().map(String::as_str).collect();
            let exclude: Vec<&str> = q.exclude.iter().map(String::as_str).collect();
            desc = configure_quantization(&desc, q.target, &include, &exclude)?;
        }

        let vocabulary = Vocabulary::load(reader, hyperparameters.n_vocab)?;
        let (model, context_size) =
            Model::new_from_flattened_desc(&desc, architecture.forward)?;
        progress(LoadProgress::ContextSize {
            bytes: context_size,
        });

        let loaded = load_weights(reader, &model, cancel, &mut progress)?;
        apply_tied_weights(&model, &loaded, architecture.tied_weights)?;

        // Anything described but never written stays zeroed; that is almost
        // always a broken file, so make it visible.
        let written: std::collections::HashSet<&str> = loaded
            .iter()
            .map(String::as_str)
            .chain(architecture.tied_weights.iter().map(|(_, dst)| *dst))
            .collect();
        for path in desc.flatten().keys() {
            if !written.contains(path.as_str()) {
                log::warn!("weight `{path}` was not present in the model stream");
            }
        }

        let end_of_text = vocabulary.end_of_text_token();
        Ok(LanguageModel {
            hyperparameters,
            vocabulary,
            model,
            architecture,
            end_of_text,
        })
    }

    /// The model's hyperparameters.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    /// The model's token dictionary.
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// The model's weights and forward function.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The id of the end-of-text token, when the vocabulary defines one.
    pub fn end_of_text_token(&self) -> Option<TokenId> {
        self.end_of_text
    }

    /// The scratch bytes a forward pass needs: `n_batch` tokens consumed
    /// against `n_positions` positions of KV cache.
    pub fn scratch_size(&self, n_batch: usize, n_positions: usize) -> usize {
        (self.architecture.scratch_size)(&self.hyperparameters, n_batch, n_positions)
    }

    /// Decodes a token sequence to text.
    pub fn decode_tokens(&self, tokens: &[TokenId]) -> String {
        self.vocabulary.decode(tokens)
    }

    /// Creates a cursor that will generate up to `max_tokens` tokens from
    /// `prompt`.
    pub fn create_completion(
        self: &Arc<Self>,
        prompt: &str,
        max_tokens: usize,
        sampler: Box<dyn Sampler>,
        n_threads: usize,
    ) -> CompletionCursor {
        CompletionCursor::new(self.clone(), prompt, max_tokens, sampler, n_threads)
    }

    /// Completes `prompt` in one call, returning the concatenation of every
    /// chunk (prompt included), whether generation hit end-of-text, and the
    /// run's statistics.
    pub fn complete(
        self: &Arc<Self>,
        prompt: &str,
        num_tokens: usize,
        sampler: Box<dyn Sampler>,
        n_threads: usize,
    ) -> Result<(String, bool, InferenceStats), InferenceError> {
        let mut cursor = self.create_completion(prompt, num_tokens, sampler, n_threads);
        let mut text = String::new();
        let mut eos = false;
        let stats = cursor.exec_stream(num_tokens, num_tokens.max(1), |chunk| {
            text.push_str(&chunk.text);
            eos |= chunk.is_complete_eos;
        })?;
        Ok((text, eos, stats))
    }
}
