//! The base of the `llm` ecosystem: the model file loader, the GPT-2
//! byte-level tokenizer, pluggable samplers, and the completion cursor that
//! drives autoregressive generation over the [ggml] runtime.
//!
//! Model architectures (currently GPT-2) live in their own crates and plug in
//! through [Architecture].
#![deny(missing_docs)]

mod hyperparameters;
mod inference_session;
mod language_model;
mod loader;
mod model;
mod model_desc;
mod sampler;
mod vocabulary;

pub use ggml;

pub use hyperparameters::{FileType, Hyperparameters};
pub use inference_session::{Chunk, CompletionCursor, InferenceError, InferenceStats};
pub use language_model::{Architecture, LanguageModel};
pub use loader::{
    estimate_model_size, load_progress_logger, LoadError, LoadProgress, ModelConfig,
    QuantizationConfig,
};
pub use model::{ExecutionMemory, Model, ModelForward};
pub use model_desc::{configure_quantization, ModelDescLeaf, ModelDescNode};
pub use sampler::{ArgmaxSampler, Sampler, TopKTopPSampler};
pub use vocabulary::{TokenizationError, Vocabulary};

/// The identifier of a token in a model's vocabulary.
pub type TokenId = i32;

/// The byte string marking end-of-text in the GPT-2 vocabulary.
pub const END_OF_TEXT_TOKEN: &str = "<|endoftext|>";
