//! This crate provides a unified interface for loading and using GPT-style
//! language models. At present the only supported architecture is
//! [GPT-2](models::gpt2), running on the self-contained [ggml] runtime.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! // load a model from disk
//! let file = std::fs::File::open("/path/to/model.bin").unwrap();
//! let mut reader = std::io::BufReader::new(file);
//! let model = Arc::new(
//!     llm::LanguageModel::load_from_stream(
//!         &mut reader,
//!         &llm::models::gpt2::GPT2,
//!         &llm::ModelConfig::default(),
//!         llm::load_progress_logger,
//!         &llm::ggml::CancelToken::new(),
//!     )
//!     .unwrap_or_else(|err| panic!("failed to load model: {err}")),
//! );
//!
//! // use the model to generate text from a prompt
//! let mut cursor = model.create_completion(
//!     "Rust is a cool programming language because",
//!     128,
//!     Box::new(llm::ArgmaxSampler),
//!     4,
//! );
//! cursor
//!     .exec_stream(128, 8, |chunk| print!("{}", chunk.text))
//!     .unwrap();
//! ```
#![deny(missing_docs)]

pub use llm_base::{
    configure_quantization, estimate_model_size, ggml, load_progress_logger, Architecture,
    ArgmaxSampler, Chunk, CompletionCursor, ExecutionMemory, FileType, Hyperparameters,
    InferenceError, InferenceStats, LanguageModel, LoadError, LoadProgress, Model, ModelConfig,
    ModelDescLeaf, ModelDescNode, ModelForward, QuantizationConfig, Sampler, TokenId,
    TokenizationError, TopKTopPSampler, Vocabulary, END_OF_TEXT_TOKEN,
};

/// All available model architectures.
pub mod models {
    #[cfg(feature = "gpt2")]
    pub use llm_gpt2 as gpt2;
}
