use std::collections::HashMap;
use std::io::BufRead;

use ggml::util;
use thiserror::Error;

use crate::loader::LoadError;
use crate::{TokenId, END_OF_TEXT_TOKEN};

/// The GPT-2 pre-tokenization split. The `(?!\S)` lookahead is why this is a
/// `fancy_regex` pattern.
const GPT_SPLIT_REGEX: &str =
    r"('s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+)";

/// Errors encountered while tokenizing text.
#[derive(Debug, Error)]
pub enum TokenizationError {
    /// The pre-tokenization regex failed to run (e.g. backtracking limits).
    #[error("could not split input into words: {0}")]
    Split(#[from] fancy_regex::Error),
}

/// A bijection between token ids and byte strings, plus the greedy
/// longest-prefix tokenizer that goes with the GPT-2 vocabulary.
pub struct Vocabulary {
    id_to_token: Vec<Vec<u8>>,
    token_to_id: HashMap<Vec<u8>, TokenId>,
    split_regex: fancy_regex::Regex,
}

impl Vocabulary {
    /// Builds a vocabulary from an ordered list of token byte strings.
    pub fn new(tokens: Vec<Vec<u8>>) -> Self {
        let token_to_id = tokens
            .iter()
            .enumerate()
            .map(|(i, tok)| (tok.clone(), i as TokenId))
            .collect();
        Vocabulary {
            id_to_token: tokens,
            token_to_id,
            split_regex: fancy_regex::Regex::new(GPT_SPLIT_REGEX)
                .expect("the GPT-2 split regex is valid"),
        }
    }

    /// Reads the token dictionary section of a model stream: a vocabulary
    /// size check followed by `n_vocab` length-prefixed byte strings.
    pub fn load(reader: &mut dyn BufRead, n_vocab: usize) -> Result<Self, LoadError> {
        let n_vocab_check = util::read_i32(reader)?;
        if n_vocab_check != n_vocab as i32 {
            return Err(LoadError::InvariantBroken {
                invariant: format!(
                    "vocabulary length {n_vocab_check} does not match hyperparameter n_vocab \
                     {n_vocab}"
                ),
            });
        }
        let mut tokens = Vec::with_capacity(n_vocab);
        for _ in 0..n_vocab {
            let len = util::read_u32(reader)? as usize;
            tokens.push(util::read_bytes_with_len(reader, len)?);
        }
        Ok(Self::new(tokens))
    }

    /// The number of tokens in the vocabulary.
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    /// Whether the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// The byte string of token `id`.
    pub fn token(&self, id: TokenId) -> &[u8] {
        &self.id_to_token[id as usize]
    }

    /// Looks up a byte string in the vocabulary.
    pub fn id(&self, token: &[u8]) -> Option<TokenId> {
        self.token_to_id.get(token).copied()
    }

    /// The id of the end-of-text token, if the vocabulary has one.
    pub fn end_of_text_token(&self) -> Option<TokenId> {
        self.id(END_OF_TEXT_TOKEN.as_bytes())
    }

    /// Decodes a sequence of token ids by concatenating their byte strings.
    /// Invalid UTF-8 at the boundary is replaced, never panicked on.
    pub fn decode(&self, tokens: &[TokenId]) -> String {
        let mut bytes = Vec::new();
        for &id in tokens {
            bytes.extend_from_slice(self.token(id));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Tokenizes text: split with the GPT-2 regex, then greedy longest-prefix
    /// match of each word against the vocabulary. Bytes that no token covers
    /// are skipped.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, TokenizationError> {
        let mut out = Vec::new();
        for word in self.split_regex.find_iter(text) {
            let word = word?.as_str().as_bytes();
            let mut start = 0;
            while start < word.len() {
                // Longest candidate first; on a miss shrink by one byte, and
                // if nothing starting here matches, skip a byte.
                let mut end = word.len();
                loop {
                    if let Some(&id) = self.token_to_id.get(&word[start..end]) {
                        out.push(id);
                        start = end;
                        break;
                    }
                    if end == start + 1 {
                        start += 1;
                        break;
                    }
                    end -= 1;
                }
            }
        }
        Ok(out)
    }
}
