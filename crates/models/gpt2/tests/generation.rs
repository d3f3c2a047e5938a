//! End-to-end tests over a small synthetic GPT-2 checkpoint written in the
//! on-disk format: load, prefill, incremental decode, streaming, tied
//! weights, quantization, and the cursor's failure modes.

use std::io::Cursor;
use std::sync::Arc;

use llm_base::ggml::{self, util, CancelToken};
use llm_base::{
    ArgmaxSampler, Hyperparameters, InferenceError, LanguageModel, LoadError, ModelConfig,
    QuantizationConfig,
};
use llm_gpt2::{quantization_regexes, GPT2};

const N_VOCAB: usize = 16;
const N_CTX: usize = 32;
const N_EMBD: usize = 32;
const N_HEAD: usize = 2;
const N_LAYER: usize = 2;

fn hyperparameters() -> Hyperparameters {
    Hyperparameters {
        n_vocab: N_VOCAB,
        n_ctx: N_CTX,
        n_embd: N_EMBD,
        n_head: N_HEAD,
        n_layer: N_LAYER,
        file_type: llm_base::FileType::F32,
    }
}

/// Deterministic pseudo-random weights, small enough to keep the network
/// numerically tame.
fn weights(n: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as i64 % 1000) as f32 / 5000.0
        })
        .collect()
}

fn write_record(out: &mut Vec<u8>, name: &str, dims: &[usize], seed: u64) {
    util::write_i32(out, dims.len() as i32).unwrap();
    util::write_i32(out, name.len() as i32).unwrap();
    util::write_i32(out, u32::from(ggml::Type::F32) as i32).unwrap();
    for &dim in dims {
        util::write_i32(out, dim as i32).unwrap();
    }
    out.extend_from_slice(name.as_bytes());
    for value in weights(dims.iter().product(), seed) {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// A complete model stream: magic, hyperparameters, single-byte vocabulary,
/// and every weight except the LM head (tied to `model/wte`).
fn model_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    util::write_u32(&mut out, ggml::FILE_MAGIC_GGML).unwrap();
    hyperparameters().write(&mut out).unwrap();

    util::write_i32(&mut out, N_VOCAB as i32).unwrap();
    for i in 0..N_VOCAB {
        let word = [b'a' + i as u8];
        util::write_u32(&mut out, 1).unwrap();
        out.extend_from_slice(&word);
    }

    let e = N_EMBD;
    write_record(&mut out, "model/ln_f/g", &[e], 1);
    write_record(&mut out, "model/ln_f/b", &[e], 2);
    write_record(&mut out, "model/wte", &[e, N_VOCAB], 3);
    write_record(&mut out, "model/wpe", &[e, N_CTX], 4);
    for layer in 0..N_LAYER {
        let seed = 100 * (layer as u64 + 1);
        write_record(&mut out, &format!("model/h{layer}/ln_1/g"), &[e], seed + 1);
        write_record(&mut out, &format!("model/h{layer}/ln_1/b"), &[e], seed + 2);
        write_record(&mut out, &format!("model/h{layer}/ln_2/g"), &[e], seed + 3);
        write_record(&mut out, &format!("model/h{layer}/ln_2/b"), &[e], seed + 4);
        write_record(&mut out, &format!("model/h{layer}/attn/c_attn/w"), &[e, 3 * e], seed + 5);
        write_record(&mut out, &format!("model/h{layer}/attn/c_attn/b"), &[3 * e], seed + 6);
        write_record(&mut out, &format!("model/h{layer}/attn/c_proj/w"), &[e, e], seed + 7);
        write_record(&mut out, &format!("model/h{layer}/attn/c_proj/b"), &[e], seed + 8);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_fc/w"), &[e, 4 * e], seed + 9);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_fc/b"), &[4 * e], seed + 10);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_proj/w"), &[4 * e, e], seed + 11);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_proj/b"), &[e], seed + 12);
    }
    out
}

fn load(config: &ModelConfig) -> Arc<LanguageModel> {
    let bytes = model_bytes();
    Arc::new(
        LanguageModel::load_from_stream(
            &mut Cursor::new(bytes),
            &GPT2,
            config,
            |_| {},
            &CancelToken::new(),
        )
        .unwrap(),
    )
}

#[test]
fn greedy_decoding_is_deterministic() {
    let a = load(&ModelConfig::default());
    let b = load(&ModelConfig::default());
    let (text_a, _, stats) = a.complete("abc", 6, Box::new(ArgmaxSampler), 2).unwrap();
    let (text_b, _, _) = b.complete("abc", 6, Box::new(ArgmaxSampler), 1).unwrap();
    assert_eq!(text_a, text_b);
    assert!(text_a.starts_with("abc"));
    assert_eq!(text_a.len(), "abc".len() + 6);
    assert_eq!(stats.prompt_tokens, 3);
    assert_eq!(stats.predict_tokens, 6);
}

#[test]
fn chunk_streams_concatenate_to_the_completion() {
    let lm = load(&ModelConfig::default());
    let (reference, _, _) = lm.complete("abc", 5, Box::new(ArgmaxSampler), 1).unwrap();

    let mut cursor = lm.create_completion("abc", 5, Box::new(ArgmaxSampler), 1);
    let mut chunks = Vec::new();
    cursor
        .exec_stream(5, 2, |chunk| chunks.push(chunk))
        .unwrap();

    let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(text, reference);
    assert_eq!(chunks[0].text, "abc");
    // 5 tokens at chunk_size 2: two full rings plus a one-token flush.
    assert!(chunks.len() >= 4);
    assert!(chunks.last().unwrap().is_complete);
    assert!(chunks[..chunks.len() - 1].iter().all(|c| !c.is_complete));
}

#[test]
fn chunk_size_does_not_change_the_text() {
    let lm = load(&ModelConfig::default());
    let mut texts = Vec::new();
    for chunk_size in [1usize, 3, 7] {
        let mut cursor = lm.create_completion("abcd", 7, Box::new(ArgmaxSampler), 1);
        let mut text = String::new();
        cursor
            .exec_stream(7, chunk_size, |chunk| text.push_str(&chunk.text))
            .unwrap();
        texts.push(text);
    }
    assert_eq!(texts[0], texts[1]);
    assert_eq!(texts[1], texts[2]);
}

#[test]
fn tied_lm_head_aliases_wte() {
    let lm = load(&ModelConfig::default());
    let wte = lm.model().get("model/wte").unwrap();
    let lm_head = lm.model().get("model/lm_head").unwrap();
    assert_eq!(wte.read_data(), lm_head.read_data());
}

#[test]
fn quantized_load_generates() {
    let config = ModelConfig {
        quantization: Some(QuantizationConfig {
            target: ggml::Type::Q4_0,
            include: quantization_regexes(),
            exclude: vec![],
        }),
    };
    let lm = load(&config);
    assert_eq!(
        lm.model().get("model/wte").unwrap().get_type(),
        ggml::Type::Q4_0
    );
    // Norm weights stay f32.
    assert_eq!(
        lm.model().get("model/ln_f/g").unwrap().get_type(),
        ggml::Type::F32
    );
    let (text, _, _) = lm.complete("abc", 4, Box::new(ArgmaxSampler), 2).unwrap();
    assert!(text.starts_with("abc"));
    assert_eq!(text.len(), "abc".len() + 4);
}

#[test]
fn exec_zero_tokens_returns_only_the_prompt() {
    let lm = load(&ModelConfig::default());
    let mut cursor = lm.create_completion("abc", 8, Box::new(ArgmaxSampler), 1);
    let mut chunks = Vec::new();
    cursor.exec_stream(0, 4, |chunk| chunks.push(chunk)).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "abc");
    assert!(chunks[0].is_complete);
}

#[test]
fn a_cursor_streams_exactly_once() {
    let lm = load(&ModelConfig::default());
    let mut cursor = lm.create_completion("abc", 4, Box::new(ArgmaxSampler), 1);
    cursor.exec_stream(2, 2, |_| {}).unwrap();
    assert!(matches!(
        cursor.exec_stream(2, 2, |_| {}),
        Err(InferenceError::Spent)
    ));
}

#[test]
fn cancellation_interrupts_execution() {
    let lm = load(&ModelConfig::default());
    let mut cursor = lm.create_completion("abc", 64, Box::new(ArgmaxSampler), 1);
    cursor.cancel_token().cancel();
    assert!(matches!(
        cursor.exec_stream(16, 2, |_| {}),
        Err(InferenceError::Cancelled)
    ));
}

#[test]
fn oversized_requests_fill_the_context() {
    let lm = load(&ModelConfig::default());
    let mut cursor = lm.create_completion("abc", N_CTX * 2, Box::new(ArgmaxSampler), 1);
    assert!(matches!(
        cursor.exec_stream(N_CTX * 2, 4, |_| {}),
        Err(InferenceError::ContextFull)
    ));
}

#[test]
fn bad_magic_is_rejected() {
    let mut bytes = model_bytes();
    bytes[0] = 0xde;
    let result = LanguageModel::load_from_stream(
        &mut Cursor::new(bytes),
        &GPT2,
        &ModelConfig::default(),
        |_| {},
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(LoadError::InvalidMagic { .. })));
}

#[test]
fn truncated_stream_is_an_io_error() {
    let mut bytes = model_bytes();
    bytes.truncate(bytes.len() - 64);
    let result = LanguageModel::load_from_stream(
        &mut Cursor::new(bytes),
        &GPT2,
        &ModelConfig::default(),
        |_| {},
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(LoadError::Io(_))));
}

#[test]
fn unknown_tensor_is_rejected() {
    let mut bytes = model_bytes();
    write_record(&mut bytes, "model/not_a_weight", &[N_EMBD], 9);
    let result = LanguageModel::load_from_stream(
        &mut Cursor::new(bytes),
        &GPT2,
        &ModelConfig::default(),
        |_| {},
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(LoadError::UnknownTensor { .. })));
}

#[test]
fn cancelled_load_stops_early() {
    let bytes = model_bytes();
    let cancel = CancelToken::new();
    cancel.cancel();
    let result = LanguageModel::load_from_stream(
        &mut Cursor::new(bytes),
        &GPT2,
        &ModelConfig::default(),
        |_| {},
        &cancel,
    );
    assert!(matches!(result, Err(LoadError::Cancelled)));
}
