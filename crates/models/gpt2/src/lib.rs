//! An implementation of [GPT-2](https://huggingface.co/docs/transformers/model_doc/gpt2)
//! for the `llm` ecosystem: the weight description tree, the forward pass
//! with its key/value memory, and the published model presets.
#![deny(missing_docs)]

use llm_base::ggml::{ComputationGraph, Context, Tensor, Type};
use llm_base::{
    Architecture, ExecutionMemory, Hyperparameters, Model, ModelDescNode, TokenId,
};

/// LayerNorm epsilon, shared by every normalization in the network.
const NORM_EPS: f32 = 1e-5;

/// The GPT-2 architecture. Pass this to
/// [llm_base::LanguageModel::load_from_stream].
pub static GPT2: Architecture = Architecture {
    name: "gpt2",
    model_desc,
    forward,
    scratch_size,
    tied_weights: &[("model/wte", "model/lm_head")],
};

/// The published GPT-2 checkpoints, by parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpt2Preset {
    /// GPT-2 small.
    P117M,
    /// GPT-2 medium.
    P345M,
    /// GPT-2 large.
    P774M,
    /// GPT-2 XL.
    P1558M,
}

impl Gpt2Preset {
    /// All presets.
    pub const ALL: &'static [Gpt2Preset] = &[
        Gpt2Preset::P117M,
        Gpt2Preset::P345M,
        Gpt2Preset::P774M,
        Gpt2Preset::P1558M,
    ];

    /// Resolves an `n_params` property value (`"117M"`, ...) to a preset.
    pub fn from_n_params(n_params: &str) -> Option<Self> {
        match n_params {
            "117M" => Some(Gpt2Preset::P117M),
            "345M" => Some(Gpt2Preset::P345M),
            "774M" => Some(Gpt2Preset::P774M),
            "1558M" => Some(Gpt2Preset::P1558M),
            _ => None,
        }
    }

    /// The file name this preset is cached under.
    pub fn cache_file_name(&self) -> &'static str {
        match self {
            Gpt2Preset::P117M => "ggml-model-gpt-2-117M.bin",
            Gpt2Preset::P345M => "ggml-model-gpt-2-345M.bin",
            Gpt2Preset::P774M => "ggml-model-gpt-2-774M.bin",
            Gpt2Preset::P1558M => "ggml-model-gpt-2-1558M.bin",
        }
    }
}

/// The weight paths worth quantizing: every rank-2 projection. Embedding
/// positions (`wpe`) and the rank-1 norms and biases stay in float.
pub fn quantization_regexes() -> Vec<String> {
    [
        "^model/wte$",
        "^model/lm_head$",
        "^model/h[0-9]+/attn/c_attn/w$",
        "^model/h[0-9]+/attn/c_proj/w$",
        "^model/h[0-9]+/mlp/c_fc/w$",
        "^model/h[0-9]+/mlp/c_proj/w$",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn layer_desc(d_model: usize, d_ff: usize, wtype: Type) -> ModelDescNode {
    ModelDescNode::node([
        ("ln_1".to_owned(), norm_desc(d_model)),
        ("ln_2".to_owned(), norm_desc(d_model)),
        (
            "attn".to_owned(),
            ModelDescNode::node([
                (
                    "c_attn".to_owned(),
                    ModelDescNode::node([
                        ("w".to_owned(), ModelDescNode::leaf(&[d_model, 3 * d_model], wtype)),
                        ("b".to_owned(), ModelDescNode::leaf(&[3 * d_model], Type::F32)),
                    ]),
                ),
                (
                    "c_proj".to_owned(),
                    ModelDescNode::node([
                        ("w".to_owned(), ModelDescNode::leaf(&[d_model, d_model], wtype)),
                        ("b".to_owned(), ModelDescNode::leaf(&[d_model], Type::F32)),
                    ]),
                ),
            ]),
        ),
        (
            "mlp".to_owned(),
            ModelDescNode::node([
                (
                    "c_fc".to_owned(),
                    ModelDescNode::node([
                        ("w".to_owned(), ModelDescNode::leaf(&[d_model, d_ff], wtype)),
                        ("b".to_owned(), ModelDescNode::leaf(&[d_ff], Type::F32)),
                    ]),
                ),
                (
                    "c_proj".to_owned(),
                    ModelDescNode::node([
                        ("w".to_owned(), ModelDescNode::leaf(&[d_ff, d_model], wtype)),
                        ("b".to_owned(), ModelDescNode::leaf(&[d_model], Type::F32)),
                    ]),
                ),
            ]),
        ),
    ])
}

fn norm_desc(d_model: usize) -> ModelDescNode {
    ModelDescNode::node([
        ("g".to_owned(), ModelDescNode::leaf(&[d_model], Type::F32)),
        ("b".to_owned(), ModelDescNode::leaf(&[d_model], Type::F32)),
    ])
}

/// The GPT-2 weight tree for the given hyperparameters. Rank-2 weights
/// default to the file's weight type (`ftype`); `wpe` and everything rank-1
/// stay f32.
fn model_desc(hyperparameters: &Hyperparameters) -> ModelDescNode {
    let d_model = hyperparameters.n_embd;
    let d_ff = 4 * hyperparameters.n_embd;
    let wtype = hyperparameters.file_type.weight_type();

    let mut model = vec![
        ("ln_f".to_owned(), norm_desc(d_model)),
        (
            "wte".to_owned(),
            ModelDescNode::leaf(&[d_model, hyperparameters.n_vocab], wtype),
        ),
        (
            "wpe".to_owned(),
            ModelDescNode::leaf(&[d_model, hyperparameters.n_ctx], Type::F32),
        ),
        (
            "lm_head".to_owned(),
            ModelDescNode::leaf(&[d_model, hyperparameters.n_vocab], wtype),
        ),
    ];
    for i in 0..hyperparameters.n_layer {
        model.push((format!("h{i}"), layer_desc(d_model, d_ff, wtype)));
    }

    ModelDescNode::node([("model".to_owned(), ModelDescNode::node(model))])
}

/// Worst-case scratch bytes for one forward pass consuming `n_batch` tokens
/// against `n_positions` positions of KV cache. Every intermediate of the
/// graph lives in the arena at once, so this is dominated by the per-layer
/// activations plus the attention matrices.
fn scratch_size(hyperparameters: &Hyperparameters, n_batch: usize, n_positions: usize) -> usize {
    let e = hyperparameters.n_embd;
    let h = hyperparameters.n_head;
    let l = hyperparameters.n_layer;
    let v = hyperparameters.n_vocab;

    // Activations ([E, n_batch] tensors), attention matrices
    // ([n_positions, n_batch, H]) and the materialized value cache per
    // layer, plus the logits.
    let per_layer = 48 * e * n_batch + 3 * h * n_positions * n_batch + 2 * n_positions * e;
    let elements = l * per_layer + 2 * v * n_batch + 8 * e * n_batch;
    let node_overhead = (l * 48 + 24) * llm_base::ggml::tensor_overhead();

    elements * 4 * 5 / 4 + node_overhead
}

fn weight(model: &Model, path: &str) -> Tensor {
    model
        .get(path)
        .unwrap_or_else(|| panic!("model is missing weight `{path}`"))
}

/// `w·x + b`. The bias is broadcast over positions; `None` skips it (the LM
/// head has no bias).
fn linear_layer(ctx: &Context, input: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Tensor {
    let projected = ctx.op_mul_mat(w, input);
    match b {
        Some(b) => ctx.op_add(&ctx.op_repeat(b, &projected), &projected),
        None => projected,
    }
}

fn layer_norm(ctx: &Context, input: &Tensor, g: &Tensor, b: &Tensor) -> Tensor {
    let normed = ctx.op_norm(input, NORM_EPS);
    ctx.op_add(
        &ctx.op_mul(&ctx.op_repeat(g, &normed), &normed),
        &ctx.op_repeat(b, &normed),
    )
}

/// Causal multi-head self-attention for one layer, reading and appending the
/// layer's KV memory slots.
#[allow(clippy::too_many_arguments)]
fn causal_self_attention(
    ctx: &Context,
    model: &Model,
    graph: &mut ComputationGraph,
    memory: &ExecutionMemory,
    input: &Tensor,
    layer: usize,
    hyperparameters: &Hyperparameters,
    n_past: usize,
    n_tokens: usize,
) -> Tensor {
    let n_embd = hyperparameters.n_embd;
    let n_head = hyperparameters.n_head;
    let n_ctx = hyperparameters.n_ctx;
    let head_dim = n_embd / n_head;

    let qkv = linear_layer(
        ctx,
        input,
        &weight(model, &format!("model/h{layer}/attn/c_attn/w")),
        Some(&weight(model, &format!("model/h{layer}/attn/c_attn/b"))),
    );

    // Chop the fused projection into the query, key and value heads.
    let q_cur = ctx.op_view_2d(&qkv, n_embd, n_tokens, 0);
    let k_cur = ctx.op_view_2d(&qkv, n_embd, n_tokens, n_embd);
    let v_cur = ctx.op_view_2d(&qkv, n_embd, n_tokens, 2 * n_embd);

    // Commit this step's keys and values into the memory slots for
    // positions n_past..n_past+n_tokens. The copies are expanded into the
    // graph directly so they run even though nothing downstream consumes
    // their node.
    let k_slot = ctx.op_view_1d(
        memory.memory_k(),
        n_tokens * n_embd,
        (layer * n_ctx + n_past) * n_embd,
    );
    let v_slot = ctx.op_view_1d(
        memory.memory_v(),
        n_tokens * n_embd,
        (layer * n_ctx + n_past) * n_embd,
    );
    graph.build_forward_expand(&ctx.op_cpy(&k_cur, &k_slot));
    graph.build_forward_expand(&ctx.op_cpy(&v_cur, &v_slot));

    // Q, grouped per head: [head_dim, n_tokens, n_head].
    let q = ctx.op_permute(
        &ctx.op_cpy(
            &q_cur,
            &ctx.new_tensor_3d(Type::F32, head_dim, n_head, n_tokens),
        ),
        0,
        2,
        1,
        3,
    );

    // K and V cover every position computed so far, read back out of the
    // memory.
    let n_all = n_past + n_tokens;
    let k = ctx.op_permute(
        &ctx.op_reshape_3d(
            &ctx.op_view_1d(memory.memory_k(), n_all * n_embd, layer * n_ctx * n_embd),
            head_dim,
            n_head,
            n_all,
        ),
        0,
        2,
        1,
        3,
    );

    let kq = ctx.op_mul_mat(&k, &q);
    let kq_scaled = ctx.op_scale_inplace(&kq, &ctx.new_f32(1.0 / (head_dim as f32).sqrt()));
    let kq_masked = ctx.op_diag_mask_inf_inplace(&kq_scaled, n_past);
    let kq_softmax = ctx.op_soft_max_inplace(&kq_masked);

    let v_transposed = ctx.op_cpy(
        &ctx.op_permute(
            &ctx.op_reshape_3d(
                &ctx.op_view_1d(memory.memory_v(), n_all * n_embd, layer * n_ctx * n_embd),
                head_dim,
                n_head,
                n_all,
            ),
            1,
            2,
            0,
            3,
        ),
        &ctx.new_tensor_3d(Type::F32, n_all, head_dim, n_head),
    );

    let kqv = ctx.op_mul_mat(&v_transposed, &kq_softmax);
    let merged = ctx.op_permute(&kqv, 0, 2, 1, 3);
    let attn = ctx.op_cpy(&merged, &ctx.new_tensor_2d(Type::F32, n_embd, n_tokens));

    linear_layer(
        ctx,
        &attn,
        &weight(model, &format!("model/h{layer}/attn/c_proj/w")),
        Some(&weight(model, &format!("model/h{layer}/attn/c_proj/b"))),
    )
}

#[allow(clippy::too_many_arguments)]
fn decoder_layer(
    ctx: &Context,
    model: &Model,
    graph: &mut ComputationGraph,
    memory: &ExecutionMemory,
    input: &Tensor,
    layer: usize,
    hyperparameters: &Hyperparameters,
    n_past: usize,
    n_tokens: usize,
) -> Tensor {
    let ln_1 = layer_norm(
        ctx,
        input,
        &weight(model, &format!("model/h{layer}/ln_1/g")),
        &weight(model, &format!("model/h{layer}/ln_1/b")),
    );
    let attn = causal_self_attention(
        ctx,
        model,
        graph,
        memory,
        &ln_1,
        layer,
        hyperparameters,
        n_past,
        n_tokens,
    );
    let residual = ctx.op_add(&attn, input);

    let ln_2 = layer_norm(
        ctx,
        &residual,
        &weight(model, &format!("model/h{layer}/ln_2/g")),
        &weight(model, &format!("model/h{layer}/ln_2/b")),
    );
    let up = linear_layer(
        ctx,
        &ln_2,
        &weight(model, &format!("model/h{layer}/mlp/c_fc/w")),
        Some(&weight(model, &format!("model/h{layer}/mlp/c_fc/b"))),
    );
    let gelu = ctx.op_gelu(&up);
    let down = linear_layer(
        ctx,
        &gelu,
        &weight(model, &format!("model/h{layer}/mlp/c_proj/w")),
        Some(&weight(model, &format!("model/h{layer}/mlp/c_proj/b"))),
    );

    ctx.op_add(&down, &residual)
}

/// The GPT-2 forward pass: token + position embeddings, `n_layer` decoder
/// blocks over the KV memory, final norm, LM head. Returns the logits node
/// of shape `[n_vocab, n_tokens]`; the caller expands and computes the
/// graph.
fn forward(
    model: &Model,
    hyperparameters: &Hyperparameters,
    tokens: &[TokenId],
    n_past: usize,
    ctx: &Context,
    graph: &mut ComputationGraph,
    memory: &ExecutionMemory,
) -> Tensor {
    let n_tokens = tokens.len();

    let embd = ctx.new_tensor_1d(Type::I32, n_tokens);
    embd.set_data_from_i32s(tokens);

    let positions_data: Vec<i32> = (n_past..n_past + n_tokens).map(|p| p as i32).collect();
    let positions = ctx.new_tensor_1d(Type::I32, n_tokens);
    positions.set_data_from_i32s(&positions_data);

    let mut input_layer = ctx.op_add(
        &ctx.op_get_rows(&weight(model, "model/wte"), &embd),
        &ctx.op_get_rows(&weight(model, "model/wpe"), &positions),
    );

    for layer in 0..hyperparameters.n_layer {
        input_layer = decoder_layer(
            ctx,
            model,
            graph,
            memory,
            &input_layer,
            layer,
            hyperparameters,
            n_past,
            n_tokens,
        );
    }

    let final_norm = layer_norm(
        ctx,
        &input_layer,
        &weight(model, "model/ln_f/g"),
        &weight(model, "model/ln_f/b"),
    );

    linear_layer(ctx, &final_norm, &weight(model, "model/lm_head"), None)
}
