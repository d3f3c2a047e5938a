use std::collections::HashMap;

use ggml::{ComputationGraph, Context, Tensor};

use crate::hyperparameters::Hyperparameters;
use crate::loader::{estimate_model_size, LoadError};
use crate::model_desc::ModelDescNode;
use crate::TokenId;

/// Builds the forward-pass graph for a model: consumes `tokens` at positions
/// `n_past..`, reads and writes the KV cache in `memory`, and returns the
/// logits node (shape `[n_vocab, n_tokens]`).
///
/// Building the graph does not run it; the caller expands the returned node
/// into `graph` and computes it.
pub type ModelForward = fn(
    model: &Model,
    hyperparameters: &Hyperparameters,
    tokens: &[TokenId],
    n_past: usize,
    ctx: &Context,
    graph: &mut ComputationGraph,
    memory: &ExecutionMemory,
) -> Tensor;

/// A loaded model: an owning context, the weight tensors by path, and the
/// forward function that knows how to wire them together.
///
/// Weights are immutable after loading, so a `Model` can be shared read-only
/// between any number of cursors.
pub struct Model {
    _context: Context,
    tensors: HashMap<String, Tensor>,
    forward: ModelForward,
}

impl Model {
    /// Allocates every weight described by the flattened `desc` in a fresh
    /// context sized with [estimate_model_size].
    pub fn new_from_flattened_desc(
        desc: &ModelDescNode,
        forward: ModelForward,
    ) -> Result<(Self, usize), LoadError> {
        let flattened = desc.flatten();
        let size = estimate_model_size(&flattened);
        let context = Context::new(size);
        let mut tensors = HashMap::with_capacity(flattened.len());
        for (path, leaf) in &flattened {
            let tensor = match leaf.dims.len() {
                1 => context.new_tensor_1d(leaf.dtype, leaf.dims[0]),
                2 => context.new_tensor_2d(leaf.dtype, leaf.dims[0], leaf.dims[1]),
                n => {
                    return Err(LoadError::InvariantBroken {
                        invariant: format!("weight `{path}` has unsupported rank {n}"),
                    })
                }
            };
            tensor.set_name(path);
            tensors.insert(path.clone(), tensor);
        }
        Ok((
            Model {
                _context: context,
                tensors,
                forward,
            },
            size,
        ))
    }

    /// Looks up a weight by its `/`-separated path.
    pub fn get(&self, path: &str) -> Option<Tensor> {
        self.tensors.get(path).map(|t| t.share())
    }

    /// The number of weights in the model.
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Builds the forward graph for one step. See [ModelForward].
    pub fn forward(
        &self,
        hyperparameters: &Hyperparameters,
        tokens: &[TokenId],
        n_past: usize,
        ctx: &Context,
        graph: &mut ComputationGraph,
        memory: &ExecutionMemory,
    ) -> Tensor {
        (self.forward)(self, hyperparameters, tokens, n_past, ctx, graph, memory)
    }
}

/// The per-cursor mutable state of inference: a scratch context for the
/// intermediates of one forward pass, and the key/value memory the pass reads
/// from and appends to.
///
/// Never shared: each cursor owns exactly one of these, which is what makes
/// concurrent cursors over one shared [Model] sound.
pub struct ExecutionMemory {
    eval_ctx: Context,
    _memory_ctx: Context,
    memory_k: Tensor,
    memory_v: Tensor,
}

impl ExecutionMemory {
    /// Creates the memory for a cursor: `scratch_bytes` of per-pass scratch,
    /// plus `k`/`v` tensors of `n_layer * n_ctx * n_embd` f32 elements each.
    pub fn new(scratch_bytes: usize, hyperparameters: &Hyperparameters) -> Self {
        let n_elements =
            hyperparameters.n_layer * hyperparameters.n_ctx * hyperparameters.n_embd;
        let memory_ctx = Context::new(2 * (n_elements * 4 + ggml::tensor_overhead()) + 64);
        let memory_k = memory_ctx.new_tensor_1d(ggml::Type::F32, n_elements);
        let memory_v = memory_ctx.new_tensor_1d(ggml::Type::F32, n_elements);
        memory_k.set_name("memory/k");
        memory_v.set_name("memory/v");
        ExecutionMemory {
            eval_ctx: Context::new(scratch_bytes),
            _memory_ctx: memory_ctx,
            memory_k,
            memory_v,
        }
    }

    /// The scratch context a forward pass builds its intermediates in.
    pub fn eval_ctx(&self) -> &Context {
        &self.eval_ctx
    }

    /// Clears the scratch context between steps. Every tensor from the
    /// previous pass must already be dropped.
    pub fn reset_eval(&self) {
        self.eval_ctx.reset();
    }

    /// The key cache: one f32 vector of `n_embd` per (layer, position) slot.
    pub fn memory_k(&self) -> &Tensor {
        &self.memory_k
    }

    /// The value cache, laid out like [ExecutionMemory::memory_k].
    pub fn memory_v(&self) -> &Tensor {
        &self.memory_v
    }
}
