use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::{NodeRef, Op};
use crate::kernels;
use crate::tensor::Tensor;
use crate::{Buffer, ComputeError, Type, MAX_NODES};

/// A shared cooperative-cancellation flag.
///
/// The graph executor polls it at every node boundary; inference loops poll
/// it between steps. Tripping it is cheap and thread-safe.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the token. Every holder observes the trip.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An ordered list of tensor nodes: the topological order of a forward
/// expansion from one or more result tensors.
#[derive(Default)]
pub struct ComputationGraph {
    nodes: Vec<Tensor>,
    visited: HashSet<(usize, usize)>,
}

impl ComputationGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expands the graph forward from `result`: walks its sources
    /// transitively and appends each node at most once, in post-order, so
    /// that every node appears after everything it reads.
    pub fn build_forward_expand(&mut self, result: &Tensor) {
        // Iterative post-order: (node, children_expanded).
        let mut stack: Vec<(Tensor, bool)> = vec![(result.share(), false)];
        while let Some((tensor, expanded)) = stack.pop() {
            let key = (Arc::as_ptr(&tensor.ctx) as usize, tensor.idx);
            if self.visited.contains(&key) {
                continue;
            }
            if expanded {
                self.visited.insert(key);
                assert!(self.nodes.len() < MAX_NODES, "graph capacity ({MAX_NODES} nodes) exceeded");
                self.nodes.push(tensor);
                continue;
            }
            stack.push((tensor.share(), true));
            let meta = tensor.meta();
            for src in [&meta.src1, &meta.src0].into_iter().flatten() {
                let src = match src {
                    NodeRef::Local(idx) => Tensor {
                        ctx: tensor.ctx.clone(),
                        idx: *idx,
                    },
                    NodeRef::Foreign(t) => t.share(),
                };
                let src_key = (Arc::as_ptr(&src.ctx) as usize, src.idx);
                if !self.visited.contains(&src_key) {
                    stack.push((src, false));
                }
            }
        }
    }

    /// The nodes of the graph, in execution order.
    pub fn nodes(&self) -> &[Tensor] {
        &self.nodes
    }

    /// The number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Runs every node in order, honoring `plan`'s thread count and abort
    /// flag. On success, every node's storage holds its defined value.
    pub fn compute(&self, plan: &mut GraphPlan) -> Result<(), ComputeError> {
        let n_threads = plan.n_threads;
        let work_per_thread = plan.work_size / n_threads.max(1);
        for node in &self.nodes {
            if plan.cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            let meta = node.meta();
            if meta.op == Op::None || meta.op.is_pure_view() {
                continue;
            }
            kernels::exec_node(node, n_threads, plan.work.as_mut_slice(), work_per_thread)?;
        }
        Ok(())
    }
}

/// A (graph, thread count) bundle that owns the scratch buffer the executor's
/// worker threads dequantize into, plus the abort flag they poll.
pub struct GraphPlan {
    pub(crate) n_threads: usize,
    pub(crate) work: Buffer,
    pub(crate) work_size: usize,
    pub(crate) cancel: CancelToken,
}

impl GraphPlan {
    /// Sizes the worst-case scratch requirement of `graph` for `n_threads`
    /// workers and allocates the work buffer.
    ///
    /// The dominant consumer is `mul_mat` over a non-f32 left operand, which
    /// dequantizes one source row per worker.
    pub fn new(graph: &ComputationGraph, n_threads: usize) -> Self {
        let n_threads = n_threads.max(1);
        let mut work_per_thread = 0usize;
        for node in graph.nodes() {
            let meta = node.meta();
            if meta.op != Op::MulMat {
                continue;
            }
            if let Some(src0) = &meta.src0 {
                let src0 = src0.upgrade(&node.ctx);
                if src0.get_type() != Type::F32 {
                    work_per_thread = work_per_thread.max(src0.meta().ne[0] * 4);
                }
            }
        }
        let work_size = work_per_thread * n_threads;
        GraphPlan {
            n_threads,
            work: Buffer::new(work_size),
            work_size,
            cancel: CancelToken::new(),
        }
    }

    /// The number of worker threads the executor may use within a single op.
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Replaces the plan's abort flag, so several plans (and the loop driving
    /// them) can share one token.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// The plan's abort flag.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}
