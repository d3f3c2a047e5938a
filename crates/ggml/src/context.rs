use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use crate::tensor::Tensor;
use crate::{blck_size, type_bytes, type_size, ComputationGraph, Type, MAX_DIMS, MAX_NAME_LEN};

/// Alignment of tensor data within the arena.
pub(crate) const ARENA_ALIGN: usize = 32;

/// Arena bookkeeping charged per tensor, over and above its data. This keeps
/// the size accounting compatible with the classic estimate formulas
/// (`n_tensors * overhead + data`).
pub(crate) const TENSOR_OVERHEAD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextMode {
    /// Tensors get metadata and data as soon as they are created.
    Eager,
    /// Metadata only; data sizes are recorded so a future eager context can
    /// be sized correctly.
    Recorder,
    /// Leaf tensors are allocated eagerly (so inputs can be written while the
    /// graph is being built); op outputs are placed by
    /// [Context::plan_from_graph], which reuses slots whose last consumer has
    /// already run.
    Planned,
}

/// The op that produced a node. `None` marks a leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Op {
    None,
    Add,
    Mul,
    Repeat,
    MulMat,
    Gelu,
    Norm { eps: f32 },
    SoftMax,
    Scale,
    DiagMaskInf { n_past: usize },
    GetRows,
    Cpy,
    View,
    Reshape,
    Permute,
}

impl Op {
    /// Ops that never execute; they only reinterpret their source's bytes.
    pub(crate) fn is_pure_view(&self) -> bool {
        matches!(self, Op::View | Op::Reshape | Op::Permute)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Add => "add",
            Op::Mul => "mul",
            Op::Repeat => "repeat",
            Op::MulMat => "mul_mat",
            Op::Gelu => "gelu",
            Op::Norm { .. } => "norm",
            Op::SoftMax => "soft_max",
            Op::Scale => "scale",
            Op::DiagMaskInf { .. } => "diag_mask_inf",
            Op::GetRows => "get_rows",
            Op::Cpy => "cpy",
            Op::View => "view",
            Op::Reshape => "reshape",
            Op::Permute => "permute",
        }
    }
}

/// A reference to another node, either in the same context (by index, to keep
/// the node arena free of owning cycles) or in a different one (by handle).
#[derive(Clone)]
pub(crate) enum NodeRef {
    Local(usize),
    Foreign(Tensor),
}

impl NodeRef {
    pub(crate) fn upgrade(&self, ctx: &Arc<RawContext>) -> Tensor {
        match self {
            NodeRef::Local(idx) => Tensor {
                ctx: ctx.clone(),
                idx: *idx,
            },
            NodeRef::Foreign(t) => t.share(),
        }
    }
}

/// Where a node's bytes live.
#[derive(Clone)]
pub(crate) enum DataLoc {
    /// Not placed. Recorder tensors stay here; planned op outputs stay here
    /// until [Context::plan_from_graph] runs.
    None,
    /// Offset into the owning context's arena.
    Arena(usize),
    /// A window into another node's storage.
    View { base: NodeRef, byte_offset: usize },
}

pub(crate) struct TensorMeta {
    pub dtype: Type,
    pub n_dims: usize,
    pub ne: [usize; MAX_DIMS],
    pub nb: [usize; MAX_DIMS],
    pub op: Op,
    pub src0: Option<NodeRef>,
    pub src1: Option<NodeRef>,
    pub data: DataLoc,
    pub name: [u8; MAX_NAME_LEN],
    pub name_len: u8,
}

impl TensorMeta {
    pub(crate) fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    pub(crate) fn nbytes(&self) -> usize {
        type_bytes(self.dtype, self.nelements())
    }

    /// Whether the element layout matches a freshly allocated tensor of the
    /// same shape.
    pub(crate) fn is_contiguous(&self) -> bool {
        let mut nb = [0usize; MAX_DIMS];
        nb[0] = type_size(self.dtype);
        nb[1] = nb[0] * (self.ne[0] / blck_size(self.dtype));
        for k in 2..MAX_DIMS {
            nb[k] = nb[k - 1] * self.ne[k - 1];
        }
        self.nb == nb
    }
}

fn contiguous_strides(dtype: Type, ne: &[usize; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = type_size(dtype);
    nb[1] = nb[0] * (ne[0] / blck_size(dtype));
    for k in 2..MAX_DIMS {
        nb[k] = nb[k - 1] * ne[k - 1];
    }
    nb
}

/// The shared arena behind a [Context].
///
/// # Safety
///
/// `RawContext` is not internally synchronized, mirroring the discipline of
/// the reference runtime: a context is built and written by one thread at a
/// time, and may be shared between threads only once it is no longer being
/// mutated (model weights after loading, for example). Tensor data written by
/// the graph executor is partitioned by node ordering, never concurrently
/// aliased.
pub(crate) struct RawContext {
    mode: ContextMode,
    /// Backed by u64 words so that every aligned offset yields properly
    /// aligned scalar pointers.
    buf: Option<UnsafeCell<Box<[u64]>>>,
    capacity: usize,
    used: Cell<usize>,
    nodes: UnsafeCell<Vec<TensorMeta>>,
}

unsafe impl Send for RawContext {}
unsafe impl Sync for RawContext {}

impl RawContext {
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn nodes_mut(&self) -> &mut Vec<TensorMeta> {
        // SAFETY: callers uphold the single-threaded-mutation contract
        // documented on the type.
        unsafe { &mut *self.nodes.get() }
    }

    pub(crate) fn nodes(&self) -> &Vec<TensorMeta> {
        // SAFETY: as above.
        unsafe { &*self.nodes.get() }
    }

    pub(crate) fn buf_ptr(&self) -> *mut u8 {
        match &self.buf {
            Some(cell) => unsafe { (*cell.get()).as_mut_ptr() as *mut u8 },
            None => panic!("context has no arena buffer (recorder mode)"),
        }
    }

    /// Resolves a node's data to a raw pointer, walking view chains across
    /// contexts.
    pub(crate) fn resolve_data(self: &Arc<Self>, idx: usize) -> *mut u8 {
        let meta = &self.nodes()[idx];
        match &meta.data {
            DataLoc::Arena(off) => unsafe { self.buf_ptr().add(*off) },
            DataLoc::View { base, byte_offset } => {
                let p = match base {
                    NodeRef::Local(i) => self.resolve_data(*i),
                    NodeRef::Foreign(t) => t.ctx.resolve_data(t.idx),
                };
                unsafe { p.add(*byte_offset) }
            }
            DataLoc::None => panic!(
                "tensor `{}` has no storage (recorder context, or planned context before \
                 plan_from_graph)",
                String::from_utf8_lossy(&meta.name[..meta.name_len as usize])
            ),
        }
    }

    /// Follows view chains within this context to the node that actually owns
    /// storage. Foreign bases terminate the walk.
    fn storage_root(&self, idx: usize) -> Option<usize> {
        match &self.nodes()[idx].data {
            DataLoc::View {
                base: NodeRef::Local(i),
                ..
            } => self.storage_root(*i),
            DataLoc::View {
                base: NodeRef::Foreign(_),
                ..
            } => None,
            _ => Some(idx),
        }
    }

    fn alloc(&self, nbytes: usize) -> DataLoc {
        let aligned = nbytes.div_ceil(ARENA_ALIGN) * ARENA_ALIGN;
        let charge = aligned + TENSOR_OVERHEAD;
        let offset = self.used.get();
        match self.mode {
            ContextMode::Recorder => {
                self.used.set(offset + charge);
                DataLoc::None
            }
            ContextMode::Eager | ContextMode::Planned => {
                assert!(
                    offset + charge <= self.capacity,
                    "context arena exhausted: need {} more bytes in a {}-byte arena",
                    offset + charge - self.capacity,
                    self.capacity
                );
                self.used.set(offset + charge);
                DataLoc::Arena(offset)
            }
        }
    }
}

/// An arena that owns tensor metadata and (in eager mode) tensor data.
///
/// All tensor and op constructors live here; tensors never outlive their
/// context because each [Tensor] handle shares ownership of it.
pub struct Context {
    pub(crate) inner: Arc<RawContext>,
}

impl Context {
    /// Creates an eager context with an arena of `mem_size` bytes.
    ///
    /// Tensors created in it get storage immediately. Callers size the arena
    /// with the estimate helpers (data bytes plus [crate::tensor_overhead]
    /// per tensor).
    pub fn new(mem_size: usize) -> Self {
        Self::with_mode(ContextMode::Eager, mem_size)
    }

    /// Creates a recorder context: tensors get metadata but no data. Use
    /// [Context::recorded_size] afterwards to size a real arena for the same
    /// sequence of allocations.
    pub fn new_recorder() -> Self {
        Self::with_mode(ContextMode::Recorder, 0)
    }

    /// Creates a planned context. Leaf tensors are allocated eagerly; op
    /// outputs are placed by [Context::plan_from_graph], which may overlap
    /// tensors with disjoint lifetimes in the same bytes.
    pub fn new_planned(mem_size: usize) -> Self {
        Self::with_mode(ContextMode::Planned, mem_size)
    }

    fn with_mode(mode: ContextMode, mem_size: usize) -> Self {
        let buf = match mode {
            ContextMode::Recorder => None,
            _ => Some(UnsafeCell::new(
                vec![0u64; mem_size.div_ceil(8)].into_boxed_slice(),
            )),
        };
        Context {
            inner: Arc::new(RawContext {
                mode,
                buf,
                capacity: mem_size,
                used: Cell::new(0),
                nodes: UnsafeCell::new(Vec::new()),
            }),
        }
    }

    /// The number of arena bytes this context's allocations need (including
    /// per-tensor overhead). In recorder mode this is the size to pass to
    /// [Context::new] for the same allocation sequence.
    pub fn recorded_size(&self) -> usize {
        self.inner.used.get()
    }

    /// Discards every tensor and returns the arena to empty, so the same
    /// buffer can back the next graph. An autoregressive loop resets its
    /// scratch context between steps instead of reallocating it.
    ///
    /// Panics if any tensor handle from a previous use is still alive.
    pub fn reset(&self) {
        assert_eq!(
            Arc::strong_count(&self.inner),
            1,
            "reset: tensors from a previous graph are still alive"
        );
        self.inner.nodes_mut().clear();
        self.inner.used.set(0);
    }

    fn push_node(&self, meta: TensorMeta) -> Tensor {
        let nodes = self.inner.nodes_mut();
        let idx = nodes.len();
        nodes.push(meta);
        Tensor {
            ctx: self.inner.clone(),
            idx,
        }
    }

    fn new_leaf(&self, dtype: Type, n_dims: usize, ne: [usize; MAX_DIMS]) -> Tensor {
        assert_eq!(
            ne[0] % blck_size(dtype),
            0,
            "fastest dimension ({}) must be a whole number of {} blocks",
            ne[0],
            dtype
        );
        let nb = contiguous_strides(dtype, &ne);
        let nbytes = type_bytes(dtype, ne.iter().product());
        // Leaves are allocated eagerly even in planned mode so that input
        // data can be written while the graph is still being built.
        let data = self.inner.alloc(nbytes);
        self.push_node(TensorMeta {
            dtype,
            n_dims,
            ne,
            nb,
            op: Op::None,
            src0: None,
            src1: None,
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Result storage for an op node: eager contexts allocate now, planned
    /// contexts defer to the planner, recorders only account.
    fn op_output(&self, dtype: Type, n_dims: usize, ne: [usize; MAX_DIMS]) -> DataLoc {
        let nbytes = type_bytes(dtype, ne.iter().product());
        match self.inner.mode {
            ContextMode::Planned => DataLoc::None,
            _ => self.inner.alloc(nbytes),
        }
    }

    fn node_ref(&self, t: &Tensor) -> NodeRef {
        if Arc::ptr_eq(&self.inner, &t.ctx) {
            NodeRef::Local(t.idx)
        } else {
            NodeRef::Foreign(t.share())
        }
    }

    /// Creates a new 1-dimensional tensor.
    pub fn new_tensor_1d(&self, dtype: Type, ne0: usize) -> Tensor {
        self.new_leaf(dtype, 1, [ne0, 1, 1, 1])
    }

    /// Creates a new 2-dimensional tensor. `ne0` is the fastest-varying
    /// dimension.
    pub fn new_tensor_2d(&self, dtype: Type, ne0: usize, ne1: usize) -> Tensor {
        self.new_leaf(dtype, 2, [ne0, ne1, 1, 1])
    }

    /// Creates a new 3-dimensional tensor.
    pub fn new_tensor_3d(&self, dtype: Type, ne0: usize, ne1: usize, ne2: usize) -> Tensor {
        self.new_leaf(dtype, 3, [ne0, ne1, ne2, 1])
    }

    /// Creates a single-element f32 tensor holding `value`.
    pub fn new_f32(&self, value: f32) -> Tensor {
        let t = self.new_tensor_1d(Type::F32, 1);
        t.write_data(&value.to_le_bytes());
        t
    }

    fn elementwise_binary(&self, op: Op, a: &Tensor, b: &Tensor) -> Tensor {
        let (am, bm) = (a.meta(), b.meta());
        assert_eq!(am.ne, bm.ne, "{}: operand shapes differ", op.name());
        assert_eq!(am.dtype, Type::F32, "{}: only f32 is supported", op.name());
        assert_eq!(bm.dtype, Type::F32, "{}: only f32 is supported", op.name());
        let data = self.op_output(Type::F32, am.n_dims, am.ne);
        self.push_node(TensorMeta {
            dtype: Type::F32,
            n_dims: am.n_dims,
            ne: am.ne,
            nb: contiguous_strides(Type::F32, &am.ne),
            op,
            src0: Some(self.node_ref(a)),
            src1: Some(self.node_ref(b)),
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Elementwise `a + b`. Broadcast `b` explicitly with [Context::op_repeat]
    /// first if the shapes differ.
    pub fn op_add(&self, a: &Tensor, b: &Tensor) -> Tensor {
        self.elementwise_binary(Op::Add, a, b)
    }

    /// Elementwise `a * b`.
    pub fn op_mul(&self, a: &Tensor, b: &Tensor) -> Tensor {
        self.elementwise_binary(Op::Mul, a, b)
    }

    /// Broadcasts `a` to the shape of `like`.
    pub fn op_repeat(&self, a: &Tensor, like: &Tensor) -> Tensor {
        let (am, lm) = (a.meta(), like.meta());
        assert_eq!(am.dtype, Type::F32, "repeat: only f32 is supported");
        for d in 0..MAX_DIMS {
            assert_eq!(
                lm.ne[d] % am.ne[d],
                0,
                "repeat: dimension {d} ({} -> {}) does not divide",
                am.ne[d],
                lm.ne[d]
            );
        }
        let data = self.op_output(Type::F32, lm.n_dims, lm.ne);
        self.push_node(TensorMeta {
            dtype: Type::F32,
            n_dims: lm.n_dims,
            ne: lm.ne,
            nb: contiguous_strides(Type::F32, &lm.ne),
            op: Op::Repeat,
            src0: Some(self.node_ref(a)),
            src1: None,
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Matrix product with transposed second operand:
    /// `a: [N, M]`, `b: [N, P]` → `[M, P]`, reducing over the shared fastest
    /// dimension `N`. Higher dimensions are batched and must match. `a` may
    /// be f32, f16 or quantized; `b` must be f32.
    pub fn op_mul_mat(&self, a: &Tensor, b: &Tensor) -> Tensor {
        let (am, bm) = (a.meta(), b.meta());
        assert_eq!(am.ne[0], bm.ne[0], "mul_mat: reduction dimensions differ");
        assert_eq!(am.ne[2], bm.ne[2], "mul_mat: batch dimensions differ");
        assert_eq!(am.ne[3], bm.ne[3], "mul_mat: batch dimensions differ");
        assert_eq!(bm.dtype, Type::F32, "mul_mat: second operand must be f32");
        let ne = [am.ne[1], bm.ne[1], am.ne[2], am.ne[3]];
        let n_dims = am.n_dims.max(bm.n_dims);
        let data = self.op_output(Type::F32, n_dims, ne);
        self.push_node(TensorMeta {
            dtype: Type::F32,
            n_dims,
            ne,
            nb: contiguous_strides(Type::F32, &ne),
            op: Op::MulMat,
            src0: Some(self.node_ref(a)),
            src1: Some(self.node_ref(b)),
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Embedding lookup: `table: [D, V]`, `ids: [T]` (i32) → `[D, T]` (f32).
    /// The table may be f32, f16 or quantized.
    pub fn op_get_rows(&self, table: &Tensor, ids: &Tensor) -> Tensor {
        let (tm, im) = (table.meta(), ids.meta());
        assert_eq!(im.dtype, Type::I32, "get_rows: ids must be i32");
        assert_eq!(im.n_dims, 1, "get_rows: ids must be one-dimensional");
        let ne = [tm.ne[0], im.ne[0], 1, 1];
        let data = self.op_output(Type::F32, 2, ne);
        self.push_node(TensorMeta {
            dtype: Type::F32,
            n_dims: 2,
            ne,
            nb: contiguous_strides(Type::F32, &ne),
            op: Op::GetRows,
            src0: Some(self.node_ref(table)),
            src1: Some(self.node_ref(ids)),
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Copies `src` into `dst`'s storage at execute time; the result node has
    /// `dst`'s shape and aliases its bytes. Used to materialize views
    /// contiguously and to commit KV cache slots.
    pub fn op_cpy(&self, src: &Tensor, dst: &Tensor) -> Tensor {
        let (sm, dm) = (src.meta(), dst.meta());
        assert_eq!(
            sm.nelements(),
            dm.nelements(),
            "cpy: element counts differ ({} vs {})",
            sm.nelements(),
            dm.nelements()
        );
        self.push_node(TensorMeta {
            dtype: dm.dtype,
            n_dims: dm.n_dims,
            ne: dm.ne,
            nb: dm.nb,
            op: Op::Cpy,
            src0: Some(self.node_ref(src)),
            src1: Some(self.node_ref(dst)),
            data: DataLoc::View {
                base: self.node_ref(dst),
                byte_offset: 0,
            },
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    fn inplace_unary(&self, op: Op, a: &Tensor, src1: Option<NodeRef>) -> Tensor {
        let am = a.meta();
        self.push_node(TensorMeta {
            dtype: am.dtype,
            n_dims: am.n_dims,
            ne: am.ne,
            nb: am.nb,
            op,
            src0: Some(self.node_ref(a)),
            src1,
            data: DataLoc::View {
                base: self.node_ref(a),
                byte_offset: 0,
            },
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Multiplies every element of `a` by the single-element tensor `s`,
    /// reusing `a`'s storage.
    pub fn op_scale_inplace(&self, a: &Tensor, s: &Tensor) -> Tensor {
        assert_eq!(s.meta().nelements(), 1, "scale: scale must be a scalar tensor");
        let src1 = Some(self.node_ref(s));
        self.inplace_unary(Op::Scale, a, src1)
    }

    /// Numerically-stable softmax over the fastest dimension, reusing `a`'s
    /// storage.
    pub fn op_soft_max_inplace(&self, a: &Tensor) -> Tensor {
        self.inplace_unary(Op::SoftMax, a, None)
    }

    /// Masks the upper triangle beyond column `n_past` with `-inf`: element
    /// `[i, j]` is masked when `i > n_past + j`. The causal mask for
    /// autoregressive attention.
    pub fn op_diag_mask_inf_inplace(&self, a: &Tensor, n_past: usize) -> Tensor {
        self.inplace_unary(Op::DiagMaskInf { n_past }, a, None)
    }

    /// LayerNorm-style normalization over the fastest dimension: subtract the
    /// mean, divide by `sqrt(variance + eps)`. Scale and shift are separate
    /// `mul`/`add` nodes.
    pub fn op_norm(&self, a: &Tensor, eps: f32) -> Tensor {
        let am = a.meta();
        assert_eq!(am.dtype, Type::F32, "norm: only f32 is supported");
        let data = self.op_output(Type::F32, am.n_dims, am.ne);
        self.push_node(TensorMeta {
            dtype: Type::F32,
            n_dims: am.n_dims,
            ne: am.ne,
            nb: contiguous_strides(Type::F32, &am.ne),
            op: Op::Norm { eps },
            src0: Some(self.node_ref(a)),
            src1: None,
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Elementwise GELU (tanh approximation).
    pub fn op_gelu(&self, a: &Tensor) -> Tensor {
        let am = a.meta();
        assert_eq!(am.dtype, Type::F32, "gelu: only f32 is supported");
        let data = self.op_output(Type::F32, am.n_dims, am.ne);
        self.push_node(TensorMeta {
            dtype: Type::F32,
            n_dims: am.n_dims,
            ne: am.ne,
            nb: contiguous_strides(Type::F32, &am.ne),
            op: Op::Gelu,
            src0: Some(self.node_ref(a)),
            src1: None,
            data,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// A 1-D window of `ne0` elements into `a`, starting `offset` elements in.
    /// No copy; the result aliases `a`'s bytes.
    pub fn op_view_1d(&self, a: &Tensor, ne0: usize, offset: usize) -> Tensor {
        let am = a.meta();
        let bs = blck_size(am.dtype);
        assert_eq!(offset % bs, 0, "view_1d: offset must be block-aligned");
        assert!(
            offset + ne0 <= am.nelements(),
            "view_1d: window [{}..{}] exceeds {} elements",
            offset,
            offset + ne0,
            am.nelements()
        );
        let ne = [ne0, 1, 1, 1];
        self.push_node(TensorMeta {
            dtype: am.dtype,
            n_dims: 1,
            ne,
            nb: contiguous_strides(am.dtype, &ne),
            op: Op::View,
            src0: Some(self.node_ref(a)),
            src1: None,
            data: DataLoc::View {
                base: self.node_ref(a),
                byte_offset: offset / bs * type_size(am.dtype),
            },
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// A 2-D window of `ne0 × ne1` elements into `a`, starting `offset`
    /// elements in. Rows keep `a`'s row stride, so a view can select a column
    /// band of a wider matrix (e.g. one of the fused q/k/v heads).
    pub fn op_view_2d(&self, a: &Tensor, ne0: usize, ne1: usize, offset: usize) -> Tensor {
        let am = a.meta();
        let bs = blck_size(am.dtype);
        assert_eq!(offset % bs, 0, "view_2d: offset must be block-aligned");
        assert!(ne0 <= am.ne[0], "view_2d: row width exceeds source");
        let ne = [ne0, ne1, 1, 1];
        let mut nb = contiguous_strides(am.dtype, &ne);
        nb[1] = am.nb[1];
        for k in 2..MAX_DIMS {
            nb[k] = nb[k - 1] * ne[k - 1];
        }
        self.push_node(TensorMeta {
            dtype: am.dtype,
            n_dims: 2,
            ne,
            nb,
            op: Op::View,
            src0: Some(self.node_ref(a)),
            src1: None,
            data: DataLoc::View {
                base: self.node_ref(a),
                byte_offset: offset / bs * type_size(am.dtype),
            },
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    fn reshape(&self, a: &Tensor, n_dims: usize, ne: [usize; MAX_DIMS]) -> Tensor {
        let am = a.meta();
        assert!(am.is_contiguous(), "reshape: source must be contiguous");
        assert_eq!(
            am.nelements(),
            ne.iter().product::<usize>(),
            "reshape: element counts differ"
        );
        self.push_node(TensorMeta {
            dtype: am.dtype,
            n_dims,
            ne,
            nb: contiguous_strides(am.dtype, &ne),
            op: Op::Reshape,
            src0: Some(self.node_ref(a)),
            src1: None,
            data: DataLoc::View {
                base: self.node_ref(a),
                byte_offset: 0,
            },
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Reinterprets contiguous `a` as a 1-D tensor.
    pub fn op_reshape_1d(&self, a: &Tensor, ne0: usize) -> Tensor {
        self.reshape(a, 1, [ne0, 1, 1, 1])
    }

    /// Reinterprets contiguous `a` as a 2-D tensor.
    pub fn op_reshape_2d(&self, a: &Tensor, ne0: usize, ne1: usize) -> Tensor {
        self.reshape(a, 2, [ne0, ne1, 1, 1])
    }

    /// Reinterprets contiguous `a` as a 3-D tensor.
    pub fn op_reshape_3d(&self, a: &Tensor, ne0: usize, ne1: usize, ne2: usize) -> Tensor {
        self.reshape(a, 3, [ne0, ne1, ne2, 1])
    }

    /// Logical axis swap: axis `i` of `a` becomes axis `axes[i]` of the
    /// result. Zero-copy; only the strides change.
    pub fn op_permute(
        &self,
        a: &Tensor,
        axis0: usize,
        axis1: usize,
        axis2: usize,
        axis3: usize,
    ) -> Tensor {
        let axes = [axis0, axis1, axis2, axis3];
        let mut seen = [false; MAX_DIMS];
        for &ax in &axes {
            assert!(ax < MAX_DIMS && !seen[ax], "permute: invalid axis set {axes:?}");
            seen[ax] = true;
        }
        let am = a.meta();
        let mut ne = [0usize; MAX_DIMS];
        let mut nb = [0usize; MAX_DIMS];
        for i in 0..MAX_DIMS {
            ne[axes[i]] = am.ne[i];
            nb[axes[i]] = am.nb[i];
        }
        self.push_node(TensorMeta {
            dtype: am.dtype,
            n_dims: am.n_dims,
            ne,
            nb,
            op: Op::Permute,
            src0: Some(self.node_ref(a)),
            src1: None,
            data: DataLoc::View {
                base: self.node_ref(a),
                byte_offset: 0,
            },
            name: [0; MAX_NAME_LEN],
            name_len: 0,
        })
    }

    /// Places the op outputs of a planned context by walking `graph` in
    /// execution order. Tensors whose last consumer has already been
    /// scheduled donate their bytes back to a free list, so disjoint
    /// lifetimes share arena space.
    ///
    /// Panics if called on a context that is not in planned mode, or if the
    /// arena is too small for the peak working set.
    pub fn plan_from_graph(&self, graph: &ComputationGraph) {
        assert_eq!(
            self.inner.mode,
            ContextMode::Planned,
            "plan_from_graph: context is not in planned mode"
        );

        fn each_local_src_root(
            inner: &Arc<RawContext>,
            t: &Tensor,
            f: &mut dyn FnMut(usize),
        ) {
            if !Arc::ptr_eq(&t.ctx, inner) {
                return;
            }
            let meta = &inner.nodes()[t.idx];
            for src in [&meta.src0, &meta.src1].into_iter().flatten() {
                if let NodeRef::Local(i) = src {
                    if let Some(root) = inner.storage_root(*i) {
                        f(root);
                    }
                }
            }
        }

        // Remaining-consumer counts per storage root, local nodes only.
        let mut pending: std::collections::HashMap<usize, usize> = Default::default();
        for node in graph.nodes() {
            each_local_src_root(&self.inner, node, &mut |root| {
                *pending.entry(root).or_insert(0) += 1;
            });
        }

        // First-fit free list of (offset, size) holes.
        let mut free: Vec<(usize, usize)> = Vec::new();
        let mut placed_size: std::collections::HashMap<usize, usize> = Default::default();

        for node in graph.nodes() {
            if !Arc::ptr_eq(&node.ctx, &self.inner) {
                continue;
            }
            let needs_placement = {
                let meta = &self.inner.nodes()[node.idx];
                matches!(meta.data, DataLoc::None)
            };
            if needs_placement {
                let nbytes = {
                    let meta = &self.inner.nodes()[node.idx];
                    meta.nbytes().div_ceil(ARENA_ALIGN) * ARENA_ALIGN
                };
                let offset = match free
                    .iter()
                    .position(|&(_, size)| size >= nbytes)
                {
                    Some(slot) => {
                        let (off, size) = free[slot];
                        if size > nbytes {
                            free[slot] = (off + nbytes, size - nbytes);
                        } else {
                            free.remove(slot);
                        }
                        off
                    }
                    None => {
                        let off = self.inner.used.get();
                        assert!(
                            off + nbytes + TENSOR_OVERHEAD <= self.inner.capacity,
                            "planned arena exhausted at node `{}`",
                            self.inner.nodes()[node.idx].op.name()
                        );
                        self.inner.used.set(off + nbytes + TENSOR_OVERHEAD);
                        off
                    }
                };
                self.inner.nodes_mut()[node.idx].data = DataLoc::Arena(offset);
                placed_size.insert(node.idx, nbytes);
            }

            // Release sources whose last consumer was this node.
            each_local_src_root(&self.inner, node, &mut |root| {
                let count = pending.get_mut(&root).expect("pending count exists");
                *count -= 1;
                if *count == 0 {
                    if let Some(&size) = placed_size.get(&root) {
                        if let DataLoc::Arena(off) = self.inner.nodes()[root].data {
                            free.push((off, size));
                        }
                    }
                }
            });
        }
    }
}
