//! `ggml` is a self-contained tensor and compute-graph runtime, written in the
//! style of the `ggml` C library but with no native code underneath.
//!
//! It exposes the subset of operations needed to run GPT-style decoder models
//! (currently used to implement the [llm](../llm/index.html) library).
//!
//! `ggml` operates on a computational graph; no values will be computed until
//! [ComputationGraph::compute] is executed. All [Tensor]s are nodes in this
//! computational graph, and values cannot be retrieved until computation is
//! completed.
#![deny(missing_docs)]

mod context;
mod graph;
mod kernels;
mod tensor;

pub mod quantize;
pub mod util;

pub use context::Context;
pub use graph::{CancelToken, ComputationGraph, GraphPlan};
pub use tensor::Tensor;

#[cfg(test)]
mod tests;

/// The type of a tensor element.
pub type ElementType = Type;

/// Magic constant for `ggml` model files (unversioned).
pub const FILE_MAGIC_GGML: u32 = 0x6767_6d6c;

/// The maximum number of nodes in a [ComputationGraph].
pub const MAX_NODES: usize = 4096;

/// The maximum number of dimensions a [Tensor] can have.
pub const MAX_DIMS: usize = 4;

/// The maximum length of a tensor name, in bytes. Longer names are truncated.
pub const MAX_NAME_LEN: usize = 32;

/// Errors raised by [ComputationGraph::compute].
///
/// Shape violations and arena exhaustion are programmer errors (a wrongly
/// sized buffer or an op applied to incompatible operands) and are asserted
/// at op-construction time rather than surfaced here.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The cancel token tripped; the graph was abandoned at a node boundary.
    #[error("graph computation was cancelled")]
    Cancelled,
    /// An op encountered an invariant its constructor should have rejected.
    /// This is a bug in the caller or in the runtime, not a user error.
    #[error("internal error computing `{op}`: {reason}")]
    Internal {
        /// The op that failed.
        op: &'static str,
        /// What went wrong.
        reason: String,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
/// The type of a value in `ggml`.
///
/// The discriminants match the on-disk encoding of tensor records and are
/// stable across versions.
pub enum Type {
    /// Float 32-bit.
    #[default]
    F32,
    /// Float 16-bit.
    F16,
    /// Quantized 4-bit (type 0).
    Q4_0,
    /// Quantized 4-bit (type 1).
    Q4_1,
    /// Quantized 5-bit (type 0).
    Q5_0,
    /// Quantized 5-bit (type 1).
    Q5_1,
    /// Quantized 8-bit (type 0).
    Q8_0,
    /// Quantized 8-bit (type 1).
    Q8_1,
    /// Integer 8-bit.
    I8,
    /// Integer 16-bit.
    I16,
    /// Integer 32-bit.
    I32,
}

impl From<Type> for u32 {
    fn from(t: Type) -> Self {
        match t {
            Type::F32 => 0,
            Type::F16 => 1,
            Type::Q4_0 => 2,
            Type::Q4_1 => 3,
            Type::Q5_0 => 6,
            Type::Q5_1 => 7,
            Type::Q8_0 => 8,
            Type::Q8_1 => 9,
            Type::I8 => 16,
            Type::I16 => 17,
            Type::I32 => 18,
        }
    }
}

impl TryFrom<u32> for Type {
    type Error = ();
    fn try_from(t: u32) -> Result<Self, Self::Error> {
        match t {
            0 => Ok(Type::F32),
            1 => Ok(Type::F16),
            2 => Ok(Type::Q4_0),
            3 => Ok(Type::Q4_1),
            6 => Ok(Type::Q5_0),
            7 => Ok(Type::Q5_1),
            8 => Ok(Type::Q8_0),
            9 => Ok(Type::Q8_1),
            16 => Ok(Type::I8),
            17 => Ok(Type::I16),
            18 => Ok(Type::I32),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::F32 => write!(f, "f32"),
            Type::F16 => write!(f, "f16"),
            Type::Q4_0 => write!(f, "q4_0"),
            Type::Q4_1 => write!(f, "q4_1"),
            Type::Q5_0 => write!(f, "q5_0"),
            Type::Q5_1 => write!(f, "q5_1"),
            Type::Q8_0 => write!(f, "q8_0"),
            Type::Q8_1 => write!(f, "q8_1"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
        }
    }
}

impl Type {
    /// Returns whether this type is quantized.
    pub fn is_quantized(&self) -> bool {
        blck_size(*self) > 1
    }
}

/// The size of one storage block of `t`, in bytes.
///
/// For unquantized types this is the scalar size; for quantized types it is
/// the size of a whole block of [blck_size] logical elements.
pub fn type_size(t: Type) -> usize {
    match t {
        Type::F32 => 4,
        Type::F16 => 2,
        Type::Q4_0 => 2 + 16,
        Type::Q4_1 => 4 + 16,
        Type::Q5_0 => 2 + 4 + 16,
        Type::Q5_1 => 4 + 4 + 16,
        Type::Q8_0 => 2 + 32,
        Type::Q8_1 => 4 + 4 + 32,
        Type::I8 => 1,
        Type::I16 => 2,
        Type::I32 => 4,
    }
}

/// The number of logical elements in one storage block of `t`.
/// 1 for unquantized types.
pub fn blck_size(t: Type) -> usize {
    match t {
        Type::Q4_0 | Type::Q4_1 | Type::Q5_0 | Type::Q5_1 | Type::Q8_0 | Type::Q8_1 => 32,
        _ => 1,
    }
}

/// [type_size]/[blck_size] as float; the average number of bytes per logical
/// element. Useful for sizing arenas.
pub fn type_sizef(t: Type) -> f64 {
    type_size(t) as f64 / blck_size(t) as f64
}

/// The number of bytes needed to store `n` elements of type `t`.
///
/// For quantized types `n` must be a multiple of the block size.
pub fn type_bytes(t: Type, n: usize) -> usize {
    debug_assert_eq!(n % blck_size(t), 0, "{n} elements of {t} is not a whole number of blocks");
    n / blck_size(t) * type_size(t)
}

/// The bookkeeping overhead of a single tensor inside a context arena,
/// alignment padding included. Sizing an arena as
/// `sum(data bytes) + n_tensors * tensor_overhead()` always suffices.
pub fn tensor_overhead() -> usize {
    context::TENSOR_OVERHEAD + context::ARENA_ALIGN
}

/// The bookkeeping overhead of a computation graph.
pub fn graph_overhead() -> usize {
    context::TENSOR_OVERHEAD * 2
}

/// A buffer of memory that can be used as scratch space during computation.
/// Backed by u64 words so scalar views of it are always aligned.
pub struct Buffer {
    data: Box<[u64]>,
    len: usize,
}

impl Buffer {
    /// Creates a new zeroed buffer of the specified size in bytes.
    pub fn new(size: usize) -> Self {
        Buffer {
            data: vec![0u64; size.div_ceil(8)].into_boxed_slice(),
            len: size,
        }
    }

    /// The size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.data)[..self.len]
    }
}
