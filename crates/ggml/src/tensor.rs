use std::sync::Arc;

use crate::context::{RawContext, TensorMeta};
use crate::{type_size, Type, MAX_NAME_LEN};

/// A tensor: a node in a context's arena, referring to typed, strided,
/// possibly not-yet-computed data.
///
/// Handles share ownership of their context, so a tensor can never outlive
/// the arena its metadata and data live in. Cloning a handle
/// ([Tensor::share]) is cheap and does not copy any data.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) ctx: Arc<RawContext>,
    pub(crate) idx: usize,
}

impl Tensor {
    /// Creates a shared instance of this tensor: a second handle onto the
    /// same node.
    pub fn share(&self) -> Tensor {
        Tensor {
            ctx: self.ctx.clone(),
            idx: self.idx,
        }
    }

    pub(crate) fn meta(&self) -> &TensorMeta {
        &self.ctx.nodes()[self.idx]
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn meta_mut(&self) -> &mut TensorMeta {
        &mut self.ctx.nodes_mut()[self.idx]
    }

    pub(crate) fn same_node(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.ctx, &other.ctx) && self.idx == other.idx
    }

    /// The element type of this tensor.
    pub fn get_type(&self) -> Type {
        self.meta().dtype
    }

    /// The number of dimensions.
    pub fn n_dims(&self) -> usize {
        self.meta().n_dims
    }

    /// The shape of this tensor, front-to-back: element `0` is the
    /// fastest-varying dimension. Trailing dimensions of size 1 are trimmed
    /// to [Tensor::n_dims] entries.
    pub fn shape(&self) -> Vec<usize> {
        let meta = self.meta();
        meta.ne[..meta.n_dims].to_vec()
    }

    /// The byte strides of this tensor.
    pub fn get_nb(&self) -> [usize; crate::MAX_DIMS] {
        self.meta().nb
    }

    /// The number of logical elements.
    pub fn nelements(&self) -> usize {
        self.meta().nelements()
    }

    /// The number of bytes of storage:
    /// `nelements / block_size * element_size`.
    pub fn nbytes(&self) -> usize {
        self.meta().nbytes()
    }

    /// The size of one storage block, in bytes.
    pub fn element_size(&self) -> usize {
        type_size(self.meta().dtype)
    }

    /// Whether the element layout is that of a freshly allocated tensor of
    /// the same shape (no permuted strides, no row gaps).
    pub fn is_contiguous(&self) -> bool {
        self.meta().is_contiguous()
    }

    /// Sets the tensor's name, truncating to [MAX_NAME_LEN] bytes.
    pub fn set_name(&self, name: &str) {
        let meta = self.meta_mut();
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_LEN);
        meta.name[..len].copy_from_slice(&bytes[..len]);
        meta.name_len = len as u8;
    }

    /// The tensor's name.
    pub fn name(&self) -> String {
        let meta = self.meta();
        String::from_utf8_lossy(&meta.name[..meta.name_len as usize]).into_owned()
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.ctx.resolve_data(self.idx)
    }

    /// Copies `src` into the tensor's storage. The tensor must be contiguous
    /// and `src` must be exactly [Tensor::nbytes] long; anything else is a
    /// programmer error.
    pub fn write_data(&self, src: &[u8]) {
        assert!(self.is_contiguous(), "write_data: tensor must be contiguous");
        assert_eq!(
            src.len(),
            self.nbytes(),
            "write_data: buffer is {} bytes, tensor holds {}",
            src.len(),
            self.nbytes()
        );
        // SAFETY: the context hands out non-overlapping storage regions, and
        // callers follow the single-writer discipline documented on
        // RawContext.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr(), src.len());
        }
    }

    /// Fills an i32 tensor from a slice of values.
    pub fn set_data_from_i32s(&self, values: &[i32]) {
        assert_eq!(self.get_type(), Type::I32, "set_data_from_i32s: tensor is not i32");
        assert_eq!(
            values.len(),
            self.nelements(),
            "set_data_from_i32s: {} values for {} elements",
            values.len(),
            self.nelements()
        );
        self.write_data(bytemuck::cast_slice(values));
    }

    /// Copies the tensor's bytes out. The tensor must be contiguous.
    pub fn read_data(&self) -> Vec<u8> {
        assert!(self.is_contiguous(), "read_data: tensor must be contiguous");
        let mut out = vec![0u8; self.nbytes()];
        // SAFETY: as in write_data.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Reads the tensor as a vector of f32 values. The tensor must be
    /// contiguous f32.
    pub fn read_f32s(&self) -> Vec<f32> {
        assert_eq!(self.get_type(), Type::F32, "read_f32s: tensor is not f32");
        self.read_data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Reads the tensor as a vector of i32 values. The tensor must be
    /// contiguous i32.
    pub fn read_i32s(&self) -> Vec<i32> {
        assert_eq!(self.get_type(), Type::I32, "read_i32s: tensor is not i32");
        self.read_data()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
