//! Scalar reference kernels for the graph executor.
//!
//! Each kernel computes one node from its sources, reading and writing
//! through the strided layouts recorded on the tensors. `mul_mat` is the only
//! kernel that fans out to worker threads; everything else is cheap enough to
//! stay on the executor thread.

use half::f16;

use crate::context::Op;
use crate::quantize;
use crate::tensor::Tensor;
use crate::{blck_size, type_size, ComputeError, Type, MAX_DIMS};

/// A resolved node: metadata copied out, data pointer resolved through view
/// chains.
struct View {
    dtype: Type,
    ne: [usize; MAX_DIMS],
    nb: [usize; MAX_DIMS],
    ptr: *mut u8,
}

impl View {
    fn of(t: &Tensor) -> View {
        let meta = t.meta();
        View {
            dtype: meta.dtype,
            ne: meta.ne,
            nb: meta.nb,
            ptr: t.data_ptr(),
        }
    }

    fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Pointer to the start of row `(i1, i2, i3)`.
    fn row(&self, i1: usize, i2: usize, i3: usize) -> *mut u8 {
        unsafe {
            self.ptr
                .add(i1 * self.nb[1] + i2 * self.nb[2] + i3 * self.nb[3])
        }
    }

    unsafe fn get_f32(&self, i0: usize, i1: usize, i2: usize, i3: usize) -> f32 {
        debug_assert_eq!(self.dtype, Type::F32);
        let p = self
            .ptr
            .add(i0 * self.nb[0] + i1 * self.nb[1] + i2 * self.nb[2] + i3 * self.nb[3]);
        (p as *const f32).read_unaligned()
    }

    unsafe fn set_f32(&self, i0: usize, i1: usize, i2: usize, i3: usize, value: f32) {
        debug_assert_eq!(self.dtype, Type::F32);
        let p = self
            .ptr
            .add(i0 * self.nb[0] + i1 * self.nb[1] + i2 * self.nb[2] + i3 * self.nb[3]);
        (p as *mut f32).write_unaligned(value)
    }
}

fn internal(op: &'static str, reason: impl Into<String>) -> ComputeError {
    ComputeError::Internal {
        op,
        reason: reason.into(),
    }
}

/// Executes a single non-view node. `work` is the plan's scratch buffer,
/// pre-split into `work_per_thread`-byte stripes.
pub(crate) fn exec_node(
    node: &Tensor,
    n_threads: usize,
    work: &mut [u8],
    work_per_thread: usize,
) -> Result<(), ComputeError> {
    let op = node.meta().op;
    let dst = View::of(node);
    let src0 = node.meta().src0.as_ref().map(|s| s.upgrade(&node.ctx));
    let src1 = node.meta().src1.as_ref().map(|s| s.upgrade(&node.ctx));
    let s0 = src0.as_ref().map(View::of);
    let s1 = src1.as_ref().map(View::of);

    match op {
        Op::Add => binary(&dst, &s0.unwrap(), &s1.unwrap(), |a, b| a + b),
        Op::Mul => binary(&dst, &s0.unwrap(), &s1.unwrap(), |a, b| a * b),
        Op::Repeat => repeat(&dst, &s0.unwrap()),
        Op::MulMat => mul_mat(&dst, &s0.unwrap(), &s1.unwrap(), n_threads, work, work_per_thread),
        Op::Gelu => unary(&dst, &s0.unwrap(), gelu_f),
        Op::Norm { eps } => norm(&dst, &s0.unwrap(), eps),
        Op::SoftMax => soft_max(&dst),
        Op::Scale => scale(&dst, &s1.unwrap()),
        Op::DiagMaskInf { n_past } => diag_mask_inf(&dst, n_past),
        Op::GetRows => get_rows(&dst, &s0.unwrap(), &s1.unwrap()),
        Op::Cpy => cpy(&dst, &s0.unwrap()),
        Op::None | Op::View | Op::Reshape | Op::Permute => Ok(()),
    }
}

fn binary(dst: &View, a: &View, b: &View, f: impl Fn(f32, f32) -> f32) -> Result<(), ComputeError> {
    for i3 in 0..dst.ne[3] {
        for i2 in 0..dst.ne[2] {
            for i1 in 0..dst.ne[1] {
                for i0 in 0..dst.ne[0] {
                    // SAFETY: indices are within every operand's shape; the
                    // shapes were checked equal at construction.
                    unsafe {
                        let v = f(a.get_f32(i0, i1, i2, i3), b.get_f32(i0, i1, i2, i3));
                        dst.set_f32(i0, i1, i2, i3, v);
                    }
                }
            }
        }
    }
    Ok(())
}

fn unary(dst: &View, a: &View, f: impl Fn(f32) -> f32) -> Result<(), ComputeError> {
    for i3 in 0..dst.ne[3] {
        for i2 in 0..dst.ne[2] {
            for i1 in 0..dst.ne[1] {
                for i0 in 0..dst.ne[0] {
                    // SAFETY: as in `binary`.
                    unsafe { dst.set_f32(i0, i1, i2, i3, f(a.get_f32(i0, i1, i2, i3))) };
                }
            }
        }
    }
    Ok(())
}

fn repeat(dst: &View, a: &View) -> Result<(), ComputeError> {
    for i3 in 0..dst.ne[3] {
        for i2 in 0..dst.ne[2] {
            for i1 in 0..dst.ne[1] {
                for i0 in 0..dst.ne[0] {
                    // SAFETY: the modulus keeps every source index in range.
                    unsafe {
                        let v = a.get_f32(
                            i0 % a.ne[0],
                            i1 % a.ne[1],
                            i2 % a.ne[2],
                            i3 % a.ne[3],
                        );
                        dst.set_f32(i0, i1, i2, i3, v);
                    }
                }
            }
        }
    }
    Ok(())
}

fn gelu_f(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    const GELU_COEF_A: f32 = 0.044_715;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF_A * x * x * x)).tanh())
}

fn norm(dst: &View, a: &View, eps: f32) -> Result<(), ComputeError> {
    let n = a.ne[0];
    for i3 in 0..a.ne[3] {
        for i2 in 0..a.ne[2] {
            for i1 in 0..a.ne[1] {
                // SAFETY: row indices are within shape.
                unsafe {
                    let mut mean = 0.0f64;
                    for i0 in 0..n {
                        mean += a.get_f32(i0, i1, i2, i3) as f64;
                    }
                    mean /= n as f64;
                    let mut var = 0.0f64;
                    for i0 in 0..n {
                        let v = a.get_f32(i0, i1, i2, i3) as f64 - mean;
                        dst.set_f32(i0, i1, i2, i3, v as f32);
                        var += v * v;
                    }
                    var /= n as f64;
                    let scale = (1.0 / (var + eps as f64).sqrt()) as f32;
                    for i0 in 0..n {
                        dst.set_f32(i0, i1, i2, i3, dst.get_f32(i0, i1, i2, i3) * scale);
                    }
                }
            }
        }
    }
    Ok(())
}

fn soft_max(dst: &View) -> Result<(), ComputeError> {
    for i3 in 0..dst.ne[3] {
        for i2 in 0..dst.ne[2] {
            for i1 in 0..dst.ne[1] {
                // SAFETY: row indices are within shape; softmax runs in
                // place over the node's own storage.
                unsafe {
                    let mut max = f32::NEG_INFINITY;
                    for i0 in 0..dst.ne[0] {
                        max = max.max(dst.get_f32(i0, i1, i2, i3));
                    }
                    let mut sum = 0.0f32;
                    for i0 in 0..dst.ne[0] {
                        let v = dst.get_f32(i0, i1, i2, i3);
                        let e = if v == f32::NEG_INFINITY {
                            0.0
                        } else {
                            (v - max).exp()
                        };
                        dst.set_f32(i0, i1, i2, i3, e);
                        sum += e;
                    }
                    let inv = 1.0 / sum;
                    for i0 in 0..dst.ne[0] {
                        dst.set_f32(i0, i1, i2, i3, dst.get_f32(i0, i1, i2, i3) * inv);
                    }
                }
            }
        }
    }
    Ok(())
}

fn scale(dst: &View, s: &View) -> Result<(), ComputeError> {
    // SAFETY: the scale operand was checked to be a single element.
    let s = unsafe { s.get_f32(0, 0, 0, 0) };
    unary(dst, dst, |v| v * s)
}

fn diag_mask_inf(dst: &View, n_past: usize) -> Result<(), ComputeError> {
    for i3 in 0..dst.ne[3] {
        for i2 in 0..dst.ne[2] {
            for i1 in 0..dst.ne[1] {
                for i0 in (n_past + i1 + 1)..dst.ne[0] {
                    // SAFETY: indices are within shape.
                    unsafe { dst.set_f32(i0, i1, i2, i3, f32::NEG_INFINITY) };
                }
            }
        }
    }
    Ok(())
}

/// Reads one source row as f32, dequantizing into `scratch` when the source
/// is not already f32. Returns a pointer and length valid until the next call
/// with the same scratch.
unsafe fn row_as_f32<'a>(
    view: &View,
    i1: usize,
    i2: usize,
    i3: usize,
    scratch: &'a mut [f32],
) -> &'a [f32] {
    let n = view.ne[0];
    let row = view.row(i1, i2, i3);
    match view.dtype {
        Type::F32 => std::slice::from_raw_parts(row as *const f32, n),
        Type::F16 => {
            let src = std::slice::from_raw_parts(row as *const u16, n);
            for (dst, &bits) in scratch[..n].iter_mut().zip(src) {
                *dst = f16::from_bits(bits).to_f32();
            }
            &scratch[..n]
        }
        t if t.is_quantized() => {
            let bytes = n / blck_size(t) * type_size(t);
            let src = std::slice::from_raw_parts(row, bytes);
            quantize::dequantize_row(t, src, &mut scratch[..n]);
            &scratch[..n]
        }
        t => panic!("mul_mat/get_rows: unsupported source type {t}"),
    }
}

fn get_rows(dst: &View, table: &View, ids: &View) -> Result<(), ComputeError> {
    let n_rows = ids.ne[0];
    let row_len = table.ne[0];
    let mut scratch = vec![0.0f32; row_len];
    for r in 0..n_rows {
        // SAFETY: the id tensor is i32 and in range of the table, checked
        // below; row pointers stay within each tensor's storage.
        unsafe {
            let id = (ids.ptr as *const i32).add(r).read_unaligned();
            if id < 0 || id as usize >= table.ne[1] {
                return Err(internal(
                    "get_rows",
                    format!("row index {id} out of range 0..{}", table.ne[1]),
                ));
            }
            let src = row_as_f32(table, id as usize, 0, 0, &mut scratch);
            let out = std::slice::from_raw_parts_mut(dst.row(r, 0, 0) as *mut f32, row_len);
            out.copy_from_slice(src);
        }
    }
    Ok(())
}

fn cpy(dst: &View, src: &View) -> Result<(), ComputeError> {
    if src.dtype != Type::F32 || dst.dtype != Type::F32 {
        return Err(internal("cpy", format!("{} -> {} copies are not supported", src.dtype, dst.dtype)));
    }
    // Pair the k-th logical element of src with the k-th logical element of
    // dst; the shapes may differ as long as the counts match.
    let total = src.nelements();
    let mut d = [0usize; MAX_DIMS];
    let mut k = 0usize;
    'outer: for i3 in 0..src.ne[3] {
        for i2 in 0..src.ne[2] {
            for i1 in 0..src.ne[1] {
                for i0 in 0..src.ne[0] {
                    // SAFETY: both walks stay within their tensor's shape.
                    unsafe {
                        let v = src.get_f32(i0, i1, i2, i3);
                        dst.set_f32(d[0], d[1], d[2], d[3], v);
                    }
                    k += 1;
                    if k == total {
                        break 'outer;
                    }
                    d[0] += 1;
                    for dim in 0..MAX_DIMS - 1 {
                        if d[dim] == dst.ne[dim] {
                            d[dim] = 0;
                            d[dim + 1] += 1;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Raw pointers that cross into worker threads. The workers write disjoint
/// output rows, per the partitioning in `mul_mat`.
struct SendView<'a>(&'a View);
unsafe impl Send for SendView<'_> {}
unsafe impl Sync for SendView<'_> {}

fn mul_mat(
    dst: &View,
    a: &View,
    b: &View,
    n_threads: usize,
    work: &mut [u8],
    work_per_thread: usize,
) -> Result<(), ComputeError> {
    let n = a.ne[0]; // reduction
    let m = a.ne[1]; // dst rows
    let p = b.ne[1]; // dst columns
    let batches = a.ne[2] * a.ne[3];

    if b.nb[0] != type_size(Type::F32) {
        return Err(internal("mul_mat", "second operand rows must be contiguous"));
    }
    if a.nb[0] != type_size(a.dtype) {
        return Err(internal("mul_mat", "first operand rows must be contiguous"));
    }

    let total_rows = batches * m;
    let workers = n_threads.clamp(1, total_rows.max(1));
    let chunk = total_rows.div_ceil(workers);

    let dst_s = SendView(dst);
    let a_s = SendView(a);
    let b_s = SendView(b);

    std::thread::scope(|scope| {
        let mut stripes = work.chunks_mut(work_per_thread.max(1));
        for w in 0..workers {
            let lo = w * chunk;
            let hi = ((w + 1) * chunk).min(total_rows);
            if lo >= hi {
                break;
            }
            let stripe = stripes.next().unwrap_or(&mut []);
            let (dst_s, a_s, b_s) = (&dst_s, &a_s, &b_s);
            let mut run = move || {
                let (dst, a, b) = (dst_s.0, a_s.0, b_s.0);
                // Dequantize into this worker's stripe of the plan's work
                // buffer; fall back to a private allocation if the stripe is
                // missing or unaligned.
                let mut scratch_vec: Vec<f32> = Vec::new();
                let scratch: &mut [f32] = if a.dtype == Type::F32 {
                    &mut []
                } else {
                    match stripe
                        .get_mut(..n * 4)
                        .and_then(|bytes| bytemuck::try_cast_slice_mut::<u8, f32>(bytes).ok())
                    {
                        Some(cast) => cast,
                        None => {
                            scratch_vec = vec![0.0f32; n];
                            &mut scratch_vec
                        }
                    }
                };
                for flat in lo..hi {
                    let (i1, batch) = (flat % m, flat / m);
                    let (i2, i3) = (batch % a.ne[2], batch / a.ne[2]);
                    // SAFETY: each worker owns a disjoint set of `i1` rows of
                    // dst; sources are read-only here.
                    unsafe {
                        let a_row = row_as_f32(a, i1, i2, i3, scratch);
                        for j in 0..p {
                            let b_row =
                                std::slice::from_raw_parts(b.row(j, i2, i3) as *const f32, n);
                            let mut acc = 0.0f32;
                            for (x, y) in a_row.iter().zip(b_row) {
                                acc += x * y;
                            }
                            dst.set_f32(i1, j, i2, i3, acc);
                        }
                    }
                }
            };
            if workers == 1 {
                run();
            } else {
                scope.spawn(run);
            }
        }
    });
    Ok(())
}
