//! Block-quantized storage formats.
//!
//! All quantized types store 32 logical elements per block: a small header
//! (scale, and for the `_1` variants an offset) followed by packed codes.
//! 4- and 5-bit codes are packed two per byte, adjacent elements sharing a
//! byte (element `2j` in the low nibble); the fifth bits of a q5 block live
//! in a 32-bit field, bit `l` belonging to element `l`.

use half::f16;

use crate::{blck_size, type_size, Type};

/// Logical elements per quantized block.
pub const QK: usize = 32;

/// The number of buckets in a quantization histogram.
pub const HISTOGRAM_BUCKETS: usize = 16;

/// Contains the result of a quantization operation.
pub struct QuantizationResult {
    /// The quantized output.
    pub output: Vec<u8>,
    /// A histogram of the quantization codes, for diagnostics: 16 buckets
    /// spanning the type's code range.
    pub history: Vec<i64>,
}

/// Quantizes `src` to `dtype`, block-wise along the fastest axis.
///
/// `src.len()` must be a multiple of the block size. Panics on unquantized
/// target types.
pub fn quantize(dtype: Type, src: &[f32]) -> QuantizationResult {
    assert!(dtype.is_quantized(), "quantize: {dtype} is not a quantized type");
    assert_eq!(
        src.len() % blck_size(dtype),
        0,
        "quantize: {} elements is not a whole number of {} blocks",
        src.len(),
        dtype
    );
    let n_blocks = src.len() / QK;
    let mut output = vec![0u8; n_blocks * type_size(dtype)];
    let mut history = vec![0i64; HISTOGRAM_BUCKETS];
    quantize_row(dtype, src, &mut output, &mut history);
    QuantizationResult { output, history }
}

/// Quantizes one row of f32 values into `out`, recording code counts in
/// `hist`. `out` must be exactly the right size for `src.len()` elements.
pub fn quantize_row(dtype: Type, src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    assert_eq!(out.len(), src.len() / blck_size(dtype) * type_size(dtype));
    match dtype {
        Type::Q4_0 => quantize_row_q4_0(src, out, hist),
        Type::Q4_1 => quantize_row_q4_1(src, out, hist),
        Type::Q5_0 => quantize_row_q5_0(src, out, hist),
        Type::Q5_1 => quantize_row_q5_1(src, out, hist),
        Type::Q8_0 => quantize_row_q8_0(src, out, hist),
        Type::Q8_1 => quantize_row_q8_1(src, out, hist),
        _ => panic!("quantize_row: {dtype} is not a quantized type"),
    }
}

/// Dequantizes one row of `dtype` blocks into f32 values. `out.len()` selects
/// how many elements to produce and must be a multiple of the block size.
pub fn dequantize_row(dtype: Type, src: &[u8], out: &mut [f32]) {
    assert_eq!(src.len(), out.len() / blck_size(dtype) * type_size(dtype));
    match dtype {
        Type::Q4_0 => dequantize_row_q4_0(src, out),
        Type::Q4_1 => dequantize_row_q4_1(src, out),
        Type::Q5_0 => dequantize_row_q5_0(src, out),
        Type::Q5_1 => dequantize_row_q5_1(src, out),
        Type::Q8_0 => dequantize_row_q8_0(src, out),
        Type::Q8_1 => dequantize_row_q8_1(src, out),
        _ => panic!("dequantize_row: {dtype} is not a quantized type"),
    }
}

fn bucket(code: usize, n_codes: usize) -> usize {
    code * HISTOGRAM_BUCKETS / n_codes
}

fn write_f16(out: &mut [u8], value: f32) {
    out[..2].copy_from_slice(&f16::from_f32(value).to_le_bytes());
}

fn read_f16(src: &[u8]) -> f32 {
    f16::from_le_bytes([src[0], src[1]]).to_f32()
}

fn quantize_row_q4_0(src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    const BS: usize = 2 + QK / 2;
    for (block, chunk) in src.chunks_exact(QK).enumerate() {
        let out = &mut out[block * BS..(block + 1) * BS];
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in chunk {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(out, d);
        for j in 0..QK / 2 {
            let x0 = ((chunk[2 * j] * id + 8.5) as i32).clamp(0, 15) as u8;
            let x1 = ((chunk[2 * j + 1] * id + 8.5) as i32).clamp(0, 15) as u8;
            out[2 + j] = x0 | (x1 << 4);
            hist[bucket(x0 as usize, 16)] += 1;
            hist[bucket(x1 as usize, 16)] += 1;
        }
    }
}

fn dequantize_row_q4_0(src: &[u8], out: &mut [f32]) {
    const BS: usize = 2 + QK / 2;
    for (block, chunk) in out.chunks_exact_mut(QK).enumerate() {
        let src = &src[block * BS..(block + 1) * BS];
        let d = read_f16(src);
        for j in 0..QK / 2 {
            let byte = src[2 + j];
            chunk[2 * j] = ((byte & 0x0F) as i32 - 8) as f32 * d;
            chunk[2 * j + 1] = ((byte >> 4) as i32 - 8) as f32 * d;
        }
    }
}

fn quantize_row_q4_1(src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    const BS: usize = 4 + QK / 2;
    for (block, chunk) in src.chunks_exact(QK).enumerate() {
        let out = &mut out[block * BS..(block + 1) * BS];
        let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
        let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let d = (max - min) / 15.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(out, d);
        write_f16(&mut out[2..], min);
        for j in 0..QK / 2 {
            let x0 = (((chunk[2 * j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
            let x1 = (((chunk[2 * j + 1] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
            out[4 + j] = x0 | (x1 << 4);
            hist[bucket(x0 as usize, 16)] += 1;
            hist[bucket(x1 as usize, 16)] += 1;
        }
    }
}

fn dequantize_row_q4_1(src: &[u8], out: &mut [f32]) {
    const BS: usize = 4 + QK / 2;
    for (block, chunk) in out.chunks_exact_mut(QK).enumerate() {
        let src = &src[block * BS..(block + 1) * BS];
        let d = read_f16(src);
        let m = read_f16(&src[2..]);
        for j in 0..QK / 2 {
            let byte = src[4 + j];
            chunk[2 * j] = (byte & 0x0F) as f32 * d + m;
            chunk[2 * j + 1] = (byte >> 4) as f32 * d + m;
        }
    }
}

fn quantize_row_q5_0(src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    const BS: usize = 2 + 4 + QK / 2;
    for (block, chunk) in src.chunks_exact(QK).enumerate() {
        let out = &mut out[block * BS..(block + 1) * BS];
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in chunk {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        let d = max / -16.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(out, d);
        let mut qh = 0u32;
        for j in 0..QK / 2 {
            let x0 = ((chunk[2 * j] * id + 16.5) as i32).clamp(0, 31) as u8;
            let x1 = ((chunk[2 * j + 1] * id + 16.5) as i32).clamp(0, 31) as u8;
            out[6 + j] = (x0 & 0x0F) | ((x1 & 0x0F) << 4);
            qh |= (((x0 >> 4) & 1) as u32) << (2 * j);
            qh |= (((x1 >> 4) & 1) as u32) << (2 * j + 1);
            hist[bucket(x0 as usize, 32)] += 1;
            hist[bucket(x1 as usize, 32)] += 1;
        }
        out[2..6].copy_from_slice(&qh.to_le_bytes());
    }
}

fn dequantize_row_q5_0(src: &[u8], out: &mut [f32]) {
    const BS: usize = 2 + 4 + QK / 2;
    for (block, chunk) in out.chunks_exact_mut(QK).enumerate() {
        let src = &src[block * BS..(block + 1) * BS];
        let d = read_f16(src);
        let qh = u32::from_le_bytes([src[2], src[3], src[4], src[5]]);
        for j in 0..QK / 2 {
            let byte = src[6 + j];
            let x0 = (byte & 0x0F) | ((((qh >> (2 * j)) & 1) as u8) << 4);
            let x1 = (byte >> 4) | ((((qh >> (2 * j + 1)) & 1) as u8) << 4);
            chunk[2 * j] = (x0 as i32 - 16) as f32 * d;
            chunk[2 * j + 1] = (x1 as i32 - 16) as f32 * d;
        }
    }
}

fn quantize_row_q5_1(src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    const BS: usize = 4 + 4 + QK / 2;
    for (block, chunk) in src.chunks_exact(QK).enumerate() {
        let out = &mut out[block * BS..(block + 1) * BS];
        let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
        let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let d = (max - min) / 31.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(out, d);
        write_f16(&mut out[2..], min);
        let mut qh = 0u32;
        for j in 0..QK / 2 {
            let x0 = (((chunk[2 * j] - min) * id + 0.5) as i32).clamp(0, 31) as u8;
            let x1 = (((chunk[2 * j + 1] - min) * id + 0.5) as i32).clamp(0, 31) as u8;
            out[8 + j] = (x0 & 0x0F) | ((x1 & 0x0F) << 4);
            qh |= (((x0 >> 4) & 1) as u32) << (2 * j);
            qh |= (((x1 >> 4) & 1) as u32) << (2 * j + 1);
            hist[bucket(x0 as usize, 32)] += 1;
            hist[bucket(x1 as usize, 32)] += 1;
        }
        out[4..8].copy_from_slice(&qh.to_le_bytes());
    }
}

fn dequantize_row_q5_1(src: &[u8], out: &mut [f32]) {
    const BS: usize = 4 + 4 + QK / 2;
    for (block, chunk) in out.chunks_exact_mut(QK).enumerate() {
        let src = &src[block * BS..(block + 1) * BS];
        let d = read_f16(src);
        let m = read_f16(&src[2..]);
        let qh = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        for j in 0..QK / 2 {
            let byte = src[8 + j];
            let x0 = (byte & 0x0F) | ((((qh >> (2 * j)) & 1) as u8) << 4);
            let x1 = (byte >> 4) | ((((qh >> (2 * j + 1)) & 1) as u8) << 4);
            chunk[2 * j] = x0 as f32 * d + m;
            chunk[2 * j + 1] = x1 as f32 * d + m;
        }
    }
}

fn quantize_row_q8_0(src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    const BS: usize = 2 + QK;
    for (block, chunk) in src.chunks_exact(QK).enumerate() {
        let out = &mut out[block * BS..(block + 1) * BS];
        let amax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        write_f16(out, d);
        for (j, &v) in chunk.iter().enumerate() {
            let q = (v * id).round().clamp(-127.0, 127.0) as i8;
            out[2 + j] = q as u8;
            hist[bucket((q as i32 + 128) as usize, 256)] += 1;
        }
    }
}

fn dequantize_row_q8_0(src: &[u8], out: &mut [f32]) {
    const BS: usize = 2 + QK;
    for (block, chunk) in out.chunks_exact_mut(QK).enumerate() {
        let src = &src[block * BS..(block + 1) * BS];
        let d = read_f16(src);
        for (j, v) in chunk.iter_mut().enumerate() {
            *v = (src[2 + j] as i8) as f32 * d;
        }
    }
}

fn quantize_row_q8_1(src: &[f32], out: &mut [u8], hist: &mut [i64]) {
    const BS: usize = 4 + 4 + QK;
    for (block, chunk) in src.chunks_exact(QK).enumerate() {
        let out = &mut out[block * BS..(block + 1) * BS];
        let amax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let mut sum = 0i32;
        for (j, &v) in chunk.iter().enumerate() {
            let q = (v * id).round().clamp(-127.0, 127.0) as i8;
            out[8 + j] = q as u8;
            sum += q as i32;
            hist[bucket((q as i32 + 128) as usize, 256)] += 1;
        }
        out[..4].copy_from_slice(&d.to_le_bytes());
        out[4..8].copy_from_slice(&(d * sum as f32).to_le_bytes());
    }
}

fn dequantize_row_q8_1(src: &[u8], out: &mut [f32]) {
    const BS: usize = 4 + 4 + QK;
    for (block, chunk) in out.chunks_exact_mut(QK).enumerate() {
        let src = &src[block * BS..(block + 1) * BS];
        let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        for (j, v) in chunk.iter_mut().enumerate() {
            *v = (src[8 + j] as i8) as f32 * d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_error(dtype: Type, values: &[f32]) -> f32 {
        let result = quantize(dtype, values);
        let mut out = vec![0.0f32; values.len()];
        dequantize_row(dtype, &result.output, &mut out);
        values
            .iter()
            .zip(&out)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max)
    }

    #[test]
    fn quantized_roundtrip_stays_close() {
        let values: Vec<f32> = (0..64).map(|i| ((i * 37 % 64) as f32 - 32.0) / 8.0).collect();
        let spread = 8.0f32;
        assert!(roundtrip_error(Type::Q4_0, &values) <= spread / 8.0);
        assert!(roundtrip_error(Type::Q4_1, &values) <= spread / 15.0);
        assert!(roundtrip_error(Type::Q5_0, &values) <= spread / 16.0);
        assert!(roundtrip_error(Type::Q5_1, &values) <= spread / 31.0);
        assert!(roundtrip_error(Type::Q8_0, &values) <= spread / 127.0);
        assert!(roundtrip_error(Type::Q8_1, &values) <= spread / 127.0);
    }

    #[test]
    fn histogram_counts_every_code() {
        let values: Vec<f32> = (0..128).map(|i| (i as f32).sin()).collect();
        let result = quantize(Type::Q4_0, &values);
        assert_eq!(result.history.len(), HISTOGRAM_BUCKETS);
        assert_eq!(result.history.iter().sum::<i64>(), 128);
    }

    #[test]
    fn zero_block_quantizes_to_zero() {
        let values = [0.0f32; 32];
        let result = quantize(Type::Q8_0, &values);
        let mut out = [1.0f32; 32];
        dequantize_row(Type::Q8_0, &result.output, &mut out);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
