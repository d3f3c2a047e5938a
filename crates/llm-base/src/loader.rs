use std::collections::BTreeMap;
use std::io::BufRead;

use ggml::{quantize, util, CancelToken};
use half::f16;
use thiserror::Error;

use crate::model::Model;
use crate::model_desc::ModelDescLeaf;

/// Each variant represents a step within the process of loading the model.
/// These can be used to report progress to the user.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LoadProgress {
    /// The hyperparameters have been loaded from the model.
    HyperparametersLoaded,
    /// The context has been created.
    ContextSize {
        /// The size of the context.
        bytes: usize,
    },
    /// A tensor has been loaded.
    TensorLoaded {
        /// How many tensors have been loaded so far.
        current_tensor: usize,
    },
    /// The model has finished fully loading.
    Loaded {
        /// The number of tensors in the model.
        tensor_count: usize,
    },
}

/// Errors encountered during the loading process.
#[derive(Error, Debug)]
pub enum LoadError {
    /// An invalid magic number was encountered during the loading process.
    #[error("invalid magic number {magic:#010x}, expected {expected:#010x}")]
    InvalidMagic {
        /// The magic number that was encountered.
        magic: u32,
        /// The magic number that was expected.
        expected: u32,
    },
    /// The `ftype` hyperparameter had an invalid value.
    #[error("unsupported ftype: {0}")]
    UnsupportedFileType(i32),
    /// A tensor record named a tensor that is not part of the model
    /// description.
    #[error("unknown tensor `{tensor_name}`")]
    UnknownTensor {
        /// The name of the tensor.
        tensor_name: String,
    },
    /// A tensor record's shape did not match the model description.
    #[error("tensor `{tensor_name}` has {actual} elements on disk, expected {expected}")]
    TensorWrongSize {
        /// The name of the tensor.
        tensor_name: String,
        /// The element count the description requires.
        expected: usize,
        /// The element count found on disk.
        actual: usize,
    },
    /// A tensor record used an element type the loader cannot convert.
    #[error("cannot convert tensor `{tensor_name}` from {from} to {to}")]
    UnsupportedConversion {
        /// The name of the tensor.
        tensor_name: String,
        /// The on-disk element type.
        from: String,
        /// The in-memory element type the description asks for.
        to: String,
    },
    /// An invariant of the file format was broken.
    #[error("invariant broken: {invariant}")]
    InvariantBroken {
        /// The invariant that was broken.
        invariant: String,
    },
    /// A non-specific I/O error.
    #[error("non-specific I/O error")]
    Io(#[from] std::io::Error),
    /// The load was cancelled.
    #[error("the load was cancelled")]
    Cancelled,
}

/// How a model should be realized in memory.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    /// On-load quantization, if any.
    pub quantization: Option<QuantizationConfig>,
}

/// A request to quantize matching rank-2 weights while loading.
#[derive(Debug, Clone)]
pub struct QuantizationConfig {
    /// The element type to quantize to.
    pub target: ggml::Type,
    /// Weight paths to quantize (regular expressions).
    pub include: Vec<String>,
    /// Weight paths to leave alone even if matched by `include`.
    pub exclude: Vec<String>,
}

/// Sums the bytes every leaf of a flattened description needs at its
/// (possibly quantization-rewritten) element type, plus per-tensor overhead.
/// This is the arena size for the model's context.
pub fn estimate_model_size(flattened: &BTreeMap<String, ModelDescLeaf>) -> usize {
    flattened
        .values()
        .map(|leaf| {
            ggml::type_bytes(leaf.dtype, leaf.nelements()) + ggml::tensor_overhead()
        })
        .sum()
}

/// Reads the magic number that opens every model stream.
pub fn consume_magic(reader: &mut dyn BufRead) -> Result<(), LoadError> {
    let magic = util::read_u32(reader)?;
    if magic != ggml::FILE_MAGIC_GGML {
        return Err(LoadError::InvalidMagic {
            magic,
            expected: ggml::FILE_MAGIC_GGML,
        });
    }
    Ok(())
}

/// Streams tensor records into `model` until EOF, converting element types
/// where the in-memory description differs from the on-disk one. Returns the
/// names that were actually present in the stream, for tied-weight aliasing.
pub fn load_weights(
    reader: &mut impl BufRead,
    model: &Model,
    cancel: &CancelToken,
    mut progress: impl FnMut(LoadProgress),
) -> Result<Vec<String>, LoadError> {
    let mut loaded = Vec::new();
    let mut histograms: BTreeMap<ggml::Type, Vec<i64>> = BTreeMap::new();

    while util::has_data_left(reader)? {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let n_dims = util::read_i32(reader)? as usize;
        let name_len = util::read_i32(reader)? as usize;
        let on_disk_type = util::read_i32(reader)?;
        if n_dims > 2 {
            return Err(LoadError::InvariantBroken {
                invariant: format!("tensor records may have at most 2 dimensions, got {n_dims}"),
            });
        }
        let on_disk_type = ggml::Type::try_from(on_disk_type as u32).map_err(|_| {
            LoadError::InvariantBroken {
                invariant: format!("unknown on-disk element type {on_disk_type}"),
            }
        })?;

        let mut dims = [1usize; 2];
        for dim in dims.iter_mut().take(n_dims) {
            *dim = util::read_i32(reader)? as usize;
        }
        let name = String::from_utf8_lossy(&util::read_bytes_with_len(reader, name_len)?)
            .into_owned();

        let tensor = model.get(&name).ok_or_else(|| LoadError::UnknownTensor {
            tensor_name: name.clone(),
        })?;

        let n_elements = dims[0] * dims[1];
        if n_elements != tensor.nelements() {
            return Err(LoadError::TensorWrongSize {
                tensor_name: name,
                expected: tensor.nelements(),
                actual: n_elements,
            });
        }

        let on_disk_bytes = ggml::type_bytes(on_disk_type, n_elements);
        if on_disk_type == tensor.get_type() {
            if on_disk_bytes != tensor.nbytes() {
                return Err(LoadError::TensorWrongSize {
                    tensor_name: name,
                    expected: tensor.nbytes(),
                    actual: on_disk_bytes,
                });
            }
            tensor.write_data(&util::read_bytes_with_len(reader, on_disk_bytes)?);
        } else {
            convert_record(
                reader,
                &name,
                on_disk_type,
                &tensor,
                dims[0],
                &mut histograms,
            )?;
        }

        loaded.push(name);
        progress(LoadProgress::TensorLoaded {
            current_tensor: loaded.len(),
        });
    }

    for (dtype, hist) in &histograms {
        log::debug!("quantization histogram for {dtype}: {hist:?}");
    }
    progress(LoadProgress::Loaded {
        tensor_count: loaded.len(),
    });

    Ok(loaded)
}

/// Reads one record whose on-disk type differs from the tensor's type.
/// f32/f16 sources are canonicalized to f32 first; the target is then either
/// the other float width or a quantized type (block-wise along the fastest
/// axis, i.e. per row).
fn convert_record(
    reader: &mut impl BufRead,
    name: &str,
    from: ggml::Type,
    tensor: &ggml::Tensor,
    row_len: usize,
    histograms: &mut BTreeMap<ggml::Type, Vec<i64>>,
) -> Result<(), LoadError> {
    let to = tensor.get_type();
    let unsupported = || LoadError::UnsupportedConversion {
        tensor_name: name.to_owned(),
        from: from.to_string(),
        to: to.to_string(),
    };

    let n = tensor.nelements();
    let values: Vec<f32> = match from {
        ggml::Type::F32 => {
            let bytes = util::read_bytes_with_len(reader, n * 4)?;
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
        ggml::Type::F16 => {
            let bytes = util::read_bytes_with_len(reader, n * 2)?;
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()
        }
        _ => return Err(unsupported()),
    };

    match to {
        ggml::Type::F32 => {
            tensor.write_data(bytemuck::cast_slice(&values));
        }
        ggml::Type::F16 => {
            let halves: Vec<u8> = values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                .collect();
            tensor.write_data(&halves);
        }
        t if t.is_quantized() => {
            if row_len % ggml::blck_size(t) != 0 {
                return Err(LoadError::InvariantBroken {
                    invariant: format!(
                        "tensor `{name}` rows of {row_len} elements cannot be {t}-quantized"
                    ),
                });
            }
            let hist = histograms
                .entry(t)
                .or_insert_with(|| vec![0i64; quantize::HISTOGRAM_BUCKETS]);
            let mut out = vec![0u8; tensor.nbytes()];
            let row_bytes = ggml::type_bytes(t, row_len);
            for (row, chunk) in values.chunks_exact(row_len).enumerate() {
                quantize::quantize_row(t, chunk, &mut out[row * row_bytes..][..row_bytes], hist);
            }
            tensor.write_data(&out);
        }
        _ => return Err(unsupported()),
    }
    Ok(())
}

/// Copies `src`'s bytes into `dst` for every `(src, dst)` pair where `src`
/// was present in the stream but `dst` was not. GPT-2 checkpoints routinely
/// omit the LM head because it is tied to the token embedding.
pub fn apply_tied_weights(
    model: &Model,
    loaded: &[String],
    ties: &[(&str, &str)],
) -> Result<(), LoadError> {
    for (src, dst) in ties {
        let src_loaded = loaded.iter().any(|k| k == src);
        let dst_loaded = loaded.iter().any(|k| k == dst);
        if src_loaded && !dst_loaded {
            let src_tensor = model.get(src).ok_or_else(|| LoadError::UnknownTensor {
                tensor_name: (*src).to_owned(),
            })?;
            let dst_tensor = model.get(dst).ok_or_else(|| LoadError::UnknownTensor {
                tensor_name: (*dst).to_owned(),
            })?;
            if src_tensor.nbytes() != dst_tensor.nbytes() {
                return Err(LoadError::InvariantBroken {
                    invariant: format!(
                        "tied weights {src} and {dst} differ in size ({} vs {} bytes)",
                        src_tensor.nbytes(),
                        dst_tensor.nbytes()
                    ),
                });
            }
            dst_tensor.write_data(&src_tensor.read_data());
        }
    }
    Ok(())
}

/// A `load_progress` implementation that reports through the `log` crate.
pub fn load_progress_logger(progress: LoadProgress) {
    match progress {
        LoadProgress::HyperparametersLoaded => log::debug!("loaded hyperparameters"),
        LoadProgress::ContextSize { bytes } => {
            log::info!("model context size = {:.2} MB", bytes as f64 / (1024.0 * 1024.0))
        }
        LoadProgress::TensorLoaded { current_tensor } => {
            if current_tensor % 64 == 0 {
                log::debug!("loaded tensor {current_tensor}");
            }
        }
        LoadProgress::Loaded { tensor_count } => {
            log::info!("loading of model complete; {tensor_count} tensors")
        }
    }
}
