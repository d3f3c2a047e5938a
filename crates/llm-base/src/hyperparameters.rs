use std::fmt::{Display, Formatter};
use std::io::BufRead;

use ggml::util;

use crate::loader::LoadError;

/// How the rank-2 tensors of a model file are stored on disk.
///
/// The values are the on-disk encoding of the `ftype` hyperparameter.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Default)]
pub enum FileType {
    /// All tensors are stored as f32.
    F32,
    /// All tensors are mostly stored as `f16`, except for the 1D tensors (32-bit).
    #[default]
    MostlyF16,
    /// All tensors are mostly stored as `Q4_0`, except for the 1D tensors (32-bit).
    MostlyQ4_0,
    /// All tensors are mostly stored as `Q4_1`, except for the 1D tensors (32-bit).
    MostlyQ4_1,
    /// All tensors are mostly stored as `Q8_0`, except for the 1D tensors (32-bit).
    MostlyQ8_0,
    /// All tensors are mostly stored as `Q5_0`, except for the 1D tensors (32-bit).
    MostlyQ5_0,
    /// All tensors are mostly stored as `Q5_1`, except for the 1D tensors (32-bit).
    MostlyQ5_1,
}

impl From<FileType> for i32 {
    fn from(value: FileType) -> Self {
        match value {
            FileType::F32 => 0,
            FileType::MostlyF16 => 1,
            FileType::MostlyQ4_0 => 2,
            FileType::MostlyQ4_1 => 3,
            FileType::MostlyQ8_0 => 7,
            FileType::MostlyQ5_0 => 8,
            FileType::MostlyQ5_1 => 9,
        }
    }
}

impl TryFrom<i32> for FileType {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FileType::F32),
            1 => Ok(FileType::MostlyF16),
            2 => Ok(FileType::MostlyQ4_0),
            3 => Ok(FileType::MostlyQ4_1),
            7 => Ok(FileType::MostlyQ8_0),
            8 => Ok(FileType::MostlyQ5_0),
            9 => Ok(FileType::MostlyQ5_1),
            _ => Err(()),
        }
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FileType::F32 => write!(f, "f32"),
            FileType::MostlyF16 => write!(f, "f16"),
            FileType::MostlyQ4_0 => write!(f, "q4_0"),
            FileType::MostlyQ4_1 => write!(f, "q4_1"),
            FileType::MostlyQ8_0 => write!(f, "q8_0"),
            FileType::MostlyQ5_0 => write!(f, "q5_0"),
            FileType::MostlyQ5_1 => write!(f, "q5_1"),
        }
    }
}

impl FileType {
    /// The element type the file's default weight dtype maps to.
    pub fn weight_type(&self) -> ggml::Type {
        match self {
            FileType::F32 => ggml::Type::F32,
            FileType::MostlyF16 => ggml::Type::F16,
            FileType::MostlyQ4_0 => ggml::Type::Q4_0,
            FileType::MostlyQ4_1 => ggml::Type::Q4_1,
            FileType::MostlyQ8_0 => ggml::Type::Q8_0,
            FileType::MostlyQ5_0 => ggml::Type::Q5_0,
            FileType::MostlyQ5_1 => ggml::Type::Q5_1,
        }
    }
}

/// The six signed 32-bit hyperparameters of a GPT-2 model file, in exact
/// on-disk order.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Hyperparameters {
    /// Size of the model's vocabulary.
    pub n_vocab: usize,
    /// Size of the model's context window.
    pub n_ctx: usize,
    /// Size of the model's embedding layer.
    pub n_embd: usize,
    /// Number of attention heads.
    pub n_head: usize,
    /// Number of decoder blocks.
    pub n_layer: usize,
    /// How the weights are stored on disk.
    pub file_type: FileType,
}

impl Hyperparameters {
    /// Reads the hyperparameters from a model stream.
    ///
    /// Field order matters: the data is laid out in the file exactly in
    /// declaration order.
    pub fn read(reader: &mut dyn BufRead) -> Result<Self, LoadError> {
        Ok(Hyperparameters {
            n_vocab: read_dimension(reader, "n_vocab")?,
            n_ctx: read_dimension(reader, "n_ctx")?,
            n_embd: read_dimension(reader, "n_embd")?,
            n_head: read_dimension(reader, "n_head")?,
            n_layer: read_dimension(reader, "n_layer")?,
            file_type: {
                let ftype = util::read_i32(reader)?;
                FileType::try_from(ftype).map_err(|_| LoadError::UnsupportedFileType(ftype))?
            },
        })
    }

    /// Writes the hyperparameters in on-disk order.
    pub fn write(&self, writer: &mut dyn std::io::Write) -> Result<(), std::io::Error> {
        for value in [
            self.n_vocab as i32,
            self.n_ctx as i32,
            self.n_embd as i32,
            self.n_head as i32,
            self.n_layer as i32,
            i32::from(self.file_type),
        ] {
            util::write_i32(writer, value)?;
        }
        Ok(())
    }
}

fn read_dimension(reader: &mut dyn BufRead, name: &'static str) -> Result<usize, LoadError> {
    let value = util::read_i32(reader)?;
    usize::try_from(value).map_err(|_| LoadError::InvariantBroken {
        invariant: format!("hyperparameter {name} must be non-negative, got {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrips_through_disk_layout() {
        let hp = Hyperparameters {
            n_vocab: 50257,
            n_ctx: 1024,
            n_embd: 768,
            n_head: 12,
            n_layer: 12,
            file_type: FileType::MostlyQ5_1,
        };
        let mut bytes = Vec::new();
        hp.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 6 * 4);
        let read = Hyperparameters::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(hp, read);
    }

    #[test]
    fn unknown_ftype_is_rejected() {
        let mut bytes = Vec::new();
        for v in [10i32, 1024, 768, 12, 12, 42] {
            ggml::util::write_i32(&mut bytes, v).unwrap();
        }
        assert!(matches!(
            Hyperparameters::read(&mut Cursor::new(bytes)),
            Err(LoadError::UnsupportedFileType(42))
        ));
    }
}
