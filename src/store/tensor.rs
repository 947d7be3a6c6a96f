//! Binary tensor files.
//!
//! Layout (little endian):
//! `PSNT` | version u8 | ndim u8 | dims u64 × ndim | crc32 u32 | f32 × prod(dims)
//!
//! The checksum covers the payload only.

use crate::models::{PoisonsetError, Result};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"PSNT";
const VERSION: u8 = 1;
const MAX_DIMS: usize = 8;

/// Encode a tensor into `writer`.
pub fn write_tensor<W: Write>(writer: &mut W, tensor: ArrayViewD<'_, f32>) -> Result<()> {
    let shape = tensor.shape();
    if shape.len() > MAX_DIMS {
        return Err(PoisonsetError::Codec(format!(
            "tensor has {} dims, at most {MAX_DIMS} supported",
            shape.len()
        )));
    }

    let mut payload = Vec::with_capacity(tensor.len() * 4);
    for value in tensor.iter() {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    let crc = crc32fast::hash(&payload);

    let mut header = Vec::with_capacity(4 + 2 + shape.len() * 8 + 4);
    header.extend_from_slice(MAGIC);
    header.push(VERSION);
    header.push(shape.len() as u8);
    for &dim in shape {
        header.extend_from_slice(&(dim as u64).to_le_bytes());
    }
    header.extend_from_slice(&crc.to_le_bytes());

    writer
        .write_all(&header)
        .and_then(|_| writer.write_all(&payload))
        .map_err(|e| PoisonsetError::io("writing tensor", e))
}

/// Decode a tensor from `reader`.
pub fn read_tensor<R: Read>(reader: &mut R) -> Result<ArrayD<f32>> {
    let mut magic = [0u8; 4];
    read_exact(reader, &mut magic)?;
    if &magic != MAGIC {
        return Err(PoisonsetError::Codec("not a tensor file (bad magic)".to_string()));
    }

    let mut small = [0u8; 2];
    read_exact(reader, &mut small)?;
    let [version, ndim] = small;
    if version != VERSION {
        return Err(PoisonsetError::Codec(format!(
            "unsupported tensor version {version}"
        )));
    }
    let ndim = ndim as usize;
    if ndim > MAX_DIMS {
        return Err(PoisonsetError::Codec(format!("tensor has {ndim} dims")));
    }

    let mut dims = Vec::with_capacity(ndim);
    let mut word = [0u8; 8];
    for _ in 0..ndim {
        read_exact(reader, &mut word)?;
        let dim = usize::try_from(u64::from_le_bytes(word))
            .map_err(|_| PoisonsetError::Codec("dimension overflows usize".to_string()))?;
        dims.push(dim);
    }

    let mut crc_bytes = [0u8; 4];
    read_exact(reader, &mut crc_bytes)?;
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .and_then(|n| n.checked_mul(4).map(|bytes| (n, bytes)));
    let Some((count, byte_len)) = count else {
        return Err(PoisonsetError::Codec("tensor size overflows usize".to_string()));
    };

    let mut payload = vec![0u8; byte_len];
    read_exact(reader, &mut payload)?;
    if crc32fast::hash(&payload) != expected_crc {
        return Err(PoisonsetError::Codec("tensor checksum mismatch".to_string()));
    }

    let mut values = Vec::with_capacity(count);
    for chunk in payload.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    ArrayD::from_shape_vec(IxDyn(&dims), values)
        .map_err(|e| PoisonsetError::Codec(format!("bad tensor shape: {e}")))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            PoisonsetError::Codec("truncated tensor file".to_string())
        }
        _ => PoisonsetError::io("reading tensor", e),
    })
}

/// Write a tensor file (write to `<path>.tmp`, then rename).
pub fn save_tensor(path: &Path, tensor: ArrayViewD<'_, f32>) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)
            .map_err(|e| PoisonsetError::io(format!("creating {}", temp_path.display()), e))?;
        let mut writer = BufWriter::new(file);
        write_tensor(&mut writer, tensor)?;
        writer
            .flush()
            .map_err(|e| PoisonsetError::io("flushing tensor", e))?;
    }
    fs::rename(&temp_path, path)
        .map_err(|e| PoisonsetError::io(format!("renaming {}", path.display()), e))
}

/// Read a tensor file.
pub fn load_tensor(path: &Path) -> Result<ArrayD<f32>> {
    let file = File::open(path)
        .map_err(|e| PoisonsetError::io(format!("opening {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    read_tensor(&mut reader).map_err(|e| match e {
        PoisonsetError::Codec(msg) => PoisonsetError::Codec(format!("{}: {msg}", path.display())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::TempDir;

    #[test]
    fn test_tensor_file_preserves_shape_and_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grid");
        let tensor = Array3::from_shape_fn((2, 3, 4), |(c, h, w)| (c * 100 + h * 10 + w) as f32)
            .into_dyn();

        save_tensor(&path, tensor.view()).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = load_tensor(&path).unwrap();
        assert_eq!(loaded, tensor);
    }

    #[test]
    fn test_corrupted_payload_is_detected() {
        let tensor = ArrayD::from_elem(IxDyn(&[4]), 0.5f32);
        let mut bytes = Vec::new();
        write_tensor(&mut bytes, tensor.view()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = read_tensor(&mut bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_truncated_and_foreign_files_are_rejected() {
        let tensor = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let mut bytes = Vec::new();
        write_tensor(&mut bytes, tensor.view()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            read_tensor(&mut bytes.as_slice()),
            Err(PoisonsetError::Codec(_))
        ));

        let mut foreign: &[u8] = b"\x93NUMPY\x01\x00";
        assert!(matches!(read_tensor(&mut foreign), Err(PoisonsetError::Codec(_))));
    }
}
