//! Raw latent dumps for external tooling.
//!
//! Little-endian layout: `ndims: u64`, then `ndims` dims as u64, then the
//! f32 element data. The per-step checkpoint writes in the sampling loop
//! are best-effort consumers of [`write_latent`]; read support exists for
//! the verification binary and tests.

use candle_core::{DType, Device, Tensor};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub fn write_latent(path: impl AsRef<Path>, tensor: &Tensor) -> candle_core::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    let dims = tensor.dims();
    out.write_all(&(dims.len() as u64).to_le_bytes())?;
    for &d in dims {
        out.write_all(&(d as u64).to_le_bytes())?;
    }

    let data = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

pub fn read_latent(path: impl AsRef<Path>, device: &Device) -> candle_core::Result<Tensor> {
    let mut file = File::open(path)?;

    let ndims = read_u64(&mut file)? as usize;
    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        dims.push(read_u64(&mut file)? as usize);
    }

    let numel: usize = dims.iter().product();
    let mut bytes = vec![0u8; numel * 4];
    file.read_exact(&mut bytes)?;
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Tensor::from_vec(data, dims, device)
}

fn read_u64(file: &mut File) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_exact() {
        let dev = Device::Cpu;
        let mut rng = crate::rng::Pcg32::seed_from(5);
        let t = rng.randn((2, 3, 4, 4), &dev).unwrap();

        let dir = std::env::temp_dir().join("candle-ddim-checkpoint-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("latent.bin");

        write_latent(&path, &t).unwrap();
        let back = read_latent(&path, &dev).unwrap();

        assert_eq!(back.dims(), t.dims());
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
