//! Codecs for compressed tile payloads

use navkit_common::{Error, Result};

/// Compression scheme for the cell payload of cached tiles
///
/// The cache never looks inside compressed bytes; any scheme that restores
/// the exact input works.
pub trait TileCacheCompressor: std::fmt::Debug {
    /// Upper bound on the compressed size of `buffer_size` input bytes
    fn max_compressed_size(&self, buffer_size: usize) -> usize;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compression with the uncompressed size prepended
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl TileCacheCompressor for Lz4Compressor {
    fn max_compressed_size(&self, buffer_size: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(buffer_size) + std::mem::size_of::<u32>()
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| {
            log::error!("LZ4 decompression failed: {e}");
            Error::Codec(e.to_string())
        })
    }
}

/// Stores payloads as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl TileCacheCompressor for NoCompression {
    fn max_compressed_size(&self, buffer_size: usize) -> usize {
        buffer_size
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_round_trip() -> Result<()> {
        let codec = Lz4Compressor;
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = codec.compress(&data)?;
        assert!(packed.len() < data.len());
        assert!(packed.len() <= codec.max_compressed_size(data.len()));
        assert_eq!(codec.decompress(&packed)?, data);
        Ok(())
    }

    #[test]
    fn test_lz4_empty_input() -> Result<()> {
        let codec = Lz4Compressor;
        assert!(codec.decompress(&codec.compress(&[])?)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_lz4_rejects_garbage() {
        let codec = Lz4Compressor;
        let err = codec.decompress(&[0xff, 0xff, 0xff, 0x7f, 1, 2, 3]);
        assert!(matches!(err, Err(Error::Codec(_))));
    }
}
