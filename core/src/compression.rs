use crate::config::TransformConfig;
use crate::{Error, Result};
use std::io::{Read, Write};
use std::sync::Arc;

/// Compression stage of the codec chain.
pub trait Compressor: Send + Sync {
    fn module(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

pub struct ZlibCompressor {
    level: flate2::Compression,
}

impl ZlibCompressor {
    pub fn new(level: Option<i32>) -> Self {
        let level = match level {
            Some(level) => flate2::Compression::new(level.clamp(0, 9) as u32),
            None => flate2::Compression::default(),
        };
        Self { level }
    }

    pub fn from_config(config: &TransformConfig) -> Result<Arc<dyn Compressor>> {
        Ok(Arc::new(Self::new(config.level)))
    }
}

impl Compressor for ZlibCompressor {
    fn module(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), self.level);
        encoder.write_all(data).map_err(|e| Error::Compression(e.to_string()))?;
        encoder.finish().map_err(|e| Error::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut result = Vec::new();
        decoder
            .read_to_end(&mut result)
            .map_err(|e| Error::Compression(e.to_string()))?;
        Ok(result)
    }
}

pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: Option<i32>) -> Self {
        Self { level: level.unwrap_or(3) }
    }

    pub fn from_config(config: &TransformConfig) -> Result<Arc<dyn Compressor>> {
        let level = config.level.unwrap_or(3);
        if !zstd::compression_level_range().contains(&level) {
            return Err(Error::Configuration(format!(
                "Invalid zstd level {} for transform {}",
                level, config.name
            )));
        }
        Ok(Arc::new(Self::new(Some(level))))
    }
}

impl Compressor for ZstdCompressor {
    fn module(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| Error::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| Error::Compression(e.to_string()))
    }
}
