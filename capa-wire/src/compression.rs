use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};

/// Compression codec applied to a produce frame payload. The discriminant is the value
/// carried in the frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Gzip = 1,
    Zstd = 2,
    Snappy = 3,
    Lz4 = 4,
}

impl CompressionType {
    /// The codec name as used in producer configuration.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
        }
    }

    /// Level used when the configuration does not name one.
    const fn default_level(&self) -> i32 {
        match self {
            Self::Gzip => 6,
            Self::Zstd => 3,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Zstd),
            3 => Ok(Self::Snappy),
            4 => Ok(Self::Lz4),
            _ => Err(value),
        }
    }
}

impl FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            other => Err(format!("unknown compression codec: {other}")),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compresses payloads with a fixed codec and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressor {
    kind: CompressionType,
    level: i32,
}

impl Compressor {
    /// Creates a compressor for `kind`. A `None` level picks the codec default
    /// (gzip 6, zstd 3); snappy and lz4 ignore the level.
    pub fn new(kind: CompressionType, level: Option<i32>) -> Self {
        Self { kind, level: level.unwrap_or_else(|| kind.default_level()) }
    }

    #[inline]
    pub const fn compression_type(&self) -> CompressionType {
        self.kind
    }

    /// Compresses `data`. With [`CompressionType::None`] the payload is copied as-is.
    pub fn compress(&self, data: &[u8]) -> Result<Bytes, io::Error> {
        match self.kind {
            CompressionType::None => Ok(Bytes::copy_from_slice(data)),
            CompressionType::Gzip => {
                let level = self.level.clamp(0, 9) as u32;
                // Optimistically allocate a quarter of the input.
                let mut encoder =
                    GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::new(level));
                encoder.write_all(data)?;
                Ok(Bytes::from(encoder.finish()?))
            }
            CompressionType::Zstd => Ok(Bytes::from(zstd::stream::encode_all(data, self.level)?)),
            CompressionType::Snappy => {
                let bytes = snap::raw::Encoder::new().compress_vec(data)?;
                Ok(Bytes::from(bytes))
            }
            CompressionType::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(data))),
        }
    }
}

/// Decompresses a payload that was compressed with `kind`.
///
/// ## Errors
/// - If the payload is not valid for the codec
pub fn decompress(kind: CompressionType, data: &[u8]) -> Result<Bytes, io::Error> {
    match kind {
        CompressionType::None => Ok(Bytes::copy_from_slice(data)),
        CompressionType::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut bytes = Vec::with_capacity(data.len() * 4);
            decoder.read_to_end(&mut bytes)?;
            Ok(Bytes::from(bytes))
        }
        CompressionType::Zstd => Ok(Bytes::from(zstd::decode_all(data)?)),
        CompressionType::Snappy => {
            let bytes = snap::raw::Decoder::new().decompress_vec(data)?;
            Ok(Bytes::from(bytes))
        }
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data).map(Bytes::from).map_err(
            |e| io::Error::new(io::ErrorKind::InvalidData, format!("lz4 decompression: {e}")),
        ),
    }
}
