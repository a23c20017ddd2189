//! Compression methods for ICS image data

use serde::{Deserialize, Serialize};

/// Compression methods an ICS body can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// Raw samples, no compression
    Uncompressed = 0,
    /// Gzip-framed deflate
    Gzip = 1,
    /// Historical compress(1) LZW. Read-only; writes are upgraded to gzip.
    Compress = 2,
}

impl CompressionMethod {
    /// The keyword used for this method in the text header.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Uncompressed => "uncompressed",
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::Compress => "compress",
        }
    }

    /// Parse a header keyword.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "uncompressed" => Some(CompressionMethod::Uncompressed),
            "gzip" => Some(CompressionMethod::Gzip),
            "compress" => Some(CompressionMethod::Compress),
            _ => None,
        }
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::Uncompressed
    }
}

/// Compression level (0-9, where 1 is fastest and 9 is smallest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_keywords_round_trip() {
        for method in [
            CompressionMethod::Uncompressed,
            CompressionMethod::Gzip,
            CompressionMethod::Compress,
        ] {
            assert_eq!(
                CompressionMethod::from_str_opt(method.as_str()),
                Some(method)
            );
        }
        assert_eq!(CompressionMethod::from_str_opt("lz4"), None);
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(CompressionLevel::new(12).value(), 9);
        assert_eq!(CompressionLevel::default().value(), 6);
    }
}
