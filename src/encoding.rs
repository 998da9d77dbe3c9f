//! Content-encoding negotiation
//!
//! An ordered list of codecs, each with a minimum body size below which it
//! stays inactive. The first *registered* codec whose name appears anywhere
//! in the request's `Accept-Encoding` wins, regardless of the client's token
//! order.

use std::io::{Result as IoResult, Write};
use std::sync::Arc;

use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

/// Default minimum body size for a codec to activate
pub const COMPRESS_MIN_SIZE_DEFAULT: usize = 1024;

/// A content-encoding transformation over a complete body
pub type CompressFn = Arc<dyn Fn(&[u8]) -> IoResult<Vec<u8>> + Send + Sync>;

/// One registered codec
#[derive(Clone)]
pub(crate) struct CompressEntry {
    pub(crate) name: String,
    pub(crate) codec: CompressFn,
    pub(crate) min_size: usize,
}

impl std::fmt::Debug for CompressEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressEntry")
            .field("name", &self.name)
            .field("min_size", &self.min_size)
            .finish()
    }
}

/// Ordered codec registry, immutable once the server accepts requests
#[derive(Debug, Default, Clone)]
pub(crate) struct CompressRegistry {
    entries: Vec<CompressEntry>,
    /// comma-joined codec names, precomputed for the response advertisement
    advertisement: String,
}

impl CompressRegistry {
    pub(crate) fn register(&mut self, name: &str, codec: CompressFn, min_size: usize) {
        self.entries.push(CompressEntry {
            name: name.to_owned(),
            codec,
            min_size,
        });
        if !self.advertisement.is_empty() {
            self.advertisement.push(',');
        }
        self.advertisement.push_str(name);
    }

    /// The `Accept-Encoding:` advertisement value, codec names in
    /// registration order
    pub(crate) fn advertisement(&self) -> &str {
        &self.advertisement
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Picks the codec for a response body of `content_len` bytes given the
    /// request's `Accept-Encoding` value.
    pub(crate) fn negotiate(&self, accept_encoding: &str, content_len: usize) -> Option<&CompressEntry> {
        if accept_encoding.is_empty() {
            return None;
        }

        let tokens: Vec<&str> = accept_encoding
            .split(',')
            .map(|t| t.split(';').next().unwrap_or("").trim())
            .filter(|t| !t.is_empty())
            .collect();

        self.entries.iter().find(|entry| {
            content_len >= entry.min_size
                && tokens.iter().any(|t| t.eq_ignore_ascii_case(&entry.name))
        })
    }
}

/// gzip codec function for [`register_compress`](crate::HttpServer::register_compress)
///
/// # Errors
///
/// `std::io::Error` when the encoder fails
pub fn gzip_compress(data: &[u8]) -> IoResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// deflate codec function for [`register_compress`](crate::HttpServer::register_compress)
///
/// # Errors
///
/// `std::io::Error` when the encoder fails
pub fn deflate_compress(data: &[u8]) -> IoResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use super::{deflate_compress, gzip_compress, CompressRegistry};

    fn registry() -> CompressRegistry {
        let mut reg = CompressRegistry::default();
        reg.register("gzip", Arc::new(gzip_compress), 1024);
        reg.register("deflate", Arc::new(deflate_compress), 512);
        reg
    }

    #[test]
    fn first_registered_wins() {
        let reg = registry();
        // client prefers deflate, but gzip was registered first
        let entry = reg.negotiate("deflate, gzip", 2048).unwrap();
        assert_eq!(entry.name, "gzip");
    }

    #[test]
    fn min_size_disables_codec() {
        let reg = registry();
        let entry = reg.negotiate("deflate, gzip", 600).unwrap();
        assert_eq!(entry.name, "deflate");
        assert!(reg.negotiate("deflate, gzip", 100).is_none());
    }

    #[test]
    fn token_match_is_case_insensitive() {
        let reg = registry();
        let entry = reg.negotiate("GZIP;q=0.8", 4096).unwrap();
        assert_eq!(entry.name, "gzip");
    }

    #[test]
    fn no_accept_encoding_no_codec() {
        let reg = registry();
        assert!(reg.negotiate("", 4096).is_none());
        assert!(reg.negotiate("br", 4096).is_none());
    }

    #[test]
    fn advertisement_in_registration_order() {
        assert_eq!(registry().advertisement(), "gzip,deflate");
    }

    #[test]
    fn gzip_roundtrip() {
        let data = vec![b'a'; 4096];
        let packed = gzip_compress(&data).unwrap();
        assert!(packed.len() < data.len());

        let mut unpacked = Vec::new();
        let _ = flate2::read::GzDecoder::new(packed.as_slice())
            .read_to_end(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn deflate_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(32);
        let packed = deflate_compress(&data).unwrap();

        let mut unpacked = Vec::new();
        let _ = flate2::read::DeflateDecoder::new(packed.as_slice())
            .read_to_end(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, data);
    }
}
