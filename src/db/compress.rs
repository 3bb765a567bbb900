//! Gzip codec for resource payloads at rest.
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub fn gzip(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).context("failed to compress payload")?;
    encoder.finish().context("failed to finish gzip stream")
}

pub fn gunzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut raw)
        .context("failed to decompress payload")?;
    Ok(raw)
}

/// Decompress a payload that was stored from UTF-8 text.
pub fn gunzip_string(compressed: &[u8]) -> Result<String> {
    String::from_utf8(gunzip(compressed)?).context("decompressed payload is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_text_restores_exactly() {
        let text = r#"{"resourceType":"Bundle","type":"document","entry":[]}"#.repeat(20);
        let packed = gzip(text.as_bytes()).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip_string(&packed).unwrap(), text);
    }

    #[test]
    fn plain_bytes_are_not_a_gzip_stream() {
        assert!(gunzip(b"{}").is_err());
    }
}
