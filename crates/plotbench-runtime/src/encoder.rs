//! Artifact encoder.
//!
//! Turns a rendered figure into base64 text that can ride inside a JSON
//! judge request. Failures here are reported apart from execution failures.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const PNG_IEND: &[u8] = &[0, 0, 0, 0, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

// Signature, IHDR chunk (length, type, 13 data bytes, CRC), IEND chunk
const PNG_MIN_LEN: usize = 8 + 4 + 4 + 13 + 4 + 12;

/// Errors from reading or encoding an artifact.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Failed to read artifact {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {path} is not a supported image: {detail}")]
    NotAnImage { path: PathBuf, detail: String },
}

/// A base64-encoded image with its media type.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub media_type: String,

    /// Standard-alphabet base64, padded
    pub data: String,
}

impl EncodedImage {
    pub fn new(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Encode raw image bytes, sniffing the media type.
    ///
    /// `None` if the bytes are not a recognised image format.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let media_type = sniff_media_type(bytes)?;
        Some(Self::new(media_type, STANDARD.encode(bytes)))
    }

    /// `data:<media>;base64,<data>` form used by OpenAI-style image parts.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

// Payloads run to megabytes; keep them out of logs.
impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedImage")
            .field("media_type", &self.media_type)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Identify an image format from its leading bytes.
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(PNG_MAGIC) {
        Some("image/png")
    } else if bytes.starts_with(JPEG_MAGIC) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Structural check of a PNG: a leading IHDR with non-zero dimensions and a
/// final IEND, so a figure cut short while being written is rejected.
fn check_png(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < PNG_MIN_LEN {
        return Err(format!("PNG is truncated ({} bytes)", bytes.len()));
    }
    if bytes[8..16] != [0, 0, 0, 13, b'I', b'H', b'D', b'R'] {
        return Err("PNG has no IHDR header chunk".to_string());
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    if width == 0 || height == 0 {
        return Err(format!("PNG has empty dimensions {}x{}", width, height));
    }
    if !bytes.ends_with(PNG_IEND) {
        return Err("PNG is truncated (no IEND chunk)".to_string());
    }
    Ok(())
}

/// Read an artifact from disk and encode it.
pub async fn encode(path: &Path) -> Result<EncodedImage, EncodingError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| EncodingError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

    if bytes.is_empty() {
        return Err(EncodingError::NotAnImage {
            path: path.to_path_buf(),
            detail: "file is empty".to_string(),
        });
    }

    let image = EncodedImage::from_bytes(&bytes).ok_or_else(|| EncodingError::NotAnImage {
        path: path.to_path_buf(),
        detail: "unrecognised file signature".to_string(),
    })?;

    if image.media_type == "image/png" {
        check_png(&bytes).map_err(|detail| EncodingError::NotAnImage {
            path: path.to_path_buf(),
            detail,
        })?;
    }

    tracing::debug!(
        path = %path.display(),
        media_type = %image.media_type,
        bytes = bytes.len(),
        "Encoded artifact"
    );
    Ok(image)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Structurally complete 1x1 PNG: signature, IHDR, empty IDAT, IEND.
    pub(crate) fn png_bytes() -> Vec<u8> {
        let mut bytes = PNG_MAGIC.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 13, b'I', b'H', b'D', b'R', 0, 0, 0, 1, 0, 0, 0, 1]);
        bytes.extend_from_slice(&[8, 6, 0, 0, 0, 0x1F, 0x15, 0xC4, 0x89]);
        bytes.extend_from_slice(&[0, 0, 0, 0, b'I', b'D', b'A', b'T', 0x35, 0xAF, 0x06, 0x1E]);
        bytes.extend_from_slice(PNG_IEND);
        bytes
    }

    #[test]
    fn test_png_structure_check() {
        let full = png_bytes();
        assert!(check_png(&full).is_ok());

        let cut = &full[..full.len() - 6];
        assert!(check_png(cut).unwrap_err().contains("IEND"));
        assert!(check_png(&full[..20]).unwrap_err().contains("truncated"));

        let mut no_header = full.clone();
        no_header[12..16].copy_from_slice(b"IDAT");
        assert!(check_png(&no_header).unwrap_err().contains("IHDR"));

        let mut zero_width = full.clone();
        zero_width[16..20].copy_from_slice(&[0, 0, 0, 0]);
        assert!(check_png(&zero_width).is_err());
    }

    #[tokio::test]
    async fn test_encode_rejects_truncated_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.png");
        let full = png_bytes();
        tokio::fs::write(&path, &full[..full.len() - 4]).await.unwrap();

        match encode(&path).await {
            Err(EncodingError::NotAnImage { detail, .. }) => assert!(detail.contains("truncated")),
            other => panic!("expected truncated PNG error, got {:?}", other),
        }
    }

    #[test]
    fn test_sniff_formats() {
        assert_eq!(sniff_media_type(&png_bytes()), Some("image/png"));
        assert_eq!(sniff_media_type(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_media_type(b"GIF89a...."), Some("image/gif"));
        assert_eq!(sniff_media_type(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_media_type(b"Traceback (most recent call last)"), None);
    }

    #[test]
    fn test_data_url() {
        let image = EncodedImage::from_bytes(&png_bytes()).unwrap();
        assert!(image.data_url().starts_with("data:image/png;base64,iVBORw0KGgo"));
        assert_eq!(STANDARD.decode(&image.data).unwrap(), png_bytes());
    }

    #[test]
    fn test_debug_omits_payload() {
        let image = EncodedImage::new("image/png", "A".repeat(4096));
        let debug = format!("{:?}", image);
        assert!(debug.contains("data_len: 4096"));
        assert!(!debug.contains("AAAA"));
    }

    #[tokio::test]
    async fn test_encode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.png");
        tokio::fs::write(&path, png_bytes()).await.unwrap();

        let image = encode(&path).await.unwrap();
        assert_eq!(image.media_type, "image/png");
    }

    #[tokio::test]
    async fn test_encode_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = encode(&dir.path().join("nope.png")).await.unwrap_err();
        assert!(matches!(err, EncodingError::Unreadable { .. }));
    }

    #[tokio::test]
    async fn test_encode_rejects_non_image() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("0.png");
        tokio::fs::write(&text, b"not an image").await.unwrap();
        let empty = dir.path().join("1.png");
        tokio::fs::write(&empty, b"").await.unwrap();

        assert!(matches!(
            encode(&text).await,
            Err(EncodingError::NotAnImage { .. })
        ));
        assert!(matches!(
            encode(&empty).await,
            Err(EncodingError::NotAnImage { .. })
        ));
    }
}
