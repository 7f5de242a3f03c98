//! Binary container for persisted models.
//!
//! A bundle is a fixed header, a JSON manifest, a JSON table of contents and
//! a contiguous blob region. Each blob is addressed by id and protected by a
//! CRC32 checksum.
//!
//! # Format Structure
//!
//! ```text
//! Offset   Size  Field
//! ------   ----  -----
//! 0        4     Magic ("WLBD")
//! 4        2     Version major (LE)
//! 6        2     Version minor (LE)
//! 8        4     Manifest length M (LE)
//! 12       4     TOC length T (LE)
//! 16       M     Manifest JSON {typeId, params, metadata}
//! 16+M     T     TOC JSON [{id, offset, length, crc32}]
//! 16+M+T   ...   Blob region (TOC offsets are relative to its start)
//! ```
//!
//! # Example
//!
//! ```
//! use wl_lightgbm::bundle::{decode_bundle, encode_bundle, Manifest};
//!
//! let manifest = Manifest::new("demo@1", serde_json::json!({}), serde_json::json!({}));
//! let bytes = encode_bundle(&manifest, &[("model", b"tree text".as_slice())]).unwrap();
//! let bundle = decode_bundle(&bytes).unwrap();
//! assert_eq!(bundle.blob("model"), Some(b"tree text".as_slice()));
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Magic bytes identifying a bundle.
pub const MAGIC: &[u8; 4] = b"WLBD";

/// Current format version (major).
pub const CURRENT_VERSION_MAJOR: u16 = 1;

/// Current format version (minor).
pub const CURRENT_VERSION_MINOR: u16 = 0;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 16;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while decoding or interpreting a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Input does not start with the bundle magic.
    #[error("not a model bundle")]
    NotABundle,

    /// Bundle was written by a newer format version.
    #[error("bundle format {major}.{minor} is not supported")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// Input ends before a section it declares.
    #[error("bundle truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Blob contents do not match the recorded checksum.
    #[error("checksum mismatch for blob '{id}': expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { id: String, expected: u32, actual: u32 },

    /// Manifest or TOC JSON is malformed or has the wrong shape.
    #[error("malformed manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// A TOC entry points outside the blob region.
    #[error("blob '{id}' lies outside the blob region")]
    BlobOutOfBounds { id: String },

    /// A required blob is not present.
    #[error("bundle has no '{0}' blob")]
    MissingBlob(String),

    /// Two TOC entries share an id.
    #[error("bundle lists blob '{0}' more than once")]
    DuplicateBlob(String),

    /// The manifest's type id is not one this crate can restore.
    #[error("unsupported bundle type '{0}'")]
    UnsupportedType(String),
}

// ============================================================================
// Manifest + TOC
// ============================================================================

/// Self-description of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Discriminator such as `"wlearn.lightgbm.classifier@1"`.
    pub type_id: String,
    /// Hyperparameters, verbatim.
    pub params: serde_json::Value,
    /// Free-form metadata owned by the writer.
    pub metadata: serde_json::Value,
}

impl Manifest {
    pub fn new(
        type_id: impl Into<String>,
        params: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            params,
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TocEntry {
    id: String,
    offset: u64,
    length: u64,
    crc32: u32,
}

/// A decoded bundle: manifest plus blobs in TOC order.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub manifest: Manifest,
    blobs: Vec<(String, Vec<u8>)>,
}

impl Bundle {
    /// Blob by id.
    pub fn blob(&self, id: &str) -> Option<&[u8]> {
        self.blobs
            .iter()
            .find(|(blob_id, _)| blob_id == id)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Blob by id, or [`BundleError::MissingBlob`].
    pub fn require_blob(&self, id: &str) -> Result<&[u8], BundleError> {
        self.blob(id).ok_or_else(|| BundleError::MissingBlob(id.to_string()))
    }

    /// Blob ids in TOC order.
    pub fn blob_ids(&self) -> impl Iterator<Item = &str> {
        self.blobs.iter().map(|(id, _)| id.as_str())
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Serialize a manifest and named blobs.
pub fn encode_bundle(manifest: &Manifest, blobs: &[(&str, &[u8])]) -> Result<Vec<u8>, BundleError> {
    let mut offset = 0u64;
    let toc: Vec<TocEntry> = blobs
        .iter()
        .map(|(id, bytes)| {
            let entry = TocEntry {
                id: (*id).to_string(),
                offset,
                length: bytes.len() as u64,
                crc32: crc32fast::hash(bytes),
            };
            offset += bytes.len() as u64;
            entry
        })
        .collect();

    let manifest_json = serde_json::to_vec(manifest)?;
    let toc_json = serde_json::to_vec(&toc)?;

    let mut out =
        Vec::with_capacity(HEADER_SIZE + manifest_json.len() + toc_json.len() + offset as usize);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CURRENT_VERSION_MAJOR.to_le_bytes());
    out.extend_from_slice(&CURRENT_VERSION_MINOR.to_le_bytes());
    out.extend_from_slice(&(manifest_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&(toc_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&manifest_json);
    out.extend_from_slice(&toc_json);
    for (_, bytes) in blobs {
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Parse and verify a bundle.
pub fn decode_bundle(bytes: &[u8]) -> Result<Bundle, BundleError> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(BundleError::NotABundle);
    }
    if bytes.len() < HEADER_SIZE {
        return Err(BundleError::Truncated {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }

    let read_u16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
    let read_u32 =
        |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

    let (major, minor) = (read_u16(4), read_u16(6));
    if major > CURRENT_VERSION_MAJOR {
        return Err(BundleError::UnsupportedVersion { major, minor });
    }
    let manifest_len = read_u32(8) as usize;
    let toc_len = read_u32(12) as usize;

    let blobs_start = HEADER_SIZE + manifest_len + toc_len;
    if bytes.len() < blobs_start {
        return Err(BundleError::Truncated {
            expected: blobs_start,
            actual: bytes.len(),
        });
    }
    let manifest: Manifest =
        serde_json::from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + manifest_len])?;
    let toc: Vec<TocEntry> =
        serde_json::from_slice(&bytes[HEADER_SIZE + manifest_len..blobs_start])?;

    let region = &bytes[blobs_start..];
    let mut blobs: Vec<(String, Vec<u8>)> = Vec::with_capacity(toc.len());
    for entry in toc {
        if blobs.iter().any(|(id, _)| *id == entry.id) {
            return Err(BundleError::DuplicateBlob(entry.id));
        }
        let region_len = region.len() as u64;
        let end = match entry.offset.checked_add(entry.length) {
            Some(end) if end <= region_len => end,
            Some(end) if entry.offset <= region_len => {
                return Err(BundleError::Truncated {
                    expected: blobs_start + end as usize,
                    actual: bytes.len(),
                })
            }
            _ => return Err(BundleError::BlobOutOfBounds { id: entry.id }),
        };
        let data = &region[entry.offset as usize..end as usize];
        let actual = crc32fast::hash(data);
        if actual != entry.crc32 {
            return Err(BundleError::ChecksumMismatch {
                id: entry.id,
                expected: entry.crc32,
                actual,
            });
        }
        blobs.push((entry.id, data.to_vec()));
    }

    Ok(Bundle { manifest, blobs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<u8> {
        let manifest = Manifest::new(
            "wlearn.lightgbm.regressor@1",
            json!({"numRound": 10}),
            json!({"objective": "regression"}),
        );
        encode_bundle(&manifest, &[("model", b"abc".as_slice()), ("extra", b"xyz".as_slice())]).unwrap()
    }

    #[test]
    fn decode_recovers_manifest_and_blobs() {
        let bundle = decode_bundle(&sample()).unwrap();
        assert_eq!(bundle.manifest.type_id, "wlearn.lightgbm.regressor@1");
        assert_eq!(bundle.manifest.params["numRound"], 10);
        assert_eq!(bundle.blob("model"), Some(b"abc".as_slice()));
        assert_eq!(bundle.blob("extra"), Some(b"xyz".as_slice()));
        assert_eq!(bundle.blob_ids().collect::<Vec<_>>(), ["model", "extra"]);
    }

    #[test]
    fn header_layout() {
        let bytes = sample();
        assert_eq!(&bytes[..4], b"WLBD");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 0);
        assert!(bytes.ends_with(b"abcxyz"));
    }

    #[test]
    fn manifest_keys_are_camel_case() {
        let bytes = sample();
        let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let text = std::str::from_utf8(&bytes[16..16 + len]).unwrap();
        assert!(text.contains("\"typeId\""), "{text}");
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(decode_bundle(b"JUNKJUNKJUNKJUNK"), Err(BundleError::NotABundle)));
        assert!(matches!(decode_bundle(b""), Err(BundleError::NotABundle)));
    }

    #[test]
    fn rejects_newer_major_version() {
        let mut bytes = sample();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            decode_bundle(&bytes),
            Err(BundleError::UnsupportedVersion { major: 2, .. })
        ));
    }

    #[test]
    fn rejects_truncation() {
        let bytes = sample();
        for cut in [10, 20, bytes.len() - 1] {
            assert!(
                matches!(decode_bundle(&bytes[..cut]), Err(BundleError::Truncated { .. })),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn rejects_corrupted_blob() {
        let mut bytes = sample();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode_bundle(&bytes),
            Err(BundleError::ChecksumMismatch { id, .. }) if id == "extra"
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let manifest = Manifest::new("x", json!({}), json!({}));
        let bytes =
            encode_bundle(&manifest, &[("a", b"1".as_slice()), ("a", b"2".as_slice())]).unwrap();
        assert!(matches!(decode_bundle(&bytes), Err(BundleError::DuplicateBlob(id)) if id == "a"));
    }

    #[test]
    fn missing_blob_is_reported() {
        let manifest = Manifest::new("x", json!({}), json!({}));
        let bundle = decode_bundle(&encode_bundle(&manifest, &[]).unwrap()).unwrap();
        assert!(matches!(bundle.require_blob("model"), Err(BundleError::MissingBlob(id)) if id == "model"));
    }

    #[test]
    fn malformed_manifest_is_reported() {
        let mut bytes = sample();
        bytes[16] = b'!';
        assert!(matches!(decode_bundle(&bytes), Err(BundleError::Manifest(_))));
    }
}
