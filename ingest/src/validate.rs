//! Upload validation: allow-list, size limit, content hash, magic bytes.

use sha2::{Digest, Sha256};

use corpora_models::knowledge::KnowledgeBase;
use corpora_models::{CoreError, CoreResult};

/// sha256 hex of the raw bytes; the document identity for deduplication.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Container formats we can verify by signature. Text types are exempt:
/// any byte sequence is a legal text file.
fn expected_signature(content_type: &str) -> Option<&'static [&'static [u8]]> {
    match content_type {
        "application/pdf" => Some(&[b"%PDF"]),
        "image/png" => Some(&[&[0x89, b'P', b'N', b'G']]),
        "image/jpeg" => Some(&[&[0xFF, 0xD8, 0xFF]]),
        // OOXML (docx/xlsx/pptx) is a zip container.
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        | "application/zip" => Some(&[b"PK\x03\x04", b"PK\x05\x06"]),
        _ => None,
    }
}

/// Validate an upload against its knowledge base. Violations are
/// `InvalidInput` (caller mistakes) or `Permanent` (corrupt content);
/// neither is retryable.
pub fn validate_upload(
    kb: &KnowledgeBase,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> CoreResult<()> {
    if filename.trim().is_empty() {
        return Err(CoreError::InvalidInput("filename is empty".into()));
    }
    if bytes.is_empty() {
        return Err(CoreError::InvalidInput("file is empty".into()));
    }
    if !kb.accepts_content_type(content_type) {
        return Err(CoreError::Permanent(format!(
            "content type {} is not allowed in knowledge base {}",
            content_type, kb.name
        )));
    }
    if bytes.len() as i64 > kb.size_limit_bytes {
        return Err(CoreError::InvalidInput(format!(
            "file of {} bytes exceeds the {} byte limit",
            bytes.len(),
            kb.size_limit_bytes
        )));
    }
    if let Some(signatures) = expected_signature(content_type) {
        let matches = signatures.iter().any(|sig| bytes.starts_with(sig));
        if !matches {
            return Err(CoreError::Permanent(format!(
                "content does not match declared type {}",
                content_type
            )));
        }
    }
    Ok(())
}
