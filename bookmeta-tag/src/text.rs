//! Text encoding detection and description normalization

use crate::options::TagFlags;
use crate::record::MetadataRecord;
use tracing::{debug, warn};

/// Longest short description mp4 players reliably display
pub const MAX_DESCRIPTION_CHARS: usize = 255;

/// Marker appended to a soft-truncated description
pub const TRUNCATION_SUFFIX: &str = "...";

/// Detected encoding of a byte buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
}

/// Result of decoding a companion text file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedText {
    /// Bytes decoded with a detected encoding
    Text(String, TextEncoding),
    /// Encoding could not be determined; bytes are left untouched
    Undetected(Vec<u8>),
}

impl DecodedText {
    /// Decoded text, or `None` when the encoding was not detected
    pub fn into_text(self) -> Option<String> {
        match self {
            DecodedText::Text(text, _) => Some(text),
            DecodedText::Undetected(_) => None,
        }
    }
}

/// Detect the encoding of `bytes` (BOM, then UTF-8 validity) and decode
pub fn decode_text(bytes: &[u8]) -> DecodedText {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(text) = std::str::from_utf8(rest) {
            return DecodedText::Text(text.to_string(), TextEncoding::Utf8Bom);
        }
    } else if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if let Some(text) = decode_utf16(rest, u16::from_le_bytes) {
            return DecodedText::Text(text, TextEncoding::Utf16Le);
        }
    } else if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        if let Some(text) = decode_utf16(rest, u16::from_be_bytes) {
            return DecodedText::Text(text, TextEncoding::Utf16Be);
        }
    } else if let Ok(text) = std::str::from_utf8(bytes) {
        return DecodedText::Text(text.to_string(), TextEncoding::Utf8);
    }

    warn!(len = bytes.len(), "Could not detect text encoding, leaving bytes unmodified");
    DecodedText::Undetected(bytes.to_vec())
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Decode a companion text file, falling back to lossy UTF-8
///
/// Parsers skip what they cannot read, so replacement characters are
/// preferable to failing the whole file.
pub fn decode_lossy(bytes: &[u8]) -> String {
    match decode_text(bytes).into_text() {
        Some(text) => text,
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Load a description from raw bytes (e.g. a companion text file)
///
/// Returns `None` when the encoding cannot be detected; the bytes are then left alone.
pub fn decode_description(bytes: &[u8]) -> Option<String> {
    decode_text(bytes).into_text().map(|text| text.trim().to_string())
}

/// Cut `text` to at most `max_chars` characters including the suffix marker
///
/// Returns `None` when no truncation is needed.
pub fn soft_truncate(text: &str, max_chars: usize, suffix: &str) -> Option<String> {
    if text.chars().count() <= max_chars {
        return None;
    }
    let keep = max_chars.saturating_sub(suffix.chars().count());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push_str(suffix);
    Some(truncated)
}

/// Prepare descriptions for the mp4 description atoms
///
/// An overlong short description is soft-truncated; the full text moves into
/// the long description only when that field is empty. With
/// `prepend_series_to_long_description` the series label leads the long text.
pub fn normalize_descriptions(record: &mut MetadataRecord, flags: &TagFlags) {
    if let Some(description) = record.description.clone() {
        let description = description.replace("\r\n", "\n");
        match soft_truncate(&description, MAX_DESCRIPTION_CHARS, TRUNCATION_SUFFIX) {
            Some(truncated) => {
                debug!(
                    original_chars = description.chars().count(),
                    "Truncating description for mp4 atom"
                );
                if record
                    .long_description
                    .as_deref()
                    .map_or(true, |l| l.trim().is_empty())
                {
                    record.long_description = Some(description);
                }
                record.description = Some(truncated);
            }
            None => record.description = Some(description),
        }
    }

    if flags.prepend_series_to_long_description {
        if let Some(label) = record.series_label() {
            let body = record
                .long_description
                .clone()
                .or_else(|| record.description.clone())
                .unwrap_or_default();
            if !body.starts_with(&label) {
                record.long_description = Some(format!("{}\n\n{}", label, body).trim_end().to_string());
            }
        }
    }
}
