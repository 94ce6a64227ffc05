//! Detection result types, MIME constants, and format families.

use serde::Serialize;

/// MIME strings the detector can produce.
pub mod mime {
    pub const PDF: &str = "application/pdf";
    pub const DOCX: &str =
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
    pub const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
    pub const PPTX: &str =
        "application/vnd.openxmlformats-officedocument.presentationml.presentation";
    pub const DOC: &str = "application/msword";
    pub const XLS: &str = "application/vnd.ms-excel";
    pub const PPT: &str = "application/vnd.ms-powerpoint";
    pub const ZIP: &str = "application/zip";
    pub const OLE: &str = "application/x-ole-storage";
    pub const RTF: &str = "application/rtf";
    pub const GZIP: &str = "application/gzip";
    pub const SEVENZ: &str = "application/x-7z-compressed";
    pub const PNG: &str = "image/png";
    pub const JPEG: &str = "image/jpeg";
    pub const GIF: &str = "image/gif";
    pub const BMP: &str = "image/bmp";
    pub const TIFF: &str = "image/tiff";
    pub const WEBP: &str = "image/webp";
    pub const TEXT: &str = "text/plain";
    pub const HTML: &str = "text/html";
    pub const XML: &str = "application/xml";
    pub const UNKNOWN: &str = "unknown";
}

/// Coarse format family, used to decide whether two MIME guesses agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    Pdf,
    Image,
    ZipContainer,
    OleContainer,
    Text,
    Archive,
    Other,
}

/// Map a MIME string to its family.
pub fn family_of(mime_type: &str) -> FormatFamily {
    let m = mime_type.to_lowercase();
    if m == mime::PDF {
        FormatFamily::Pdf
    } else if m.starts_with("image/") {
        FormatFamily::Image
    } else if is_ooxml(&m) || m == mime::ZIP || m.starts_with("application/zip") {
        FormatFamily::ZipContainer
    } else if is_ole_family(&m) {
        FormatFamily::OleContainer
    } else if m.starts_with("text/") || m == mime::RTF || m == mime::XML {
        FormatFamily::Text
    } else if m == mime::GZIP
        || m == mime::SEVENZ
        || m == "application/x-tar"
        || m == "application/x-rar-compressed"
    {
        FormatFamily::Archive
    } else {
        FormatFamily::Other
    }
}

/// OOXML subtypes (ZIP containers with an Office payload).
pub fn is_ooxml(mime_type: &str) -> bool {
    matches!(mime_type, mime::DOCX | mime::XLSX | mime::PPTX)
}

/// OLE compound-file formats, including the legacy Office subtypes.
pub fn is_ole_family(mime_type: &str) -> bool {
    matches!(mime_type, mime::OLE | mime::DOC | mime::XLS | mime::PPT)
}

/// One contribution to the final confidence, kept for traceability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub name: &'static str,
    pub contribution: f64,
}

impl Signal {
    pub fn new(name: &'static str, contribution: f64) -> Self {
        Self { name, contribution }
    }
}

/// Outcome of format detection. Confidence is always in [0, 1]; results below
/// the configured threshold carry `mime_type = "unknown"` with the computed
/// (sub-threshold) confidence preserved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub mime_type: String,
    pub confidence: f64,
    pub signals: Vec<Signal>,
    pub from_cache: bool,
}

impl DetectionResult {
    /// Degenerate result for inputs the detector cannot say anything about.
    pub fn unknown(confidence: f64, signals: Vec<Signal>) -> Self {
        Self {
            mime_type: mime::UNKNOWN.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            signals,
            from_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_of() {
        assert_eq!(family_of(mime::PDF), FormatFamily::Pdf);
        assert_eq!(family_of(mime::DOCX), FormatFamily::ZipContainer);
        assert_eq!(family_of(mime::ZIP), FormatFamily::ZipContainer);
        assert_eq!(family_of(mime::DOC), FormatFamily::OleContainer);
        assert_eq!(family_of("image/png"), FormatFamily::Image);
        assert_eq!(family_of("text/csv"), FormatFamily::Text);
        assert_eq!(family_of("application/octet-stream"), FormatFamily::Other);
    }

    #[test]
    fn test_unknown_clamps_confidence() {
        let r = DetectionResult::unknown(1.5, vec![]);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.mime_type, mime::UNKNOWN);
    }
}
