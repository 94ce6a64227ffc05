//! Byte-signature table and container refinement.
//!
//! Signature matching works on an in-memory slice only: no regular
//! expressions, no decompression, no archive walking. ZIP and OLE prefixes
//! prove "is a container"; the business subtype is refined from directory
//! markers (`word/`, `xl/`, `ppt/`) found near the start of the buffer, or
//! from the filename extension.

use super::types::mime;

pub const PDF_MAGIC: &[u8] = b"%PDF";
pub const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff";
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
pub const GIF_MAGICS: [&[u8]; 2] = [b"GIF87a", b"GIF89a"];
pub const BMP_MAGIC: &[u8] = b"BM";
pub const TIFF_MAGICS: [&[u8]; 2] = [b"II*\x00", b"MM\x00*"];
pub const RIFF_MAGIC: &[u8] = b"RIFF";
pub const WEBP_TAG: &[u8] = b"WEBP";
pub const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
pub const OLE_MAGIC: &[u8] = b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1";
pub const RTF_MAGIC: &[u8] = b"{\\rtf";
pub const GZIP_MAGIC: &[u8] = b"\x1f\x8b";
pub const SEVENZ_MAGIC: &[u8] = b"7z\xbc\xaf\x27\x1c";

/// OOXML payload markers searched for inside a ZIP container prefix.
pub const OOXML_MARKERS: [&[u8]; 3] = [b"word/", b"xl/", b"ppt/"];

/// What a signature match proved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureHit {
    pub mime: &'static str,
    /// True when the signature only identifies a container, so the subtype
    /// needs refinement and the confidence a ceiling.
    pub container: bool,
    pub note: &'static str,
}

impl SignatureHit {
    const fn exact(mime: &'static str, note: &'static str) -> Self {
        Self { mime, container: false, note }
    }

    const fn container(mime: &'static str, note: &'static str) -> Self {
        Self { mime, container: true, note }
    }
}

/// Search for any of `needles` in the first `limit` bytes of `buf`.
pub fn find_any(buf: &[u8], needles: &[&[u8]], limit: usize) -> bool {
    let window = &buf[..buf.len().min(limit)];
    needles.iter().any(|needle| {
        !needle.is_empty() && window.windows(needle.len()).any(|w| w == *needle)
    })
}

pub fn has_ole_signature(head: &[u8]) -> bool {
    head.starts_with(OLE_MAGIC)
}

/// Match `head` against the signature table. `marker_limit` bounds the
/// interior search for OOXML directory markers inside a ZIP prefix.
pub fn match_signature(head: &[u8], marker_limit: usize) -> Option<SignatureHit> {
    if head.is_empty() {
        return None;
    }
    if head.starts_with(PDF_MAGIC) {
        return Some(SignatureHit::exact(mime::PDF, "pdf_signature"));
    }
    if head.starts_with(JPEG_MAGIC) {
        return Some(SignatureHit::exact(mime::JPEG, "jpeg_signature"));
    }
    if head.starts_with(PNG_MAGIC) {
        return Some(SignatureHit::exact(mime::PNG, "png_signature"));
    }
    if GIF_MAGICS.iter().any(|m| head.starts_with(m)) {
        return Some(SignatureHit::exact(mime::GIF, "gif_signature"));
    }
    if TIFF_MAGICS.iter().any(|m| head.starts_with(m)) {
        return Some(SignatureHit::exact(mime::TIFF, "tiff_signature"));
    }
    if head.starts_with(RIFF_MAGIC) && head.len() >= 12 && &head[8..12] == WEBP_TAG {
        return Some(SignatureHit::exact(mime::WEBP, "webp_signature"));
    }
    if head.starts_with(RTF_MAGIC) {
        return Some(SignatureHit::exact(mime::RTF, "rtf_signature"));
    }
    if head.starts_with(SEVENZ_MAGIC) {
        return Some(SignatureHit::exact(mime::SEVENZ, "7z_signature"));
    }
    if head.starts_with(GZIP_MAGIC) {
        return Some(SignatureHit::exact(mime::GZIP, "gzip_signature"));
    }
    if head.starts_with(ZIP_MAGIC) {
        // Refine the container into an OOXML subtype where a payload
        // directory marker is visible near the start of the archive.
        if find_any(head, &[b"word/"], marker_limit) {
            return Some(SignatureHit::container(mime::DOCX, "ooxml_word_marker"));
        }
        if find_any(head, &[b"xl/"], marker_limit) {
            return Some(SignatureHit::container(mime::XLSX, "ooxml_xl_marker"));
        }
        if find_any(head, &[b"ppt/"], marker_limit) {
            return Some(SignatureHit::container(mime::PPTX, "ooxml_ppt_marker"));
        }
        return Some(SignatureHit::container(mime::ZIP, "zip_container_unknown_ooxml"));
    }
    if has_ole_signature(head) {
        return Some(SignatureHit::container(mime::OLE, "ole_container"));
    }
    // BMP last: a two-byte prefix is easy to collide with.
    if head.starts_with(BMP_MAGIC) {
        return Some(SignatureHit::exact(mime::BMP, "bmp_signature"));
    }
    None
}

/// Lowercased extension without the dot, or `None`.
pub fn normalized_extension(filename: &str) -> Option<String> {
    let name = filename.trim().to_lowercase();
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_string())
    }
}

/// MIME for a bare extension hint, independent of any signature.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "pdf" => mime::PDF,
        "docx" => mime::DOCX,
        "xlsx" => mime::XLSX,
        "pptx" => mime::PPTX,
        "doc" => mime::DOC,
        "xls" => mime::XLS,
        "ppt" => mime::PPT,
        "rtf" => mime::RTF,
        "zip" => mime::ZIP,
        "gz" => mime::GZIP,
        "7z" => mime::SEVENZ,
        "png" => mime::PNG,
        "jpg" | "jpeg" => mime::JPEG,
        "gif" => mime::GIF,
        "bmp" => mime::BMP,
        "tif" | "tiff" => mime::TIFF,
        "webp" => mime::WEBP,
        "txt" | "md" | "log" | "csv" => mime::TEXT,
        "htm" | "html" => mime::HTML,
        "xml" => mime::XML,
        _ => return None,
    })
}

/// OOXML subtype consistent with a ZIP container prefix, by extension.
pub fn ooxml_mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "docx" => mime::DOCX,
        "xlsx" => mime::XLSX,
        "pptx" => mime::PPTX,
        _ => return None,
    })
}

/// Legacy Office subtype consistent with an OLE container prefix.
pub fn ole_mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "doc" => mime::DOC,
        "xls" => mime::XLS,
        "ppt" => mime::PPT,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_signature() {
        let hit = match_signature(b"%PDF-1.7\n%stuff", 1024).unwrap();
        assert_eq!(hit.mime, mime::PDF);
        assert!(!hit.container);
    }

    #[test]
    fn test_zip_refines_to_docx() {
        let mut buf = ZIP_MAGIC.to_vec();
        buf.extend_from_slice(b"\x14\x00\x00\x00word/document.xml");
        let hit = match_signature(&buf, buf.len()).unwrap();
        assert_eq!(hit.mime, mime::DOCX);
        assert!(hit.container);
    }

    #[test]
    fn test_zip_without_markers_stays_container() {
        let mut buf = ZIP_MAGIC.to_vec();
        buf.extend_from_slice(&[0u8; 64]);
        let hit = match_signature(&buf, buf.len()).unwrap();
        assert_eq!(hit.mime, mime::ZIP);
        assert_eq!(hit.note, "zip_container_unknown_ooxml");
    }

    #[test]
    fn test_marker_outside_limit_is_ignored() {
        let mut buf = ZIP_MAGIC.to_vec();
        buf.extend_from_slice(&[0u8; 128]);
        buf.extend_from_slice(b"word/document.xml");
        let hit = match_signature(&buf, 16).unwrap();
        assert_eq!(hit.mime, mime::ZIP);
    }

    #[test]
    fn test_ole_signature() {
        let mut buf = OLE_MAGIC.to_vec();
        buf.extend_from_slice(&[0u8; 32]);
        let hit = match_signature(&buf, buf.len()).unwrap();
        assert_eq!(hit.mime, mime::OLE);
        assert!(hit.container);
        assert!(has_ole_signature(&buf));
    }

    #[test]
    fn test_no_match_for_plain_text() {
        assert!(match_signature(b"hello world", 1024).is_none());
    }

    #[test]
    fn test_normalized_extension() {
        assert_eq!(normalized_extension("Report.DOCX"), Some("docx".into()));
        assert_eq!(normalized_extension("archive.tar.gz"), Some("gz".into()));
        assert_eq!(normalized_extension(".env"), Some("env".into()));
        assert_eq!(normalized_extension("README"), None);
        assert_eq!(normalized_extension("trailing."), None);
    }

    #[test]
    fn test_find_any_respects_limit() {
        let buf = b"aaaaaaaaneedle";
        assert!(find_any(buf, &[b"needle"], buf.len()));
        assert!(!find_any(buf, &[b"needle"], 8));
        assert!(!find_any(buf, &[b""], buf.len()));
    }
}
