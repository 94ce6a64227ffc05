//! End-to-end detection behavior over realistic byte streams.

use docuscope_ingest::config::{CommonConfig, DetectorConfig};
use docuscope_ingest::detect::{mime, FormatDetector};

fn detector() -> FormatDetector {
    FormatDetector::new(&CommonConfig::default(), DetectorConfig::default())
}

/// ZIP local-file-header magic followed by an OOXML interior marker.
fn docx_bytes() -> Vec<u8> {
    let mut buf = b"PK\x03\x04".to_vec();
    buf.extend_from_slice(&[0u8; 26]);
    buf.extend_from_slice(b"word/document.xml");
    buf.extend_from_slice(&[0u8; 128]);
    buf
}

#[test]
fn pdf_prefix_with_agreeing_extension_scores_high() {
    let result = detector().detect(b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n1 0 obj", Some("report.pdf"));
    assert_eq!(result.mime_type, mime::PDF);
    assert!(result.confidence >= DetectorConfig::default().confidence_threshold);
    assert!(!result
        .signals
        .iter()
        .any(|s| s.name.contains("conflict")));
}

#[test]
fn confidence_always_within_unit_interval() {
    let inputs: [(&[u8], Option<&str>); 5] = [
        (b"%PDF-1.4", Some("a.pdf")),
        (b"\x13\x37\x00\x42 nothing recognizable here", None),
        (b"PK\x03\x04\x00\x00", Some("archive.zip")),
        (b"plain words, nothing more", Some("notes.txt")),
        (b"GIF89a\x00\x00", Some("misnamed.docx")),
    ];
    let detector = detector();
    for (bytes, hint) in inputs {
        let result = detector.detect(bytes, hint);
        assert!(
            (0.0..=1.0).contains(&result.confidence),
            "confidence {} out of range for {:?}",
            result.confidence,
            hint
        );
    }
}

#[test]
fn unrecognized_bytes_fall_below_threshold_as_unknown() {
    let result = detector().detect(b"\x13\x37\xab\xcd no magic at all", Some("mystery.qqq"));
    assert_eq!(result.mime_type, mime::UNKNOWN);
    // The computed evidence score survives even when the label does not.
    let defaults = DetectorConfig::default();
    assert!((result.confidence - defaults.base_insufficient_evidence_confidence).abs() < 1e-9);
    assert!(result.signals.iter().any(|s| s.name == "below_threshold"));
}

#[test]
fn repeat_detection_is_served_from_cache() {
    let detector = detector();
    let bytes = b"%PDF-1.5 cached document body";
    let first = detector.detect(bytes, Some("a.pdf"));
    let second = detector.detect(bytes, Some("a.pdf"));
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.mime_type, second.mime_type);
    assert_eq!(first.confidence, second.confidence);
}

#[test]
fn ooxml_detection_is_capped() {
    let result = detector().detect(&docx_bytes(), Some("contract.docx"));
    assert_eq!(
        result.mime_type,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    );
    let cap = DetectorConfig::default().ooxml_confidence_cap;
    assert!(result.confidence <= cap);
    assert!(result.confidence >= DetectorConfig::default().confidence_threshold);
}

#[test]
fn bare_zip_with_docx_extension_resolves_subtype() {
    let mut buf = b"PK\x03\x04".to_vec();
    buf.extend_from_slice(&[0u8; 64]);
    let result = detector().detect(&buf, Some("report.docx"));
    assert_eq!(
        result.mime_type,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    );
    assert!(result.confidence <= DetectorConfig::default().ooxml_confidence_cap);
}

#[test]
fn text_extension_alone_clears_threshold() {
    let result = detector().detect(b"just some meeting notes", Some("notes.txt"));
    assert_eq!(result.mime_type, mime::TEXT);
    let defaults = DetectorConfig::default();
    assert!((result.confidence - defaults.base_extension_only_confidence).abs() < 1e-9);
    assert!(result.confidence >= defaults.confidence_threshold);
}

#[test]
fn empty_input_is_unknown_with_zero_confidence() {
    let result = detector().detect(&[], Some("anything.pdf"));
    assert_eq!(result.mime_type, mime::UNKNOWN);
    assert_eq!(result.confidence, 0.0);
}

#[test]
fn detection_never_panics_on_truncated_heads() {
    let detector = detector();
    for len in 0..8 {
        let bytes = &b"%PDF-1.4"[..len];
        let _ = detector.detect(bytes, None);
    }
    for len in 0..6 {
        let bytes = &b"PK\x03\x04\x14\x00"[..len];
        let _ = detector.detect(bytes, None);
    }
}
