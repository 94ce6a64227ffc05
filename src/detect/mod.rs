//! Format detection: byte signatures, content probe, calibrated scoring.
//!
//! `FormatDetector::detect` never fails. Every failure mode degrades to a
//! low-confidence or `unknown` result with a traceable signal list so the
//! caller decides whether to reject the document or try best-effort handling.

pub mod cache;
pub mod signatures;
pub mod types;

pub use cache::SignatureCache;
pub use types::{family_of, mime, DetectionResult, FormatFamily, Signal};

use crate::config::{CommonConfig, DetectorConfig};
use signatures::{match_signature, SignatureHit, OOXML_MARKERS, ZIP_MAGIC};
use types::{is_ole_family, is_ooxml};

/// One MIME candidate plus the confidence its evidence is worth.
struct Candidate {
    mime: &'static str,
    confidence: f64,
}

/// Classifies a byte stream by signature, with an optional content probe as
/// a second opinion and a filename extension as a weak hint.
pub struct FormatDetector {
    config: DetectorConfig,
    head_size: usize,
    cache: Option<SignatureCache>,
}

impl FormatDetector {
    pub fn new(common: &CommonConfig, config: DetectorConfig) -> Self {
        let config = config.clamped();
        let cache = config
            .enable_signature_cache
            .then(|| SignatureCache::new(config.signature_cache_size));
        Self {
            head_size: common.preferred_head_size.max(1),
            config,
            cache,
        }
    }

    /// Classify `bytes`, optionally using `hint_filename` for its extension.
    pub fn detect(&self, bytes: &[u8], hint_filename: Option<&str>) -> DetectionResult {
        if bytes.is_empty() {
            return DetectionResult::unknown(0.0, vec![Signal::new("empty_input", 0.0)]);
        }

        let head = &bytes[..bytes.len().min(self.head_size)];
        // Ambiguous container prefix: widen the scan window so the OOXML
        // marker search sees more of the archive before giving up.
        let scan = if head.starts_with(ZIP_MAGIC)
            && !signatures::find_any(head, &OOXML_MARKERS, head.len())
        {
            let widened =
                (self.head_size as f64 * self.config.scan_limit_multiplier) as usize;
            &bytes[..bytes.len().min(widened.max(self.head_size))]
        } else {
            head
        };

        let key = cache::prefix_hash(scan);
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            let mut result = cached;
            result.from_cache = true;
            return result;
        }

        let result = self.classify(scan, hint_filename);
        tracing::debug!(
            "Detected {} with confidence {:.2} ({} signals)",
            result.mime_type,
            result.confidence,
            result.signals.len()
        );
        if let Some(cache) = &self.cache {
            cache.insert(key, result.clone());
        }
        result
    }

    fn classify(&self, scan: &[u8], hint_filename: Option<&str>) -> DetectionResult {
        let t = &self.config;
        let mut signals = Vec::new();

        let ext = hint_filename.and_then(signatures::normalized_extension);
        let ext_mime = ext.as_deref().and_then(signatures::mime_for_extension);

        let candidate = self.signature_candidate(scan, ext.as_deref(), &mut signals);

        let probe_mime = if t.use_content_probe {
            infer::get(scan).map(|kind| kind.mime_type())
        } else {
            None
        };

        // Combine the two independent guesses.
        let (mime_type, mut confidence) = match (candidate, probe_mime) {
            (Some(c), Some(probe)) => {
                let probe_confidence = t.base_probe_only_confidence;
                if probe == c.mime || family_of(probe) == family_of(c.mime) {
                    signals.push(Signal::new("probe_agreement", 0.0));
                    (c.mime.to_string(), c.confidence.max(probe_confidence))
                } else {
                    // Family disagreement: keep the stronger guess, penalized.
                    signals.push(Signal::new(
                        "mime_conflict_penalty",
                        -t.mime_conflict_penalty,
                    ));
                    if c.confidence >= probe_confidence {
                        (c.mime.to_string(), c.confidence - t.mime_conflict_penalty)
                    } else {
                        (probe.to_string(), probe_confidence - t.mime_conflict_penalty)
                    }
                }
            }
            (Some(c), None) => (c.mime.to_string(), c.confidence),
            (None, Some(probe)) => {
                signals.push(Signal::new("probe_only", t.base_probe_only_confidence));
                (probe.to_string(), t.base_probe_only_confidence)
            }
            (None, None) => match ext_mime {
                Some(m) => {
                    signals.push(Signal::new(
                        "extension_only",
                        t.base_extension_only_confidence,
                    ));
                    (m.to_string(), t.base_extension_only_confidence)
                }
                None => {
                    signals.push(Signal::new(
                        "insufficient_evidence",
                        t.base_insufficient_evidence_confidence,
                    ));
                    (
                        mime::UNKNOWN.to_string(),
                        t.base_insufficient_evidence_confidence,
                    )
                }
            },
        };

        // A filename hint pointing at a different family costs the same
        // penalty as a probe conflict.
        if let Some(hinted) = ext_mime {
            if mime_type != mime::UNKNOWN
                && hinted != mime_type
                && family_of(hinted) != family_of(&mime_type)
            {
                signals.push(Signal::new("hint_conflict_penalty", -t.mime_conflict_penalty));
                confidence -= t.mime_conflict_penalty;
            }
        }

        // Container ceilings apply regardless of agreement: the signature
        // only proves "is a container", not the business subtype.
        if is_ooxml(&mime_type) || mime_type == mime::ZIP {
            if confidence > t.ooxml_confidence_cap {
                signals.push(Signal::new(
                    "ooxml_confidence_cap",
                    t.ooxml_confidence_cap - confidence,
                ));
                confidence = t.ooxml_confidence_cap;
            }
        } else if is_ole_family(&mime_type) && confidence > t.ole_confidence_cap {
            signals.push(Signal::new(
                "ole_confidence_cap",
                t.ole_confidence_cap - confidence,
            ));
            confidence = t.ole_confidence_cap;
        }

        let confidence = confidence.clamp(0.0, 1.0);
        if confidence < t.confidence_threshold {
            signals.push(Signal::new("below_threshold", 0.0));
            return DetectionResult {
                mime_type: mime::UNKNOWN.to_string(),
                confidence,
                signals,
                from_cache: false,
            };
        }

        DetectionResult {
            mime_type,
            confidence,
            signals,
            from_cache: false,
        }
    }

    /// Turn a raw signature hit into a scored candidate, refining container
    /// hits with the extension hint where the bytes alone are not enough.
    fn signature_candidate(
        &self,
        scan: &[u8],
        ext: Option<&str>,
        signals: &mut Vec<Signal>,
    ) -> Option<Candidate> {
        let t = &self.config;
        let hit: SignatureHit = match_signature(scan, scan.len())?;

        if !hit.container {
            signals.push(Signal::new("signature", t.base_signature_confidence));
            return Some(Candidate {
                mime: hit.mime,
                confidence: t.base_signature_confidence,
            });
        }

        if hit.mime == mime::ZIP {
            // Bare ZIP container: an agreeing OOXML extension picks the
            // subtype at container confidence.
            if let Some(subtype) = ext.and_then(signatures::ooxml_mime_for_extension) {
                signals.push(Signal::new(
                    "zip_container_extension",
                    t.base_zip_container_confidence,
                ));
                return Some(Candidate {
                    mime: subtype,
                    confidence: t.base_zip_container_confidence,
                });
            }
            signals.push(Signal::new(
                "zip_container",
                t.base_zip_container_confidence,
            ));
            return Some(Candidate {
                mime: mime::ZIP,
                confidence: t.base_zip_container_confidence,
            });
        }

        if hit.mime == mime::OLE {
            if let Some(subtype) = ext.and_then(signatures::ole_mime_for_extension) {
                signals.push(Signal::new(
                    "ole_container_extension",
                    t.base_ole_container_confidence,
                ));
                return Some(Candidate {
                    mime: subtype,
                    confidence: t.base_ole_container_confidence,
                });
            }
            signals.push(Signal::new(
                "ole_container",
                t.base_ole_container_confidence,
            ));
            return Some(Candidate {
                mime: mime::OLE,
                confidence: t.base_ole_container_confidence,
            });
        }

        // OOXML subtype proven by an interior marker. Still a container hit,
        // so the ceiling applies later.
        signals.push(Signal::new("signature", t.base_signature_confidence));
        Some(Candidate {
            mime: hit.mime,
            confidence: t.base_signature_confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FormatDetector {
        FormatDetector::new(&CommonConfig::default(), DetectorConfig::default())
    }

    #[test]
    fn test_empty_input_is_unknown_zero() {
        let result = detector().detect(&[], None);
        assert_eq!(result.mime_type, mime::UNKNOWN);
        assert_eq!(result.confidence, 0.0);
        assert!(result.signals.iter().any(|s| s.name == "empty_input"));
    }

    #[test]
    fn test_ole_with_doc_extension() {
        let mut buf = signatures::OLE_MAGIC.to_vec();
        buf.extend_from_slice(&[0u8; 64]);
        let result = detector().detect(&buf, Some("contract.doc"));
        assert_eq!(result.mime_type, mime::DOC);
        assert!(result.confidence <= DetectorConfig::default().ole_confidence_cap);
    }

    #[test]
    fn test_probe_disabled_still_detects_signatures() {
        let config = DetectorConfig {
            use_content_probe: false,
            ..DetectorConfig::default()
        };
        let detector = FormatDetector::new(&CommonConfig::default(), config);
        let result = detector.detect(b"%PDF-1.4\n", None);
        assert_eq!(result.mime_type, mime::PDF);
    }

    #[test]
    fn test_cache_disabled_never_reports_cached() {
        let config = DetectorConfig {
            enable_signature_cache: false,
            ..DetectorConfig::default()
        };
        let detector = FormatDetector::new(&CommonConfig::default(), config);
        let first = detector.detect(b"%PDF-1.4\n", None);
        let second = detector.detect(b"%PDF-1.4\n", None);
        assert!(!first.from_cache);
        assert!(!second.from_cache);
    }

    #[test]
    fn test_hint_conflict_penalizes() {
        let detector = detector();
        let clean = detector.detect(b"%PDF-1.4 conflict base", None);
        // Same bytes would hit the cache, so vary them per call.
        let conflicted = detector.detect(b"%PDF-1.4 conflict case", Some("photo.png"));
        assert!(conflicted.confidence < clean.confidence);
        assert!(conflicted
            .signals
            .iter()
            .any(|s| s.name == "hint_conflict_penalty"));
    }
}
