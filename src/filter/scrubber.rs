//! Layer 2: content scrubber.
//!
//! Runs on every event just before it crosses the process boundary.
//! Free text is truncated first, then passed through an ordered list of
//! PII detectors; each detector sees the output of the previous one.

use crate::event::CaptureEvent;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Substituted for every detector match.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Longest free-text value allowed through, in characters.
pub const MAX_TEXT_CHARS: usize = 1000;

/// Payload keys holding encoded binary data rather than text.
pub const BINARY_FIELDS: &[&str] = &["image_base64"];

/// Detector patterns in application order.
const DETECTORS: &[(&str, &str)] = &[
    // Separated national identifiers, e.g. 123-45-6789.
    ("ssn", r"\b\d{3}[-. ]\d{2}[-. ]\d{4}\b"),
    ("email", r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}"),
    (
        "phone",
        r"(?:\+\d{1,3}[\s.\-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.\-])\d{3}[\s.\-]\d{4}\b|\+\d{1,3}[\s.\-]?\d{6,12}\b",
    ),
    ("payment_card", r"\b(?:\d[ \-]?){12,18}\d\b"),
    (
        "bank_account",
        r"\b[A-Z]{2}\d{2}(?: ?[A-Z0-9]{4}){2,7}(?: ?[A-Z0-9]{1,4})?\b|(?i)\b(?:acct|account|a/c)(?:\s*(?:no\.?|number|#))?[\s:#]*\d{6,17}\b",
    ),
    (
        "home_path",
        r"(?:/Users/|/home/)[^/\s]+|[A-Za-z]:\\Users\\[^\\\s]+",
    ),
    // UK National Insurance number.
    (
        "locale_id",
        r"\b[A-CEGHJ-PR-TW-Z]{2} ?\d{2} ?\d{2} ?\d{2} ?[A-D]\b",
    ),
];

#[derive(Debug, Error)]
pub enum ScrubberError {
    #[error("PII detector '{name}' failed to compile: {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
}

struct Detector {
    name: &'static str,
    pattern: Regex,
}

/// Compiled PII detectors.
pub struct ContentScrubber {
    detectors: Vec<Detector>,
}

impl std::fmt::Debug for ContentScrubber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentScrubber")
            .field("detectors", &self.detector_names())
            .finish()
    }
}

impl ContentScrubber {
    /// Compile the built-in detectors. Any compile failure is returned, so
    /// the agent refuses to start rather than running with reduced coverage.
    pub fn new() -> Result<Self, ScrubberError> {
        Self::from_patterns(DETECTORS)
    }

    fn from_patterns(patterns: &[(&'static str, &str)]) -> Result<Self, ScrubberError> {
        let detectors = patterns
            .iter()
            .map(|&(name, pattern)| {
                Regex::new(pattern)
                    .map(|pattern| Detector { name, pattern })
                    .map_err(|source| ScrubberError::InvalidPattern { name, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { detectors })
    }

    /// Detector names in application order.
    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name).collect()
    }

    /// Truncate and redact one text value. Returns the number of redactions.
    pub fn scrub_text(&self, text: &str) -> (String, usize) {
        let mut current = truncate_chars(text, MAX_TEXT_CHARS);
        let mut redactions = 0;

        for detector in &self.detectors {
            let matches = detector.pattern.find_iter(&current).count();
            if matches == 0 {
                continue;
            }
            redactions += matches;
            current = detector
                .pattern
                .replace_all(&current, REDACTION_MARKER)
                .into_owned();
        }

        (current, redactions)
    }

    /// Scrub every free-text field of an event in place.
    pub fn scrub_event(&self, event: &mut CaptureEvent) -> usize {
        let mut redactions = 0;

        if let Some(title) = event.window_title.take() {
            let (clean, n) = self.scrub_text(&title);
            redactions += n;
            event.window_title = Some(clean);
        }

        for (key, value) in event.event_data.iter_mut() {
            if BINARY_FIELDS.contains(&key.as_str()) {
                continue;
            }
            redactions += self.scrub_value(value);
        }

        redactions
    }

    fn scrub_value(&self, value: &mut Value) -> usize {
        match value {
            Value::String(s) => {
                let (clean, n) = self.scrub_text(s);
                *s = clean;
                n
            }
            Value::Array(items) => items.iter_mut().map(|v| self.scrub_value(v)).sum(),
            Value::Object(map) => map.values_mut().map(|v| self.scrub_value(v)).sum(),
            _ => 0,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
