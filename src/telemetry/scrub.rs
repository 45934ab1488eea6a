//! PII scrubber: the hard gate in front of every outbound payload.
//!
//! The summary schema already excludes personal fields; this is defense
//! in depth over the serialized bytes. A payload matching any rule is
//! dropped whole, never redacted and forwarded; the drop is counted and
//! logged without the payload.

use regex::Regex;

/// Name of the rule a payload violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubViolation(pub &'static str);

/// Regex rule set applied to serialized payloads.
pub struct PiiScrubber {
    rules: Vec<(&'static str, Regex)>,
}

impl PiiScrubber {
    pub fn new() -> Self {
        let rules = vec![
            (
                "email",
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
                    .expect("email rule compiles"),
            ),
            // Ten or more digits allowing common phone separators. Short
            // enough runs (ISO dates: 8, clock times: 6) pass untouched.
            (
                "phone_digits",
                Regex::new(r"\d(?:[\s().-]?\d){9,}").expect("phone rule compiles"),
            ),
            // A quoted JSON string with many words smells like free-form
            // text; no enumerated field in the schema has more than a
            // few. Catches question/answer text that somehow leaked in.
            (
                "free_text",
                Regex::new(r#""(?:[^"\\]*\s){6}[^"\\]*""#).expect("free text rule compiles"),
            ),
        ];
        Self { rules }
    }

    /// Check a serialized payload; `Err` means drop it.
    pub fn scan(&self, payload: &str) -> Result<(), ScrubViolation> {
        for (name, rule) in &self.rules {
            if rule.is_match(payload) {
                return Err(ScrubViolation(name));
            }
        }
        Ok(())
    }
}

impl Default for PiiScrubber {
    fn default() -> Self {
        Self::new()
    }
}
