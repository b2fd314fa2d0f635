//! Pipeline stages for PDF-to-HTML conversion.
//!
//! Each submodule implements exactly one transformation step, keeping the
//! stages independently testable and swappable.
//!
//! ## Data flow (one iteration)
//!
//! ```text
//! ingest ──▶ generate ──▶ render ──▶ judge / multi_judge ──▶ decide
//! (pdfium)    (VLM)      (browser)       (VLMs)            (loop)
//! ```
//!
//! 1. [`ingest`]      — rasterise a page and crop its embedded figures;
//!    runs in `spawn_blocking` because pdfium is not async-safe
//! 2. [`generate`]    — synthesise or refine HTML via the vision model,
//!    strip fence markup, inject figure data URIs
//! 3. [`render`]      — load the HTML in a headless browser, await math
//!    typesetting, capture a full-page raster
//! 4. [`judge`]       — single-model visual comparison with a fixed rubric
//! 5. [`multi_judge`] — cross-model scoring, equation specialist cap, and
//!    the terminal verification gate

pub mod generate;
pub mod ingest;
pub mod judge;
pub mod multi_judge;
pub mod render;

/// Extract the JSON object from a model reply.
///
/// Models wrap JSON in markdown fences or surround it with prose despite
/// instructions; taking the outermost `{…}` span recovers both cases.
pub(crate) fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(text[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_object() {
        assert_eq!(
            extract_json_object(r#"{"a": 1}"#).as_deref(),
            Some(r#"{"a": 1}"#)
        );
    }

    #[test]
    fn extracts_fenced_object() {
        let text = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_object(text).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_object_with_surrounding_prose() {
        let text = "Here is my assessment:\n{\"score\": 90}\nHope that helps!";
        assert_eq!(extract_json_object(text).as_deref(), Some("{\"score\": 90}"));
    }

    #[test]
    fn none_when_no_object() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} {").is_none());
    }
}
