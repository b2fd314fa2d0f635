//! Error types for the pdf2html library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2HtmlError`] — **Fatal**: the conversion cannot proceed at all
//!   (bad input file, missing page, no model credential). Returned as
//!   `Err(Pdf2HtmlError)` from the top-level entry points.
//!
//! * [`IterationError`] — **Non-fatal**: a generate or render step
//!   failed. Stored inside [`crate::output::IterationRecord`] so the loop
//!   can count it against the retry budget and keep going. A page that
//!   burns its whole budget on failed iterations is still a *result*
//!   (`success = false`), not an error. Judge failures are not errors at
//!   all — they come back as zero-score feedback.
//!
//! Transient provider failures (429, 5xx, timeouts) are retried with
//! backoff inside [`crate::provider`] and only surface here once the
//! retry budget for the individual call is spent.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2html library.
///
/// Iteration-level failures use [`IterationError`] and are stored in
/// [`crate::output::IterationRecord`] rather than propagated here.
#[derive(Debug, Error)]
pub enum Pdf2HtmlError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// Requested page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium returned an error while rasterising a page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The pdfium library could not be located or loaded.
    #[error(
        "pdfium library unavailable: {detail}\nSet PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    PdfiumUnavailable { detail: String },

    // ── Credential errors ─────────────────────────────────────────────────
    /// No usable model credential was found in the environment.
    #[error("No vision model credential configured.\n{hint}")]
    CredentialMissing { hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single generate→render iteration step.
///
/// Stored alongside the iteration's [`crate::pipeline::judge::JudgeFeedback`]
/// when a step fails. Judge-side failures never appear here: the judges
/// are infallible by contract and degrade to zero-score feedback instead
/// (see [`crate::pipeline::judge::run_judge`]). The page loop continues
/// while retry budget remains.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum IterationError {
    /// The generator model returned no parseable HTML.
    #[error("iteration {iteration}: generator returned no HTML: {detail}")]
    Generator { iteration: u32, detail: String },

    /// Browser navigation, wait, or capture timed out or failed.
    #[error("iteration {iteration}: render failed: {detail}")]
    Render { iteration: u32, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_out_of_range_display() {
        let e = Pdf2HtmlError::PageOutOfRange { page: 9, total: 3 };
        let msg = e.to_string();
        assert!(msg.contains("Page 9"), "got: {msg}");
        assert!(msg.contains("3 pages"), "got: {msg}");
    }

    #[test]
    fn credential_hint_is_shown() {
        let e = Pdf2HtmlError::CredentialMissing {
            hint: "Set GEMINI_API_KEY or GOOGLE_API_KEY.".into(),
        };
        assert!(e.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn iteration_error_round_trips_through_json() {
        let e = IterationError::Render {
            iteration: 2,
            detail: "navigation timed out after 30s".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: IterationError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), e.to_string());
    }
}
