//! Result types: per-iteration records, per-page results, and the
//! document summary.
//!
//! All of these are created during page processing, owned by the loop,
//! and persisted before the loop advances; nothing mutates them after
//! persistence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::analysis::DocumentAnalysis;
use crate::error::IterationError;
use crate::pipeline::judge::JudgeFeedback;

/// Artifacts of one generate→render→judge step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub iteration: u32,
    /// `iteration_KK.html` — present even when rendering failed.
    pub html_path: PathBuf,
    /// `rendered_KK.png` — absent when the render step failed.
    pub rendered_image_path: Option<PathBuf>,
    /// Judge feedback; zero-scored when the step failed before judging.
    pub feedback: JudgeFeedback,
    /// The step failure, when this iteration produced no signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IterationError>,
}

impl IterationRecord {
    /// Best-effort promotion rule: highest composite score among records
    /// whose HTML was actually written, with the latest winning ties.
    ///
    /// The `html_path` guard matters in the degenerate case where every
    /// iteration failed: a generator-failure record has no HTML on disk
    /// and must never be promoted over a render-failure record that does.
    pub fn best_of(records: &[IterationRecord]) -> Option<&IterationRecord> {
        records
            .iter()
            .filter(|r| r.html_path.exists())
            .fold(None, |best: Option<&IterationRecord>, r| match best {
                Some(b) if r.feedback.fidelity_score < b.feedback.fidelity_score => Some(b),
                _ => Some(r),
            })
    }
}

/// Terminal record for one processed page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// Zero-based page index.
    pub page_index: usize,
    /// Whether the page crossed the target (and the gate, if enabled).
    pub success: bool,
    /// Composite score of the committed iteration.
    pub final_score: u8,
    pub iterations_run: u32,
    /// `final.html`, byte-identical to the committed iteration's HTML.
    pub final_html_path: PathBuf,
    /// Every iteration, in order.
    pub history: Vec<IterationRecord>,
}

impl PageResult {
    /// The iteration the loop promotes at budget exhaustion; see
    /// [`IterationRecord::best_of`].
    pub fn best_iteration(&self) -> Option<&IterationRecord> {
        IterationRecord::best_of(&self.history)
    }
}

/// Document-level statistics emitted after the last page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionSummary {
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages actually run through the loop this invocation.
    pub processed_pages: usize,
    /// Pages that met the target.
    pub passed_pages: usize,
    /// Pages promoted best-effort below the target.
    pub best_effort_pages: usize,
    /// Pages skipped because `final.html` already existed.
    pub skipped_pages: usize,
    pub average_iterations: f32,
    pub total_duration_ms: u64,
}

/// Everything a caller gets back from a document conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    /// `<output>/<document-stem>/`
    pub document_dir: PathBuf,
    pub analysis: DocumentAnalysis,
    pub pages: Vec<PageResult>,
    pub summary: ConversionSummary,
}

impl ConversionOutcome {
    /// True when every processed page met the target.
    pub fn all_passed(&self) -> bool {
        self.summary.best_effort_pages == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn record(dir: &Path, iteration: u32, score: u8) -> IterationRecord {
        let html_path = dir.join(format!("iteration_{iteration:02}.html"));
        std::fs::write(&html_path, format!("<html>{iteration}</html>")).unwrap();
        IterationRecord {
            iteration,
            html_path,
            rendered_image_path: None,
            feedback: JudgeFeedback {
                fidelity_score: score,
                ..JudgeFeedback::default()
            },
            error: None,
        }
    }

    /// A step that failed before any HTML was written: the path is
    /// recorded but no file exists.
    fn failed_record(dir: &Path, iteration: u32) -> IterationRecord {
        IterationRecord {
            iteration,
            html_path: dir.join(format!("iteration_{iteration:02}.html")),
            rendered_image_path: None,
            feedback: JudgeFeedback::default(),
            error: None,
        }
    }

    fn page_with(history: Vec<IterationRecord>) -> PageResult {
        PageResult {
            page_index: 0,
            success: false,
            final_score: 0,
            iterations_run: history.len() as u32,
            final_html_path: PathBuf::from("final.html"),
            history,
        }
    }

    #[test]
    fn best_iteration_picks_highest_score() {
        let dir = tempfile::tempdir().unwrap();
        let page = page_with(vec![
            record(dir.path(), 1, 70),
            record(dir.path(), 2, 85),
            record(dir.path(), 3, 60),
        ]);
        assert_eq!(page.best_iteration().unwrap().iteration, 2);
    }

    #[test]
    fn best_iteration_tie_goes_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let page = page_with(vec![
            record(dir.path(), 1, 80),
            record(dir.path(), 2, 80),
            record(dir.path(), 3, 75),
        ]);
        assert_eq!(page.best_iteration().unwrap().iteration, 2);

        let dir = tempfile::tempdir().unwrap();
        let page = page_with(vec![
            record(dir.path(), 1, 80),
            record(dir.path(), 2, 80),
            record(dir.path(), 3, 80),
        ]);
        assert_eq!(page.best_iteration().unwrap().iteration, 3);
    }

    #[test]
    fn best_iteration_skips_records_without_written_html() {
        let dir = tempfile::tempdir().unwrap();
        // Both iterations scored 0; the tie must not hand the promotion
        // to the later record, whose HTML was never written.
        let page = page_with(vec![record(dir.path(), 1, 0), failed_record(dir.path(), 2)]);
        assert_eq!(page.best_iteration().unwrap().iteration, 1);
    }

    #[test]
    fn best_iteration_empty_history_is_none() {
        assert!(page_with(vec![]).best_iteration().is_none());
    }
}
