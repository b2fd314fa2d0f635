//! Multi-judge orchestration: cross-model scoring, the equation
//! specialist, and the terminal verification gate.
//!
//! The two general judges are peers — their subscores are combined by
//! weighted average. The specialist is *not* a peer: it is a constrained
//! transformation over the combined feedback that may only replace or cap
//! the equation subscore. The verification gate sits last and can veto an
//! otherwise passing iteration, but never changes scores.
//!
//! Judge calls are pure functions of their image inputs, so the two
//! cross-model calls run concurrently and join before combination.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConversionConfig, JudgeWeights};
use crate::pipeline::extract_json_object;
use crate::pipeline::judge::{
    comparison_request, run_judge, JudgeFeedback, ASCII_ART_CAP,
};
use crate::prompts::{EQUATION_SPECIALIST_PROMPT, VERIFICATION_PROMPT};
use crate::provider::{call_with_retry, VisionModel};

/// Composite-score band within which two judges are considered in
/// consensus.
pub const CONSENSUS_BAND: u8 = 15;

/// Cap on the number of critical errors forwarded to the generator; more
/// than this dilutes the refinement prompt.
const MAX_CRITICAL_ERRORS: usize = 7;

/// Verdict of the verification gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Accept,
    Reject,
    #[default]
    NeedsRefinement,
}

/// Parsed reply from the equation specialist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EquationReport {
    pub equation_fidelity_score: u8,
    pub rendering_quality: u8,
    pub symbol_accuracy: u8,
    pub structure_accuracy: u8,
    pub completeness: u8,
    pub equation_errors: Vec<String>,
    pub ascii_art_detected: bool,
    pub has_equations: bool,
}

impl Default for EquationReport {
    fn default() -> Self {
        // The lenient default: an unparseable specialist reply is treated
        // as "no equations", never as a failure that tanks the page.
        Self {
            equation_fidelity_score: 100,
            rendering_quality: 100,
            symbol_accuracy: 100,
            structure_accuracy: 100,
            completeness: 100,
            equation_errors: Vec::new(),
            ascii_art_detected: false,
            has_equations: false,
        }
    }
}

/// Parsed reply from the verification gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationReport {
    pub verified: bool,
    pub confidence: u8,
    pub issues_found: Vec<String>,
    pub recommendation: GateDecision,
}

impl Default for VerificationReport {
    fn default() -> Self {
        Self {
            verified: false,
            confidence: 0,
            issues_found: Vec::new(),
            recommendation: GateDecision::NeedsRefinement,
        }
    }
}

/// Orchestrates up to four judge sub-operations per iteration.
pub struct MultiJudge {
    judge_a: Arc<dyn VisionModel>,
    judge_b: Option<Arc<dyn VisionModel>>,
    weights: JudgeWeights,
    use_equation_specialist: bool,
    use_verification: bool,
}

impl MultiJudge {
    /// `judge_b` is `None` when cross-model judging is disabled or no
    /// second credential exists; every layer degrades gracefully.
    pub fn new(
        judge_a: Arc<dyn VisionModel>,
        judge_b: Option<Arc<dyn VisionModel>>,
        config: &ConversionConfig,
    ) -> Self {
        Self {
            judge_a,
            judge_b: if config.use_cross_model { judge_b } else { None },
            weights: config.weights,
            use_equation_specialist: config.use_equation_specialist,
            use_verification: config.use_verification,
        }
    }

    /// Run the configured judge stack over one `(original, rendered)` pair.
    ///
    /// `document_has_equations` comes from the document analysis and gates
    /// the specialist. Infallible: every sub-failure degrades to scores.
    pub async fn evaluate(
        &self,
        original_b64: &str,
        rendered_b64: &str,
        document_has_equations: bool,
        config: &ConversionConfig,
    ) -> JudgeFeedback {
        // Step 1: cross-model parallel scoring.
        let mut feedback = match &self.judge_b {
            Some(judge_b) => {
                let (a, b) = tokio::join!(
                    run_judge(&self.judge_a, original_b64, rendered_b64, config),
                    run_judge(judge_b, original_b64, rendered_b64, config),
                );
                debug!(
                    "judges: {} → {}, {} → {}",
                    self.judge_a.name(),
                    a.fidelity_score,
                    judge_b.name(),
                    b.fidelity_score
                );
                combine_feedback(&a, &b, self.weights)
            }
            None => run_judge(&self.judge_a, original_b64, rendered_b64, config).await,
        };

        // Step 2: equation specialist — a transformation, not a peer.
        if self.use_equation_specialist && document_has_equations {
            let report = self
                .run_equation_specialist(original_b64, rendered_b64, config)
                .await;
            apply_specialist(&mut feedback, &report);
            feedback.judges_used.push("equation_specialist".into());
            if report.ascii_art_detected {
                info!("equation specialist: ASCII-art math detected, capping equation score");
            }
        }

        // Step 3: verification gate, only for would-be accepts.
        if self.use_verification && feedback.fidelity_score >= config.target_score {
            let report = self.run_verification(original_b64, rendered_b64, config).await;
            feedback.judges_used.push("verification".into());
            if report.recommendation != GateDecision::Accept {
                info!("verification gate: {:?}", report.recommendation);
                feedback.gate_failed = true;
                for issue in report.issues_found {
                    push_unique(&mut feedback.critical_errors, issue);
                }
            }
        }

        feedback.critical_errors.truncate(MAX_CRITICAL_ERRORS);
        feedback
    }

    async fn run_equation_specialist(
        &self,
        original_b64: &str,
        rendered_b64: &str,
        config: &ConversionConfig,
    ) -> EquationReport {
        let request =
            comparison_request(original_b64, rendered_b64, EQUATION_SPECIALIST_PROMPT, config);
        match call_with_retry(
            &self.judge_a,
            &request,
            config.call_retries,
            config.retry_backoff_ms,
        )
        .await
        {
            Ok(reply) => parse_equation_reply(&reply),
            Err(e) => {
                warn!("equation specialist call failed: {e}");
                EquationReport::default()
            }
        }
    }

    async fn run_verification(
        &self,
        original_b64: &str,
        rendered_b64: &str,
        config: &ConversionConfig,
    ) -> VerificationReport {
        // A different model than the primary judge gives the gate an
        // independent perspective when one is available.
        let model = self.judge_b.as_ref().unwrap_or(&self.judge_a);
        let request = comparison_request(original_b64, rendered_b64, VERIFICATION_PROMPT, config);
        match call_with_retry(model, &request, config.call_retries, config.retry_backoff_ms).await
        {
            Ok(reply) => parse_verification_reply(&reply),
            Err(e) => {
                warn!("verification call failed: {e}");
                VerificationReport::default()
            }
        }
    }
}

/// Weighted combination of two general-judge feedbacks.
///
/// Subscores are averaged with the configured weights; error and
/// preserved lists are unioned with case-insensitive deduplication; the
/// consensus check annotates but never alters scores.
pub fn combine_feedback(a: &JudgeFeedback, b: &JudgeFeedback, weights: JudgeWeights) -> JudgeFeedback {
    let mut combined = JudgeFeedback {
        text_accuracy_score: weights.combine(a.text_accuracy_score, b.text_accuracy_score),
        layout_score: weights.combine(a.layout_score, b.layout_score),
        color_match_score: weights.combine(a.color_match_score, b.color_match_score),
        equation_score: weights.combine(a.equation_score, b.equation_score),
        judges_disagree: a.fidelity_score.abs_diff(b.fidelity_score) > CONSENSUS_BAND,
        ..JudgeFeedback::default()
    };

    for error in a.critical_errors.iter().chain(&b.critical_errors) {
        push_unique(&mut combined.critical_errors, error.clone());
    }
    for element in a.preserved_correctly.iter().chain(&b.preserved_correctly) {
        push_unique(&mut combined.preserved_correctly, element.clone());
    }
    combined.judges_used = a
        .judges_used
        .iter()
        .chain(&b.judges_used)
        .cloned()
        .collect();

    combined.recompute_composite();
    combined
}

/// Fold the specialist's constrained verdict into the combined feedback.
///
/// The specialist may only replace the equation subscore — upward when it
/// confirms clean typesetting, downward to at most [`ASCII_ART_CAP`] when
/// it saw plain-text math. The composite is recomputed afterwards.
pub(crate) fn apply_specialist(feedback: &mut JudgeFeedback, report: &EquationReport) {
    let eq_score = if !report.has_equations {
        100
    } else if report.equation_errors.is_empty() && report.equation_fidelity_score < 80 {
        // A low score with zero concrete errors is the specialist
        // second-guessing itself; treat as no real equation problems.
        100
    } else if report.ascii_art_detected {
        report.equation_fidelity_score.min(ASCII_ART_CAP)
    } else {
        report.equation_fidelity_score
    };

    feedback.equation_score = eq_score;
    feedback.ascii_art_detected = report.ascii_art_detected;
    for error in &report.equation_errors {
        push_unique(&mut feedback.critical_errors, error.clone());
    }
    feedback.recompute_composite();
}

/// Parse the specialist reply; unparseable replies degrade to the lenient
/// "no equations" default.
pub fn parse_equation_reply(reply: &str) -> EquationReport {
    extract_json_object(reply)
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

/// Parse the gate reply; unparseable replies degrade to
/// [`GateDecision::NeedsRefinement`].
pub fn parse_verification_reply(reply: &str) -> VerificationReport {
    extract_json_object(reply)
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

/// Append `candidate` unless an existing entry matches it modulo case and
/// surrounding whitespace.
fn push_unique(list: &mut Vec<String>, candidate: String) {
    let key = candidate.trim().to_lowercase();
    if !list.iter().any(|e| e.trim().to_lowercase() == key) {
        list.push(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(text: u8, layout: u8, color: u8, eq: u8, errors: &[&str]) -> JudgeFeedback {
        let mut f = JudgeFeedback {
            text_accuracy_score: text,
            layout_score: layout,
            color_match_score: color,
            equation_score: eq,
            critical_errors: errors.iter().map(|s| s.to_string()).collect(),
            judges_used: vec!["test".into()],
            ..JudgeFeedback::default()
        };
        f.recompute_composite();
        f
    }

    #[test]
    fn combine_averages_subscores_with_weights() {
        let a = feedback(80, 80, 80, 80, &[]);
        let b = feedback(60, 60, 60, 60, &[]);
        let combined = combine_feedback(&a, &b, JudgeWeights { a: 0.5, b: 0.5 });
        assert_eq!(combined.text_accuracy_score, 70);
        assert_eq!(combined.fidelity_score, 70);

        let skewed = combine_feedback(&a, &b, JudgeWeights { a: 0.7, b: 0.3 });
        assert_eq!(skewed.text_accuracy_score, 74);
    }

    #[test]
    fn combine_dedupes_errors_case_insensitively() {
        let a = feedback(80, 80, 80, 80, &["ERROR: wrong font | FIX: use serif"]);
        let b = feedback(70, 70, 70, 70, &["error: wrong font | fix: use serif", "ERROR: color off | FIX: #000"]);
        let combined = combine_feedback(&a, &b, JudgeWeights::default());
        assert_eq!(combined.critical_errors.len(), 2);
    }

    #[test]
    fn consensus_flag_set_beyond_band() {
        let a = feedback(90, 90, 90, 90, &[]);
        let b = feedback(70, 70, 70, 70, &[]);
        let combined = combine_feedback(&a, &b, JudgeWeights::default());
        assert!(combined.judges_disagree, "20-point gap must flag disagreement");

        let close = feedback(80, 80, 80, 80, &[]);
        let combined = combine_feedback(&a, &close, JudgeWeights::default());
        assert!(!combined.judges_disagree, "10-point gap is consensus");
    }

    #[test]
    fn specialist_caps_ascii_art_at_forty() {
        let mut combined = feedback(90, 90, 90, 95, &[]);
        let report = EquationReport {
            equation_fidelity_score: 70,
            equation_errors: vec!["Equation 3 rendered as plain text".into()],
            ascii_art_detected: true,
            has_equations: true,
            ..EquationReport::default()
        };
        apply_specialist(&mut combined, &report);
        assert!(combined.equation_score <= ASCII_ART_CAP);
        assert!(combined.ascii_art_detected);
        // Composite follows the capped subscore.
        assert_eq!(
            combined.fidelity_score,
            crate::pipeline::judge::composite_score(90, 90, combined.equation_score, 90)
        );
    }

    #[test]
    fn specialist_no_equations_scores_hundred() {
        let mut combined = feedback(90, 90, 90, 40, &[]);
        apply_specialist(&mut combined, &EquationReport::default());
        assert_eq!(combined.equation_score, 100);
        assert!(!combined.ascii_art_detected);
    }

    #[test]
    fn specialist_confident_score_passes_through() {
        let mut combined = feedback(90, 90, 90, 50, &[]);
        let report = EquationReport {
            equation_fidelity_score: 97,
            has_equations: true,
            ..EquationReport::default()
        };
        apply_specialist(&mut combined, &report);
        assert_eq!(combined.equation_score, 97);
    }

    #[test]
    fn specialist_low_score_without_errors_is_discounted() {
        let mut combined = feedback(90, 90, 90, 90, &[]);
        let report = EquationReport {
            equation_fidelity_score: 55,
            equation_errors: vec![],
            ascii_art_detected: false,
            has_equations: true,
            ..EquationReport::default()
        };
        apply_specialist(&mut combined, &report);
        assert_eq!(combined.equation_score, 100);
    }

    #[test]
    fn parse_equation_reply_lenient_on_garbage() {
        let report = parse_equation_reply("not json at all");
        assert!(!report.has_equations);
        assert_eq!(report.equation_fidelity_score, 100);
    }

    #[test]
    fn parse_verification_recommendations() {
        let accept = parse_verification_reply(
            r#"{"verified": true, "confidence": 95, "issues_found": [], "recommendation": "accept"}"#,
        );
        assert_eq!(accept.recommendation, GateDecision::Accept);

        let reject = parse_verification_reply(
            r#"{"verified": false, "confidence": 60, "issues_found": ["missing abstract"],
               "recommendation": "reject"}"#,
        );
        assert_eq!(reject.recommendation, GateDecision::Reject);
        assert_eq!(reject.issues_found, vec!["missing abstract"]);

        let garbage = parse_verification_reply("maybe?");
        assert_eq!(garbage.recommendation, GateDecision::NeedsRefinement);
    }
}
