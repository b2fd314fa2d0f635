//! Single-model visual judge: compare two page images, return structured
//! feedback.
//!
//! The judge never raises to the loop. A transport failure or an
//! unparseable reply becomes a zero-score [`JudgeFeedback`] carrying the
//! failure as its one critical error; the iteration still counts against
//! the retry budget.
//!
//! Subscores come from the model, but the composite is always recomputed
//! locally — models are bad at weighted arithmetic and the loop's
//! termination decision must follow one law, not each judge's mood.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::config::ConversionConfig;
use crate::pipeline::extract_json_object;
use crate::prompts::GENERAL_JUDGE_PROMPT;
use crate::provider::{call_with_retry, ImagePart, Part, VisionModel, VisionRequest};

/// Weight of text accuracy in the composite fidelity score.
pub const TEXT_WEIGHT: f32 = 0.50;
/// Weight of layout accuracy in the composite fidelity score.
pub const LAYOUT_WEIGHT: f32 = 0.30;
/// Weight of equation rendering in the composite fidelity score.
pub const EQUATION_WEIGHT: f32 = 0.15;
/// Weight of color match in the composite fidelity score.
pub const COLOR_WEIGHT: f32 = 0.05;

/// Ceiling applied to the equation subscore when the specialist detects
/// ASCII-art math.
pub const ASCII_ART_CAP: u8 = 40;

/// Structured feedback exchanged between judges, the multi-judge, the
/// loop, and the generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeFeedback {
    /// Composite fidelity, 0–100. Always `composite_score(..)` of the
    /// subscores below (the specialist cap is applied to `equation_score`
    /// before the composite is recomputed).
    pub fidelity_score: u8,
    pub text_accuracy_score: u8,
    pub layout_score: u8,
    pub color_match_score: u8,
    pub equation_score: u8,

    /// Short imperative defect descriptions, ideally `ERROR: … | FIX: …`.
    #[serde(default)]
    pub critical_errors: Vec<String>,

    /// Elements confirmed correct; the refinement prompt turns these into
    /// a do-not-change list.
    #[serde(default)]
    pub preserved_correctly: Vec<String>,

    /// Names of the judges that contributed to this record.
    #[serde(default)]
    pub judges_used: Vec<String>,

    /// Cross-model composites differed by more than the consensus band.
    /// Warning only; termination is unaffected.
    #[serde(default)]
    pub judges_disagree: bool,

    /// The verification gate vetoed an otherwise passing score.
    #[serde(default)]
    pub gate_failed: bool,

    /// The equation specialist saw plain-text math in the rendering.
    #[serde(default)]
    pub ascii_art_detected: bool,

    /// Original model reply, retained for diagnostics.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_response: String,
}

impl JudgeFeedback {
    /// Recompute the composite from the current subscores.
    pub fn recompute_composite(&mut self) {
        self.fidelity_score = composite_score(
            self.text_accuracy_score,
            self.layout_score,
            self.equation_score,
            self.color_match_score,
        );
    }

    /// Zero-score feedback describing a failed judge step.
    pub fn failure(detail: impl Into<String>, raw_response: impl Into<String>) -> Self {
        Self {
            critical_errors: vec![detail.into()],
            raw_response: raw_response.into(),
            ..Self::default()
        }
    }
}

/// The composite score law:
/// `round(0.50·text + 0.30·layout + 0.15·equation + 0.05·color)`.
pub fn composite_score(text: u8, layout: u8, equation: u8, color: u8) -> u8 {
    let v = TEXT_WEIGHT * f32::from(text)
        + LAYOUT_WEIGHT * f32::from(layout)
        + EQUATION_WEIGHT * f32::from(equation)
        + COLOR_WEIGHT * f32::from(color);
    v.round().clamp(0.0, 100.0) as u8
}

/// Parse a judge reply against the wire contract.
///
/// Missing numeric keys default to 0, extra keys are ignored, subscores
/// are clamped to `[0, 100]`, and the composite is recomputed locally.
pub fn parse_judge_reply(reply: &str, judge_name: &str) -> JudgeFeedback {
    let parsed = extract_json_object(reply)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok());

    let Some(value) = parsed else {
        warn!("{judge_name}: unparseable judge reply");
        let mut feedback = JudgeFeedback::failure(
            format!("{judge_name} reply was not valid JSON"),
            reply,
        );
        feedback.judges_used = vec![judge_name.to_string()];
        return feedback;
    };

    let score = |key: &str| value[key].as_i64().unwrap_or(0).clamp(0, 100) as u8;
    let strings = |key: &str| -> Vec<String> {
        value[key]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut feedback = JudgeFeedback {
        text_accuracy_score: score("text_accuracy_score"),
        layout_score: score("layout_score"),
        color_match_score: score("color_match_score"),
        equation_score: score("equation_score"),
        critical_errors: strings("critical_errors"),
        preserved_correctly: strings("preserved_correctly"),
        judges_used: vec![judge_name.to_string()],
        raw_response: reply.to_string(),
        ..JudgeFeedback::default()
    };
    feedback.recompute_composite();
    feedback
}

/// Build the two-image comparison request shared by every judge variant.
pub(crate) fn comparison_request(
    original_b64: &str,
    rendered_b64: &str,
    prompt: &str,
    config: &ConversionConfig,
) -> VisionRequest {
    VisionRequest::new(
        vec![
            Part::Text("Here is the ORIGINAL PDF page:".into()),
            Part::Image(ImagePart::png(original_b64.to_string())),
            Part::Text("Here is the RENDERED HTML page:".into()),
            Part::Image(ImagePart::png(rendered_b64.to_string())),
            Part::Text(prompt.to_string()),
        ],
        config.temperature,
        1024,
    )
}

/// Run one judge over an `(original, rendered)` pair.
///
/// Infallible by contract: call failures come back as zero-score feedback.
pub async fn run_judge(
    model: &Arc<dyn VisionModel>,
    original_b64: &str,
    rendered_b64: &str,
    config: &ConversionConfig,
) -> JudgeFeedback {
    let request = comparison_request(original_b64, rendered_b64, GENERAL_JUDGE_PROMPT, config);
    match call_with_retry(model, &request, config.call_retries, config.retry_backoff_ms).await {
        Ok(reply) => parse_judge_reply(&reply, model.name()),
        Err(e) => {
            warn!("{}: judge call failed — {e}", model.name());
            let mut feedback =
                JudgeFeedback::failure(format!("{} call failed: {e}", model.name()), "");
            feedback.judges_used = vec![model.name().to_string()];
            feedback
        }
    }
}
