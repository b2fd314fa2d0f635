//! HTML generation: initial synthesis and feedback-driven refinement.
//!
//! Both operations wrap one vision-model call; everything after the reply
//! is deterministic post-processing:
//!
//! 1. Strip markdown fences the model sometimes wraps around its output
//!    despite the prompt saying not to.
//! 2. Substitute each `<img data-figure-index="N">` placeholder's `src`
//!    with the corresponding figure's data URI, keeping the document
//!    self-contained. Placeholders with no matching figure keep a visible
//!    alt text instead of a broken image.
//!
//! A reply with no `<` at all is a failed iteration
//! ([`IterationError::Generator`]); the loop decides whether budget
//! remains to retry.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::sync::Arc;
use tracing::debug;

use crate::config::ConversionConfig;
use crate::error::IterationError;
use crate::pipeline::ingest::{Figure, PageAssets};
use crate::pipeline::judge::JudgeFeedback;
use crate::prompts::{figure_manifest, refinement_prompt, INITIAL_GENERATION_PROMPT, MATHJAX_SNIPPET};
use crate::provider::{call_with_retry, ImagePart, Part, VisionModel, VisionRequest};

/// Synthesise HTML for a page image from scratch.
///
/// `iteration` is normally 1; it is higher when earlier iterations failed
/// before producing a judge verdict to refine against.
pub async fn generate_initial(
    model: &Arc<dyn VisionModel>,
    assets: &PageAssets,
    addendum: &str,
    config: &ConversionConfig,
    iteration: u32,
) -> Result<String, IterationError> {
    let mut prompt = format!("{INITIAL_GENERATION_PROMPT}{MATHJAX_SNIPPET}\n");
    if !addendum.is_empty() {
        prompt.push_str("\n\n## Document-specific instructions (from pre-analysis)\n\n");
        prompt.push_str(addendum);
    }
    prompt.push_str(&figure_manifest(&assets.figures));

    call_generator(model, prompt, assets, config, iteration).await
}

/// Produce a revised HTML from the prior iteration and its judge feedback.
pub async fn refine(
    model: &Arc<dyn VisionModel>,
    previous_html: &str,
    assets: &PageAssets,
    feedback: &JudgeFeedback,
    addendum: &str,
    config: &ConversionConfig,
    iteration: u32,
) -> Result<String, IterationError> {
    let mut prompt = refinement_prompt(feedback);
    if !addendum.is_empty() {
        prompt.push_str("\n\n## Document-specific instructions (from pre-analysis)\n\n");
        prompt.push_str(addendum);
    }
    prompt.push_str(&figure_manifest(&assets.figures));
    prompt.push_str("\n\n## Previous HTML (for reference)\n\n");
    prompt.push_str(previous_html);

    call_generator(model, prompt, assets, config, iteration).await
}

async fn call_generator(
    model: &Arc<dyn VisionModel>,
    prompt: String,
    assets: &PageAssets,
    config: &ConversionConfig,
    iteration: u32,
) -> Result<String, IterationError> {
    let request = VisionRequest::new(
        vec![
            Part::Text(prompt),
            Part::Image(ImagePart::png(assets.page_image_b64.clone())),
        ],
        config.temperature,
        config.max_tokens,
    );

    let reply = call_with_retry(model, &request, config.call_retries, config.retry_backoff_ms)
        .await
        .map_err(|e| IterationError::Generator {
            iteration,
            detail: e.to_string(),
        })?;

    let html = strip_code_fences(&reply);
    if !html.contains('<') {
        return Err(IterationError::Generator {
            iteration,
            detail: format!("reply contains no markup: {:.80}", html),
        });
    }

    let html = inject_figures(&html, &assets.figures);
    debug!(
        "page {} iteration {}: {} bytes of HTML",
        assets.page_index + 1,
        iteration,
        html.len()
    );
    Ok(html)
}

// ── Deterministic post-processing ────────────────────────────────────────

/// Strip a leading ```` ```html ````/```` ``` ```` fence and a trailing
/// ```` ``` ```` fence, if present.
pub fn strip_code_fences(reply: &str) -> String {
    let mut s = reply.trim();
    for prefix in ["```html", "```"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

static RE_FIGURE_IMG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img\b[^>]*?data-figure-index="(\d+)"[^>]*?/?>"#).unwrap());

static RE_SRC_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bsrc="[^"]*""#).unwrap());

static RE_ALT_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\balt="[^"]*""#).unwrap());

/// Substitute every figure placeholder's `src` with its data URI.
///
/// Idempotent: re-running over already-injected HTML replaces the `src`
/// with the same value. Placeholder indices the ingestor never exposed
/// get a visible "unavailable" alt text and no `src`.
pub fn inject_figures(html: &str, figures: &[Figure]) -> String {
    if !html.contains("data-figure-index") {
        return html.to_string();
    }
    RE_FIGURE_IMG
        .replace_all(html, |caps: &Captures<'_>| {
            let tag = &caps[0];
            let index: usize = match caps[1].parse() {
                Ok(i) => i,
                Err(_) => return tag.to_string(),
            };
            match figures.iter().find(|f| f.index == index) {
                Some(figure) => set_attr(tag, &RE_SRC_ATTR, "src", &figure.data_uri),
                None => {
                    let without_src = RE_SRC_ATTR.replace(tag, "").to_string();
                    set_attr(
                        &without_src,
                        &RE_ALT_ATTR,
                        "alt",
                        &format!("Figure {index} unavailable"),
                    )
                }
            }
        })
        .to_string()
}

/// Replace `name="…"` inside an `<img …>` tag, inserting the attribute
/// after `<img` when it is absent.
fn set_attr(tag: &str, matcher: &Regex, name: &str, value: &str) -> String {
    let replacement = format!("{name}=\"{value}\"");
    if matcher.is_match(tag) {
        matcher.replace(tag, replacement.as_str()).to_string()
    } else {
        tag.replacen("<img", &format!("<img {replacement}"), 1)
    }
}
