//! Document pre-analysis: one model call that shapes every generator prompt.
//!
//! Before any page is converted, a small sample of page images goes to a
//! vision model with a strict-JSON instruction. The parsed
//! [`DocumentAnalysis`] drives a deterministic, table-driven
//! [`build_prompt_addendum`] — the addendum is data appended to the
//! generator prompt, never code branching inside the generator.
//!
//! Analysis is best-effort by design: a parse failure degrades to
//! conservative defaults (`ltr`, single column, no equations) with
//! `confidence_degraded = true` rather than aborting the conversion.
//! Explicit user overrides for language and direction always win.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ConversionConfig;
use crate::pipeline::extract_json_object;
use crate::pipeline::ingest::PageAssets;
use crate::prompts::{ANALYSIS_PROMPT, MATHJAX_SNIPPET};
use crate::provider::{call_with_retry, ImagePart, Part, VisionModel, VisionRequest};

/// Maximum number of sample pages sent to the analysis call.
pub const ANALYSIS_SAMPLE_PAGES: usize = 3;

/// Reading direction of the document's prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextDirection {
    #[default]
    Ltr,
    Rtl,
    Auto,
}

impl TextDirection {
    /// Value for the HTML `dir` attribute.
    pub fn as_attr(&self) -> &'static str {
        match self {
            TextDirection::Ltr => "ltr",
            TextDirection::Rtl => "rtl",
            TextDirection::Auto => "auto",
        }
    }

    /// Lenient parse accepting the strings models actually produce.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ltr" | "left-to-right" => Some(TextDirection::Ltr),
            "rtl" | "right-to-left" => Some(TextDirection::Rtl),
            "auto" => Some(TextDirection::Auto),
            _ => None,
        }
    }
}

/// How demanding the document's math typesetting is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquationComplexity {
    #[default]
    None,
    Simple,
    Complex,
}

impl EquationComplexity {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(EquationComplexity::None),
            "simple" | "basic" => Some(EquationComplexity::Simple),
            "complex" | "advanced" => Some(EquationComplexity::Complex),
            _ => None,
        }
    }
}

/// Column structure of the page body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutType {
    #[default]
    SingleColumn,
    TwoColumn,
    MultiColumn,
    Mixed,
}

impl LayoutType {
    /// Lenient parse: models say "two-column", "2-column", "double", etc.
    fn parse(s: &str, column_count: u32) -> Self {
        let s = s.trim().to_ascii_lowercase();
        if s.contains("mixed") {
            LayoutType::Mixed
        } else if s.contains("two") || s.contains('2') || s.contains("double") {
            LayoutType::TwoColumn
        } else if s.contains("multi") || column_count > 2 {
            LayoutType::MultiColumn
        } else {
            LayoutType::SingleColumn
        }
    }
}

/// Structured profile of a document, produced once per conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentAnalysis {
    // Language & direction
    pub primary_language: String,
    pub text_direction: TextDirection,
    pub mixed_directions: bool,

    // Content flags
    pub has_equations: bool,
    pub equation_complexity: EquationComplexity,
    pub has_tables: bool,
    pub has_figures: bool,
    pub has_code_blocks: bool,

    // Layout
    pub layout_type: LayoutType,
    pub column_count: u32,
    pub has_headers: bool,
    pub has_footers: bool,
    pub has_footnotes: bool,

    // Typography
    pub font_styles: Vec<String>,
    pub has_bold: bool,
    pub has_italic: bool,
    pub has_underline: bool,

    // Colors
    pub background_color: String,
    pub text_colors: Vec<String>,
    pub has_colored_elements: bool,
    pub header_color: String,

    // Special elements
    pub has_lists: bool,
    pub list_types: Vec<String>,
    pub has_blockquotes: bool,
    pub has_borders: bool,
    pub has_boxes: bool,

    /// Free-form tag: academic, legal, technical, letter, form, …
    pub document_type: String,

    /// Analyzer's free-form notes, fed verbatim into the addendum.
    pub observations: String,
    pub css_recommendations: Vec<String>,

    /// Set when the model reply could not be parsed and conservative
    /// defaults were substituted.
    pub confidence_degraded: bool,
}

impl Default for DocumentAnalysis {
    fn default() -> Self {
        Self {
            primary_language: "English".into(),
            text_direction: TextDirection::Ltr,
            mixed_directions: false,
            has_equations: false,
            equation_complexity: EquationComplexity::None,
            has_tables: false,
            has_figures: false,
            has_code_blocks: false,
            layout_type: LayoutType::SingleColumn,
            column_count: 1,
            has_headers: false,
            has_footers: false,
            has_footnotes: false,
            font_styles: vec!["serif".into()],
            has_bold: false,
            has_italic: false,
            has_underline: false,
            background_color: "white".into(),
            text_colors: vec!["black".into()],
            has_colored_elements: false,
            header_color: String::new(),
            has_lists: false,
            list_types: Vec::new(),
            has_blockquotes: false,
            has_borders: false,
            has_boxes: false,
            document_type: "general".into(),
            observations: String::new(),
            css_recommendations: Vec::new(),
            confidence_degraded: false,
        }
    }
}

impl DocumentAnalysis {
    /// Restore internal consistency after parsing or overrides.
    ///
    /// Invariant: `equation_complexity != None ⇒ has_equations`, and the
    /// layout/column pair never contradict each other.
    pub fn normalize(&mut self) {
        if self.equation_complexity != EquationComplexity::None {
            self.has_equations = true;
        }
        if self.has_equations && self.equation_complexity == EquationComplexity::None {
            self.equation_complexity = EquationComplexity::Simple;
        }
        self.column_count = self.column_count.max(1);
        match self.layout_type {
            LayoutType::SingleColumn if self.column_count == 2 => {
                self.layout_type = LayoutType::TwoColumn;
            }
            LayoutType::SingleColumn if self.column_count > 2 => {
                self.layout_type = LayoutType::MultiColumn;
            }
            LayoutType::TwoColumn => self.column_count = self.column_count.max(2),
            LayoutType::MultiColumn => self.column_count = self.column_count.max(2),
            _ => {}
        }
    }

    /// Apply explicit user overrides; these always win over detection.
    pub fn apply_overrides(&mut self, config: &ConversionConfig) {
        if let Some(ref lang) = config.language_override {
            self.primary_language = lang.clone();
        }
        if let Some(dir) = config.direction_override {
            self.text_direction = dir;
        }
        self.normalize();
    }
}

/// Parse the analyzer's reply into a [`DocumentAnalysis`].
///
/// Tolerates markdown fences and prose around the JSON object. On failure
/// returns the conservative default with `confidence_degraded = true`.
pub fn parse_analysis_reply(text: &str) -> DocumentAnalysis {
    let Some(json) = extract_json_object(text) else {
        warn!("analysis reply contained no JSON object");
        return degraded_default();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) else {
        warn!("analysis reply JSON failed to parse");
        return degraded_default();
    };

    let mut a = DocumentAnalysis::default();
    let s = |key: &str| value[key].as_str().map(str::to_string);
    let b = |key: &str| value[key].as_bool().unwrap_or(false);
    let list = |key: &str| -> Vec<String> {
        value[key]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    if let Some(lang) = s("primary_language") {
        a.primary_language = lang;
    }
    if let Some(dir) = s("text_direction").as_deref().and_then(TextDirection::parse) {
        a.text_direction = dir;
    }
    a.mixed_directions = b("mixed_directions") || b("has_mixed_directions");
    a.has_equations = b("has_equations");
    if let Some(c) = s("equation_complexity")
        .as_deref()
        .and_then(EquationComplexity::parse)
    {
        a.equation_complexity = c;
    }
    a.has_tables = b("has_tables");
    a.has_figures = b("has_figures");
    a.has_code_blocks = b("has_code_blocks");
    a.column_count = value["column_count"].as_u64().unwrap_or(1) as u32;
    a.layout_type = LayoutType::parse(
        s("layout_type").as_deref().unwrap_or("single-column"),
        a.column_count,
    );
    a.has_headers = b("has_headers");
    a.has_footers = b("has_footers");
    a.has_footnotes = b("has_footnotes");
    let fonts: Vec<String> = list("font_styles");
    if !fonts.is_empty() {
        a.font_styles = fonts;
    }
    a.has_bold = b("has_bold");
    a.has_italic = b("has_italic");
    a.has_underline = b("has_underline");
    if let Some(bg) = s("background_color") {
        a.background_color = bg;
    }
    let colors: Vec<String> = list("text_colors");
    if !colors.is_empty() {
        a.text_colors = colors;
    }
    a.has_colored_elements = b("has_colored_elements");
    a.header_color = s("header_color").unwrap_or_default();
    a.has_lists = b("has_lists");
    a.list_types = list("list_types");
    a.has_blockquotes = b("has_blockquotes");
    a.has_borders = b("has_borders");
    a.has_boxes = b("has_boxes");
    if let Some(t) = s("document_type") {
        a.document_type = t;
    }
    a.observations = s("observations").unwrap_or_default();
    a.css_recommendations = list("css_recommendations");

    a.normalize();
    a
}

fn degraded_default() -> DocumentAnalysis {
    DocumentAnalysis {
        confidence_degraded: true,
        ..DocumentAnalysis::default()
    }
}

/// Run the analysis model call over up to [`ANALYSIS_SAMPLE_PAGES`] pages.
///
/// Never fails: transport or parse problems degrade to the conservative
/// default, and user overrides are applied either way.
pub async fn analyze_document(
    model: &Arc<dyn VisionModel>,
    samples: &[&PageAssets],
    config: &ConversionConfig,
) -> DocumentAnalysis {
    let samples = &samples[..samples.len().min(ANALYSIS_SAMPLE_PAGES)];

    let mut parts = vec![Part::Text(ANALYSIS_PROMPT.to_string())];
    for (i, assets) in samples.iter().enumerate() {
        parts.push(Part::Text(format!(
            "\n--- PAGE {} of {} ---\n",
            i + 1,
            samples.len()
        )));
        parts.push(Part::Image(ImagePart::png(assets.page_image_b64.clone())));
    }
    let request = VisionRequest::new(parts, config.temperature, 2048);

    let mut analysis = match call_with_retry(
        model,
        &request,
        config.call_retries,
        config.retry_backoff_ms,
    )
    .await
    {
        Ok(reply) => parse_analysis_reply(&reply),
        Err(e) => {
            warn!("document analysis call failed: {e}");
            degraded_default()
        }
    };

    analysis.apply_overrides(config);
    info!(
        "document profile: {} ({}), layout {:?} ×{}, equations {:?}",
        analysis.primary_language,
        analysis.text_direction.as_attr(),
        analysis.layout_type,
        analysis.column_count,
        analysis.equation_complexity,
    );
    analysis
}

/// Render the analysis into the generator's prompt addendum.
///
/// Pure and table-driven: each section appears only when the analysis
/// calls for it, and the text depends solely on the analysis fields.
pub fn build_prompt_addendum(analysis: &DocumentAnalysis) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "## Document profile\n\n\
         Document type: **{}**\n\
         Primary language: **{}**\n\
         Text direction: **{}** — set `dir=\"{}\"` and `lang` on `<html>`.",
        analysis.document_type,
        analysis.primary_language,
        analysis.text_direction.as_attr().to_uppercase(),
        analysis.text_direction.as_attr(),
    ));

    if analysis.text_direction == TextDirection::Rtl {
        let mixed_note = if analysis.mixed_directions || analysis.has_equations {
            "\nEquations and Latin citations are embedded LTR runs: wrap them in `<span dir=\"ltr\">` \
             and keep the overall document RTL."
        } else {
            ""
        };
        sections.push(format!(
            "## Right-to-left document\n\n\
             1. Add `dir=\"rtl\"` to the `<html>` tag.\n\
             2. Use `direction: rtl;` on the body and `text-align: right;` for text blocks.\n\
             3. Use an appropriate RTL font stack (Amiri, 'Noto Naskh Arabic', 'Traditional Arabic', serif).{mixed_note}"
        ));
    }

    if analysis.has_equations {
        let guidance = match analysis.equation_complexity {
            EquationComplexity::Complex => {
                "The equations are complex (integrals, matrices, aligned systems): every formula \
                 must go through MathJax, no exceptions."
            }
            _ => "The equations are simple, but still use LaTeX delimiters so they typeset properly.",
        };
        sections.push(format!(
            "## Mathematical equations\n\n{guidance}\n\n\
             Use `\\( ... \\)` for inline and `$$ ... $$` for display math, and include:\n\n{MATHJAX_SNIPPET}"
        ));
    }

    if analysis.column_count > 1 {
        sections.push(format!(
            "## Column layout\n\n\
             The body uses **{} columns**. Use CSS grid:\n\n\
             ```css\n.columns {{\n    display: grid;\n    grid-template-columns: repeat({}, 1fr);\n    gap: 20px;\n}}\n```",
            analysis.column_count, analysis.column_count
        ));
    }

    if analysis.has_tables {
        sections.push(
            "## Tables\n\nUse `<table>` with `<thead>`/`<tbody>`, matching the original borders, \
             padding, and header styling."
                .to_string(),
        );
    }

    let mut typography = Vec::new();
    if !analysis.font_styles.is_empty() {
        typography.push(format!(
            "Font family classes in use: {}.",
            analysis.font_styles.join(", ")
        ));
    }
    if analysis.has_bold {
        typography.push("Bold text is present; reproduce the weights.".to_string());
    }
    if analysis.has_italic {
        typography.push("Italic text is present.".to_string());
    }
    if analysis.has_underline {
        typography.push("Underlined text is present.".to_string());
    }
    if !typography.is_empty() {
        sections.push(format!("## Typography\n\n- {}", typography.join("\n- ")));
    }

    if analysis.has_colored_elements {
        let header = if analysis.header_color.is_empty() {
            String::new()
        } else {
            format!("\nHeader/banner color: `{}`.", analysis.header_color)
        };
        sections.push(format!(
            "## Colors\n\nBackground: {}. Text colors: {}.{header}\nMatch these exactly.",
            analysis.background_color,
            analysis.text_colors.join(", "),
        ));
    }

    let mut special = Vec::new();
    if analysis.has_lists {
        let kinds = if analysis.list_types.is_empty() {
            "bullet and numbered".to_string()
        } else {
            analysis.list_types.join(", ")
        };
        special.push(format!("lists ({kinds})"));
    }
    if analysis.has_blockquotes {
        special.push("blockquotes".to_string());
    }
    if analysis.has_borders {
        special.push("borders around sections".to_string());
    }
    if analysis.has_boxes {
        special.push("boxed content areas".to_string());
    }
    if analysis.has_footnotes {
        special.push("footnotes".to_string());
    }
    if !special.is_empty() {
        sections.push(format!(
            "## Special elements\n\nThis document has: {}. Replicate them with matching CSS.",
            special.join(", ")
        ));
    }

    if !analysis.observations.is_empty() {
        sections.push(format!("## Key observations\n\n{}", analysis.observations));
    }

    if !analysis.css_recommendations.is_empty() {
        sections.push(format!(
            "## Recommended CSS strategies\n\n- {}",
            analysis.css_recommendations.join("\n- ")
        ));
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_with_fences() {
        let reply = r#"```json
{"primary_language": "Arabic", "text_direction": "rtl", "has_equations": true,
 "equation_complexity": "complex", "layout_type": "two-column", "column_count": 2,
 "document_type": "academic"}
```"#;
        let a = parse_analysis_reply(reply);
        assert!(!a.confidence_degraded);
        assert_eq!(a.primary_language, "Arabic");
        assert_eq!(a.text_direction, TextDirection::Rtl);
        assert_eq!(a.equation_complexity, EquationComplexity::Complex);
        assert_eq!(a.layout_type, LayoutType::TwoColumn);
        assert_eq!(a.column_count, 2);
    }

    #[test]
    fn parse_failure_degrades_conservatively() {
        let a = parse_analysis_reply("I could not analyze this document, sorry.");
        assert!(a.confidence_degraded);
        assert_eq!(a.text_direction, TextDirection::Ltr);
        assert_eq!(a.layout_type, LayoutType::SingleColumn);
        assert!(!a.has_equations);
    }

    #[test]
    fn complexity_implies_equations() {
        let reply = r#"{"equation_complexity": "simple", "has_equations": false}"#;
        let a = parse_analysis_reply(reply);
        assert!(a.has_equations, "complexity != none must imply has_equations");
    }

    #[test]
    fn column_count_fixes_layout_mismatch() {
        let reply = r#"{"layout_type": "single-column", "column_count": 2}"#;
        let a = parse_analysis_reply(reply);
        assert_eq!(a.layout_type, LayoutType::TwoColumn);
    }

    #[test]
    fn addendum_mentions_rtl_and_mathjax() {
        let mut a = DocumentAnalysis {
            text_direction: TextDirection::Rtl,
            has_equations: true,
            equation_complexity: EquationComplexity::Complex,
            column_count: 2,
            layout_type: LayoutType::TwoColumn,
            ..DocumentAnalysis::default()
        };
        a.normalize();
        let addendum = build_prompt_addendum(&a);
        assert!(addendum.contains("dir=\"rtl\""));
        assert!(addendum.contains("MathJax"));
        assert!(addendum.contains("grid-template-columns: repeat(2, 1fr)"));
        assert!(addendum.contains("<span dir=\"ltr\">"));
    }

    #[test]
    fn addendum_for_plain_document_is_minimal() {
        let addendum = build_prompt_addendum(&DocumentAnalysis::default());
        assert!(addendum.contains("Document profile"));
        assert!(!addendum.contains("Right-to-left"));
        assert!(!addendum.contains("MathJax"));
        assert!(!addendum.contains("Column layout"));
    }

    #[test]
    fn overrides_win_over_detection() {
        let mut a = parse_analysis_reply(r#"{"text_direction": "ltr", "primary_language": "English"}"#);
        let config = crate::ConversionConfig::builder()
            .language_override("Arabic")
            .direction_override(TextDirection::Rtl)
            .build()
            .unwrap();
        a.apply_overrides(&config);
        assert_eq!(a.primary_language, "Arabic");
        assert_eq!(a.text_direction, TextDirection::Rtl);
    }
}
