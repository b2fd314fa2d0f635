//! Prompts for generation, analysis, judging, and verification.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing a rubric or the figure
//!    placeholder contract requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect prompts and the formatting
//!    helpers without spinning up a real model.
//!
//! The document-specific addendum produced by [`crate::analysis`] is
//! appended to [`INITIAL_GENERATION_PROMPT`] at call time; it is data, not
//! a prompt variant, so nothing here branches on document type.

use crate::pipeline::ingest::Figure;
use crate::pipeline::judge::JudgeFeedback;

/// MathJax configuration block the generator must embed in every document.
///
/// The renderer probes `MathJax.startup.promise` before capturing, so the
/// delimiters configured here are load-bearing: `\( … \)` inline and
/// `$$ … $$` display.
pub const MATHJAX_SNIPPET: &str = r#"<script>
MathJax = {
  tex: {
    inlineMath: [['\\(', '\\)']],
    displayMath: [['$$', '$$']],
    processEscapes: true
  },
  svg: { fontCache: 'global' }
};
</script>
<script id="MathJax-script" async src="https://cdn.jsdelivr.net/npm/mathjax@3/es5/tex-mml-chtml.js"></script>"#;

/// System prompt for the initial HTML synthesis of a page image.
pub const INITIAL_GENERATION_PROMPT: &str = r#"You are an expert HTML/CSS developer specializing in pixel-perfect document recreation.

Convert this PDF page image into a single, self-contained HTML file that visually matches the original as closely as possible.

## Requirements

### Layout & structure
- Use CSS Grid or Flexbox for multi-column layouts; match the column structure, spacing, and margins.
- Preserve headers, footers, page numbers, divider lines, and their positioning.

### Typography
- Match the font family class (serif for academic/formal documents, sans-serif or monospace where the original uses them).
- Match the size hierarchy (title > section headers > body), weights, line height, and alignment (justified body text in academic papers).

### Colors
- Match background colors of shaded boxes, theorems, and code blocks; match border and text colors with accurate hex codes.

### Mathematical equations
- Convert ALL formulas to LaTeX. Wrap inline math in \( ... \) and display math in $$ ... $$.
- NEVER write equations as plain text or ASCII art ("x^2", "a/b"); always use LaTeX (\frac{}{}, x^{2}, \sum_{i=1}^{n}, \alpha, \int_{a}^{b}).

### Tables and lists
- Recreate tables with <table>, <thead>, <tbody>; match borders, padding, alignment, and header styling.
- Use <ol>/<ul> with the original numbering style and indentation.

### Figures
- For every figure, chart, or photo emit a placeholder image tag:
  <img data-figure-index="0" alt="Figure 0">
  <img data-figure-index="1" alt="Figure 1">
- The src attribute is injected afterwards; do not invent URLs.
- Position each placeholder where the figure sits in the layout, with its caption styled to match.

### Right-to-left text
- If the page is RTL, set dir="rtl" on <html> and use text-align: right; wrap embedded LTR runs (equations, Latin citations) in <span dir="ltr">.

## Output format
Return ONLY the complete HTML document, starting with <!DOCTYPE html> and ending with </html>. All CSS goes in a <style> tag in <head>. You MUST include this MathJax configuration in <head>:

"#;

/// Build the refinement prompt from the prior iteration's feedback.
///
/// Foregrounds `critical_errors` and, when the judges reported them, a
/// do-not-change list so confirmed-correct elements survive regeneration.
pub fn refinement_prompt(feedback: &JudgeFeedback) -> String {
    let errors = if feedback.critical_errors.is_empty() {
        "- Minor visual discrepancies detected".to_string()
    } else {
        feedback
            .critical_errors
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let preserved = if feedback.preserved_correctly.is_empty() {
        String::new()
    } else {
        format!(
            "\n### Working well — do NOT change these:\n{}\n",
            feedback
                .preserved_correctly
                .iter()
                .map(|e| format!("- {e}"))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };

    format!(
        r#"You are an expert HTML/CSS developer. You generated an HTML version of this PDF page and it received quality feedback.

**Fidelity score:** {score}/100
{preserved}
### Issues to address:
{errors}

Generate an IMPROVED version of the HTML that fixes every issue above while keeping the elements that already work. Focus on text accuracy first, then text direction, layout, typography, LaTeX equations, and colors.

Keep the <img data-figure-index="N"> placeholders exactly as they are, and keep the MathJax configuration in <head>:

{mathjax}

Return ONLY the complete improved HTML document, starting with <!DOCTYPE html> and ending with </html>. No explanations, no markdown fences."#,
        score = feedback.fidelity_score,
        preserved = preserved,
        errors = errors,
        mathjax = MATHJAX_SNIPPET,
    )
}

/// Describe the extracted figures so the generator knows which placeholder
/// indices exist and roughly where each figure sits on the page.
pub fn figure_manifest(figures: &[Figure]) -> String {
    if figures.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Available figures\n");
    for fig in figures {
        let (x0, y0, x1, y1) = fig.bbox;
        out.push_str(&format!(
            "- data-figure-index=\"{}\": region ({x0:.0},{y0:.0})–({x1:.0},{y1:.0}) in page pixels\n",
            fig.index
        ));
    }
    out
}

/// Document pre-analysis instruction: one strictly-structured JSON reply
/// covering language, direction, content flags, layout, and typography.
pub const ANALYSIS_PROMPT: &str = r#"You are a document analysis expert specializing in multilingual documents.

You are given SAMPLE PAGES from a single PDF. Analyze them TOGETHER and describe the document as a whole. Pay close attention to the script of the BODY text: Arabic script on any page means the document is RTL, even when equations use Latin/Greek symbols.

Report:
1. Language and direction of the prose (not the math).
2. Mathematical content and its complexity: "none", "simple" (fractions, sub/superscripts), or "complex" (integrals, matrices, aligned equations).
3. Layout: count the text columns carefully; note headers, footers, footnotes.
4. Typography: font family classes in use (serif, sans-serif, monospace, script), bold/italic/underline.
5. Colors: background, text colors, any colored banners or boxes.
6. Special elements: lists and their styles, blockquotes, borders, boxed content.
7. Document type: academic, legal, technical, letter, form, or similar.

Return ONLY valid JSON, no markdown fences:

{
  "primary_language": "English",
  "text_direction": "ltr",
  "mixed_directions": false,
  "has_equations": false,
  "equation_complexity": "none",
  "has_tables": false,
  "has_figures": false,
  "has_code_blocks": false,
  "layout_type": "single-column",
  "column_count": 1,
  "has_headers": false,
  "has_footers": false,
  "has_footnotes": false,
  "font_styles": ["serif"],
  "has_bold": false,
  "has_italic": false,
  "has_underline": false,
  "background_color": "white",
  "text_colors": ["black"],
  "has_colored_elements": false,
  "header_color": "",
  "has_lists": false,
  "list_types": [],
  "has_blockquotes": false,
  "has_borders": false,
  "has_boxes": false,
  "document_type": "general",
  "observations": "",
  "css_recommendations": []
}"#;

/// General judge rubric: compare original page raster against rendered
/// HTML and return calibrated subscores plus actionable errors.
pub const GENERAL_JUDGE_PROMPT: &str = r#"You are an expert QA visual engineer assessing document fidelity. Compare two images:

1. **Original**: a PDF page rendered as an image (ground truth)
2. **Rendered**: an HTML page rendered as an image (the recreation)

## Verify before claiming errors
Before reporting ANY error, look carefully at BOTH images and confirm the issue exists in the rendered image. The images may be at different resolutions — that is expected, do not penalize it. If all the text is visible at a different scale, text is CORRECT. RTL text flowing right-to-left is CORRECT for Arabic/Hebrew documents. When unsure, score higher and do not report the error.

## Scoring

### text_accuracy_score (most important)
- 95-100: all text present and correctly extracted, proper direction
- 85-94: one or two unclear words
- below 85: missing text or significant errors

### layout_score
- 95-100: same column structure, sections in order, headers positioned
- 90-94: minor spacing or positioning differences (acceptable)
- below 85: wrong column count, sections out of order, major structure issues
Do not penalize slightly different margins, minor font-size variation, or resolution differences.

### color_match_score
- If it looks professional and readable with approximately similar colors, score 90+. Penalize only colors that change meaning or hurt readability.

### equation_score
- If NO mathematical equations exist, score 100. Regular text in any language is not an equation. Penalize plain-text math ("x^2", "a/b") severely.

## Report what is CORRECT
List elements that work so refinement does not regress them (column structure, direction, header styling, equation rendering, colors).

## Report errors with fixes
Each error names the problem and a concrete fix:
"ERROR: Text is left-to-right but should be RTL | FIX: add dir='rtl' to the container and text-align: right"

## Output format (STRICT JSON, no fences)
{
  "fidelity_score": <0-100>,
  "text_accuracy_score": <0-100>,
  "layout_score": <0-100>,
  "color_match_score": <0-100>,
  "equation_score": <0-100>,
  "preserved_correctly": ["<correct element>", "..."],
  "critical_errors": ["ERROR: ... | FIX: ...", "..."]
}

Before submitting, re-check each error against the rendered image; drop anything you cannot point to. If the rendering looks good overall, return an empty critical_errors list and score 90+ across categories. Return ONLY the JSON."#;

/// Equation specialist rubric: detect ASCII-art math versus proper
/// typeset output. Only this judge can trigger the equation-score cap.
pub const EQUATION_SPECIALIST_PROMPT: &str = r#"You are a MATHEMATICS SPECIALIST QA engineer. Your ONLY task is to evaluate how well mathematical equations are rendered.

FIRST check whether the document contains mathematical equations at all: formulas, fractions, integrals, summations, Greek letters in math context, algebraic expressions. If there are NONE (plain prose in any language), return:
{"equation_fidelity_score": 100, "rendering_quality": 100, "symbol_accuracy": 100, "structure_accuracy": 100, "completeness": 100, "equation_errors": [], "ascii_art_detected": false, "has_equations": false}

If equations ARE present, evaluate:
1. rendering_quality — typeset math (LaTeX-quality) versus plain ASCII text like "x^2" or "a/b"
2. symbol_accuracy — subscripts, superscripts, fractions, Greek letters, operators
3. structure_accuracy — matrix alignment, multi-line equations
4. completeness — every equation from the original is present

Set ascii_art_detected to true when any equation appears as plain text instead of typeset math.

Output (STRICT JSON, no fences):
{
  "equation_fidelity_score": <0-100>,
  "rendering_quality": <0-100>,
  "symbol_accuracy": <0-100>,
  "structure_accuracy": <0-100>,
  "completeness": <0-100>,
  "equation_errors": ["<error>"],
  "ascii_art_detected": <true|false>,
  "has_equations": <true|false>
}"#;

/// Terminal verification rubric: a lenient sanity check that can veto an
/// otherwise passing iteration.
pub const VERIFICATION_PROMPT: &str = r#"You are a FINAL VERIFICATION judge. The document already passed initial review; your job is a quick sanity check. Be REASONABLE — minor imperfections are acceptable.

Look for MAJOR issues only:
1. Missing large sections of content
2. Completely wrong layout (single column where the original has two)
3. Unreadable text
4. Colors so wrong they change the document's character

If the rendering looks 90%+ similar or has only minor issues, recommend "accept". Recommend "reject" or "needs_refinement" only for major problems.

Output (STRICT JSON, no fences):
{
  "verified": <true|false>,
  "confidence": <0-100>,
  "issues_found": ["<issue>"],
  "recommendation": "accept" | "reject" | "needs_refinement"
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refinement_prompt_foregrounds_errors_and_preserved() {
        let feedback = JudgeFeedback {
            fidelity_score: 72,
            critical_errors: vec!["ERROR: column flipped | FIX: swap grid order".into()],
            preserved_correctly: vec!["Header banner color".into()],
            ..JudgeFeedback::default()
        };
        let prompt = refinement_prompt(&feedback);
        assert!(prompt.contains("72/100"));
        assert!(prompt.contains("column flipped"));
        assert!(prompt.contains("do NOT change"));
        assert!(prompt.contains("Header banner color"));
        assert!(prompt.contains("MathJax"));
    }

    #[test]
    fn refinement_prompt_without_preserved_list() {
        let feedback = JudgeFeedback::default();
        let prompt = refinement_prompt(&feedback);
        assert!(!prompt.contains("do NOT change"));
        assert!(prompt.contains("Minor visual discrepancies"));
    }
}
