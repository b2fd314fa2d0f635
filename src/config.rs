//! Configuration types for PDF-to-HTML conversion.
//!
//! All behaviour is controlled through [`ConversionConfig`], built via its
//! [`ConversionConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks and to diff two runs when their
//! outputs differ.
//!
//! Defaults come from [`ConversionConfig::default`] and can be overridden
//! from the environment with [`ConversionConfig::from_env`] (`PDF2HTML_*`
//! variables) before CLI flags are applied on top.

use crate::analysis::TextDirection;
use crate::error::Pdf2HtmlError;
use crate::progress::ProgressHook;
use crate::provider::VisionModel;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Configuration for a PDF-to-HTML conversion.
///
/// # Example
/// ```rust
/// use pdf2html::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .dpi(300)
///     .target_score(85)
///     .max_retries(5)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Rasterisation DPI for source pages. Range: 72–600. Default: 300.
    ///
    /// 300 DPI keeps small fonts and equation glyphs legible to the vision
    /// models; the judge compares against this raster, so it is also the
    /// ground truth for fidelity scoring.
    pub dpi: u32,

    /// Composite fidelity score a page must reach to be accepted. Default: 85.
    ///
    /// `0` accepts the first iteration unconditionally; `100` always runs
    /// the full retry budget and promotes the best iteration.
    pub target_score: u8,

    /// Maximum generate→render→judge iterations per page. Default: 5.
    pub max_retries: u32,

    /// Root output directory. Artifacts land under `<output>/<pdf-stem>/`.
    pub output_dir: PathBuf,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Force the analysis language instead of trusting detection.
    pub language_override: Option<String>,

    /// Force the text direction instead of trusting detection.
    pub direction_override: Option<TextDirection>,

    /// Re-process pages whose directory already contains a `final.html`.
    /// Default: false (existing pages are skipped).
    pub force: bool,

    /// Weights for combining the two cross-model judges. Must sum to 1.
    pub weights: JudgeWeights,

    /// Run judge B alongside judge A when a second credential exists.
    /// Default: true.
    pub use_cross_model: bool,

    /// Run the equation specialist when the analyzer flagged equations.
    /// Default: true.
    pub use_equation_specialist: bool,

    /// Run the lenient verification gate on iterations that meet the
    /// target. Default: true.
    pub use_verification: bool,

    /// Browser viewport in CSS pixels. Default: 1200×1600.
    pub viewport: (u32, u32),

    /// Sampling temperature for every model call. Default: 0.1.
    ///
    /// Low temperature keeps the generator faithful to what it sees and the
    /// judges' JSON stable.
    pub temperature: f32,

    /// Maximum tokens a model may generate per call. Default: 8192.
    ///
    /// A dense page of HTML with inline CSS easily exceeds 4k output
    /// tokens; truncation here silently drops the tail of the document.
    pub max_tokens: u32,

    /// Transient-failure retries per model call. Default: 3.
    pub call_retries: u32,

    /// Initial backoff in milliseconds, doubling per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-model-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Upper bound for each browser navigation/wait step in seconds.
    /// Default: 30.
    pub render_timeout_secs: u64,

    /// Generator model id. If None, the provider default is used.
    pub generator_model: Option<String>,

    /// Judge model id. If None, the provider default is used.
    pub judge_model: Option<String>,

    /// Pre-built generator model. Takes precedence over env resolution.
    pub generator: Option<Arc<dyn VisionModel>>,

    /// Pre-built judge A. Takes precedence over env resolution.
    pub judge_a: Option<Arc<dyn VisionModel>>,

    /// Pre-built judge B. Takes precedence over env resolution; `None`
    /// with `use_cross_model` falls back to the OpenAI credential.
    pub judge_b: Option<Arc<dyn VisionModel>>,

    /// Progress hook for per-page and per-iteration events.
    pub progress: Option<Arc<dyn ProgressHook>>,

    /// Cooperative cancellation flag, checked at iteration and page
    /// boundaries. The current render/judge cycle completes and partial
    /// state is persisted before the loop stops.
    pub cancel: Arc<AtomicBool>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            target_score: 85,
            max_retries: 5,
            output_dir: PathBuf::from("output"),
            pages: PageSelection::default(),
            language_override: None,
            direction_override: None,
            force: false,
            weights: JudgeWeights::default(),
            use_cross_model: true,
            use_equation_specialist: true,
            use_verification: true,
            viewport: (1200, 1600),
            temperature: 0.1,
            max_tokens: 8192,
            call_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            render_timeout_secs: 30,
            generator_model: None,
            judge_model: None,
            generator: None,
            judge_a: None,
            judge_b: None,
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("dpi", &self.dpi)
            .field("target_score", &self.target_score)
            .field("max_retries", &self.max_retries)
            .field("output_dir", &self.output_dir)
            .field("pages", &self.pages)
            .field("force", &self.force)
            .field("weights", &self.weights)
            .field("use_cross_model", &self.use_cross_model)
            .field("use_equation_specialist", &self.use_equation_specialist)
            .field("use_verification", &self.use_verification)
            .field("viewport", &self.viewport)
            .field("generator_model", &self.generator_model)
            .field("judge_model", &self.judge_model)
            .field("generator", &self.generator.as_ref().map(|_| "<dyn VisionModel>"))
            .field("judge_a", &self.judge_a.as_ref().map(|_| "<dyn VisionModel>"))
            .field("judge_b", &self.judge_b.as_ref().map(|_| "<dyn VisionModel>"))
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overridden by `PDF2HTML_*` environment variables.
    ///
    /// Unparseable values are ignored rather than fatal; the CLI applies
    /// its own flags on top of whatever this returns.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Some(v) = env_parse::<u32>("PDF2HTML_DPI") {
            c.dpi = v.clamp(72, 600);
        }
        if let Some(v) = env_parse::<u8>("PDF2HTML_TARGET") {
            c.target_score = v.min(100);
        }
        if let Some(v) = env_parse::<u32>("PDF2HTML_MAX_RETRIES") {
            c.max_retries = v.max(1);
        }
        if let Some(v) = env_parse::<f32>("PDF2HTML_JUDGE_A_WEIGHT") {
            c.weights.a = v;
        }
        if let Some(v) = env_parse::<f32>("PDF2HTML_JUDGE_B_WEIGHT") {
            c.weights.b = v;
        }
        if let Some(v) = env_flag("PDF2HTML_CROSS_MODEL") {
            c.use_cross_model = v;
        }
        if let Some(v) = env_flag("PDF2HTML_EQUATION_SPECIALIST") {
            c.use_equation_specialist = v;
        }
        if let Some(v) = env_flag("PDF2HTML_VERIFICATION") {
            c.use_verification = v;
        }
        if let Ok(v) = std::env::var("PDF2HTML_GENERATOR_MODEL") {
            if !v.is_empty() {
                c.generator_model = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PDF2HTML_JUDGE_MODEL") {
            if !v.is_empty() {
                c.judge_model = Some(v);
            }
        }
        c
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn target_score(mut self, score: u8) -> Self {
        self.config.target_score = score.min(100);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.max(1);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn language_override(mut self, lang: impl Into<String>) -> Self {
        self.config.language_override = Some(lang.into());
        self
    }

    pub fn direction_override(mut self, dir: TextDirection) -> Self {
        self.config.direction_override = Some(dir);
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn weights(mut self, a: f32, b: f32) -> Self {
        self.config.weights = JudgeWeights { a, b };
        self
    }

    pub fn use_cross_model(mut self, v: bool) -> Self {
        self.config.use_cross_model = v;
        self
    }

    pub fn use_equation_specialist(mut self, v: bool) -> Self {
        self.config.use_equation_specialist = v;
        self
    }

    pub fn use_verification(mut self, v: bool) -> Self {
        self.config.use_verification = v;
        self
    }

    pub fn viewport(mut self, width: u32, height: u32) -> Self {
        self.config.viewport = (width.max(320), height.max(320));
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn call_retries(mut self, n: u32) -> Self {
        self.config.call_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn generator_model(mut self, model: impl Into<String>) -> Self {
        self.config.generator_model = Some(model.into());
        self
    }

    pub fn judge_model(mut self, model: impl Into<String>) -> Self {
        self.config.judge_model = Some(model.into());
        self
    }

    pub fn generator(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.generator = Some(model);
        self
    }

    pub fn judge_a(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.judge_a = Some(model);
        self
    }

    pub fn judge_b(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.judge_b = Some(model);
        self
    }

    pub fn progress(mut self, hook: Arc<dyn ProgressHook>) -> Self {
        self.config.progress = Some(hook);
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.config.cancel = flag;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2HtmlError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Pdf2HtmlError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.max_retries == 0 {
            return Err(Pdf2HtmlError::InvalidConfig("max_retries must be ≥ 1".into()));
        }
        if !c.weights.is_valid() {
            return Err(Pdf2HtmlError::InvalidConfig(format!(
                "judge weights must be positive and sum to 1.0, got {} + {}",
                c.weights.a, c.weights.b
            )));
        }
        Ok(self.config)
    }
}

/// Weights for combining the two cross-model judges.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JudgeWeights {
    pub a: f32,
    pub b: f32,
}

impl Default for JudgeWeights {
    fn default() -> Self {
        Self { a: 0.5, b: 0.5 }
    }
}

impl JudgeWeights {
    /// Both weights positive and summing to 1 within rounding slack.
    pub fn is_valid(&self) -> bool {
        self.a > 0.0 && self.b > 0.0 && (self.a + self.b - 1.0).abs() < 1e-3
    }

    /// Weighted combination of two subscores, rounded to the nearest point.
    pub fn combine(&self, a: u8, b: u8) -> u8 {
        let total = self.a + self.b;
        let v = (f32::from(a) * self.a + f32::from(b) * self.b) / total;
        v.round().clamp(0.0, 100.0) as u8
    }
}

/// Specifies which pages of the PDF to convert (1-indexed in all public
/// forms, expanded to 0-indexed internally).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page.
    Single(usize),
    /// Convert a contiguous inclusive range.
    Range(usize, usize),
    /// Convert specific pages (deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Parse a CLI range spec: `"all"`, `"5"`, `"1-3"`, or `"1,3,5"`.
    pub fn parse(s: &str) -> Result<Self, Pdf2HtmlError> {
        let s = s.trim().to_ascii_lowercase();
        if s.is_empty() || s == "all" {
            return Ok(PageSelection::All);
        }

        let bad = |what: &str| Pdf2HtmlError::InvalidConfig(format!("invalid page spec '{s}': {what}"));

        if let Some((start, end)) = s.split_once('-') {
            let start: usize = start.trim().parse().map_err(|_| bad("bad range start"))?;
            let end: usize = end.trim().parse().map_err(|_| bad("bad range end"))?;
            if start < 1 {
                return Err(bad("pages are 1-indexed"));
            }
            if start > end {
                return Err(bad("start must be <= end"));
            }
            return Ok(PageSelection::Range(start, end));
        }

        if s.contains(',') {
            let mut pages = Vec::new();
            for part in s.split(',') {
                let p: usize = part.trim().parse().map_err(|_| bad("bad page number"))?;
                if p < 1 {
                    return Err(bad("pages are 1-indexed"));
                }
                pages.push(p);
            }
            return Ok(PageSelection::Set(pages));
        }

        let page: usize = s.parse().map_err(|_| bad("bad page number"))?;
        if page < 1 {
            return Err(bad("pages are 1-indexed"));
        }
        Ok(PageSelection::Single(page))
    }

    /// Expand the selection into ascending, deduplicated 0-indexed page
    /// numbers, dropping anything outside the document.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let in_bounds = |page: usize| (1..=total_pages).contains(&page);
        match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(page) => {
                in_bounds(*page).then(|| page - 1).into_iter().collect()
            }
            PageSelection::Range(first, last) => {
                ((*first).max(1)..=(*last).min(total_pages))
                    .map(|page| page - 1)
                    .collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .copied()
                .filter(|&page| in_bounds(page))
                .map(|page| page - 1)
                .collect::<BTreeSet<usize>>()
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_dpi() {
        let c = ConversionConfig::builder().dpi(10_000).build().unwrap();
        assert_eq!(c.dpi, 600);
    }

    #[test]
    fn builder_rejects_bad_weights() {
        let err = ConversionConfig::builder().weights(0.9, 0.3).build();
        assert!(err.is_err());
    }

    #[test]
    fn weights_combine_rounds() {
        let w = JudgeWeights { a: 0.5, b: 0.5 };
        assert_eq!(w.combine(80, 81), 81); // 80.5 rounds up
        assert_eq!(w.combine(100, 0), 50);
        let skewed = JudgeWeights { a: 0.7, b: 0.3 };
        assert_eq!(skewed.combine(100, 0), 70);
    }

    #[test]
    fn page_selection_parse_forms() {
        assert_eq!(PageSelection::parse("all").unwrap(), PageSelection::All);
        assert_eq!(PageSelection::parse("5").unwrap(), PageSelection::Single(5));
        assert_eq!(PageSelection::parse("1-3").unwrap(), PageSelection::Range(1, 3));
        assert_eq!(
            PageSelection::parse("1,3,5").unwrap(),
            PageSelection::Set(vec![1, 3, 5])
        );
        assert!(PageSelection::parse("3-1").is_err());
        assert!(PageSelection::parse("0").is_err());
        assert!(PageSelection::parse("x").is_err());
    }

    #[test]
    fn all_pages_expand_zero_indexed() {
        assert_eq!(PageSelection::All.to_indices(4), vec![0, 1, 2, 3]);
        assert!(PageSelection::All.to_indices(0).is_empty());
    }

    #[test]
    fn single_page_outside_document_selects_nothing() {
        assert_eq!(PageSelection::Single(1).to_indices(10), vec![0]);
        assert!(PageSelection::Single(11).to_indices(10).is_empty());
    }

    #[test]
    fn range_clamps_to_document_length() {
        assert_eq!(PageSelection::Range(8, 99).to_indices(10), vec![7, 8, 9]);
        assert!(PageSelection::Range(4, 6).to_indices(3).is_empty());
    }

    #[test]
    fn set_yields_ascending_unique_indices() {
        let selection = PageSelection::Set(vec![4, 2, 4, 17]);
        assert_eq!(selection.to_indices(10), vec![1, 3]);
    }
}
