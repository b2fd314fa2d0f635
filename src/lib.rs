//! # pdf2html
//!
//! Convert PDF documents to faithful, self-contained HTML using a
//! vision-model refinement loop.
//!
//! ## Why this crate?
//!
//! One-shot PDF-to-HTML conversion fails quietly: the model drops a
//! column, typesets an equation as `x^2`, or shifts a header, and nobody
//! notices until a human reads the output. This crate closes the loop —
//! every generated page is rendered in a headless browser and visually
//! compared against the original raster by judge models, and the
//! structured feedback drives another generation pass until the page
//! clears a fidelity target or the retry budget runs out.
//!
//! ## Pipeline overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Ingest    rasterise pages + crop figures via pdfium (spawn_blocking)
//!  ├─ 2. Analyze   one vision call → document profile → prompt addendum
//!  ├─ 3. Generate  vision model emits self-contained HTML (figures injected)
//!  ├─ 4. Render    headless Chromium, MathJax-aware full-page capture
//!  ├─ 5. Judge     cross-model scoring + equation specialist + verify gate
//!  └─ 6. Decide    accept → final.html, else refine with feedback
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pdf2html::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Credentials from GEMINI_API_KEY / GOOGLE_API_KEY / OPENAI_API_KEY
//!     let config = ConversionConfig::from_env();
//!     let outcome = convert("paper.pdf", &config).await?;
//!     for page in &outcome.pages {
//!         println!(
//!             "page {}: {} ({}/100 in {} iterations)",
//!             page.page_index + 1,
//!             if page.success { "passed" } else { "best-effort" },
//!             page.final_score,
//!             page.iterations_run,
//!         );
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2html` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analysis;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod provider;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analysis::{build_prompt_addendum, DocumentAnalysis, EquationComplexity, LayoutType, TextDirection};
pub use config::{ConversionConfig, ConversionConfigBuilder, JudgeWeights, PageSelection};
pub use convert::{convert, process_page};
pub use error::{IterationError, Pdf2HtmlError};
pub use output::{ConversionOutcome, ConversionSummary, IterationRecord, PageResult};
pub use pipeline::judge::JudgeFeedback;
pub use progress::{NoopProgressHook, ProgressHook};
pub use provider::{VisionModel, VisionRequest};
